//! Backpressured sample scheduling.
//!
//! The [`Scheduler`] decides when the next sample may be fetched and
//! submitted to the decoder. It owns the sample backlog, the count of units
//! awaiting decoder output and the FIFO of decoded frames, and admits a new
//! submission only while
//!
//! - `in_flight + buffered + 1 < max_buffer_count`, and
//! - `buffered < max_video_frame_count`.
//!
//! The scheduler performs no I/O. Its caller runs the loop as an explicit
//! state machine: [`begin`](Scheduler::begin) moves it from
//! [`LoopState::Idle`] to [`LoopState::Scheduling`] (a second `begin` while
//! scheduling is a no-op), [`next_step`](Scheduler::next_step) is called
//! until it returns [`Step::Idle`], then [`finish`](Scheduler::finish).

use std::collections::VecDeque;
use std::sync::Arc;

use rp_core::config::PipelineLimits;
use rp_core::{DecodedFrame, SeekKind, SeekParam, Sample};

/// Whether a schedule loop is currently active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Scheduling,
}

/// Why the loop stopped submitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleReason {
    /// Units in flight plus buffered frames reached the buffer limit.
    BufferFull,
    /// The decoded frame buffer reached its limit.
    FramesFull,
    /// Every sample has been submitted.
    Exhausted,
    /// Scheduling stopped after an error.
    Halted,
}

/// Outcome of one loop iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Step {
    /// Fetch this sample's payload and submit it. One in-flight credit has
    /// already been reserved for it.
    Submit(Sample),
    Idle(IdleReason),
}

/// Lazy, batched view over the sample index.
#[derive(Debug)]
struct SampleCursor {
    samples: Arc<[Sample]>,
    next: usize,
    batch: usize,
}

impl SampleCursor {
    fn next_batch(&mut self) -> &[Sample] {
        let start = self.next.min(self.samples.len());
        let end = (start + self.batch).min(self.samples.len());
        self.next = end;
        &self.samples[start..end]
    }

    fn is_exhausted(&self) -> bool {
        self.next >= self.samples.len()
    }
}

/// Sample scheduler for one playback session.
#[derive(Debug)]
pub struct Scheduler {
    limits: PipelineLimits,
    cursor: SampleCursor,
    backlog: VecDeque<Sample>,
    in_flight: usize,
    frames: VecDeque<DecodedFrame>,
    state: LoopState,
    halted: bool,
    submitted: u64,
}

impl Scheduler {
    pub fn new(limits: PipelineLimits, samples: Arc<[Sample]>) -> Self {
        let batch = limits.sample_batch_size().max(1);
        Self {
            limits,
            cursor: SampleCursor {
                samples,
                next: 0,
                batch,
            },
            backlog: VecDeque::new(),
            in_flight: 0,
            frames: VecDeque::new(),
            state: LoopState::Idle,
            halted: false,
            submitted: 0,
        }
    }

    // -- Loop state machine ---------------------------------------------------

    /// Enter [`LoopState::Scheduling`]. Returns `false` when a loop is
    /// already active.
    pub fn begin(&mut self) -> bool {
        match self.state {
            LoopState::Scheduling => false,
            LoopState::Idle => {
                self.state = LoopState::Scheduling;
                true
            }
        }
    }

    /// Return to [`LoopState::Idle`].
    pub fn finish(&mut self) {
        self.state = LoopState::Idle;
    }

    pub fn loop_state(&self) -> LoopState {
        self.state
    }

    /// Decide the next action of the active loop.
    pub fn next_step(&mut self) -> Step {
        if self.halted {
            return Step::Idle(IdleReason::Halted);
        }
        if self.in_flight + self.frames.len() + 1 >= self.limits.max_buffer_count() {
            return Step::Idle(IdleReason::BufferFull);
        }
        if self.frames.len() >= self.limits.max_video_frame_count() {
            return Step::Idle(IdleReason::FramesFull);
        }
        if self.backlog.is_empty() {
            let batch = self.cursor.next_batch();
            self.backlog.extend(batch.iter().copied());
        }
        let Some(sample) = self.backlog.pop_front() else {
            return Step::Idle(IdleReason::Exhausted);
        };

        self.in_flight += 1;
        self.submitted += 1;
        Step::Submit(sample)
    }

    // -- Events -------------------------------------------------------------

    /// Give back the credit of a submission whose fetch failed or was
    /// aborted. The sample is not retried.
    pub fn release(&mut self, sample: &Sample) {
        if self.in_flight == 0 {
            tracing::warn!(index = sample.index, "Released a credit with nothing in flight");
            return;
        }
        self.in_flight -= 1;
    }

    /// A decoded frame arrived.
    pub fn on_frame(&mut self, frame: DecodedFrame) {
        self.in_flight = self.in_flight.saturating_sub(1);
        if self.halted {
            return;
        }
        self.frames.push_back(frame);
    }

    /// The decoder reported a failure for one unit. Scheduling halts.
    pub fn on_decode_error(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.halt();
    }

    /// Oldest decoded frame, for presentation.
    pub fn pop_frame(&mut self) -> Option<DecodedFrame> {
        self.frames.pop_front()
    }

    /// Stop all further submissions. Buffered frames are released.
    pub fn halt(&mut self) {
        self.halted = true;
        self.frames.clear();
        self.backlog.clear();
    }

    /// Restart scheduling at sample `index`.
    ///
    /// The backlog is dropped, buffered frames are released and the in-flight
    /// count is cleared; the caller must make sure outputs of units submitted
    /// before the seek never reach [`on_frame`](Self::on_frame).
    pub fn seek_to(&mut self, index: u32) {
        self.backlog.clear();
        self.frames.clear();
        self.in_flight = 0;
        self.cursor.next = (index as usize).min(self.cursor.samples.len());
    }

    // -- Observation --------------------------------------------------------

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Decoded frames waiting for presentation.
    pub fn buffered(&self) -> usize {
        self.frames.len()
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Submissions made since the scheduler was created.
    pub fn submitted_count(&self) -> u64 {
        self.submitted
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// No sample is left to submit.
    pub fn is_exhausted(&self) -> bool {
        self.backlog.is_empty() && self.cursor.is_exhausted()
    }

    /// Every sample has been submitted, decoded and presented.
    pub fn is_ended(&self) -> bool {
        self.is_exhausted() && self.in_flight == 0 && self.frames.is_empty()
    }

    pub fn limits(&self) -> &PipelineLimits {
        &self.limits
    }

    pub fn samples(&self) -> &[Sample] {
        &self.cursor.samples
    }
}

/// Resolve a seek request to the keyframe decoding must restart from.
///
/// A time is matched against presentation timestamps: the last sample
/// presented at or before it wins. Targets past the end clamp to the last
/// sample. Returns `None` for an empty index or a non-finite value.
pub fn seek_target(samples: &[Sample], param: SeekParam) -> Option<u32> {
    if samples.is_empty() || !param.value.is_finite() {
        return None;
    }
    let last = samples.len() - 1;
    let target = match param.kind {
        SeekKind::FrameIndex => (param.value.max(0.0) as usize).min(last),
        SeekKind::Time => {
            let seconds = param.value.max(0.0);
            samples
                .iter()
                .enumerate()
                .filter(|(_, s)| s.timescale > 0 && s.cts as f64 / s.timescale as f64 <= seconds)
                .max_by_key(|(_, s)| s.cts)
                .map(|(i, _)| i)
                .unwrap_or(0)
        }
    };
    Some(keyframe_at_or_before(samples, target))
}

/// Index of the nearest keyframe at or before position `target`.
fn keyframe_at_or_before(samples: &[Sample], target: usize) -> u32 {
    samples[..=target]
        .iter()
        .rev()
        .find(|s| s.is_key_frame)
        .or_else(|| samples.first())
        .map(|s| s.index)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rp_core::FrameResource;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counted(Arc<AtomicUsize>);

    impl FrameResource for Counted {
        fn release(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn samples(n: u32) -> Arc<[Sample]> {
        (0..n)
            .map(|i| Sample {
                index: i,
                is_key_frame: i % 10 == 0,
                cts: 3000 * i as u64,
                dts: 3000 * i as u64,
                duration: 3000,
                timescale: 90000,
                offset: 48 + 100 * i as u64,
                size: 100,
            })
            .collect()
    }

    fn limits(buffer: usize, frames: usize, batch: usize) -> PipelineLimits {
        PipelineLimits::new(buffer, frames, batch).unwrap()
    }

    fn frame_for(sample: &Sample, released: &Arc<AtomicUsize>) -> DecodedFrame {
        DecodedFrame::new(
            sample.index,
            sample.timestamp_us(),
            sample.duration_us(),
            Box::new(Counted(released.clone())),
        )
    }

    /// Run one loop to idle, collecting the submissions.
    fn run_loop(scheduler: &mut Scheduler) -> (Vec<Sample>, IdleReason) {
        assert!(scheduler.begin());
        let mut submitted = Vec::new();
        let reason = loop {
            match scheduler.next_step() {
                Step::Submit(sample) => submitted.push(sample),
                Step::Idle(reason) => break reason,
            }
        };
        scheduler.finish();
        (submitted, reason)
    }

    #[test]
    fn begin_is_not_reentrant() {
        let mut scheduler = Scheduler::new(limits(20, 10, 4), samples(8));
        assert!(scheduler.begin());
        assert!(!scheduler.begin());
        assert_eq!(scheduler.loop_state(), LoopState::Scheduling);
        scheduler.finish();
        assert_eq!(scheduler.loop_state(), LoopState::Idle);
        assert!(scheduler.begin());
    }

    #[test]
    fn submits_remaining_samples_then_reports_exhausted() {
        let mut scheduler = Scheduler::new(limits(20, 10, 16), samples(5));
        let (submitted, reason) = run_loop(&mut scheduler);

        assert_eq!(
            submitted.iter().map(|s| s.index).collect::<Vec<_>>(),
            vec![0, 1, 2, 3, 4]
        );
        assert_eq!(reason, IdleReason::Exhausted);
        assert_eq!(scheduler.in_flight(), 5);
        assert!(!scheduler.is_ended());

        let released = Arc::new(AtomicUsize::new(0));
        for sample in &submitted {
            scheduler.on_frame(frame_for(sample, &released));
        }
        while scheduler.pop_frame().is_some() {}
        assert!(scheduler.is_ended());
        assert_eq!(released.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn stops_at_buffer_limit_and_resumes_on_drain() {
        let mut scheduler = Scheduler::new(limits(6, 3, 4), samples(30));
        let (first, reason) = run_loop(&mut scheduler);
        assert_eq!(first.len(), 5);
        assert_eq!(reason, IdleReason::BufferFull);

        // Completions alone keep the sum unchanged.
        let released = Arc::new(AtomicUsize::new(0));
        for sample in &first[..3] {
            scheduler.on_frame(frame_for(sample, &released));
        }
        let (none, reason) = run_loop(&mut scheduler);
        assert!(none.is_empty());
        assert_eq!(reason, IdleReason::BufferFull);

        scheduler.pop_frame();
        let (more, _) = run_loop(&mut scheduler);
        assert_eq!(more.iter().map(|s| s.index).collect::<Vec<_>>(), vec![5]);
    }

    #[test]
    fn frame_limit_blocks_admission() {
        let mut scheduler = Scheduler::new(limits(20, 2, 4), samples(30));
        let released = Arc::new(AtomicUsize::new(0));
        assert!(scheduler.begin());
        for _ in 0..2 {
            let Step::Submit(sample) = scheduler.next_step() else {
                panic!("expected a submission");
            };
            scheduler.on_frame(frame_for(&sample, &released));
        }
        assert_eq!(scheduler.next_step(), Step::Idle(IdleReason::FramesFull));
    }

    #[test]
    fn decode_error_halts_and_releases_frames() {
        let mut scheduler = Scheduler::new(limits(20, 10, 4), samples(30));
        let released = Arc::new(AtomicUsize::new(0));
        let (submitted, _) = run_loop(&mut scheduler);
        scheduler.on_frame(frame_for(&submitted[0], &released));
        scheduler.on_decode_error();

        assert!(scheduler.is_halted());
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.buffered(), 0);
        let (after, reason) = run_loop(&mut scheduler);
        assert!(after.is_empty());
        assert_eq!(reason, IdleReason::Halted);

        // Late frames are dropped.
        scheduler.on_frame(frame_for(&submitted[1], &released));
        assert_eq!(scheduler.buffered(), 0);
        assert_eq!(released.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn released_credit_is_not_resubmitted() {
        let mut scheduler = Scheduler::new(limits(4, 2, 4), samples(10));
        assert!(scheduler.begin());
        let Step::Submit(first) = scheduler.next_step() else {
            panic!("expected a submission");
        };
        scheduler.release(&first);
        assert_eq!(scheduler.in_flight(), 0);
        let Step::Submit(second) = scheduler.next_step() else {
            panic!("expected a submission");
        };
        assert_eq!(second.index, 1);
    }

    #[test]
    fn seek_clears_state_and_restarts_at_index() {
        let mut scheduler = Scheduler::new(limits(20, 10, 4), samples(30));
        let released = Arc::new(AtomicUsize::new(0));
        let (submitted, _) = run_loop(&mut scheduler);
        scheduler.on_frame(frame_for(&submitted[0], &released));

        scheduler.seek_to(20);
        assert_eq!(scheduler.in_flight(), 0);
        assert_eq!(scheduler.buffered(), 0);
        assert_eq!(released.load(Ordering::SeqCst), 1);

        let (after, _) = run_loop(&mut scheduler);
        assert_eq!(after[0].index, 20);
        assert_eq!(after.last().map(|s| s.index), Some(29));
    }

    #[test]
    fn seek_target_resolves_to_preceding_keyframe() {
        let index = samples(30);
        assert_eq!(seek_target(&index, SeekParam::frame_index(17)), Some(10));
        assert_eq!(seek_target(&index, SeekParam::frame_index(20)), Some(20));
        assert_eq!(seek_target(&index, SeekParam::frame_index(500)), Some(20));
        // 0.7s is sample 21 at 30fps.
        assert_eq!(seek_target(&index, SeekParam::time(0.7)), Some(20));
        assert_eq!(seek_target(&index, SeekParam::time(-3.0)), Some(0));
        assert_eq!(seek_target(&index, SeekParam::time(f64::NAN)), None);
        assert_eq!(seek_target(&[], SeekParam::time(1.0)), None);
    }

    /// Randomized completion/consumption interleavings. `in_flight +
    /// buffered < max_buffer` holds after every step. The frame bound is
    /// only checked when a submission is admitted: units already in flight
    /// may complete afterwards and push `buffered` up to `max_frames` or
    /// past it. No sample is submitted twice and frames come out in
    /// submission order.
    #[test]
    fn randomized_interleavings_hold_buffer_bound_and_gate_admission_on_frames() {
        for seed in 0..32u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let max_buffer = rng.gen_range(3..24);
            let max_frames = rng.gen_range(1..max_buffer);
            let batch = rng.gen_range(1..20);
            let total = rng.gen_range(1..200);
            let mut scheduler =
                Scheduler::new(limits(max_buffer, max_frames, batch), samples(total));

            let released = Arc::new(AtomicUsize::new(0));
            let mut decoding: VecDeque<Sample> = VecDeque::new();
            let mut seen = HashSet::new();
            let mut presented = Vec::new();

            for _ in 0..5_000 {
                match rng.gen_range(0..3) {
                    0 => {
                        if scheduler.begin() {
                            loop {
                                let frames_before = scheduler.buffered();
                                match scheduler.next_step() {
                                    Step::Submit(sample) => {
                                        // Admission gate only.
                                        assert!(frames_before < max_frames);
                                        assert!(seen.insert(sample.index), "duplicate {}", sample.index);
                                        decoding.push_back(sample);
                                        if rng.gen_bool(0.3) {
                                            break;
                                        }
                                    }
                                    Step::Idle(_) => break,
                                }
                                assert!(scheduler.in_flight() + scheduler.buffered() < max_buffer);
                            }
                            scheduler.finish();
                        }
                    }
                    1 => {
                        if let Some(sample) = decoding.pop_front() {
                            scheduler.on_frame(frame_for(&sample, &released));
                        }
                    }
                    _ => {
                        if let Some(frame) = scheduler.pop_frame() {
                            presented.push(frame.sample_index());
                        }
                    }
                }
                assert!(scheduler.in_flight() + scheduler.buffered() < max_buffer);
                assert_eq!(scheduler.in_flight(), decoding.len());
            }

            assert!(presented.windows(2).all(|w| w[0] < w[1]));
            assert!(released.load(Ordering::SeqCst) >= presented.len());
        }
    }
}
