//! The pipeline worker: one tokio task per playback session.
//!
//! The worker owns the range source, decoder, frame sink and [`Scheduler`].
//! Everything reaches it as a message (control [`Command`]s, decoder
//! outputs, completed payload fetches, pacing ticks), so the scheduler
//! state has exactly one writer. At most one payload fetch is outstanding
//! at a time, which keeps fetches and submissions in sample order.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rp_core::config::{Config, PipelineLimits, SourceConfig};
use rp_core::{
    DecoderConfig, EncodedUnit, Error, PlaybackState, PlayerEvent, Sample, SeekParam,
    VideoMetadata,
};
use rp_source::{HttpRangeSource, RangeSource, SourceError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::decoder::{output_channel, DecoderOutput, DecoderOutputReceiver, DecoderPort};
use crate::demuxer::Demuxer;
use crate::protocol::{Command, Event, FrameInfo};
use crate::scheduler::{seek_target, Scheduler, Step};
use crate::sink::FrameSink;

/// Pacing used when the frame rate is unknown.
const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(33);
const MIN_FRAME_INTERVAL: Duration = Duration::from_millis(1);

/// Presentation interval for `fps` frames per second at `rate` speed.
pub fn frame_interval(fps: f64, rate: f64) -> Duration {
    let per_second = fps * rate;
    if !per_second.is_finite() || per_second <= 0.0 {
        return DEFAULT_FRAME_INTERVAL;
    }
    Duration::from_secs_f64(1.0 / per_second).max(MIN_FRAME_INTERVAL)
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Validated configuration of one pipeline.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub limits: PipelineLimits,
    pub probe_window: u64,
    pub source: SourceConfig,
    pub playback_rate: f64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        let config = Config::default();
        Self {
            limits: PipelineLimits::default(),
            probe_window: config.pipeline.probe_window,
            source: config.source,
            playback_rate: config.player.playback_rate,
        }
    }
}

impl TryFrom<&Config> for PipelineSettings {
    type Error = Error;

    fn try_from(config: &Config) -> rp_core::Result<Self> {
        let rate = config.player.playback_rate;
        Ok(Self {
            limits: PipelineLimits::try_from(&config.pipeline)?,
            probe_window: config.pipeline.probe_window,
            source: config.source.clone(),
            playback_rate: if rate.is_finite() && rate > 0.0 {
                rate
            } else {
                1.0
            },
        })
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Sending side of a running pipeline. Dropping it cancels the worker.
pub struct PipelineControl {
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl PipelineControl {
    /// Queue a command. Returns `false` once the worker has exited.
    pub fn send(&self, command: Command) -> bool {
        self.commands.send(command).is_ok()
    }

    /// Tear the worker down without waiting for queued commands.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Wait for the worker task to exit.
    pub async fn join(mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!("Pipeline worker panicked: {e}");
            }
        }
    }
}

impl Drop for PipelineControl {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Both ends of a running pipeline.
pub struct PipelineHandle {
    control: PipelineControl,
    events: mpsc::UnboundedReceiver<Event>,
}

impl PipelineHandle {
    pub fn send(&self, command: Command) -> bool {
        self.control.send(command)
    }

    pub fn cancel(&self) {
        self.control.cancel();
    }

    /// Next event, or `None` once the worker has exited and the queue is
    /// drained.
    pub async fn recv(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.events.try_recv().ok()
    }

    pub fn split(self) -> (PipelineControl, mpsc::UnboundedReceiver<Event>) {
        (self.control, self.events)
    }
}

/// Start a pipeline worker.
///
/// With `source` set the worker reads from it; otherwise
/// [`Command::Init`] opens an HTTP source for the given URL.
pub fn spawn(
    settings: PipelineSettings,
    source: Option<Arc<dyn RangeSource>>,
    decoder: Box<dyn DecoderPort>,
    sink: Box<dyn FrameSink>,
) -> PipelineHandle {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    let rate = settings.playback_rate;
    let worker = Worker {
        settings,
        source,
        decoder,
        sink,
        events: event_tx,
        cancel: cancel.clone(),
        outputs: None,
        scheduler: None,
        decoder_config: None,
        metadata: None,
        fetch: None,
        ticker: None,
        state: PlaybackState::Idle,
        playing: false,
        rate,
        first_frame_ready: false,
        failed: false,
    };
    let task = tokio::spawn(worker.run(command_rx));

    PipelineHandle {
        control: PipelineControl {
            commands: command_tx,
            cancel,
            task: Some(task),
        },
        events: event_rx,
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

type FetchFuture = Pin<Box<dyn Future<Output = Result<Bytes, SourceError>> + Send>>;

/// The single outstanding payload fetch.
struct PendingFetch {
    sample: Sample,
    future: FetchFuture,
}

struct Worker {
    settings: PipelineSettings,
    source: Option<Arc<dyn RangeSource>>,
    decoder: Box<dyn DecoderPort>,
    sink: Box<dyn FrameSink>,
    events: mpsc::UnboundedSender<Event>,
    cancel: CancellationToken,
    /// Replaced on every decoder (re)configuration; dropping it discards
    /// stale outputs.
    outputs: Option<DecoderOutputReceiver>,
    scheduler: Option<Scheduler>,
    decoder_config: Option<DecoderConfig>,
    metadata: Option<VideoMetadata>,
    fetch: Option<PendingFetch>,
    ticker: Option<Interval>,
    state: PlaybackState,
    playing: bool,
    rate: f64,
    first_frame_ready: bool,
    failed: bool,
}

async fn next_output(outputs: &mut Option<DecoderOutputReceiver>) -> Option<DecoderOutput> {
    match outputs {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn fetched(fetch: &mut Option<PendingFetch>) -> Result<Bytes, SourceError> {
    match fetch {
        Some(pending) => (&mut pending.future).await,
        None => std::future::pending().await,
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

impl Worker {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        tracing::debug!("Pipeline worker started");
        loop {
            // Decoder outputs go before fetch completions so that a decode
            // error stops the loop before the next unit is submitted.
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    self.teardown();
                    break;
                }
                command = commands.recv() => {
                    let keep_running = match command {
                        Some(command) => self.handle_command(command).await,
                        None => {
                            self.teardown();
                            false
                        }
                    };
                    if !keep_running {
                        break;
                    }
                }
                Some(output) = next_output(&mut self.outputs) => self.handle_output(output),
                result = fetched(&mut self.fetch) => self.handle_fetched(result),
                _ = tick(&mut self.ticker) => self.on_tick(),
            }
        }
        tracing::debug!("Pipeline worker exited");
    }

    // -- Commands -----------------------------------------------------------

    /// Returns `false` when the worker should exit.
    async fn handle_command(&mut self, command: Command) -> bool {
        tracing::debug!(?command, state = %self.state, "Command");
        if self.failed && command != Command::Destroy {
            tracing::debug!(?command, "Ignoring command after failure");
            return true;
        }
        match command {
            Command::Init { url } => self.init(url),
            Command::Start => self.start().await,
            Command::Play => self.play(),
            Command::Seek(param) => self.seek(param),
            Command::Pause => self.pause(),
            Command::SetPlaybackRate(rate) => self.set_rate(rate),
            Command::Destroy => {
                self.teardown();
                return false;
            }
        }
        true
    }

    fn init(&mut self, url: String) {
        if self.source.is_none() {
            match HttpRangeSource::new(url.clone(), &self.settings.source) {
                Ok(source) => self.source = Some(Arc::new(source)),
                Err(e) => {
                    self.fail(e.into());
                    return;
                }
            }
        }
        tracing::info!(%url, "Pipeline initialized");
        self.emit(Event::Initialized);
    }

    async fn start(&mut self) {
        if self.scheduler.is_some() {
            tracing::warn!("Pipeline already started");
            return;
        }
        let Some(source) = self.source.clone() else {
            self.fail(Error::unknown("start requested before init"));
            return;
        };

        self.set_state(PlaybackState::Loading);
        self.emit(Event::player(PlayerEvent::LoadStart));

        let loaded = tokio::select! {
            _ = self.cancel.cancelled() => return,
            loaded = Demuxer::load_metadata(source.as_ref(), self.settings.probe_window) => loaded,
        };
        let info = match loaded {
            Ok(info) => info,
            Err(e) => {
                self.fail(e);
                return;
            }
        };
        if let Some(audio) = &info.audio {
            tracing::debug!(codec = %audio.codec, "Audio track present; not decoded");
        }

        let metadata = info.video.metadata.clone();
        self.emit(Event::MetadataLoaded(metadata.clone()));
        self.emit(Event::player_with(PlayerEvent::LoadedMetadata, &metadata));

        if let Err(e) = self.configure_decoder(&info.video.decoder_config) {
            self.fail(e);
            return;
        }
        self.decoder_config = Some(info.video.decoder_config);
        self.scheduler = Some(Scheduler::new(
            self.settings.limits,
            Arc::from(info.video.samples),
        ));
        self.metadata = Some(metadata);

        self.set_state(PlaybackState::Loaded);
        self.emit(Event::Started);
        self.pump();
    }

    fn play(&mut self) {
        if self.scheduler.is_none() {
            tracing::warn!("Ignoring play before metadata is loaded");
            return;
        }
        if self.state == PlaybackState::Ended {
            if let Err(e) = self.reposition(0) {
                self.fail(e);
                return;
            }
        }
        if !self.playing {
            self.playing = true;
            self.start_ticker();
        }
        self.emit(Event::Played);
        self.set_state(PlaybackState::Playing);
        self.emit(Event::player(PlayerEvent::Playing));
        self.pump();
    }

    fn pause(&mut self) {
        if self.scheduler.is_none() {
            tracing::warn!("Ignoring pause before metadata is loaded");
            return;
        }
        self.playing = false;
        self.ticker = None;
        self.set_state(PlaybackState::Paused);
        self.emit(Event::Paused);
        self.emit(Event::player(PlayerEvent::Paused));
    }

    fn seek(&mut self, param: SeekParam) {
        let Some(scheduler) = &self.scheduler else {
            tracing::warn!(?param, "Ignoring seek before metadata is loaded");
            return;
        };
        let Some(index) = seek_target(scheduler.samples(), param) else {
            tracing::warn!(?param, "Ignoring seek to an invalid target");
            return;
        };

        let resume = self.playing;
        let previous = self.state;
        self.playing = false;
        self.ticker = None;
        self.set_state(PlaybackState::Seeking);

        if let Err(e) = self.reposition(index) {
            self.fail(e);
            return;
        }
        tracing::info!(?param, keyframe = index, "Seeked");
        self.emit(Event::Seeked);
        self.emit(Event::player(PlayerEvent::Seeked));

        if resume {
            self.playing = true;
            self.start_ticker();
            self.set_state(PlaybackState::Playing);
        } else if previous == PlaybackState::Loaded {
            self.set_state(PlaybackState::Loaded);
        } else {
            self.set_state(PlaybackState::Paused);
        }
        self.pump();
    }

    fn set_rate(&mut self, rate: f64) {
        if !rate.is_finite() || rate <= 0.0 {
            tracing::warn!(rate, "Ignoring invalid playback rate");
            return;
        }
        self.rate = rate;
        if self.playing {
            self.start_ticker();
        }
    }

    // -- Scheduling ---------------------------------------------------------

    /// Re-trigger the schedule loop. A no-op while a loop is active.
    fn pump(&mut self) {
        let Some(scheduler) = self.scheduler.as_mut() else {
            return;
        };
        if scheduler.begin() {
            self.advance();
        }
    }

    /// Run the active loop until it submits a fetch or goes idle.
    fn advance(&mut self) {
        let Some(scheduler) = self.scheduler.as_mut() else {
            return;
        };
        match scheduler.next_step() {
            Step::Submit(sample) => {
                let Some(source) = self.source.clone() else {
                    scheduler.release(&sample);
                    scheduler.finish();
                    return;
                };
                let range = match sample.byte_range() {
                    Ok(range) => range,
                    Err(e) => {
                        scheduler.release(&sample);
                        scheduler.finish();
                        self.fail(e);
                        return;
                    }
                };
                self.fetch = Some(PendingFetch {
                    sample,
                    future: Box::pin(async move {
                        source.fetch_range(range.start(), range.end()).await
                    }),
                });
            }
            Step::Idle(reason) => {
                scheduler.finish();
                tracing::trace!(
                    ?reason,
                    in_flight = scheduler.in_flight(),
                    buffered = scheduler.buffered(),
                    "Schedule loop idle"
                );
            }
        }
    }

    fn handle_fetched(&mut self, result: Result<Bytes, SourceError>) {
        let Some(PendingFetch { sample, .. }) = self.fetch.take() else {
            return;
        };
        let data = match result {
            Ok(data) => data,
            Err(e) => {
                if let Some(scheduler) = self.scheduler.as_mut() {
                    scheduler.release(&sample);
                    scheduler.finish();
                }
                if e.is_aborted() && self.cancel.is_cancelled() {
                    return;
                }
                self.fail(e.into());
                return;
            }
        };

        if data.len() < sample.size as usize {
            if let Some(scheduler) = self.scheduler.as_mut() {
                scheduler.release(&sample);
            }
            self.fail(Error::demux(
                format!("sample {} is truncated", sample.index),
                format!("expected {} bytes, got {}", sample.size, data.len()),
            ));
            return;
        }

        if let Err(e) = self.decoder.submit(EncodedUnit::new(sample, data)) {
            if let Some(scheduler) = self.scheduler.as_mut() {
                scheduler.release(&sample);
            }
            self.fail(e);
            return;
        }
        self.advance();
    }

    fn handle_output(&mut self, output: DecoderOutput) {
        if self.failed {
            return;
        }
        match output {
            DecoderOutput::Frame(frame) => {
                let Some(scheduler) = self.scheduler.as_mut() else {
                    return;
                };
                let info = FrameInfo {
                    index: frame.sample_index(),
                    timestamp_us: frame.timestamp_us(),
                };
                scheduler.on_frame(frame);
                self.emit(Event::VideoFrameDecoded(info));
                if !self.first_frame_ready {
                    self.first_frame_ready = true;
                    self.emit(Event::player(PlayerEvent::LoadedData));
                    self.emit(Event::player(PlayerEvent::CanPlay));
                }
                self.pump();
            }
            DecoderOutput::Error(message) => {
                if let Some(scheduler) = self.scheduler.as_mut() {
                    scheduler.on_decode_error();
                }
                self.fail(Error::video_decode(message));
            }
        }
    }

    fn on_tick(&mut self) {
        let Some(scheduler) = self.scheduler.as_mut() else {
            return;
        };
        let frame = scheduler.pop_frame();
        let ended = scheduler.is_ended();

        match frame {
            Some(frame) => {
                self.sink.present(frame);
                if self.state == PlaybackState::Buffering {
                    self.set_state(PlaybackState::Playing);
                    self.emit(Event::player(PlayerEvent::Playing));
                }
                self.pump();
            }
            None if ended => {
                tracing::info!("Playback ended");
                self.playing = false;
                self.ticker = None;
                self.set_state(PlaybackState::Ended);
                self.emit(Event::player(PlayerEvent::Ended));
            }
            None => {
                if self.state == PlaybackState::Playing {
                    self.set_state(PlaybackState::Buffering);
                    self.emit(Event::player(PlayerEvent::Waiting));
                }
                self.pump();
            }
        }
    }

    // -- Helpers --------------------------------------------------------------

    fn configure_decoder(&mut self, config: &DecoderConfig) -> rp_core::Result<()> {
        let (tx, rx) = output_channel();
        self.decoder.configure(config, tx)?;
        self.outputs = Some(rx);
        Ok(())
    }

    /// Restart decoding at sample `index` on a freshly configured decoder.
    fn reposition(&mut self, index: u32) -> rp_core::Result<()> {
        self.abandon_fetch();
        self.decoder.reset();
        self.outputs = None;
        if let Some(scheduler) = self.scheduler.as_mut() {
            scheduler.finish();
            scheduler.seek_to(index);
        }
        match self.decoder_config.clone() {
            Some(config) => self.configure_decoder(&config),
            None => Ok(()),
        }
    }

    /// Drop the outstanding fetch, giving its credit back.
    fn abandon_fetch(&mut self) {
        if let Some(PendingFetch { sample, .. }) = self.fetch.take() {
            if let Some(scheduler) = self.scheduler.as_mut() {
                scheduler.release(&sample);
            }
        }
    }

    fn start_ticker(&mut self) {
        let fps = self.metadata.as_ref().map(|m| m.fps()).unwrap_or(0.0);
        let period = frame_interval(fps, self.rate);
        tracing::debug!(?period, rate = self.rate, "Pacing");
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.ticker = Some(ticker);
    }

    /// Halt on the first error and report it once.
    fn fail(&mut self, err: Error) {
        if self.failed {
            tracing::debug!("Suppressing error after halt: {err}");
            return;
        }
        self.failed = true;
        tracing::error!(kind = %err.kind(), "Pipeline failed: {err}");

        self.abandon_fetch();
        if let Some(scheduler) = self.scheduler.as_mut() {
            scheduler.halt();
            scheduler.finish();
        }
        self.playing = false;
        self.ticker = None;
        self.set_state(PlaybackState::Error);
        self.emit(Event::Error(err.report()));
    }

    fn teardown(&mut self) {
        tracing::info!("Destroying pipeline");
        if let Some(source) = &self.source {
            source.abort();
        }
        self.abandon_fetch();
        self.decoder.close();
        self.outputs = None;
        self.ticker = None;
        self.playing = false;
        // Buffered frames are released with the scheduler.
        self.scheduler = None;
        self.set_state(PlaybackState::Destroyed);
        self.emit(Event::player(PlayerEvent::Destroy));
    }

    fn set_state(&mut self, state: PlaybackState) {
        if self.state == state {
            return;
        }
        tracing::debug!(from = %self.state, to = %state, "State change");
        self.state = state;
        self.emit(Event::ChangePlayerState(state));
    }

    fn emit(&self, event: Event) {
        // The controller may already be gone during teardown.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_interval_scales_with_rate() {
        let close = |d: Duration, ms: f64| (d.as_secs_f64() * 1000.0 - ms).abs() < 1e-3;
        assert!(close(frame_interval(25.0, 1.0), 40.0));
        assert!(close(frame_interval(25.0, 2.0), 20.0));
        assert_eq!(frame_interval(0.0, 1.0), DEFAULT_FRAME_INTERVAL);
        assert_eq!(frame_interval(30.0, f64::NAN), DEFAULT_FRAME_INTERVAL);
        assert_eq!(frame_interval(30.0, 1e9), MIN_FRAME_INTERVAL);
    }

    #[test]
    fn settings_reject_bad_limits() {
        let mut config = Config::default();
        config.pipeline.max_buffer_count = 5;
        config.pipeline.max_video_frame_count = 5;
        assert!(PipelineSettings::try_from(&config).is_err());
    }

    #[test]
    fn settings_fall_back_to_normal_rate() {
        let mut config = Config::default();
        config.player.playback_rate = -2.0;
        let settings = PipelineSettings::try_from(&config).unwrap();
        assert_eq!(settings.playback_rate, 1.0);
    }
}
