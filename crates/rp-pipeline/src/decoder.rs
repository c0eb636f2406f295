//! The boundary to the video decode capability.
//!
//! A [`DecoderPort`] accepts encoded units in submission order and reports
//! one [`DecoderOutput`] per unit on the channel handed to it at
//! [`configure`](DecoderPort::configure) time.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rp_core::{DecodedFrame, DecoderConfig, EncodedUnit, FrameResource};
use tokio::sync::mpsc;

/// Result of decoding one submitted unit.
#[derive(Debug)]
pub enum DecoderOutput {
    Frame(DecodedFrame),
    Error(String),
}

pub type DecoderOutputSender = mpsc::UnboundedSender<DecoderOutput>;
pub type DecoderOutputReceiver = mpsc::UnboundedReceiver<DecoderOutput>;

/// Create the channel a decoder reports on.
pub fn output_channel() -> (DecoderOutputSender, DecoderOutputReceiver) {
    mpsc::unbounded_channel()
}

/// A video decoder driven by the pipeline.
pub trait DecoderPort: Send {
    /// Prepare for `config`, reporting results on `output`.
    ///
    /// Fails with `VIDEO_DECODE_ERROR` when the codec is unsupported.
    fn configure(&mut self, config: &DecoderConfig, output: DecoderOutputSender)
        -> rp_core::Result<()>;

    /// Queue one unit for decoding. Results arrive on the output channel.
    fn submit(&mut self, unit: EncodedUnit) -> rp_core::Result<()>;

    /// Drop all pending work. The decoder must be configured again before
    /// the next submission.
    fn reset(&mut self);

    /// Release the decoder for good.
    fn close(&mut self);
}

/// Codec families a [`LoopbackDecoder`] accepts, by codec string prefix.
const LOOPBACK_CODECS: &[&str] = &["avc1", "avc3", "hvc1", "hev1", "vp09", "av01"];

/// Shared counters describing what a [`LoopbackDecoder`] has done.
#[derive(Debug, Default)]
pub struct LoopbackStats {
    submitted: Mutex<Vec<u32>>,
    produced: AtomicUsize,
    released: AtomicUsize,
}

impl LoopbackStats {
    /// Sample indices in submission order.
    pub fn submitted(&self) -> Vec<u32> {
        self.submitted.lock().clone()
    }

    pub fn produced(&self) -> usize {
        self.produced.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Frames handed out and not yet released.
    pub fn live_frames(&self) -> usize {
        self.produced().saturating_sub(self.released())
    }
}

struct LoopbackSurface {
    stats: Arc<LoopbackStats>,
}

impl FrameResource for LoopbackSurface {
    fn release(&mut self) {
        self.stats.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Order-preserving stand-in decoder: every unit becomes one frame carrying
/// the unit's timing, emitted immediately.
///
/// Used by the CLI dry run and by tests, which can make selected samples
/// fail.
#[derive(Default)]
pub struct LoopbackDecoder {
    output: Option<DecoderOutputSender>,
    stats: Arc<LoopbackStats>,
    fail_on: HashSet<u32>,
    configured_codec: Option<String>,
}

impl LoopbackDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report a decode error instead of a frame for sample `index`.
    pub fn fail_on(mut self, index: u32) -> Self {
        self.fail_on.insert(index);
        self
    }

    pub fn stats(&self) -> Arc<LoopbackStats> {
        self.stats.clone()
    }

    /// Codec string of the current configuration.
    pub fn codec(&self) -> Option<&str> {
        self.configured_codec.as_deref()
    }
}

impl DecoderPort for LoopbackDecoder {
    fn configure(
        &mut self,
        config: &DecoderConfig,
        output: DecoderOutputSender,
    ) -> rp_core::Result<()> {
        let family = config.codec.split('.').next().unwrap_or_default();
        if !LOOPBACK_CODECS.contains(&family) {
            return Err(rp_core::Error::video_decode(format!(
                "unsupported codec '{}'",
                config.codec
            )));
        }
        tracing::debug!(codec = %config.codec, width = config.coded_width, height = config.coded_height, "Decoder configured");
        self.configured_codec = Some(config.codec.clone());
        self.output = Some(output);
        Ok(())
    }

    fn submit(&mut self, unit: EncodedUnit) -> rp_core::Result<()> {
        let Some(output) = &self.output else {
            return Err(rp_core::Error::video_decode("decoder is not configured"));
        };
        let index = unit.sample.index;
        self.stats.submitted.lock().push(index);

        let result = if self.fail_on.contains(&index) {
            DecoderOutput::Error(format!("failed to decode sample {index}"))
        } else {
            self.stats.produced.fetch_add(1, Ordering::SeqCst);
            DecoderOutput::Frame(DecodedFrame::new(
                index,
                unit.timestamp_us(),
                unit.duration_us(),
                Box::new(LoopbackSurface {
                    stats: self.stats.clone(),
                }),
            ))
        };
        // A closed channel means the pipeline moved on; the frame is released on drop.
        let _ = output.send(result);
        Ok(())
    }

    fn reset(&mut self) {
        self.output = None;
    }

    fn close(&mut self) {
        self.output = None;
        self.configured_codec = None;
    }
}
