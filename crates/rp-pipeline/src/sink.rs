//! Where presented frames go.
//!
//! Ownership of a [`DecodedFrame`] moves to the sink at presentation time;
//! the sink releases it by calling [`DecodedFrame::release`] or dropping it.

use std::sync::Arc;

use parking_lot::Mutex;
use rp_core::DecodedFrame;

/// Consumer of frames at their presentation time.
pub trait FrameSink: Send {
    fn present(&mut self, frame: DecodedFrame);
}

impl<F> FrameSink for F
where
    F: FnMut(DecodedFrame) + Send,
{
    fn present(&mut self, frame: DecodedFrame) {
        self(frame)
    }
}

/// Records the sample index of every presented frame, then releases it.
#[derive(Debug, Clone, Default)]
pub struct CountingSink {
    presented: Arc<Mutex<Vec<u32>>>,
}

impl CountingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sample indices in presentation order.
    pub fn presented(&self) -> Vec<u32> {
        self.presented.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.presented.lock().len()
    }
}

impl FrameSink for CountingSink {
    fn present(&mut self, frame: DecodedFrame) {
        self.presented.lock().push(frame.sample_index());
        frame.release();
    }
}

/// Logs each frame at debug level and releases it.
#[derive(Debug, Default)]
pub struct TracingSink {
    presented: u64,
}

impl TracingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn presented(&self) -> u64 {
        self.presented
    }
}

impl FrameSink for TracingSink {
    fn present(&mut self, frame: DecodedFrame) {
        self.presented += 1;
        tracing::debug!(
            index = frame.sample_index(),
            pts_us = frame.timestamp_us(),
            duration_us = frame.duration_us(),
            "Presenting frame"
        );
        frame.release();
    }
}
