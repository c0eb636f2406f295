//! # rp-pipeline
//!
//! Playback pipeline for progressive MP4 over byte ranges.
//!
//! This crate provides:
//!
//! - **[`Demuxer`]** -- loads metadata from a [`RangeSource`](rp_source::RangeSource)
//!   with as few range requests as the file layout allows.
//! - **[`Scheduler`]** -- backpressured fetch/submit decisions bounded by the
//!   buffer and frame limits.
//! - **[`DecoderPort`]** / **[`FrameSink`]** -- the decode capability and the
//!   presentation target, with loopback and tracing implementations.
//! - **[`Command`]** / **[`Event`]** -- the control protocol of a worker.
//! - **[`spawn`]** -- runs one pipeline as a tokio task behind a
//!   [`PipelineHandle`].

pub mod decoder;
pub mod demuxer;
pub mod protocol;
pub mod scheduler;
pub mod sink;
pub mod worker;

// Re-export key types at the crate root.
pub use decoder::{DecoderOutput, DecoderOutputSender, DecoderPort, LoopbackDecoder, LoopbackStats};
pub use demuxer::Demuxer;
pub use protocol::{Command, Event, FrameInfo};
pub use scheduler::{seek_target, IdleReason, LoopState, Scheduler, Step};
pub use sink::{CountingSink, FrameSink, TracingSink};
pub use worker::{frame_interval, spawn, PipelineControl, PipelineHandle, PipelineSettings};
