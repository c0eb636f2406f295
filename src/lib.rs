//! rangeplay - progressive MP4 playback over HTTP byte ranges
//!
//! The library crate wires the pipeline crates into an application-facing
//! [`Player`] and exposes the pieces the CLI and integration tests use.

pub mod listeners;
pub mod player;
pub mod probe;

pub use listeners::{EventManager, Handler, ListenerId};
pub use player::{Player, PlayerError};
pub use probe::{probe_source, Input, ProbeReport};

pub use rp_core::config::Config;
pub use rp_core::{ErrorKind, ErrorReport, PlaybackState, PlayerEvent, SeekParam, VideoMetadata};
