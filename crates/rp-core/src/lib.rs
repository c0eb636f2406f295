//! rp-core: shared error taxonomy, media data model, playback state, and
//! configuration.
//!
//! This crate is the foundational dependency for all other rp-* crates.

pub mod config;
pub mod error;
pub mod events;
pub mod media;

// Re-export the most commonly used items at the crate root.
pub use error::{Error, ErrorKind, ErrorReport, Result};
pub use events::{PlaybackState, PlayerEvent, StateManager};
pub use media::*;
