//! rp-media: progressive MP4 demuxing.
//!
//! # Modules
//!
//! - [`scanner`] - Locate the `moov` box from a small probe window in either
//!   file layout
//! - [`mp4`] - Parse `moov` into video metadata, decoder configuration and
//!   the sample index

pub mod error;
pub mod mp4;
pub mod scanner;

// Re-export commonly used items at the crate root.
pub use error::{DemuxError, Result};
pub use mp4::parse_moov;
pub use scanner::{refine_after_payload, scan, Layout, ScanResult, REFINE_HEADER_LEN};
