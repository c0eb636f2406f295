//! Error types for rp-media.

use std::io;
use thiserror::Error;

/// Result type for rp-media operations.
pub type Result<T> = std::result::Result<T, DemuxError>;

/// Why a resource could not be demuxed.
#[derive(Debug, Error)]
pub enum DemuxError {
    /// Box content ended before a field could be read.
    #[error("Truncated box data: {0}")]
    Truncated(#[from] io::Error),

    /// Neither the structural nor the payload box tag occurs in the probe window.
    #[error("Moov box not found in the first {scanned} bytes")]
    MoovNotFound { scanned: usize },

    /// A box header or table field is out of range.
    #[error("Malformed MP4: {0}")]
    Malformed(String),

    /// A box that must be present is missing.
    #[error("Missing required box: {0}")]
    MissingBox(&'static str),

    /// Sample table boxes disagree on the number of samples.
    #[error("Inconsistent sample table: {0}")]
    InconsistentTable(String),

    /// The structural box contains no track with a `vide` handler.
    #[error("missing video track")]
    NoVideoTrack,

    /// The video sample entry uses a codec this player cannot configure.
    #[error("Unsupported sample entry: {0}")]
    UnsupportedCodec(String),

    /// The video sample entry has no codec configuration box.
    #[error("Missing codec configuration box: {0}")]
    MissingCodecConfig(&'static str),
}

impl DemuxError {
    /// Create a malformed-structure error.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    /// Create an inconsistent-table error.
    pub fn inconsistent(msg: impl Into<String>) -> Self {
        Self::InconsistentTable(msg.into())
    }
}

impl From<DemuxError> for rp_core::Error {
    fn from(err: DemuxError) -> Self {
        rp_core::Error::Demux {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

/// Geometry checks in `rp_core` (e.g. an inverted box range) surface as
/// malformed structure.
impl From<rp_core::Error> for DemuxError {
    fn from(err: rp_core::Error) -> Self {
        DemuxError::Malformed(err.message().to_string())
    }
}
