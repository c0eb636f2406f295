//! Unified player error type.
//!
//! Every failure that leaves a pipeline is funnelled into [`Error`], a closed
//! taxonomy whose [`ErrorKind::code`] is the machine-readable string reported
//! to listeners. The original cause, when there is one, is kept as the
//! error's `source`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Boxed underlying cause attached to an [`Error`].
pub type Cause = Box<dyn std::error::Error + Send + Sync>;

/// Unified error type covering every failure mode of a playback session.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A byte-range fetch failed (non-success status, abort, connection error).
    #[error("Failed to load media data: {message}")]
    SourceLoadFailure {
        /// Human-readable error description.
        message: String,
        /// The transport error that triggered this failure.
        #[source]
        source: Option<Cause>,
    },

    /// The container could not be demuxed.
    #[error("MP4 demuxing failed: {message}")]
    Demux {
        /// Human-readable error description.
        message: String,
        /// The parse error that triggered this failure.
        #[source]
        source: Option<Cause>,
    },

    /// The decode capability reported a failure for a submitted unit.
    #[error("Video decode failed: {message}")]
    VideoDecode {
        /// Human-readable error description.
        message: String,
        /// The decoder error, if the decoder supplied one.
        #[source]
        source: Option<Cause>,
    },

    /// Reserved for the audio path, which is not implemented.
    #[error("Audio decode failed: {message}")]
    AudioDecode {
        /// Human-readable error description.
        message: String,
        /// The decoder error, if the decoder supplied one.
        #[source]
        source: Option<Cause>,
    },

    /// Catch-all for defects not classified above.
    #[error("Unknown error: {message}")]
    Unknown {
        /// Human-readable error description.
        message: String,
        /// The underlying error, if any.
        #[source]
        source: Option<Cause>,
    },
}

/// Machine-readable classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    SourceLoadFailure,
    DemuxError,
    VideoDecodeError,
    AudioDecodeError,
    UnknownError,
}

impl ErrorKind {
    /// The wire code for this kind (e.g. `"DEMUX_ERROR"`).
    pub fn code(&self) -> &'static str {
        match self {
            Self::SourceLoadFailure => "SOURCE_LOAD_FAILURE",
            Self::DemuxError => "DEMUX_ERROR",
            Self::VideoDecodeError => "VIDEO_DECODE_ERROR",
            Self::AudioDecodeError => "AUDIO_DECODE_ERROR",
            Self::UnknownError => "UNKNOWN_ERROR",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::SourceLoadFailure { .. } => ErrorKind::SourceLoadFailure,
            Error::Demux { .. } => ErrorKind::DemuxError,
            Error::VideoDecode { .. } => ErrorKind::VideoDecodeError,
            Error::AudioDecode { .. } => ErrorKind::AudioDecodeError,
            Error::Unknown { .. } => ErrorKind::UnknownError,
        }
    }

    /// The human-readable message without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            Error::SourceLoadFailure { message, .. }
            | Error::Demux { message, .. }
            | Error::VideoDecode { message, .. }
            | Error::AudioDecode { message, .. }
            | Error::Unknown { message, .. } => message,
        }
    }

    /// Convenience constructor for [`Error::SourceLoadFailure`].
    pub fn source_load(message: impl Into<String>, cause: impl Into<Cause>) -> Self {
        Error::SourceLoadFailure {
            message: message.into(),
            source: Some(cause.into()),
        }
    }

    /// Convenience constructor for [`Error::Demux`] with a cause.
    pub fn demux(message: impl Into<String>, cause: impl Into<Cause>) -> Self {
        Error::Demux {
            message: message.into(),
            source: Some(cause.into()),
        }
    }

    /// Convenience constructor for [`Error::VideoDecode`] without a cause.
    pub fn video_decode(message: impl Into<String>) -> Self {
        Error::VideoDecode {
            message: message.into(),
            source: None,
        }
    }

    /// Convenience constructor for [`Error::Unknown`] without a cause.
    pub fn unknown(message: impl Into<String>) -> Self {
        Error::Unknown {
            message: message.into(),
            source: None,
        }
    }

    /// Build a serializable snapshot of this error for event listeners.
    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            kind: self.kind(),
            message: self.to_string(),
            cause: std::error::Error::source(self).map(|c| c.to_string()),
        }
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Cloneable, serializable view of an [`Error`] carried by pipeline events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_load_display_and_kind() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err = Error::source_load("range 0-1023", io);
        assert_eq!(err.to_string(), "Failed to load media data: range 0-1023");
        assert_eq!(err.kind(), ErrorKind::SourceLoadFailure);
        assert_eq!(err.kind().code(), "SOURCE_LOAD_FAILURE");
    }

    #[test]
    fn demux_keeps_cause() {
        let err = Error::demux("Moov box not found", "scanned 1024 bytes");
        let cause = std::error::Error::source(&err).unwrap();
        assert_eq!(cause.to_string(), "scanned 1024 bytes");
        assert_eq!(err.message(), "Moov box not found");
    }

    #[test]
    fn video_decode_has_no_cause() {
        let err = Error::video_decode("bad NAL unit");
        assert!(std::error::Error::source(&err).is_none());
        assert_eq!(err.kind().code(), "VIDEO_DECODE_ERROR");
    }

    #[test]
    fn kind_codes_are_distinct() {
        let kinds = [
            ErrorKind::SourceLoadFailure,
            ErrorKind::DemuxError,
            ErrorKind::VideoDecodeError,
            ErrorKind::AudioDecodeError,
            ErrorKind::UnknownError,
        ];
        let codes: std::collections::HashSet<_> = kinds.iter().map(|k| k.code()).collect();
        assert_eq!(codes.len(), kinds.len());
    }

    #[test]
    fn kind_serializes_as_code() {
        for kind in [ErrorKind::DemuxError, ErrorKind::UnknownError] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.code()));
        }
    }

    #[test]
    fn report_snapshot() {
        let err = Error::demux("missing video track", "no 'vide' handler");
        let report = err.report();
        assert_eq!(report.kind, ErrorKind::DemuxError);
        assert_eq!(report.message, "MP4 demuxing failed: missing video track");
        assert_eq!(report.cause.as_deref(), Some("no 'vide' handler"));
        assert_eq!(
            report.to_string(),
            "[DEMUX_ERROR] MP4 demuxing failed: missing video track"
        );
    }

    #[test]
    fn result_alias() {
        fn err_fn() -> Result<()> {
            Err(Error::unknown("boom"))
        }
        assert_eq!(err_fn().unwrap_err().kind(), ErrorKind::UnknownError);
    }
}
