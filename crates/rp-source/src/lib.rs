//! rp-source: inclusive byte-range access to a remote resource.
//!
//! [`RangeSource`] is the only way the rest of the workspace reads media
//! bytes. [`HttpRangeSource`] issues HTTP `Range` requests; [`MemorySource`]
//! serves a buffer already in memory with the same contract.

pub mod http;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use rp_core::ResourceSize;

pub use http::HttpRangeSource;
pub use memory::MemorySource;

/// Boxed transport error kept as the cause of a [`SourceError`].
pub type TransportCause = Box<dyn std::error::Error + Send + Sync>;

/// Why a range could not be fetched.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The server answered with a non-success status.
    #[error("HTTP {status} for range {start}-{end}")]
    Status { status: u16, start: u64, end: u64 },

    /// The request could not be sent or its body could not be read.
    #[error("Request for range {start}-{end} failed: {source}")]
    Transport {
        start: u64,
        end: u64,
        #[source]
        source: TransportCause,
    },

    /// The source was aborted before or during the request.
    #[error("Request for range {start}-{end} was aborted")]
    Aborted { start: u64, end: u64 },

    /// Neither `Content-Range` nor `Content-Length` gave the resource size.
    #[error("Response for range {start}-{end} carries no total size (Content-Range: {header:?})")]
    MissingTotalSize {
        start: u64,
        end: u64,
        header: Option<String>,
    },

    /// The range is inverted or starts past the end of the resource.
    #[error("Invalid range {start}-{end}{}", size.map(|s| format!(" for a {s}-byte resource")).unwrap_or_default())]
    InvalidRange {
        start: u64,
        end: u64,
        size: Option<u64>,
    },
}

impl SourceError {
    /// Whether this failure was caused by [`RangeSource::abort`].
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }
}

impl From<SourceError> for rp_core::Error {
    fn from(err: SourceError) -> Self {
        rp_core::Error::SourceLoadFailure {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

/// A range response together with what the transport said about it.
#[derive(Debug, Clone)]
pub struct RangeResponse {
    pub data: Bytes,
    pub total_size: ResourceSize,
    pub status: u16,
    /// Raw `Content-Range` value, when the transport sent one.
    pub content_range: Option<String>,
}

/// Inclusive byte-range reads from one resource.
///
/// No retries happen at this layer.
#[async_trait]
pub trait RangeSource: Send + Sync {
    /// Fetch bytes `start..=end`.
    async fn fetch_range(&self, start: u64, end: u64) -> Result<Bytes, SourceError>;

    /// Fetch bytes `start..=end` and learn the total resource size.
    async fn fetch_range_with_size(&self, start: u64, end: u64)
        -> Result<RangeResponse, SourceError>;

    /// Cancel in-flight requests. Every later request fails with
    /// [`SourceError::Aborted`].
    fn abort(&self);
}

#[async_trait]
impl<T: RangeSource + ?Sized> RangeSource for Arc<T> {
    async fn fetch_range(&self, start: u64, end: u64) -> Result<Bytes, SourceError> {
        (**self).fetch_range(start, end).await
    }

    async fn fetch_range_with_size(
        &self,
        start: u64,
        end: u64,
    ) -> Result<RangeResponse, SourceError> {
        (**self).fetch_range_with_size(start, end).await
    }

    fn abort(&self) {
        (**self).abort()
    }
}

/// Reject inverted ranges before any I/O.
pub(crate) fn check_range(start: u64, end: u64) -> Result<(), SourceError> {
    if start > end {
        return Err(SourceError::InvalidRange {
            start,
            end,
            size: None,
        });
    }
    Ok(())
}

/// A parsed `Content-Range: bytes START-END/TOTAL` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    /// `None` for the unsatisfied form `bytes */TOTAL`.
    pub range: Option<(u64, u64)>,
    /// `None` when the total is `*` (unknown).
    pub total: Option<u64>,
}

/// Parse a `Content-Range` header value.
pub fn parse_content_range(value: &str) -> Option<ContentRange> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (range_part, total_part) = rest.split_once('/')?;

    let range = match range_part.trim() {
        "*" => None,
        r => {
            let (start, end) = r.split_once('-')?;
            Some((start.trim().parse().ok()?, end.trim().parse().ok()?))
        }
    };
    let total = match total_part.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };

    Some(ContentRange { range, total })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rp_core::ErrorKind;

    #[test]
    fn content_range_full_form() {
        let cr = parse_content_range("bytes 0-1023/146515").unwrap();
        assert_eq!(cr.range, Some((0, 1023)));
        assert_eq!(cr.total, Some(146515));
    }

    #[test]
    fn content_range_unknown_total() {
        let cr = parse_content_range("bytes 0-1023/*").unwrap();
        assert_eq!(cr.total, None);
    }

    #[test]
    fn content_range_unsatisfied() {
        let cr = parse_content_range("bytes */5000").unwrap();
        assert_eq!(cr.range, None);
        assert_eq!(cr.total, Some(5000));
    }

    #[test]
    fn content_range_garbage() {
        assert!(parse_content_range("items 0-1/2").is_none());
        assert!(parse_content_range("bytes 0-1").is_none());
        assert!(parse_content_range("bytes a-b/10").is_none());
    }

    #[test]
    fn every_source_error_is_a_load_failure() {
        let errors = [
            SourceError::Status {
                status: 404,
                start: 0,
                end: 1023,
            },
            SourceError::Aborted { start: 0, end: 1 },
            SourceError::MissingTotalSize {
                start: 0,
                end: 1,
                header: None,
            },
        ];
        for err in errors {
            let core: rp_core::Error = err.into();
            assert_eq!(core.kind(), ErrorKind::SourceLoadFailure);
        }
    }

    #[test]
    fn status_error_display() {
        let err = SourceError::Status {
            status: 416,
            start: 10,
            end: 20,
        };
        assert_eq!(err.to_string(), "HTTP 416 for range 10-20");
        let invalid = SourceError::InvalidRange {
            start: 9,
            end: 3,
            size: Some(100),
        };
        assert_eq!(invalid.to_string(), "Invalid range 9-3 for a 100-byte resource");
    }
}
