//! In-memory range source, used for local files and tests.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rp_core::ResourceSize;
use tokio_util::sync::CancellationToken;

use crate::{check_range, RangeResponse, RangeSource, SourceError};

/// Serves inclusive ranges out of a byte buffer.
///
/// Records every requested range, and can be told to fail or stall so that
/// callers can exercise their error and abort paths.
pub struct MemorySource {
    data: Bytes,
    cancel: CancellationToken,
    requests: Mutex<Vec<(u64, u64)>>,
    fail_after: Mutex<Option<usize>>,
    latency: Option<Duration>,
}

impl MemorySource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            cancel: CancellationToken::new(),
            requests: Mutex::new(Vec::new()),
            fail_after: Mutex::new(None),
            latency: None,
        }
    }

    /// Read a whole file into memory.
    pub async fn from_file(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let data = tokio::fs::read(path.as_ref()).await?;
        tracing::debug!(path = %path.as_ref().display(), bytes = data.len(), "Loaded file into memory");
        Ok(Self::new(data))
    }

    /// Delay every response by `latency`. Aborts still interrupt the wait.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Let the first `n` requests succeed; every later one fails with HTTP 503.
    pub fn fail_after(&self, n: usize) {
        *self.fail_after.lock() = Some(n);
    }

    /// Ranges requested so far, in order.
    pub fn requests(&self) -> Vec<(u64, u64)> {
        self.requests.lock().clone()
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    async fn serve(&self, start: u64, end: u64) -> Result<(Bytes, u64), SourceError> {
        check_range(start, end)?;
        if self.cancel.is_cancelled() {
            return Err(SourceError::Aborted { start, end });
        }

        let count = {
            let mut requests = self.requests.lock();
            requests.push((start, end));
            requests.len()
        };

        if let Some(latency) = self.latency {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(SourceError::Aborted { start, end }),
                _ = tokio::time::sleep(latency) => {}
            }
        }

        if matches!(*self.fail_after.lock(), Some(n) if count > n) {
            return Err(SourceError::Status {
                status: 503,
                start,
                end,
            });
        }

        let size = self.len();
        if start >= size {
            return Err(SourceError::InvalidRange {
                start,
                end,
                size: Some(size),
            });
        }
        let last = end.min(size - 1);
        Ok((self.data.slice(start as usize..=last as usize), last))
    }
}

#[async_trait]
impl RangeSource for MemorySource {
    async fn fetch_range(&self, start: u64, end: u64) -> Result<Bytes, SourceError> {
        Ok(self.serve(start, end).await?.0)
    }

    async fn fetch_range_with_size(
        &self,
        start: u64,
        end: u64,
    ) -> Result<RangeResponse, SourceError> {
        let (data, last) = self.serve(start, end).await?;
        let total = self.len();
        Ok(RangeResponse {
            data,
            total_size: ResourceSize(total),
            status: 206,
            content_range: Some(format!("bytes {start}-{last}/{total}")),
        })
    }

    fn abort(&self) {
        self.cancel.cancel();
    }
}
