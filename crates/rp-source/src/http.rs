//! HTTP range client.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::StatusCode;
use rp_core::config::SourceConfig;
use rp_core::ResourceSize;
use tokio_util::sync::CancellationToken;

use crate::{check_range, parse_content_range, RangeResponse, RangeSource, SourceError};

/// Reads byte ranges of one URL with HTTP `Range` requests.
pub struct HttpRangeSource {
    http: reqwest::Client,
    url: String,
    cancel: CancellationToken,
}

impl HttpRangeSource {
    /// Build a source for `url` using the timeout and user agent from `config`.
    pub fn new(url: impl Into<String>, config: &SourceConfig) -> Result<Self, SourceError> {
        let mut builder = reqwest::Client::builder();
        if config.request_timeout_secs > 0 {
            builder = builder.timeout(Duration::from_secs(config.request_timeout_secs));
        }
        if let Some(agent) = &config.user_agent {
            builder = builder.user_agent(agent.clone());
        }
        let http = builder.build().map_err(|e| SourceError::Transport {
            start: 0,
            end: 0,
            source: Box::new(e),
        })?;
        Ok(Self::with_client(http, url))
    }

    /// Build a source around an existing client.
    pub fn with_client(http: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Send the request and read the body, racing both against abort.
    async fn request(&self, start: u64, end: u64) -> Result<RawResponse, SourceError> {
        check_range(start, end)?;
        if self.cancel.is_cancelled() {
            return Err(SourceError::Aborted { start, end });
        }

        tracing::debug!(url = %self.url, start, end, "Range request");
        let send = self
            .http
            .get(&self.url)
            .header(RANGE, format!("bytes={start}-{end}"))
            .send();

        let resp = tokio::select! {
            _ = self.cancel.cancelled() => return Err(SourceError::Aborted { start, end }),
            resp = send => resp.map_err(|e| SourceError::Transport { start, end, source: Box::new(e) })?,
        };

        let status = resp.status();
        if !status.is_success() {
            return Err(SourceError::Status {
                status: status.as_u16(),
                start,
                end,
            });
        }

        let content_range = resp
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let content_length = resp.content_length();

        let body = tokio::select! {
            _ = self.cancel.cancelled() => return Err(SourceError::Aborted { start, end }),
            body = resp.bytes() => body.map_err(|e| SourceError::Transport { start, end, source: Box::new(e) })?,
        };

        // A server that ignores Range answers 200 with the whole resource.
        let data = if status == StatusCode::OK {
            slice_full_body(body, start, end)?
        } else {
            body
        };

        Ok(RawResponse {
            data,
            status: status.as_u16(),
            content_range,
            content_length,
        })
    }
}

struct RawResponse {
    data: Bytes,
    status: u16,
    content_range: Option<String>,
    content_length: Option<u64>,
}

fn slice_full_body(body: Bytes, start: u64, end: u64) -> Result<Bytes, SourceError> {
    let len = body.len() as u64;
    if start >= len {
        return Err(SourceError::InvalidRange {
            start,
            end,
            size: Some(len),
        });
    }
    let last = end.min(len - 1);
    Ok(body.slice(start as usize..=last as usize))
}

#[async_trait]
impl RangeSource for HttpRangeSource {
    async fn fetch_range(&self, start: u64, end: u64) -> Result<Bytes, SourceError> {
        Ok(self.request(start, end).await?.data)
    }

    async fn fetch_range_with_size(
        &self,
        start: u64,
        end: u64,
    ) -> Result<RangeResponse, SourceError> {
        let raw = self.request(start, end).await?;

        let total = match &raw.content_range {
            Some(value) => parse_content_range(value).and_then(|cr| cr.total),
            // Without Content-Range only a full 200 body tells the size.
            None if raw.status == StatusCode::OK.as_u16() => raw.content_length,
            None => None,
        };
        let Some(total) = total else {
            return Err(SourceError::MissingTotalSize {
                start,
                end,
                header: raw.content_range,
            });
        };

        Ok(RangeResponse {
            data: raw.data,
            total_size: ResourceSize(total),
            status: raw.status,
            content_range: raw.content_range,
        })
    }

    fn abort(&self) {
        if !self.cancel.is_cancelled() {
            tracing::info!(url = %self.url, "Aborting range requests");
        }
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn body(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn source_for(server: &MockServer) -> HttpRangeSource {
        HttpRangeSource::new(format!("{}/video.mp4", server.uri()), &SourceConfig::default())
            .unwrap()
    }

    #[tokio::test]
    async fn sends_range_header_and_reads_total() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/video.mp4"))
            .and(header("range", "bytes=0-1023"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("content-range", "bytes 0-1023/5000")
                    .set_body_bytes(body(1024)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let source = source_for(&server).await;
        let resp = source.fetch_range_with_size(0, 1023).await.unwrap();
        assert_eq!(resp.total_size, ResourceSize(5000));
        assert_eq!(resp.status, 206);
        assert_eq!(resp.data.len(), 1024);
        assert_eq!(resp.content_range.as_deref(), Some("bytes 0-1023/5000"));
    }

    #[tokio::test]
    async fn non_success_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let source = source_for(&server).await;
        let err = source.fetch_range(100, 199).await.unwrap_err();
        assert!(matches!(
            err,
            SourceError::Status {
                status: 404,
                start: 100,
                end: 199
            }
        ));
        let core: rp_core::Error = err.into();
        assert_eq!(core.kind(), rp_core::ErrorKind::SourceLoadFailure);
    }

    #[tokio::test]
    async fn unknown_total_is_missing_size() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("content-range", "bytes 0-9/*")
                    .set_body_bytes(body(10)),
            )
            .mount(&server)
            .await;

        let source = source_for(&server).await;
        let err = source.fetch_range_with_size(0, 9).await.unwrap_err();
        assert!(matches!(err, SourceError::MissingTotalSize { .. }));
    }

    #[tokio::test]
    async fn full_body_answer_is_sliced() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body(300)))
            .mount(&server)
            .await;

        let source = source_for(&server).await;
        let resp = source.fetch_range_with_size(100, 109).await.unwrap();
        assert_eq!(resp.total_size, ResourceSize(300));
        assert_eq!(&resp.data[..], &body(300)[100..110]);
    }

    #[tokio::test]
    async fn abort_cancels_in_flight_and_later_requests() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("content-range", "bytes 0-9/10")
                    .set_body_bytes(body(10))
                    .set_delay(Duration::from_secs(10)),
            )
            .mount(&server)
            .await;

        let source = Arc::new(source_for(&server).await);
        let pending = {
            let source = source.clone();
            tokio::spawn(async move { source.fetch_range(0, 9).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        source.abort();

        let err = pending.await.unwrap().unwrap_err();
        assert!(err.is_aborted());
        assert!(source.fetch_range(0, 9).await.unwrap_err().is_aborted());
    }

    #[tokio::test]
    async fn inverted_range_fails_without_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(206))
            .expect(0)
            .mount(&server)
            .await;

        let source = source_for(&server).await;
        let err = source.fetch_range(10, 5).await.unwrap_err();
        assert!(matches!(err, SourceError::InvalidRange { .. }));
    }
}
