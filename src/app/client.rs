//! HTTP transfer client with range-request support
//!
//! The chunk scheduler depends only on the [`TransferClient`] trait, so the
//! whole transfer layer can be swapped for an in-memory implementation in
//! tests. The production implementation wraps `reqwest` with the connection
//! pool and timeout settings tuned for long-running large-artifact fetches.
//!
//! Retry policy deliberately does NOT live here: per-chunk retries with
//! backoff belong to the scheduler, and stacking a second retry loop inside
//! the client would multiply the effective budget.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, RANGE};
use reqwest::{Client, StatusCode};
use url::Url;

use crate::constants::http;
use crate::errors::{TransferError, TransferResult};

/// An inclusive byte range for an HTTP `Range` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// First byte requested
    pub start: u64,
    /// Last byte requested (inclusive, HTTP convention)
    pub end: u64,
}

impl ByteRange {
    /// Build the `bytes=start-end` header value
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }

    /// Number of bytes covered
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Always false; ranges are constructed non-empty
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Source capabilities discovered by the pre-scheduling probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceInfo {
    /// Whether the source honors byte-range requests
    pub accepts_ranges: bool,
    /// Content length reported by the source, if any
    pub content_length: Option<u64>,
}

/// Stream of payload frames from a transfer
pub type ByteStream = Pin<Box<dyn Stream<Item = TransferResult<Bytes>> + Send>>;

/// Abstraction over a range-capable transfer source
///
/// Implementations must be cheap to clone behind an `Arc`; one instance is
/// shared by every chunk worker of every session.
#[async_trait]
pub trait TransferClient: Send + Sync {
    /// Probe the source for range support and size before scheduling
    async fn probe(&self, url: &Url) -> TransferResult<SourceInfo>;

    /// Fetch the artifact, optionally limited to a byte range
    ///
    /// When `range` is `Some`, the source must answer `206 Partial Content`;
    /// a `200` full-body answer means the source dropped range support and
    /// is reported as [`TransferError::RangeNotHonored`].
    async fn fetch(&self, url: &Url, range: Option<ByteRange>) -> TransferResult<ByteStream>;
}

/// Configuration for the HTTP transfer client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Request timeout for a single fetch
    pub request_timeout: Duration,
    /// Connection establishment timeout
    pub connect_timeout: Duration,
    /// Connection pool idle timeout
    pub pool_idle_timeout: Duration,
    /// Maximum connections per host
    pub pool_max_per_host: usize,
    /// User agent for all requests
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: http::DEFAULT_TIMEOUT,
            connect_timeout: http::CONNECT_TIMEOUT,
            pool_idle_timeout: http::POOL_IDLE_TIMEOUT,
            pool_max_per_host: http::POOL_MAX_PER_HOST,
            user_agent: http::USER_AGENT.to_string(),
        }
    }
}

/// Production transfer client backed by `reqwest`
#[derive(Debug)]
pub struct HttpTransferClient {
    client: Client,
}

impl HttpTransferClient {
    /// Create a client with default configuration
    pub fn new() -> TransferResult<Self> {
        Self::with_config(ClientConfig::default())
    }

    /// Create a client with custom configuration
    pub fn with_config(config: ClientConfig) -> TransferResult<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(config.pool_idle_timeout)
            .pool_max_idle_per_host(config.pool_max_per_host)
            .build()
            .map_err(TransferError::Http)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl TransferClient for HttpTransferClient {
    async fn probe(&self, url: &Url) -> TransferResult<SourceInfo> {
        // HEAD first; some object stores only advertise ranges on GET, so an
        // inconclusive HEAD falls through to a one-byte range GET.
        let head = self.client.head(url.as_str()).send().await;

        if let Ok(response) = head {
            if response.status().is_success() {
                let accepts_ranges = response
                    .headers()
                    .get(ACCEPT_RANGES)
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v.eq_ignore_ascii_case("bytes"))
                    .unwrap_or(false);
                let content_length = response
                    .headers()
                    .get(CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok());

                if accepts_ranges {
                    return Ok(SourceInfo {
                        accepts_ranges: true,
                        content_length,
                    });
                }
            }
        }

        // Range GET probe: a 206 answer proves range support
        let response = self
            .client
            .get(url.as_str())
            .header(RANGE, "bytes=0-0")
            .send()
            .await
            .map_err(TransferError::Http)?;

        match response.status() {
            StatusCode::PARTIAL_CONTENT => {
                // Total size rides in Content-Range: bytes 0-0/<total>
                let content_length = response
                    .headers()
                    .get(reqwest::header::CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.rsplit('/').next())
                    .and_then(|v| v.parse::<u64>().ok());
                Ok(SourceInfo {
                    accepts_ranges: true,
                    content_length,
                })
            }
            status if status.is_success() => {
                let content_length = response
                    .headers()
                    .get(CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok());
                Ok(SourceInfo {
                    accepts_ranges: false,
                    content_length,
                })
            }
            status => Err(TransferError::ServerError {
                status: status.as_u16(),
            }),
        }
    }

    async fn fetch(&self, url: &Url, range: Option<ByteRange>) -> TransferResult<ByteStream> {
        let mut request = self.client.get(url.as_str());
        if let Some(range) = range {
            request = request.header(RANGE, range.header_value());
        }

        let response = request.send().await.map_err(TransferError::Http)?;
        let status = response.status();

        if !status.is_success() {
            return Err(TransferError::ServerError {
                status: status.as_u16(),
            });
        }
        if range.is_some() && status != StatusCode::PARTIAL_CONTENT {
            // Server answered a range request with the full body
            return Err(TransferError::RangeNotHonored);
        }

        let stream = response
            .bytes_stream()
            .map(|frame| frame.map_err(TransferError::Http));
        Ok(Box::pin(stream))
    }
}
