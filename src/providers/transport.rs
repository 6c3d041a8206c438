//! Outbound HTTP execution for provider calls.

use super::error::ProviderError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{Stream, TryStreamExt};
use pin_project::pin_project;
use reqwest::header::HeaderMap;
use reqwest::Method;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Instant, Sleep};
use tracing::debug;
use url::Url;

/// Streamed response body
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ProviderError>> + Send>>;

/// A fully-formed outbound request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: serde_json::Value,
}

/// Buffered response: status plus complete body
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub body: Bytes,
}

impl RawResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turn a non-2xx response into an API error carrying the body text
    pub fn into_error(self) -> ProviderError {
        ProviderError::ApiError {
            status: self.status,
            message: String::from_utf8_lossy(&self.body).into_owned(),
        }
    }
}

/// Timeouts for outbound calls
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransportConfig {
    pub connect_timeout: Duration,
    /// Minimum bytes that must arrive within each `low_speed_window`
    pub low_speed_limit_bytes: u64,
    pub low_speed_window: Duration,
    /// Total deadline for buffered calls; streams have none
    pub buffered_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            low_speed_limit_bytes: 1,
            low_speed_window: Duration::from_secs(120),
            buffered_timeout: Duration::from_secs(300),
        }
    }
}

/// Executes one outbound request, buffered or streamed.
///
/// Dropping a returned [`ByteStream`] closes the backend connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform the call and collect the whole body
    async fn execute(&self, request: &HttpRequest) -> Result<RawResponse, ProviderError>;

    /// Perform the call and hand back the body as it arrives.
    /// Non-2xx statuses are returned as `ProviderError::ApiError`.
    async fn open_stream(&self, request: &HttpRequest) -> Result<ByteStream, ProviderError>;
}

/// reqwest-backed transport
pub struct HttpTransport {
    client: reqwest::Client,
    config: TransportConfig,
}

impl HttpTransport {
    pub fn new(config: TransportConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    fn builder(&self, request: &HttpRequest) -> reqwest::RequestBuilder {
        self.client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone())
            .json(&request.body)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, request: &HttpRequest) -> Result<RawResponse, ProviderError> {
        debug!("📤 {} {} (buffered)", request.method, redact(&request.url));

        let response = self
            .builder(request)
            .timeout(self.config.buffered_timeout)
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.bytes().await?;

        Ok(RawResponse { status, body })
    }

    async fn open_stream(&self, request: &HttpRequest) -> Result<ByteStream, ProviderError> {
        debug!("📤 {} {} (streaming)", request.method, redact(&request.url));

        let response = self.builder(request).send().await?;
        let status = response.status();

        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        let stream = response.bytes_stream().map_err(ProviderError::HttpError);
        Ok(Box::pin(ThroughputGuard::new(
            stream,
            self.config.low_speed_limit_bytes,
            self.config.low_speed_window,
        )))
    }
}

/// URL without its query string, which may carry a credential
fn redact(url: &Url) -> String {
    let mut shown = url.clone();
    if shown.query().is_some() {
        shown.set_query(Some("…"));
    }
    shown.to_string()
}

/// Aborts a byte stream that delivers fewer than `min_bytes` within a
/// window. Slow streams survive; silent ones are cut off.
#[pin_project]
pub struct ThroughputGuard<S> {
    #[pin]
    inner: S,
    #[pin]
    deadline: Sleep,
    window: Duration,
    min_bytes: u64,
    window_bytes: u64,
    tripped: bool,
}

impl<S> ThroughputGuard<S> {
    pub fn new(inner: S, min_bytes: u64, window: Duration) -> Self {
        Self {
            inner,
            deadline: tokio::time::sleep(window),
            window,
            min_bytes,
            window_bytes: 0,
            tripped: false,
        }
    }
}

impl<S> Stream for ThroughputGuard<S>
where
    S: Stream<Item = Result<Bytes, ProviderError>>,
{
    type Item = Result<Bytes, ProviderError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        if *this.tripped {
            return Poll::Ready(None);
        }

        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(bytes))) => {
                *this.window_bytes += bytes.len() as u64;
                return Poll::Ready(Some(Ok(bytes)));
            }
            Poll::Ready(other) => return Poll::Ready(other),
            Poll::Pending => {}
        }

        while this.deadline.as_mut().poll(cx).is_ready() {
            if *this.window_bytes < *this.min_bytes {
                *this.tripped = true;
                return Poll::Ready(Some(Err(ProviderError::Stalled {
                    window: *this.window,
                })));
            }
            *this.window_bytes = 0;
            let next = Instant::now() + *this.window;
            this.deadline.as_mut().reset(next);
        }

        Poll::Pending
    }
}
