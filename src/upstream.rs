//! Pooled upstream HTTP client.
//!
//! One [`UpstreamClient`] is built at startup and shared by every request.
//! It wraps a keep-alive `reqwest::Client` together with a semaphore that
//! caps the number of upstream requests in flight.  A permit is held until
//! the response body has been fully consumed, whether it was buffered or
//! streamed.  After [`UpstreamClient::shutdown`] every new call fails with
//! [`UpstreamError::NotReady`] instead of waiting.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::{HeaderMap, HeaderName, Method, StatusCode, header};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use crate::config::UpstreamConfig;

/// Headers that describe a single hop and must not be relayed.
const HOP_BY_HOP: [HeaderName; 6] = [
    header::CONNECTION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::PROXY_AUTHENTICATE,
];

/// Remove hop-by-hop headers in place.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove("keep-alive");
    headers.remove("proxy-connection");
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    /// The client has not been started yet or has been shut down.
    #[error("upstream client is not ready")]
    NotReady,
    /// No connection slot became free within the request timeout.
    #[error("timed out waiting for a free upstream connection to {url}")]
    PoolTimeout { url: String },
    /// Network, DNS, TLS, timeout or body-read failure.
    #[error("request to {url} failed")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

// ---------------------------------------------------------------------------
// Request / response
// ---------------------------------------------------------------------------

/// One outbound request derived from an inbound call.
#[derive(Debug, Clone)]
pub struct ProxiedRequest {
    pub method: Method,
    /// Target URL including the query string.
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl ProxiedRequest {
    /// Build a forwardable request from the inbound pieces.
    ///
    /// The `host` header and hop-by-hop headers are dropped.  The body is only
    /// kept for methods that carry one (`POST`, `PUT`, `PATCH`).
    pub fn from_inbound(method: Method, url: String, mut headers: HeaderMap, body: Bytes) -> Self {
        headers.remove(header::HOST);
        strip_hop_by_hop(&mut headers);
        let body = matches!(method, Method::POST | Method::PUT | Method::PATCH).then_some(body);
        Self {
            method,
            url,
            headers,
            body,
        }
    }
}

/// Response from upstream, holding its connection permit.
pub struct UpstreamResponse {
    url: String,
    inner: reqwest::Response,
    permit: OwnedSemaphorePermit,
}

impl UpstreamResponse {
    pub fn status(&self) -> StatusCode {
        self.inner.status()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    /// Read the full body into memory.
    pub async fn bytes(self) -> Result<Bytes, UpstreamError> {
        let Self { url, inner, permit } = self;
        let body = inner
            .bytes()
            .await
            .map_err(|source| UpstreamError::Transport { url, source })?;
        drop(permit);
        Ok(body)
    }

    /// Turn the body into a lazily produced chunk stream.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send {
        let Self { inner, permit, .. } = self;
        inner.bytes_stream().map(move |chunk| {
            let _held = &permit;
            chunk.map_err(std::io::Error::other)
        })
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct Pool {
    client: reqwest::Client,
    permits: Arc<Semaphore>,
}

pub struct UpstreamClient {
    settings: UpstreamConfig,
    pool: RwLock<Option<Pool>>,
}

impl UpstreamClient {
    /// Create a client that is not yet started.
    pub fn new(settings: UpstreamConfig) -> Self {
        Self {
            settings,
            pool: RwLock::new(None),
        }
    }

    /// Build the connection pool.  Calling `start` again replaces the pool.
    pub fn start(&self) -> Result<()> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.settings.timeout_secs))
            .connect_timeout(Duration::from_secs(self.settings.connect_timeout_secs))
            .pool_max_idle_per_host(self.settings.max_idle_connections)
            .redirect(reqwest::redirect::Policy::limited(self.settings.max_redirects))
            .build()
            .context("failed to build upstream HTTP client")?;

        let pool = Pool {
            client,
            permits: Arc::new(Semaphore::new(self.settings.max_connections)),
        };
        *self.pool.write().unwrap_or_else(PoisonError::into_inner) = Some(pool);

        info!(
            max_connections = self.settings.max_connections,
            max_idle_connections = self.settings.max_idle_connections,
            timeout_secs = self.settings.timeout_secs,
            "upstream client started"
        );
        Ok(())
    }

    /// Release the pool.  Requests already holding a response keep it; new
    /// calls fail fast.
    pub fn shutdown(&self) {
        let previous = self
            .pool
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pool) = previous {
            pool.permits.close();
            info!("upstream client shut down");
        }
    }

    pub fn is_ready(&self) -> bool {
        self.pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn current(&self) -> Result<Pool, UpstreamError> {
        self.pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(UpstreamError::NotReady)
    }

    /// Issue one request.  No retries are attempted.
    pub async fn send(&self, request: ProxiedRequest) -> Result<UpstreamResponse, UpstreamError> {
        let pool = self.current()?;
        let timeout = Duration::from_secs(self.settings.timeout_secs);

        let acquire = Arc::clone(&pool.permits).acquire_owned();
        let permit = match tokio::time::timeout(timeout, acquire).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_closed)) => return Err(UpstreamError::NotReady),
            Err(_elapsed) => {
                return Err(UpstreamError::PoolTimeout { url: request.url });
            }
        };

        let ProxiedRequest {
            method,
            url,
            headers,
            body,
        } = request;

        debug!(%method, %url, "sending upstream request");

        let mut builder = pool.client.request(method, url.as_str()).headers(headers);
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let inner = builder
            .send()
            .await
            .map_err(|source| UpstreamError::Transport {
                url: url.clone(),
                source,
            })?;

        debug!(status = %inner.status(), %url, "upstream responded");
        Ok(UpstreamResponse { url, inner, permit })
    }
}
