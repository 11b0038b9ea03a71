//! Forwarding to upstream and the plain `GET` cache path.
//!
//! A cacheable `GET` is looked up in the cache first.  On a miss, one fetch per
//! key runs at a time (see [`Coalescer`](crate::cache::Coalescer)): a 200
//! response is buffered, written to the cache, and handed to every waiter.
//! Anything else is relayed as a stream and never stored.

use std::sync::Arc;

use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::Response,
};
use bytes::Bytes;
use tokio::sync::oneshot;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, instrument};

use super::handler::AppError;
use crate::AppState;
use crate::cache::{CacheKey, EntryKind, Role};
use crate::upstream::{ProxiedRequest, UpstreamError, UpstreamResponse, strip_hop_by_hop};

const GIT_PROTOCOL: HeaderName = HeaderName::from_static("git-protocol");
const GIT_PROTOCOL_VERSION: &str = "version=2";
const GIT_USER_AGENT: &str = "git/2.0.0";

// ---------------------------------------------------------------------------
// Shared fetch results
// ---------------------------------------------------------------------------

/// A fully read 200 response, as stored in the cache.
#[derive(Debug)]
pub struct BufferedResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl BufferedResponse {
    fn to_response(&self) -> Response {
        let mut response = Response::new(Body::from(self.body.clone()));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers.clone();
        response
    }
}

/// What a coalesced fetch produced.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// The entry was already cached by the time the fetch started.
    Hit,
    /// Upstream answered 200 and the body is now cached.
    Stored(Arc<BufferedResponse>),
    /// Upstream answered something other than 200.  Only the caller that
    /// performed the fetch receives that response.
    Uncacheable,
}

pub type FetchResult = Result<FetchOutcome, Arc<AppError>>;

// ---------------------------------------------------------------------------
// Git protocol shaping
// ---------------------------------------------------------------------------

/// Headers for a smart-HTTP exchange.
///
/// Adds protocol v2 and a git user agent unless the client sent its own, and
/// drops `content-length` since the body is re-streamed.
pub fn prepare_git_headers(headers: &mut HeaderMap) {
    if !headers.contains_key(&GIT_PROTOCOL) {
        headers.insert(GIT_PROTOCOL, HeaderValue::from_static(GIT_PROTOCOL_VERSION));
    }
    if !headers.contains_key(header::USER_AGENT) {
        headers.insert(header::USER_AGENT, HeaderValue::from_static(GIT_USER_AGENT));
    }
    headers.remove(header::CONTENT_LENGTH);
}

// ---------------------------------------------------------------------------
// Forwarding
// ---------------------------------------------------------------------------

/// Forward `request` and relay the response as a stream.  Nothing is cached.
#[instrument(skip_all, fields(method = %request.method, url = %request.url))]
pub async fn forward(state: &AppState, request: ProxiedRequest) -> Result<Response, AppError> {
    let upstream = send(state, request).await?;
    Ok(stream_response(upstream))
}

async fn send(state: &AppState, request: ProxiedRequest) -> Result<UpstreamResponse, AppError> {
    state.upstream.send(request).await.map_err(|e| {
        if !matches!(e, UpstreamError::NotReady) {
            state.metrics.metrics.upstream_errors.inc();
        }
        AppError::from(e)
    })
}

fn stream_response(upstream: UpstreamResponse) -> Response {
    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    strip_hop_by_hop(&mut headers);

    let mut response = Response::new(Body::from_stream(upstream.into_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

// ---------------------------------------------------------------------------
// Cacheable GET
// ---------------------------------------------------------------------------

/// Serve a plain `GET`, from the cache when possible.
#[instrument(skip_all, fields(url = %request.url))]
pub async fn serve_cacheable(
    state: &Arc<AppState>,
    mut request: ProxiedRequest,
) -> Result<Response, AppError> {
    let key = CacheKey::for_url(&request.url);

    if let Some(response) = serve_cached_body(state, key).await? {
        debug!(%key, "cache hit");
        state.metrics.metrics.record_hit(EntryKind::Body);
        return Ok(response);
    }
    state.metrics.metrics.record_miss(EntryKind::Body);

    // Cached bodies are replayed without any encoding header.
    request.headers.remove(header::ACCEPT_ENCODING);
    let fallback = request.clone();

    let (tx, mut rx) = oneshot::channel();
    let fetch = {
        let state = Arc::clone(state);
        move || fetch_and_store(state, key, request, tx)
    };
    let (outcome, role) = state.fetches.run(key, fetch).await;
    if role == Role::Follower {
        state.metrics.metrics.coalesced_waiters.inc();
    }

    let outcome = outcome.map_err(|e| AppError::Internal(e.into()))?;
    match outcome.map_err(AppError::Shared)? {
        FetchOutcome::Hit => serve_cached_body(state, key).await?.ok_or_else(|| {
            AppError::Internal(anyhow::anyhow!("cache entry {key} disappeared"))
        }),
        FetchOutcome::Stored(buffered) => Ok(buffered.to_response()),
        FetchOutcome::Uncacheable => match rx.try_recv() {
            Ok(upstream) => Ok(stream_response(upstream)),
            Err(_) => forward(state, fallback).await,
        },
    }
}

/// The shared part of a cache miss.  Runs once per key at a time.
async fn fetch_and_store(
    state: Arc<AppState>,
    key: CacheKey,
    request: ProxiedRequest,
    tx: oneshot::Sender<UpstreamResponse>,
) -> FetchResult {
    if state.cache.exists(key, EntryKind::Body).await {
        return Ok(FetchOutcome::Hit);
    }

    let upstream = send(&state, request).await.map_err(Arc::new)?;
    let status = upstream.status();
    if status != StatusCode::OK {
        debug!(%key, %status, "not caching non-200 response");
        // The leader may already be gone; its followers forward on their own.
        let _ = tx.send(upstream);
        return Ok(FetchOutcome::Uncacheable);
    }

    let mut headers = upstream.headers().clone();
    strip_hop_by_hop(&mut headers);
    headers.remove(header::CONTENT_LENGTH);

    let body = upstream
        .bytes()
        .await
        .map_err(|e| Arc::new(AppError::from(e)))?;
    let path = state
        .cache
        .write(key, EntryKind::Body, body.clone())
        .await
        .map_err(|e| Arc::new(AppError::Internal(e)))?;

    info!(%key, bytes = body.len(), path = %path.display(), "response cached");
    Ok(FetchOutcome::Stored(Arc::new(BufferedResponse {
        status,
        headers,
        body,
    })))
}

/// Stream a cached body.  No content type is sent; the client decides.
async fn serve_cached_body(state: &AppState, key: CacheKey) -> Result<Option<Response>, AppError> {
    let Some(cached) = state.cache.open(key, EntryKind::Body).await? else {
        return Ok(None);
    };

    let mut response = Response::new(Body::from_stream(ReaderStream::new(cached.file)));
    response
        .headers_mut()
        .insert(header::CONTENT_LENGTH, HeaderValue::from(cached.len));
    Ok(Some(response))
}
