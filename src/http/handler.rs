//! Main axum router and HTTP request handlers.
//!
//! Routes:
//! - `GET  /`             - Status greeting (JSON, or `index.html` for browsers)
//! - `GET  /favicon.ico`  - Static favicon
//! - `GET  /static/*`     - Static assets, when the directory exists
//! - `ANY  /{*target}`    - Forward to `target`, caching where possible
//!
//! Metrics are served from a separate router, see [`create_metrics_router`].

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, Method, StatusCode, Uri, header},
    response::{Html, IntoResponse, Response},
    routing::{MethodFilter, get, on},
};
use serde_json::json;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, instrument, warn};

use super::classify::{RequestClass, Target, classify};
use super::{clone, proxy};
use crate::AppState;
use crate::git::ArchiveError;
use crate::metrics::MetricsRegistry;
use crate::upstream::{ProxiedRequest, UpstreamError};

const ROOT_MESSAGE: &str = "gitaccel proxy is running";

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the public axum [`Router`].
pub fn create_router(state: Arc<AppState>) -> Router {
    let proxied = MethodFilter::GET
        .or(MethodFilter::POST)
        .or(MethodFilter::PUT)
        .or(MethodFilter::DELETE)
        .or(MethodFilter::HEAD)
        .or(MethodFilter::OPTIONS)
        .or(MethodFilter::PATCH);

    let mut router = Router::new()
        .route("/", get(handle_root))
        .route("/favicon.ico", get(handle_favicon))
        .route("/{*target}", on(proxied, handle_proxy));

    let static_dir = &state.config.storage.static_dir;
    if static_dir.is_dir() {
        router = router.nest_service("/static", ServeDir::new(static_dir));
    }

    router
        .layer(DefaultBodyLimit::disable())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Router for the metrics listener.
pub fn create_metrics_router(metrics: MetricsRegistry) -> Router {
    Router::new()
        .route("/metrics", get(handle_metrics))
        .with_state(metrics)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /`
async fn handle_root(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let wants_html = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("text/html"));

    if wants_html {
        let index = state.config.storage.static_dir.join("index.html");
        match tokio::fs::read(&index).await {
            Ok(html) => return Html(html).into_response(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, path = %index.display(), "failed to read index page"),
        }
    }

    Json(json!({ "message": ROOT_MESSAGE })).into_response()
}

/// `GET /favicon.ico`
async fn handle_favicon(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let path = state.config.storage.static_dir.join("favicon.ico");
    match tokio::fs::read(&path).await {
        Ok(icon) => Ok(([(header::CONTENT_TYPE, "image/x-icon")], icon).into_response()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(AppError::NotFound),
        Err(e) => Err(AppError::Internal(
            anyhow::Error::new(e).context(format!("failed to read {}", path.display())),
        )),
    }
}

/// `ANY /{*target}`
///
/// Classifies the request and dispatches it to the archive, git protocol or
/// plain forwarding path.
#[instrument(skip_all, fields(%method, url = tracing::field::Empty))]
async fn handle_proxy(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    if !state.upstream.is_ready() {
        return Err(AppError::NotReady);
    }

    let target = Target::from_uri(&uri);
    tracing::Span::current().record("url", target.full.as_str());

    let class = classify(&target.url, &method);
    state.metrics.metrics.record_request(class);

    match class {
        RequestClass::GitClone => clone::serve_repository_archive(&state, &target.url).await,
        RequestClass::GitProtocol => {
            let mut request = ProxiedRequest::from_inbound(method, target.full, headers, body);
            proxy::prepare_git_headers(&mut request.headers);
            proxy::forward(&state, request).await
        }
        RequestClass::Plain => {
            let cacheable = method == Method::GET;
            let request = ProxiedRequest::from_inbound(method, target.full, headers, body);
            if cacheable {
                proxy::serve_cacheable(&state, request).await
            } else {
                proxy::forward(&state, request).await
            }
        }
    }
}

/// `GET /metrics`
///
/// Returns Prometheus metrics collected by the proxy.
async fn handle_metrics(State(metrics): State<MetricsRegistry>) -> Result<Response, AppError> {
    let buf = metrics.encode()?;
    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTTP responses.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// The upstream client has not been started or is shutting down.
    #[error("upstream client is not ready")]
    NotReady,
    /// Upstream could not be reached.
    #[error(transparent)]
    Upstream(UpstreamError),
    /// Cloning or packaging a repository failed.
    #[error("could not build archive for this repository: {0}")]
    Archive(#[from] ArchiveError),
    #[error("not found")]
    NotFound,
    /// An unexpected internal error.
    #[error("{0:#}")]
    Internal(anyhow::Error),
    /// An error produced by a coalesced operation and shared by its waiters.
    #[error("{0}")]
    Shared(Arc<AppError>),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::NotReady => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Upstream(_) => StatusCode::BAD_GATEWAY,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Archive(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Shared(inner) => inner.status(),
        }
    }

    /// Message with the full cause chain.
    fn detail(&self) -> String {
        match self {
            AppError::Upstream(err) => error_chain(err),
            AppError::Shared(inner) => inner.detail(),
            other => other.to_string(),
        }
    }
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let detail = self.detail();
        if status.is_server_error() {
            error!(%status, error = %detail, "request failed");
        }
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

impl From<UpstreamError> for AppError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::NotReady => AppError::NotReady,
            other => AppError::Upstream(other),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
