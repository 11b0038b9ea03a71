//! `GET <repo>.git`: serve a shallow checkout of the repository as a zip.
//!
//! Archives are cached under the key of the repository URL with a `.zip`
//! suffix.  On a miss one build per repository runs at a time; every caller
//! waiting on it is served the archive from the cache afterwards.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context as _;
use axum::{
    body::Body,
    http::{HeaderValue, header},
    response::Response,
};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, instrument, warn};

use super::classify::archive_filename;
use super::handler::AppError;
use crate::AppState;
use crate::cache::{CacheKey, EntryKind, Role};

pub type BuildResult = Result<(), Arc<AppError>>;

const ZIP_CONTENT_TYPE: &str = "application/zip";

#[instrument(skip(state))]
pub async fn serve_repository_archive(
    state: &Arc<AppState>,
    repo_url: &str,
) -> Result<Response, AppError> {
    let key = CacheKey::for_url(repo_url);
    let filename = archive_filename(repo_url);

    if let Some(response) = serve_archive(state, key, &filename).await? {
        debug!(%key, "archive cache hit");
        state.metrics.metrics.record_hit(EntryKind::Archive);
        return Ok(response);
    }
    state.metrics.metrics.record_miss(EntryKind::Archive);

    let build = {
        let state = Arc::clone(state);
        let repo_url = repo_url.to_string();
        move || build_and_store(state, key, repo_url)
    };
    let (outcome, role) = state.builds.run(key, build).await;
    if role == Role::Follower {
        state.metrics.metrics.coalesced_waiters.inc();
    }
    outcome
        .map_err(|e| AppError::Internal(e.into()))?
        .map_err(AppError::Shared)?;

    serve_archive(state, key, &filename).await?.ok_or_else(|| {
        AppError::Internal(anyhow::anyhow!(
            "archive {key} missing from cache after build"
        ))
    })
}

/// Clone, package and move the archive into the cache.
async fn build_and_store(state: Arc<AppState>, key: CacheKey, repo_url: String) -> BuildResult {
    if state.cache.exists(key, EntryKind::Archive).await {
        return Ok(());
    }

    let started = Instant::now();
    let built = state.archiver.build(&repo_url).await;
    state
        .metrics
        .metrics
        .record_build(built.is_ok(), started.elapsed().as_secs_f64());
    let archive = built.map_err(|e| Arc::new(AppError::Archive(e)))?;

    match state.cache.ingest(key, EntryKind::Archive, &archive).await {
        Ok(path) => {
            info!(%key, %repo_url, path = %path.display(), "repository archive cached");
            Ok(())
        }
        Err(e) => {
            if let Err(remove) = tokio::fs::remove_file(&archive).await {
                warn!(error = %remove, path = %archive.display(), "failed to remove archive");
            }
            Err(Arc::new(AppError::Internal(e)))
        }
    }
}

/// Stream the cached archive for `key` as an attachment.
async fn serve_archive(
    state: &AppState,
    key: CacheKey,
    filename: &str,
) -> Result<Option<Response>, AppError> {
    let Some(cached) = state.cache.open(key, EntryKind::Archive).await? else {
        return Ok(None);
    };

    let disposition = HeaderValue::try_from(format!("attachment; filename=\"{filename}\""))
        .context("invalid archive file name")?;

    let mut response = Response::new(Body::from_stream(ReaderStream::new(cached.file)));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(ZIP_CONTENT_TYPE));
    headers.insert(header::CONTENT_DISPOSITION, disposition);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(cached.len));
    Ok(Some(response))
}
