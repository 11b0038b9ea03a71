//! On-disk cache store.
//!
//! Layout: `{root}/{key}` for response bodies and `{root}/{key}.zip` for
//! repository archives.  Writes land in a uniquely named temporary file
//! inside `root` and are renamed over the final path, so a reader either sees
//! a complete entry or none at all.  Two writers racing on the same key both
//! produce identical content, so whichever rename happens last wins.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bytes::Bytes;
use tracing::{debug, warn};

use super::CacheKey;

// ---------------------------------------------------------------------------
// Entry kinds
// ---------------------------------------------------------------------------

/// The two classes of entry stored per key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// Raw bytes of an upstream response body.
    Body,
    /// Packaged repository checkout.
    Archive,
}

impl EntryKind {
    /// File-name suffix appended to the key.
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Body => "",
            Self::Archive => ".zip",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Body => "body",
            Self::Archive => "archive",
        }
    }
}

/// An open cache entry ready to be streamed.
#[derive(Debug)]
pub struct CachedFile {
    pub file: tokio::fs::File,
    pub len: u64,
}

// ---------------------------------------------------------------------------
// CacheStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the entry for `key` of the given kind.
    pub fn entry_path(&self, key: CacheKey, kind: EntryKind) -> PathBuf {
        self.root.join(format!("{}{}", key.to_hex(), kind.suffix()))
    }

    /// Create the cache root if it does not exist yet.
    pub async fn ensure_root(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("failed to create cache dir: {}", self.root.display()))
    }

    pub async fn exists(&self, key: CacheKey, kind: EntryKind) -> bool {
        tokio::fs::metadata(self.entry_path(key, kind))
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    /// Open an entry for streaming.  Returns `None` on a miss.
    pub async fn open(&self, key: CacheKey, kind: EntryKind) -> Result<Option<CachedFile>> {
        let path = self.entry_path(key, kind);
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("open cache entry {}", path.display()));
            }
        };
        let len = file
            .metadata()
            .await
            .with_context(|| format!("stat cache entry {}", path.display()))?
            .len();
        Ok(Some(CachedFile { file, len }))
    }

    /// Store `body` under `key`, returning the final entry path.
    pub async fn write(&self, key: CacheKey, kind: EntryKind, body: Bytes) -> Result<PathBuf> {
        let root = self.root.clone();
        let dest = self.entry_path(key, kind);

        let path = tokio::task::spawn_blocking(move || {
            write_atomically(&root, &dest, |file| file.write_all(&body))?;
            Ok::<_, anyhow::Error>(dest)
        })
        .await
        .context("cache write task failed")??;

        debug!(path = %path.display(), kind = kind.label(), "cache entry written");
        Ok(path)
    }

    /// Move an already-built file (e.g. a freshly packaged archive) into the
    /// cache under `key`.  Falls back to copy + rename when `src` lives on a
    /// different filesystem.
    pub async fn ingest(&self, key: CacheKey, kind: EntryKind, src: &Path) -> Result<PathBuf> {
        self.ensure_root().await?;
        let dest = self.entry_path(key, kind);

        if tokio::fs::rename(src, &dest).await.is_ok() {
            debug!(dest = %dest.display(), kind = kind.label(), "cache entry ingested");
            return Ok(dest);
        }

        let root = self.root.clone();
        let src_owned = src.to_path_buf();
        let dest_owned = dest.clone();
        tokio::task::spawn_blocking(move || {
            let mut input = File::open(&src_owned)
                .with_context(|| format!("open {} for ingest", src_owned.display()))?;
            write_atomically(&root, &dest_owned, |file| {
                std::io::copy(&mut input, file).map(|_| ())
            })
        })
        .await
        .context("cache ingest task failed")??;

        if let Err(e) = tokio::fs::remove_file(src).await {
            warn!(error = %e, path = %src.display(), "failed to remove ingested source file");
        }
        debug!(dest = %dest.display(), kind = kind.label(), "cache entry ingested by copy");
        Ok(dest)
    }
}

/// Fill a temporary file in `root` and rename it over `dest`.
fn write_atomically<F>(root: &Path, dest: &Path, fill: F) -> Result<()>
where
    F: FnOnce(&mut File) -> std::io::Result<()>,
{
    std::fs::create_dir_all(root)
        .with_context(|| format!("failed to create cache dir: {}", root.display()))?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".incoming-")
        .tempfile_in(root)
        .with_context(|| format!("create temp file in {}", root.display()))?;
    fill(tmp.as_file_mut()).context("write cache temp file")?;
    tmp.as_file_mut().flush().context("flush cache temp file")?;

    tmp.persist(dest)
        .map_err(|e| e.error)
        .with_context(|| format!("rename temp file to {}", dest.display()))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
