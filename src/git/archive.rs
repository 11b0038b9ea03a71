//! Repository archive builder.
//!
//! A build clones the repository (depth-limited) into a fresh scratch
//! directory, zips the checkout into `<scratch>.zip` right next to it, and
//! removes the scratch directory.  The archive outlives the build and is
//! handed to the caller, normally to be moved into the cache.  The scratch
//! directory is removed on every path out of [`ArchiveBuilder::build`].

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tempfile::TempDir;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::commands::git_clone_shallow;
use crate::config::GitConfig;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("failed to prepare clone workspace: {0}")]
    Workspace(#[source] std::io::Error),
    #[error("{0:#}")]
    Clone(anyhow::Error),
    #[error("failed to package repository: {0:#}")]
    Packaging(anyhow::Error),
    #[error("archive not found after packaging: {}", .0.display())]
    Missing(PathBuf),
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ArchiveBuilder {
    git: String,
    depth: u32,
    scratch_dir: PathBuf,
    /// Bounds the number of clones running at once.
    permits: Arc<Semaphore>,
}

impl ArchiveBuilder {
    pub fn new(config: &GitConfig, scratch_dir: Option<&Path>) -> Self {
        Self {
            git: config.binary.clone(),
            depth: config.clone_depth,
            scratch_dir: scratch_dir
                .map(Path::to_path_buf)
                .unwrap_or_else(std::env::temp_dir),
            permits: Arc::new(Semaphore::new(config.max_concurrent_clones)),
        }
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// Clone `repo_url` and package it.  Returns the path of the archive.
    #[instrument(skip(self), fields(%repo_url))]
    pub async fn build(&self, repo_url: &str) -> Result<PathBuf, ArchiveError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| ArchiveError::Clone(e.into()))?;

        tokio::fs::create_dir_all(&self.scratch_dir)
            .await
            .map_err(ArchiveError::Workspace)?;
        let workdir = tempfile::Builder::new()
            .prefix("gitaccel-clone-")
            .tempdir_in(&self.scratch_dir)
            .map_err(ArchiveError::Workspace)?;

        debug!(workdir = %workdir.path().display(), "created clone workspace");

        if let Err(e) = git_clone_shallow(&self.git, repo_url, workdir.path(), self.depth).await {
            warn!(error = %e, "clone failed");
            discard(workdir).await;
            return Err(ArchiveError::Clone(e));
        }

        let archive_path = sibling_archive_path(workdir.path());
        let packaged = {
            let src = workdir.path().to_path_buf();
            let dest = archive_path.clone();
            tokio::task::spawn_blocking(move || package_directory(&src, &dest)).await
        };

        let entries = match packaged {
            Ok(Ok(entries)) => entries,
            Ok(Err(e)) => {
                return Err(abort_packaging(workdir, &archive_path, e).await);
            }
            Err(join) => {
                let e = anyhow::Error::new(join).context("packaging task failed");
                return Err(abort_packaging(workdir, &archive_path, e).await);
            }
        };

        discard(workdir).await;

        if !tokio::fs::try_exists(&archive_path).await.unwrap_or(false) {
            return Err(ArchiveError::Missing(archive_path));
        }

        info!(entries, archive = %archive_path.display(), "repository archive built");
        Ok(archive_path)
    }
}

/// Clean up after a failed packaging step.
async fn abort_packaging(
    workdir: TempDir,
    archive_path: &Path,
    err: anyhow::Error,
) -> ArchiveError {
    warn!(error = %err, "packaging failed");
    discard(workdir).await;
    if let Err(e) = tokio::fs::remove_file(archive_path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(error = %e, path = %archive_path.display(), "failed to remove partial archive");
    }
    ArchiveError::Packaging(err)
}

/// Remove a scratch directory off the async workers.
async fn discard(workdir: TempDir) {
    let path = workdir.path().to_path_buf();
    match tokio::task::spawn_blocking(move || workdir.close()).await {
        Ok(Ok(())) => debug!(path = %path.display(), "removed clone workspace"),
        Ok(Err(e)) => warn!(error = %e, path = %path.display(), "failed to remove clone workspace"),
        Err(e) => warn!(error = %e, path = %path.display(), "workspace cleanup task failed"),
    }
}

/// `<dir>.zip`, next to `dir`.
fn sibling_archive_path(dir: &Path) -> PathBuf {
    let mut name = dir.as_os_str().to_owned();
    name.push(".zip");
    PathBuf::from(name)
}

// ---------------------------------------------------------------------------
// Packaging
// ---------------------------------------------------------------------------

/// Zip the contents of `src` into `dest`, with entry names relative to
/// `src`.  Returns the number of entries written.
fn package_directory(src: &Path, dest: &Path) -> Result<usize> {
    let file =
        File::create(dest).with_context(|| format!("create archive {}", dest.display()))?;
    let mut zip = ZipWriter::new(BufWriter::new(file));
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o644);

    let mut entries = 0;
    for entry in WalkDir::new(src).min_depth(1).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walk {}", src.display()))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .context("walked outside the checkout")?;
        let name = entry_name(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            zip.add_directory(format!("{name}/"), options.unix_permissions(0o755))
                .with_context(|| format!("add directory {name}"))?;
        } else if file_type.is_symlink() {
            let target = std::fs::read_link(entry.path())
                .with_context(|| format!("read link {}", entry.path().display()))?;
            zip.add_symlink(name.clone(), target.to_string_lossy().into_owned(), options)
                .with_context(|| format!("add symlink {name}"))?;
        } else {
            let mode = file_mode(&entry);
            let len = entry
                .metadata()
                .with_context(|| format!("stat {}", entry.path().display()))?
                .len();
            let file_options = options
                .unix_permissions(mode)
                .large_file(needs_zip64(len));
            zip.start_file(name.clone(), file_options)
                .with_context(|| format!("add file {name}"))?;
            let mut input = File::open(entry.path())
                .with_context(|| format!("open {}", entry.path().display()))?;
            std::io::copy(&mut input, &mut zip).with_context(|| format!("write {name}"))?;
        }
        entries += 1;
    }

    let mut out = zip.finish().context("finish archive")?;
    out.flush().context("flush archive")?;
    Ok(entries)
}

/// Files this large only fit in a zip64 entry, which has to be requested
/// before the data is written.
fn needs_zip64(len: u64) -> bool {
    len >= u64::from(u32::MAX)
}

/// Archive entry name with `/` separators regardless of platform.
fn entry_name(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(unix)]
fn file_mode(entry: &walkdir::DirEntry) -> u32 {
    use std::os::unix::fs::PermissionsExt;

    match entry.metadata() {
        Ok(meta) if meta.permissions().mode() & 0o111 != 0 => 0o755,
        _ => 0o644,
    }
}

#[cfg(not(unix))]
fn file_mode(_entry: &walkdir::DirEntry) -> u32 {
    0o644
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;

    fn builder(git: &str, scratch: &Path) -> ArchiveBuilder {
        let config = GitConfig {
            binary: git.to_string(),
            ..GitConfig::default()
        };
        ArchiveBuilder::new(&config, Some(scratch))
    }

    fn dir_entries(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect()
    }

    fn zip_names(path: &Path) -> Vec<String> {
        let archive = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
        archive.file_names().map(str::to_string).collect()
    }

    #[test]
    fn sibling_path_appends_zip() {
        assert_eq!(
            sibling_archive_path(Path::new("/tmp/gitaccel-clone-abc123")),
            PathBuf::from("/tmp/gitaccel-clone-abc123.zip")
        );
    }

    #[test]
    fn entry_names_use_forward_slashes() {
        let relative: PathBuf = ["src", "bin", "main.rs"].iter().collect();
        assert_eq!(entry_name(&relative), "src/bin/main.rs");
    }

    #[test]
    fn zip64_is_requested_from_the_32_bit_limit() {
        assert!(!needs_zip64(0));
        assert!(!needs_zip64(u64::from(u32::MAX) - 1));
        assert!(needs_zip64(u64::from(u32::MAX)));
        assert!(needs_zip64(5 * 1024 * 1024 * 1024));
    }

    #[test]
    fn packages_top_level_contents() {
        let tmp = tempfile::tempdir().unwrap();
        let checkout = tmp.path().join("checkout");
        std::fs::create_dir_all(checkout.join("src")).unwrap();
        std::fs::create_dir_all(checkout.join(".git")).unwrap();
        std::fs::write(checkout.join("README.md"), "# widgets\n").unwrap();
        std::fs::write(checkout.join("src/lib.rs"), "pub fn f() {}\n").unwrap();
        std::fs::write(checkout.join(".git/HEAD"), "ref: refs/heads/main\n").unwrap();

        let dest = tmp.path().join("checkout.zip");
        let entries = package_directory(&checkout, &dest).unwrap();
        assert_eq!(entries, 5);

        let names = zip_names(&dest);
        assert!(names.contains(&"README.md".to_string()));
        assert!(names.contains(&"src/lib.rs".to_string()));
        assert!(names.contains(&".git/HEAD".to_string()));

        let mut archive = zip::ZipArchive::new(File::open(&dest).unwrap()).unwrap();
        let mut readme = String::new();
        archive
            .by_name("README.md")
            .unwrap()
            .read_to_string(&mut readme)
            .unwrap();
        assert_eq!(readme, "# widgets\n");
    }

    #[tokio::test]
    async fn failed_clone_removes_workspace() {
        let scratch = tempfile::tempdir().unwrap();
        let err = builder("false", scratch.path())
            .build("https://example.invalid/acme/widgets.git")
            .await
            .unwrap_err();

        assert!(matches!(err, ArchiveError::Clone(_)));
        assert!(err.to_string().contains("git clone failed"));
        assert!(dir_entries(scratch.path()).is_empty());
    }

    #[tokio::test]
    async fn missing_git_binary_is_a_clone_failure() {
        let scratch = tempfile::tempdir().unwrap();
        let err = builder("/nonexistent/gitaccel/git", scratch.path())
            .build("https://example.invalid/acme/widgets.git")
            .await
            .unwrap_err();

        assert!(matches!(err, ArchiveError::Clone(_)));
        assert!(dir_entries(scratch.path()).is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn successful_build_leaves_only_the_archive() {
        let tools = tempfile::tempdir().unwrap();
        let fake_git = crate::testing::fake_git(tools.path());
        let scratch = tempfile::tempdir().unwrap();

        let archive = builder(fake_git.to_str().unwrap(), scratch.path())
            .build("https://example.com/acme/widgets.git")
            .await
            .unwrap();

        assert_eq!(dir_entries(scratch.path()), vec![archive.clone()]);
        let names = zip_names(&archive);
        assert!(names.contains(&"README.md".to_string()));
        assert!(names.contains(&"src/main.rs".to_string()));
    }
}
