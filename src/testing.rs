//! Shared fixtures for unit tests.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::AppState;
use crate::config::Config;

/// Write a stand-in `git` executable into `dir`.
///
/// It ignores every argument but the last (the clone destination), where it
/// creates a tiny checkout with `README.md` and `src/main.rs`.
#[cfg(unix)]
pub fn fake_git(dir: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("git");
    std::fs::write(
        &path,
        "#!/bin/sh\n\
         for last; do :; done\n\
         mkdir -p \"$last/src\"\n\
         printf 'hello\\n' > \"$last/README.md\"\n\
         printf 'fn main() {}\\n' > \"$last/src/main.rs\"\n",
    )
    .unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Like [`fake_git`], but the script sleeps for `secs` seconds first.
#[cfg(unix)]
pub fn slow_fake_git(dir: &Path, secs: u32) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("slow-git");
    std::fs::write(
        &path,
        format!(
            "#!/bin/sh\n\
             sleep {secs}\n\
             for last; do :; done\n\
             mkdir -p \"$last\"\n\
             printf 'slow\\n' > \"$last/README.md\"\n"
        ),
    )
    .unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// A stand-in `git` that appends each argument, one per line, to `log`
/// and then creates an empty checkout in its last argument.
#[cfg(unix)]
pub fn recording_fake_git(dir: &Path, log: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("recording-git");
    std::fs::write(
        &path,
        format!(
            "#!/bin/sh\n\
             for arg; do printf '%s\\n' \"$arg\" >> '{}'; done\n\
             for last; do :; done\n\
             mkdir -p \"$last\"\n",
            log.display()
        ),
    )
    .unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Application state rooted in `dir`, with the upstream client started.
///
/// Cache entries land in `dir/cache`, clone workspaces in `dir/scratch` and
/// static assets are looked up in `dir/static`.
pub fn started_state(dir: &Path, git: &str) -> Arc<AppState> {
    started_state_with(dir, git, |_| {})
}

/// [`started_state`] with a chance to adjust the configuration first.
pub fn started_state_with(
    dir: &Path,
    git: &str,
    configure: impl FnOnce(&mut Config),
) -> Arc<AppState> {
    let mut config = test_config(dir, git);
    configure(&mut config);
    let state = Arc::new(AppState::new(Arc::new(config)));
    state.upstream.start().unwrap();
    state
}

/// Same as [`started_state`] but the upstream client is left unstarted.
pub fn unstarted_state(dir: &Path, git: &str) -> Arc<AppState> {
    Arc::new(AppState::new(Arc::new(test_config(dir, git))))
}

fn test_config(dir: &Path, git: &str) -> Config {
    let mut config = Config::default();
    config.storage.cache_dir = dir.join("cache");
    config.storage.static_dir = dir.join("static");
    config.storage.scratch_dir = Some(dir.join("scratch"));
    config.git.binary = git.to_string();
    config
}
