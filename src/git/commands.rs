//! Git command wrappers using [`tokio::process::Command`].
//!
//! The program name is passed in by the caller so that deployments can point
//! at a specific `git` build.  Prompts are disabled so that a clone of a
//! private repository fails instead of hanging on a credential prompt.

use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use tokio::process::Command;
use tracing::{debug, instrument};

/// Run `git clone --depth=<depth> -- <url> <dest>`.
///
/// `--` keeps a URL starting with `-` from being read as an option.
/// `dest` may already exist as long as it is empty.  On a non-zero exit the
/// captured stderr is returned in the error.
#[instrument(skip(git), fields(%url, dest = %dest.display()))]
pub async fn git_clone_shallow(git: &str, url: &str, dest: &Path, depth: u32) -> Result<()> {
    let mut cmd = Command::new(git);
    cmd.arg("clone")
        .arg(format!("--depth={depth}"))
        .arg("--")
        .arg(url)
        .arg(dest);

    cmd.env("GIT_TERMINAL_PROMPT", "0");
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    debug!("spawning git clone");

    let output = cmd
        .output()
        .await
        .with_context(|| format!("failed to spawn {git} clone"))?;

    debug!(
        stdout = %String::from_utf8_lossy(&output.stdout).trim(),
        stderr = %String::from_utf8_lossy(&output.stderr).trim(),
        "git clone output"
    );

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "git clone failed (status {}): {}",
            output.status,
            stderr.trim(),
        );
    }

    debug!("git clone succeeded");
    Ok(())
}

/// Run `git --version` and return its trimmed output.
pub async fn git_version(git: &str) -> Result<String> {
    let output = Command::new(git)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .with_context(|| format!("failed to spawn {git} --version"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("{git} --version failed (status {}): {}", output.status, stderr.trim());
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
