use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Runtime configuration for the proxy.
///
/// Every section has serde defaults so that the service runs without a
/// configuration file at all; the CLI and environment can still override the
/// listen address and cache directory (see [`Overrides`]).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub git: GitConfig,
}

impl Config {
    /// `host:port` string for the public listener.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.proxy.host, self.proxy.port)
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Optional `host:port` for a separate Prometheus metrics listener.
    #[serde(default)]
    pub metrics_listen: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            metrics_listen: None,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8082
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory holding cached response bodies and repository archives.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Directory with `index.html`, `favicon.ico` and other static assets.
    #[serde(default = "default_static_dir")]
    pub static_dir: PathBuf,
    /// Where ephemeral clone directories are created.  Defaults to the
    /// system temp directory.
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            static_dir: default_static_dir(),
            scratch_dir: None,
        }
    }
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache")
}

fn default_static_dir() -> PathBuf {
    PathBuf::from("static")
}

// ---------------------------------------------------------------------------
// Upstream HTTP client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// End-to-end timeout (seconds) for a single upstream call.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Maximum number of upstream requests in flight at once.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Maximum idle keep-alive connections kept per host.
    #[serde(default = "default_max_idle_connections")]
    pub max_idle_connections: usize,
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            max_connections: default_max_connections(),
            max_idle_connections: default_max_idle_connections(),
            max_redirects: default_max_redirects(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_max_connections() -> usize {
    100
}

fn default_max_idle_connections() -> usize {
    20
}

fn default_max_redirects() -> usize {
    10
}

// ---------------------------------------------------------------------------
// Git
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct GitConfig {
    /// Program invoked for clones.
    #[serde(default = "default_git_binary")]
    pub binary: String,
    #[serde(default = "default_clone_depth")]
    pub clone_depth: u32,
    #[serde(default = "default_max_concurrent_clones")]
    pub max_concurrent_clones: usize,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            binary: default_git_binary(),
            clone_depth: default_clone_depth(),
            max_concurrent_clones: default_max_concurrent_clones(),
        }
    }
}

fn default_git_binary() -> String {
    "git".to_string()
}

fn default_clone_depth() -> u32 {
    1
}

fn default_max_concurrent_clones() -> usize {
    4
}

// ---------------------------------------------------------------------------
// Overrides
// ---------------------------------------------------------------------------

/// Values supplied on the command line or through the environment.  They take
/// precedence over the configuration file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub cache_dir: Option<PathBuf>,
}

impl Overrides {
    fn apply(self, config: &mut Config) {
        if let Some(host) = self.host {
            config.proxy.host = host;
        }
        if let Some(port) = self.port {
            config.proxy.port = port;
        }
        if let Some(cache_dir) = self.cache_dir {
            config.storage.cache_dir = cache_dir;
        }
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load the configuration from an optional YAML file, apply `overrides` and
/// validate the result.
pub fn load_config(path: Option<&Path>, overrides: Overrides) -> Result<Config> {
    let mut config = match path {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&contents)
                .with_context(|| format!("failed to parse config file: {}", path.display()))?
        }
        None => Config::default(),
    };
    overrides.apply(&mut config);
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        config.upstream.timeout_secs > 0,
        "upstream.timeout_secs must be greater than zero"
    );
    anyhow::ensure!(
        config.upstream.max_connections > 0,
        "upstream.max_connections must be at least 1"
    );
    anyhow::ensure!(
        config.upstream.max_idle_connections <= config.upstream.max_connections,
        "upstream.max_idle_connections must not exceed max_connections"
    );
    anyhow::ensure!(
        config.git.clone_depth >= 1,
        "git.clone_depth must be at least 1"
    );
    anyhow::ensure!(
        config.git.max_concurrent_clones > 0,
        "git.max_concurrent_clones must be at least 1"
    );
    anyhow::ensure!(!config.git.binary.is_empty(), "git.binary must not be empty");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), contents).unwrap();
        file
    }

    #[test]
    fn defaults_without_file() {
        let config = load_config(None, Overrides::default()).unwrap();
        assert_eq!(config.listen_addr(), "127.0.0.1:8082");
        assert_eq!(config.storage.cache_dir, PathBuf::from("cache"));
        assert_eq!(config.upstream.timeout_secs, 30);
        assert_eq!(config.upstream.max_connections, 100);
        assert_eq!(config.upstream.max_idle_connections, 20);
        assert_eq!(config.git.binary, "git");
        assert_eq!(config.git.clone_depth, 1);
        assert!(config.proxy.metrics_listen.is_none());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let file = write_config("proxy:\n  port: 9000\nupstream:\n  timeout_secs: 5\n");
        let config = load_config(Some(file.path()), Overrides::default()).unwrap();
        assert_eq!(config.proxy.port, 9000);
        assert_eq!(config.proxy.host, "127.0.0.1");
        assert_eq!(config.upstream.timeout_secs, 5);
        assert_eq!(config.upstream.max_redirects, 10);
    }

    #[test]
    fn overrides_win_over_file() {
        let file = write_config("proxy:\n  host: 10.0.0.1\n  port: 9000\n");
        let overrides = Overrides {
            host: Some("0.0.0.0".into()),
            port: Some(8443),
            cache_dir: Some(PathBuf::from("/var/cache/gitaccel")),
        };
        let config = load_config(Some(file.path()), overrides).unwrap();
        assert_eq!(config.listen_addr(), "0.0.0.0:8443");
        assert_eq!(config.storage.cache_dir, PathBuf::from("/var/cache/gitaccel"));
    }

    #[test]
    fn rejects_idle_above_total() {
        let file = write_config("upstream:\n  max_connections: 4\n  max_idle_connections: 8\n");
        let err = load_config(Some(file.path()), Overrides::default()).unwrap_err();
        assert!(err.to_string().contains("max_idle_connections"));
    }

    #[test]
    fn rejects_zero_depth() {
        let file = write_config("git:\n  clone_depth: 0\n");
        assert!(load_config(Some(file.path()), Overrides::default()).is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = load_config(
            Some(Path::new("/nonexistent/gitaccel/config.yaml")),
            Overrides::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("failed to read config file"));
    }
}
