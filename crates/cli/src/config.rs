use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

/// Top-level CLI configuration, loaded from a TOML file.
#[derive(Debug, Default, Deserialize)]
pub struct LeaseholdConfig {
    /// Lease store backend configuration.
    #[serde(default)]
    pub store: StoreConfig,
    /// Lease defaults.
    #[serde(default)]
    pub lease: LeaseConfig,
}

impl LeaseholdConfig {
    /// Load configuration from `path`, or use defaults if the file does not
    /// exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(toml::from_str("")?);
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("invalid config in {}", path.display()))
    }
}

/// Configuration for the lease store backend.
#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    /// Which backend to use. Only `"redis"` is shared between processes.
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Connection URL for the backend (e.g. `redis://localhost:6379`).
    pub url: Option<String>,

    /// Key prefix for backends that support it. Defaults to `"leasehold"`.
    pub prefix: Option<String>,

    /// Connection pool size for pooled backends.
    pub pool_size: Option<usize>,

    /// Timeout for obtaining a pooled connection, in milliseconds.
    pub connection_timeout_ms: Option<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            url: None,
            prefix: None,
            pool_size: None,
            connection_timeout_ms: None,
        }
    }
}

fn default_backend() -> String {
    "redis".to_owned()
}

/// Defaults applied to every lease the CLI takes.
#[derive(Debug, Deserialize)]
pub struct LeaseConfig {
    /// Lease duration in milliseconds. Renewal runs at half this.
    #[serde(default = "default_duration_ms")]
    pub duration_ms: u64,

    /// Holder identity embedded in tokens. Defaults to a per-process ID.
    pub holder: Option<String>,
}

impl LeaseConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            duration_ms: default_duration_ms(),
            holder: None,
        }
    }
}

fn default_duration_ms() -> u64 {
    30_000
}
