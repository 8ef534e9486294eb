//! shepherd.toml configuration parser.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Result type alias for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading or validating the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level daemon configuration, read once at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct ShepherdConfig {
    #[serde(default)]
    pub cleanup: CleanupConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    pub pools: Vec<PoolConfig>,
}

/// Timing of the periodic cleanup cycle.
#[derive(Debug, Clone, Deserialize)]
pub struct CleanupConfig {
    #[serde(default = "default_interval", deserialize_with = "crate::duration::deserialize")]
    pub interval: Duration,
    /// Wait before the first cycle so instances can re-register after a restart.
    #[serde(default = "default_initial_delay", deserialize_with = "crate::duration::deserialize")]
    pub initial_delay: Duration,
}

/// Liveness probe parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeConfig {
    /// Hard upper bound for a single probe, independent of the caller.
    #[serde(default = "default_probe_timeout", deserialize_with = "crate::duration::deserialize")]
    pub timeout: Duration,
    /// Name asked in datagram (DNS) probes.
    #[serde(default = "default_dns_query")]
    pub dns_query: String,
}

/// State store location and call deadline.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    /// Deadline wrapped around every registry/directory call.
    #[serde(default = "default_call_timeout", deserialize_with = "crate::duration::deserialize")]
    pub call_timeout: Duration,
}

/// Recreation worker pool.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Concurrent recreate calls. Zero means one per available CPU.
    #[serde(default)]
    pub workers: usize,
    /// Extra attempts per application after the first failure.
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
    #[serde(default = "default_dispatch_timeout", deserialize_with = "crate::duration::deserialize")]
    pub timeout: Duration,
}

/// One service pool watched by the cleanup driver.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PoolConfig {
    pub name: String,
    #[serde(default)]
    pub role: PoolRole,
}

/// What the cleanup cycle does differently for a pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolRole {
    /// TCP probe, removal only.
    #[default]
    Standard,
    /// TCP probe; applications on a dead instance are rescheduled.
    AppHosting,
    /// Name-resolution pool, probed with a DNS datagram.
    Resolver,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            initial_delay: default_initial_delay(),
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout: default_probe_timeout(),
            dns_query: default_dns_query(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            call_timeout: default_call_timeout(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            retry_limit: default_retry_limit(),
            timeout: default_dispatch_timeout(),
        }
    }
}

impl DispatchConfig {
    /// Effective worker count, resolving zero to the CPU parallelism.
    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }
}

impl ShepherdConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(content: &str) -> ConfigResult<Self> {
        let config: ShepherdConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.pools.is_empty() {
            return Err(ConfigError::Invalid("at least one pool is required".into()));
        }

        let mut seen = HashSet::new();
        for pool in &self.pools {
            if pool.name.trim().is_empty() {
                return Err(ConfigError::Invalid("pool name must not be empty".into()));
            }
            if !seen.insert(pool.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate pool `{}`", pool.name)));
            }
        }

        for role in [PoolRole::AppHosting, PoolRole::Resolver] {
            let count = self.pools.iter().filter(|p| p.role == role).count();
            if count > 1 {
                return Err(ConfigError::Invalid(format!(
                    "at most one pool may have role {role:?}, found {count}"
                )));
            }
        }

        let timings = [
            ("cleanup.interval", self.cleanup.interval),
            ("probe.timeout", self.probe.timeout),
            ("store.call_timeout", self.store.call_timeout),
            ("dispatch.timeout", self.dispatch.timeout),
        ];
        for (name, value) in timings {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
            }
        }

        Ok(())
    }

    /// The pool whose dead instances trigger rescheduling, if any.
    pub fn hosting_pool(&self) -> Option<&PoolConfig> {
        self.pools.iter().find(|p| p.role == PoolRole::AppHosting)
    }
}

fn default_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(10)
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_dns_query() -> String {
    "health.shepherd.".to_string()
}

fn default_store_path() -> PathBuf {
    PathBuf::from("/var/lib/shepherd/shepherd.redb")
}

fn default_call_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_retry_limit() -> u32 {
    3
}

fn default_dispatch_timeout() -> Duration {
    Duration::from_secs(30)
}
