//! Gateway configuration.
//!
//! Everything the pool and the persistence layer read at construction time
//! lives here. Files are TOML; every section and field is optional and falls
//! back to [`Default`], and a small set of environment variables (see
//! [`crate::env::vars`]) override file values.

use crate::env;
use crate::error::{GatewayError, Result as GatewayResult};
use crate::session::crypto::SessionCipher;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Persistence policy for session credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageTier {
    /// Filesystem only, no backup
    #[default]
    Local,
    /// Filesystem authoritative, periodically mirrored to remote storage
    Hybrid,
    /// Remote storage authoritative, mediated by a caching optimizer
    Cloud,
}

impl StorageTier {
    pub fn has_remote(&self) -> bool {
        !matches!(self, StorageTier::Local)
    }
}

impl std::fmt::Display for StorageTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StorageTier::Local => "local",
            StorageTier::Hybrid => "hybrid",
            StorageTier::Cloud => "cloud",
        };
        f.write_str(name)
    }
}

impl FromStr for StorageTier {
    type Err = GatewayError;

    fn from_str(s: &str) -> GatewayResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(StorageTier::Local),
            "hybrid" => Ok(StorageTier::Hybrid),
            "cloud" => Ok(StorageTier::Cloud),
            other => Err(GatewayError::Config(format!(
                "Unknown storage tier '{}', expected local, hybrid or cloud",
                other
            ))),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub storage: StorageConfig,
    pub pool: PoolConfig,
}

/// Session persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub tier: StorageTier,
    /// Root of the per-session credential directories
    pub sessions_root: PathBuf,
    /// Directory backing the filesystem object store and metadata documents
    pub remote_root: PathBuf,
    /// Remote bucket / namespace root
    pub bucket: String,
    /// 32-byte key, hex (64 chars) or base64. Unset means a process-lifetime key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption_key: Option<String>,
    /// Hybrid tier mirror interval
    pub backup_interval_ms: u64,
    pub cloud: CloudCacheConfig,
}

/// Cloud tier caching optimizer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudCacheConfig {
    /// How long existence and listing results are trusted
    pub cache_ttl_ms: u64,
    /// Bound of the background upload queue
    pub upload_queue_capacity: usize,
    pub upload_max_retries: u32,
    pub upload_retry_delay_ms: u64,
}

/// Connection pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_connections: usize,
    /// Fraction (0, 1] of the memory limit that triggers a threshold event
    pub memory_threshold: f64,
    /// Explicit memory limit; discovered from the container when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_limit_bytes: Option<u64>,
    pub qr_timeout_ms: u64,
    pub health_check_interval_ms: u64,
    pub browser_name: String,
    /// Connect directly instead of requesting a proxy agent
    pub skip_proxy: bool,
    /// Address other instances use to reach this one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_url: Option<String>,
    /// Sessions recovered concurrently at startup
    pub recovery_concurrency: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            tier: StorageTier::Local,
            sessions_root: PathBuf::from(env::session::SESSIONS_DIR_NAME),
            remote_root: PathBuf::from(env::session::REMOTE_DIR_NAME),
            bucket: "wa-sessions".to_string(),
            encryption_key: None,
            backup_interval_ms: 5 * 60 * 1000, // 5 minutes
            cloud: CloudCacheConfig::default(),
        }
    }
}

impl Default for CloudCacheConfig {
    fn default() -> Self {
        Self {
            cache_ttl_ms: 30_000,
            upload_queue_capacity: 256,
            upload_max_retries: 3,
            upload_retry_delay_ms: 500,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            memory_threshold: 0.85,
            memory_limit_bytes: None,
            qr_timeout_ms: 60_000,
            health_check_interval_ms: 30_000,
            browser_name: "Chrome".to_string(),
            skip_proxy: false,
            instance_url: None,
            recovery_concurrency: 5,
        }
    }
}

impl StorageConfig {
    pub fn backup_interval(&self) -> Duration {
        Duration::from_millis(self.backup_interval_ms)
    }
}

impl CloudCacheConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn upload_retry_delay(&self) -> Duration {
        Duration::from_millis(self.upload_retry_delay_ms)
    }
}

impl PoolConfig {
    pub fn qr_timeout(&self) -> Duration {
        Duration::from_millis(self.qr_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}

impl GatewayConfig {
    /// Load configuration from a TOML file
    pub fn from_toml_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path).context("Failed to read config file")?;
        Self::from_toml_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse TOML configuration")
    }

    /// Save configuration to a TOML file
    pub fn to_toml_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = self.to_toml_string()?;
        std::fs::write(path, content).context("Failed to write config file")
    }

    /// Convert configuration to a TOML string
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> GatewayResult<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable source.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> GatewayResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(tier) = lookup(env::vars::STORAGE_TIER) {
            self.storage.tier = tier.parse()?;
        }
        if let Some(key) = lookup(env::vars::ENCRYPTION_KEY).filter(|k| !k.trim().is_empty()) {
            self.storage.encryption_key = Some(key);
        }
        if let Some(bucket) = lookup(env::vars::BUCKET) {
            self.storage.bucket = bucket;
        }
        if let Some(root) = lookup(env::vars::SESSIONS_ROOT) {
            self.storage.sessions_root = PathBuf::from(root);
        }
        if let Some(max) = lookup(env::vars::MAX_CONNECTIONS) {
            self.pool.max_connections = max.trim().parse().map_err(|_| {
                GatewayError::Config(format!(
                    "{} must be a positive integer, got '{}'",
                    env::vars::MAX_CONNECTIONS,
                    max
                ))
            })?;
        }
        Ok(())
    }

    /// Reject configurations the pool or persistence layer cannot run with.
    pub fn validate(&self) -> GatewayResult<()> {
        if self.pool.max_connections == 0 {
            return Err(GatewayError::Config(
                "pool.max_connections must be greater than zero".to_string(),
            ));
        }
        if !(self.pool.memory_threshold > 0.0 && self.pool.memory_threshold <= 1.0) {
            return Err(GatewayError::Config(format!(
                "pool.memory_threshold must be in (0, 1], got {}",
                self.pool.memory_threshold
            )));
        }
        if self.pool.qr_timeout_ms == 0 || self.pool.health_check_interval_ms == 0 {
            return Err(GatewayError::Config(
                "pool timers must have a non-zero interval".to_string(),
            ));
        }
        if self.pool.recovery_concurrency == 0 {
            return Err(GatewayError::Config(
                "pool.recovery_concurrency must be greater than zero".to_string(),
            ));
        }
        if let Some(instance_url) = &self.pool.instance_url {
            url::Url::parse(instance_url).map_err(|e| {
                GatewayError::Config(format!("Invalid pool.instance_url '{}': {}", instance_url, e))
            })?;
        }
        if self.storage.tier == StorageTier::Hybrid && self.storage.backup_interval_ms == 0 {
            return Err(GatewayError::Config(
                "storage.backup_interval_ms must be non-zero for the hybrid tier".to_string(),
            ));
        }
        if self.storage.tier.has_remote() && self.storage.bucket.trim().is_empty() {
            return Err(GatewayError::Config(
                "storage.bucket is required for remote storage tiers".to_string(),
            ));
        }
        if self.storage.cloud.upload_queue_capacity == 0 {
            return Err(GatewayError::Config(
                "storage.cloud.upload_queue_capacity must be greater than zero".to_string(),
            ));
        }
        if let Some(key) = &self.storage.encryption_key {
            SessionCipher::parse_key(key)?;
        }
        Ok(())
    }
}
