//! Locating and loading the gateway configuration
//!
//! Files are searched in this order, first hit wins:
//! 1. Current directory: ./gateway.toml or ./.wagw/config.toml
//! 2. User config: ~/.wagw/config.toml
//! 3. System config: /etc/wagw/config.toml
//! 4. Built-in defaults
//!
//! Environment overrides are applied on top of whichever source wins.

use crate::{GatewayConfig, env};
use anyhow::{Context, Result};
use std::env as std_env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Finds the gateway configuration file on this host
pub struct ConfigDiscovery;

impl ConfigDiscovery {
    /// Load the explicit file if given, otherwise discover one; then apply
    /// environment overrides and validate.
    pub fn load(config_override: Option<&Path>) -> Result<GatewayConfig> {
        let mut config = match config_override {
            Some(path) => {
                info!("Loading configuration override from: {:?}", path);
                GatewayConfig::from_toml_file(path)?
            }
            None => Self::discover_config()?,
        };
        config
            .apply_env_overrides()
            .context("Invalid configuration override in environment")?;
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }

    /// Load the first candidate that exists, or the built-in defaults
    pub fn discover_config() -> Result<GatewayConfig> {
        if let Some(config_path) = Self::find_config_file() {
            info!("Using configuration file {:?}", config_path);
            return GatewayConfig::from_toml_file(config_path);
        }

        info!("No gateway configuration file found, running with defaults");
        Ok(GatewayConfig::default())
    }

    /// First existing candidate file
    pub fn find_config_file() -> Option<PathBuf> {
        Self::get_config_candidates()
            .into_iter()
            .inspect(|candidate| debug!("Checking for config file: {:?}", candidate))
            .find(|candidate| candidate.is_file())
    }

    /// Candidate paths, highest priority first
    fn get_config_candidates() -> Vec<PathBuf> {
        let mut candidates = Vec::new();

        if let Ok(current_dir) = std_env::current_dir() {
            candidates.extend(Self::local_candidates(&current_dir));
        }

        if let Some(home_dir) = Self::get_home_dir() {
            candidates.push(env::user_config_file_path(&home_dir));
        }

        #[cfg(unix)]
        candidates.push(PathBuf::from("/etc/wagw/config.toml"));

        #[cfg(windows)]
        if let Ok(program_data) = std_env::var("PROGRAMDATA") {
            candidates.push(PathBuf::from(program_data).join("wagw").join("config.toml"));
        }

        candidates
    }

    fn local_candidates(dir: &Path) -> [PathBuf; 2] {
        [
            dir.join(env::LOCAL_CONFIG_FILE_NAME),
            env::local_config_file_path(dir),
        ]
    }

    fn get_home_dir() -> Option<PathBuf> {
        std_env::var("HOME")
            .ok()
            .or_else(|| std_env::var("USERPROFILE").ok())
            .map(PathBuf::from)
    }

    /// Write `~/.wagw/config.toml` with default values unless it already exists
    pub fn create_default_user_config() -> Result<PathBuf> {
        let home_dir = Self::get_home_dir().context("Could not determine home directory")?;
        Self::create_default_config_in(&home_dir)
    }

    fn create_default_config_in(home_dir: &Path) -> Result<PathBuf> {
        let config_dir = env::user_config_dir_path(home_dir);
        let config_path = env::user_config_file_path(home_dir);

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir)
                .with_context(|| format!("Failed to create {:?}", config_dir))?;
            info!("Created {:?}", config_dir);
        }

        if !config_path.exists() {
            GatewayConfig::default().to_toml_file(&config_path)?;
            info!("Wrote default gateway configuration to {:?}", config_path);
        } else {
            warn!("Keeping existing configuration at {:?}", config_path);
        }

        Ok(config_path)
    }

    /// Print every candidate and which one is active
    pub fn show_discovery_info() {
        println!("Gateway configuration candidates:");
        println!();

        for (i, candidate) in Self::get_config_candidates().iter().enumerate() {
            let status = if candidate.is_file() {
                "EXISTS"
            } else if candidate.exists() {
                "NOT A FILE"
            } else {
                "NOT FOUND"
            };
            println!("  {}. {:?} - {}", i + 1, candidate, status);
        }

        println!();
        match Self::find_config_file() {
            Some(found) => println!("Active configuration: {:?}", found),
            None => println!("Active configuration: Built-in defaults"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageTier;
    use tempfile::TempDir;

    #[test]
    fn test_config_candidates() {
        let candidates = ConfigDiscovery::get_config_candidates();

        assert!(!candidates.is_empty());
        assert_eq!(candidates[0].file_name().unwrap(), "gateway.toml");
        assert!(candidates[1].ends_with(".wagw/config.toml"));
    }

    #[test]
    fn test_create_default_config() {
        let home = TempDir::new().unwrap();

        let path = ConfigDiscovery::create_default_config_in(home.path()).unwrap();
        assert_eq!(path, home.path().join(".wagw").join("config.toml"));

        let loaded = GatewayConfig::from_toml_file(&path).unwrap();
        assert_eq!(loaded.storage.tier, StorageTier::Local);
        assert_eq!(loaded.pool.max_connections, 100);

        // Existing files are left alone
        std::fs::write(&path, "[pool]\nmax_connections = 7\n").unwrap();
        ConfigDiscovery::create_default_config_in(home.path()).unwrap();
        let kept = GatewayConfig::from_toml_file(&path).unwrap();
        assert_eq!(kept.pool.max_connections, 7);
    }

    #[test]
    fn test_load_explicit_file_validates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gw.toml");
        std::fs::write(&path, "[pool]\nmax_connections = 0\n").unwrap();

        assert!(ConfigDiscovery::load(Some(&path)).is_err());
    }
}
