//! # WA Session Gateway
//!
//! Connection pooling and credential persistence for a multi-tenant messaging
//! gateway. Each tenant owns one or more phone-number sessions; the gateway keeps
//! at most one live protocol connection per session, persists the protocol's
//! authentication state so sessions survive restarts, and recovers them on boot.
//!
//! ## Architecture Overview
//!
//! - **[`pool`]**: The connection pool. Admission, ownership, proxies, QR
//!   expiry, event fan-out, memory telemetry, recovery and shutdown.
//! - **[`session`]**: Session persistence across three tiers (local, hybrid,
//!   cloud) with AES-256-CBC encrypted remote backups.
//! - **[`config`]**: TOML configuration with environment overrides.
//! - **[`cli`]**: The `wagw` maintenance binary's argument parsing and
//!   configuration discovery.
//!
//! The wire protocol itself is not part of this crate. Callers plug in a
//! [`pool::SocketFactory`] plus optional collaborators (proxy provider,
//! instance coordinator, connection state store, health registrar, error sink).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use wa_session_gateway::{GatewayConfig, SessionPersistenceManager};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = GatewayConfig::default();
//!     let persistence = SessionPersistenceManager::from_config(&config.storage)?;
//!
//!     let auth = persistence
//!         .get_or_create_auth_state("alice", "+15550001111")
//!         .await?;
//!     println!("Registered: {}", auth.is_registered().await);
//!
//!     persistence.shutdown().await;
//!     Ok(())
//! }
//! ```

/// Gateway configuration loaded from TOML and the environment.
pub mod config;

/// Environment constants and path utilities.
///
/// Centralizes the directory names, file names and remote key layout used by
/// the persistence layer.
pub mod env;

/// Error taxonomy shared by the pool and the persistence layer.
pub mod error;

/// Per-key async mutual exclusion.
pub mod keyed_lock;

/// Owned background tasks that are cancelled on drop.
pub mod scheduled;

/// Session persistence: keys, auth state, encryption, storage tiers.
pub mod session;

/// Connection pool and its pluggable collaborators.
pub mod pool;

// CLI module for command-line interface
pub mod cli;

pub use config::{CloudCacheConfig, GatewayConfig, PoolConfig, StorageConfig, StorageTier};
pub use error::{GatewayError, Result};

pub use session::{
    AuthState, BackupReport, RestoreOutcome, SessionCipher, SessionKey,
    SessionPersistenceManager, SessionRecord, TierBackend,
};

pub use pool::{
    AddConnectionOptions, ConnectionInfo, ConnectionPool, ConnectionStatus, PoolCollaborators,
    PoolEvent, PoolMetrics, RecoveryReport,
};
