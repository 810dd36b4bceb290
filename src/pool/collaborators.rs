//! External services the connection pool depends on.
//!
//! Proxy acquisition, cross-instance ownership, durable connection state,
//! realtime health tracking and error reporting all live outside the pool.
//! Each is a narrow trait; the defaults here let a single instance run without
//! any of them.

use crate::error::{GatewayError, Result};
use crate::pool::protocol::{ProtocolSocket, SocketFactory};
use crate::session::SessionKey;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error};

/// Lifecycle status of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionStatus {
    Connecting,
    Open,
    Closed,
    LoggedOut,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Open => "open",
            ConnectionStatus::Closed => "closed",
            ConnectionStatus::LoggedOut => "logged-out",
        };
        write!(f, "{}", name)
    }
}

/// Outbound proxy assigned to one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyAgent {
    pub url: String,
    pub country: Option<String>,
}

/// Proxy pool counters reported with the pool metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyMetrics {
    pub active: usize,
    pub available: usize,
    pub failed: usize,
}

/// Last known state of a persisted session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveredConnection {
    pub key: SessionKey,
    pub status: ConnectionStatus,
    pub instance_url: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Where an error reported to the [`ErrorSink`] happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorContext {
    pub operation: String,
    pub key: Option<SessionKey>,
}

impl ErrorContext {
    pub fn new(operation: &str, key: Option<&SessionKey>) -> Self {
        Self {
            operation: operation.to_string(),
            key: key.cloned(),
        }
    }
}

pub trait ProxyProvider: Send + Sync {
    /// Acquire a proxy for the session; `None` means connect directly.
    fn create_proxy_agent(
        &self,
        key: SessionKey,
        country: Option<String>,
    ) -> BoxFuture<'_, Result<Option<ProxyAgent>>>;

    fn release_proxy(&self, key: SessionKey) -> BoxFuture<'_, Result<()>>;

    fn metrics(&self) -> ProxyMetrics;
}

/// Arbiter deciding which service instance holds each session.
pub trait InstanceCoordinator: Send + Sync {
    fn should_handle_session(&self, key: SessionKey) -> BoxFuture<'_, Result<bool>>;

    fn request_session_ownership(&self, key: SessionKey) -> BoxFuture<'_, Result<bool>>;

    fn update_session_activity(&self, key: SessionKey) -> BoxFuture<'_, Result<()>>;

    fn release_session_ownership(&self, key: SessionKey) -> BoxFuture<'_, Result<()>>;

    fn shutdown(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// Durable record of each session's connection status, consulted at recovery.
pub trait ConnectionStateStore: Send + Sync {
    fn recover_connections(
        &self,
        candidates: Vec<SessionKey>,
    ) -> BoxFuture<'_, Result<Vec<RecoveredConnection>>>;

    fn initialize_state(
        &self,
        key: SessionKey,
        instance_url: Option<String>,
    ) -> BoxFuture<'_, Result<()>>;

    fn update_state(&self, key: SessionKey, status: ConnectionStatus)
    -> BoxFuture<'_, Result<()>>;
}

/// Realtime registry of live sockets.
pub trait HealthRegistrar: Send + Sync {
    fn register_connection(
        &self,
        id: String,
        socket: Arc<dyn ProtocolSocket>,
    ) -> BoxFuture<'_, Result<()>>;

    fn unregister_connection(&self, id: String) -> BoxFuture<'_, Result<()>>;

    fn shutdown(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// Best-effort error reporting.
pub trait ErrorSink: Send + Sync {
    fn handle_error(&self, message: String, context: ErrorContext) -> BoxFuture<'_, ()>;

    fn shutdown(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

/// Direct connections, no proxies.
#[derive(Debug, Default)]
pub struct NoProxy;

impl ProxyProvider for NoProxy {
    fn create_proxy_agent(
        &self,
        _key: SessionKey,
        _country: Option<String>,
    ) -> BoxFuture<'_, Result<Option<ProxyAgent>>> {
        Box::pin(async { Ok(None) })
    }

    fn release_proxy(&self, _key: SessionKey) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn metrics(&self) -> ProxyMetrics {
        ProxyMetrics::default()
    }
}

/// Coordinator for a deployment with exactly one instance: owns everything.
#[derive(Debug, Default)]
pub struct SingleInstance;

impl InstanceCoordinator for SingleInstance {
    fn should_handle_session(&self, _key: SessionKey) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async { Ok(true) })
    }

    fn request_session_ownership(&self, _key: SessionKey) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async { Ok(true) })
    }

    fn update_session_activity(&self, _key: SessionKey) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn release_session_ownership(&self, _key: SessionKey) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// Process-local connection state. Sessions without a stored status are
/// reported as closed, which makes them eligible for recovery.
#[derive(Debug, Default)]
pub struct InMemoryConnectionState {
    states: DashMap<SessionKey, RecoveredConnection>,
}

impl InMemoryConnectionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self, key: &SessionKey) -> Option<ConnectionStatus> {
        self.states.get(key).map(|state| state.status)
    }

    pub fn set_status(&self, key: SessionKey, status: ConnectionStatus) {
        self.states.insert(
            key.clone(),
            RecoveredConnection {
                key,
                status,
                instance_url: None,
                updated_at: Some(Utc::now()),
            },
        );
    }
}

impl ConnectionStateStore for InMemoryConnectionState {
    fn recover_connections(
        &self,
        candidates: Vec<SessionKey>,
    ) -> BoxFuture<'_, Result<Vec<RecoveredConnection>>> {
        Box::pin(async move {
            Ok(candidates
                .into_iter()
                .map(|key| match self.states.get(&key) {
                    Some(state) => state.clone(),
                    None => RecoveredConnection {
                        key,
                        status: ConnectionStatus::Closed,
                        instance_url: None,
                        updated_at: None,
                    },
                })
                .collect())
        })
    }

    fn initialize_state(
        &self,
        key: SessionKey,
        instance_url: Option<String>,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.states.insert(
                key.clone(),
                RecoveredConnection {
                    key,
                    status: ConnectionStatus::Connecting,
                    instance_url,
                    updated_at: Some(Utc::now()),
                },
            );
            Ok(())
        })
    }

    fn update_state(
        &self,
        key: SessionKey,
        status: ConnectionStatus,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            match self.states.get_mut(&key) {
                Some(mut state) => {
                    state.status = status;
                    state.updated_at = Some(Utc::now());
                }
                None => self.set_status(key, status),
            }
            Ok(())
        })
    }
}

/// Keeps live sockets in a map so they can be inspected or counted.
#[derive(Default)]
pub struct LocalHealthRegistrar {
    sockets: DashMap<String, Arc<dyn ProtocolSocket>>,
}

impl LocalHealthRegistrar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registered(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.sockets.contains_key(id)
    }
}

impl HealthRegistrar for LocalHealthRegistrar {
    fn register_connection(
        &self,
        id: String,
        socket: Arc<dyn ProtocolSocket>,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.sockets.insert(id, socket);
            Ok(())
        })
    }

    fn unregister_connection(&self, id: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.sockets.remove(&id);
            Ok(())
        })
    }

    fn shutdown(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            debug!("Health registrar released {} sockets", self.sockets.len());
            self.sockets.clear();
            Ok(())
        })
    }
}

/// Reports errors through `tracing`.
#[derive(Debug, Default)]
pub struct LoggingErrorSink;

impl ErrorSink for LoggingErrorSink {
    fn handle_error(&self, message: String, context: ErrorContext) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            match &context.key {
                Some(key) => error!("{} failed for {}: {}", context.operation, key, message),
                None => error!("{} failed: {}", context.operation, message),
            }
        })
    }
}

/// Everything the pool talks to besides the persistence manager.
#[derive(Clone)]
pub struct PoolCollaborators {
    pub sockets: Arc<dyn SocketFactory>,
    pub proxy: Arc<dyn ProxyProvider>,
    pub coordinator: Arc<dyn InstanceCoordinator>,
    pub state: Arc<dyn ConnectionStateStore>,
    pub health: Arc<dyn HealthRegistrar>,
    pub errors: Arc<dyn ErrorSink>,
}

impl PoolCollaborators {
    /// Single-instance defaults around a socket factory.
    pub fn standalone(sockets: Arc<dyn SocketFactory>) -> Self {
        Self {
            sockets,
            proxy: Arc::new(NoProxy),
            coordinator: Arc::new(SingleInstance),
            state: Arc::new(InMemoryConnectionState::new()),
            health: Arc::new(LocalHealthRegistrar::new()),
            errors: Arc::new(LoggingErrorSink),
        }
    }
}

/// Coordinator error used when ownership is refused outright.
pub(crate) fn ownership_refused(key: &SessionKey) -> GatewayError {
    GatewayError::Coordination(format!("ownership of {} refused", key))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(user: &str) -> SessionKey {
        SessionKey::new(user, "+15550001111", None).unwrap()
    }

    #[tokio::test]
    async fn test_in_memory_state_defaults_to_closed() {
        let store = InMemoryConnectionState::new();
        store.set_status(key("alice"), ConnectionStatus::LoggedOut);
        store
            .initialize_state(key("bob"), Some("http://node-1:3000".to_string()))
            .await
            .unwrap();
        store
            .update_state(key("bob"), ConnectionStatus::Open)
            .await
            .unwrap();

        let recovered = store
            .recover_connections(vec![key("alice"), key("bob"), key("carol")])
            .await
            .unwrap();
        let statuses: Vec<_> = recovered.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![
                ConnectionStatus::LoggedOut,
                ConnectionStatus::Open,
                ConnectionStatus::Closed
            ]
        );
        assert_eq!(
            recovered[1].instance_url.as_deref(),
            Some("http://node-1:3000")
        );
    }

    #[tokio::test]
    async fn test_defaults_accept_everything() {
        assert!(SingleInstance.should_handle_session(key("a")).await.unwrap());
        assert!(
            SingleInstance
                .request_session_ownership(key("a"))
                .await
                .unwrap()
        );
        assert_eq!(NoProxy.create_proxy_agent(key("a"), None).await.unwrap(), None);
        assert_eq!(NoProxy.metrics(), ProxyMetrics::default());
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&ConnectionStatus::LoggedOut).unwrap(),
            "\"logged-out\""
        );
        assert_eq!(ConnectionStatus::Open.to_string(), "open");
    }
}
