//! Connection pool.
//!
//! Holds at most one live protocol socket per session, enforces the pool size,
//! wires socket events into persistence and the event broadcast, and tears
//! connections down. Connection state machine:
//! `requested -> connecting -> open`, then `closed` or `logged-out`.

use crate::config::PoolConfig;
use crate::error::{GatewayError, Result};
use crate::keyed_lock::KeyedLocks;
use crate::pool::collaborators::{
    ConnectionStatus, ErrorContext, PoolCollaborators, ProxyMetrics, ownership_refused,
};
use crate::pool::events::{EVENT_CHANNEL_CAPACITY, PoolEvent};
use crate::pool::memory::{MemoryMonitor, MemoryUsage};
use crate::pool::protocol::{
    MessageContent, ProtocolSocket, SocketEvent, SocketOptions, TransportState,
};
use crate::scheduled::ScheduledTask;
use crate::session::{SessionKey, SessionPersistenceManager};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

/// Options for [`ConnectionPool::add_connection`].
#[derive(Debug, Clone, Default)]
pub struct AddConnectionOptions {
    /// Preferred proxy exit country
    pub proxy_country: Option<String>,
    /// Calling code used to normalize national phone numbers
    pub country_code: Option<String>,
    /// Set by recovery: skips the ownership check and activity update
    pub is_recovery: bool,
    /// Overrides the configured browser name
    pub browser_name: Option<String>,
    /// Discard stored credentials and pair from scratch
    pub force_new: bool,
}

/// Snapshot of one connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionInfo {
    pub key: SessionKey,
    pub status: ConnectionStatus,
    pub proxy_country: Option<String>,
    pub instance_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub qr_code: Option<String>,
}

impl ConnectionInfo {
    pub fn message_count(&self) -> u64 {
        self.messages_sent + self.messages_received
    }
}

/// Pool-wide counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolMetrics {
    pub total_connections: usize,
    pub active_connections: usize,
    pub pending_connections: usize,
    pub memory_usage: MemoryUsage,
    pub proxy_metrics: ProxyMetrics,
    pub total_sessions: usize,
}

struct ConnectionRecord {
    info: ConnectionInfo,
    socket: Arc<dyn ProtocolSocket>,
    has_proxy: bool,
    qr_timer: Option<ScheduledTask>,
    event_pump: Option<ScheduledTask>,
}

/// Bounded pool of live protocol sockets.
pub struct ConnectionPool {
    config: PoolConfig,
    persistence: Arc<SessionPersistenceManager>,
    collaborators: PoolCollaborators,
    connections: DashMap<SessionKey, ConnectionRecord>,
    locks: KeyedLocks<SessionKey>,
    slots: AtomicUsize,
    accepting: AtomicBool,
    // Held while checking `accepting` and inserting a record, and while
    // shutdown flips `accepting`
    admission: Mutex<()>,
    memory_pressure: AtomicBool,
    events: broadcast::Sender<PoolEvent>,
    memory: MemoryMonitor,
    health_task: Mutex<Option<ScheduledTask>>,
}

impl ConnectionPool {
    /// Create the pool and start its periodic health check.
    pub fn new(
        config: PoolConfig,
        persistence: Arc<SessionPersistenceManager>,
        collaborators: PoolCollaborators,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let memory = MemoryMonitor::new(config.memory_limit_bytes);

        let pool = Arc::new(Self {
            config,
            persistence,
            collaborators,
            connections: DashMap::new(),
            locks: KeyedLocks::new(),
            slots: AtomicUsize::new(0),
            accepting: AtomicBool::new(true),
            admission: Mutex::new(()),
            memory_pressure: AtomicBool::new(false),
            events,
            memory,
            health_task: Mutex::new(None),
        });

        let weak = Arc::downgrade(&pool);
        let health = ScheduledTask::every(
            "pool-health",
            pool.config.health_check_interval(),
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(pool) = weak.upgrade() {
                        pool.check_health();
                    }
                }
            },
        );
        pool.set_health_task(Some(health));

        info!(
            "Connection pool started: max_connections={}, tier={}",
            pool.config.max_connections,
            pool.persistence.tier()
        );
        pool
    }

    fn set_health_task(&self, task: Option<ScheduledTask>) {
        let previous = match self.health_task.lock() {
            Ok(mut guard) => std::mem::replace(&mut *guard, task),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), task),
        };
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    /// Subscribe to pool events.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    pub fn persistence(&self) -> &Arc<SessionPersistenceManager> {
        &self.persistence
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub(crate) fn collaborators(&self) -> &PoolCollaborators {
        &self.collaborators
    }

    fn emit(&self, event: PoolEvent) {
        debug!("Pool event {}", event.name());
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    async fn report_error(&self, operation: &str, key: Option<&SessionKey>, message: String) {
        self.emit(PoolEvent::Error {
            key: key.cloned(),
            message: message.clone(),
        });
        self.collaborators
            .errors
            .handle_error(message, ErrorContext::new(operation, key))
            .await;
    }

    fn try_reserve_slot(&self) -> bool {
        let max = self.config.max_connections;
        self.slots
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                (used < max).then_some(used + 1)
            })
            .is_ok()
    }

    fn release_slot(&self) {
        let _ = self
            .slots
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| used.checked_sub(1));
    }

    /// Open a connection for a session.
    ///
    /// Returns `Ok(true)` when the session is connected or connecting,
    /// `Ok(false)` when the pool is full, ownership was refused or a
    /// collaborator failed. Invalid phone numbers and socket construction
    /// failures are errors.
    pub async fn add_connection(
        self: &Arc<Self>,
        user_id: &str,
        phone: &str,
        options: AddConnectionOptions,
    ) -> Result<bool> {
        let key = SessionKey::new(user_id, phone, options.country_code.as_deref())?;
        if !self.accepting.load(Ordering::SeqCst) {
            warn!("Rejecting connection for {}: pool is shutting down", key);
            return Ok(false);
        }

        let _guard = self.locks.lock(&key).await;

        let stale = match self.connections.get(&key) {
            Some(record) => match record.info.status {
                ConnectionStatus::Connecting | ConnectionStatus::Open => {
                    debug!("Connection for {} already exists", key);
                    return Ok(true);
                }
                ConnectionStatus::Closed | ConnectionStatus::LoggedOut => true,
            },
            None => false,
        };
        // Teardown releases ownership, so it precedes the ownership request
        if stale {
            self.remove_locked(&key, true, "replaced").await;
        }

        let mut owns_session = false;
        if !options.is_recovery {
            match self.acquire_ownership(&key).await {
                Ok(acquired) => owns_session = acquired,
                Err(e) => {
                    warn!("Not taking {}: {}", key, e);
                    return Ok(false);
                }
            }
        }

        if !self.try_reserve_slot() {
            let max = self.config.max_connections;
            warn!("Connection pool full ({}), rejecting {}", max, key);
            self.emit(PoolEvent::CapacityReached {
                current: self.connections.len(),
                max,
            });
            if owns_session {
                self.release_ownership(&key).await;
            }
            return Ok(false);
        }

        match self.open_connection(&key, &options).await {
            Ok(()) => {
                if !options.is_recovery
                    && let Err(e) = self
                        .collaborators
                        .coordinator
                        .update_session_activity(key.clone())
                        .await
                {
                    warn!("Failed to record activity for {}: {}", key, e);
                }
                Ok(true)
            }
            Err(failure) => {
                self.release_slot();
                // Files stay on disk, only the registry entry and its timers go
                if failure.session_opened {
                    self.persistence.release_session(&key).await;
                }
                if failure.proxy_acquired {
                    self.release_proxy(&key).await;
                }
                if owns_session {
                    self.release_ownership(&key).await;
                }
                match failure.error {
                    GatewayError::ShuttingDown(_) => {
                        info!("Abandoned connection for {}: pool shut down meanwhile", key);
                        Ok(false)
                    }
                    GatewayError::Protocol(_) => {
                        self.report_error("add_connection", Some(&key), failure.error.to_string())
                            .await;
                        Err(failure.error)
                    }
                    _ => {
                        self.report_error("add_connection", Some(&key), failure.error.to_string())
                            .await;
                        Ok(false)
                    }
                }
            }
        }
    }

    /// Ask the coordinator whether this instance may hold the session.
    /// Returns whether ownership was newly requested and granted.
    async fn acquire_ownership(&self, key: &SessionKey) -> Result<bool> {
        let coordinator = &self.collaborators.coordinator;
        if coordinator.should_handle_session(key.clone()).await? {
            return Ok(false);
        }
        if coordinator.request_session_ownership(key.clone()).await? {
            info!("Took ownership of {}", key);
            Ok(true)
        } else {
            Err(ownership_refused(key))
        }
    }

    async fn release_ownership(&self, key: &SessionKey) {
        if let Err(e) = self
            .collaborators
            .coordinator
            .release_session_ownership(key.clone())
            .await
        {
            warn!("Failed to release ownership of {}: {}", key, e);
        }
    }

    async fn release_proxy(&self, key: &SessionKey) {
        if let Err(e) = self.collaborators.proxy.release_proxy(key.clone()).await {
            warn!("Failed to release proxy for {}: {}", key, e);
        }
    }

    async fn open_connection(
        self: &Arc<Self>,
        key: &SessionKey,
        options: &AddConnectionOptions,
    ) -> std::result::Result<(), OpenFailure> {
        if options.force_new {
            info!("Discarding stored credentials for {}", key);
            self.persistence.delete_session(key).await;
        }

        self.collaborators
            .state
            .initialize_state(key.clone(), self.config.instance_url.clone())
            .await
            .map_err(OpenFailure::before_session)?;
        let (auth, session_opened) = self
            .persistence
            .open_or_reuse(key)
            .await
            .map_err(OpenFailure::before_session)?;

        let proxy = if self.config.skip_proxy {
            None
        } else {
            self.collaborators
                .proxy
                .create_proxy_agent(key.clone(), options.proxy_country.clone())
                .await
                .map_err(|error| OpenFailure {
                    error,
                    proxy_acquired: false,
                    session_opened,
                })?
        };
        let has_proxy = proxy.is_some();

        let socket_options = SocketOptions {
            key: key.clone(),
            browser_name: options
                .browser_name
                .clone()
                .unwrap_or_else(|| self.config.browser_name.clone()),
            proxy,
            is_recovery: options.is_recovery,
        };
        let handle = self
            .collaborators
            .sockets
            .create_socket(auth, socket_options)
            .await
            .map_err(|e| OpenFailure {
                error: match e {
                    GatewayError::Protocol(_) => e,
                    other => GatewayError::Protocol(other.to_string()),
                },
                proxy_acquired: has_proxy,
                session_opened,
            })?;

        // Shutdown may have started while the socket was being built
        let admitted = {
            let _gate = self.admission.lock().unwrap_or_else(PoisonError::into_inner);
            if self.accepting.load(Ordering::SeqCst) {
                let now = Utc::now();
                let event_pump = ScheduledTask::spawn(
                    format!("events:{}", key),
                    Self::pump_events(Arc::downgrade(self), key.clone(), handle.events),
                );
                self.connections.insert(
                    key.clone(),
                    ConnectionRecord {
                        info: ConnectionInfo {
                            key: key.clone(),
                            status: ConnectionStatus::Connecting,
                            proxy_country: options.proxy_country.clone(),
                            instance_url: self.config.instance_url.clone(),
                            created_at: now,
                            last_activity: now,
                            messages_sent: 0,
                            messages_received: 0,
                            qr_code: None,
                        },
                        socket: handle.socket.clone(),
                        has_proxy,
                        qr_timer: None,
                        event_pump: Some(event_pump),
                    },
                );
                true
            } else {
                false
            }
        };
        if !admitted {
            if let Err(e) = handle.socket.close().await {
                warn!("Failed to close abandoned socket for {}: {}", key, e);
            }
            return Err(OpenFailure {
                error: GatewayError::ShuttingDown("connection pool".to_string()),
                proxy_acquired: has_proxy,
                session_opened,
            });
        }

        if let Err(e) = self
            .collaborators
            .health
            .register_connection(key.to_string(), handle.socket)
            .await
        {
            warn!("Failed to register {} with health registrar: {}", key, e);
        }

        info!(
            "Connection created for {} (recovery={}, proxy={})",
            key, options.is_recovery, has_proxy
        );
        self.emit(PoolEvent::WebsocketCreated { key: key.clone() });
        Ok(())
    }

    async fn pump_events(
        pool: Weak<Self>,
        key: SessionKey,
        mut events: mpsc::Receiver<SocketEvent>,
    ) {
        while let Some(event) = events.recv().await {
            let Some(pool) = pool.upgrade() else {
                break;
            };
            pool.handle_socket_event(&key, event).await;
        }
        debug!("Event stream for {} ended", key);
    }

    async fn handle_socket_event(self: &Arc<Self>, key: &SessionKey, event: SocketEvent) {
        match event {
            SocketEvent::CredsUpdate(update) => {
                if let Err(e) = self.persistence.save_credentials(key, &update).await {
                    self.report_error("save_credentials", Some(key), e.to_string())
                        .await;
                }
            }
            SocketEvent::ConnectionUpdate {
                connection,
                qr,
                last_disconnect,
            } => {
                if let Some(qr) = qr {
                    self.handle_qr(key, qr);
                }
                match connection {
                    Some(TransportState::Connecting) => {
                        self.set_status(key, ConnectionStatus::Connecting, None).await;
                    }
                    Some(TransportState::Open) => {
                        if let Some(mut record) = self.connections.get_mut(key) {
                            record.info.qr_code = None;
                            if let Some(timer) = record.qr_timer.take() {
                                timer.cancel();
                            }
                        }
                        self.persistence.touch(key);
                        self.set_status(key, ConnectionStatus::Open, None).await;
                        info!("Connection open for {}", key);
                    }
                    Some(TransportState::Close) => {
                        let logged_out = last_disconnect
                            .as_ref()
                            .is_some_and(|reason| reason.is_logged_out());
                        let reason = last_disconnect.map(|reason| reason.message);
                        if logged_out {
                            warn!("Session {} was logged out", key);
                            self.set_status(key, ConnectionStatus::LoggedOut, reason)
                                .await;
                            self.spawn_logged_out_teardown(key.clone());
                        } else {
                            info!("Connection closed for {}: {:?}", key, reason);
                            self.set_status(key, ConnectionStatus::Closed, reason).await;
                        }
                    }
                    None => {}
                }
            }
            SocketEvent::MessagesUpsert(messages) => {
                if let Some(mut record) = self.connections.get_mut(key) {
                    record.info.messages_received += messages.len() as u64;
                    record.info.last_activity = Utc::now();
                }
                self.persistence.touch(key);
                for message in messages {
                    self.emit(PoolEvent::MessageReceived {
                        key: key.clone(),
                        message,
                    });
                }
            }
        }
    }

    fn handle_qr(self: &Arc<Self>, key: &SessionKey, qr: String) {
        let timeout = self.config.qr_timeout();
        let Some(mut record) = self.connections.get_mut(key) else {
            return;
        };
        record.info.qr_code = Some(qr.clone());

        let pool = Arc::downgrade(self);
        let expiring_key = key.clone();
        let expiring_qr = qr.clone();
        let timer = ScheduledTask::after(format!("qr:{}", key), timeout, async move {
            let Some(pool) = pool.upgrade() else {
                return;
            };
            if let Some(mut record) = pool.connections.get_mut(&expiring_key)
                && record.info.qr_code.as_deref() == Some(expiring_qr.as_str())
            {
                record.info.qr_code = None;
                debug!("QR code for {} expired", expiring_key);
            }
        });
        if let Some(previous) = record.qr_timer.replace(timer) {
            previous.cancel();
        }
        drop(record);

        self.emit(PoolEvent::QrGenerated {
            key: key.clone(),
            qr,
            expires_in_ms: timeout.as_millis() as u64,
        });
    }

    async fn set_status(&self, key: &SessionKey, status: ConnectionStatus, reason: Option<String>) {
        match self.connections.get_mut(key) {
            Some(mut record) => {
                record.info.status = status;
                record.info.last_activity = Utc::now();
            }
            None => return,
        }
        if let Err(e) = self
            .collaborators
            .state
            .update_state(key.clone(), status)
            .await
        {
            warn!("Failed to store status {} for {}: {}", status, key, e);
        }
        self.emit(PoolEvent::ConnectionUpdate {
            key: key.clone(),
            status,
            reason,
        });
    }

    /// A logged out session is dead: drop the connection and its credentials.
    /// Runs outside the event pump because removal stops the pump.
    fn spawn_logged_out_teardown(self: &Arc<Self>, key: SessionKey) {
        let pool = self.clone();
        tokio::spawn(async move {
            pool.remove_session_connection(&key, true, "logged-out").await;
            pool.persistence.delete_session(&key).await;
        });
    }

    /// Tear down a connection. Returns whether one existed.
    pub async fn remove_connection(
        &self,
        user_id: &str,
        phone: &str,
        skip_logout: bool,
        reason: &str,
    ) -> Result<bool> {
        let key = SessionKey::new(user_id, phone, None)?;
        Ok(self.remove_session_connection(&key, skip_logout, reason).await)
    }

    /// Key-based form of [`Self::remove_connection`].
    pub async fn remove_session_connection(
        &self,
        key: &SessionKey,
        skip_logout: bool,
        reason: &str,
    ) -> bool {
        let _guard = self.locks.lock(key).await;
        self.remove_locked(key, skip_logout, reason).await
    }

    async fn remove_locked(&self, key: &SessionKey, skip_logout: bool, reason: &str) -> bool {
        let Some((_, mut record)) = self.connections.remove(key) else {
            return false;
        };
        self.release_slot();

        if let Some(timer) = record.qr_timer.take() {
            timer.cancel();
        }
        if !skip_logout
            && record.info.status != ConnectionStatus::LoggedOut
            && let Err(e) = record.socket.logout().await
        {
            warn!("Logout of {} failed: {}", key, e);
        }
        if let Err(e) = record.socket.close().await {
            warn!("Closing transport of {} failed: {}", key, e);
        }
        if let Some(pump) = record.event_pump.take() {
            pump.cancel();
        }
        if record.has_proxy {
            self.release_proxy(key).await;
        }
        if let Err(e) = self
            .collaborators
            .health
            .unregister_connection(key.to_string())
            .await
        {
            warn!("Failed to unregister {}: {}", key, e);
        }
        self.release_ownership(key).await;

        let final_status = match record.info.status {
            ConnectionStatus::LoggedOut => ConnectionStatus::LoggedOut,
            _ if !skip_logout => ConnectionStatus::LoggedOut,
            _ => ConnectionStatus::Closed,
        };
        if let Err(e) = self
            .collaborators
            .state
            .update_state(key.clone(), final_status)
            .await
        {
            warn!("Failed to store final status for {}: {}", key, e);
        }

        info!("Connection removed for {} ({})", key, reason);
        self.emit(PoolEvent::WebsocketClosed {
            key: key.clone(),
            reason: reason.to_string(),
        });
        true
    }

    /// Snapshot of a connection; invalid numbers simply have none.
    pub fn get_connection(&self, user_id: &str, phone: &str) -> Option<ConnectionInfo> {
        let key = SessionKey::new(user_id, phone, None).ok()?;
        self.connections.get(&key).map(|record| record.info.clone())
    }

    /// Snapshots of every connection.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let mut all: Vec<_> = self
            .connections
            .iter()
            .map(|record| record.info.clone())
            .collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }

    /// Send a message over an open connection.
    ///
    /// `None` when there is no open connection or the send failed.
    pub async fn send_message(
        &self,
        user_id: &str,
        phone: &str,
        to: &str,
        content: MessageContent,
    ) -> Result<Option<String>> {
        let key = SessionKey::new(user_id, phone, None)?;
        let socket = match self.connections.get(&key) {
            Some(record) if record.info.status == ConnectionStatus::Open => record.socket.clone(),
            Some(record) => {
                debug!("Cannot send for {}: connection is {}", key, record.info.status);
                return Ok(None);
            }
            None => return Ok(None),
        };

        match socket.send_message(to.to_string(), content).await {
            Ok(message_id) => {
                if let Some(mut record) = self.connections.get_mut(&key) {
                    record.info.messages_sent += 1;
                    record.info.last_activity = Utc::now();
                }
                self.persistence.touch(&key);
                Ok(Some(message_id))
            }
            Err(e) => {
                warn!("Send from {} failed: {}", key, e);
                self.report_error("send_message", Some(&key), e.to_string())
                    .await;
                Ok(None)
            }
        }
    }

    /// Pool counters and a fresh memory sample.
    pub fn get_metrics(&self) -> PoolMetrics {
        let mut active = 0;
        let mut pending = 0;
        for record in self.connections.iter() {
            match record.info.status {
                ConnectionStatus::Open => active += 1,
                ConnectionStatus::Connecting => pending += 1,
                _ => {}
            }
        }
        PoolMetrics {
            total_connections: self.connections.len(),
            active_connections: active,
            pending_connections: pending,
            memory_usage: self.memory.sample(),
            proxy_metrics: self.collaborators.proxy.metrics(),
            total_sessions: self.persistence.session_count(),
        }
    }

    /// Sample metrics, broadcast them and flag memory pressure.
    pub fn check_health(&self) -> PoolMetrics {
        let metrics = self.get_metrics();
        let usage = &metrics.memory_usage;
        let above = usage.ratio >= self.config.memory_threshold;
        // Only the transition into pressure is reported
        if above && !self.memory_pressure.swap(true, Ordering::SeqCst) {
            warn!(
                "Memory pressure {:.2} exceeds threshold {:.2} ({} of {} bytes)",
                usage.ratio, self.config.memory_threshold, usage.rss_bytes, usage.limit_bytes
            );
            self.emit(PoolEvent::MemoryThresholdExceeded {
                usage: usage.clone(),
                threshold: self.config.memory_threshold,
            });
        } else if !above && self.memory_pressure.swap(false, Ordering::SeqCst) {
            info!(
                "Memory pressure {:.2} back under threshold {:.2}",
                usage.ratio, self.config.memory_threshold
            );
        }
        self.emit(PoolEvent::HealthCheck {
            metrics: metrics.clone(),
        });
        metrics
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Stop accepting connections, tear every connection down and shut down
    /// the owned collaborators and the persistence manager.
    ///
    /// With `preserve_sessions` sockets are closed without signing out, so the
    /// sessions can be recovered by the next process.
    pub async fn shutdown(&self, preserve_sessions: bool) {
        let was_accepting = {
            let _gate = self.admission.lock().unwrap_or_else(PoisonError::into_inner);
            self.accepting.swap(false, Ordering::SeqCst)
        };
        if !was_accepting {
            debug!("Connection pool already shut down");
            return;
        }
        info!(
            "Shutting down connection pool ({} connections, preserve_sessions={})",
            self.connections.len(),
            preserve_sessions
        );
        self.set_health_task(None);

        // Every record was admitted before `accepting` flipped, so draining
        // until empty catches connections that finished opening meanwhile
        loop {
            let keys: Vec<SessionKey> =
                self.connections.iter().map(|r| r.key().clone()).collect();
            if keys.is_empty() {
                break;
            }
            for key in keys {
                self.remove_session_connection(&key, preserve_sessions, "shutdown")
                    .await;
            }
        }

        if let Err(e) = self.collaborators.health.shutdown().await {
            error!("Health registrar shutdown failed: {}", e);
        }
        self.collaborators.errors.shutdown().await;
        if let Err(e) = self.collaborators.coordinator.shutdown().await {
            error!("Instance coordinator shutdown failed: {}", e);
        }
        self.persistence.shutdown().await;

        self.locks.prune();
        info!("Connection pool shut down");
    }
}

/// Why opening a connection failed, and what must be released.
struct OpenFailure {
    error: GatewayError,
    proxy_acquired: bool,
    /// This attempt started tracking the session in persistence
    session_opened: bool,
}

impl OpenFailure {
    fn before_session(error: GatewayError) -> Self {
        Self {
            error,
            proxy_acquired: false,
            session_opened: false,
        }
    }
}
