//! Tiered session persistence.
//!
//! [`SessionPersistenceManager`] keeps each session's credential directory
//! under `<sessions_root>/<user>-<phone>/` and, depending on the storage tier,
//! mirrors it to remote object storage:
//!
//! - `local`: filesystem only.
//! - `hybrid`: filesystem authoritative, mirrored on a per-session backup
//!   timer. A metadata document records the outcome of each backup.
//! - `cloud`: remote authoritative. Reads and writes go through the
//!   [`CloudOptimizer`] and credential updates are uploaded as they happen.
//!
//! Every remote blob is encrypted independently (see [`SessionCipher`]).
//! Backups are a best-effort mirror: when one upload fails the call fails,
//! and files uploaded before it stay in place.

use crate::config::{StorageConfig, StorageTier};
use crate::env;
use crate::error::{GatewayError, Result};
use crate::keyed_lock::KeyedLocks;
use crate::scheduled::ScheduledTask;
use crate::session::auth::{AuthState, write_atomic};
use crate::session::crypto::SessionCipher;
use crate::session::key::SessionKey;
use crate::session::optimizer::CloudOptimizer;
use crate::session::storage::{
    BackupStatus, FsMetadataStore, FsObjectStore, MetadataStore, ObjectInfo, ObjectStore,
    SessionBackupDocument,
};
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::fs as async_fs;
use tracing::{debug, error, info, warn};

/// Storage backend selected once from the configured tier.
pub enum TierBackend {
    Local,
    Hybrid {
        store: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataStore>,
    },
    Cloud {
        optimizer: Arc<CloudOptimizer>,
        metadata: Arc<dyn MetadataStore>,
    },
}

impl TierBackend {
    pub fn tier(&self) -> StorageTier {
        match self {
            TierBackend::Local => StorageTier::Local,
            TierBackend::Hybrid { .. } => StorageTier::Hybrid,
            TierBackend::Cloud { .. } => StorageTier::Cloud,
        }
    }

    fn metadata(&self) -> Option<&Arc<dyn MetadataStore>> {
        match self {
            TierBackend::Local => None,
            TierBackend::Hybrid { metadata, .. } | TierBackend::Cloud { metadata, .. } => {
                Some(metadata)
            }
        }
    }

    fn no_remote() -> GatewayError {
        GatewayError::Config("the local storage tier has no remote storage".to_string())
    }

    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        match self {
            TierBackend::Local => Err(Self::no_remote()),
            TierBackend::Hybrid { store, .. } => store.put(key, data).await,
            TierBackend::Cloud { optimizer, .. } => optimizer.put(key, data).await,
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self {
            TierBackend::Local => Err(Self::no_remote()),
            TierBackend::Hybrid { store, .. } => store.get(key).await,
            TierBackend::Cloud { optimizer, .. } => optimizer.get(key).await,
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        match self {
            TierBackend::Local => Ok(Vec::new()),
            TierBackend::Hybrid { store, .. } => store.list(prefix).await,
            TierBackend::Cloud { optimizer, .. } => optimizer.list(prefix).await,
        }
    }

    async fn exists(&self, prefix: &str) -> Result<bool> {
        match self {
            TierBackend::Local => Ok(false),
            TierBackend::Hybrid { store, .. } => Ok(!store.list(prefix).await?.is_empty()),
            TierBackend::Cloud { optimizer, .. } => optimizer.exists(prefix).await,
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match self {
            TierBackend::Local => Ok(()),
            TierBackend::Hybrid { store, .. } => store.delete(key).await,
            TierBackend::Cloud { optimizer, .. } => optimizer.delete(key).await,
        }
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        match self {
            TierBackend::Local => Ok(0),
            TierBackend::Hybrid { store, .. } => {
                let objects = store.list(prefix).await?;
                for object in &objects {
                    store.delete(&object.key).await?;
                }
                Ok(objects.len())
            }
            TierBackend::Cloud { optimizer, .. } => optimizer.delete_prefix(prefix).await,
        }
    }
}

/// In-memory view of one tracked session.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub key: SessionKey,
    pub auth: Arc<AuthState>,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

/// Registry entry: the record plus the timers it owns.
struct SessionEntry {
    record: SessionRecord,
    backup_timer: Option<ScheduledTask>,
}

impl SessionEntry {
    fn teardown(&mut self) {
        if let Some(timer) = self.backup_timer.take() {
            timer.cancel();
        }
    }
}

/// Result of a successful backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupReport {
    pub key: SessionKey,
    pub files: usize,
    pub bytes: u64,
}

/// Result of a restore attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    Restored { files: usize },
    NotFound,
}

/// Session persistence across the local, hybrid and cloud tiers.
pub struct SessionPersistenceManager {
    sessions_root: PathBuf,
    backend: TierBackend,
    cipher: SessionCipher,
    backup_interval: Duration,
    registry: DashMap<SessionKey, SessionEntry>,
    locks: KeyedLocks<SessionKey>,
    closed: AtomicBool,
}

impl SessionPersistenceManager {
    /// Build the manager and its storage backend from configuration.
    ///
    /// Remote tiers use filesystem-backed object and metadata stores rooted at
    /// `remote_root`.
    pub fn from_config(config: &StorageConfig) -> Result<Arc<Self>> {
        let cipher = SessionCipher::from_config(config.encryption_key.as_deref())?;
        let metadata_dir = config.remote_root.join(env::session::METADATA_DIR_NAME);

        let backend = match config.tier {
            StorageTier::Local => TierBackend::Local,
            StorageTier::Hybrid => TierBackend::Hybrid {
                store: Arc::new(FsObjectStore::new(&config.remote_root, &config.bucket)),
                metadata: Arc::new(FsMetadataStore::new(&metadata_dir)),
            },
            StorageTier::Cloud => TierBackend::Cloud {
                optimizer: CloudOptimizer::new(
                    Arc::new(FsObjectStore::new(&config.remote_root, &config.bucket)),
                    config.cloud.clone(),
                ),
                metadata: Arc::new(FsMetadataStore::new(&metadata_dir)),
            },
        };

        Ok(Self::with_backend(
            &config.sessions_root,
            backend,
            cipher,
            config.backup_interval(),
        ))
    }

    /// Build the manager around an explicit backend.
    pub fn with_backend(
        sessions_root: &Path,
        backend: TierBackend,
        cipher: SessionCipher,
        backup_interval: Duration,
    ) -> Arc<Self> {
        info!(
            "Session persistence initialized: tier={}, root={}, ephemeral_key={}",
            backend.tier(),
            sessions_root.display(),
            cipher.is_ephemeral()
        );
        Arc::new(Self {
            sessions_root: sessions_root.to_path_buf(),
            backend,
            cipher,
            backup_interval,
            registry: DashMap::new(),
            locks: KeyedLocks::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn tier(&self) -> StorageTier {
        self.backend.tier()
    }

    pub fn sessions_root(&self) -> &Path {
        &self.sessions_root
    }

    /// Number of sessions tracked in memory.
    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    /// Snapshot of a tracked session.
    pub fn session_record(&self, key: &SessionKey) -> Option<SessionRecord> {
        self.registry.get(key).map(|entry| entry.record.clone())
    }

    /// Whether a backup timer is armed for `key`.
    pub fn has_backup_timer(&self, key: &SessionKey) -> bool {
        self.registry
            .get(key)
            .is_some_and(|entry| entry.backup_timer.is_some())
    }

    pub fn session_dir(&self, key: &SessionKey) -> PathBuf {
        env::session_dir_path(&self.sessions_root, &key.user_id, &key.phone_number)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GatewayError::ShuttingDown(
                "session persistence".to_string(),
            ));
        }
        Ok(())
    }

    /// Auth state for a session, restoring or creating it as needed.
    pub async fn get_or_create_auth_state(
        self: &Arc<Self>,
        user_id: &str,
        phone: &str,
    ) -> Result<Arc<AuthState>> {
        let key = SessionKey::new(user_id, phone, None)?;
        self.open_session(&key).await
    }

    /// Key-based form of [`Self::get_or_create_auth_state`].
    pub async fn open_session(self: &Arc<Self>, key: &SessionKey) -> Result<Arc<AuthState>> {
        self.open_or_reuse(key).await.map(|(auth, _)| auth)
    }

    /// Like [`Self::open_session`]; the flag is true when this call started
    /// tracking the session rather than reusing a tracked one.
    pub async fn open_or_reuse(
        self: &Arc<Self>,
        key: &SessionKey,
    ) -> Result<(Arc<AuthState>, bool)> {
        self.ensure_open()?;
        let _guard = self.locks.lock(key).await;
        let now = Utc::now();

        if let Some(mut entry) = self.registry.get_mut(key) {
            entry.record.last_used = now;
            let auth = entry.record.auth.clone();
            entry.backup_timer = self.arm_backup_timer(key);
            debug!("Reusing tracked session {}", key);
            return Ok((auth, false));
        }

        let dir = self.session_dir(key);
        let mut restored = false;
        if self.tier().has_remote() && !has_local_credentials(&dir).await {
            match self.restore_into(key, &dir).await {
                Ok(RestoreOutcome::Restored { files }) => {
                    info!("Restored session {} from remote storage ({} files)", key, files);
                    restored = true;
                }
                Ok(RestoreOutcome::NotFound) => {
                    debug!("No remote backup for session {}", key);
                }
                Err(e) => {
                    warn!(
                        "Restore of session {} failed, starting fresh: {}",
                        key, e
                    );
                    remove_dir_if_exists(&dir).await;
                }
            }
        }

        let auth = match AuthState::load_or_init(&dir).await {
            Ok(auth) => auth,
            Err(e) if restored => {
                warn!("Restored credentials for {} are unusable, starting fresh: {}", key, e);
                remove_dir_if_exists(&dir).await;
                restored = false;
                AuthState::load_or_init(&dir).await?
            }
            Err(e) => return Err(e),
        };
        let auth = Arc::new(auth);

        if !restored && let TierBackend::Cloud { optimizer, .. } = &self.backend {
            self.enqueue_file(optimizer, key, &env::creds_file_path(&dir))
                .await;
        }

        self.registry.insert(
            key.clone(),
            SessionEntry {
                record: SessionRecord {
                    key: key.clone(),
                    auth: auth.clone(),
                    created_at: now,
                    last_used: now,
                },
                backup_timer: self.arm_backup_timer(key),
            },
        );
        info!("Session {} ready (tier={})", key, self.tier());
        Ok((auth, true))
    }

    /// Stop tracking a session and cancel its timers, keeping every file and
    /// remote object. Returns whether the session was tracked.
    pub async fn release_session(&self, key: &SessionKey) -> bool {
        let _guard = self.locks.lock(key).await;
        match self.registry.remove(key) {
            Some((_, mut entry)) => {
                entry.teardown();
                debug!("Released session {}", key);
                true
            }
            None => false,
        }
    }

    /// Recurring backup for hybrid sessions. The task holds only a weak
    /// reference so it never keeps the manager alive.
    fn arm_backup_timer(self: &Arc<Self>, key: &SessionKey) -> Option<ScheduledTask> {
        if self.tier() != StorageTier::Hybrid {
            return None;
        }
        let manager = Arc::downgrade(self);
        let timer_key = key.clone();
        Some(ScheduledTask::every(
            format!("backup:{}", key),
            self.backup_interval,
            move || {
                let manager = manager.clone();
                let key = timer_key.clone();
                async move {
                    let Some(manager) = manager.upgrade() else {
                        return;
                    };
                    match manager.backup_session(&key).await {
                        Ok(report) => debug!("Periodic backup of {}: {} files", key, report.files),
                        Err(e) => warn!("Periodic backup of {} failed: {}", key, e),
                    }
                }
            },
        ))
    }

    /// Persist a credentials update and refresh the session's last use.
    ///
    /// In the cloud tier the updated document is also queued for upload.
    pub async fn save_credentials(&self, key: &SessionKey, update: &Value) -> Result<()> {
        let _guard = self.locks.lock(key).await;
        let auth = match self.registry.get_mut(key) {
            Some(mut entry) => {
                entry.record.last_used = Utc::now();
                entry.record.auth.clone()
            }
            None => {
                return Err(GatewayError::NotFound(format!("session {} is not tracked", key)));
            }
        };

        auth.apply_update(update).await?;
        debug!("Persisted credentials update for {}", key);

        if let TierBackend::Cloud { optimizer, .. } = &self.backend {
            self.enqueue_file(optimizer, key, &env::creds_file_path(auth.dir()))
                .await;
        }
        Ok(())
    }

    /// Refresh the last use of a tracked session.
    pub fn touch(&self, key: &SessionKey) {
        if let Some(mut entry) = self.registry.get_mut(key) {
            entry.record.last_used = Utc::now();
        }
    }

    async fn enqueue_file(&self, optimizer: &CloudOptimizer, key: &SessionKey, path: &Path) {
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            return;
        };
        let result = match async_fs::read(path).await {
            Ok(content) => match self.cipher.encrypt(&content) {
                Ok(blob) => {
                    optimizer
                        .enqueue_upload(&key.remote_object_key(file_name), blob)
                        .await
                }
                Err(e) => Err(e),
            },
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            error!("Failed to queue upload of {} for {}: {}", file_name, key, e);
        }
    }

    /// Encrypt and upload every file of a session directory.
    pub async fn backup(&self, user_id: &str, phone: &str) -> Result<BackupReport> {
        let key = SessionKey::new(user_id, phone, None)?;
        self.backup_session(&key).await
    }

    /// Key-based form of [`Self::backup`].
    pub async fn backup_session(&self, key: &SessionKey) -> Result<BackupReport> {
        if !self.tier().has_remote() {
            return Err(TierBackend::no_remote());
        }
        let _guard = self.locks.lock(key).await;

        let dir = self.session_dir(key);
        let files = session_files(&dir).await?;
        if files.is_empty() {
            return Err(GatewayError::NotFound(format!(
                "no local files for session {}",
                key
            )));
        }

        let mut bytes = 0u64;
        let mut uploaded = 0usize;
        let mut failure = None;
        for (file_name, path) in &files {
            let upload = async {
                let content = async_fs::read(path).await?;
                let blob = self.cipher.encrypt(&content)?;
                let size = blob.len() as u64;
                self.backend
                    .put(&key.remote_object_key(file_name), blob)
                    .await?;
                Ok::<u64, GatewayError>(size)
            };
            match upload.await {
                Ok(size) => {
                    bytes += size;
                    uploaded += 1;
                    debug!("Backed up {} for {}", file_name, key);
                }
                Err(e) => {
                    failure = Some(GatewayError::Storage(format!(
                        "backup of {} for {} failed after {} of {} files: {}",
                        file_name,
                        key,
                        uploaded,
                        files.len(),
                        e
                    )));
                    break;
                }
            }
        }

        let document = SessionBackupDocument {
            user_id: key.user_id.clone(),
            phone_number: key.phone_number.clone(),
            tier: self.tier(),
            last_backup_at: Utc::now(),
            file_count: uploaded,
            status: if failure.is_some() {
                BackupStatus::Failed
            } else {
                BackupStatus::Ok
            },
            error: failure.as_ref().map(ToString::to_string),
        };
        if let Some(metadata) = self.backend.metadata()
            && let Err(e) = metadata.upsert(&key.metadata_id(), &document).await
        {
            warn!("Failed to record backup status for {}: {}", key, e);
        }

        match failure {
            Some(e) => {
                error!("{}", e);
                Err(e)
            }
            None => {
                info!("Backed up session {} ({} files, {} bytes)", key, uploaded, bytes);
                Ok(BackupReport {
                    key: key.clone(),
                    files: uploaded,
                    bytes,
                })
            }
        }
    }

    /// Download and decrypt a session's remote backup into `target_dir`.
    pub async fn restore(
        &self,
        user_id: &str,
        phone: &str,
        target_dir: &Path,
    ) -> Result<RestoreOutcome> {
        let key = SessionKey::new(user_id, phone, None)?;
        self.restore_into(&key, target_dir).await
    }

    /// Key-based form of [`Self::restore`].
    ///
    /// Every object is decrypted before anything is written, so a bad blob
    /// leaves `target_dir` untouched.
    pub async fn restore_into(&self, key: &SessionKey, target_dir: &Path) -> Result<RestoreOutcome> {
        if !self.tier().has_remote() {
            return Err(TierBackend::no_remote());
        }
        let prefix = key.remote_prefix();
        let objects = self.backend.list(&prefix).await?;
        if objects.is_empty() {
            return Ok(RestoreOutcome::NotFound);
        }

        let mut files = Vec::with_capacity(objects.len());
        for object in &objects {
            let Some(file_name) = object.key.strip_prefix(&prefix) else {
                continue;
            };
            if file_name.is_empty() || file_name.contains('/') || file_name.starts_with('.') {
                warn!("Skipping unexpected remote object {}", object.key);
                continue;
            }
            let blob = self.backend.get(&object.key).await?.ok_or_else(|| {
                GatewayError::Storage(format!("object {} vanished during restore", object.key))
            })?;
            let content = self.cipher.decrypt(&blob).map_err(|e| {
                GatewayError::Crypto(format!("cannot decrypt {}: {}", object.key, e))
            })?;
            files.push((file_name.to_string(), content));
        }
        if files.is_empty() {
            return Ok(RestoreOutcome::NotFound);
        }

        async_fs::create_dir_all(target_dir).await?;
        for (file_name, content) in &files {
            write_atomic(&target_dir.join(file_name), content).await?;
            debug!("Restored {} for {}", file_name, key);
        }
        Ok(RestoreOutcome::Restored { files: files.len() })
    }

    /// Forget a session and delete its local files, remote objects and
    /// metadata document. Each step is attempted regardless of the others.
    pub async fn delete(&self, user_id: &str, phone: &str) -> Result<()> {
        let key = SessionKey::new(user_id, phone, None)?;
        self.delete_session(&key).await;
        Ok(())
    }

    /// Key-based form of [`Self::delete`].
    pub async fn delete_session(&self, key: &SessionKey) {
        let _guard = self.locks.lock(key).await;
        self.delete_locked(key).await;
    }

    async fn delete_locked(&self, key: &SessionKey) {
        if let Some((_, mut entry)) = self.registry.remove(key) {
            entry.teardown();
        }

        let dir = self.session_dir(key);
        match async_fs::remove_dir_all(&dir).await {
            Ok(()) => debug!("Removed session directory {}", dir.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove session directory {}: {}", dir.display(), e),
        }

        if self.tier().has_remote() {
            match self.backend.delete_prefix(&key.remote_prefix()).await {
                Ok(count) => debug!("Deleted {} remote objects for {}", count, key),
                Err(e) => warn!("Failed to delete remote objects for {}: {}", key, e),
            }
        }
        if let Some(metadata) = self.backend.metadata()
            && let Err(e) = metadata.delete(&key.metadata_id()).await
        {
            warn!("Failed to delete metadata document for {}: {}", key, e);
        }
        info!("Deleted session {}", key);
    }

    /// Whether a session has local files or, in remote tiers, remote objects.
    pub async fn exists(&self, user_id: &str, phone: &str) -> Result<bool> {
        let key = SessionKey::new(user_id, phone, None)?;
        self.session_exists(&key).await
    }

    /// Key-based form of [`Self::exists`].
    pub async fn session_exists(&self, key: &SessionKey) -> Result<bool> {
        let dir = self.session_dir(key);
        if let Ok(mut entries) = async_fs::read_dir(&dir).await
            && entries.next_entry().await?.is_some()
        {
            return Ok(true);
        }
        self.backend.exists(&key.remote_prefix()).await
    }

    /// Every session with a credentials file under the sessions root.
    pub async fn list_all(&self) -> Result<Vec<SessionKey>> {
        let mut sessions = Vec::new();
        for (key, path) in self.scan_session_dirs().await? {
            let creds = async_fs::metadata(env::creds_file_path(&path)).await;
            if creds.is_ok_and(|metadata| metadata.is_file()) {
                sessions.push(key);
            } else {
                debug!("Skipping {}: no credentials file", path.display());
            }
        }
        sessions.sort();
        Ok(sessions)
    }

    async fn scan_session_dirs(&self) -> Result<Vec<(SessionKey, PathBuf)>> {
        let mut entries = match async_fs::read_dir(&self.sessions_root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut dirs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(key) = name.to_str().and_then(SessionKey::from_dir_name) else {
                continue;
            };
            dirs.push((key, entry.path()));
        }
        Ok(dirs)
    }

    /// Remove sessions unused for longer than `max_age`.
    pub async fn cleanup(&self, max_age: Duration) -> Result<usize> {
        self.cleanup_at(max_age, Utc::now()).await
    }

    /// [`Self::cleanup`] evaluated at `now`.
    ///
    /// Cleans tracked sessions whose last use is older than `max_age`,
    /// untracked session directories older than `max_age` and, in remote
    /// tiers, remote objects created more than `max_age` ago. Returns how many
    /// sessions, directories and objects were removed.
    pub async fn cleanup_at(&self, max_age: Duration, now: DateTime<Utc>) -> Result<usize> {
        let max_age = TimeDelta::from_std(max_age)
            .map_err(|e| GatewayError::Validation(format!("max age out of range: {}", e)))?;
        let is_expired = |at: DateTime<Utc>| now.signed_duration_since(at) > max_age;
        let mut cleaned = 0;

        let expired: Vec<SessionKey> = self
            .registry
            .iter()
            .filter(|entry| is_expired(entry.record.last_used))
            .map(|entry| entry.key().clone())
            .collect();
        for key in expired {
            let _guard = self.locks.lock(&key).await;
            // Re-check under the lock, the session may have been used meanwhile
            let still_expired = self
                .registry
                .get(&key)
                .is_some_and(|entry| is_expired(entry.record.last_used));
            if still_expired {
                self.delete_locked(&key).await;
                cleaned += 1;
            }
        }

        for (key, path) in self.scan_session_dirs().await? {
            if self.registry.contains_key(&key) {
                continue;
            }
            let modified = match async_fs::metadata(&path).await.and_then(|m| m.modified()) {
                Ok(modified) => DateTime::<Utc>::from(modified),
                Err(e) => {
                    warn!("Cannot read age of {}: {}", path.display(), e);
                    continue;
                }
            };
            if is_expired(modified) {
                match async_fs::remove_dir_all(&path).await {
                    Ok(()) => {
                        debug!("Removed orphan session directory {}", path.display());
                        cleaned += 1;
                    }
                    Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
                }
            }
        }

        if self.tier().has_remote() {
            let prefix = format!("{}/", env::remote::SESSIONS_PREFIX);
            match self.backend.list(&prefix).await {
                Ok(objects) => {
                    for object in objects.into_iter().filter(|o| is_expired(o.created_at)) {
                        match self.backend.delete(&object.key).await {
                            Ok(()) => {
                                debug!("Removed expired remote object {}", object.key);
                                cleaned += 1;
                            }
                            Err(e) => warn!("Failed to remove {}: {}", object.key, e),
                        }
                    }
                }
                Err(e) => warn!("Failed to list remote objects for cleanup: {}", e),
            }
        }

        self.locks.prune();
        if cleaned > 0 {
            info!("Session cleanup removed {} items", cleaned);
        }
        Ok(cleaned)
    }

    /// Stop timers, run a final hybrid backup of every tracked session,
    /// release the optimizer and forget all sessions.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down session persistence ({} sessions)", self.registry.len());

        let keys: Vec<SessionKey> = self
            .registry
            .iter_mut()
            .map(|mut entry| {
                entry.teardown();
                entry.key().clone()
            })
            .collect();

        if self.tier() == StorageTier::Hybrid {
            for key in &keys {
                if let Err(e) = self.backup_session(key).await {
                    error!("Final backup of {} failed: {}", key, e);
                }
            }
        }

        if let TierBackend::Cloud { optimizer, .. } = &self.backend {
            optimizer.flush().await;
            optimizer.shutdown().await;
        }

        self.registry.clear();
        self.locks.prune();
        info!("Session persistence shut down");
    }
}

async fn has_local_credentials(dir: &Path) -> bool {
    async_fs::try_exists(env::creds_file_path(dir))
        .await
        .unwrap_or(false)
}

async fn remove_dir_if_exists(dir: &Path) {
    if let Err(e) = async_fs::remove_dir_all(dir).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!("Failed to remove {}: {}", dir.display(), e);
    }
}

/// Regular, non-hidden files of a session directory, sorted by name.
async fn session_files(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut entries = match async_fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        files.push((name, entry.path()));
    }
    files.sort();
    Ok(files)
}
