//! Remote tier storage clients.
//!
//! The persistence manager talks to object storage and to a document database
//! through the narrow [`ObjectStore`] and [`MetadataStore`] traits. This module
//! ships filesystem-backed implementations (so `hybrid` and `cloud` run
//! against a mounted volume without any cloud account) and in-memory ones.

use crate::config::StorageTier;
use crate::error::{GatewayError, Result};
use crate::session::auth::write_atomic;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::fs as async_fs;
use tokio::sync::RwLock;
use tracing::debug;

/// Listing entry of a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

/// Blob storage addressed by namespaced keys.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// All objects whose key starts with `prefix`, sorted by key.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>>;

    /// Delete one object; deleting a missing object succeeds.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Outcome of the most recent backup of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    Ok,
    Failed,
}

/// Backup status document kept in the metadata database, one per session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionBackupDocument {
    pub user_id: String,
    pub phone_number: String,
    pub tier: StorageTier,
    pub last_backup_at: DateTime<Utc>,
    pub file_count: usize,
    pub status: BackupStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Document database holding backup status.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn upsert(&self, id: &str, document: &SessionBackupDocument) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<SessionBackupDocument>>;

    /// Delete one document; deleting a missing document succeeds.
    async fn delete(&self, id: &str) -> Result<()>;
}

/// Object store rooted at `<root>/<bucket>`; keys map to relative paths.
pub struct FsObjectStore {
    base: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: &Path, bucket: &str) -> Self {
        Self {
            base: root.join(bucket),
        }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(GatewayError::Storage(format!("Invalid object key '{}'", key)));
        }
        Ok(self.base.join(relative))
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.base).ok()?;
        let parts: Vec<&str> = relative
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<_>>()?;
        Some(parts.join("/"))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            async_fs::create_dir_all(parent).await.map_err(|e| {
                GatewayError::Storage(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }
        write_atomic(&path, &data)
            .await
            .map_err(|e| GatewayError::Storage(format!("Failed to put '{}': {}", key, e)))?;
        debug!("Stored object {} ({} bytes)", key, data.len());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match async_fs::read(self.path_for(key)?).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(GatewayError::Storage(format!("Failed to get '{}': {}", key, e))),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let mut objects = Vec::new();
        if !async_fs::try_exists(&self.base).await? {
            return Ok(objects);
        }

        let mut pending = vec![self.base.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match async_fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(GatewayError::Storage(format!(
                        "Failed to list {}: {}",
                        dir.display(),
                        e
                    )));
                }
            };

            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let metadata = entry.metadata().await?;
                if metadata.is_dir() {
                    pending.push(path);
                    continue;
                }
                let hidden = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with('.'));
                if hidden {
                    continue;
                }
                if let Some(key) = self.key_for(&path)
                    && key.starts_with(prefix)
                {
                    let created = metadata.created().or_else(|_| metadata.modified())?;
                    objects.push(ObjectInfo {
                        key,
                        size: metadata.len(),
                        created_at: created.into(),
                    });
                }
            }
        }

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match async_fs::remove_file(self.path_for(key)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(GatewayError::Storage(format!("Failed to delete '{}': {}", key, e))),
        }
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    created_at: DateTime<Utc>,
}

/// In-memory object store with failure injection, for tests and embedding.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<BTreeMap<String, StoredObject>>,
    failing_keys: Mutex<HashSet<String>>,
    fail_all: std::sync::atomic::AtomicBool,
    put_delay_ms: std::sync::atomic::AtomicU64,
    puts: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `put` whose key ends with `suffix` fail.
    pub fn fail_puts_ending_with(&self, suffix: &str) {
        if let Ok(mut keys) = self.failing_keys.lock() {
            keys.insert(suffix.to_string());
        }
    }

    /// Make every operation fail, simulating an unreachable service.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.fail_all.store(unavailable, Ordering::SeqCst);
    }

    /// Make every `put` take at least `delay`, simulating a slow service.
    pub fn set_put_delay(&self, delay: std::time::Duration) {
        self.put_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of successful `put` calls so far.
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    /// Overwrite the stored creation timestamp of an object.
    pub async fn set_created_at(&self, key: &str, created_at: DateTime<Utc>) {
        if let Some(object) = self.objects.write().await.get_mut(key) {
            object.created_at = created_at;
        }
    }

    /// Overwrite the raw bytes of an object, bypassing encryption.
    pub async fn corrupt(&self, key: &str, data: Vec<u8>) {
        if let Some(object) = self.objects.write().await.get_mut(key) {
            object.data = data;
        }
    }

    pub async fn keys(&self) -> Vec<String> {
        self.objects.read().await.keys().cloned().collect()
    }

    fn check_available(&self) -> Result<()> {
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(GatewayError::Storage("object store unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        self.check_available()?;
        let delay_ms = self.put_delay_ms.load(Ordering::SeqCst);
        if delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
        }
        let rejected = self
            .failing_keys
            .lock()
            .map(|keys| keys.iter().any(|suffix| key.ends_with(suffix.as_str())))
            .unwrap_or(false);
        if rejected {
            return Err(GatewayError::Storage(format!("injected failure for '{}'", key)));
        }

        self.objects.write().await.insert(
            key.to_string(),
            StoredObject {
                data,
                created_at: Utc::now(),
            },
        );
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_available()?;
        Ok(self.objects.read().await.get(key).map(|o| o.data.clone()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        self.check_available()?;
        Ok(self
            .objects
            .read()
            .await
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, object)| ObjectInfo {
                key: key.clone(),
                size: object.data.len() as u64,
                created_at: object.created_at,
            })
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_available()?;
        self.objects.write().await.remove(key);
        Ok(())
    }
}

/// Metadata documents stored as one JSON file each under a directory.
pub struct FsMetadataStore {
    dir: PathBuf,
}

impl FsMetadataStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    fn path_for(&self, id: &str) -> PathBuf {
        let file_name: String = id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '+' || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", file_name))
    }
}

#[async_trait]
impl MetadataStore for FsMetadataStore {
    async fn upsert(&self, id: &str, document: &SessionBackupDocument) -> Result<()> {
        async_fs::create_dir_all(&self.dir).await?;
        write_atomic(&self.path_for(id), &serde_json::to_vec_pretty(document)?).await
    }

    async fn get(&self, id: &str) -> Result<Option<SessionBackupDocument>> {
        match async_fs::read(self.path_for(id)).await {
            Ok(content) => Ok(Some(serde_json::from_slice(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, id: &str) -> Result<()> {
        match async_fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory metadata store.
#[derive(Default)]
pub struct MemoryMetadataStore {
    documents: RwLock<HashMap<String, SessionBackupDocument>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn upsert(&self, id: &str, document: &SessionBackupDocument) -> Result<()> {
        self.documents
            .write()
            .await
            .insert(id.to_string(), document.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<SessionBackupDocument>> {
        Ok(self.documents.read().await.get(id).cloned())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.documents.write().await.remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn document(status: BackupStatus) -> SessionBackupDocument {
        SessionBackupDocument {
            user_id: "alice".to_string(),
            phone_number: "+15550001111".to_string(),
            tier: StorageTier::Hybrid,
            last_backup_at: Utc::now(),
            file_count: 3,
            status,
            error: None,
        }
    }

    #[tokio::test]
    async fn test_fs_object_store_put_get_list_delete() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsObjectStore::new(temp_dir.path(), "bucket");

        store
            .put("sessions/alice/+15550001111/creds.json", b"one".to_vec())
            .await
            .unwrap();
        store
            .put("sessions/alice/+15550001111/pre-key-1.json", b"two".to_vec())
            .await
            .unwrap();
        store
            .put("sessions/bob/+15550002222/creds.json", b"three".to_vec())
            .await
            .unwrap();

        assert_eq!(
            store.get("sessions/alice/+15550001111/creds.json").await.unwrap(),
            Some(b"one".to_vec())
        );
        assert_eq!(store.get("sessions/nobody/creds.json").await.unwrap(), None);

        let alice = store.list("sessions/alice/+15550001111/").await.unwrap();
        assert_eq!(alice.len(), 2);
        assert_eq!(alice[0].key, "sessions/alice/+15550001111/creds.json");
        assert_eq!(alice[0].size, 3);
        assert_eq!(store.list("sessions/").await.unwrap().len(), 3);

        store
            .delete("sessions/alice/+15550001111/creds.json")
            .await
            .unwrap();
        store
            .delete("sessions/alice/+15550001111/creds.json")
            .await
            .unwrap();
        assert_eq!(store.list("sessions/alice/").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fs_object_store_rejects_traversal() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsObjectStore::new(temp_dir.path(), "bucket");
        assert!(store.put("../escape", b"x".to_vec()).await.is_err());
        assert!(store.put("/absolute", b"x".to_vec()).await.is_err());
        assert!(store.list("sessions/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_object_store_failure_injection() {
        let store = MemoryObjectStore::new();
        store.fail_puts_ending_with("b.json");

        store.put("ns/a.json", b"a".to_vec()).await.unwrap();
        assert!(store.put("ns/b.json", b"b".to_vec()).await.is_err());
        assert_eq!(store.put_count(), 1);

        store.set_unavailable(true);
        assert!(store.list("ns/").await.is_err());
        store.set_unavailable(false);
        assert_eq!(store.list("ns/").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_metadata_stores() {
        let temp_dir = TempDir::new().unwrap();
        let fs_store = FsMetadataStore::new(temp_dir.path());
        let memory_store = MemoryMetadataStore::new();
        let stores: [&dyn MetadataStore; 2] = [&fs_store, &memory_store];

        for store in stores {
            let id = "alice:+15550001111";
            assert_eq!(store.get(id).await.unwrap(), None);

            store.upsert(id, &document(BackupStatus::Ok)).await.unwrap();
            store.upsert(id, &document(BackupStatus::Failed)).await.unwrap();
            let stored = store.get(id).await.unwrap().unwrap();
            assert_eq!(stored.status, BackupStatus::Failed);
            assert_eq!(stored.file_count, 3);

            store.delete(id).await.unwrap();
            store.delete(id).await.unwrap();
            assert_eq!(store.get(id).await.unwrap(), None);
        }
    }
}
