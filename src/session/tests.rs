use crate::config::{CloudCacheConfig, StorageTier};
use crate::env;
use crate::session::*;
use chrono::{TimeDelta, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const TEST_KEY: [u8; KEY_LEN] = [0x5A; KEY_LEN];
const HOUR: Duration = Duration::from_secs(3600);

fn alice() -> SessionKey {
    SessionKey::new("alice", "+15550001111", None).unwrap()
}

fn local_manager(root: &TempDir) -> Arc<SessionPersistenceManager> {
    SessionPersistenceManager::with_backend(
        root.path(),
        TierBackend::Local,
        SessionCipher::new(TEST_KEY),
        HOUR,
    )
}

struct HybridFixture {
    manager: Arc<SessionPersistenceManager>,
    store: Arc<MemoryObjectStore>,
    metadata: Arc<MemoryMetadataStore>,
}

fn hybrid_manager(
    root: &TempDir,
    store: Arc<MemoryObjectStore>,
    backup_interval: Duration,
) -> HybridFixture {
    let metadata = Arc::new(MemoryMetadataStore::new());
    let manager = SessionPersistenceManager::with_backend(
        root.path(),
        TierBackend::Hybrid {
            store: store.clone(),
            metadata: metadata.clone(),
        },
        SessionCipher::new(TEST_KEY),
        backup_interval,
    );
    HybridFixture {
        manager,
        store,
        metadata,
    }
}

fn write_session_dir(root: &TempDir, name: &str, with_creds: bool) {
    let dir = root.path().join(name);
    std::fs::create_dir_all(&dir).unwrap();
    if with_creds {
        std::fs::write(dir.join(env::session::CREDS_FILE_NAME), b"{\"registered\":true}").unwrap();
    } else {
        std::fs::write(dir.join("notes.txt"), b"not a session").unwrap();
    }
}

#[tokio::test]
async fn test_list_all_parses_directory_names() {
    let root = TempDir::new().unwrap();
    write_session_dir(&root, "alice-+1000000001", true);
    write_session_dir(&root, "bob-+1000000002", true);
    write_session_dir(&root, "garbage", false);
    std::fs::write(root.path().join("stray-file.json"), b"{}").unwrap();

    let manager = local_manager(&root);
    let sessions = manager.list_all().await.unwrap();

    assert_eq!(
        sessions,
        vec![
            SessionKey {
                user_id: "alice".to_string(),
                phone_number: "+1000000001".to_string(),
            },
            SessionKey {
                user_id: "bob".to_string(),
                phone_number: "+1000000002".to_string(),
            },
        ]
    );
}

#[tokio::test]
async fn test_list_all_skips_directories_without_credentials() {
    let root = TempDir::new().unwrap();
    write_session_dir(&root, "carol-+15550003333", false);

    let manager = local_manager(&root);
    assert!(manager.list_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_list_all_on_missing_root() {
    let root = TempDir::new().unwrap();
    let manager = SessionPersistenceManager::with_backend(
        &root.path().join("does-not-exist"),
        TierBackend::Local,
        SessionCipher::new(TEST_KEY),
        HOUR,
    );
    assert!(manager.list_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_get_or_create_reuses_tracked_session() {
    let root = TempDir::new().unwrap();
    let manager = local_manager(&root);

    let first = manager
        .get_or_create_auth_state("alice", "+1 555 000 1111")
        .await
        .unwrap();
    let second = manager
        .get_or_create_auth_state("alice", "+15550001111")
        .await
        .unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(manager.session_count(), 1);
    assert!(root.path().join("alice-+15550001111/creds.json").exists());
    assert!(!manager.has_backup_timer(&alice()));
}

#[tokio::test]
async fn test_invalid_phone_is_rejected() {
    let root = TempDir::new().unwrap();
    let manager = local_manager(&root);

    let err = manager
        .get_or_create_auth_state("alice", "call me maybe")
        .await
        .unwrap_err();
    assert!(matches!(err, crate::error::GatewayError::Validation(_)));
    assert_eq!(manager.session_count(), 0);
}

#[tokio::test]
async fn test_save_credentials_updates_last_used() {
    let root = TempDir::new().unwrap();
    let manager = local_manager(&root);
    let key = alice();

    manager.open_session(&key).await.unwrap();
    let before = manager.session_record(&key).unwrap().last_used;
    tokio::time::sleep(Duration::from_millis(5)).await;

    manager
        .save_credentials(&key, &json!({"registered": true}))
        .await
        .unwrap();

    let record = manager.session_record(&key).unwrap();
    assert!(record.last_used > before);
    assert!(record.auth.is_registered().await);

    let unknown = SessionKey::new("nobody", "+15550009999", None).unwrap();
    assert!(manager.save_credentials(&unknown, &json!({})).await.is_err());
}

#[tokio::test]
async fn test_cleanup_boundary() {
    let root = TempDir::new().unwrap();
    let manager = local_manager(&root);
    let key = alice();
    manager.open_session(&key).await.unwrap();
    let last_used = manager.session_record(&key).unwrap().last_used;
    let max_age = TimeDelta::hours(1);

    let just_inside = last_used + max_age - TimeDelta::milliseconds(1);
    assert_eq!(manager.cleanup_at(HOUR, just_inside).await.unwrap(), 0);
    assert!(manager.session_record(&key).is_some());

    let exactly = last_used + max_age;
    assert_eq!(manager.cleanup_at(HOUR, exactly).await.unwrap(), 0);

    let just_outside = last_used + max_age + TimeDelta::milliseconds(1);
    assert_eq!(manager.cleanup_at(HOUR, just_outside).await.unwrap(), 1);
    assert!(manager.session_record(&key).is_none());
    assert!(!manager.session_dir(&key).exists());
}

#[tokio::test]
async fn test_cleanup_removes_orphan_directories() {
    let root = TempDir::new().unwrap();
    write_session_dir(&root, "carol-+15550003333", true);
    let manager = local_manager(&root);

    assert_eq!(manager.cleanup(HOUR).await.unwrap(), 0);

    let later = Utc::now() + TimeDelta::hours(2);
    assert_eq!(manager.cleanup_at(HOUR, later).await.unwrap(), 1);
    assert!(!root.path().join("carol-+15550003333").exists());
}

#[tokio::test]
async fn test_cleanup_removes_expired_remote_objects() {
    let root = TempDir::new().unwrap();
    let store = Arc::new(MemoryObjectStore::new());
    let fixture = hybrid_manager(&root, store.clone(), HOUR);

    let old_key = "sessions/dave/+15550004444/creds.json";
    let fresh_key = "sessions/erin/+15550005555/creds.json";
    store.put(old_key, vec![1; 32]).await.unwrap();
    store.put(fresh_key, vec![2; 32]).await.unwrap();
    store
        .set_created_at(old_key, Utc::now() - TimeDelta::days(3))
        .await;

    let cleaned = fixture
        .manager
        .cleanup(Duration::from_secs(24 * 3600))
        .await
        .unwrap();

    assert_eq!(cleaned, 1);
    assert_eq!(store.keys().await, vec![fresh_key.to_string()]);
}

#[tokio::test]
async fn test_hybrid_backup_and_restore_after_restart() {
    let root = TempDir::new().unwrap();
    let store = Arc::new(MemoryObjectStore::new());
    let key = alice();

    let fixture = hybrid_manager(&root, store.clone(), HOUR);
    let auth = fixture.manager.open_session(&key).await.unwrap();
    assert!(fixture.manager.has_backup_timer(&key));
    fixture
        .manager
        .save_credentials(&key, &json!({"registered": true}))
        .await
        .unwrap();
    auth.write_key("pre-key", "1", Some(&json!({"public": "k1"})))
        .await
        .unwrap();
    let noise_key = auth.creds().await["noiseKey"].clone();

    let report = fixture.manager.backup_session(&key).await.unwrap();
    assert_eq!(report.files, 2);
    assert_eq!(
        store.keys().await,
        vec![
            "sessions/alice/+15550001111/creds.json".to_string(),
            "sessions/alice/+15550001111/pre-key-1.json".to_string(),
        ]
    );
    let document = fixture.metadata.get(&key.metadata_id()).await.unwrap().unwrap();
    assert_eq!(document.status, BackupStatus::Ok);
    assert_eq!(document.file_count, 2);
    assert_eq!(document.tier, StorageTier::Hybrid);

    // Simulate a restart on a host with an empty local cache
    fixture.manager.shutdown().await;
    std::fs::remove_dir_all(fixture.manager.session_dir(&key)).unwrap();

    let restarted = hybrid_manager(&root, store.clone(), HOUR);
    let restored = restarted.manager.open_session(&key).await.unwrap();
    assert_eq!(restored.creds().await["noiseKey"], noise_key);
    assert!(restored.is_registered().await);
    assert_eq!(
        restored.read_key("pre-key", "1").await.unwrap(),
        Some(json!({"public": "k1"}))
    );
}

#[tokio::test]
async fn test_restore_into_target_directory() {
    let root = TempDir::new().unwrap();
    let target = TempDir::new().unwrap();
    let store = Arc::new(MemoryObjectStore::new());
    let fixture = hybrid_manager(&root, store, HOUR);

    fixture
        .manager
        .get_or_create_auth_state("alice", "+15550001111")
        .await
        .unwrap();
    fixture.manager.backup("alice", "+15550001111").await.unwrap();

    let outcome = fixture
        .manager
        .restore("alice", "+15550001111", target.path())
        .await
        .unwrap();
    assert_eq!(outcome, RestoreOutcome::Restored { files: 1 });
    assert!(target.path().join("creds.json").exists());

    let missing = fixture
        .manager
        .restore("bob", "+15550002222", target.path())
        .await
        .unwrap();
    assert_eq!(missing, RestoreOutcome::NotFound);
}

#[tokio::test]
async fn test_corrupt_backup_falls_back_to_fresh_session() {
    let root = TempDir::new().unwrap();
    let store = Arc::new(MemoryObjectStore::new());
    let key = alice();

    let fixture = hybrid_manager(&root, store.clone(), HOUR);
    let original = fixture.manager.open_session(&key).await.unwrap();
    let noise_key = original.creds().await["noiseKey"].clone();
    fixture.manager.backup_session(&key).await.unwrap();
    fixture.manager.shutdown().await;
    std::fs::remove_dir_all(fixture.manager.session_dir(&key)).unwrap();

    store
        .corrupt(&key.remote_object_key("creds.json"), vec![0u8; 7])
        .await;

    let restarted = hybrid_manager(&root, store.clone(), HOUR);
    let fresh = restarted.manager.open_session(&key).await.unwrap();
    assert_ne!(fresh.creds().await["noiseKey"], noise_key);
    assert!(!fresh.is_registered().await);

    let direct = restarted
        .manager
        .restore_into(&key, &root.path().join("scratch"))
        .await;
    assert!(direct.is_err());
    assert!(!root.path().join("scratch").exists());
}

#[tokio::test]
async fn test_unparseable_restored_credentials_fall_back_to_fresh() {
    let root = TempDir::new().unwrap();
    let store = Arc::new(MemoryObjectStore::new());
    let key = alice();

    let blob = SessionCipher::new(TEST_KEY).encrypt(b"not json").unwrap();
    store
        .put(&key.remote_object_key("creds.json"), blob)
        .await
        .unwrap();

    let fixture = hybrid_manager(&root, store, HOUR);
    let auth = fixture.manager.open_session(&key).await.unwrap();
    assert!(!auth.is_registered().await);
    assert!(auth.creds().await["noiseKey"].is_string());
    fixture.manager.shutdown().await;
}

#[tokio::test]
async fn test_partial_backup_failure_keeps_uploaded_files() {
    let root = TempDir::new().unwrap();
    let store = Arc::new(MemoryObjectStore::new());
    let key = alice();
    let fixture = hybrid_manager(&root, store.clone(), HOUR);

    let auth = fixture.manager.open_session(&key).await.unwrap();
    auth.write_key("pre-key", "1", Some(&json!({"k": 1}))).await.unwrap();
    auth.write_key("session", "x", Some(&json!({"k": 2}))).await.unwrap();
    store.fail_puts_ending_with("session-x.json");

    let err = fixture.manager.backup_session(&key).await.unwrap_err();
    assert!(err.to_string().contains("session-x.json"));

    // Files uploaded before the failure are not rolled back
    assert_eq!(store.put_count(), 2);
    let document = fixture.metadata.get(&key.metadata_id()).await.unwrap().unwrap();
    assert_eq!(document.status, BackupStatus::Failed);
    assert_eq!(document.file_count, 2);
    assert!(document.error.is_some());
}

#[tokio::test]
async fn test_backup_requires_remote_tier_and_local_files() {
    let root = TempDir::new().unwrap();
    let local = local_manager(&root);
    assert!(local.backup("alice", "+15550001111").await.is_err());

    let fixture = hybrid_manager(&root, Arc::new(MemoryObjectStore::new()), HOUR);
    let err = fixture
        .manager
        .backup("nobody", "+15550009999")
        .await
        .unwrap_err();
    assert!(matches!(err, crate::error::GatewayError::NotFound(_)));
}

#[tokio::test]
async fn test_delete_removes_everything() {
    let root = TempDir::new().unwrap();
    let store = Arc::new(MemoryObjectStore::new());
    let key = alice();
    let fixture = hybrid_manager(&root, store.clone(), HOUR);

    fixture.manager.open_session(&key).await.unwrap();
    fixture.manager.backup_session(&key).await.unwrap();
    assert!(fixture.manager.exists("alice", "+15550001111").await.unwrap());

    fixture.manager.delete("alice", "+15550001111").await.unwrap();

    assert_eq!(fixture.manager.session_count(), 0);
    assert!(!fixture.manager.has_backup_timer(&key));
    assert!(!fixture.manager.session_dir(&key).exists());
    assert!(store.keys().await.is_empty());
    assert_eq!(fixture.metadata.len().await, 0);
    assert!(!fixture.manager.exists("alice", "+15550001111").await.unwrap());

    // Deleting again is harmless
    fixture.manager.delete("alice", "+15550001111").await.unwrap();
}

#[tokio::test]
async fn test_delete_continues_when_remote_is_down() {
    let root = TempDir::new().unwrap();
    let store = Arc::new(MemoryObjectStore::new());
    let key = alice();
    let fixture = hybrid_manager(&root, store.clone(), HOUR);

    fixture.manager.open_session(&key).await.unwrap();
    fixture.manager.backup_session(&key).await.unwrap();
    store.set_unavailable(true);

    fixture.manager.delete_session(&key).await;

    assert_eq!(fixture.manager.session_count(), 0);
    assert!(!fixture.manager.session_dir(&key).exists());
    store.set_unavailable(false);
    assert_eq!(store.keys().await.len(), 1);
}

#[tokio::test]
async fn test_exists_checks_remote_when_local_is_empty() {
    let root = TempDir::new().unwrap();
    let store = Arc::new(MemoryObjectStore::new());
    let key = alice();
    let fixture = hybrid_manager(&root, store.clone(), HOUR);

    assert!(!fixture.manager.session_exists(&key).await.unwrap());
    store
        .put(&key.remote_object_key("creds.json"), vec![0; 32])
        .await
        .unwrap();
    assert!(fixture.manager.session_exists(&key).await.unwrap());

    let local = local_manager(&root);
    assert!(!local.session_exists(&key).await.unwrap());
}

#[tokio::test]
async fn test_periodic_backup_runs() {
    let root = TempDir::new().unwrap();
    let store = Arc::new(MemoryObjectStore::new());
    let fixture = hybrid_manager(&root, store.clone(), Duration::from_millis(50));

    fixture.manager.open_session(&alice()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(180)).await;

    assert!(store.put_count() >= 2, "saw {} uploads", store.put_count());
    fixture.manager.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_quiescence() {
    let root = TempDir::new().unwrap();
    let store = Arc::new(MemoryObjectStore::new());
    let key = alice();
    let fixture = hybrid_manager(&root, store.clone(), Duration::from_millis(100));

    fixture.manager.open_session(&key).await.unwrap();
    fixture.manager.shutdown().await;

    // The final backup ran during shutdown
    let after_shutdown = store.put_count();
    assert!(after_shutdown >= 1);
    assert_eq!(fixture.manager.session_count(), 0);

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(store.put_count(), after_shutdown);

    assert!(matches!(
        fixture.manager.open_session(&key).await,
        Err(crate::error::GatewayError::ShuttingDown(_))
    ));
    // Second shutdown is a no-op
    fixture.manager.shutdown().await;
}

#[tokio::test]
async fn test_cloud_tier_uploads_credentials_updates() {
    let root = TempDir::new().unwrap();
    let store = Arc::new(MemoryObjectStore::new());
    let optimizer = CloudOptimizer::new(
        store.clone(),
        CloudCacheConfig {
            upload_retry_delay_ms: 5,
            ..CloudCacheConfig::default()
        },
    );
    let manager = SessionPersistenceManager::with_backend(
        root.path(),
        TierBackend::Cloud {
            optimizer: optimizer.clone(),
            metadata: Arc::new(MemoryMetadataStore::new()),
        },
        SessionCipher::new(TEST_KEY),
        HOUR,
    );
    let key = alice();

    manager.open_session(&key).await.unwrap();
    assert!(!manager.has_backup_timer(&key));
    manager
        .save_credentials(&key, &json!({"registered": true}))
        .await
        .unwrap();
    optimizer.flush().await;

    assert_eq!(store.put_count(), 2);
    let blob = store
        .get(&key.remote_object_key("creds.json"))
        .await
        .unwrap()
        .unwrap();
    let creds: serde_json::Value =
        serde_json::from_slice(&SessionCipher::new(TEST_KEY).decrypt(&blob).unwrap()).unwrap();
    assert_eq!(creds["registered"], true);

    manager.shutdown().await;
    assert_eq!(manager.session_count(), 0);
}

#[tokio::test]
async fn test_release_keeps_files_and_stops_timer() {
    let root = TempDir::new().unwrap();
    let store = Arc::new(MemoryObjectStore::new());
    let key = alice();
    let fixture = hybrid_manager(&root, store.clone(), Duration::from_millis(50));

    let (_, created) = fixture.manager.open_or_reuse(&key).await.unwrap();
    assert!(created);
    let (_, created) = fixture.manager.open_or_reuse(&key).await.unwrap();
    assert!(!created);

    assert!(fixture.manager.release_session(&key).await);
    assert!(!fixture.manager.has_backup_timer(&key));
    assert_eq!(fixture.manager.session_count(), 0);
    assert!(env::creds_file_path(&fixture.manager.session_dir(&key)).is_file());

    let uploads = store.put_count();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(store.put_count(), uploads);

    assert!(!fixture.manager.release_session(&key).await);
}

#[tokio::test]
async fn test_cloud_delete_is_not_undone_by_queued_uploads() {
    let root = TempDir::new().unwrap();
    let store = Arc::new(MemoryObjectStore::new());
    store.set_put_delay(Duration::from_millis(100));
    let optimizer = CloudOptimizer::new(
        store.clone(),
        CloudCacheConfig {
            upload_retry_delay_ms: 5,
            ..CloudCacheConfig::default()
        },
    );
    let manager = SessionPersistenceManager::with_backend(
        root.path(),
        TierBackend::Cloud {
            optimizer: optimizer.clone(),
            metadata: Arc::new(MemoryMetadataStore::new()),
        },
        SessionCipher::new(TEST_KEY),
        HOUR,
    );
    let key = alice();

    manager.open_session(&key).await.unwrap();
    manager
        .save_credentials(&key, &json!({"registered": true}))
        .await
        .unwrap();
    manager.delete_session(&key).await;
    optimizer.flush().await;

    assert!(store.list(&key.remote_prefix()).await.unwrap().is_empty());
    assert!(!manager.session_exists(&key).await.unwrap());
    assert!(manager.list_all().await.unwrap().is_empty());

    manager.shutdown().await;
}
