//! Cloud tier access optimizer.
//!
//! In the `cloud` tier remote storage is authoritative, so every read and
//! write goes through [`CloudOptimizer`]. It caches existence checks and
//! namespace listings for a TTL, and moves credential uploads off the hot path
//! into a bounded queue drained by a single worker that retries with a fixed
//! delay. Deleting a namespace discards its queued uploads first, so a late
//! upload never recreates a deleted session.

use crate::config::CloudCacheConfig;
use crate::error::{GatewayError, Result};
use crate::session::storage::{ObjectInfo, ObjectStore};
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

struct UploadJob {
    key: String,
    data: Vec<u8>,
}

/// Upload and cache counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptimizerStats {
    pub uploads: u64,
    pub failed_uploads: u64,
    pub discarded_uploads: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub queued: usize,
}

#[derive(Default)]
struct Counters {
    uploads: AtomicU64,
    failed_uploads: AtomicU64,
    discarded_uploads: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

pub struct CloudOptimizer {
    store: Arc<dyn ObjectStore>,
    config: CloudCacheConfig,
    exists_cache: DashMap<String, (bool, Instant)>,
    listing_cache: DashMap<String, (Vec<ObjectInfo>, Instant)>,
    queue: Mutex<Option<mpsc::Sender<UploadJob>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    pending: Arc<AtomicUsize>,
    drained: Arc<Notify>,
    discarded: Arc<DashSet<String>>,
    counters: Arc<Counters>,
}

impl CloudOptimizer {
    /// Create the optimizer and start its upload worker.
    pub fn new(store: Arc<dyn ObjectStore>, config: CloudCacheConfig) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.upload_queue_capacity.max(1));
        let pending = Arc::new(AtomicUsize::new(0));
        let drained = Arc::new(Notify::new());
        let discarded = Arc::new(DashSet::new());
        let counters = Arc::new(Counters::default());

        let worker = tokio::spawn(Self::upload_worker(
            rx,
            store.clone(),
            config.clone(),
            pending.clone(),
            drained.clone(),
            discarded.clone(),
            counters.clone(),
        ));

        Arc::new(Self {
            store,
            config,
            exists_cache: DashMap::new(),
            listing_cache: DashMap::new(),
            queue: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            pending,
            drained,
            discarded,
            counters,
        })
    }

    async fn upload_worker(
        mut rx: mpsc::Receiver<UploadJob>,
        store: Arc<dyn ObjectStore>,
        config: CloudCacheConfig,
        pending: Arc<AtomicUsize>,
        drained: Arc<Notify>,
        discarded: Arc<DashSet<String>>,
        counters: Arc<Counters>,
    ) {
        while let Some(job) = rx.recv().await {
            let dropped = discarded
                .iter()
                .any(|prefix| job.key.starts_with(prefix.as_str()));
            let outcome = if dropped {
                None
            } else {
                Some(upload_with_retry(store.as_ref(), &config, &job.key, job.data).await)
            };
            match outcome {
                None => {
                    counters.discarded_uploads.fetch_add(1, Ordering::Relaxed);
                    debug!("Discarded queued upload of deleted object {}", job.key);
                }
                Some(Ok(())) => {
                    counters.uploads.fetch_add(1, Ordering::Relaxed);
                    debug!("Queued upload completed: {}", job.key);
                }
                Some(Err(e)) => {
                    counters.failed_uploads.fetch_add(1, Ordering::Relaxed);
                    error!("Queued upload of {} failed permanently: {}", job.key, e);
                }
            }
            if pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                drained.notify_waiters();
            }
        }
        debug!("Upload worker stopped");
    }

    /// Queue an upload; waits for room when the queue is full.
    pub async fn enqueue_upload(&self, key: &str, data: Vec<u8>) -> Result<()> {
        let sender = self
            .queue
            .lock()
            .await
            .clone()
            .ok_or_else(|| GatewayError::ShuttingDown("upload queue".to_string()))?;

        self.note_written(key);
        self.pending.fetch_add(1, Ordering::SeqCst);
        if sender
            .send(UploadJob {
                key: key.to_string(),
                data,
            })
            .await
            .is_err()
        {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(GatewayError::ShuttingDown("upload queue".to_string()));
        }
        Ok(())
    }

    /// Upload immediately, retrying transient failures.
    pub async fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        match upload_with_retry(self.store.as_ref(), &self.config, key, data).await {
            Ok(()) => {
                self.counters.uploads.fetch_add(1, Ordering::Relaxed);
                self.note_written(key);
                Ok(())
            }
            Err(e) => {
                self.counters.failed_uploads.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.store.get(key).await
    }

    /// Namespace listing, served from cache while fresh.
    pub async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        if let Some(entry) = self.listing_cache.get(prefix)
            && entry.1.elapsed() < self.config.cache_ttl()
        {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(entry.0.clone());
        }

        self.counters.cache_misses.fetch_add(1, Ordering::Relaxed);
        let objects = self.store.list(prefix).await?;
        self.listing_cache
            .insert(prefix.to_string(), (objects.clone(), Instant::now()));
        self.exists_cache
            .insert(prefix.to_string(), (!objects.is_empty(), Instant::now()));
        Ok(objects)
    }

    /// Whether any object exists under `prefix`, served from cache while fresh.
    pub async fn exists(&self, prefix: &str) -> Result<bool> {
        if let Some(entry) = self.exists_cache.get(prefix)
            && entry.1.elapsed() < self.config.cache_ttl()
        {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(entry.0);
        }
        Ok(!self.list(prefix).await?.is_empty())
    }

    /// Delete one object and drop cached views of its namespace.
    pub async fn delete(&self, key: &str) -> Result<()> {
        self.store.delete(key).await?;
        self.forget_containing(key);
        Ok(())
    }

    /// Delete every object under `prefix`; returns how many were removed.
    ///
    /// Uploads queued under `prefix` are discarded and an upload already in
    /// flight is waited for, so nothing lands after the delete. Callers must
    /// not enqueue under `prefix` until this returns.
    pub async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        self.discarded.insert(prefix.to_string());
        self.flush().await;
        let result = self.delete_listed(prefix).await;
        self.discarded.remove(prefix);
        result
    }

    async fn delete_listed(&self, prefix: &str) -> Result<usize> {
        let objects = self.store.list(prefix).await?;
        let mut deleted = 0;
        let mut first_error = None;
        for object in &objects {
            match self.store.delete(&object.key).await {
                Ok(()) => deleted += 1,
                Err(e) => {
                    warn!("Failed to delete remote object {}: {}", object.key, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        self.invalidate(prefix);
        match first_error {
            Some(e) if deleted == 0 && !objects.is_empty() => Err(e),
            _ => Ok(deleted),
        }
    }

    /// Drop cached existence and listing results for `prefix` and below.
    pub fn invalidate(&self, prefix: &str) {
        self.exists_cache.retain(|cached, _| !cached.starts_with(prefix));
        self.listing_cache.retain(|cached, _| !cached.starts_with(prefix));
    }

    /// A write under `key` means every namespace containing it now exists.
    fn note_written(&self, key: &str) {
        self.listing_cache.retain(|prefix, _| !key.starts_with(prefix.as_str()));
        for mut entry in self.exists_cache.iter_mut() {
            if key.starts_with(entry.key().as_str()) {
                *entry.value_mut() = (true, Instant::now());
            }
        }
    }

    fn forget_containing(&self, key: &str) {
        self.listing_cache.retain(|prefix, _| !key.starts_with(prefix.as_str()));
        self.exists_cache.retain(|prefix, _| !key.starts_with(prefix.as_str()));
    }

    /// Wait until every queued upload has been attempted.
    pub async fn flush(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn stats(&self) -> OptimizerStats {
        OptimizerStats {
            uploads: self.counters.uploads.load(Ordering::Relaxed),
            failed_uploads: self.counters.failed_uploads.load(Ordering::Relaxed),
            discarded_uploads: self.counters.discarded_uploads.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.counters.cache_misses.load(Ordering::Relaxed),
            queued: self.pending.load(Ordering::SeqCst),
        }
    }

    /// Stop accepting uploads, drain the queue and stop the worker.
    pub async fn shutdown(&self) {
        drop(self.queue.lock().await.take());
        if let Some(worker) = self.worker.lock().await.take() {
            if let Err(e) = worker.await {
                error!("Upload worker terminated abnormally: {}", e);
            }
        }
        self.exists_cache.clear();
        self.listing_cache.clear();
        info!("Cloud optimizer shut down: {:?}", self.stats());
    }
}

async fn upload_with_retry(
    store: &dyn ObjectStore,
    config: &CloudCacheConfig,
    key: &str,
    data: Vec<u8>,
) -> Result<()> {
    let mut attempt = 0;
    loop {
        match store.put(key, data.clone()).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < config.upload_max_retries => {
                attempt += 1;
                warn!(
                    "Upload of {} failed (attempt {}/{}): {}",
                    key,
                    attempt,
                    config.upload_max_retries + 1,
                    e
                );
                tokio::time::sleep(config.upload_retry_delay()).await;
            }
            Err(e) => return Err(e),
        }
    }
}
