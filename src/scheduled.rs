//! Cancellable background tasks.
//!
//! Backup timers, QR expiry timers and the pool health loop are all spawned
//! tokio tasks owned by a [`ScheduledTask`]. Cancelling is idempotent and also
//! happens when the handle is dropped, so removing the owner removes the timer.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

/// Handle to a spawned task that is aborted on cancel or drop.
#[derive(Debug)]
pub struct ScheduledTask {
    name: String,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ScheduledTask {
    /// Run `tick` every `period`, first after one full period.
    pub fn every<F, Fut>(name: impl Into<String>, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            let mut interval_timer = interval_at(Instant::now() + period, period);
            interval_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval_timer.tick().await;
                tracing::trace!("Scheduled task {} ticked", task_name);
                tick().await;
            }
        });
        Self::from_handle(name, handle)
    }

    /// Run `action` once after `delay`.
    pub fn after<Fut>(name: impl Into<String>, delay: Duration, action: Fut) -> Self
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            action.await;
        });
        Self::from_handle(name.into(), handle)
    }

    /// Run `future` to completion in the background.
    pub fn spawn<Fut>(name: impl Into<String>, future: Fut) -> Self
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::from_handle(name.into(), tokio::spawn(future))
    }

    fn from_handle(name: String, handle: JoinHandle<()>) -> Self {
        Self {
            name,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Abort the task. Later calls are no-ops.
    pub fn cancel(&self) {
        let handle = match self.handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.abort();
            tracing::debug!("Cancelled scheduled task {}", self.name);
        }
    }

    /// True once cancelled or after the task ran to completion.
    pub fn is_finished(&self) -> bool {
        match self.handle.lock() {
            Ok(guard) => guard.as_ref().is_none_or(JoinHandle::is_finished),
            Err(poisoned) => poisoned.into_inner().as_ref().is_none_or(JoinHandle::is_finished),
        }
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.cancel();
    }
}
