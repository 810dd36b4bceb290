//! Startup recovery of persisted sessions.

use crate::error::Result;
use crate::pool::collaborators::ConnectionStatus;
use crate::pool::manager::{AddConnectionOptions, ConnectionPool};
use crate::session::SessionKey;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of [`ConnectionPool::initialize_recovery`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub attempted: usize,
    pub recovered: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl ConnectionPool {
    /// Reconnect every persisted session that was not logged out.
    ///
    /// One session failing to come back never stops the others.
    pub async fn initialize_recovery(self: &Arc<Self>) -> Result<RecoveryReport> {
        let sessions = self.persistence().list_all().await?;
        let mut report = RecoveryReport::default();
        if sessions.is_empty() {
            info!("No persisted sessions to recover");
            return Ok(report);
        }
        info!("Recovering {} persisted sessions", sessions.len());

        let statuses: HashMap<SessionKey, ConnectionStatus> = match self
            .collaborators()
            .state
            .recover_connections(sessions.clone())
            .await
        {
            Ok(recovered) => recovered
                .into_iter()
                .map(|connection| (connection.key, connection.status))
                .collect(),
            Err(e) => {
                warn!("Connection state unavailable, recovering every session: {}", e);
                HashMap::new()
            }
        };

        let mut candidates = Vec::with_capacity(sessions.len());
        for key in sessions {
            if statuses.get(&key) == Some(&ConnectionStatus::LoggedOut) {
                debug!("Skipping logged out session {}", key);
                report.skipped += 1;
            } else {
                candidates.push(key);
            }
        }
        report.attempted = candidates.len();

        let concurrency = self.config().recovery_concurrency.max(1);
        let results: Vec<(SessionKey, Result<bool>)> = stream::iter(candidates)
            .map(|key| {
                let pool = self.clone();
                async move {
                    let options = AddConnectionOptions {
                        is_recovery: true,
                        ..AddConnectionOptions::default()
                    };
                    let result = pool
                        .add_connection(&key.user_id, &key.phone_number, options)
                        .await;
                    (key, result)
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        for (key, result) in results {
            match result {
                Ok(true) => report.recovered += 1,
                Ok(false) => {
                    warn!("Session {} was not recovered", key);
                    report.failed += 1;
                }
                Err(e) => {
                    warn!("Recovery of {} failed: {}", key, e);
                    report.failed += 1;
                }
            }
        }

        info!(
            "Recovery finished: {} recovered, {} skipped, {} failed",
            report.recovered, report.skipped, report.failed
        );
        Ok(report)
    }
}
