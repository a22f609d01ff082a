//! Periodic loops: the statement-check poll, the token-refresh sweep
//! and the upload-session TTL sweep.
//!
//! The scheduler never does the work itself; it enqueues items and
//! lets the dispatcher apply concurrency limits and retry policy.

use crate::config::{DeliveryConfig, SchedulerConfig};
use crate::delivery::SessionArena;
use crate::queue::{Priority, QueueSender, Task};
use crate::services::{Database, LearningService};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct Scheduler {
    config: SchedulerConfig,
    delivery_config: DeliveryConfig,
    db: Database,
    learning: Arc<LearningService>,
    sessions: SessionArena,
    queue: QueueSender,
    shutdown_token: CancellationToken,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        delivery_config: DeliveryConfig,
        db: Database,
        learning: Arc<LearningService>,
        sessions: SessionArena,
        queue: QueueSender,
        shutdown_token: CancellationToken,
    ) -> Self {
        Self {
            config,
            delivery_config,
            db,
            learning,
            sessions,
            queue,
            shutdown_token,
        }
    }

    pub async fn run(self) {
        if !self.config.enabled {
            tracing::info!("Scheduler disabled by configuration");
            return;
        }

        let mut poll = tokio::time::interval(Duration::from_secs(self.config.poll_interval_secs));
        let mut sweep = tokio::time::interval(Duration::from_secs(
            self.delivery_config.session_sweep_interval_secs,
        ));
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tracing::info!(
            poll_interval_secs = self.config.poll_interval_secs,
            "Scheduler started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown_token.cancelled() => {
                    tracing::info!("Scheduler shutting down");
                    break;
                }
                _ = poll.tick() => {
                    self.enqueue_due_checks().await;
                    self.enqueue_token_refreshes().await;
                }
                _ = sweep.tick() => {
                    let removed = self.sessions.sweep(Utc::now());
                    if removed > 0 {
                        tracing::info!(removed = removed, "Swept expired upload sessions");
                    }
                }
            }
        }
    }

    /// Accounts due per the availability model. Model errors fail open
    /// inside `accounts_to_check`; an error here means the account list
    /// itself was unavailable, which only skips this tick.
    async fn enqueue_due_checks(&self) {
        let due = match self.learning.accounts_to_check(Utc::now()).await {
            Ok(due) => due,
            Err(e) => {
                tracing::error!(error = %e, "Failed to compute due accounts");
                return;
            }
        };

        metrics::gauge!("scheduler_due_accounts").set(due.len() as f64);

        for account in due {
            let task = Task::CheckStatements {
                account_id: account.account_id,
            };
            if let Err(e) = self.queue.enqueue(task, Priority::Normal) {
                tracing::error!(
                    account_id = %account.account_id,
                    error = %e,
                    "Failed to enqueue statement check"
                );
            }
        }
    }

    async fn enqueue_token_refreshes(&self) {
        let expiring = match self
            .db
            .destinations_expiring_within(self.config.token_refresh_lookahead_secs)
            .await
        {
            Ok(expiring) => expiring,
            Err(e) => {
                tracing::error!(error = %e, "Failed to list expiring destinations");
                return;
            }
        };

        for destination in expiring {
            let task = Task::StorageRefreshTokens {
                destination_id: destination.destination_id,
            };
            if let Err(e) = self.queue.enqueue(task, Priority::High) {
                tracing::error!(
                    destination_id = %destination.destination_id,
                    error = %e,
                    "Failed to enqueue token refresh"
                );
            }
        }
    }
}
