//! Per-account retrieval coordination.
//!
//! One account has at most one retrieval in flight at any time. A
//! check that arrives while another is running is skipped outright
//! rather than queued; the scheduler will come back around. The
//! in-flight slot is released on every exit path, including panics,
//! via a drop guard.

use crate::config::RateLimitConfig;
use crate::models::{Account, AccountStatus, StatementRecord};
use crate::queue::{Priority, QueueSender, Task};
use crate::services::{Database, LearningService, RateLimiter, StatementSource};
use chrono::{Datelike, Utc};
use dashmap::DashMap;
use pipeline_core::error::AppError;
use std::sync::Arc;
use uuid::Uuid;

/// What happened to one retrieval request.
#[derive(Debug, PartialEq, Eq)]
pub enum RetrievalOutcome {
    Completed {
        discovered: usize,
        new_statements: usize,
        deliveries_enqueued: usize,
    },
    /// Another retrieval for the same account was already running.
    SkippedInFlight,
    /// The per-account retrieval budget for this window is spent.
    RateLimited { retry_after: u64 },
    /// Account is deactivated; nothing to do.
    SkippedInactive,
}

struct InFlightGuard {
    slots: Arc<DashMap<Uuid, ()>>,
    account_id: Uuid,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.slots.remove(&self.account_id);
    }
}

pub struct AccountCoordinator {
    db: Database,
    rate_limiter: Arc<RateLimiter>,
    rate_limit: RateLimitConfig,
    learning: Arc<LearningService>,
    source: Arc<dyn StatementSource>,
    queue: QueueSender,
    in_flight: Arc<DashMap<Uuid, ()>>,
}

impl AccountCoordinator {
    pub fn new(
        db: Database,
        rate_limiter: Arc<RateLimiter>,
        rate_limit: RateLimitConfig,
        learning: Arc<LearningService>,
        source: Arc<dyn StatementSource>,
        queue: QueueSender,
    ) -> Self {
        Self {
            db,
            rate_limiter,
            rate_limit,
            learning,
            source,
            queue,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    /// Run one statement check for an account: list upstream
    /// statements, record anything new in the ledger, feed the
    /// availability model and enqueue deliveries for first sightings.
    pub async fn check_account(&self, account_id: Uuid) -> Result<RetrievalOutcome, AppError> {
        let account = self.db.get_account(account_id).await?;
        if AccountStatus::from_string(&account.status) != AccountStatus::Active {
            return Ok(RetrievalOutcome::SkippedInactive);
        }

        let _guard = match self.try_acquire(account_id) {
            Some(guard) => guard,
            None => {
                metrics::counter!("retrievals_skipped_total", "reason" => "in_flight").increment(1);
                tracing::debug!(account_id = %account_id, "Retrieval already in flight, skipping");
                return Ok(RetrievalOutcome::SkippedInFlight);
            }
        };

        let decision = self.rate_limiter.check(
            &format!("account:{}", account_id),
            self.rate_limit.account_limit,
            self.rate_limit.account_window_secs,
        );
        if !decision.allowed {
            let retry_after = decision.retry_after.unwrap_or(self.rate_limit.account_window_secs);
            metrics::counter!("retrievals_skipped_total", "reason" => "rate_limited").increment(1);
            tracing::warn!(
                account_id = %account_id,
                retry_after = retry_after,
                "Account retrieval budget exhausted"
            );
            if let Err(e) = self.db.update_last_poll(account_id, Utc::now()).await {
                tracing::warn!(account_id = %account_id, error = %e, "Failed to record poll time");
            }
            return Ok(RetrievalOutcome::RateLimited { retry_after });
        }

        self.retrieve(&account).await
    }

    fn try_acquire(&self, account_id: Uuid) -> Option<InFlightGuard> {
        use dashmap::mapref::entry::Entry;
        match self.in_flight.entry(account_id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(InFlightGuard {
                    slots: self.in_flight.clone(),
                    account_id,
                })
            }
        }
    }

    async fn retrieve(&self, account: &Account) -> Result<RetrievalOutcome, AppError> {
        let started = std::time::Instant::now();
        let since = account.last_poll_utc.map(|t| t.date_naive());

        let upstream = self
            .source
            .list_statements(&account.connection_id, &account.institution_id, since)
            .await?;

        let discovered = upstream.len();
        let mut new_statements = 0;
        let mut deliveries_enqueued = 0;

        for statement in &upstream {
            let record = self.db.upsert_statement(account.account_id, statement).await?;

            if record.is_first_sighting() {
                new_statements += 1;
                self.observe_availability(account, &record).await;
                deliveries_enqueued += self.enqueue_deliveries(&record).await?;
            }
        }

        self.db
            .update_last_poll(account.account_id, Utc::now())
            .await?;

        metrics::counter!("retrievals_total", "status" => "success").increment(1);
        metrics::histogram!("retrieval_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        tracing::info!(
            account_id = %account.account_id,
            discovered = discovered,
            new_statements = new_statements,
            deliveries_enqueued = deliveries_enqueued,
            "Statement check completed"
        );

        Ok(RetrievalOutcome::Completed {
            discovered,
            new_statements,
            deliveries_enqueued,
        })
    }

    /// Feed the availability model. Learning failures never fail the
    /// retrieval; the model degrades, the pipeline keeps moving.
    async fn observe_availability(&self, account: &Account, record: &StatementRecord) {
        let observed = Utc::now();
        let cycle = record.period_end;
        if let Err(e) = self
            .learning
            .record_availability(
                &account.institution_id,
                account.account_id,
                cycle.month(),
                cycle.year(),
                observed,
            )
            .await
        {
            tracing::warn!(
                account_id = %account.account_id,
                error = %e,
                "Failed to record availability sample"
            );
        }
    }

    /// One delivery item per linked destination, each with a stable
    /// request id so redelivery attempts stay idempotent. Destinations
    /// are independent: a failure enqueueing one does not stop the
    /// others.
    async fn enqueue_deliveries(&self, record: &StatementRecord) -> Result<usize, AppError> {
        let destinations = self.db.destinations_for_account(record.account_id).await?;
        let mut enqueued = 0;

        for destination in destinations {
            let request_id = Uuid::new_v4();
            let attempt = self
                .db
                .ensure_delivery_attempt(record.statement_id, destination.destination_id, request_id)
                .await;

            let attempt = match attempt {
                Ok(attempt) => attempt,
                Err(e) => {
                    tracing::error!(
                        statement_id = %record.statement_id,
                        destination_id = %destination.destination_id,
                        error = %e,
                        "Failed to record delivery attempt"
                    );
                    continue;
                }
            };

            let task = Task::DeliverStatement {
                statement_id: record.statement_id,
                destination_id: destination.destination_id,
                request_id: attempt.request_id,
            };
            match self.queue.enqueue(task, Priority::Normal) {
                Ok(()) => enqueued += 1,
                Err(e) => {
                    tracing::error!(
                        statement_id = %record.statement_id,
                        destination_id = %destination.destination_id,
                        error = %e,
                        "Failed to enqueue delivery"
                    );
                }
            }
        }

        Ok(enqueued)
    }

    /// Whether a retrieval is currently running for this account.
    pub fn is_in_flight(&self, account_id: Uuid) -> bool {
        self.in_flight.contains_key(&account_id)
    }
}
