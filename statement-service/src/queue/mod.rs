//! Typed work queue and dispatcher.
//!
//! All background work flows through one dispatcher: statement checks,
//! deliveries, upload continuations, and token refreshes. Items carry
//! a retry count; failures that are retryable go back on the queue
//! with exponential backoff, everything else is dead-lettered with a
//! log line.

use crate::config::QueueConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pipeline_core::error::AppError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Normal,
}

/// The work itself, serde-tagged so items survive a round trip
/// through JSON and unrecognized types can be rejected by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Task {
    CheckStatements {
        account_id: Uuid,
    },
    DeliverStatement {
        statement_id: Uuid,
        destination_id: Uuid,
        request_id: Uuid,
    },
    /// Continuation of an interrupted chunked upload.
    StorageUpload {
        statement_id: Uuid,
        destination_id: Uuid,
        session_id: Uuid,
        request_id: Uuid,
    },
    StorageRefreshTokens {
        destination_id: Uuid,
    },
}

impl Task {
    pub fn kind(&self) -> &'static str {
        match self {
            Task::CheckStatements { .. } => "check_statements",
            Task::DeliverStatement { .. } => "deliver_statement",
            Task::StorageUpload { .. } => "storage_upload",
            Task::StorageRefreshTokens { .. } => "storage_refresh_tokens",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub item_id: Uuid,
    pub priority: Priority,
    pub retry_count: u32,
    pub enqueued_utc: DateTime<Utc>,
    #[serde(flatten)]
    pub task: Task,
}

impl QueueItem {
    pub fn new(task: Task, priority: Priority) -> Self {
        Self {
            item_id: Uuid::new_v4(),
            priority,
            retry_count: 0,
            enqueued_utc: Utc::now(),
            task,
        }
    }
}

#[async_trait]
pub trait QueueHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> Result<(), AppError>;
}

/// Cloneable producer handle.
#[derive(Clone)]
pub struct QueueSender {
    high_tx: mpsc::Sender<QueueItem>,
    normal_tx: mpsc::Sender<QueueItem>,
}

impl QueueSender {
    pub fn enqueue(&self, task: Task, priority: Priority) -> Result<(), AppError> {
        self.enqueue_item(QueueItem::new(task, priority))
    }

    pub fn enqueue_item(&self, item: QueueItem) -> Result<(), AppError> {
        let tx = match item.priority {
            Priority::High => &self.high_tx,
            Priority::Normal => &self.normal_tx,
        };
        metrics::counter!("queue_enqueued_total", "type" => item.task.kind()).increment(1);
        tx.try_send(item)
            .map_err(|_| AppError::InternalError(anyhow::anyhow!("Work queue full")))
    }

    /// Ingress for raw JSON payloads from external producers. Payloads
    /// that do not parse into a known item type are logged and dropped,
    /// never requeued.
    pub fn enqueue_raw(&self, payload: serde_json::Value, priority: Priority) {
        match serde_json::from_value::<Task>(payload.clone()) {
            Ok(task) => {
                if let Err(e) = self.enqueue(task, priority) {
                    tracing::error!(error = %e, "Failed to enqueue parsed item");
                }
            }
            Err(e) => {
                metrics::counter!("queue_unknown_items_total").increment(1);
                tracing::warn!(
                    error = %e,
                    item_type = payload.get("type").and_then(|v| v.as_str()).unwrap_or("<missing>"),
                    "Dropping unrecognized queue item"
                );
            }
        }
    }
}

pub struct Dispatcher {
    config: QueueConfig,
    sender: QueueSender,
    high_rx: Option<mpsc::Receiver<QueueItem>>,
    normal_rx: Option<mpsc::Receiver<QueueItem>>,
    shutdown_token: CancellationToken,
}

impl Dispatcher {
    /// The sender is handed out before `run`, so producers (the
    /// coordinator, the scheduler, the webhook ingress) can be built
    /// before the handler that consumes their items exists.
    pub fn new(config: QueueConfig, shutdown_token: CancellationToken) -> (Self, QueueSender) {
        let (high_tx, high_rx) = mpsc::channel(config.queue_size);
        let (normal_tx, normal_rx) = mpsc::channel(config.queue_size);
        let sender = QueueSender { high_tx, normal_tx };

        let dispatcher = Self {
            config,
            sender: sender.clone(),
            high_rx: Some(high_rx),
            normal_rx: Some(normal_rx),
            shutdown_token,
        };

        (dispatcher, sender)
    }

    /// Run the distributor loop. High-priority items are always taken
    /// before normal ones; concurrency is capped by the worker count.
    pub async fn run(mut self, handler: Arc<dyn QueueHandler>) {
        let mut high_rx = self.high_rx.take().expect("run() can only be called once");
        let mut normal_rx = self
            .normal_rx
            .take()
            .expect("run() can only be called once");

        let permits = Arc::new(Semaphore::new(self.config.worker_count));
        tracing::info!(
            worker_count = self.config.worker_count,
            "Starting queue dispatcher"
        );

        loop {
            let item = tokio::select! {
                biased;
                _ = self.shutdown_token.cancelled() => {
                    tracing::info!("Queue dispatcher shutting down");
                    break;
                }
                item = high_rx.recv() => item,
                item = normal_rx.recv() => item,
            };

            let Some(item) = item else {
                tracing::info!("Queue channels closed, dispatcher exiting");
                break;
            };

            let permit = match permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let handler = handler.clone();
            let sender = self.sender.clone();
            let timeout = self.config.handler_timeout();
            let max_attempts = self.config.max_attempts;
            let backoff_base_secs = self.config.backoff_base_secs;

            tokio::spawn(async move {
                let _permit = permit;
                process_item(item, handler, sender, timeout, max_attempts, backoff_base_secs)
                    .await;
            });
        }
    }
}

/// Exponential backoff for the given attempt, floored by an optional
/// server-provided wait so a rate-limited item never comes back before
/// its window reopens.
fn requeue_delay_secs(backoff_base_secs: u64, retry_count: u32, floor_secs: Option<u64>) -> u64 {
    let backoff = backoff_base_secs << (retry_count - 1);
    match floor_secs {
        Some(floor) => backoff.max(floor),
        None => backoff,
    }
}

async fn process_item(
    mut item: QueueItem,
    handler: Arc<dyn QueueHandler>,
    sender: QueueSender,
    timeout: Duration,
    max_attempts: u32,
    backoff_base_secs: u64,
) {
    let kind = item.task.kind();
    let start = std::time::Instant::now();

    let result = match tokio::time::timeout(timeout, handler.handle(&item.task)).await {
        Ok(result) => result,
        Err(_) => Err(AppError::Transient(anyhow::anyhow!(
            "Handler timed out after {:?}",
            timeout
        ))),
    };

    match result {
        Ok(()) => {
            metrics::counter!("queue_items_processed_total", "type" => kind, "status" => "success")
                .increment(1);
            metrics::histogram!("queue_item_duration_seconds", "type" => kind)
                .record(start.elapsed().as_secs_f64());
        }
        Err(e) if e.is_retryable() && item.retry_count + 1 < max_attempts => {
            item.retry_count += 1;
            let floor_secs = match &e {
                AppError::RateLimited { retry_after } => Some(*retry_after),
                _ => None,
            };
            let delay_secs = requeue_delay_secs(backoff_base_secs, item.retry_count, floor_secs);
            let jitter_secs = rand::thread_rng().gen_range(0..=backoff_base_secs.max(1));
            let delay = Duration::from_secs(delay_secs + jitter_secs);

            metrics::counter!("queue_items_processed_total", "type" => kind, "status" => "requeued")
                .increment(1);
            tracing::warn!(
                item_id = %item.item_id,
                item_type = kind,
                retry_count = item.retry_count,
                delay_secs = delay.as_secs(),
                error = %e,
                "Item failed, requeueing with backoff"
            );

            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(e) = sender.enqueue_item(item) {
                    tracing::error!(error = %e, "Failed to requeue item after backoff");
                }
            });
        }
        Err(e) => {
            metrics::counter!(
                "queue_items_processed_total",
                "type" => kind,
                "status" => "dead_letter"
            )
            .increment(1);
            tracing::error!(
                item_id = %item.item_id,
                item_type = kind,
                retry_count = item.retry_count,
                error = %e,
                "Item dead-lettered"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_config() -> QueueConfig {
        QueueConfig {
            worker_count: 2,
            queue_size: 32,
            max_attempts: 3,
            handler_timeout_secs: 5,
            backoff_base_secs: 0,
        }
    }

    struct CountingHandler {
        calls: AtomicU32,
        fail_first: u32,
        permanent: bool,
    }

    #[async_trait]
    impl QueueHandler for CountingHandler {
        async fn handle(&self, _task: &Task) -> Result<(), AppError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.permanent {
                return Err(AppError::BadRequest(anyhow::anyhow!("bad item")));
            }
            if call < self.fail_first {
                return Err(AppError::Transient(anyhow::anyhow!("flaky")));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            fail_first: 2,
            permanent: false,
        });
        let token = CancellationToken::new();
        let (dispatcher, sender) = Dispatcher::new(test_config(), token.clone());
        let dispatcher_handle = tokio::spawn(dispatcher.run(handler.clone()));

        sender
            .enqueue(
                Task::CheckStatements {
                    account_id: Uuid::new_v4(),
                },
                Priority::Normal,
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        token.cancel();
        dispatcher_handle.await.unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_requeued() {
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            fail_first: 0,
            permanent: true,
        });
        let token = CancellationToken::new();
        let (dispatcher, sender) = Dispatcher::new(test_config(), token.clone());
        let dispatcher_handle = tokio::spawn(dispatcher.run(handler.clone()));

        sender
            .enqueue(
                Task::CheckStatements {
                    account_id: Uuid::new_v4(),
                },
                Priority::Normal,
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        token.cancel();
        dispatcher_handle.await.unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_item_types_are_dropped() {
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            fail_first: 0,
            permanent: false,
        });
        let token = CancellationToken::new();
        let (dispatcher, sender) = Dispatcher::new(test_config(), token.clone());
        let dispatcher_handle = tokio::spawn(dispatcher.run(handler.clone()));

        sender.enqueue_raw(
            serde_json::json!({ "type": "mint_gold", "payload": {} }),
            Priority::Normal,
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        token.cancel();
        dispatcher_handle.await.unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn backoff_is_floored_by_retry_after() {
        // base 30s, first retry: the 3600s window wins.
        assert_eq!(requeue_delay_secs(30, 1, Some(3600)), 3600);
        // late retries: backoff has outgrown the window.
        assert_eq!(requeue_delay_secs(30, 8, Some(60)), 30 << 7);
        // no window, plain exponential backoff.
        assert_eq!(requeue_delay_secs(30, 3, None), 120);
    }

    struct RateLimitedOnce {
        calls: std::sync::Mutex<Vec<tokio::time::Instant>>,
    }

    #[async_trait]
    impl QueueHandler for RateLimitedOnce {
        async fn handle(&self, _task: &Task) -> Result<(), AppError> {
            let mut calls = self.calls.lock().unwrap();
            calls.push(tokio::time::Instant::now());
            if calls.len() == 1 {
                Err(AppError::RateLimited { retry_after: 3600 })
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_items_wait_out_the_window() {
        let handler = Arc::new(RateLimitedOnce {
            calls: std::sync::Mutex::new(Vec::new()),
        });
        let token = CancellationToken::new();
        let (dispatcher, sender) = Dispatcher::new(test_config(), token.clone());
        let dispatcher_handle = tokio::spawn(dispatcher.run(handler.clone()));

        sender
            .enqueue(
                Task::CheckStatements {
                    account_id: Uuid::new_v4(),
                },
                Priority::Normal,
            )
            .unwrap();

        tokio::time::sleep(Duration::from_secs(7200)).await;
        token.cancel();
        dispatcher_handle.await.unwrap();

        let calls = handler.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert!(calls[1] - calls[0] >= Duration::from_secs(3600));
    }

    #[test]
    fn task_round_trips_through_tagged_json() {
        let task = Task::DeliverStatement {
            statement_id: Uuid::new_v4(),
            destination_id: Uuid::new_v4(),
            request_id: Uuid::new_v4(),
        };
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["type"], "deliver_statement");
        let parsed: Task = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.kind(), "deliver_statement");
    }
}
