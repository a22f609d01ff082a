//! Database-backed pipeline tests.
//!
//! These need a PostgreSQL instance; set TEST_DATABASE_URL to run
//! them, otherwise each test returns without asserting anything.

use chrono::NaiveDate;
use pipeline_core::error::AppError;
use statement_service::config::{DeliveryConfig, QueueConfig, RateLimitConfig};
use statement_service::coordinator::{AccountCoordinator, RetrievalOutcome};
use statement_service::delivery::providers::mock::{MockFailure, MockProvider};
use statement_service::delivery::providers::StorageProvider;
use statement_service::delivery::StreamingDeliveryEngine;
use statement_service::models::{ProviderKind, UpstreamStatement};
use statement_service::pipeline::PipelineHandler;
use statement_service::queue::{Dispatcher, QueueHandler, Task};
use statement_service::services::{
    ByteStream, Database, LearningService, MockStatementSource, RateLimiter, StatementSource,
};
use statement_service::webhook::WebhookDelivery;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

async fn test_db() -> Option<Database> {
    let url = std::env::var("TEST_DATABASE_URL").ok()?;
    let db = Database::new(&url, 4, 1)
        .await
        .expect("Failed to connect to test database");
    db.run_migrations().await.expect("Failed to run migrations");
    Some(db)
}

async fn seed_account(db: &Database) -> Uuid {
    let account_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO accounts (account_id, institution_id, connection_id) VALUES ($1, 'inst-test', $2)",
    )
    .bind(account_id)
    .bind(format!("conn-{}", account_id))
    .execute(db.pool())
    .await
    .expect("Failed to seed account");
    account_id
}

async fn seed_destination(db: &Database, account_id: Uuid) -> Uuid {
    let destination_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO destinations (destination_id, provider, display_name, folder_path, access_token)
         VALUES ($1, 'google_drive', 'Test drive', '/statements', 'token')",
    )
    .bind(destination_id)
    .execute(db.pool())
    .await
    .expect("Failed to seed destination");
    sqlx::query("INSERT INTO account_destinations (account_id, destination_id) VALUES ($1, $2)")
        .bind(account_id)
        .bind(destination_id)
        .execute(db.pool())
        .await
        .expect("Failed to link destination");
    destination_id
}

fn upstream(statement_id: &str) -> UpstreamStatement {
    UpstreamStatement {
        statement_id: statement_id.to_string(),
        period_start: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        period_end: NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
        statement_date: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
        file_type: "pdf".to_string(),
        checksum: None,
        size_bytes: Some(10240),
    }
}

fn queue_config() -> QueueConfig {
    QueueConfig {
        worker_count: 2,
        queue_size: 32,
        max_attempts: 3,
        handler_timeout_secs: 30,
        backoff_base_secs: 0,
    }
}

fn rate_config() -> RateLimitConfig {
    RateLimitConfig {
        account_limit: 10,
        account_window_secs: 3600,
    }
}

fn delivery_config() -> DeliveryConfig {
    DeliveryConfig {
        direct_streaming: false,
        chunk_max_attempts: 3,
        chunk_backoff_base_ms: 1,
        token_safety_buffer_secs: 300,
        session_ttl_secs: 3600,
        session_sweep_interval_secs: 600,
        webhook_max_attempts: 1,
        webhook_timeout_secs: 5,
    }
}

#[tokio::test]
async fn rediscovered_statement_bumps_version_in_place() {
    let Some(db) = test_db().await else { return };
    let account_id = seed_account(&db).await;

    let first = db
        .upsert_statement(account_id, &upstream("agg-1"))
        .await
        .unwrap();
    assert_eq!(first.version, 1);
    assert!(first.is_first_sighting());

    // Same (account, period_end, file_type) seen again with a fresh
    // aggregator reference: one row, bumped version, new reference.
    let second = db
        .upsert_statement(account_id, &upstream("agg-2"))
        .await
        .unwrap();
    assert_eq!(second.statement_id, first.statement_id);
    assert_eq!(second.version, 2);
    assert!(!second.is_first_sighting());
    assert_eq!(second.upstream_ref, "agg-2");
}

/// Holds `list_statements` open until released so a second check can
/// be issued while the first is mid-retrieval.
struct GatedSource {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait::async_trait]
impl StatementSource for GatedSource {
    async fn list_statements(
        &self,
        _connection_id: &str,
        _account_ref: &str,
        _since: Option<NaiveDate>,
    ) -> Result<Vec<UpstreamStatement>, AppError> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(Vec::new())
    }

    async fn download_statement(
        &self,
        _connection_id: &str,
        _statement_id: &str,
    ) -> Result<(ByteStream, Option<u64>), AppError> {
        Err(AppError::NotFound(anyhow::anyhow!("no file")))
    }
}

#[tokio::test]
async fn concurrent_checks_on_one_account_yield_one_skip() {
    let Some(db) = test_db().await else { return };
    let account_id = seed_account(&db).await;

    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let source = Arc::new(GatedSource {
        entered: entered.clone(),
        release: release.clone(),
    });

    let (_dispatcher, sender) = Dispatcher::new(queue_config(), CancellationToken::new());
    let coordinator = Arc::new(AccountCoordinator::new(
        db.clone(),
        Arc::new(RateLimiter::new()),
        rate_config(),
        Arc::new(LearningService::new(db.clone())),
        source,
        sender,
    ));

    let first = tokio::spawn({
        let coordinator = coordinator.clone();
        async move { coordinator.check_account(account_id).await }
    });

    // Wait until the first check holds the account slot.
    entered.notified().await;
    let second = coordinator.check_account(account_id).await.unwrap();
    assert!(matches!(second, RetrievalOutcome::SkippedInFlight));

    release.notify_one();
    let first = first.await.unwrap().unwrap();
    assert!(matches!(first, RetrievalOutcome::Completed { .. }));

    // The slot is released; a later check goes through again.
    release.notify_one();
    let third = coordinator.check_account(account_id).await.unwrap();
    assert!(matches!(third, RetrievalOutcome::Completed { .. }));
}

struct RecordingHandler {
    tasks: Mutex<Vec<Task>>,
}

#[async_trait::async_trait]
impl QueueHandler for RecordingHandler {
    async fn handle(&self, task: &Task) -> Result<(), AppError> {
        self.tasks.lock().unwrap().push(task.clone());
        Ok(())
    }
}

#[tokio::test]
async fn interrupted_delivery_enqueues_an_upload_continuation() {
    let Some(db) = test_db().await else { return };
    let account_id = seed_account(&db).await;
    let destination_id = seed_destination(&db, account_id).await;
    let record = db
        .upsert_statement(account_id, &upstream("agg-1"))
        .await
        .unwrap();
    let request_id = Uuid::new_v4();
    db.ensure_delivery_attempt(record.statement_id, destination_id, request_id)
        .await
        .unwrap();

    // First chunk lands, the one at offset 4096 keeps failing past the
    // per-chunk retry budget, so the delivery fails mid-transfer.
    let provider: Arc<dyn StorageProvider> = Arc::new(MockProvider::new(
        ProviderKind::GoogleDrive,
        4096,
        MockFailure::TransientAtOffset {
            offset: 4096,
            times: 10,
        },
    ));
    let engine = Arc::new(StreamingDeliveryEngine::new(
        vec![provider],
        Arc::new(db.clone()),
        delivery_config(),
    ));

    let source = Arc::new(MockStatementSource::new(Vec::new(), vec![0xAB; 10240]));
    let token = CancellationToken::new();
    let (dispatcher, sender) = Dispatcher::new(queue_config(), token.clone());
    let coordinator = Arc::new(AccountCoordinator::new(
        db.clone(),
        Arc::new(RateLimiter::new()),
        rate_config(),
        Arc::new(LearningService::new(db.clone())),
        source.clone(),
        sender.clone(),
    ));
    let handler = PipelineHandler::new(
        db.clone(),
        coordinator,
        engine.clone(),
        source,
        WebhookDelivery::new(5, 1).unwrap(),
        sender,
    );

    let outcome = handler
        .handle(&Task::DeliverStatement {
            statement_id: record.statement_id,
            destination_id,
            request_id,
        })
        .await;
    // No error surfaces: the interrupted upload became a continuation.
    assert!(outcome.is_ok());

    let session = engine
        .sessions()
        .find_resumable(destination_id, &record.file_name(), chrono::Utc::now())
        .expect("interrupted session should remain in the arena");
    assert_eq!(session.bytes_uploaded, 4096);

    // Drain the queue and check the continuation item is on it.
    let recording = Arc::new(RecordingHandler {
        tasks: Mutex::new(Vec::new()),
    });
    let dispatcher_handle = tokio::spawn(dispatcher.run(recording.clone()));
    tokio::time::sleep(Duration::from_millis(300)).await;
    token.cancel();
    dispatcher_handle.await.unwrap();

    let tasks = recording.tasks.lock().unwrap();
    assert!(tasks.iter().any(|task| matches!(
        task,
        Task::StorageUpload {
            statement_id,
            destination_id: dest,
            session_id,
            ..
        } if *statement_id == record.statement_id
            && *dest == destination_id
            && *session_id == session.session_id
    )));

    let status: String = sqlx::query_scalar(
        "SELECT status FROM delivery_attempts WHERE statement_id = $1 AND destination_id = $2",
    )
    .bind(record.statement_id)
    .bind(destination_id)
    .fetch_one(db.pool())
    .await
    .unwrap();
    assert_eq!(status, "retrying");
}
