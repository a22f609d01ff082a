//! Queue handler wiring the pipeline together.
//!
//! Every background item lands here: statement checks go to the
//! coordinator, deliveries pull the file from the aggregator and push
//! it through the delivery engine, refreshes go straight to the
//! engine. Destination failures are isolated per destination; webhook
//! notifications fan out to every active endpoint.

use crate::coordinator::{AccountCoordinator, RetrievalOutcome};
use crate::delivery::StreamingDeliveryEngine;
use crate::models::{DeliveryStatus, DestinationStatus, StatementRecord};
use crate::queue::{Priority, QueueHandler, QueueSender, Task};
use crate::services::{Database, StatementSource};
use crate::webhook::{WebhookDelivery, WebhookEvent, WebhookEventType};
use async_trait::async_trait;
use chrono::Utc;
use pipeline_core::error::AppError;
use std::sync::Arc;
use uuid::Uuid;

pub struct PipelineHandler {
    db: Database,
    coordinator: Arc<AccountCoordinator>,
    engine: Arc<StreamingDeliveryEngine>,
    source: Arc<dyn StatementSource>,
    webhooks: WebhookDelivery,
    queue: QueueSender,
}

impl PipelineHandler {
    pub fn new(
        db: Database,
        coordinator: Arc<AccountCoordinator>,
        engine: Arc<StreamingDeliveryEngine>,
        source: Arc<dyn StatementSource>,
        webhooks: WebhookDelivery,
        queue: QueueSender,
    ) -> Self {
        Self {
            db,
            coordinator,
            engine,
            source,
            webhooks,
            queue,
        }
    }

    async fn check_statements(&self, account_id: Uuid) -> Result<(), AppError> {
        match self.coordinator.check_account(account_id).await? {
            RetrievalOutcome::RateLimited { retry_after } => {
                // Retryable so the dispatcher requeues with backoff.
                Err(AppError::RateLimited { retry_after })
            }
            outcome => {
                tracing::debug!(account_id = %account_id, outcome = ?outcome, "Check finished");
                Ok(())
            }
        }
    }

    async fn deliver_statement(
        &self,
        statement_id: Uuid,
        destination_id: Uuid,
        request_id: Uuid,
        resume_session: Option<Uuid>,
    ) -> Result<(), AppError> {
        let record = self.db.get_statement(statement_id).await?;
        let account = self.db.get_account(record.account_id).await?;
        let destination = self.db.get_destination(destination_id).await?;

        if DestinationStatus::from_string(&destination.status) != DestinationStatus::Active {
            tracing::warn!(
                destination_id = %destination_id,
                statement_id = %statement_id,
                "Destination is not active, dropping delivery"
            );
            self.db
                .record_delivery_result(
                    statement_id,
                    destination_id,
                    DeliveryStatus::Failed,
                    Some("destination requires re-authorization"),
                )
                .await?;
            return Ok(());
        }

        let (stream, size) = self
            .source
            .download_statement(&account.connection_id, &record.upstream_ref)
            .await?;

        let result = match resume_session {
            Some(session_id) if self.engine.sessions().get(session_id).is_some() => {
                self.engine.resume(&destination, session_id, stream).await
            }
            _ => {
                self.engine
                    .deliver(
                        &destination,
                        &record.file_name(),
                        record.mime_type(),
                        size,
                        stream,
                    )
                    .await
            }
        };

        match result {
            Ok(receipt) => {
                self.db
                    .record_delivery_result(
                        statement_id,
                        destination_id,
                        DeliveryStatus::Succeeded,
                        None,
                    )
                    .await?;
                self.notify(
                    WebhookEventType::StatementDelivered,
                    record.account_id,
                    serde_json::json!({
                        "statement_id": statement_id,
                        "destination_id": destination_id,
                        "request_id": request_id,
                        "file_name": record.file_name(),
                        "bytes_delivered": receipt.bytes_delivered,
                    }),
                )
                .await;
                Ok(())
            }
            Err(AppError::CredentialsExpired(_)) => {
                // Terminal until the user re-authorizes; never requeued.
                self.db
                    .record_delivery_result(
                        statement_id,
                        destination_id,
                        DeliveryStatus::Failed,
                        Some("credentials expired"),
                    )
                    .await?;
                self.notify_reauth(record.account_id, destination_id).await;
                Ok(())
            }
            Err(e) => {
                let status = if e.is_retryable() {
                    DeliveryStatus::Retrying
                } else {
                    DeliveryStatus::Failed
                };
                self.db
                    .record_delivery_result(
                        statement_id,
                        destination_id,
                        status,
                        Some(&e.to_string()),
                    )
                    .await?;
                if !e.is_retryable() {
                    self.notify_failed(&record, destination_id, &e).await;
                    return Err(e);
                }
                // An interrupted chunked upload left a live session
                // behind: hand it off as a continuation item so the
                // retry picks up at the last confirmed offset instead
                // of restarting the transfer. Continuations that fail
                // again stay continuations and ride the normal
                // retry/dead-letter path.
                if resume_session.is_none() {
                    if let Some(session) = self.engine.sessions().find_resumable(
                        destination_id,
                        &record.file_name(),
                        Utc::now(),
                    ) {
                        let continuation = Task::StorageUpload {
                            statement_id,
                            destination_id,
                            session_id: session.session_id,
                            request_id,
                        };
                        if self.queue.enqueue(continuation, Priority::Normal).is_ok() {
                            tracing::info!(
                                statement_id = %statement_id,
                                destination_id = %destination_id,
                                session_id = %session.session_id,
                                bytes_uploaded = session.bytes_uploaded,
                                "Enqueued upload continuation"
                            );
                            return Ok(());
                        }
                    }
                }
                Err(e)
            }
        }
    }

    async fn refresh_tokens(&self, destination_id: Uuid) -> Result<(), AppError> {
        let destination = self.db.get_destination(destination_id).await?;
        match self.engine.refresh_destination(&destination).await {
            Ok(()) => Ok(()),
            Err(AppError::CredentialsExpired(_)) => {
                // Find any account linked to this destination for the
                // webhook payload; fall back to a nil account id when
                // the destination is orphaned.
                self.notify_reauth(Uuid::nil(), destination_id).await;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn notify_failed(&self, record: &StatementRecord, destination_id: Uuid, error: &AppError) {
        self.notify(
            WebhookEventType::StatementFailed,
            record.account_id,
            serde_json::json!({
                "statement_id": record.statement_id,
                "destination_id": destination_id,
                "file_name": record.file_name(),
                "error": error.to_string(),
            }),
        )
        .await;
    }

    async fn notify_reauth(&self, account_id: Uuid, destination_id: Uuid) {
        self.notify(
            WebhookEventType::ReauthRequired,
            account_id,
            serde_json::json!({ "destination_id": destination_id }),
        )
        .await;
    }

    /// Fan an event out to every active endpoint. Webhook failures are
    /// logged, never propagated; notification is best-effort.
    async fn notify(&self, event_type: WebhookEventType, account_id: Uuid, data: serde_json::Value) {
        let endpoints = match self.db.list_active_webhook_endpoints().await {
            Ok(endpoints) => endpoints,
            Err(e) => {
                tracing::error!(error = %e, "Failed to list webhook endpoints");
                return;
            }
        };

        let event = WebhookEvent::new(event_type, account_id, data);
        for endpoint in endpoints {
            let delivery_id = Uuid::new_v4();
            if let Err(e) = self
                .webhooks
                .deliver_with_retry(&endpoint.url, &event, &endpoint.secret, delivery_id)
                .await
            {
                tracing::error!(
                    endpoint_id = %endpoint.endpoint_id,
                    error = %e,
                    "Webhook delivery exhausted retries"
                );
            }
        }
    }
}

#[async_trait]
impl QueueHandler for PipelineHandler {
    async fn handle(&self, task: &Task) -> Result<(), AppError> {
        match task {
            Task::CheckStatements { account_id } => self.check_statements(*account_id).await,
            Task::DeliverStatement {
                statement_id,
                destination_id,
                request_id,
            } => {
                self.deliver_statement(*statement_id, *destination_id, *request_id, None)
                    .await
            }
            Task::StorageUpload {
                statement_id,
                destination_id,
                session_id,
                request_id,
            } => {
                self.deliver_statement(
                    *statement_id,
                    *destination_id,
                    *request_id,
                    Some(*session_id),
                )
                .await
            }
            Task::StorageRefreshTokens { destination_id } => {
                self.refresh_tokens(*destination_id).await
            }
        }
    }
}
