//! HTTP surface: probes, metrics and the inbound aggregator webhook.

use crate::queue::Priority;
use crate::startup::AppState;
use crate::webhook::{check_timestamp, verify};
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use pipeline_core::error::AppError;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::json;

pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.db.health_check().await {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "service": "statement-service",
                "version": env!("CARGO_PKG_VERSION")
            })),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed - database unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": "statement-service",
                    "error": e.to_string()
                })),
            )
        }
    }
}

pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.db.health_check().await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

pub async fn metrics_handler() -> impl IntoResponse {
    let metrics = crate::services::get_metrics();
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        metrics,
    )
}

/// Aggregator push notification: statements are ready for an account.
#[derive(Debug, Deserialize)]
pub struct AggregatorEvent {
    pub event: String,
    pub account_id: uuid::Uuid,
}

/// Inbound webhook from the aggregator.
///
/// The signature covers the raw body; verification happens before the
/// payload is parsed. Valid notifications enqueue a high-priority
/// statement check and return 200 immediately; the actual retrieval is
/// asynchronous.
pub async fn aggregator_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<StatusCode, AppError> {
    let signature = headers
        .get("X-Signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Missing X-Signature header on aggregator webhook");
            AppError::InvalidSignature
        })?;

    let timestamp = headers
        .get("X-Timestamp")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
        .ok_or_else(|| {
            tracing::warn!("Missing or malformed X-Timestamp header on aggregator webhook");
            AppError::StaleTimestamp("Missing or malformed X-Timestamp".to_string())
        })?;
    check_timestamp(timestamp, Utc::now())?;

    let secret = state.config.aggregator.webhook_secret.expose_secret();
    if !verify(&body, signature, secret)? {
        tracing::warn!("Aggregator webhook signature mismatch");
        return Err(AppError::InvalidSignature);
    }

    let event: AggregatorEvent = serde_json::from_str(&body).map_err(|e| {
        tracing::warn!(error = %e, "Unparseable aggregator webhook payload");
        AppError::BadRequest(anyhow::anyhow!("Invalid webhook payload"))
    })?;

    match event.event.as_str() {
        "statements.ready" => {
            tracing::info!(
                account_id = %event.account_id,
                "Aggregator says statements are ready, enqueueing check"
            );
            state.queue.enqueue(
                crate::queue::Task::CheckStatements {
                    account_id: event.account_id,
                },
                Priority::High,
            )?;
        }
        other => {
            tracing::debug!(event_type = %other, "Ignoring aggregator event type");
        }
    }

    Ok(StatusCode::OK)
}
