//! Signed webhook delivery.
//!
//! Outbound events are HMAC-SHA256 signed over the JSON body and
//! retried with exponential backoff. Inbound aggregator webhooks are
//! verified with the same primitive before their content is trusted.

use chrono::{DateTime, Duration, Utc};
use pipeline_core::error::AppError;
use pipeline_core::utils::signature::{hmac_sha256_hex, verify_hmac_hex};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Signature header value prefix.
const SIGNATURE_PREFIX: &str = "sha256=";

/// Payloads older or newer than this are rejected outright.
const MAX_CLOCK_SKEW_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventType {
    StatementDelivered,
    StatementFailed,
    ReauthRequired,
    MonthlySummary,
}

/// Outbound webhook payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub event_type: WebhookEventType,
    pub timestamp: DateTime<Utc>,
    pub account_id: Uuid,
    pub data: serde_json::Value,
}

impl WebhookEvent {
    pub fn new(event_type: WebhookEventType, account_id: Uuid, data: serde_json::Value) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            account_id,
            data,
        }
    }
}

/// Sign a JSON payload: `sha256=<hex HMAC-SHA256>`.
pub fn sign(payload_json: &str, secret: &str) -> Result<String, AppError> {
    let hex = hmac_sha256_hex(secret, payload_json)
        .map_err(|e| AppError::InternalError(anyhow::anyhow!(e)))?;
    Ok(format!("{}{}", SIGNATURE_PREFIX, hex))
}

/// Verify a `sha256=`-prefixed signature over a raw payload.
pub fn verify(payload: &str, signature: &str, secret: &str) -> Result<bool, AppError> {
    let hex = signature.strip_prefix(SIGNATURE_PREFIX).unwrap_or(signature);
    verify_hmac_hex(secret, payload, hex).map_err(|e| AppError::InternalError(anyhow::anyhow!(e)))
}

/// Clock-skew guard shared by outbound and inbound paths.
pub fn check_timestamp(timestamp: DateTime<Utc>, now: DateTime<Utc>) -> Result<(), AppError> {
    let skew = (now - timestamp).num_seconds().abs();
    if skew > MAX_CLOCK_SKEW_SECS {
        return Err(AppError::StaleTimestamp(format!(
            "Payload timestamp is {}s from now (max {}s)",
            skew, MAX_CLOCK_SKEW_SECS
        )));
    }
    Ok(())
}

/// Whether a failed delivery attempt with this HTTP status is worth
/// retrying. Client errors are permanent, except timeout (408) and
/// rate limiting (429).
pub fn status_is_retryable(status: reqwest::StatusCode) -> bool {
    if status.is_client_error() {
        status == reqwest::StatusCode::REQUEST_TIMEOUT
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
    } else {
        !status.is_success()
    }
}

#[derive(Clone)]
pub struct WebhookDelivery {
    client: Client,
    max_attempts: u32,
}

impl WebhookDelivery {
    pub fn new(timeout_secs: u64, max_attempts: u32) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| AppError::InternalError(anyhow::anyhow!(e)))?;
        Ok(Self {
            client,
            max_attempts,
        })
    }

    /// Sign and POST one event. Rejects stale payloads before any
    /// network I/O.
    pub async fn deliver(
        &self,
        url: &str,
        event: &WebhookEvent,
        secret: &str,
        delivery_id: Uuid,
        attempt: u32,
    ) -> Result<(), AppError> {
        check_timestamp(event.timestamp, Utc::now())?;

        let payload = serde_json::to_string(event)?;
        let signature = sign(&payload, secret)?;

        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header("X-Signature", &signature)
            .header("X-Timestamp", event.timestamp.to_rfc3339())
            .header("X-Delivery-ID", delivery_id.to_string())
            .header("X-Attempt", attempt.to_string())
            .body(payload)
            .send()
            .await
            .map_err(|e| AppError::Transient(anyhow::anyhow!("Webhook POST failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            metrics::counter!("webhook_deliveries_total", "status" => "success").increment(1);
            tracing::info!(
                delivery_id = %delivery_id,
                url = %url,
                attempt = attempt,
                "Webhook delivered"
            );
            Ok(())
        } else {
            metrics::counter!("webhook_deliveries_total", "status" => "failure").increment(1);
            tracing::warn!(
                delivery_id = %delivery_id,
                url = %url,
                status = %status,
                attempt = attempt,
                "Webhook delivery rejected"
            );
            if status_is_retryable(status) {
                Err(AppError::Transient(anyhow::anyhow!(
                    "Webhook endpoint returned {}",
                    status
                )))
            } else {
                Err(AppError::DeliveryFailed(anyhow::anyhow!(
                    "Webhook endpoint returned permanent error {}",
                    status
                )))
            }
        }
    }

    /// Deliver with exponential backoff: 1s, 2s, 4s, ... between
    /// attempts. Permanent failures (non-retryable 4xx) stop early.
    pub async fn deliver_with_retry(
        &self,
        url: &str,
        event: &WebhookEvent,
        secret: &str,
        delivery_id: Uuid,
    ) -> Result<(), AppError> {
        let mut last_err = None;

        for attempt in 1..=self.max_attempts {
            match self.deliver(url, event, secret, delivery_id, attempt).await {
                Ok(()) => return Ok(()),
                Err(e @ AppError::Transient(_)) => {
                    let delay = std::time::Duration::from_secs(1 << (attempt - 1).min(6));
                    tracing::debug!(
                        delivery_id = %delivery_id,
                        attempt = attempt,
                        delay_secs = delay.as_secs(),
                        "Retrying webhook delivery"
                    );
                    last_err = Some(e);
                    if attempt < self.max_attempts {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| {
            AppError::DeliveryFailed(anyhow::anyhow!("Webhook delivery exhausted retries"))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_round_trip() {
        let payload = r#"{"event_type":"statement_delivered","account_id":"abc"}"#;
        let signature = sign(payload, "secret").unwrap();
        assert!(signature.starts_with("sha256="));
        assert!(verify(payload, &signature, "secret").unwrap());
    }

    #[test]
    fn flipping_one_character_breaks_verification() {
        let payload = r#"{"amount":100}"#;
        let signature = sign(payload, "secret").unwrap();
        let tampered = r#"{"amount":101}"#;
        assert!(!verify(tampered, &signature, "secret").unwrap());
    }

    #[test]
    fn six_minute_old_timestamp_is_rejected() {
        let now = Utc::now();
        assert!(check_timestamp(now - Duration::minutes(6), now).is_err());
    }

    #[test]
    fn four_minute_old_timestamp_is_accepted() {
        let now = Utc::now();
        assert!(check_timestamp(now - Duration::minutes(4), now).is_ok());
    }

    #[test]
    fn future_skew_is_also_rejected() {
        let now = Utc::now();
        assert!(check_timestamp(now + Duration::minutes(6), now).is_err());
        assert!(check_timestamp(now + Duration::minutes(2), now).is_ok());
    }

    #[test]
    fn retry_policy_for_http_statuses() {
        use reqwest::StatusCode;
        assert!(status_is_retryable(StatusCode::REQUEST_TIMEOUT));
        assert!(status_is_retryable(StatusCode::TOO_MANY_REQUESTS));
        assert!(status_is_retryable(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(status_is_retryable(StatusCode::BAD_GATEWAY));
        assert!(!status_is_retryable(StatusCode::BAD_REQUEST));
        assert!(!status_is_retryable(StatusCode::NOT_FOUND));
        assert!(!status_is_retryable(StatusCode::UNPROCESSABLE_ENTITY));
    }

    #[test]
    fn event_serializes_with_snake_case_type() {
        let event = WebhookEvent::new(
            WebhookEventType::ReauthRequired,
            Uuid::new_v4(),
            serde_json::json!({"destination_id": "d1"}),
        );
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""event_type":"reauth_required""#));
    }
}
