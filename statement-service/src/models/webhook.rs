//! Outbound webhook endpoint configuration.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, FromRow)]
pub struct WebhookEndpoint {
    pub endpoint_id: Uuid,
    pub url: String,
    pub secret: String,
    pub is_active: bool,
    pub created_utc: DateTime<Utc>,
}
