//! Configured delivery destinations (cloud storage folders).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Storage provider behind a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    GoogleDrive,
    Dropbox,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::GoogleDrive => "google_drive",
            ProviderKind::Dropbox => "dropbox",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "google_drive" => Some(ProviderKind::GoogleDrive),
            "dropbox" => Some(ProviderKind::Dropbox),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationStatus {
    Active,
    /// Token refresh failed; requires user re-authorization and is
    /// never retried automatically.
    Expired,
}

impl DestinationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DestinationStatus::Active => "active",
            DestinationStatus::Expired => "expired",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "expired" => DestinationStatus::Expired,
            _ => DestinationStatus::Active,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Destination {
    pub destination_id: Uuid,
    pub provider: String,
    pub display_name: String,
    pub folder_path: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_expires_utc: Option<DateTime<Utc>>,
    pub status: String,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Destination {
    pub fn provider_kind(&self) -> Option<ProviderKind> {
        ProviderKind::from_string(&self.provider)
    }

    /// Token is treated as expiring when it is within the safety
    /// buffer of its recorded expiry, so refresh happens before an
    /// upload ever sees a 401.
    pub fn token_needs_refresh(&self, now: DateTime<Utc>, safety_buffer_secs: i64) -> bool {
        match self.token_expires_utc {
            Some(expiry) => now + Duration::seconds(safety_buffer_secs) >= expiry,
            None => false,
        }
    }
}
