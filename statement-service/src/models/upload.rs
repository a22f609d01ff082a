//! In-memory upload session state for chunked/resumable uploads.
//!
//! Sessions live in a keyed arena with an explicit TTL sweep rather
//! than a database table; they are discarded once terminal.

use crate::models::ProviderKind;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Pending,
    Uploading,
    Completed,
    Failed,
}

impl UploadStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadStatus::Completed | UploadStatus::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct UploadSession {
    pub session_id: Uuid,
    pub destination_id: Uuid,
    pub provider: ProviderKind,
    /// Provider-side session handle: a resumable URI for Drive, a
    /// session id for Dropbox.
    pub provider_session: String,
    pub file_name: String,
    pub file_size: Option<u64>,
    pub mime_type: String,
    pub bytes_uploaded: u64,
    pub chunk_size: usize,
    pub status: UploadStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl UploadSession {
    pub fn new(
        destination_id: Uuid,
        provider: ProviderKind,
        provider_session: String,
        file_name: String,
        file_size: Option<u64>,
        mime_type: String,
        chunk_size: usize,
        ttl_secs: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::new_v4(),
            destination_id,
            provider,
            provider_session,
            file_name,
            file_size,
            mime_type,
            bytes_uploaded: 0,
            chunk_size,
            status: UploadStatus::Pending,
            created_at: now,
            expires_at: now + Duration::seconds(ttl_secs),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_starts_pending_at_offset_zero() {
        let session = UploadSession::new(
            Uuid::new_v4(),
            ProviderKind::Dropbox,
            "sess-1".to_string(),
            "statement_2024-01-31.pdf".to_string(),
            Some(1024),
            "application/pdf".to_string(),
            4 * 1024 * 1024,
            3600,
        );
        assert_eq!(session.status, UploadStatus::Pending);
        assert_eq!(session.bytes_uploaded, 0);
        assert!(!session.is_expired(Utc::now()));
    }

    #[test]
    fn session_expires_after_ttl() {
        let session = UploadSession::new(
            Uuid::new_v4(),
            ProviderKind::GoogleDrive,
            "uri".to_string(),
            "f.pdf".to_string(),
            None,
            "application/pdf".to_string(),
            8 * 1024 * 1024,
            0,
        );
        assert!(session.is_expired(Utc::now() + Duration::seconds(1)));
    }
}
