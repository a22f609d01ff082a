//! Storage provider adapters.
//!
//! Each destination provider exposes the same five operations behind
//! `StorageProvider`; session handling, byte-range semantics, and
//! finalization quirks are normalized inside the adapters so the
//! engine never branches on provider identity.

pub mod dropbox;
pub mod google_drive;
pub mod mock;

pub use dropbox::DropboxProvider;
pub use google_drive::GoogleDriveProvider;
pub use mock::MockProvider;

use crate::models::{Destination, ProviderKind};
use crate::services::ByteStream;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use pipeline_core::error::AppError;

/// One chunk of an in-progress upload. `offset` is the byte position
/// of the first byte; ranges are computed by the engine from the
/// running `bytes_uploaded` cursor.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub offset: u64,
    pub data: Bytes,
    pub total_size: Option<u64>,
    pub is_last: bool,
}

impl Chunk {
    pub fn end_offset(&self) -> u64 {
        self.offset + self.data.len() as u64
    }
}

/// Refreshed OAuth credentials for a destination.
#[derive(Debug, Clone)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait StorageProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Provider-tuned chunk size. Small files get a smaller chunk so a
    /// single retry does not resend megabytes.
    fn chunk_size(&self, file_size: Option<u64>) -> usize;

    /// Open a chunked upload session; returns the provider-side
    /// session handle (resumable URI, session id, ...).
    async fn create_upload_session(
        &self,
        destination: &Destination,
        file_name: &str,
        mime_type: &str,
        file_size: Option<u64>,
    ) -> Result<String, AppError>;

    /// Upload one chunk. Chunks are strictly sequential; the provider
    /// may assume `chunk.offset` equals the bytes it has accepted so
    /// far.
    async fn upload_chunk(
        &self,
        destination: &Destination,
        session: &str,
        chunk: &Chunk,
    ) -> Result<(), AppError>;

    /// Commit the upload. Providers that finalize implicitly on the
    /// last chunk implement this as a no-op, so the engine can call it
    /// unconditionally.
    async fn finalize_upload(
        &self,
        destination: &Destination,
        session: &str,
        file_name: &str,
        total_bytes: u64,
    ) -> Result<(), AppError>;

    /// Single-shot upload with no session and no chunking; the source
    /// stream is piped straight into the request body.
    async fn upload_direct(
        &self,
        destination: &Destination,
        file_name: &str,
        mime_type: &str,
        body: ByteStream,
        file_size: Option<u64>,
    ) -> Result<(), AppError>;

    /// Cheap probe that the current access token is accepted.
    async fn validate_tokens(&self, destination: &Destination) -> Result<bool, AppError>;

    /// Exchange the refresh token for fresh credentials.
    async fn refresh_tokens(&self, destination: &Destination) -> Result<TokenSet, AppError>;
}

/// Map a provider HTTP status onto the error taxonomy.
pub(crate) fn classify_provider_status(
    kind: ProviderKind,
    status: reqwest::StatusCode,
    body: String,
) -> AppError {
    if status == reqwest::StatusCode::UNAUTHORIZED {
        AppError::CredentialsExpired(kind.as_str().to_string())
    } else if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        AppError::RateLimited { retry_after: 60 }
    } else if status.is_client_error() {
        AppError::DeliveryFailed(anyhow::anyhow!(
            "{} rejected request ({}): {}",
            kind.as_str(),
            status,
            body
        ))
    } else {
        AppError::Transient(anyhow::anyhow!(
            "{} error ({}): {}",
            kind.as_str(),
            status,
            body
        ))
    }
}
