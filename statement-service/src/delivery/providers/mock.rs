//! In-memory provider used by tests and in dev deployments with no
//! real storage credentials configured.

use super::{Chunk, StorageProvider, TokenSet};
use crate::models::{Destination, ProviderKind};
use crate::services::ByteStream;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use futures::StreamExt;
use pipeline_core::error::AppError;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

/// Scripted failure behavior for a mock upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    None,
    /// Fail every chunk with a transient error this many times before
    /// succeeding.
    TransientChunks(u32),
    /// Chunks at or past this offset fail transiently this many times.
    TransientAtOffset { offset: u64, times: u32 },
    /// Every chunk fails permanently.
    PermanentChunks,
    /// Token refresh is refused.
    RefreshRejected,
}

pub struct MockProvider {
    kind: ProviderKind,
    chunk_size: usize,
    failure: MockFailure,
    transient_budget: AtomicU32,
    /// (offset, len, is_last) per accepted chunk, in arrival order.
    pub accepted_chunks: Mutex<Vec<(u64, usize, bool)>>,
    pub finalized: Mutex<Vec<String>>,
    pub direct_uploads: Mutex<Vec<(String, u64)>>,
}

impl MockProvider {
    pub fn new(kind: ProviderKind, chunk_size: usize, failure: MockFailure) -> Self {
        let budget = match failure {
            MockFailure::TransientChunks(n) => n,
            MockFailure::TransientAtOffset { times, .. } => times,
            _ => 0,
        };
        Self {
            kind,
            chunk_size,
            failure,
            transient_budget: AtomicU32::new(budget),
            accepted_chunks: Mutex::new(Vec::new()),
            finalized: Mutex::new(Vec::new()),
            direct_uploads: Mutex::new(Vec::new()),
        }
    }

    pub fn accepted_bytes(&self) -> u64 {
        self.accepted_chunks
            .lock()
            .unwrap()
            .iter()
            .map(|(_, len, _)| *len as u64)
            .sum()
    }
}

#[async_trait]
impl StorageProvider for MockProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn chunk_size(&self, _file_size: Option<u64>) -> usize {
        self.chunk_size
    }

    async fn create_upload_session(
        &self,
        _destination: &Destination,
        file_name: &str,
        _mime_type: &str,
        _file_size: Option<u64>,
    ) -> Result<String, AppError> {
        Ok(format!("mock-session-{}", file_name))
    }

    async fn upload_chunk(
        &self,
        _destination: &Destination,
        _session: &str,
        chunk: &Chunk,
    ) -> Result<(), AppError> {
        match self.failure {
            MockFailure::PermanentChunks => {
                return Err(AppError::DeliveryFailed(anyhow::anyhow!(
                    "mock: chunk rejected"
                )));
            }
            MockFailure::TransientChunks(_) => {
                let remaining = self.transient_budget.load(Ordering::SeqCst);
                if remaining > 0 {
                    self.transient_budget.fetch_sub(1, Ordering::SeqCst);
                    return Err(AppError::Transient(anyhow::anyhow!("mock: flaky chunk")));
                }
            }
            MockFailure::TransientAtOffset { offset, .. } => {
                let remaining = self.transient_budget.load(Ordering::SeqCst);
                if chunk.offset >= offset && remaining > 0 {
                    self.transient_budget.fetch_sub(1, Ordering::SeqCst);
                    return Err(AppError::Transient(anyhow::anyhow!("mock: flaky chunk")));
                }
            }
            _ => {}
        }

        self.accepted_chunks
            .lock()
            .unwrap()
            .push((chunk.offset, chunk.data.len(), chunk.is_last));
        Ok(())
    }

    async fn finalize_upload(
        &self,
        _destination: &Destination,
        session: &str,
        _file_name: &str,
        _total_bytes: u64,
    ) -> Result<(), AppError> {
        self.finalized.lock().unwrap().push(session.to_string());
        Ok(())
    }

    async fn upload_direct(
        &self,
        _destination: &Destination,
        file_name: &str,
        _mime_type: &str,
        mut body: ByteStream,
        _file_size: Option<u64>,
    ) -> Result<(), AppError> {
        if self.failure == MockFailure::PermanentChunks {
            return Err(AppError::DeliveryFailed(anyhow::anyhow!(
                "mock: upload rejected"
            )));
        }
        let mut total = 0u64;
        while let Some(chunk) = body.next().await {
            total += chunk?.len() as u64;
        }
        self.direct_uploads
            .lock()
            .unwrap()
            .push((file_name.to_string(), total));
        Ok(())
    }

    async fn validate_tokens(&self, _destination: &Destination) -> Result<bool, AppError> {
        Ok(self.failure != MockFailure::RefreshRejected)
    }

    async fn refresh_tokens(&self, destination: &Destination) -> Result<TokenSet, AppError> {
        if self.failure == MockFailure::RefreshRejected {
            return Err(AppError::CredentialsExpired(
                destination.destination_id.to_string(),
            ));
        }
        Ok(TokenSet {
            access_token: "mock-refreshed-token".to_string(),
            refresh_token: destination.refresh_token.clone(),
            expires_at: Some(Utc::now() + Duration::hours(1)),
        })
    }
}
