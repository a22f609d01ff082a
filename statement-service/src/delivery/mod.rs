//! Provider-agnostic streaming delivery engine.
//!
//! Moves statement bytes from a source stream into a destination
//! without ever holding more than one chunk in memory. Two modes:
//! direct single-shot streaming for small deployments, and
//! chunked/resumable sessions with per-chunk retry for everything
//! else.

pub mod providers;

use crate::config::DeliveryConfig;
use crate::models::{Destination, ProviderKind, UploadSession, UploadStatus};
use crate::services::ByteStream;
use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::StreamExt;
use pipeline_core::error::AppError;
use providers::{Chunk, StorageProvider, TokenSet};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Persistence seam for token updates and expiry marking, so the
/// engine itself stays storage-agnostic.
#[async_trait]
pub trait DestinationStore: Send + Sync {
    async fn update_tokens(&self, destination_id: Uuid, tokens: &TokenSet) -> Result<(), AppError>;
    async fn mark_expired(&self, destination_id: Uuid) -> Result<(), AppError>;
}

#[async_trait]
impl DestinationStore for crate::services::Database {
    async fn update_tokens(&self, destination_id: Uuid, tokens: &TokenSet) -> Result<(), AppError> {
        self.update_destination_tokens(
            destination_id,
            &tokens.access_token,
            tokens.refresh_token.as_deref(),
            tokens.expires_at,
        )
        .await
    }

    async fn mark_expired(&self, destination_id: Uuid) -> Result<(), AppError> {
        self.set_destination_status(destination_id, crate::models::DestinationStatus::Expired)
            .await
    }
}

/// Splits a byte stream into provider-sized chunks. Keeps one chunk of
/// lookahead so the final chunk is known to be final when emitted.
pub struct Chunker {
    stream: ByteStream,
    chunk_size: usize,
    buffer: BytesMut,
    exhausted: bool,
    emitted_any: bool,
}

impl Chunker {
    pub fn new(stream: ByteStream, chunk_size: usize) -> Self {
        Self {
            stream,
            chunk_size,
            buffer: BytesMut::new(),
            exhausted: false,
            emitted_any: false,
        }
    }

    /// Discard bytes up to a resume offset before chunking continues.
    pub async fn skip_bytes(&mut self, mut n: u64) -> Result<(), AppError> {
        while n > 0 {
            if !self.buffer.is_empty() {
                let take = self.buffer.len().min(n as usize);
                self.buffer.advance(take);
                n -= take as u64;
                continue;
            }
            match self.stream.next().await {
                Some(Ok(bytes)) => self.buffer.extend_from_slice(&bytes),
                Some(Err(e)) => return Err(e),
                None => {
                    self.exhausted = true;
                    return Err(AppError::Transient(anyhow::anyhow!(
                        "Source ended {} bytes before resume offset",
                        n
                    )));
                }
            }
        }
        Ok(())
    }

    /// Next chunk and whether it is the last one. `None` after the
    /// final chunk has been emitted.
    pub async fn next_chunk(&mut self) -> Result<Option<(Bytes, bool)>, AppError> {
        while !self.exhausted && self.buffer.len() <= self.chunk_size {
            match self.stream.next().await {
                Some(Ok(bytes)) => self.buffer.extend_from_slice(&bytes),
                Some(Err(e)) => return Err(e),
                None => self.exhausted = true,
            }
        }

        if self.buffer.len() > self.chunk_size {
            let data = self.buffer.split_to(self.chunk_size).freeze();
            self.emitted_any = true;
            return Ok(Some((data, false)));
        }

        if self.buffer.is_empty() {
            if self.emitted_any {
                return Ok(None);
            }
            // Empty source still produces one empty final chunk so the
            // provider commit path runs.
            self.emitted_any = true;
            return Ok(Some((Bytes::new(), true)));
        }

        let data = self.buffer.split().freeze();
        self.emitted_any = true;
        Ok(Some((data, true)))
    }
}

/// In-memory arena of upload sessions, keyed by session id and swept
/// by TTL rather than relying on process lifetime for cleanup.
#[derive(Clone, Default)]
pub struct SessionArena {
    inner: Arc<DashMap<Uuid, UploadSession>>,
}

impl SessionArena {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
        }
    }

    pub fn insert(&self, session: UploadSession) -> Uuid {
        let id = session.session_id;
        self.inner.insert(id, session);
        id
    }

    pub fn get(&self, session_id: Uuid) -> Option<UploadSession> {
        self.inner.get(&session_id).map(|s| s.clone())
    }

    pub fn record_progress(&self, session_id: Uuid, bytes_uploaded: u64) {
        if let Some(mut session) = self.inner.get_mut(&session_id) {
            session.bytes_uploaded = bytes_uploaded;
            session.status = UploadStatus::Uploading;
        }
    }

    pub fn set_status(&self, session_id: Uuid, status: UploadStatus) {
        if let Some(mut session) = self.inner.get_mut(&session_id) {
            session.status = status;
        }
    }

    pub fn remove(&self, session_id: Uuid) {
        self.inner.remove(&session_id);
    }

    /// An incomplete, unexpired session for this destination and file,
    /// if one exists. Lets a retried delivery pick up where the last
    /// attempt stopped instead of starting over.
    pub fn find_resumable(
        &self,
        destination_id: Uuid,
        file_name: &str,
        now: DateTime<Utc>,
    ) -> Option<UploadSession> {
        self.inner
            .iter()
            .find(|s| {
                s.destination_id == destination_id
                    && s.file_name == file_name
                    && s.status != UploadStatus::Completed
                    && !s.is_expired(now)
            })
            .map(|s| s.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Drop expired and terminal-completed sessions. Returns how many
    /// were removed.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let before = self.inner.len();
        self.inner
            .retain(|_, s| !(s.is_expired(now) || s.status == UploadStatus::Completed));
        before - self.inner.len()
    }
}

/// Outcome of one delivery, surfaced to the queue handler.
#[derive(Debug)]
pub struct DeliveryReceipt {
    pub bytes_delivered: u64,
    pub session_id: Option<Uuid>,
}

pub struct StreamingDeliveryEngine {
    providers: HashMap<ProviderKind, Arc<dyn StorageProvider>>,
    sessions: SessionArena,
    store: Arc<dyn DestinationStore>,
    config: DeliveryConfig,
}

impl StreamingDeliveryEngine {
    pub fn new(
        providers: Vec<Arc<dyn StorageProvider>>,
        store: Arc<dyn DestinationStore>,
        config: DeliveryConfig,
    ) -> Self {
        let providers = providers.into_iter().map(|p| (p.kind(), p)).collect();
        Self {
            providers,
            sessions: SessionArena::new(),
            store,
            config,
        }
    }

    pub fn sessions(&self) -> &SessionArena {
        &self.sessions
    }

    fn provider_for(&self, destination: &Destination) -> Result<Arc<dyn StorageProvider>, AppError> {
        let kind = destination.provider_kind().ok_or_else(|| {
            AppError::BadRequest(anyhow::anyhow!(
                "Unknown provider '{}' on destination {}",
                destination.provider,
                destination.destination_id
            ))
        })?;
        self.providers.get(&kind).cloned().ok_or_else(|| {
            AppError::ConfigError(anyhow::anyhow!(
                "No adapter registered for provider {}",
                kind.as_str()
            ))
        })
    }

    /// Refresh the destination's tokens if they are inside the safety
    /// buffer. A refused refresh marks the destination expired; that is
    /// terminal until the user re-authorizes.
    async fn ensure_fresh_tokens(
        &self,
        provider: &Arc<dyn StorageProvider>,
        destination: &Destination,
    ) -> Result<Destination, AppError> {
        if !destination.token_needs_refresh(Utc::now(), self.config.token_safety_buffer_secs) {
            return Ok(destination.clone());
        }

        tracing::info!(
            destination_id = %destination.destination_id,
            provider = %destination.provider,
            "Access token inside safety buffer, refreshing"
        );

        match provider.refresh_tokens(destination).await {
            Ok(tokens) => {
                self.store
                    .update_tokens(destination.destination_id, &tokens)
                    .await?;
                let mut refreshed = destination.clone();
                refreshed.access_token = tokens.access_token;
                refreshed.token_expires_utc = tokens.expires_at;
                if tokens.refresh_token.is_some() {
                    refreshed.refresh_token = tokens.refresh_token;
                }
                Ok(refreshed)
            }
            Err(AppError::CredentialsExpired(_)) => {
                self.store.mark_expired(destination.destination_id).await?;
                Err(AppError::CredentialsExpired(
                    destination.destination_id.to_string(),
                ))
            }
            Err(e) => Err(e),
        }
    }

    /// Public entrypoint: refresh a destination's tokens proactively
    /// (used by the scheduled refresh sweep).
    pub async fn refresh_destination(&self, destination: &Destination) -> Result<(), AppError> {
        let provider = self.provider_for(destination)?;
        match provider.refresh_tokens(destination).await {
            Ok(tokens) => {
                self.store
                    .update_tokens(destination.destination_id, &tokens)
                    .await
            }
            Err(AppError::CredentialsExpired(_)) => {
                self.store.mark_expired(destination.destination_id).await?;
                Err(AppError::CredentialsExpired(
                    destination.destination_id.to_string(),
                ))
            }
            Err(e) => Err(e),
        }
    }

    /// Deliver a statement stream to one destination.
    pub async fn deliver(
        &self,
        destination: &Destination,
        file_name: &str,
        mime_type: &str,
        file_size: Option<u64>,
        source: ByteStream,
    ) -> Result<DeliveryReceipt, AppError> {
        let provider = self.provider_for(destination)?;
        let destination = self.ensure_fresh_tokens(&provider, destination).await?;

        let result = if self.config.direct_streaming {
            provider
                .upload_direct(&destination, file_name, mime_type, source, file_size)
                .await
                .map(|_| DeliveryReceipt {
                    bytes_delivered: file_size.unwrap_or(0),
                    session_id: None,
                })
        } else {
            let resume_session =
                self.sessions
                    .find_resumable(destination.destination_id, file_name, Utc::now());
            self.chunked_upload(
                &provider,
                &destination,
                file_name,
                mime_type,
                file_size,
                source,
                resume_session,
            )
            .await
        };

        let status = if result.is_ok() { "success" } else { "failure" };
        metrics::counter!(
            "deliveries_total",
            "provider" => destination.provider.clone(),
            "status" => status
        )
        .increment(1);

        result
    }

    /// Continue a previously interrupted chunked upload. The source is
    /// re-opened by the caller; bytes already uploaded are skipped.
    pub async fn resume(
        &self,
        destination: &Destination,
        session_id: Uuid,
        source: ByteStream,
    ) -> Result<DeliveryReceipt, AppError> {
        let session = self.sessions.get(session_id).ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("Upload session {} not found", session_id))
        })?;

        let provider = self.provider_for(destination)?;
        let destination = self.ensure_fresh_tokens(&provider, destination).await?;

        self.chunked_upload(
            &provider,
            &destination,
            &session.file_name.clone(),
            &session.mime_type.clone(),
            session.file_size,
            source,
            Some(session),
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn chunked_upload(
        &self,
        provider: &Arc<dyn StorageProvider>,
        destination: &Destination,
        file_name: &str,
        mime_type: &str,
        file_size: Option<u64>,
        source: ByteStream,
        resume_session: Option<UploadSession>,
    ) -> Result<DeliveryReceipt, AppError> {
        let (session, mut offset) = match resume_session {
            Some(session) => {
                let offset = session.bytes_uploaded;
                tracing::info!(
                    session_id = %session.session_id,
                    offset = offset,
                    "Resuming chunked upload"
                );
                (session, offset)
            }
            None => {
                let chunk_size = provider.chunk_size(file_size);
                let provider_session = provider
                    .create_upload_session(destination, file_name, mime_type, file_size)
                    .await?;
                let session = UploadSession::new(
                    destination.destination_id,
                    provider.kind(),
                    provider_session,
                    file_name.to_string(),
                    file_size,
                    mime_type.to_string(),
                    chunk_size,
                    self.config.session_ttl_secs,
                );
                self.sessions.insert(session.clone());
                (session, 0)
            }
        };

        let session_id = session.session_id;
        let mut chunker = Chunker::new(source, session.chunk_size);
        if offset > 0 {
            chunker.skip_bytes(offset).await?;
        }

        loop {
            let (data, is_last) = match chunker.next_chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => {
                    self.sessions.set_status(session_id, UploadStatus::Failed);
                    return Err(e);
                }
            };

            let chunk = Chunk {
                offset,
                data,
                total_size: file_size,
                is_last,
            };

            if let Err(e) = self
                .upload_chunk_with_retry(provider, destination, &session.provider_session, &chunk)
                .await
            {
                self.sessions.set_status(session_id, UploadStatus::Failed);
                return Err(e);
            }

            offset = chunk.end_offset();
            self.sessions.record_progress(session_id, offset);

            if is_last {
                break;
            }
        }

        provider
            .finalize_upload(destination, &session.provider_session, file_name, offset)
            .await?;

        self.sessions.set_status(session_id, UploadStatus::Completed);
        self.sessions.remove(session_id);

        metrics::histogram!("delivery_bytes").record(offset as f64);
        tracing::info!(
            destination_id = %destination.destination_id,
            file_name = %file_name,
            bytes = offset,
            "Chunked upload completed"
        );

        Ok(DeliveryReceipt {
            bytes_delivered: offset,
            session_id: Some(session_id),
        })
    }

    /// Sequential per-chunk retry: transient failures back off
    /// exponentially with jitter; permanent failures bail immediately.
    async fn upload_chunk_with_retry(
        &self,
        provider: &Arc<dyn StorageProvider>,
        destination: &Destination,
        provider_session: &str,
        chunk: &Chunk,
    ) -> Result<(), AppError> {
        let mut last_err = None;

        for attempt in 0..self.config.chunk_max_attempts {
            match provider
                .upload_chunk(destination, provider_session, chunk)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() => {
                    metrics::counter!("chunk_upload_retries_total").increment(1);
                    let backoff_ms = self.config.chunk_backoff_base_ms << attempt;
                    let jitter_ms = rand::thread_rng().gen_range(0..250);
                    tracing::warn!(
                        offset = chunk.offset,
                        attempt = attempt + 1,
                        backoff_ms = backoff_ms + jitter_ms,
                        error = %e,
                        "Chunk upload failed, backing off"
                    );
                    last_err = Some(e);
                    if attempt + 1 < self.config.chunk_max_attempts {
                        tokio::time::sleep(Duration::from_millis(backoff_ms + jitter_ms)).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| {
            AppError::DeliveryFailed(anyhow::anyhow!("Chunk upload exhausted retries"))
        }))
    }
}
