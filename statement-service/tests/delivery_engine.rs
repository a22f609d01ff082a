//! End-to-end tests for the streaming delivery engine against mock
//! storage providers.

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use pipeline_core::error::AppError;
use statement_service::config::DeliveryConfig;
use statement_service::delivery::providers::mock::{MockFailure, MockProvider};
use statement_service::delivery::providers::{StorageProvider, TokenSet};
use statement_service::delivery::{DestinationStore, StreamingDeliveryEngine};
use statement_service::models::{Destination, ProviderKind};
use statement_service::services::ByteStream;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Default)]
struct RecordingStore {
    token_updates: Mutex<Vec<(Uuid, String)>>,
    expired: Mutex<Vec<Uuid>>,
}

#[async_trait::async_trait]
impl DestinationStore for RecordingStore {
    async fn update_tokens(&self, destination_id: Uuid, tokens: &TokenSet) -> Result<(), AppError> {
        self.token_updates
            .lock()
            .unwrap()
            .push((destination_id, tokens.access_token.clone()));
        Ok(())
    }

    async fn mark_expired(&self, destination_id: Uuid) -> Result<(), AppError> {
        self.expired.lock().unwrap().push(destination_id);
        Ok(())
    }
}

fn test_config(direct: bool) -> DeliveryConfig {
    DeliveryConfig {
        direct_streaming: direct,
        chunk_max_attempts: 3,
        chunk_backoff_base_ms: 1,
        token_safety_buffer_secs: 300,
        session_ttl_secs: 3600,
        session_sweep_interval_secs: 600,
        webhook_max_attempts: 3,
        webhook_timeout_secs: 5,
    }
}

fn destination(kind: ProviderKind, token_expires_utc: Option<DateTime<Utc>>) -> Destination {
    Destination {
        destination_id: Uuid::new_v4(),
        provider: kind.as_str().to_string(),
        display_name: "Test destination".to_string(),
        folder_path: "/statements".to_string(),
        access_token: "access".to_string(),
        refresh_token: Some("refresh".to_string()),
        token_expires_utc,
        status: "active".to_string(),
        created_utc: Utc::now(),
        updated_utc: Utc::now(),
    }
}

fn body_stream(len: usize, piece: usize) -> ByteStream {
    let pieces: Vec<Result<Bytes, AppError>> = (0..len)
        .step_by(piece)
        .map(|start| {
            let end = (start + piece).min(len);
            Ok(Bytes::from(vec![0xAB; end - start]))
        })
        .collect();
    Box::pin(futures::stream::iter(pieces))
}

fn engine_with(
    provider: Arc<MockProvider>,
    store: Arc<RecordingStore>,
    direct: bool,
) -> StreamingDeliveryEngine {
    StreamingDeliveryEngine::new(vec![provider], store, test_config(direct))
}

#[tokio::test]
async fn chunked_upload_splits_and_finalizes() {
    let provider = Arc::new(MockProvider::new(
        ProviderKind::GoogleDrive,
        4096,
        MockFailure::None,
    ));
    let store = Arc::new(RecordingStore::default());
    let engine = engine_with(provider.clone(), store, false);
    let dest = destination(ProviderKind::GoogleDrive, None);

    let receipt = engine
        .deliver(
            &dest,
            "statement_2024-01-31.pdf",
            "application/pdf",
            Some(10240),
            body_stream(10240, 1000),
        )
        .await
        .unwrap();

    assert_eq!(receipt.bytes_delivered, 10240);

    let chunks = provider.accepted_chunks.lock().unwrap().clone();
    assert_eq!(
        chunks,
        vec![(0, 4096, false), (4096, 4096, false), (8192, 2048, true)]
    );
    assert_eq!(provider.finalized.lock().unwrap().len(), 1);
    // Completed sessions do not linger in the arena.
    assert!(engine.sessions().is_empty());
}

#[tokio::test]
async fn transient_chunk_failures_are_retried() {
    let provider = Arc::new(MockProvider::new(
        ProviderKind::GoogleDrive,
        4096,
        MockFailure::TransientChunks(2),
    ));
    let store = Arc::new(RecordingStore::default());
    let engine = engine_with(provider.clone(), store, false);
    let dest = destination(ProviderKind::GoogleDrive, None);

    let receipt = engine
        .deliver(
            &dest,
            "statement_2024-01-31.pdf",
            "application/pdf",
            Some(8192),
            body_stream(8192, 8192),
        )
        .await
        .unwrap();

    assert_eq!(receipt.bytes_delivered, 8192);
    assert_eq!(provider.accepted_bytes(), 8192);
}

#[tokio::test]
async fn permanent_chunk_failure_fails_the_delivery() {
    let provider = Arc::new(MockProvider::new(
        ProviderKind::Dropbox,
        4096,
        MockFailure::PermanentChunks,
    ));
    let store = Arc::new(RecordingStore::default());
    let engine = engine_with(provider.clone(), store, false);
    let dest = destination(ProviderKind::Dropbox, None);

    let err = engine
        .deliver(
            &dest,
            "statement_2024-01-31.pdf",
            "application/pdf",
            Some(4096),
            body_stream(4096, 4096),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::DeliveryFailed(_)));
    assert_eq!(provider.finalized.lock().unwrap().len(), 0);
    // Failed sessions stay in the arena until the TTL sweep.
    assert_eq!(engine.sessions().len(), 1);
}

#[tokio::test]
async fn expiring_token_is_refreshed_before_upload() {
    let provider = Arc::new(MockProvider::new(
        ProviderKind::GoogleDrive,
        4096,
        MockFailure::None,
    ));
    let store = Arc::new(RecordingStore::default());
    let engine = engine_with(provider.clone(), store.clone(), false);
    // Expires inside the 300s safety buffer.
    let dest = destination(
        ProviderKind::GoogleDrive,
        Some(Utc::now() + Duration::seconds(60)),
    );

    engine
        .deliver(
            &dest,
            "statement_2024-01-31.pdf",
            "application/pdf",
            Some(1024),
            body_stream(1024, 1024),
        )
        .await
        .unwrap();

    let updates = store.token_updates.lock().unwrap().clone();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].0, dest.destination_id);
    assert_eq!(updates[0].1, "mock-refreshed-token");
}

#[tokio::test]
async fn fresh_token_is_left_alone() {
    let provider = Arc::new(MockProvider::new(
        ProviderKind::GoogleDrive,
        4096,
        MockFailure::None,
    ));
    let store = Arc::new(RecordingStore::default());
    let engine = engine_with(provider, store.clone(), false);
    let dest = destination(
        ProviderKind::GoogleDrive,
        Some(Utc::now() + Duration::hours(2)),
    );

    engine
        .deliver(
            &dest,
            "statement_2024-01-31.pdf",
            "application/pdf",
            Some(1024),
            body_stream(1024, 1024),
        )
        .await
        .unwrap();

    assert!(store.token_updates.lock().unwrap().is_empty());
}

#[tokio::test]
async fn rejected_refresh_marks_destination_expired() {
    let provider = Arc::new(MockProvider::new(
        ProviderKind::Dropbox,
        4096,
        MockFailure::RefreshRejected,
    ));
    let store = Arc::new(RecordingStore::default());
    let engine = engine_with(provider, store.clone(), false);
    let dest = destination(ProviderKind::Dropbox, Some(Utc::now() + Duration::seconds(10)));

    let err = engine
        .deliver(
            &dest,
            "statement_2024-01-31.pdf",
            "application/pdf",
            Some(1024),
            body_stream(1024, 1024),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::CredentialsExpired(_)));
    assert_eq!(store.expired.lock().unwrap().as_slice(), &[dest.destination_id]);
}

#[tokio::test]
async fn direct_mode_streams_in_one_shot() {
    let provider = Arc::new(MockProvider::new(
        ProviderKind::GoogleDrive,
        4096,
        MockFailure::None,
    ));
    let store = Arc::new(RecordingStore::default());
    let engine = engine_with(provider.clone(), store, true);
    let dest = destination(ProviderKind::GoogleDrive, None);

    engine
        .deliver(
            &dest,
            "statement_2024-01-31.pdf",
            "application/pdf",
            Some(10240),
            body_stream(10240, 1000),
        )
        .await
        .unwrap();

    let uploads = provider.direct_uploads.lock().unwrap().clone();
    assert_eq!(uploads, vec![("statement_2024-01-31.pdf".to_string(), 10240)]);
    assert!(provider.accepted_chunks.lock().unwrap().is_empty());
}

#[tokio::test]
async fn one_failing_destination_does_not_affect_another() {
    let drive = Arc::new(MockProvider::new(
        ProviderKind::GoogleDrive,
        4096,
        MockFailure::PermanentChunks,
    ));
    let dropbox = Arc::new(MockProvider::new(
        ProviderKind::Dropbox,
        4096,
        MockFailure::None,
    ));
    let store = Arc::new(RecordingStore::default());
    let providers: Vec<Arc<dyn StorageProvider>> = vec![drive.clone(), dropbox.clone()];
    let engine = StreamingDeliveryEngine::new(providers, store, test_config(false));

    let drive_dest = destination(ProviderKind::GoogleDrive, None);
    let dropbox_dest = destination(ProviderKind::Dropbox, None);

    let drive_result = engine
        .deliver(
            &drive_dest,
            "statement_2024-01-31.pdf",
            "application/pdf",
            Some(4096),
            body_stream(4096, 4096),
        )
        .await;
    let dropbox_result = engine
        .deliver(
            &dropbox_dest,
            "statement_2024-01-31.pdf",
            "application/pdf",
            Some(4096),
            body_stream(4096, 4096),
        )
        .await;

    assert!(drive_result.is_err());
    assert!(dropbox_result.is_ok());
    assert_eq!(dropbox.accepted_bytes(), 4096);
}

#[tokio::test]
async fn retried_delivery_resumes_from_last_uploaded_chunk() {
    // First chunk lands, second chunk fails more times than one
    // delivery will retry. The retried delivery must pick up the open
    // session and continue at offset 4096 instead of resending chunk 0.
    let provider = Arc::new(MockProvider::new(
        ProviderKind::GoogleDrive,
        4096,
        MockFailure::TransientAtOffset {
            offset: 4096,
            times: 5,
        },
    ));
    let store = Arc::new(RecordingStore::default());
    let engine = engine_with(provider.clone(), store, false);
    let dest = destination(ProviderKind::GoogleDrive, None);

    let err = engine
        .deliver(
            &dest,
            "statement_2024-01-31.pdf",
            "application/pdf",
            Some(8192),
            body_stream(8192, 8192),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Transient(_)));
    assert_eq!(engine.sessions().len(), 1);

    let receipt = engine
        .deliver(
            &dest,
            "statement_2024-01-31.pdf",
            "application/pdf",
            Some(8192),
            body_stream(8192, 8192),
        )
        .await
        .unwrap();

    assert_eq!(receipt.bytes_delivered, 8192);
    let chunks = provider.accepted_chunks.lock().unwrap().clone();
    assert_eq!(chunks, vec![(0, 4096, false), (4096, 4096, true)]);
    assert_eq!(provider.finalized.lock().unwrap().len(), 1);
    assert!(engine.sessions().is_empty());
}

#[tokio::test]
async fn resuming_an_unknown_session_is_rejected() {
    let provider = Arc::new(MockProvider::new(
        ProviderKind::GoogleDrive,
        4096,
        MockFailure::None,
    ));
    let store = Arc::new(RecordingStore::default());
    let engine = engine_with(provider, store, false);
    let dest = destination(ProviderKind::GoogleDrive, None);

    let err = engine
        .resume(&dest, Uuid::new_v4(), body_stream(8192, 8192))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}
