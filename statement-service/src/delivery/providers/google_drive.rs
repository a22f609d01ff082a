//! Google Drive resumable-upload adapter.
//!
//! Drive's resumable protocol: an initiation POST returns a session
//! URI in the `Location` header; chunks are PUT against that URI with
//! `Content-Range` headers; HTTP 308 acknowledges an intermediate
//! chunk and 200/201 the final one. Drive finalizes implicitly on the
//! last range, so `finalize_upload` is a no-op.

use super::{classify_provider_status, Chunk, StorageProvider, TokenSet};
use crate::config::GoogleDriveConfig;
use crate::models::{Destination, ProviderKind};
use crate::services::ByteStream;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use pipeline_core::error::AppError;
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::Deserialize;

/// 8 MiB, a multiple of Drive's required 256 KiB granule.
const CHUNK_SIZE: usize = 8 * 1024 * 1024;
/// Files below this are sent in one 1 MiB chunk.
const SMALL_FILE_THRESHOLD: u64 = 4 * 1024 * 1024;
const SMALL_CHUNK_SIZE: usize = 1024 * 1024;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

pub struct GoogleDriveProvider {
    client: Client,
    config: GoogleDriveConfig,
}

impl GoogleDriveProvider {
    pub fn new(client: Client, config: GoogleDriveConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl StorageProvider for GoogleDriveProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::GoogleDrive
    }

    fn chunk_size(&self, file_size: Option<u64>) -> usize {
        match file_size {
            Some(size) if size <= SMALL_FILE_THRESHOLD => SMALL_CHUNK_SIZE,
            _ => CHUNK_SIZE,
        }
    }

    async fn create_upload_session(
        &self,
        destination: &Destination,
        file_name: &str,
        mime_type: &str,
        file_size: Option<u64>,
    ) -> Result<String, AppError> {
        let url = format!(
            "{}/files?uploadType=resumable",
            self.config.upload_base_url
        );

        let metadata = serde_json::json!({
            "name": file_name,
            "parents": [destination.folder_path],
        });

        let mut request = self
            .client
            .post(&url)
            .bearer_auth(&destination.access_token)
            .header("X-Upload-Content-Type", mime_type)
            .json(&metadata);
        if let Some(size) = file_size {
            request = request.header("X-Upload-Content-Length", size);
        }

        let response = request.send().await.map_err(|e| {
            AppError::Transient(anyhow::anyhow!("Drive session initiation failed: {}", e))
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_provider_status(self.kind(), status, body));
        }

        let session_uri = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .ok_or_else(|| {
                AppError::Transient(anyhow::anyhow!("Drive returned no resumable session URI"))
            })?;

        tracing::debug!(file_name = %file_name, "Drive resumable session created");
        Ok(session_uri)
    }

    async fn upload_chunk(
        &self,
        destination: &Destination,
        session: &str,
        chunk: &Chunk,
    ) -> Result<(), AppError> {
        let total = chunk
            .total_size
            .map(|t| t.to_string())
            .unwrap_or_else(|| "*".to_string());
        let content_range = if chunk.data.is_empty() {
            format!("bytes */{}", total)
        } else {
            format!(
                "bytes {}-{}/{}",
                chunk.offset,
                chunk.end_offset() - 1,
                total
            )
        };

        let response = self
            .client
            .put(session)
            .bearer_auth(&destination.access_token)
            .header(reqwest::header::CONTENT_RANGE, content_range)
            .body(chunk.data.clone())
            .send()
            .await
            .map_err(|e| AppError::Transient(anyhow::anyhow!("Drive chunk upload failed: {}", e)))?;

        let status = response.status();
        // 308 Resume Incomplete acknowledges an intermediate chunk.
        if status.as_u16() == 308 || status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_provider_status(self.kind(), status, body))
    }

    async fn finalize_upload(
        &self,
        _destination: &Destination,
        _session: &str,
        _file_name: &str,
        _total_bytes: u64,
    ) -> Result<(), AppError> {
        // Drive commits the file when the last Content-Range lands.
        Ok(())
    }

    async fn upload_direct(
        &self,
        destination: &Destination,
        file_name: &str,
        mime_type: &str,
        body: ByteStream,
        _file_size: Option<u64>,
    ) -> Result<(), AppError> {
        let url = format!("{}/files?uploadType=media", self.config.upload_base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&destination.access_token)
            .header(reqwest::header::CONTENT_TYPE, mime_type)
            .query(&[("name", file_name)])
            .body(reqwest::Body::wrap_stream(body))
            .send()
            .await
            .map_err(|e| AppError::Transient(anyhow::anyhow!("Drive direct upload failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(classify_provider_status(self.kind(), status, body))
        }
    }

    async fn validate_tokens(&self, destination: &Destination) -> Result<bool, AppError> {
        let response = self
            .client
            .get("https://www.googleapis.com/drive/v3/about")
            .query(&[("fields", "user")])
            .bearer_auth(&destination.access_token)
            .send()
            .await
            .map_err(|e| AppError::Transient(anyhow::anyhow!("Drive token probe failed: {}", e)))?;

        Ok(response.status().is_success())
    }

    async fn refresh_tokens(&self, destination: &Destination) -> Result<TokenSet, AppError> {
        let refresh_token = destination.refresh_token.as_deref().ok_or_else(|| {
            AppError::CredentialsExpired(destination.destination_id.to_string())
        })?;

        let response = self
            .client
            .post(&self.config.token_uri)
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.expose_secret()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| AppError::Transient(anyhow::anyhow!("Drive token refresh failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(
                destination_id = %destination.destination_id,
                status = %status,
                "Drive refused token refresh"
            );
            // Refresh rejection means the grant itself is dead.
            return Err(AppError::CredentialsExpired(
                destination.destination_id.to_string(),
            ));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| AppError::Transient(anyhow::anyhow!("Malformed token response: {}", e)))?;

        Ok(TokenSet {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_at: token.expires_in.map(|s| Utc::now() + Duration::seconds(s)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> GoogleDriveProvider {
        GoogleDriveProvider::new(
            Client::new(),
            GoogleDriveConfig {
                client_id: "id".to_string(),
                client_secret: secrecy::Secret::new("secret".to_string()),
                token_uri: "https://oauth2.googleapis.com/token".to_string(),
                upload_base_url: "https://www.googleapis.com/upload/drive/v3".to_string(),
            },
        )
    }

    #[test]
    fn large_files_use_full_chunk_size() {
        let p = provider();
        assert_eq!(p.chunk_size(Some(100 * 1024 * 1024)), CHUNK_SIZE);
        assert_eq!(p.chunk_size(None), CHUNK_SIZE);
    }

    #[test]
    fn small_files_use_small_chunk_size() {
        let p = provider();
        assert_eq!(p.chunk_size(Some(1024)), SMALL_CHUNK_SIZE);
    }
}
