//! Dropbox upload-session adapter.
//!
//! Dropbox sessions are explicit: `upload_session/start` opens one,
//! `append_v2` adds bytes at a cursor offset, and the file only exists
//! after an `upload_session/finish` commit. Unlike Drive there is no
//! implicit finalization, which is why the uniform interface makes the
//! engine call `finalize_upload` unconditionally.

use super::{classify_provider_status, Chunk, StorageProvider, TokenSet};
use crate::config::DropboxConfig;
use crate::models::{Destination, ProviderKind};
use crate::services::ByteStream;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use pipeline_core::error::AppError;
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::Deserialize;

/// Dropbox requires intermediate chunks to be a multiple of 4 MiB.
const CHUNK_SIZE: usize = 4 * 1024 * 1024;
/// Below this, one small chunk carries the whole file.
const SMALL_FILE_THRESHOLD: u64 = 2 * 1024 * 1024;
const SMALL_CHUNK_SIZE: usize = 512 * 1024;

#[derive(Debug, Deserialize)]
struct StartSessionResponse {
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

pub struct DropboxProvider {
    client: Client,
    config: DropboxConfig,
}

impl DropboxProvider {
    pub fn new(client: Client, config: DropboxConfig) -> Self {
        Self { client, config }
    }

    fn target_path(destination: &Destination, file_name: &str) -> String {
        let folder = destination.folder_path.trim_end_matches('/');
        format!("{}/{}", folder, file_name)
    }
}

#[async_trait]
impl StorageProvider for DropboxProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Dropbox
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
        _file_name: &str,
        _mime_type: &str,
        _file_size: Option<u64>,
    ) -> Result<String, AppError> {
        let url = format!("{}/files/upload_session/start", self.config.content_base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&destination.access_token)
            .header("Dropbox-API-Arg", r#"{"close":false}"#)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(Vec::new())
            .send()
            .await
            .map_err(|e| {
                AppError::Transient(anyhow::anyhow!("Dropbox session start failed: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_provider_status(self.kind(), status, body));
        }

        let session: StartSessionResponse = response
            .json()
            .await
            .map_err(|e| AppError::Transient(anyhow::anyhow!("Malformed session response: {}", e)))?;

        Ok(session.session_id)
    }

    async fn upload_chunk(
        &self,
        destination: &Destination,
        session: &str,
        chunk: &Chunk,
    ) -> Result<(), AppError> {
        let url = format!(
            "{}/files/upload_session/append_v2",
            self.config.content_base_url
        );

        let arg = serde_json::json!({
            "cursor": { "session_id": session, "offset": chunk.offset },
            "close": false,
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&destination.access_token)
            .header("Dropbox-API-Arg", arg.to_string())
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(chunk.data.clone())
            .send()
            .await
            .map_err(|e| AppError::Transient(anyhow::anyhow!("Dropbox append failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(classify_provider_status(self.kind(), status, body))
        }
    }

    async fn finalize_upload(
        &self,
        destination: &Destination,
        session: &str,
        file_name: &str,
        total_bytes: u64,
    ) -> Result<(), AppError> {
        let url = format!("{}/files/upload_session/finish", self.config.content_base_url);

        let arg = serde_json::json!({
            "cursor": { "session_id": session, "offset": total_bytes },
            "commit": {
                "path": Self::target_path(destination, file_name),
                "mode": "add",
                "autorename": true,
                "mute": true,
            },
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&destination.access_token)
            .header("Dropbox-API-Arg", arg.to_string())
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(Vec::new())
            .send()
            .await
            .map_err(|e| AppError::Transient(anyhow::anyhow!("Dropbox finish failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            tracing::debug!(file_name = %file_name, "Dropbox upload committed");
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(classify_provider_status(self.kind(), status, body))
        }
    }

    async fn upload_direct(
        &self,
        destination: &Destination,
        file_name: &str,
        _mime_type: &str,
        body: ByteStream,
        _file_size: Option<u64>,
    ) -> Result<(), AppError> {
        let url = format!("{}/files/upload", self.config.content_base_url);

        let arg = serde_json::json!({
            "path": Self::target_path(destination, file_name),
            "mode": "add",
            "autorename": true,
            "mute": true,
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&destination.access_token)
            .header("Dropbox-API-Arg", arg.to_string())
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(reqwest::Body::wrap_stream(body))
            .send()
            .await
            .map_err(|e| {
                AppError::Transient(anyhow::anyhow!("Dropbox direct upload failed: {}", e))
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(classify_provider_status(self.kind(), status, body))
        }
    }

    async fn validate_tokens(&self, destination: &Destination) -> Result<bool, AppError> {
        let url = format!("{}/users/get_current_account", self.config.api_base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&destination.access_token)
            .send()
            .await
            .map_err(|e| AppError::Transient(anyhow::anyhow!("Dropbox token probe failed: {}", e)))?;

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
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", self.config.app_key.as_str()),
                ("client_secret", self.config.app_secret.expose_secret()),
            ])
            .send()
            .await
            .map_err(|e| {
                AppError::Transient(anyhow::anyhow!("Dropbox token refresh failed: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(
                destination_id = %destination.destination_id,
                status = %status,
                "Dropbox refused token refresh"
            );
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
