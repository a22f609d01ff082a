//! Upstream banking data aggregator client.
//!
//! Access-token-scoped listing of statements for an account (paged,
//! filterable by date) and statement download as a byte stream.

use crate::config::AggregatorConfig;
use crate::models::UpstreamStatement;
use crate::services::ByteStream;
use async_trait::async_trait;
use chrono::NaiveDate;
use futures::TryStreamExt;
use pipeline_core::error::AppError;
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::Deserialize;
use std::time::Duration;

/// Upstream statement source, abstracted for testing.
#[async_trait]
pub trait StatementSource: Send + Sync {
    /// List all statements available for an account, following
    /// pagination to the end.
    async fn list_statements(
        &self,
        connection_id: &str,
        account_ref: &str,
        since: Option<NaiveDate>,
    ) -> Result<Vec<UpstreamStatement>, AppError>;

    /// Download one statement as a byte stream.
    async fn download_statement(
        &self,
        connection_id: &str,
        statement_id: &str,
    ) -> Result<(ByteStream, Option<u64>), AppError>;
}

#[derive(Debug, Deserialize)]
struct ListStatementsResponse {
    statements: Vec<UpstreamStatement>,
    #[serde(default)]
    next_cursor: Option<String>,
}

/// HTTP client for the aggregator API.
#[derive(Clone)]
pub struct AggregatorClient {
    client: Client,
    config: AggregatorConfig,
}

impl AggregatorClient {
    pub fn new(config: AggregatorConfig) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| AppError::InternalError(anyhow::anyhow!(e)))?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl StatementSource for AggregatorClient {
    async fn list_statements(
        &self,
        connection_id: &str,
        account_ref: &str,
        since: Option<NaiveDate>,
    ) -> Result<Vec<UpstreamStatement>, AppError> {
        let url = format!("{}/statements/list", self.config.base_url);
        let mut statements = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut body = serde_json::json!({
                "client_id": self.config.client_id,
                "secret": self.config.client_secret.expose_secret(),
                "connection_id": connection_id,
                "account_id": account_ref,
                "count": self.config.page_size,
            });
            if let Some(since) = since {
                body["start_date"] = serde_json::json!(since);
            }
            if let Some(ref cursor) = cursor {
                body["cursor"] = serde_json::json!(cursor);
            }

            let response = self
                .client
                .post(&url)
                .json(&body)
                .send()
                .await
                .map_err(|e| AppError::Transient(anyhow::anyhow!("Statement list failed: {}", e)))?;

            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                tracing::error!(status = %status, body = %text, "Aggregator list_statements error");
                return Err(classify_status(status, text));
            }

            let page: ListStatementsResponse = response
                .json()
                .await
                .map_err(|e| AppError::Transient(anyhow::anyhow!("Malformed list response: {}", e)))?;

            statements.extend(page.statements);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        tracing::debug!(
            connection_id = %connection_id,
            count = statements.len(),
            "Listed upstream statements"
        );

        Ok(statements)
    }

    async fn download_statement(
        &self,
        connection_id: &str,
        statement_id: &str,
    ) -> Result<(ByteStream, Option<u64>), AppError> {
        let url = format!("{}/statements/download", self.config.base_url);

        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "client_id": self.config.client_id,
                "secret": self.config.client_secret.expose_secret(),
                "connection_id": connection_id,
                "statement_id": statement_id,
            }))
            .send()
            .await
            .map_err(|e| AppError::Transient(anyhow::anyhow!("Statement download failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %text, "Aggregator download error");
            return Err(classify_status(status, text));
        }

        let size = response.content_length();
        let stream = response
            .bytes_stream()
            .map_err(|e| AppError::Transient(anyhow::anyhow!("Stream read failed: {}", e)));

        Ok((Box::pin(stream), size))
    }
}

fn classify_status(status: reqwest::StatusCode, body: String) -> AppError {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        AppError::RateLimited { retry_after: 60 }
    } else if status.is_client_error() {
        AppError::BadRequest(anyhow::anyhow!("Aggregator rejected request: {}", body))
    } else {
        AppError::Transient(anyhow::anyhow!("Aggregator error {}: {}", status, body))
    }
}

/// In-memory statement source used by tests and local development.
#[derive(Default)]
pub struct MockStatementSource {
    statements: Vec<UpstreamStatement>,
    file_body: Vec<u8>,
}

impl MockStatementSource {
    pub fn new(statements: Vec<UpstreamStatement>, file_body: Vec<u8>) -> Self {
        Self {
            statements,
            file_body,
        }
    }
}

#[async_trait]
impl StatementSource for MockStatementSource {
    async fn list_statements(
        &self,
        _connection_id: &str,
        _account_ref: &str,
        _since: Option<NaiveDate>,
    ) -> Result<Vec<UpstreamStatement>, AppError> {
        Ok(self.statements.clone())
    }

    async fn download_statement(
        &self,
        _connection_id: &str,
        _statement_id: &str,
    ) -> Result<(ByteStream, Option<u64>), AppError> {
        let body = bytes::Bytes::from(self.file_body.clone());
        let size = body.len() as u64;
        let stream = futures::stream::iter(vec![Ok(body)]);
        Ok((Box::pin(stream), Some(size)))
    }
}
