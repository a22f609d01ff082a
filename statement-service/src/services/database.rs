//! Database service: the statement ledger.
//!
//! All persistent state the pipeline relies on lives here: accounts,
//! discovered statements, availability samples, destinations, delivery
//! attempts, and webhook endpoints.

use crate::models::{
    Account, DeliveryAttempt, DeliveryStatus, Destination, DestinationStatus, StatementRecord,
    UpstreamStatement, WebhookEndpoint,
};
use chrono::{DateTime, Utc};
use pipeline_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "statement-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    // =========================================================================
    // Account operations
    // =========================================================================

    pub async fn get_account(&self, account_id: Uuid) -> Result<Account, AppError> {
        sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE account_id = $1")
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Account {} not found", account_id)))
    }

    pub async fn list_active_accounts(&self) -> Result<Vec<Account>, AppError> {
        let accounts = sqlx::query_as::<_, Account>(
            "SELECT * FROM accounts WHERE status = 'active' ORDER BY connected_utc",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(accounts)
    }

    pub async fn update_last_poll(
        &self,
        account_id: Uuid,
        polled_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query("UPDATE accounts SET last_poll_utc = $2, updated_utc = now() WHERE account_id = $1")
            .bind(account_id)
            .bind(polled_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_learned_schedule(
        &self,
        account_id: Uuid,
        schedule: &serde_json::Value,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE accounts SET learned_schedule = $2, updated_utc = now() WHERE account_id = $1",
        )
        .bind(account_id)
        .bind(schedule)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // =========================================================================
    // Statement operations
    // =========================================================================

    /// Idempotent statement upsert keyed by (account_id, period_end,
    /// file_type). A first sighting inserts with version 1; any later
    /// sighting of the same key bumps the version in place, so two
    /// concurrent discoveries can never produce duplicate rows.
    #[instrument(skip(self, upstream), fields(account_id = %account_id, period_end = %upstream.period_end))]
    pub async fn upsert_statement(
        &self,
        account_id: Uuid,
        upstream: &UpstreamStatement,
    ) -> Result<StatementRecord, AppError> {
        let record = sqlx::query_as::<_, StatementRecord>(
            r#"
            INSERT INTO statements (statement_id, account_id, upstream_ref, period_start, period_end, statement_date, file_type, checksum)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (account_id, period_end, file_type)
            DO UPDATE SET version = statements.version + 1, upstream_ref = EXCLUDED.upstream_ref, updated_utc = now()
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(account_id)
        .bind(&upstream.statement_id)
        .bind(upstream.period_start)
        .bind(upstream.period_end)
        .bind(upstream.statement_date)
        .bind(&upstream.file_type)
        .bind(&upstream.checksum)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    pub async fn get_statement(&self, statement_id: Uuid) -> Result<StatementRecord, AppError> {
        sqlx::query_as::<_, StatementRecord>("SELECT * FROM statements WHERE statement_id = $1")
            .bind(statement_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!("Statement {} not found", statement_id))
            })
    }

    // =========================================================================
    // Availability samples
    // =========================================================================

    /// Record one availability observation per account cycle. Safe to
    /// call repeatedly: a duplicate (account, year, month) keeps the
    /// earliest observation.
    pub async fn upsert_availability_sample(
        &self,
        account_id: Uuid,
        institution_id: &str,
        year: i32,
        month: u32,
        observed: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO availability_samples (account_id, institution_id, year, month, observed_utc)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (account_id, year, month) DO NOTHING
            "#,
        )
        .bind(account_id)
        .bind(institution_id)
        .bind(year)
        .bind(month as i32)
        .bind(observed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_availability_samples(
        &self,
        account_id: Uuid,
    ) -> Result<Vec<DateTime<Utc>>, AppError> {
        let rows: Vec<(DateTime<Utc>,)> = sqlx::query_as(
            "SELECT observed_utc FROM availability_samples WHERE account_id = $1 ORDER BY observed_utc",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(t,)| t).collect())
    }

    // =========================================================================
    // Destination operations
    // =========================================================================

    pub async fn get_destination(&self, destination_id: Uuid) -> Result<Destination, AppError> {
        sqlx::query_as::<_, Destination>("SELECT * FROM destinations WHERE destination_id = $1")
            .bind(destination_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!("Destination {} not found", destination_id))
            })
    }

    /// Active destinations routed to an account.
    pub async fn destinations_for_account(
        &self,
        account_id: Uuid,
    ) -> Result<Vec<Destination>, AppError> {
        let destinations = sqlx::query_as::<_, Destination>(
            r#"
            SELECT d.* FROM destinations d
            JOIN account_destinations ad ON ad.destination_id = d.destination_id
            WHERE ad.account_id = $1 AND d.status = 'active'
            ORDER BY d.created_utc
            "#,
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(destinations)
    }

    /// Destinations whose access token expires within the lookahead
    /// window, picked up by the token-refresh sweep.
    pub async fn destinations_expiring_within(
        &self,
        lookahead_secs: i64,
    ) -> Result<Vec<Destination>, AppError> {
        let destinations = sqlx::query_as::<_, Destination>(
            r#"
            SELECT * FROM destinations
            WHERE status = 'active'
              AND token_expires_utc IS NOT NULL
              AND token_expires_utc <= now() + ($1 * interval '1 second')
            "#,
        )
        .bind(lookahead_secs)
        .fetch_all(&self.pool)
        .await?;
        Ok(destinations)
    }

    pub async fn update_destination_tokens(
        &self,
        destination_id: Uuid,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE destinations
            SET access_token = $2,
                refresh_token = COALESCE($3, refresh_token),
                token_expires_utc = $4,
                updated_utc = now()
            WHERE destination_id = $1
            "#,
        )
        .bind(destination_id)
        .bind(access_token)
        .bind(refresh_token)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_destination_status(
        &self,
        destination_id: Uuid,
        status: DestinationStatus,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE destinations SET status = $2, updated_utc = now() WHERE destination_id = $1",
        )
        .bind(destination_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // =========================================================================
    // Delivery attempts
    // =========================================================================

    /// Create the (statement, destination) delivery row if it does not
    /// exist yet. The request_id is the idempotency key for the queue
    /// job; an existing row keeps its original request_id.
    pub async fn ensure_delivery_attempt(
        &self,
        statement_id: Uuid,
        destination_id: Uuid,
        request_id: Uuid,
    ) -> Result<DeliveryAttempt, AppError> {
        let attempt = sqlx::query_as::<_, DeliveryAttempt>(
            r#"
            INSERT INTO delivery_attempts (attempt_id, statement_id, destination_id, request_id)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (statement_id, destination_id) DO UPDATE SET updated_utc = now()
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(statement_id)
        .bind(destination_id)
        .bind(request_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(attempt)
    }

    pub async fn record_delivery_result(
        &self,
        statement_id: Uuid,
        destination_id: Uuid,
        status: DeliveryStatus,
        last_error: Option<&str>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE delivery_attempts
            SET status = $3,
                attempts = attempts + 1,
                last_error = $4,
                updated_utc = now()
            WHERE statement_id = $1 AND destination_id = $2
            "#,
        )
        .bind(statement_id)
        .bind(destination_id)
        .bind(status.as_str())
        .bind(last_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // =========================================================================
    // Webhook endpoints
    // =========================================================================

    pub async fn list_active_webhook_endpoints(&self) -> Result<Vec<WebhookEndpoint>, AppError> {
        let endpoints = sqlx::query_as::<_, WebhookEndpoint>(
            "SELECT * FROM webhook_endpoints WHERE is_active = TRUE",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(endpoints)
    }
}
