//! Application startup and lifecycle management.

use crate::config::StatementConfig;
use crate::coordinator::AccountCoordinator;
use crate::delivery::providers::{DropboxProvider, GoogleDriveProvider, StorageProvider};
use crate::delivery::StreamingDeliveryEngine;
use crate::handlers;
use crate::pipeline::PipelineHandler;
use crate::queue::{Dispatcher, QueueHandler, QueueSender};
use crate::scheduler::Scheduler;
use crate::services::{init_metrics, AggregatorClient, Database, LearningService, RateLimiter};
use crate::webhook::WebhookDelivery;
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use pipeline_core::error::AppError;
use pipeline_core::middleware::{metrics_middleware, request_id_middleware};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// Shared application state for the HTTP surface.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<StatementConfig>,
    pub db: Database,
    pub queue: QueueSender,
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
    dispatcher: Dispatcher,
    handler: Arc<dyn QueueHandler>,
    scheduler: Scheduler,
    shutdown_token: CancellationToken,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: StatementConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build without running migrations; used in tests where the
    /// harness applies the schema itself.
    pub async fn build_without_migrations(config: StatementConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(
        config: StatementConfig,
        run_migrations: bool,
    ) -> Result<Self, AppError> {
        init_metrics();

        let db = Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        if run_migrations {
            db.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                e
            })?;
        }

        let shutdown_token = CancellationToken::new();
        let (dispatcher, queue) = Dispatcher::new(config.queue.clone(), shutdown_token.clone());

        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(|e| AppError::InternalError(anyhow::anyhow!(e)))?;

        let providers: Vec<Arc<dyn StorageProvider>> = vec![
            Arc::new(GoogleDriveProvider::new(
                http_client.clone(),
                config.google_drive.clone(),
            )),
            Arc::new(DropboxProvider::new(
                http_client.clone(),
                config.dropbox.clone(),
            )),
        ];

        let engine = Arc::new(StreamingDeliveryEngine::new(
            providers,
            Arc::new(db.clone()),
            config.delivery.clone(),
        ));

        let source = Arc::new(AggregatorClient::new(config.aggregator.clone())?);
        let rate_limiter = Arc::new(RateLimiter::new());
        let learning = Arc::new(LearningService::new(db.clone()));
        let webhooks = WebhookDelivery::new(
            config.delivery.webhook_timeout_secs,
            config.delivery.webhook_max_attempts,
        )?;

        let coordinator = Arc::new(AccountCoordinator::new(
            db.clone(),
            rate_limiter,
            config.rate_limit.clone(),
            learning.clone(),
            source.clone(),
            queue.clone(),
        ));

        let handler: Arc<dyn QueueHandler> = Arc::new(PipelineHandler::new(
            db.clone(),
            coordinator,
            engine.clone(),
            source,
            webhooks,
            queue.clone(),
        ));

        let scheduler = Scheduler::new(
            config.scheduler.clone(),
            config.delivery.clone(),
            db.clone(),
            learning,
            engine.sessions().clone(),
            queue.clone(),
            shutdown_token.clone(),
        );

        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(port = port, "Statement service listener bound");

        let state = AppState {
            config: Arc::new(config),
            db,
            queue,
        };

        Ok(Self {
            port,
            listener,
            state,
            dispatcher,
            handler,
            scheduler,
            shutdown_token,
        })
    }

    /// The port the HTTP listener is bound to.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn db(&self) -> &Database {
        &self.state.db
    }

    /// Run until the HTTP server exits, then stop the background loops.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let router = Router::new()
            .route("/health", get(handlers::health_check))
            .route("/ready", get(handlers::readiness_check))
            .route("/metrics", get(handlers::metrics_handler))
            .route("/webhooks/aggregator", post(handlers::aggregator_webhook))
            .layer(TraceLayer::new_for_http())
            .layer(middleware::from_fn(metrics_middleware))
            .layer(middleware::from_fn(request_id_middleware))
            .with_state(self.state);

        let dispatcher = tokio::spawn(self.dispatcher.run(self.handler));
        let scheduler = tokio::spawn(self.scheduler.run());

        tracing::info!(
            service = "statement-service",
            version = env!("CARGO_PKG_VERSION"),
            port = self.port,
            "Service ready to accept connections"
        );

        let result = axum::serve(self.listener, router).await;

        self.shutdown_token.cancel();
        let _ = dispatcher.await;
        let _ = scheduler.await;

        if let Err(e) = result {
            tracing::error!(error = %e, "HTTP server error");
            return Err(std::io::Error::other(format!("HTTP server error: {}", e)));
        }
        Ok(())
    }
}
