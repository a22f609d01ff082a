//! pipeline-core: Shared infrastructure for the statement delivery pipeline.
pub mod config;
pub mod error;
pub mod middleware;
pub mod observability;
pub mod utils;

pub use anyhow;
pub use axum;
pub use serde;
pub use serde_json;
pub use tokio;
pub use tracing;
