pub mod aggregator;
pub mod database;
pub mod learning;
pub mod metrics;
pub mod rate_limiter;

pub use aggregator::{AggregatorClient, MockStatementSource, StatementSource};
pub use database::Database;
pub use learning::{CheckFrequency, LearningService, Prediction};
pub use metrics::{get_metrics, init_metrics};
pub use rate_limiter::{RateLimitDecision, RateLimiter};

use bytes::Bytes;
use futures::Stream;
use pipeline_core::error::AppError;
use std::pin::Pin;

/// Stream of file bytes moving through the pipeline. Statements are
/// never buffered whole; both download and upload operate on this.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, AppError>> + Send>>;
