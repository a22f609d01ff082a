//! Prometheus metrics for the retrieval and delivery pipeline.
//!
//! Installs the recorder once at startup, registers the pipeline's
//! metric families with descriptions, and renders the /metrics
//! endpoint body.

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Deliveries range from kilobyte CSVs to multi-hundred-megabyte PDFs;
/// the exporter's default buckets top out far too low for them.
const DELIVERY_BYTES_BUCKETS: &[f64] = &[
    16_384.0,
    131_072.0,
    1_048_576.0,
    8_388_608.0,
    67_108_864.0,
    268_435_456.0,
];

const DURATION_SECONDS_BUCKETS: &[f64] = &[0.05, 0.25, 1.0, 5.0, 15.0, 60.0, 300.0];

/// Initialize the metrics recorder.
///
/// Must be called once at startup before any metrics are recorded.
/// Panics if called more than once.
pub fn init_metrics() {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("delivery_bytes".to_string()),
            DELIVERY_BYTES_BUCKETS,
        )
        .expect("delivery_bytes buckets must be non-empty")
        .set_buckets_for_metric(
            Matcher::Suffix("_duration_seconds".to_string()),
            DURATION_SECONDS_BUCKETS,
        )
        .expect("duration buckets must be non-empty")
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    if METRICS_HANDLE.set(handle).is_err() {
        panic!("failed to set metrics handle: already initialized");
    }

    describe_pipeline_metrics();
}

/// One description per metric family the pipeline emits, so the
/// exposition carries HELP lines instead of bare names.
fn describe_pipeline_metrics() {
    describe_counter!("retrievals_total", "Completed statement checks by status");
    describe_counter!(
        "retrievals_skipped_total",
        "Statement checks skipped because one was already in flight or the account was throttled"
    );
    describe_histogram!(
        "retrieval_duration_seconds",
        Unit::Seconds,
        "Wall time of one statement check"
    );

    describe_counter!(
        "deliveries_total",
        "Statement deliveries by provider and outcome"
    );
    describe_counter!(
        "chunk_upload_retries_total",
        "Chunk uploads retried after a transient provider failure"
    );
    describe_histogram!(
        "delivery_bytes",
        Unit::Bytes,
        "Bytes transferred per completed delivery"
    );

    describe_counter!(
        "queue_enqueued_total",
        "Items accepted onto the work queue by type"
    );
    describe_counter!(
        "queue_items_processed_total",
        "Queue items finished by type and outcome"
    );
    describe_counter!(
        "queue_unknown_items_total",
        "Raw payloads dropped because the item type was not recognized"
    );
    describe_histogram!(
        "queue_item_duration_seconds",
        Unit::Seconds,
        "Handler time per queue item"
    );

    describe_counter!("rate_limit_denied_total", "Rate limiter rejections");
    describe_counter!(
        "webhook_deliveries_total",
        "Outbound webhook posts by outcome"
    );
    describe_gauge!(
        "scheduler_due_accounts",
        "Accounts due for a statement check at the last scheduler tick"
    );
}

/// Current metrics in Prometheus text format for the /metrics endpoint.
pub fn get_metrics() -> String {
    METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_else(|| "# Metrics recorder not initialized".to_string())
}
