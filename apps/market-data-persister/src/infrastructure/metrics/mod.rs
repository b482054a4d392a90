//! Prometheus Metrics Module
//!
//! Exposes pipeline metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Stages**: parse, persist, commit and total latency by data type and outcome
//! - **Ingest lag**: collection-to-receipt delay by data type
//! - **Deliveries**: processed, acked, nacked and dead-lettered counts
//! - **Retries**: local storage retries by data type
//! - **Pool**: active consumers, backlog and unacknowledged deliveries
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

mod recording;

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

pub use recording::{DeliveryCounts, FanoutMetricsSink, RecordingMetricsSink, StageTiming};

use crate::application::ports::{MetricsSink, Stage};
use crate::domain::lifecycle::{DeliveryAction, Outcome};

const STAGE_DURATION: &str = "market_data_persister_stage_duration_seconds";
const INGEST_LAG: &str = "market_data_persister_ingest_lag_seconds";
const PROCESSED: &str = "market_data_persister_messages_processed_total";
const ACKED: &str = "market_data_persister_messages_acked_total";
const NACKED: &str = "market_data_persister_messages_nacked_total";
const DEAD_LETTERED: &str = "market_data_persister_messages_dead_lettered_total";
const RETRIES: &str = "market_data_persister_retries_total";
const ACTIVE_CONSUMERS: &str = "market_data_persister_active_consumers";
const QUEUE_BACKLOG: &str = "market_data_persister_queue_backlog";
const QUEUE_UNACKED: &str = "market_data_persister_queue_unacked";

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metrics setup error.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// The Prometheus recorder could not be installed.
    #[error("failed to install Prometheus recorder")]
    Install(#[from] BuildError),
}

/// Initialize the Prometheus metrics recorder. Later calls return the
/// handle installed by the first.
///
/// # Errors
///
/// Returns [`MetricsError::Install`] if another global recorder is
/// already installed.
pub fn init_metrics() -> Result<PrometheusHandle, MetricsError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_histogram!(
        STAGE_DURATION,
        "Time spent in each pipeline stage by data type and outcome"
    );
    describe_histogram!(
        INGEST_LAG,
        "Delay between collection by the producer and receipt by the persister"
    );

    describe_counter!(PROCESSED, "Total deliveries processed");
    describe_counter!(ACKED, "Total deliveries acknowledged");
    describe_counter!(NACKED, "Total deliveries negatively acknowledged");
    describe_counter!(
        DEAD_LETTERED,
        "Total deliveries republished to the dead-letter exchange"
    );
    describe_counter!(RETRIES, "Total local storage retries");

    describe_gauge!(ACTIVE_CONSUMERS, "Number of running consumer workers");
    describe_gauge!(QUEUE_BACKLOG, "Messages waiting in the consumer queue");
    describe_gauge!(
        QUEUE_UNACKED,
        "Messages delivered but not yet acknowledged"
    );
}

// =============================================================================
// Prometheus Sink
// =============================================================================

/// [`MetricsSink`] writing to the global `metrics` recorder.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrometheusMetricsSink;

impl MetricsSink for PrometheusMetricsSink {
    fn record_stage(&self, stage: Stage, data_type: &str, outcome: Outcome, elapsed: Duration) {
        histogram!(
            STAGE_DURATION,
            "stage" => stage.as_str(),
            "data_type" => data_type.to_string(),
            "outcome" => outcome.as_str()
        )
        .record(elapsed.as_secs_f64());
    }

    fn record_ingest_lag(&self, data_type: &str, lag: Duration) {
        histogram!(INGEST_LAG, "data_type" => data_type.to_string()).record(lag.as_secs_f64());
    }

    fn record_delivery(&self, data_type: &str, outcome: Outcome, action: DeliveryAction) {
        let labels = [
            ("data_type", data_type.to_string()),
            ("outcome", outcome.as_str().to_string()),
        ];
        counter!(PROCESSED, &labels).increment(1);
        match action {
            DeliveryAction::Ack => counter!(ACKED, &labels).increment(1),
            DeliveryAction::DeadLetterThenAck => {
                counter!(DEAD_LETTERED, &labels).increment(1);
                counter!(ACKED, &labels).increment(1);
            }
            DeliveryAction::Nack { .. } => counter!(NACKED, &labels).increment(1),
        }
    }

    fn record_retry(&self, data_type: &str, _attempt: u32) {
        counter!(RETRIES, "data_type" => data_type.to_string()).increment(1);
    }
}

/// Update consumer pool gauges.
#[allow(clippy::cast_precision_loss)]
pub fn set_pool_state(active_consumers: usize, backlog: usize, unacked: usize) {
    gauge!(ACTIVE_CONSUMERS).set(active_consumers as f64);
    gauge!(QUEUE_BACKLOG).set(backlog as f64);
    gauge!(QUEUE_UNACKED).set(unacked as f64);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use metrics_exporter_prometheus::PrometheusBuilder;

    use super::*;

    #[test]
    fn sink_writes_labelled_series() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            let sink = PrometheusMetricsSink;
            sink.record_stage(
                Stage::Persist,
                "ticker",
                Outcome::Success,
                Duration::from_millis(3),
            );
            sink.record_delivery("orderbook", Outcome::Error, DeliveryAction::DeadLetterThenAck);
            sink.record_retry("trade", 1);
            set_pool_state(2, 10, 1);
        });

        let rendered = handle.render();
        assert!(rendered.contains(STAGE_DURATION));
        assert!(rendered.contains(r#"stage="persist""#));
        assert!(rendered.contains(DEAD_LETTERED));
        assert!(rendered.contains(r#"data_type="orderbook""#));
        assert!(rendered.contains(RETRIES));
        assert!(rendered.contains(QUEUE_BACKLOG));
    }
}
