//! Metrics Port (Driven Port)
//!
//! Observability sink for per-delivery timings and counters.

use std::time::Duration;

use crate::domain::lifecycle::{DeliveryAction, Outcome};

/// Timed segment of a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Receipt until the data type is resolved.
    Parse,
    /// Mapping done until the final storage attempt returns.
    Persist,
    /// Storage done until the delivery is settled.
    Commit,
    /// Receipt until settlement.
    Total,
}

impl Stage {
    /// Every stage.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Parse, Self::Persist, Self::Commit, Self::Total]
    }

    /// Label value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Parse => "parse",
            Self::Persist => "persist",
            Self::Commit => "commit",
            Self::Total => "total",
        }
    }
}

/// Port for recording pipeline metrics.
///
/// Implementations must be cheap and must never fail the delivery.
pub trait MetricsSink: Send + Sync {
    /// Record the duration of one stage.
    fn record_stage(&self, stage: Stage, data_type: &str, outcome: Outcome, elapsed: Duration);

    /// Record the lag between collection and receipt.
    fn record_ingest_lag(&self, data_type: &str, lag: Duration);

    /// Record a settled delivery.
    fn record_delivery(&self, data_type: &str, outcome: Outcome, action: DeliveryAction);

    /// Record a storage retry (`attempt` is the attempt that failed).
    fn record_retry(&self, data_type: &str, attempt: u32);
}

/// Sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpMetricsSink;

impl MetricsSink for NoOpMetricsSink {
    fn record_stage(&self, _stage: Stage, _data_type: &str, _outcome: Outcome, _elapsed: Duration) {
    }

    fn record_ingest_lag(&self, _data_type: &str, _lag: Duration) {}

    fn record_delivery(&self, _data_type: &str, _outcome: Outcome, _action: DeliveryAction) {}

    fn record_retry(&self, _data_type: &str, _attempt: u32) {}
}
