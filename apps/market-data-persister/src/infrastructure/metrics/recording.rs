//! In-process metrics aggregation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::application::ports::{MetricsSink, Stage};
use crate::domain::lifecycle::{DeliveryAction, Outcome};

/// Settlement counters for one `(data type, outcome)` pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryCounts {
    /// Deliveries processed.
    pub processed: u64,
    /// Deliveries acknowledged, dead-lettered ones included.
    pub acked: u64,
    /// Deliveries nacked.
    pub nacked: u64,
    /// Deliveries republished to the dead-letter exchange.
    pub dead_lettered: u64,
}

/// Count and extremes of a timed segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageTiming {
    /// Samples recorded.
    pub count: u64,
    /// Sum of samples.
    pub total: Duration,
    /// Largest sample.
    pub max: Duration,
}

impl StageTiming {
    fn record(&mut self, elapsed: Duration) {
        self.count += 1;
        self.total += elapsed;
        self.max = self.max.max(elapsed);
    }
}

#[derive(Debug, Default)]
struct Recorded {
    deliveries: HashMap<(String, Outcome), DeliveryCounts>,
    stages: HashMap<(Stage, String, Outcome), StageTiming>,
    ingest_lag: HashMap<String, StageTiming>,
    retries: HashMap<String, u64>,
}

/// [`MetricsSink`] that aggregates in memory, for `/health` and tests.
#[derive(Debug, Default)]
pub struct RecordingMetricsSink {
    recorded: Mutex<Recorded>,
}

impl RecordingMetricsSink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters for one data type and outcome.
    #[must_use]
    pub fn deliveries(&self, data_type: &str, outcome: Outcome) -> DeliveryCounts {
        self.recorded
            .lock()
            .deliveries
            .get(&(data_type.to_string(), outcome))
            .copied()
            .unwrap_or_default()
    }

    /// Deliveries processed with `outcome`, across data types.
    #[must_use]
    pub fn outcome_total(&self, outcome: Outcome) -> u64 {
        self.recorded
            .lock()
            .deliveries
            .iter()
            .filter(|((_, o), _)| *o == outcome)
            .map(|(_, counts)| counts.processed)
            .sum()
    }

    /// Processed count per outcome label, every outcome present.
    #[must_use]
    pub fn outcome_totals(&self) -> BTreeMap<&'static str, u64> {
        Outcome::all()
            .iter()
            .map(|outcome| (outcome.as_str(), self.outcome_total(*outcome)))
            .collect()
    }

    /// Totals across every data type and outcome.
    #[must_use]
    pub fn totals(&self) -> DeliveryCounts {
        self.recorded
            .lock()
            .deliveries
            .values()
            .fold(DeliveryCounts::default(), |acc, c| DeliveryCounts {
                processed: acc.processed + c.processed,
                acked: acc.acked + c.acked,
                nacked: acc.nacked + c.nacked,
                dead_lettered: acc.dead_lettered + c.dead_lettered,
            })
    }

    /// Timing of one stage for a data type and outcome.
    #[must_use]
    pub fn stage(&self, stage: Stage, data_type: &str, outcome: Outcome) -> StageTiming {
        self.recorded
            .lock()
            .stages
            .get(&(stage, data_type.to_string(), outcome))
            .copied()
            .unwrap_or_default()
    }

    /// Ingest lag samples for a data type.
    #[must_use]
    pub fn ingest_lag(&self, data_type: &str) -> StageTiming {
        self.recorded
            .lock()
            .ingest_lag
            .get(data_type)
            .copied()
            .unwrap_or_default()
    }

    /// Local retries for a data type.
    #[must_use]
    pub fn retries(&self, data_type: &str) -> u64 {
        self.recorded
            .lock()
            .retries
            .get(data_type)
            .copied()
            .unwrap_or(0)
    }
}

impl MetricsSink for RecordingMetricsSink {
    fn record_stage(&self, stage: Stage, data_type: &str, outcome: Outcome, elapsed: Duration) {
        self.recorded
            .lock()
            .stages
            .entry((stage, data_type.to_string(), outcome))
            .or_default()
            .record(elapsed);
    }

    fn record_ingest_lag(&self, data_type: &str, lag: Duration) {
        self.recorded
            .lock()
            .ingest_lag
            .entry(data_type.to_string())
            .or_default()
            .record(lag);
    }

    fn record_delivery(&self, data_type: &str, outcome: Outcome, action: DeliveryAction) {
        let mut recorded = self.recorded.lock();
        let counts = recorded
            .deliveries
            .entry((data_type.to_string(), outcome))
            .or_default();
        counts.processed += 1;
        match action {
            DeliveryAction::Ack => counts.acked += 1,
            DeliveryAction::DeadLetterThenAck => {
                counts.acked += 1;
                counts.dead_lettered += 1;
            }
            DeliveryAction::Nack { .. } => counts.nacked += 1,
        }
    }

    fn record_retry(&self, data_type: &str, _attempt: u32) {
        *self
            .recorded
            .lock()
            .retries
            .entry(data_type.to_string())
            .or_default() += 1;
    }
}

/// Forwards every call to each inner sink.
#[derive(Clone, Default)]
pub struct FanoutMetricsSink {
    sinks: Vec<Arc<dyn MetricsSink>>,
}

impl std::fmt::Debug for FanoutMetricsSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutMetricsSink")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl FanoutMetricsSink {
    /// Create an empty fan-out.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink.
    #[must_use]
    pub fn with(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl MetricsSink for FanoutMetricsSink {
    fn record_stage(&self, stage: Stage, data_type: &str, outcome: Outcome, elapsed: Duration) {
        for sink in &self.sinks {
            sink.record_stage(stage, data_type, outcome, elapsed);
        }
    }

    fn record_ingest_lag(&self, data_type: &str, lag: Duration) {
        for sink in &self.sinks {
            sink.record_ingest_lag(data_type, lag);
        }
    }

    fn record_delivery(&self, data_type: &str, outcome: Outcome, action: DeliveryAction) {
        for sink in &self.sinks {
            sink.record_delivery(data_type, outcome, action);
        }
    }

    fn record_retry(&self, data_type: &str, attempt: u32) {
        for sink in &self.sinks {
            sink.record_retry(data_type, attempt);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dead_letter_counts_as_ack() {
        let sink = RecordingMetricsSink::new();
        sink.record_delivery("orderbook", Outcome::Error, DeliveryAction::DeadLetterThenAck);
        sink.record_delivery("orderbook", Outcome::Error, DeliveryAction::Nack { requeue: true });

        let counts = sink.deliveries("orderbook", Outcome::Error);
        assert_eq!(counts.processed, 2);
        assert_eq!(counts.acked, 1);
        assert_eq!(counts.dead_lettered, 1);
        assert_eq!(counts.nacked, 1);
    }

    #[test]
    fn outcome_totals_list_every_outcome() {
        let sink = RecordingMetricsSink::new();
        sink.record_delivery("ticker", Outcome::Success, DeliveryAction::Ack);
        sink.record_delivery("trade", Outcome::Success, DeliveryAction::Ack);
        sink.record_delivery("unknown", Outcome::MissingType, DeliveryAction::Ack);

        let totals = sink.outcome_totals();
        assert_eq!(totals["success"], 2);
        assert_eq!(totals["missing_type"], 1);
        assert_eq!(totals["duplicate"], 0);
        assert_eq!(totals.len(), Outcome::all().len());
    }

    #[test]
    fn stage_timing_tracks_max() {
        let sink = RecordingMetricsSink::new();
        for ms in [3, 9, 1] {
            sink.record_stage(
                Stage::Parse,
                "ticker",
                Outcome::Success,
                Duration::from_millis(ms),
            );
        }
        let timing = sink.stage(Stage::Parse, "ticker", Outcome::Success);
        assert_eq!(timing.count, 3);
        assert_eq!(timing.max, Duration::from_millis(9));
        assert_eq!(timing.total, Duration::from_millis(13));
    }

    #[test]
    fn fanout_reaches_every_sink() {
        let a = Arc::new(RecordingMetricsSink::new());
        let b = Arc::new(RecordingMetricsSink::new());
        let fanout = FanoutMetricsSink::new()
            .with(Arc::clone(&a) as Arc<dyn MetricsSink>)
            .with(Arc::clone(&b) as Arc<dyn MetricsSink>);

        fanout.record_retry("trade", 1);

        assert_eq!(a.retries("trade"), 1);
        assert_eq!(b.retries("trade"), 1);
    }
}
