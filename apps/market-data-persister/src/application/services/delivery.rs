//! Delivery Controller
//!
//! Runs one broker delivery through decode, routing, mapping and storage,
//! then settles it with the broker. Every delivery handed to
//! [`DeliveryController::handle`] is settled exactly once and no error
//! escapes: a poisoned message never takes its worker down.
//!
//! # Settlement
//!
//! | Result | Broker action |
//! |--------|---------------|
//! | Stored, duplicate, dropped | ack |
//! | Fatal failure | publish to dead-letter exchange, then ack |
//! | Dead-letter publish failed | nack with requeue |
//! | Fatal failure, legacy mode | nack with the configured requeue flag |

use std::collections::BTreeMap;
use std::error::Error;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use super::classification::{ClassificationTable, Disposition, ErrorClass, ProcessingError, classify};
use super::retry::{ExponentialBackoff, RetryPolicy};
use crate::application::decoder::decode;
use crate::application::ports::{
    Delivery, DeliveryChannel, DeliveryTag, MarketDataRepository, MetricsSink, OutboundMessage,
    Stage,
};
use crate::application::router::{Route, extract_payload, route};
use crate::domain::lifecycle::{DeliveryAction, MessageLifecycle, MessageState, Outcome};
use crate::domain::message::{DataType, Metadata};
use crate::domain::record::{MarketRecord, PersistReceipt};
use crate::domain::validation::map_record;

/// Metric label for deliveries whose data type is not known.
pub const UNKNOWN_DATA_TYPE: &str = "unknown";

/// Dead-letter header: rendered error chain.
pub const HEADER_EXCEPTION_MESSAGE: &str = "x-exception-message";
/// Dead-letter header: error class.
pub const HEADER_ERROR_CLASS: &str = "x-error-class";
/// Dead-letter header: exchange of the original delivery.
pub const HEADER_ORIGINAL_EXCHANGE: &str = "x-original-exchange";
/// Dead-letter header: routing key of the original delivery.
pub const HEADER_ORIGINAL_ROUTING_KEY: &str = "x-original-routing-key";
/// Dead-letter header: local attempts made before giving up.
pub const HEADER_DELIVERY_ATTEMPTS: &str = "x-delivery-attempts";

// =============================================================================
// Configuration
// =============================================================================

/// Where fatal failures go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureMode {
    /// Republish to a dead-letter exchange, then ack.
    DeadLetter {
        /// Dead-letter exchange.
        exchange: String,
        /// Fixed routing key.
        routing_key: String,
    },
    /// Nack the delivery instead of dead-lettering.
    Nack {
        /// Whether the broker should requeue the message.
        requeue: bool,
    },
}

// =============================================================================
// Report
// =============================================================================

/// Result of handling one delivery.
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    /// Delivery tag.
    pub tag: DeliveryTag,
    /// Producer message id, when present.
    pub message_id: Option<String>,
    /// Resolved data type, if routing got that far.
    pub data_type: Option<DataType>,
    /// Business outcome.
    pub outcome: Outcome,
    /// Broker action taken.
    pub action: DeliveryAction,
    /// Storage attempts made.
    pub attempts: u32,
    /// Class of the failure that decided the action, if any.
    pub error_class: Option<ErrorClass>,
    /// Storage receipt for a newly inserted record.
    pub receipt: Option<PersistReceipt>,
    /// Whether the broker accepted the settlement.
    pub settled: bool,
    /// States visited.
    pub history: Vec<MessageState>,
}

impl DeliveryReport {
    /// Terminal state of the delivery.
    #[must_use]
    pub fn final_state(&self) -> MessageState {
        self.history
            .last()
            .copied()
            .unwrap_or(MessageState::Received)
    }
}

// =============================================================================
// Internal processing result
// =============================================================================

enum Verdict {
    Ack,
    Fail {
        error: ProcessingError,
        class: ErrorClass,
    },
}

struct Processed {
    metadata: Option<Metadata>,
    data_type: Option<DataType>,
    outcome: Outcome,
    verdict: Verdict,
    attempts: u32,
    receipt: Option<PersistReceipt>,
    parse_elapsed: Option<Duration>,
    persist_elapsed: Option<Duration>,
}

impl Processed {
    fn label(&self) -> &'static str {
        self.data_type.map_or(UNKNOWN_DATA_TYPE, DataType::as_str)
    }
}

// =============================================================================
// Controller
// =============================================================================

/// Per-delivery state machine with ack, retry and dead-letter decisions.
pub struct DeliveryController {
    repository: Arc<dyn MarketDataRepository>,
    metrics: Arc<dyn MetricsSink>,
    classification: ClassificationTable,
    retry: RetryPolicy,
    failure_mode: FailureMode,
}

impl std::fmt::Debug for DeliveryController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryController")
            .field("classification", &self.classification)
            .field("retry", &self.retry)
            .field("failure_mode", &self.failure_mode)
            .finish_non_exhaustive()
    }
}

impl DeliveryController {
    /// Controller with the default classification table and retry policy,
    /// dead-lettering to `market-data.dlx` / `market-data.persist.dlq`.
    #[must_use]
    pub fn new(repository: Arc<dyn MarketDataRepository>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            repository,
            metrics,
            classification: ClassificationTable::default(),
            retry: RetryPolicy::default(),
            failure_mode: FailureMode::DeadLetter {
                exchange: "market-data.dlx".to_string(),
                routing_key: "market-data.persist.dlq".to_string(),
            },
        }
    }

    /// Replace the classification table.
    #[must_use]
    pub fn with_classification(mut self, classification: ClassificationTable) -> Self {
        self.classification = classification;
        self
    }

    /// Replace the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Replace the failure mode.
    #[must_use]
    pub fn with_failure_mode(mut self, failure_mode: FailureMode) -> Self {
        self.failure_mode = failure_mode;
        self
    }

    /// Handle one delivery end to end and settle it on `channel`.
    pub async fn handle<C>(&self, delivery: Delivery, channel: &C) -> DeliveryReport
    where
        C: DeliveryChannel + ?Sized,
    {
        let received = Instant::now();
        let mut lifecycle = MessageLifecycle::new();

        let processed = self.process(&delivery, &mut lifecycle, received).await;

        let commit_started = Instant::now();
        let (action, settled) = self.settle(&delivery, &processed, channel).await;
        let commit_elapsed = commit_started.elapsed();
        advance(&mut lifecycle, action.terminal_state(), delivery.tag);

        self.record_metrics(&processed, action, commit_elapsed, received.elapsed());

        let error_class = match &processed.verdict {
            Verdict::Fail { class, .. } => Some(*class),
            Verdict::Ack if processed.outcome == Outcome::Duplicate => Some(ErrorClass::Duplicate),
            Verdict::Ack => None,
        };

        DeliveryReport {
            tag: delivery.tag,
            message_id: processed.metadata.and_then(|m| m.message_id),
            data_type: processed.data_type,
            outcome: processed.outcome,
            action,
            attempts: processed.attempts,
            error_class,
            receipt: processed.receipt,
            settled,
            history: lifecycle.history().to_vec(),
        }
    }

    // =========================================================================
    // Processing
    // =========================================================================

    async fn process(
        &self,
        delivery: &Delivery,
        lifecycle: &mut MessageLifecycle,
        received: Instant,
    ) -> Processed {
        advance(lifecycle, MessageState::Decoding, delivery.tag);

        let decoded = match decode(&delivery.body) {
            Ok(decoded) => decoded,
            Err(err) => {
                return self.failed(None, None, err.into(), 0, Some(received.elapsed()), None);
            }
        };
        let metadata = decoded.metadata().clone();

        let data_type = match route(decoded.data_type_tag()) {
            Route::Dispatch(data_type) => data_type,
            Route::Drop(reason) => {
                let parse_elapsed = received.elapsed();
                advance(lifecycle, MessageState::Routed, delivery.tag);
                warn!(
                    delivery_tag = delivery.tag,
                    message_id = metadata.message_id.as_deref().unwrap_or_default(),
                    outcome = %reason.outcome(),
                    data_type = decoded.data_type_tag().unwrap_or_default(),
                    body = %String::from_utf8_lossy(&delivery.body),
                    "Dropping message without a supported data type"
                );
                return Processed {
                    metadata: Some(metadata),
                    data_type: None,
                    outcome: reason.outcome(),
                    verdict: Verdict::Ack,
                    attempts: 0,
                    receipt: None,
                    parse_elapsed: Some(parse_elapsed),
                    persist_elapsed: None,
                };
            }
        };
        let parse_elapsed = received.elapsed();
        advance(lifecycle, MessageState::Routed, delivery.tag);
        self.record_ingest_lag(&metadata, data_type);

        advance(lifecycle, MessageState::Validating, delivery.tag);
        let record = match extract_payload(decoded, data_type)
            .map_err(ProcessingError::from)
            .and_then(|envelope| map_record(envelope).map_err(ProcessingError::from))
        {
            Ok(record) => record,
            Err(err) => {
                return self.failed(
                    Some(metadata),
                    Some(data_type),
                    err,
                    0,
                    Some(parse_elapsed),
                    None,
                );
            }
        };

        advance(lifecycle, MessageState::Persisting, delivery.tag);
        self.persist_with_retry(delivery.tag, metadata, record, lifecycle, parse_elapsed)
            .await
    }

    async fn persist_with_retry(
        &self,
        tag: DeliveryTag,
        metadata: Metadata,
        record: MarketRecord,
        lifecycle: &mut MessageLifecycle,
        parse_elapsed: Duration,
    ) -> Processed {
        let data_type = record.data_type();
        let persist_started = Instant::now();
        let mut backoff = ExponentialBackoff::new(&self.retry);
        let mut attempts = 0;

        loop {
            attempts += 1;
            let error = match self.repository.persist(&record).await {
                Ok(receipt) => {
                    debug!(
                        delivery_tag = tag,
                        data_type = %data_type,
                        record_id = receipt.id,
                        attempt = attempts,
                        "Record persisted"
                    );
                    return Processed {
                        metadata: Some(metadata),
                        data_type: Some(data_type),
                        outcome: Outcome::Success,
                        verdict: Verdict::Ack,
                        attempts,
                        receipt: Some(receipt),
                        parse_elapsed: Some(parse_elapsed),
                        persist_elapsed: Some(persist_started.elapsed()),
                    };
                }
                Err(err) => ProcessingError::from(err),
            };

            let class = classify(&error);
            match self.classification.disposition(class) {
                Disposition::AcceptAsSuccess => {
                    warn!(
                        delivery_tag = tag,
                        data_type = %data_type,
                        natural_key = %record.natural_key(),
                        error_class = %class,
                        "Record already stored, acknowledging as duplicate"
                    );
                    return Processed {
                        metadata: Some(metadata),
                        data_type: Some(data_type),
                        outcome: if class == ErrorClass::Duplicate {
                            Outcome::Duplicate
                        } else {
                            Outcome::Success
                        },
                        verdict: Verdict::Ack,
                        attempts,
                        receipt: None,
                        parse_elapsed: Some(parse_elapsed),
                        persist_elapsed: Some(persist_started.elapsed()),
                    };
                }
                Disposition::Retry => {
                    if let Some(delay) = backoff.next_backoff() {
                        warn!(
                            delivery_tag = tag,
                            data_type = %data_type,
                            attempt = attempts,
                            max_attempts = self.retry.max_attempts,
                            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            error = %render_chain(&error),
                            "Storage attempt failed, retrying"
                        );
                        self.metrics.record_retry(data_type.as_str(), attempts);
                        tokio::time::sleep(delay).await;
                        advance(lifecycle, MessageState::Persisting, tag);
                        continue;
                    }
                }
                Disposition::DeadLetter => {}
            }

            return Processed {
                metadata: Some(metadata),
                data_type: Some(data_type),
                outcome: Outcome::Error,
                verdict: Verdict::Fail { error, class },
                attempts,
                receipt: None,
                parse_elapsed: Some(parse_elapsed),
                persist_elapsed: Some(persist_started.elapsed()),
            };
        }
    }

    /// Resolve a failure raised before storage was attempted.
    ///
    /// Decoding and mapping are deterministic, so a `Retry` disposition
    /// here escalates immediately.
    fn failed(
        &self,
        metadata: Option<Metadata>,
        data_type: Option<DataType>,
        error: ProcessingError,
        attempts: u32,
        parse_elapsed: Option<Duration>,
        persist_elapsed: Option<Duration>,
    ) -> Processed {
        let class = classify(&error);
        let (outcome, verdict) = match self.classification.disposition(class) {
            Disposition::AcceptAsSuccess => (Outcome::Success, Verdict::Ack),
            Disposition::Retry | Disposition::DeadLetter => {
                (Outcome::Error, Verdict::Fail { error, class })
            }
        };
        Processed {
            metadata,
            data_type,
            outcome,
            verdict,
            attempts,
            receipt: None,
            parse_elapsed,
            persist_elapsed,
        }
    }

    // =========================================================================
    // Settlement
    // =========================================================================

    async fn settle<C>(
        &self,
        delivery: &Delivery,
        processed: &Processed,
        channel: &C,
    ) -> (DeliveryAction, bool)
    where
        C: DeliveryChannel + ?Sized,
    {
        let Verdict::Fail { error, class } = &processed.verdict else {
            let settled = ack(channel, delivery.tag).await;
            return (DeliveryAction::Ack, settled);
        };

        let rendered = render_chain(error);
        error!(
            delivery_tag = delivery.tag,
            message_id = processed
                .metadata
                .as_ref()
                .and_then(|m| m.message_id.as_deref())
                .unwrap_or_default(),
            data_type = processed.label(),
            error_class = %class,
            attempts = processed.attempts,
            error = %rendered,
            body = %String::from_utf8_lossy(&delivery.body),
            "Message processing failed"
        );

        match &self.failure_mode {
            FailureMode::Nack { requeue } => {
                let settled = nack(channel, delivery.tag, *requeue).await;
                (DeliveryAction::Nack { requeue: *requeue }, settled)
            }
            FailureMode::DeadLetter {
                exchange,
                routing_key,
            } => {
                let message = OutboundMessage {
                    exchange: exchange.clone(),
                    routing_key: routing_key.clone(),
                    body: delivery.body.clone(),
                    headers: dead_letter_headers(delivery, *class, processed.attempts, rendered),
                };
                match channel.publish(message).await {
                    Ok(()) => {
                        info!(
                            delivery_tag = delivery.tag,
                            dead_letter_exchange = %exchange,
                            routing_key = %routing_key,
                            "Message dead-lettered"
                        );
                        let settled = ack(channel, delivery.tag).await;
                        (DeliveryAction::DeadLetterThenAck, settled)
                    }
                    Err(err) => {
                        error!(
                            delivery_tag = delivery.tag,
                            dead_letter_exchange = %exchange,
                            error = %err,
                            "Dead-letter publish failed, requeueing original"
                        );
                        let settled = nack(channel, delivery.tag, true).await;
                        (DeliveryAction::Nack { requeue: true }, settled)
                    }
                }
            }
        }
    }

    // =========================================================================
    // Metrics
    // =========================================================================

    fn record_ingest_lag(&self, metadata: &Metadata, data_type: DataType) {
        let Some(collected_at) = metadata.collected_at.as_deref() else {
            debug!(data_type = %data_type, "No collectedAt, skipping ingest lag");
            return;
        };
        match DateTime::parse_from_rfc3339(collected_at) {
            Ok(collected_at) => {
                let lag = (Utc::now() - collected_at.with_timezone(&Utc))
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                self.metrics.record_ingest_lag(data_type.as_str(), lag);
            }
            Err(err) => {
                debug!(
                    data_type = %data_type,
                    collected_at,
                    error = %err,
                    "Unparsable collectedAt, skipping ingest lag"
                );
            }
        }
    }

    fn record_metrics(
        &self,
        processed: &Processed,
        action: DeliveryAction,
        commit_elapsed: Duration,
        total_elapsed: Duration,
    ) {
        let label = processed.label();
        let outcome = processed.outcome;

        if let Some(parse) = processed.parse_elapsed {
            self.metrics.record_stage(Stage::Parse, label, outcome, parse);
        }
        if let Some(persist) = processed.persist_elapsed {
            self.metrics
                .record_stage(Stage::Persist, label, outcome, persist);
        }
        self.metrics
            .record_stage(Stage::Commit, label, outcome, commit_elapsed);
        self.metrics
            .record_stage(Stage::Total, label, outcome, total_elapsed);
        self.metrics.record_delivery(label, outcome, action);
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn advance(lifecycle: &mut MessageLifecycle, next: MessageState, tag: DeliveryTag) {
    if let Err(err) = lifecycle.advance(next) {
        error!(delivery_tag = tag, error = %err, "Delivery lifecycle violation");
    }
}

async fn ack<C: DeliveryChannel + ?Sized>(channel: &C, tag: DeliveryTag) -> bool {
    match channel.ack(tag).await {
        Ok(()) => true,
        Err(err) => {
            error!(delivery_tag = tag, error = %err, "Failed to ack delivery");
            false
        }
    }
}

async fn nack<C: DeliveryChannel + ?Sized>(channel: &C, tag: DeliveryTag, requeue: bool) -> bool {
    match channel.nack(tag, requeue).await {
        Ok(()) => true,
        Err(err) => {
            error!(delivery_tag = tag, requeue, error = %err, "Failed to nack delivery");
            false
        }
    }
}

fn dead_letter_headers(
    delivery: &Delivery,
    class: ErrorClass,
    attempts: u32,
    message: String,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        (HEADER_EXCEPTION_MESSAGE.to_string(), message),
        (HEADER_ERROR_CLASS.to_string(), class.to_string()),
        (HEADER_ORIGINAL_EXCHANGE.to_string(), delivery.exchange.clone()),
        (
            HEADER_ORIGINAL_ROUTING_KEY.to_string(),
            delivery.routing_key.clone(),
        ),
        (HEADER_DELIVERY_ATTEMPTS.to_string(), attempts.to_string()),
    ])
}

/// Render an error and its causes as `outer: inner: root`.
fn render_chain(error: &ProcessingError) -> String {
    let mut rendered = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !rendered.ends_with(&text) {
            rendered.push_str(": ");
            rendered.push_str(&text);
        }
        source = cause.source();
    }
    rendered
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use mockall::predicate::eq;

    use super::*;
    use crate::application::ports::{
        BrokerError, MockDeliveryChannel, MockMarketDataRepository, NoOpMetricsSink, StorageError,
    };

    const TRADE: &str = r#"{"metadata":{"messageId":"m-7","exchange":"UPBIT","dataType":"TRADE","collectedAt":"2025-08-28T16:49:00.123Z","version":"1.0"},"payload":{"marketCode":"KRW-BTC","timestamp":1672531200000,"tradeDate":"2025-08-28","tradeTime":"16:49:00","tradeTimestamp":1672531200000,"tradePrice":70000000.00,"tradeVolume":0.01,"askBid":"ASK","prevClosingPrice":70000000.00,"change":"EVEN","changePrice":0,"sequentialId":1000,"bestAskPrice":70001000,"bestAskSize":0.5,"bestBidPrice":69999000,"bestBidSize":0.7,"streamType":"SNAPSHOT"}}"#;

    fn delivery(body: &str) -> Delivery {
        Delivery {
            tag: 7,
            body: body.as_bytes().to_vec(),
            exchange: "market-data".to_string(),
            routing_key: "upbit.trade.krw-btc".to_string(),
            redelivered: false,
        }
    }

    fn receipt() -> PersistReceipt {
        PersistReceipt {
            id: 1,
            loaded_at: Utc::now(),
        }
    }

    fn controller(repository: MockMarketDataRepository) -> DeliveryController {
        DeliveryController::new(Arc::new(repository), Arc::new(NoOpMetricsSink))
            .with_retry_policy(RetryPolicy::immediate(3))
    }

    #[tokio::test]
    async fn acks_after_successful_persist() {
        let mut repository = MockMarketDataRepository::new();
        repository
            .expect_persist()
            .times(1)
            .returning(|_| Ok(receipt()));
        let mut channel = MockDeliveryChannel::new();
        channel.expect_ack().with(eq(7)).times(1).returning(|_| Ok(()));

        let report = controller(repository).handle(delivery(TRADE), &channel).await;

        assert_eq!(report.outcome, Outcome::Success);
        assert_eq!(report.action, DeliveryAction::Ack);
        assert_eq!(report.attempts, 1);
        assert_eq!(report.message_id.as_deref(), Some("m-7"));
        assert_eq!(report.final_state(), MessageState::Acked);
        assert!(report.settled);
    }

    #[tokio::test]
    async fn dead_letters_after_retries_exhausted() {
        let mut repository = MockMarketDataRepository::new();
        repository.expect_persist().times(3).returning(|_| {
            Err(StorageError::Timeout {
                operation: "insert trade".to_string(),
            })
        });
        let mut channel = MockDeliveryChannel::new();
        channel
            .expect_publish()
            .withf(|message| {
                message.exchange == "market-data.dlx"
                    && message.routing_key == "market-data.persist.dlq"
                    && message.headers.get(HEADER_ERROR_CLASS).map(String::as_str)
                        == Some("transient_storage")
                    && message.headers.get(HEADER_DELIVERY_ATTEMPTS).map(String::as_str)
                        == Some("3")
                    && message.body == TRADE.as_bytes()
            })
            .times(1)
            .returning(|_| Ok(()));
        channel.expect_ack().with(eq(7)).times(1).returning(|_| Ok(()));

        let report = controller(repository).handle(delivery(TRADE), &channel).await;

        assert_eq!(report.outcome, Outcome::Error);
        assert_eq!(report.action, DeliveryAction::DeadLetterThenAck);
        assert_eq!(report.error_class, Some(ErrorClass::TransientStorage));
        assert_eq!(report.attempts, 3);
        assert_eq!(report.final_state(), MessageState::DeadLettered);
    }

    #[tokio::test]
    async fn requeues_when_dead_letter_publish_fails() {
        let mut repository = MockMarketDataRepository::new();
        repository.expect_persist().never();
        let mut channel = MockDeliveryChannel::new();
        channel
            .expect_publish()
            .times(1)
            .returning(|_| Err(BrokerError::Closed));
        channel
            .expect_nack()
            .with(eq(7), eq(true))
            .times(1)
            .returning(|_, _| Ok(()));
        channel.expect_ack().never();

        let report = controller(repository)
            .handle(delivery("{broken"), &channel)
            .await;

        assert_eq!(report.action, DeliveryAction::Nack { requeue: true });
        assert_eq!(report.error_class, Some(ErrorClass::Decode));
        assert_eq!(report.final_state(), MessageState::Nacked);
    }

    #[tokio::test]
    async fn legacy_mode_nacks_with_configured_requeue() {
        let mut repository = MockMarketDataRepository::new();
        repository.expect_persist().never();
        let mut channel = MockDeliveryChannel::new();
        channel.expect_publish().never();
        channel
            .expect_nack()
            .with(eq(7), eq(false))
            .times(1)
            .returning(|_, _| Ok(()));

        let report = controller(repository)
            .with_failure_mode(FailureMode::Nack { requeue: false })
            .handle(delivery("[]"), &channel)
            .await;

        assert_eq!(report.action, DeliveryAction::Nack { requeue: false });
    }

    #[tokio::test]
    async fn injected_table_can_disable_retries() {
        let mut repository = MockMarketDataRepository::new();
        repository.expect_persist().times(1).returning(|_| {
            Err(StorageError::Unavailable {
                message: "driver bug".to_string(),
                source: None,
            })
        });
        let mut channel = MockDeliveryChannel::new();
        channel.expect_publish().times(1).returning(|_| Ok(()));
        channel.expect_ack().times(1).returning(|_| Ok(()));

        let table = ClassificationTable::default()
            .with(ErrorClass::TransientStorage, Disposition::DeadLetter);
        let report = controller(repository)
            .with_classification(table)
            .handle(delivery(TRADE), &channel)
            .await;

        assert_eq!(report.attempts, 1);
        assert_eq!(report.action, DeliveryAction::DeadLetterThenAck);
    }

    #[tokio::test]
    async fn ack_failure_is_reported_not_raised() {
        let mut repository = MockMarketDataRepository::new();
        repository.expect_persist().returning(|_| Ok(receipt()));
        let mut channel = MockDeliveryChannel::new();
        channel
            .expect_ack()
            .returning(|tag| Err(BrokerError::UnknownDeliveryTag { tag }));

        let report = controller(repository).handle(delivery(TRADE), &channel).await;

        assert_eq!(report.outcome, Outcome::Success);
        assert!(!report.settled);
    }

    #[test]
    fn render_chain_includes_root_cause() {
        let io = std::io::Error::other("disk gone");
        let error = ProcessingError::from(StorageError::Unavailable {
            message: "insert failed".to_string(),
            source: Some(Box::new(io)),
        });
        assert_eq!(
            render_chain(&error),
            "storage failed: storage unavailable: insert failed: disk gone"
        );
    }
}
