#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements,
        clippy::indexing_slicing
    )
)]

//! Market Data Persister - Broker Consumer
//!
//! Consumes ticker, trade and order book events from a topic exchange and
//! persists them with idempotent effect: delivery is at-least-once, and a
//! uniqueness constraint on each record's natural key turns redelivery
//! into a detected duplicate rather than a second row.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Wire types, records and rules with no I/O
//!   - `message`: Envelope, metadata and payload DTOs
//!   - `record`: Storage-ready records and natural keys
//!   - `validation`: Pure payload-to-record mappers
//!   - `lifecycle`: Per-delivery state machine and outcomes
//!
//! - **Application**: Pipeline stages and port definitions
//!   - `decoder`: Body decoding, tolerant of double encoding
//!   - `router`: Data-type routing
//!   - `ports`: Broker, repository and metrics interfaces
//!   - `services`: Classification, retry, delivery control, consumer pool
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `broker`: In-process broker and topology
//!   - `persistence`: SQLite and in-memory repositories
//!   - `metrics`, `telemetry`, `health`: Observability
//!   - `config`: Environment configuration
//!   - `replay`: Line-delimited replay input
//!
//! # Data Flow
//!
//! ```text
//! broker ─► decode ─► route ─┬─► map/validate ─► persist ─┬─► ack
//!                            │                            ├─► dead-letter + ack
//!                            └─► drop + ack               └─► nack (legacy)
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Wire types, records and validation with no I/O.
pub mod domain;

/// Application layer - Pipeline stages and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::lifecycle::{DeliveryAction, MessageState, Outcome};
pub use domain::message::{DataType, Envelope, MarketPayload, Metadata};
pub use domain::record::{MarketRecord, NaturalKey, PersistReceipt};
pub use domain::validation::ValidationError;

// Pipeline
pub use application::decoder::{DecodeError, decode};
pub use application::ports::{
    BrokerConnection, BrokerError, Delivery, DeliveryChannel, MarketDataRepository,
    MessageSource, MetricsSink, OutboundMessage, QueueDepth, StorageError,
};
pub use application::router::{DropReason, Route, route};
pub use application::services::{
    ClassificationTable, ConsumerPool, ConsumerSettings, DeliveryController, DeliveryReport,
    Disposition, ErrorClass, FailureMode, PoolActivity, ProcessingError, RetryPolicy, classify,
};

// Infrastructure config
pub use infrastructure::config::{ConfigError, PersisterConfig};

// Adapters
pub use infrastructure::broker::{BrokerTopology, InMemoryBroker};
pub use infrastructure::persistence::{InMemoryRepository, SqliteRepository};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::{PrometheusMetricsSink, RecordingMetricsSink, init_metrics};

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
