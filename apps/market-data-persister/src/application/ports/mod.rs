//! Application Ports (Driver and Driven)
//!
//! Interfaces the delivery pipeline depends on. Infrastructure adapters
//! implement these; tests substitute in-memory doubles.
//!
//! - **Driver Ports**: `MessageSource` hands deliveries to the pipeline
//! - **Driven Ports**: `DeliveryChannel` (settlement), `MarketDataRepository`
//!   (storage), `MetricsSink` (observability)

mod broker_port;
mod metrics_port;
mod repository_port;

pub use broker_port::{
    BrokerConnection, BrokerError, Delivery, DeliveryChannel, DeliveryTag, MessageSource,
    OutboundMessage, QueueDepth,
};
#[cfg(test)]
pub use broker_port::MockDeliveryChannel;
pub use metrics_port::{MetricsSink, NoOpMetricsSink, Stage};
#[cfg(test)]
pub use repository_port::MockMarketDataRepository;
pub use repository_port::{MarketDataRepository, StorageError};
