//! Application Services
//!
//! Services that drive deliveries through the pipeline.
//!
//! - `classification`: Root-cause failure classification and dispositions
//! - `retry`: Bounded local retry with exponential backoff
//! - `delivery`: Per-delivery state machine and broker settlement
//! - `consumer`: Elastic worker pool with drain-on-shutdown

pub mod classification;
pub mod consumer;
pub mod delivery;
pub mod retry;

pub use classification::{ClassificationTable, Disposition, ErrorClass, ProcessingError, classify};
pub use consumer::{ConsumerPool, ConsumerSettings, PoolActivity, PoolSummary};
pub use delivery::{DeliveryController, DeliveryReport, FailureMode};
pub use retry::{ExponentialBackoff, RetryPolicy};
