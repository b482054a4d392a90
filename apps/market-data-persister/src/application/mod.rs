//! Application Layer - Pipeline stages, services and port definitions.
//!
//! Decoding and routing are pure functions over the raw body; the services
//! orchestrate them against the broker and storage ports.

/// Raw body decoding (double-encoding tolerant).
pub mod decoder;

/// Data-type routing and typed payload extraction.
pub mod router;

/// Port interfaces for broker, storage and metrics.
pub mod ports;

/// Classification, retry, delivery control and the consumer pool.
pub mod services;
