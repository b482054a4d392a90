//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// In-process broker and topology declaration.
pub mod broker;

/// Configuration loading.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// SQLite and in-memory persistence adapters.
pub mod persistence;

/// Line-delimited replay input.
pub mod replay;

/// Logging and OpenTelemetry tracing setup.
pub mod telemetry;
