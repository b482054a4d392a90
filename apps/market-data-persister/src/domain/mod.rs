//! Domain Layer - Market data messages, records and delivery lifecycle.
//!
//! Pure types and rules with no I/O. Everything here is deterministic and
//! safe to call from any worker.

/// Wire-level message envelope and payloads.
pub mod message;

/// Validated records and their natural keys.
pub mod record;

/// Envelope-to-record mappers and validation errors.
pub mod validation;

/// Per-delivery state machine and outcome vocabulary.
pub mod lifecycle;
