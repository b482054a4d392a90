//! Repository Port (Driven Port)
//!
//! Idempotent persistence of validated market data records.

use async_trait::async_trait;

use crate::domain::record::{MarketRecord, PersistReceipt};

/// Storage failure, already normalized by the adapter.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A record with the same natural key is already stored.
    #[error("duplicate record for natural key {key}")]
    Duplicate {
        /// Rendered natural key.
        key: String,
    },

    /// The operation did not complete in time (lock wait, pool checkout).
    #[error("storage operation timed out: {operation}")]
    Timeout {
        /// Operation that timed out.
        operation: String,
    },

    /// Any other storage failure. Treated as transient.
    #[error("storage unavailable: {message}")]
    Unavailable {
        /// Human-readable description.
        message: String,
        /// Underlying driver error, when there is one.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl StorageError {
    /// Build an [`StorageError::Unavailable`] without an underlying cause.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
            source: None,
        }
    }

    /// Whether this error reports a uniqueness violation.
    #[must_use]
    pub const fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }
}

/// Port for storing market data records.
///
/// Each call is atomic: on error nothing from the record is visible. An
/// order book and its units are written together or not at all.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketDataRepository: Send + Sync {
    /// Insert a record.
    ///
    /// Returns [`StorageError::Duplicate`] when the natural key is already
    /// present; the existing row is left untouched.
    async fn persist(&self, record: &MarketRecord) -> Result<PersistReceipt, StorageError>;
}
