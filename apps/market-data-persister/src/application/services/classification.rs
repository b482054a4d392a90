//! Failure classification.
//!
//! Maps a processing failure to an [`ErrorClass`] by walking its cause
//! chain to the innermost recognized error, then maps the class to a
//! [`Disposition`] through an injected [`ClassificationTable`].
//!
//! | Class | Default disposition |
//! |-------|---------------------|
//! | `TransientStorage` | `Retry` (bounded, then dead-letter) |
//! | `Decode` | `DeadLetter` |
//! | `Validation` | `DeadLetter` |
//! | `Duplicate` | `AcceptAsSuccess` |
//! | `Unclassified` | `DeadLetter` |

use std::collections::HashMap;
use std::error::Error;
use std::fmt;

use crate::application::decoder::DecodeError;
use crate::application::ports::StorageError;
use crate::domain::validation::ValidationError;

// =============================================================================
// Processing Error
// =============================================================================

/// Any failure raised while processing one delivery.
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    /// Body could not be decoded.
    #[error("decode failed")]
    Decode(#[from] DecodeError),

    /// Payload failed validation.
    #[error("validation failed")]
    Validation(#[from] ValidationError),

    /// Storage rejected or failed the write.
    #[error("storage failed")]
    Storage(#[from] StorageError),

    /// Failure raised by an adapter outside the known taxonomy.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProcessingError {
    /// The wrapped error, as a trait object.
    #[must_use]
    pub fn inner(&self) -> &(dyn Error + 'static) {
        match self {
            Self::Decode(e) => e,
            Self::Validation(e) => e,
            Self::Storage(e) => e,
            Self::Other(e) => &**e,
        }
    }
}

// =============================================================================
// Classes and Dispositions
// =============================================================================

/// Failure class, decided by the innermost recognized cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Malformed body, wrong JSON types.
    Decode,
    /// Missing or invalid field.
    Validation,
    /// Uniqueness violation.
    Duplicate,
    /// Timeout, lost connection, I/O.
    TransientStorage,
    /// Nothing in the chain is recognized.
    Unclassified,
}

impl ErrorClass {
    /// Label used in logs and dead-letter headers.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Decode => "decode",
            Self::Validation => "validation",
            Self::Duplicate => "duplicate",
            Self::TransientStorage => "transient_storage",
            Self::Unclassified => "unclassified",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do with a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Disposition {
    /// Retry locally while attempts remain, then dead-letter.
    Retry,
    /// Dead-letter now.
    DeadLetter,
    /// Acknowledge as if it had succeeded.
    AcceptAsSuccess,
}

/// Error class to disposition mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationTable {
    entries: HashMap<ErrorClass, Disposition>,
    fallback: Disposition,
}

impl Default for ClassificationTable {
    fn default() -> Self {
        Self::empty()
            .with(ErrorClass::TransientStorage, Disposition::Retry)
            .with(ErrorClass::Decode, Disposition::DeadLetter)
            .with(ErrorClass::Validation, Disposition::DeadLetter)
            .with(ErrorClass::Duplicate, Disposition::AcceptAsSuccess)
            .with(ErrorClass::Unclassified, Disposition::DeadLetter)
    }
}

impl ClassificationTable {
    /// Table with no entries; every class dead-letters.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
            fallback: Disposition::DeadLetter,
        }
    }

    /// Set the disposition for a class.
    #[must_use]
    pub fn with(mut self, class: ErrorClass, disposition: Disposition) -> Self {
        self.entries.insert(class, disposition);
        self
    }

    /// Disposition for a class.
    #[must_use]
    pub fn disposition(&self, class: ErrorClass) -> Disposition {
        self.entries.get(&class).copied().unwrap_or(self.fallback)
    }
}

// =============================================================================
// Classification
// =============================================================================

/// Classify an error by the innermost recognized cause in its chain.
///
/// [`ProcessingError`] wrappers are looked through, including when they
/// sit inside an `anyhow` context chain.
#[must_use]
pub fn classify(error: &(dyn Error + 'static)) -> ErrorClass {
    let mut deepest = None;
    let mut current = Some(error);

    while let Some(err) = current {
        if let Some(wrapper) = err.downcast_ref::<ProcessingError>() {
            current = Some(wrapper.inner());
            continue;
        }
        if let Some(class) = recognize(err) {
            deepest = Some(class);
        }
        current = err.source();
    }

    deepest.unwrap_or(ErrorClass::Unclassified)
}

fn recognize(err: &(dyn Error + 'static)) -> Option<ErrorClass> {
    if let Some(storage) = err.downcast_ref::<StorageError>() {
        return Some(if storage.is_duplicate() {
            ErrorClass::Duplicate
        } else {
            ErrorClass::TransientStorage
        });
    }
    if err.is::<DecodeError>() || err.is::<serde_json::Error>() {
        return Some(ErrorClass::Decode);
    }
    if err.is::<ValidationError>()
        || err.is::<chrono::ParseError>()
        || err.is::<rust_decimal::Error>()
        || err.is::<std::num::ParseIntError>()
    {
        return Some(ErrorClass::Validation);
    }
    if err.is::<std::io::Error>() || err.is::<tokio::time::error::Elapsed>() {
        return Some(ErrorClass::TransientStorage);
    }
    None
}

// =============================================================================
// Tests
// =============================================================================
