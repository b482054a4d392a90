//! Message Decoder
//!
//! Turns a raw broker body into a JSON tree and pulls out the data-type
//! tag without validating the payload schema. Some producers publish the
//! envelope as a JSON string literal that itself contains JSON; such
//! bodies are unwrapped exactly one level.
//!
//! JSON numbers are kept as their source text inside the tree, so price
//! and size fields reach [`rust_decimal::Decimal`] without passing
//! through `f64`.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::domain::message::{Envelope, Metadata};

// =============================================================================
// Errors
// =============================================================================

/// Body could not be decoded into an envelope. Never retried.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// Body is not valid UTF-8.
    #[error("message body is not valid UTF-8")]
    InvalidUtf8(#[source] std::str::Utf8Error),

    /// Body is not valid JSON.
    #[error("malformed JSON body")]
    Malformed(#[source] serde_json::Error),

    /// Body was a JSON string whose contents are not valid JSON.
    #[error("malformed JSON inside string-encoded body")]
    MalformedInner(#[source] serde_json::Error),

    /// Top-level JSON value is not an object.
    #[error("message body is not a JSON object")]
    NotAnObject,

    /// `metadata` or `payload` is absent, null or not an object.
    #[error("missing required section: {0}")]
    MissingSection(&'static str),

    /// Payload does not fit the schema selected by the data-type tag.
    #[error("payload does not match the {data_type} schema")]
    SchemaMismatch {
        /// Data type the payload was decoded as.
        data_type: &'static str,
        /// Deserialization failure.
        #[source]
        source: serde_json::Error,
    },
}

// =============================================================================
// Decoded Message
// =============================================================================

/// A parsed body that has not yet been checked against a payload schema.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMessage {
    tree: Value,
    metadata: Metadata,
}

impl DecodedMessage {
    /// Parsed metadata block.
    #[must_use]
    pub const fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Raw `metadata.dataType` value. Non-string values are rendered as
    /// JSON text so that they route as unsupported rather than missing.
    #[must_use]
    pub fn data_type_tag(&self) -> Option<&str> {
        self.metadata.data_type.as_deref()
    }

    /// The full JSON tree.
    #[must_use]
    pub const fn tree(&self) -> &Value {
        &self.tree
    }

    /// Deserialize the payload into `P`.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::SchemaMismatch`] when a field has the wrong
    /// JSON type for `P`.
    pub fn into_envelope<P: DeserializeOwned>(
        self,
        data_type: &'static str,
    ) -> Result<Envelope<P>, DecodeError> {
        let Value::Object(mut root) = self.tree else {
            return Err(DecodeError::NotAnObject);
        };
        let payload = root
            .remove("payload")
            .ok_or(DecodeError::MissingSection("payload"))?;
        let payload = serde_json::from_value(payload)
            .map_err(|source| DecodeError::SchemaMismatch { data_type, source })?;

        Ok(Envelope {
            metadata: self.metadata,
            payload,
        })
    }
}

// =============================================================================
// Decoding
// =============================================================================

/// Decode a raw message body.
///
/// # Errors
///
/// Returns a [`DecodeError`] if the body is not UTF-8, not JSON at either
/// unwrap level, or lacks an object `metadata` or a non-null `payload`.
pub fn decode(body: &[u8]) -> Result<DecodedMessage, DecodeError> {
    let text = std::str::from_utf8(body).map_err(DecodeError::InvalidUtf8)?;
    let tree = parse_tree(text)?;

    let Value::Object(root) = &tree else {
        return Err(DecodeError::NotAnObject);
    };

    let metadata = root
        .get("metadata")
        .and_then(Value::as_object)
        .map(read_metadata)
        .ok_or(DecodeError::MissingSection("metadata"))?;
    if root.get("payload").is_none_or(Value::is_null) {
        return Err(DecodeError::MissingSection("payload"));
    }

    Ok(DecodedMessage { tree, metadata })
}

/// Scalars of the wrong JSON type are kept as their JSON text.
fn read_metadata(object: &Map<String, Value>) -> Metadata {
    let field = |name: &str| match object.get(name) {
        None | Some(Value::Null) => None,
        Some(Value::String(text)) => Some(text.clone()),
        Some(other) => Some(other.to_string()),
    };

    Metadata {
        message_id: field("messageId"),
        exchange: field("exchange"),
        data_type: field("dataType"),
        collected_at: field("collectedAt"),
        version: field("version"),
    }
}

fn parse_tree(text: &str) -> Result<Value, DecodeError> {
    let trimmed = text.trim();
    if is_string_literal(trimmed) {
        let inner: String = serde_json::from_str(trimmed).map_err(DecodeError::Malformed)?;
        serde_json::from_str(&inner).map_err(DecodeError::MalformedInner)
    } else {
        serde_json::from_str(trimmed).map_err(DecodeError::Malformed)
    }
}

fn is_string_literal(text: &str) -> bool {
    text.len() >= 2 && text.starts_with('"') && text.ends_with('"')
}

// =============================================================================
// Tests
// =============================================================================
