//! Type Router
//!
//! Selects the payload schema from the data-type tag. Missing and unknown
//! tags are dropped: the delivery is acknowledged without reaching a mapper.

use crate::domain::message::{
    DataType, Envelope, MarketPayload, OrderBookPayload, TickerPayload, TradePayload,
};
use crate::domain::lifecycle::Outcome;

use super::decoder::{DecodeError, DecodedMessage};

/// Why a message is dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// Tag absent, null or blank.
    MissingType,
    /// Tag present but not a supported data type.
    UnsupportedType {
        /// Normalized tag.
        tag: String,
    },
}

impl DropReason {
    /// Outcome recorded for this drop.
    #[must_use]
    pub const fn outcome(&self) -> Outcome {
        match self {
            Self::MissingType => Outcome::MissingType,
            Self::UnsupportedType { .. } => Outcome::UnsupportedType,
        }
    }
}

/// Routing decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Hand to the mapper for this data type.
    Dispatch(DataType),
    /// Acknowledge and discard.
    Drop(DropReason),
}

/// Route a raw tag. Matching is case-insensitive and ignores surrounding
/// whitespace.
#[must_use]
pub fn route(tag: Option<&str>) -> Route {
    let normalized = tag.map(|t| t.trim().to_lowercase()).unwrap_or_default();
    if normalized.is_empty() {
        return Route::Drop(DropReason::MissingType);
    }
    DataType::from_normalized(&normalized).map_or(
        Route::Drop(DropReason::UnsupportedType { tag: normalized }),
        Route::Dispatch,
    )
}

/// Deserialize the payload of a routed message into its typed variant.
///
/// # Errors
///
/// Returns [`DecodeError::SchemaMismatch`] when the payload does not fit
/// the schema of `data_type`.
pub fn extract_payload(
    decoded: DecodedMessage,
    data_type: DataType,
) -> Result<Envelope<MarketPayload>, DecodeError> {
    let label = data_type.as_str();
    Ok(match data_type {
        DataType::Ticker => decoded
            .into_envelope::<TickerPayload>(label)?
            .map_payload(MarketPayload::Ticker),
        DataType::Trade => decoded
            .into_envelope::<TradePayload>(label)?
            .map_payload(MarketPayload::Trade),
        DataType::OrderBook => decoded
            .into_envelope::<OrderBookPayload>(label)?
            .map_payload(MarketPayload::OrderBook),
    })
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;
    use crate::application::decoder::decode;

    #[test_case(Some("TICKER"), DataType::Ticker ; "upper ticker")]
    #[test_case(Some("trade"), DataType::Trade ; "lower trade")]
    #[test_case(Some(" OrderBook "), DataType::OrderBook ; "mixed case padded orderbook")]
    fn dispatches_known_tags(tag: Option<&str>, expected: DataType) {
        assert_eq!(route(tag), Route::Dispatch(expected));
    }

    #[test_case(None ; "absent")]
    #[test_case(Some("") ; "empty")]
    #[test_case(Some("   ") ; "blank")]
    fn drops_missing_tags(tag: Option<&str>) {
        assert_eq!(route(tag), Route::Drop(DropReason::MissingType));
    }

    #[test]
    fn drops_unknown_tag_with_normalized_name() {
        assert_eq!(
            route(Some("CANDLE")),
            Route::Drop(DropReason::UnsupportedType {
                tag: "candle".to_string()
            })
        );
    }

    #[test]
    fn extracts_typed_payload() {
        let decoded = decode(
            br#"{"metadata":{"exchange":"UPBIT","dataType":"ORDERBOOK"},"payload":{"marketCode":"KRW-BTC","orderbookUnits":[]}}"#,
        )
        .unwrap();

        let envelope = extract_payload(decoded, DataType::OrderBook).unwrap();

        assert_eq!(envelope.payload.data_type(), DataType::OrderBook);
        assert_eq!(envelope.payload.market_code(), Some("KRW-BTC"));
    }
}
