//! Market Data Message Types
//!
//! Wire-level shapes of the messages published by the collectors: a
//! metadata block plus a typed payload. Field names follow the producer's
//! camelCase JSON convention.
//!
//! Every payload field is optional at this level so that the mappers can
//! report exactly which required field a producer left out.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// Data Type
// =============================================================================

/// Kind of market data carried by a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// Rolling 24h ticker snapshot.
    Ticker,
    /// Single executed trade.
    Trade,
    /// Order book depth snapshot.
    #[serde(rename = "orderbook")]
    OrderBook,
}

impl DataType {
    /// Every supported data type.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Ticker, Self::Trade, Self::OrderBook]
    }

    /// Normalized tag used in routing keys, tables and metric labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ticker => "ticker",
            Self::Trade => "trade",
            Self::OrderBook => "orderbook",
        }
    }

    /// Resolve a normalized (trimmed, lowercase) tag.
    #[must_use]
    pub fn from_normalized(tag: &str) -> Option<Self> {
        match tag {
            "ticker" => Some(Self::Ticker),
            "trade" => Some(Self::Trade),
            "orderbook" => Some(Self::OrderBook),
            _ => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Envelope
// =============================================================================

/// Metadata block shared by all message kinds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Metadata {
    /// Producer-assigned message id. Opaque.
    pub message_id: Option<String>,
    /// Exchange the data was collected from (e.g. `UPBIT`).
    pub exchange: Option<String>,
    /// Data-type tag used for routing.
    pub data_type: Option<String>,
    /// ISO-8601 instant at which the collector captured the data.
    pub collected_at: Option<String>,
    /// Producer schema version. Opaque.
    pub version: Option<String>,
}

/// A decoded message: metadata plus a typed payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<P> {
    /// Message metadata.
    pub metadata: Metadata,
    /// Type-specific payload.
    pub payload: P,
}

impl<P> Envelope<P> {
    /// Replace the payload, keeping the metadata.
    pub fn map_payload<Q>(self, f: impl FnOnce(P) -> Q) -> Envelope<Q> {
        Envelope {
            metadata: self.metadata,
            payload: f(self.payload),
        }
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// Ticker payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct TickerPayload {
    pub market_code: Option<String>,
    pub trade_price: Option<Decimal>,
    pub trade_volume: Option<Decimal>,
    pub opening_price: Option<Decimal>,
    pub high_price: Option<Decimal>,
    pub low_price: Option<Decimal>,
    pub prev_closing_price: Option<Decimal>,
    #[serde(rename = "accTradePrice24h")]
    pub acc_trade_price_24h: Option<Decimal>,
    #[serde(rename = "accTradeVolume24h")]
    pub acc_trade_volume_24h: Option<Decimal>,
    /// Exchange event time, epoch milliseconds.
    pub timestamp: Option<i64>,
}

/// Trade payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct TradePayload {
    pub market_code: Option<String>,
    /// Message time, epoch milliseconds.
    pub timestamp: Option<i64>,
    pub trade_date: Option<String>,
    pub trade_time: Option<String>,
    /// Execution time, epoch milliseconds.
    pub trade_timestamp: Option<i64>,
    pub trade_price: Option<Decimal>,
    pub trade_volume: Option<Decimal>,
    /// `ASK` or `BID`.
    pub ask_bid: Option<String>,
    pub prev_closing_price: Option<Decimal>,
    /// `RISE`, `EVEN` or `FALL`.
    pub change: Option<String>,
    pub change_price: Option<Decimal>,
    /// Exchange-assigned trade sequence number.
    pub sequential_id: Option<i64>,
    pub best_ask_price: Option<Decimal>,
    pub best_ask_size: Option<Decimal>,
    pub best_bid_price: Option<Decimal>,
    pub best_bid_size: Option<Decimal>,
    /// `SNAPSHOT` or `REALTIME`.
    pub stream_type: Option<String>,
}

/// One price level of an order book payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct OrderBookUnitPayload {
    pub ask_price: Option<Decimal>,
    pub ask_size: Option<Decimal>,
    pub bid_price: Option<Decimal>,
    pub bid_size: Option<Decimal>,
}

/// Order book payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct OrderBookPayload {
    pub market_code: Option<String>,
    pub timestamp: Option<i64>,
    pub total_ask_size: Option<Decimal>,
    pub total_bid_size: Option<Decimal>,
    /// Price levels, best first. `null` entries are reported by index.
    #[serde(rename = "orderbookUnits")]
    pub orderbook_units: Option<Vec<Option<OrderBookUnitPayload>>>,
}

/// Payload of any supported data type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarketPayload {
    /// Ticker payload.
    Ticker(TickerPayload),
    /// Trade payload.
    Trade(TradePayload),
    /// Order book payload.
    OrderBook(OrderBookPayload),
}

impl MarketPayload {
    /// Data type of this payload.
    #[must_use]
    pub const fn data_type(&self) -> DataType {
        match self {
            Self::Ticker(_) => DataType::Ticker,
            Self::Trade(_) => DataType::Trade,
            Self::OrderBook(_) => DataType::OrderBook,
        }
    }

    /// Market code, when present.
    #[must_use]
    pub fn market_code(&self) -> Option<&str> {
        match self {
            Self::Ticker(p) => p.market_code.as_deref(),
            Self::Trade(p) => p.market_code.as_deref(),
            Self::OrderBook(p) => p.market_code.as_deref(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn data_type_tags_round_trip() {
        for data_type in DataType::all() {
            assert_eq!(DataType::from_normalized(data_type.as_str()), Some(*data_type));
        }
        assert_eq!(DataType::from_normalized("Ticker"), None);
        assert_eq!(DataType::from_normalized("candle"), None);
    }

    #[test]
    fn ticker_payload_reads_camel_case_fields() {
        let json = r#"{
            "marketCode": "KRW-BTC",
            "tradePrice": 70000000.00,
            "accTradePrice24h": "123456789.5",
            "accTradeVolume24h": 12.5,
            "timestamp": 1672531200000
        }"#;

        let payload: TickerPayload = serde_json::from_str(json).unwrap();

        assert_eq!(payload.market_code.as_deref(), Some("KRW-BTC"));
        assert_eq!(payload.trade_price, Some(Decimal::from_str("70000000").unwrap()));
        assert_eq!(
            payload.acc_trade_price_24h,
            Some(Decimal::from_str("123456789.5").unwrap())
        );
        assert_eq!(payload.timestamp, Some(1_672_531_200_000));
        assert!(payload.opening_price.is_none());
    }

    #[test]
    fn metadata_tolerates_missing_fields() {
        let metadata: Metadata = serde_json::from_str(r#"{"exchange":"UPBIT"}"#).unwrap();
        assert_eq!(metadata.exchange.as_deref(), Some("UPBIT"));
        assert!(metadata.data_type.is_none());
        assert!(metadata.collected_at.is_none());
    }

    #[test]
    fn order_book_units_keep_null_entries() {
        let json = r#"{"orderbookUnits":[{"askPrice":1,"askSize":2,"bidPrice":3,"bidSize":4},null]}"#;
        let payload: OrderBookPayload = serde_json::from_str(json).unwrap();
        let units = payload.orderbook_units.unwrap();
        assert_eq!(units.len(), 2);
        assert!(units[0].is_some());
        assert!(units[1].is_none());
    }
}
