//! Validation and Mapping
//!
//! Converts decoded envelopes into persisted records, rejecting messages
//! whose required fields are missing or whose identifying values are not
//! positive. Mapping is pure: the same envelope always yields the same
//! record or the same error.

use super::message::{
    Envelope, MarketPayload, OrderBookPayload, OrderBookUnitPayload, TickerPayload, TradePayload,
};
use super::record::{MarketRecord, OrderBookRecord, OrderBookUnitRecord, TickerRecord, TradeRecord};

// =============================================================================
// Errors
// =============================================================================

/// Semantic validation failure. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// A required field is absent or null.
    #[error("missing required field: {field}")]
    MissingField {
        /// Wire name of the field (e.g. `orderbookUnits[2].askPrice`).
        field: String,
    },

    /// A field that must be strictly positive is not.
    #[error("field {field} must be positive, got {value}")]
    NonPositive {
        /// Wire name of the field.
        field: String,
        /// Offending value.
        value: i64,
    },

    /// A collection that must contain at least one element is empty.
    #[error("field {field} must not be empty")]
    Empty {
        /// Wire name of the field.
        field: String,
    },
}

impl ValidationError {
    /// Wire name of the offending field.
    #[must_use]
    pub fn field(&self) -> &str {
        match self {
            Self::MissingField { field } | Self::NonPositive { field, .. } | Self::Empty { field } => {
                field
            }
        }
    }
}

fn require<T>(value: Option<T>, field: &str) -> Result<T, ValidationError> {
    value.ok_or_else(|| ValidationError::MissingField {
        field: field.to_string(),
    })
}

fn require_positive(value: Option<i64>, field: &str) -> Result<i64, ValidationError> {
    let value = require(value, field)?;
    if value > 0 {
        Ok(value)
    } else {
        Err(ValidationError::NonPositive {
            field: field.to_string(),
            value,
        })
    }
}

fn require_exchange<P>(envelope: &Envelope<P>) -> Result<String, ValidationError> {
    require(envelope.metadata.exchange.clone(), "metadata.exchange")
}

// =============================================================================
// Mappers
// =============================================================================

/// Map a ticker envelope. All payload fields are required.
///
/// # Errors
///
/// Returns [`ValidationError::MissingField`] naming the first absent field.
pub fn map_ticker(envelope: Envelope<TickerPayload>) -> Result<TickerRecord, ValidationError> {
    let exchange = require_exchange(&envelope)?;
    let p = envelope.payload;

    Ok(TickerRecord {
        exchange,
        market_code: require(p.market_code, "marketCode")?,
        trade_price: require(p.trade_price, "tradePrice")?,
        trade_volume: require(p.trade_volume, "tradeVolume")?,
        opening_price: require(p.opening_price, "openingPrice")?,
        high_price: require(p.high_price, "highPrice")?,
        low_price: require(p.low_price, "lowPrice")?,
        prev_closing_price: require(p.prev_closing_price, "prevClosingPrice")?,
        acc_trade_price_24h: require(p.acc_trade_price_24h, "accTradePrice24h")?,
        acc_trade_volume_24h: require(p.acc_trade_volume_24h, "accTradeVolume24h")?,
        timestamp: require(p.timestamp, "timestamp")?,
    })
}

/// Map a trade envelope.
///
/// `timestamp`, `tradeTimestamp` and `sequentialId` must be positive.
///
/// # Errors
///
/// Returns a [`ValidationError`] naming the offending field.
pub fn map_trade(envelope: Envelope<TradePayload>) -> Result<TradeRecord, ValidationError> {
    let exchange = require_exchange(&envelope)?;
    let p = envelope.payload;

    Ok(TradeRecord {
        exchange,
        market_code: require(p.market_code, "marketCode")?,
        timestamp: require_positive(p.timestamp, "timestamp")?,
        trade_date: require(p.trade_date, "tradeDate")?,
        trade_time: require(p.trade_time, "tradeTime")?,
        trade_timestamp: require_positive(p.trade_timestamp, "tradeTimestamp")?,
        trade_price: require(p.trade_price, "tradePrice")?,
        trade_volume: require(p.trade_volume, "tradeVolume")?,
        ask_bid: require(p.ask_bid, "askBid")?,
        prev_closing_price: require(p.prev_closing_price, "prevClosingPrice")?,
        change: require(p.change, "change")?,
        change_price: require(p.change_price, "changePrice")?,
        sequential_id: require_positive(p.sequential_id, "sequentialId")?,
        best_ask_price: require(p.best_ask_price, "bestAskPrice")?,
        best_ask_size: require(p.best_ask_size, "bestAskSize")?,
        best_bid_price: require(p.best_bid_price, "bestBidPrice")?,
        best_bid_size: require(p.best_bid_size, "bestBidSize")?,
        stream_type: require(p.stream_type, "streamType")?,
    })
}

/// Map an order book envelope.
///
/// `timestamp` must be positive and at least one unit must be present.
/// Unit order is preserved.
///
/// # Errors
///
/// Returns a [`ValidationError`] naming the offending field; unit fields
/// are reported with their index.
pub fn map_order_book(
    envelope: Envelope<OrderBookPayload>,
) -> Result<OrderBookRecord, ValidationError> {
    let exchange = require_exchange(&envelope)?;
    let p = envelope.payload;

    let market_code = require(p.market_code, "marketCode")?;
    let timestamp = require_positive(p.timestamp, "timestamp")?;
    let total_ask_size = require(p.total_ask_size, "totalAskSize")?;
    let total_bid_size = require(p.total_bid_size, "totalBidSize")?;

    let raw_units = require(p.orderbook_units, "orderbookUnits")?;
    if raw_units.is_empty() {
        return Err(ValidationError::Empty {
            field: "orderbookUnits".to_string(),
        });
    }

    let units = raw_units
        .into_iter()
        .enumerate()
        .map(|(index, unit)| map_unit(index, unit))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(OrderBookRecord {
        exchange,
        market_code,
        timestamp,
        total_ask_size,
        total_bid_size,
        units,
    })
}

fn map_unit(
    index: usize,
    unit: Option<OrderBookUnitPayload>,
) -> Result<OrderBookUnitRecord, ValidationError> {
    let prefix = format!("orderbookUnits[{index}]");
    let unit = require(unit, &prefix)?;

    Ok(OrderBookUnitRecord {
        ask_price: require(unit.ask_price, &format!("{prefix}.askPrice"))?,
        ask_size: require(unit.ask_size, &format!("{prefix}.askSize"))?,
        bid_price: require(unit.bid_price, &format!("{prefix}.bidPrice"))?,
        bid_size: require(unit.bid_size, &format!("{prefix}.bidSize"))?,
    })
}

/// Map an envelope of any supported type.
///
/// # Errors
///
/// Propagates the per-type mapper's [`ValidationError`].
pub fn map_record(envelope: Envelope<MarketPayload>) -> Result<MarketRecord, ValidationError> {
    let Envelope { metadata, payload } = envelope;
    match payload {
        MarketPayload::Ticker(payload) => map_ticker(Envelope { metadata, payload }).map(Into::into),
        MarketPayload::Trade(payload) => map_trade(Envelope { metadata, payload }).map(Into::into),
        MarketPayload::OrderBook(payload) => {
            map_order_book(Envelope { metadata, payload }).map(Into::into)
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use rust_decimal::Decimal;
    use test_case::test_case;

    use super::*;
    use crate::domain::message::Metadata;

    fn dec(value: &str) -> Option<Decimal> {
        Some(Decimal::from_str(value).unwrap())
    }

    fn metadata() -> Metadata {
        Metadata {
            message_id: Some("msg-1".to_string()),
            exchange: Some("UPBIT".to_string()),
            data_type: Some("trade".to_string()),
            collected_at: Some("2025-08-28T16:49:00.123Z".to_string()),
            version: Some("1.0".to_string()),
        }
    }

    fn trade_payload() -> TradePayload {
        TradePayload {
            market_code: Some("KRW-BTC".to_string()),
            timestamp: Some(1_672_531_200_000),
            trade_date: Some("2025-08-28".to_string()),
            trade_time: Some("16:49:00".to_string()),
            trade_timestamp: Some(1_672_531_200_000),
            trade_price: dec("70000000.00"),
            trade_volume: dec("0.01"),
            ask_bid: Some("ASK".to_string()),
            prev_closing_price: dec("70000000.00"),
            change: Some("EVEN".to_string()),
            change_price: dec("0"),
            sequential_id: Some(1000),
            best_ask_price: dec("70001000"),
            best_ask_size: dec("0.5"),
            best_bid_price: dec("69999000"),
            best_bid_size: dec("0.7"),
            stream_type: Some("SNAPSHOT".to_string()),
        }
    }

    fn order_book_payload() -> OrderBookPayload {
        let unit = |ask: &str, bid: &str| {
            Some(OrderBookUnitPayload {
                ask_price: dec(ask),
                ask_size: dec("1.0"),
                bid_price: dec(bid),
                bid_size: dec("2.0"),
            })
        };
        OrderBookPayload {
            market_code: Some("KRW-BTC".to_string()),
            timestamp: Some(1_672_531_200_000),
            total_ask_size: dec("10.5"),
            total_bid_size: dec("9.8"),
            orderbook_units: Some(vec![unit("70001000", "69999000"), unit("70002000", "69998000")]),
        }
    }

    #[test]
    fn maps_complete_trade() {
        let record = map_trade(Envelope {
            metadata: metadata(),
            payload: trade_payload(),
        })
        .unwrap();

        assert_eq!(record.exchange, "UPBIT");
        assert_eq!(record.sequential_id, 1000);
        assert_eq!(record.trade_price, Decimal::from_str("70000000.00").unwrap());
        assert_eq!(record.stream_type, "SNAPSHOT");
    }

    #[test_case(0 ; "zero")]
    #[test_case(-5 ; "negative")]
    fn rejects_non_positive_sequential_id(sequential_id: i64) {
        let mut payload = trade_payload();
        payload.sequential_id = Some(sequential_id);

        let err = map_trade(Envelope {
            metadata: metadata(),
            payload,
        })
        .unwrap_err();

        assert_eq!(
            err,
            ValidationError::NonPositive {
                field: "sequentialId".to_string(),
                value: sequential_id,
            }
        );
    }

    #[test]
    fn rejects_missing_exchange() {
        let mut meta = metadata();
        meta.exchange = None;

        let err = map_trade(Envelope {
            metadata: meta,
            payload: trade_payload(),
        })
        .unwrap_err();

        assert_eq!(err.field(), "metadata.exchange");
    }

    #[test]
    fn ticker_requires_every_field() {
        let payload = TickerPayload {
            market_code: Some("KRW-BTC".to_string()),
            trade_price: dec("1"),
            timestamp: Some(1),
            ..TickerPayload::default()
        };

        let err = map_ticker(Envelope {
            metadata: metadata(),
            payload,
        })
        .unwrap_err();

        assert_eq!(err.field(), "tradeVolume");
    }

    #[test]
    fn maps_order_book_preserving_unit_order() {
        let record = map_order_book(Envelope {
            metadata: metadata(),
            payload: order_book_payload(),
        })
        .unwrap();

        assert_eq!(record.units.len(), 2);
        assert_eq!(record.units[0].ask_price, Decimal::from_str("70001000").unwrap());
        assert_eq!(record.units[1].ask_price, Decimal::from_str("70002000").unwrap());
        assert_eq!(record.total_bid_size, Decimal::from_str("9.8").unwrap());
    }

    #[test]
    fn rejects_empty_order_book() {
        let mut payload = order_book_payload();
        payload.orderbook_units = Some(Vec::new());

        let err = map_order_book(Envelope {
            metadata: metadata(),
            payload,
        })
        .unwrap_err();

        assert_eq!(
            err,
            ValidationError::Empty {
                field: "orderbookUnits".to_string()
            }
        );
    }

    #[test]
    fn reports_unit_field_with_index() {
        let mut payload = order_book_payload();
        if let Some(units) = payload.orderbook_units.as_mut()
            && let Some(Some(unit)) = units.get_mut(1)
        {
            unit.bid_size = None;
        }

        let err = map_order_book(Envelope {
            metadata: metadata(),
            payload,
        })
        .unwrap_err();

        assert_eq!(err.field(), "orderbookUnits[1].bidSize");
    }

    #[test]
    fn reports_null_unit_by_index() {
        let mut payload = order_book_payload();
        payload.orderbook_units.as_mut().unwrap().push(None);

        let err = map_order_book(Envelope {
            metadata: metadata(),
            payload,
        })
        .unwrap_err();

        assert_eq!(err.field(), "orderbookUnits[2]");
    }

    #[test]
    fn dispatch_preserves_data_type() {
        let record = map_record(Envelope {
            metadata: metadata(),
            payload: MarketPayload::OrderBook(order_book_payload()),
        })
        .unwrap();

        assert!(matches!(record, MarketRecord::OrderBook(_)));
    }
}
