//! Persisted Record Types
//!
//! Validated, storage-ready records produced by the mappers. Each record
//! exposes its natural key, the tuple the storage layer enforces
//! uniqueness on.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::message::DataType;

// =============================================================================
// Records
// =============================================================================

/// Validated ticker snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct TickerRecord {
    pub exchange: String,
    pub market_code: String,
    pub trade_price: Decimal,
    pub trade_volume: Decimal,
    pub opening_price: Decimal,
    pub high_price: Decimal,
    pub low_price: Decimal,
    pub prev_closing_price: Decimal,
    pub acc_trade_price_24h: Decimal,
    pub acc_trade_volume_24h: Decimal,
    pub timestamp: i64,
}

/// Validated trade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct TradeRecord {
    pub exchange: String,
    pub market_code: String,
    pub timestamp: i64,
    pub trade_date: String,
    pub trade_time: String,
    pub trade_timestamp: i64,
    pub trade_price: Decimal,
    pub trade_volume: Decimal,
    pub ask_bid: String,
    pub prev_closing_price: Decimal,
    pub change: String,
    pub change_price: Decimal,
    pub sequential_id: i64,
    pub best_ask_price: Decimal,
    pub best_ask_size: Decimal,
    pub best_bid_price: Decimal,
    pub best_bid_size: Decimal,
    pub stream_type: String,
}

/// One validated order book level. Its index is its position in the
/// owning [`OrderBookRecord::units`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct OrderBookUnitRecord {
    pub ask_price: Decimal,
    pub ask_size: Decimal,
    pub bid_price: Decimal,
    pub bid_size: Decimal,
}

/// Validated order book snapshot with its ordered units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct OrderBookRecord {
    pub exchange: String,
    pub market_code: String,
    pub timestamp: i64,
    pub total_ask_size: Decimal,
    pub total_bid_size: Decimal,
    pub units: Vec<OrderBookUnitRecord>,
}

/// Any record ready for persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarketRecord {
    /// Ticker record.
    Ticker(TickerRecord),
    /// Trade record.
    Trade(TradeRecord),
    /// Order book record.
    OrderBook(OrderBookRecord),
}

impl MarketRecord {
    /// Data type of this record.
    #[must_use]
    pub const fn data_type(&self) -> DataType {
        match self {
            Self::Ticker(_) => DataType::Ticker,
            Self::Trade(_) => DataType::Trade,
            Self::OrderBook(_) => DataType::OrderBook,
        }
    }

    /// Natural key the storage layer deduplicates on.
    #[must_use]
    pub fn natural_key(&self) -> NaturalKey {
        match self {
            Self::Ticker(r) => NaturalKey::Ticker {
                exchange: r.exchange.clone(),
                market_code: r.market_code.clone(),
                timestamp: r.timestamp,
            },
            Self::Trade(r) => NaturalKey::Trade {
                exchange: r.exchange.clone(),
                market_code: r.market_code.clone(),
                sequential_id: r.sequential_id,
            },
            Self::OrderBook(r) => NaturalKey::OrderBook {
                exchange: r.exchange.clone(),
                market_code: r.market_code.clone(),
                timestamp: r.timestamp,
            },
        }
    }
}

impl From<TickerRecord> for MarketRecord {
    fn from(record: TickerRecord) -> Self {
        Self::Ticker(record)
    }
}

impl From<TradeRecord> for MarketRecord {
    fn from(record: TradeRecord) -> Self {
        Self::Trade(record)
    }
}

impl From<OrderBookRecord> for MarketRecord {
    fn from(record: OrderBookRecord) -> Self {
        Self::OrderBook(record)
    }
}

// =============================================================================
// Natural Key
// =============================================================================

/// Uniqueness tuple per data type.
///
/// Ticker and order book snapshots are unique per
/// `(exchange, market, timestamp)`; trades per `(exchange, market, sequential id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum NaturalKey {
    Ticker {
        exchange: String,
        market_code: String,
        timestamp: i64,
    },
    Trade {
        exchange: String,
        market_code: String,
        sequential_id: i64,
    },
    OrderBook {
        exchange: String,
        market_code: String,
        timestamp: i64,
    },
}

impl NaturalKey {
    /// Data type the key belongs to.
    #[must_use]
    pub const fn data_type(&self) -> DataType {
        match self {
            Self::Ticker { .. } => DataType::Ticker,
            Self::Trade { .. } => DataType::Trade,
            Self::OrderBook { .. } => DataType::OrderBook,
        }
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ticker {
                exchange,
                market_code,
                timestamp,
            }
            | Self::OrderBook {
                exchange,
                market_code,
                timestamp,
            } => write!(
                f,
                "{}({exchange}, {market_code}, ts={timestamp})",
                self.data_type()
            ),
            Self::Trade {
                exchange,
                market_code,
                sequential_id,
            } => write!(f, "trade({exchange}, {market_code}, seq={sequential_id})"),
        }
    }
}

// =============================================================================
// Persist Receipt
// =============================================================================

/// Returned by the storage layer for a newly inserted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistReceipt {
    /// Surrogate identifier assigned by storage.
    pub id: i64,
    /// Load timestamp stamped on the row.
    pub loaded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order_book(timestamp: i64) -> OrderBookRecord {
        OrderBookRecord {
            exchange: "UPBIT".to_string(),
            market_code: "KRW-BTC".to_string(),
            timestamp,
            total_ask_size: Decimal::new(105, 1),
            total_bid_size: Decimal::new(98, 1),
            units: Vec::new(),
        }
    }

    #[test]
    fn natural_key_ignores_non_key_fields() {
        let a = order_book(1_672_531_200_000);
        let mut b = a.clone();
        b.total_ask_size = Decimal::ONE;

        assert_eq!(
            MarketRecord::from(a).natural_key(),
            MarketRecord::from(b).natural_key()
        );
    }

    #[test]
    fn natural_key_display_names_the_tuple() {
        let key = MarketRecord::from(order_book(42)).natural_key();
        assert_eq!(key.to_string(), "orderbook(UPBIT, KRW-BTC, ts=42)");
    }
}
