//! In-Memory Market Data Repository
//!
//! Enforces the same natural-key uniqueness as the SQLite adapter, with
//! injectable failures for exercising retry and dead-letter paths.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use crate::application::ports::{MarketDataRepository, StorageError};
use crate::domain::message::DataType;
use crate::domain::record::{MarketRecord, NaturalKey, PersistReceipt};

#[derive(Debug, Default)]
struct State {
    keys: HashMap<NaturalKey, i64>,
    records: Vec<MarketRecord>,
    pending_failures: VecDeque<StorageError>,
    calls: u64,
}

/// Repository that keeps records in memory.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    state: Mutex<State>,
}

impl InMemoryRepository {
    /// Create an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next calls with these errors, in order, before storing
    /// anything.
    pub fn inject_failures(&self, failures: impl IntoIterator<Item = StorageError>) {
        self.state.lock().pending_failures.extend(failures);
    }

    /// Fail the next `count` calls with a storage timeout.
    pub fn fail_next_with_timeouts(&self, count: usize) {
        self.inject_failures((0..count).map(|_| StorageError::Timeout {
            operation: "injected".to_string(),
        }));
    }

    /// Stored records, in insertion order.
    #[must_use]
    pub fn records(&self) -> Vec<MarketRecord> {
        self.state.lock().records.clone()
    }

    /// Number of stored records of one data type.
    #[must_use]
    pub fn count(&self, data_type: DataType) -> usize {
        self.state
            .lock()
            .records
            .iter()
            .filter(|r| r.data_type() == data_type)
            .count()
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    /// Whether nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls to `persist`, failed ones included.
    #[must_use]
    pub fn persist_calls(&self) -> u64 {
        self.state.lock().calls
    }
}

#[async_trait]
impl MarketDataRepository for InMemoryRepository {
    async fn persist(&self, record: &MarketRecord) -> Result<PersistReceipt, StorageError> {
        let mut state = self.state.lock();
        state.calls += 1;

        if let Some(failure) = state.pending_failures.pop_front() {
            return Err(failure);
        }

        let key = record.natural_key();
        if state.keys.contains_key(&key) {
            return Err(StorageError::Duplicate {
                key: key.to_string(),
            });
        }

        let id = i64::try_from(state.records.len()).unwrap_or(i64::MAX) + 1;
        state.keys.insert(key, id);
        state.records.push(record.clone());
        Ok(PersistReceipt {
            id,
            loaded_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::*;
    use crate::domain::record::OrderBookRecord;

    fn order_book(timestamp: i64) -> MarketRecord {
        MarketRecord::OrderBook(OrderBookRecord {
            exchange: "UPBIT".to_string(),
            market_code: "KRW-ETH".to_string(),
            timestamp,
            total_ask_size: Decimal::ONE,
            total_bid_size: Decimal::ONE,
            units: Vec::new(),
        })
    }

    #[tokio::test]
    async fn rejects_duplicate_natural_key() {
        let repo = InMemoryRepository::new();

        repo.persist(&order_book(1)).await.unwrap();
        let err = repo.persist(&order_book(1)).await.unwrap_err();

        assert!(err.is_duplicate());
        assert_eq!(repo.count(DataType::OrderBook), 1);
        assert_eq!(repo.persist_calls(), 2);
    }

    #[tokio::test]
    async fn injected_failures_come_first() {
        let repo = InMemoryRepository::new();
        repo.fail_next_with_timeouts(2);

        assert!(matches!(
            repo.persist(&order_book(1)).await,
            Err(StorageError::Timeout { .. })
        ));
        assert!(repo.persist(&order_book(1)).await.is_err());
        assert_eq!(repo.persist(&order_book(1)).await.unwrap().id, 1);
        assert_eq!(repo.len(), 1);
    }
}
