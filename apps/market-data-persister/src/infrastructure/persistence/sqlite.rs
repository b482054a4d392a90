//! SQLite Market Data Repository
//!
//! Stores each record in one immediate transaction. Natural keys carry
//! `UNIQUE` constraints, so a redelivered event fails the insert and is
//! reported as [`StorageError::Duplicate`]. Order book units live in a
//! child table keyed by `(orderbook_id, unit_index)` and are removed only
//! by cascade from their parent.
//!
//! Decimals are stored as TEXT to keep their exact scale.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, ErrorCode, Transaction, TransactionBehavior, params};
use rust_decimal::Decimal;
use tracing::{debug, info};

use super::pool::ConnectionPool;
use crate::application::ports::{MarketDataRepository, StorageError};
use crate::domain::message::DataType;
use crate::domain::record::{
    MarketRecord, NaturalKey, OrderBookRecord, OrderBookUnitRecord, PersistReceipt, TickerRecord,
    TradeRecord,
};
use crate::infrastructure::config::StorageSettings;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS ticker (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    exchange TEXT NOT NULL,
    market_code TEXT NOT NULL,
    trade_price TEXT NOT NULL,
    trade_volume TEXT NOT NULL,
    opening_price TEXT NOT NULL,
    high_price TEXT NOT NULL,
    low_price TEXT NOT NULL,
    prev_closing_price TEXT NOT NULL,
    acc_trade_price_24h TEXT NOT NULL,
    acc_trade_volume_24h TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (exchange, market_code, timestamp)
);

CREATE TABLE IF NOT EXISTS trade (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    exchange TEXT NOT NULL,
    market_code TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    trade_date TEXT NOT NULL,
    trade_time TEXT NOT NULL,
    trade_timestamp INTEGER NOT NULL,
    trade_price TEXT NOT NULL,
    trade_volume TEXT NOT NULL,
    ask_bid TEXT NOT NULL,
    prev_closing_price TEXT NOT NULL,
    "change" TEXT NOT NULL,
    change_price TEXT NOT NULL,
    sequential_id INTEGER NOT NULL,
    best_ask_price TEXT NOT NULL,
    best_ask_size TEXT NOT NULL,
    best_bid_price TEXT NOT NULL,
    best_bid_size TEXT NOT NULL,
    stream_type TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (exchange, market_code, sequential_id)
);

CREATE TABLE IF NOT EXISTS orderbook (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    exchange TEXT NOT NULL,
    market_code TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    total_ask_size TEXT NOT NULL,
    total_bid_size TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (exchange, market_code, timestamp)
);

CREATE TABLE IF NOT EXISTS orderbook_unit (
    orderbook_id INTEGER NOT NULL REFERENCES orderbook(id) ON DELETE CASCADE,
    unit_index INTEGER NOT NULL,
    ask_price TEXT NOT NULL,
    ask_size TEXT NOT NULL,
    bid_price TEXT NOT NULL,
    bid_size TEXT NOT NULL,
    PRIMARY KEY (orderbook_id, unit_index)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_ticker_market_ts ON ticker(market_code, timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_trade_market_ts ON trade(market_code, trade_timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_orderbook_market_ts ON orderbook(market_code, timestamp DESC);
"#;

/// Market data repository backed by a pooled SQLite database.
#[derive(Debug)]
pub struct SqliteRepository {
    pool: ConnectionPool,
}

impl SqliteRepository {
    /// Open the database described by `settings` and create the schema.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the database cannot be opened or the
    /// schema cannot be applied.
    pub async fn open(settings: &StorageSettings) -> Result<Self, StorageError> {
        let pool = ConnectionPool::open(
            &settings.database_path,
            settings.pool_size,
            settings.busy_timeout,
            settings.checkout_timeout,
        )?;
        pool.run("create schema", |conn| {
            conn.execute_batch(SCHEMA_SQL)
                .map_err(|e| driver_error(e, "create schema", None))
        })
        .await?;

        info!(
            path = %settings.database_path.display(),
            pool_size = settings.pool_size,
            "SQLite repository ready"
        );
        Ok(Self { pool })
    }

    /// Open a database at `path` with default pool settings.
    ///
    /// # Errors
    ///
    /// See [`SqliteRepository::open`].
    pub async fn open_path(path: &Path) -> Result<Self, StorageError> {
        Self::open(&StorageSettings {
            database_path: path.to_path_buf(),
            ..StorageSettings::default()
        })
        .await
    }

    /// Number of stored records of one data type.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the query fails.
    pub async fn count(&self, data_type: DataType) -> Result<u64, StorageError> {
        let table = table_name(data_type);
        self.pool
            .run("count", move |conn| {
                conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                    row.get::<_, i64>(0)
                })
                .map(|n| u64::try_from(n).unwrap_or(0))
                .map_err(|e| driver_error(e, "count", None))
            })
            .await
    }

    /// Units of a stored order book, in index order.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the query fails or a stored decimal
    /// cannot be read back.
    pub async fn order_book_units(
        &self,
        order_book_id: i64,
    ) -> Result<Vec<OrderBookUnitRecord>, StorageError> {
        self.pool
            .run("load orderbook units", move |conn| {
                load_units(conn, order_book_id)
            })
            .await
    }

    pub(crate) const fn pool(&self) -> &ConnectionPool {
        &self.pool
    }
}

#[async_trait]
impl MarketDataRepository for SqliteRepository {
    async fn persist(&self, record: &MarketRecord) -> Result<PersistReceipt, StorageError> {
        let record = record.clone();
        let operation = format!("insert {}", record.data_type());
        let label = operation.clone();
        self.pool
            .run(&label, move |conn| insert(conn, &record, &operation))
            .await
    }
}

// =============================================================================
// Writes
// =============================================================================

fn insert(
    conn: &mut Connection,
    record: &MarketRecord,
    operation: &str,
) -> Result<PersistReceipt, StorageError> {
    let key = record.natural_key();
    let loaded_at = Utc::now();
    let created_at = loaded_at.to_rfc3339_opts(SecondsFormat::Millis, true);

    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| driver_error(e, operation, Some(&key)))?;
    let id = match record {
        MarketRecord::Ticker(r) => insert_ticker(&tx, r, &created_at),
        MarketRecord::Trade(r) => insert_trade(&tx, r, &created_at),
        MarketRecord::OrderBook(r) => insert_order_book(&tx, r, &created_at),
    }
    .map_err(|e| driver_error(e, operation, Some(&key)))?;
    tx.commit()
        .map_err(|e| driver_error(e, operation, Some(&key)))?;

    debug!(id, key = %key, "Record stored");
    Ok(PersistReceipt { id, loaded_at })
}

fn insert_ticker(tx: &Transaction<'_>, r: &TickerRecord, created_at: &str) -> rusqlite::Result<i64> {
    tx.execute(
        "INSERT INTO ticker (exchange, market_code, trade_price, trade_volume, opening_price,
             high_price, low_price, prev_closing_price, acc_trade_price_24h,
             acc_trade_volume_24h, timestamp, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            r.exchange,
            r.market_code,
            r.trade_price.to_string(),
            r.trade_volume.to_string(),
            r.opening_price.to_string(),
            r.high_price.to_string(),
            r.low_price.to_string(),
            r.prev_closing_price.to_string(),
            r.acc_trade_price_24h.to_string(),
            r.acc_trade_volume_24h.to_string(),
            r.timestamp,
            created_at,
        ],
    )?;
    Ok(tx.last_insert_rowid())
}

fn insert_trade(tx: &Transaction<'_>, r: &TradeRecord, created_at: &str) -> rusqlite::Result<i64> {
    tx.execute(
        r#"INSERT INTO trade (exchange, market_code, timestamp, trade_date, trade_time,
             trade_timestamp, trade_price, trade_volume, ask_bid, prev_closing_price, "change",
             change_price, sequential_id, best_ask_price, best_ask_size, best_bid_price,
             best_bid_size, stream_type, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)"#,
        params![
            r.exchange,
            r.market_code,
            r.timestamp,
            r.trade_date,
            r.trade_time,
            r.trade_timestamp,
            r.trade_price.to_string(),
            r.trade_volume.to_string(),
            r.ask_bid,
            r.prev_closing_price.to_string(),
            r.change,
            r.change_price.to_string(),
            r.sequential_id,
            r.best_ask_price.to_string(),
            r.best_ask_size.to_string(),
            r.best_bid_price.to_string(),
            r.best_bid_size.to_string(),
            r.stream_type,
            created_at,
        ],
    )?;
    Ok(tx.last_insert_rowid())
}

fn insert_order_book(
    tx: &Transaction<'_>,
    r: &OrderBookRecord,
    created_at: &str,
) -> rusqlite::Result<i64> {
    tx.execute(
        "INSERT INTO orderbook (exchange, market_code, timestamp, total_ask_size,
             total_bid_size, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            r.exchange,
            r.market_code,
            r.timestamp,
            r.total_ask_size.to_string(),
            r.total_bid_size.to_string(),
            created_at,
        ],
    )?;
    let id = tx.last_insert_rowid();

    let mut stmt = tx.prepare_cached(
        "INSERT INTO orderbook_unit (orderbook_id, unit_index, ask_price, ask_size,
             bid_price, bid_size)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    for (index, unit) in r.units.iter().enumerate() {
        stmt.execute(params![
            id,
            i64::try_from(index).unwrap_or(i64::MAX),
            unit.ask_price.to_string(),
            unit.ask_size.to_string(),
            unit.bid_price.to_string(),
            unit.bid_size.to_string(),
        ])?;
    }
    Ok(id)
}

// =============================================================================
// Reads
// =============================================================================

fn load_units(conn: &Connection, order_book_id: i64) -> Result<Vec<OrderBookUnitRecord>, StorageError> {
    let operation = "load orderbook units";
    let mut stmt = conn
        .prepare_cached(
            "SELECT ask_price, ask_size, bid_price, bid_size
             FROM orderbook_unit WHERE orderbook_id = ?1 ORDER BY unit_index",
        )
        .map_err(|e| driver_error(e, operation, None))?;
    let rows = stmt
        .query_map(params![order_book_id], |row| {
            Ok([
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ])
        })
        .map_err(|e| driver_error(e, operation, None))?;

    let mut units = Vec::new();
    for row in rows {
        let [ask_price, ask_size, bid_price, bid_size] =
            row.map_err(|e| driver_error(e, operation, None))?;
        units.push(OrderBookUnitRecord {
            ask_price: stored_decimal(&ask_price)?,
            ask_size: stored_decimal(&ask_size)?,
            bid_price: stored_decimal(&bid_price)?,
            bid_size: stored_decimal(&bid_size)?,
        });
    }
    Ok(units)
}

fn stored_decimal(text: &str) -> Result<Decimal, StorageError> {
    Decimal::from_str(text).map_err(|e| StorageError::Unavailable {
        message: format!("stored decimal {text:?} is unreadable"),
        source: Some(Box::new(e)),
    })
}

const fn table_name(data_type: DataType) -> &'static str {
    match data_type {
        DataType::Ticker => "ticker",
        DataType::Trade => "trade",
        DataType::OrderBook => "orderbook",
    }
}

// =============================================================================
// Error Mapping
// =============================================================================

/// Normalize a driver error. Uniqueness violations become duplicates,
/// lock waits become timeouts, everything else is unavailable.
fn driver_error(err: rusqlite::Error, operation: &str, key: Option<&NaturalKey>) -> StorageError {
    if let rusqlite::Error::SqliteFailure(failure, _) = &err {
        let unique_violation = matches!(
            failure.extended_code,
            rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
        );
        if unique_violation && let Some(key) = key {
            return StorageError::Duplicate {
                key: key.to_string(),
            };
        }
        if matches!(
            failure.code,
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
        ) {
            return StorageError::Timeout {
                operation: operation.to_string(),
            };
        }
    }
    StorageError::Unavailable {
        message: format!("{operation} failed"),
        source: Some(Box::new(err)),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    async fn repository() -> (tempfile::TempDir, SqliteRepository) {
        let dir = tempfile::tempdir().unwrap();
        let repo = SqliteRepository::open_path(&dir.path().join("md.db"))
            .await
            .unwrap();
        (dir, repo)
    }

    fn ticker(timestamp: i64) -> MarketRecord {
        MarketRecord::Ticker(TickerRecord {
            exchange: "UPBIT".to_string(),
            market_code: "KRW-BTC".to_string(),
            trade_price: Decimal::new(5_000_000_012, 2),
            trade_volume: Decimal::new(15, 2),
            opening_price: Decimal::new(49_000_000, 0),
            high_price: Decimal::new(51_000_000, 0),
            low_price: Decimal::new(48_500_000, 0),
            prev_closing_price: Decimal::new(49_500_000, 0),
            acc_trade_price_24h: Decimal::new(123_456_789, 1),
            acc_trade_volume_24h: Decimal::new(2_468, 3),
            timestamp,
        })
    }

    fn order_book(timestamp: i64, levels: usize) -> MarketRecord {
        MarketRecord::OrderBook(OrderBookRecord {
            exchange: "UPBIT".to_string(),
            market_code: "KRW-BTC".to_string(),
            timestamp,
            total_ask_size: Decimal::new(105, 1),
            total_bid_size: Decimal::new(98, 1),
            units: (0..levels)
                .map(|i| OrderBookUnitRecord {
                    ask_price: Decimal::from(50_000_100 + i64::try_from(i).unwrap()),
                    ask_size: Decimal::new(5, 1),
                    bid_price: Decimal::from(49_999_900 - i64::try_from(i).unwrap()),
                    bid_size: Decimal::new(25, 2),
                })
                .collect(),
        })
    }

    fn trade(sequential_id: i64, timestamp: i64) -> MarketRecord {
        MarketRecord::Trade(TradeRecord {
            exchange: "UPBIT".to_string(),
            market_code: "KRW-BTC".to_string(),
            timestamp,
            trade_date: "2025-08-28".to_string(),
            trade_time: "16:49:00".to_string(),
            trade_timestamp: timestamp,
            trade_price: Decimal::new(7_000_000_000, 2),
            trade_volume: Decimal::new(1, 2),
            ask_bid: "ASK".to_string(),
            prev_closing_price: Decimal::new(69_500_000, 0),
            change: "RISE".to_string(),
            change_price: Decimal::new(500_000, 0),
            sequential_id,
            best_ask_price: Decimal::new(70_001_000, 0),
            best_ask_size: Decimal::new(5, 1),
            best_bid_price: Decimal::new(69_999_000, 0),
            best_bid_size: Decimal::new(7, 1),
            stream_type: "REALTIME".to_string(),
        })
    }

    async fn stored_text(repo: &SqliteRepository, sql: &'static str, id: i64) -> Vec<String> {
        repo.pool()
            .run("read back", move |conn| {
                conn.query_row(sql, params![id], |row| {
                    (0..row.as_ref().column_count())
                        .map(|i| row.get::<_, String>(i))
                        .collect::<rusqlite::Result<Vec<_>>>()
                })
                .map_err(|e| driver_error(e, "read back", None))
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn second_insert_of_same_key_is_duplicate() {
        let (_dir, repo) = repository().await;

        repo.persist(&ticker(1_700_000_000_000)).await.unwrap();
        let err = repo.persist(&ticker(1_700_000_000_000)).await.unwrap_err();

        assert!(err.is_duplicate(), "{err}");
        assert!(err.to_string().contains("ticker(UPBIT, KRW-BTC"));
        assert_eq!(repo.count(DataType::Ticker).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn order_book_units_keep_their_order() {
        let (_dir, repo) = repository().await;
        let record = order_book(1_700_000_000_000, 3);

        let receipt = repo.persist(&record).await.unwrap();
        let units = repo.order_book_units(receipt.id).await.unwrap();

        let MarketRecord::OrderBook(expected) = record else {
            unreachable!()
        };
        assert_eq!(units, expected.units);
    }

    #[tokio::test]
    async fn duplicate_order_book_writes_no_units() {
        let (_dir, repo) = repository().await;

        let first = repo.persist(&order_book(42, 2)).await.unwrap();
        let err = repo.persist(&order_book(42, 5)).await.unwrap_err();

        assert!(err.is_duplicate());
        assert_eq!(repo.order_book_units(first.id).await.unwrap().len(), 2);
        let total: i64 = repo
            .pool()
            .run("count units", |conn| {
                conn.query_row("SELECT COUNT(*) FROM orderbook_unit", [], |row| row.get(0))
                    .map_err(|e| driver_error(e, "count units", None))
            })
            .await
            .unwrap();
        assert_eq!(total, 2);
    }

    #[tokio::test]
    async fn deleting_order_book_cascades_to_units() {
        let (_dir, repo) = repository().await;
        let receipt = repo.persist(&order_book(7, 4)).await.unwrap();

        let id = receipt.id;
        repo.pool()
            .run("delete orderbook", move |conn| {
                conn.execute("DELETE FROM orderbook WHERE id = ?1", params![id])
                    .map_err(|e| driver_error(e, "delete orderbook", None))
            })
            .await
            .unwrap();

        assert!(repo.order_book_units(receipt.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_duplicates_store_one_row() {
        let (_dir, repo) = repository().await;
        let repo = Arc::new(repo);

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let repo = Arc::clone(&repo);
            tasks.push(tokio::spawn(async move {
                repo.persist(&ticker(99)).await
            }));
        }

        let mut stored = 0;
        let mut duplicates = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => stored += 1,
                Err(err) if err.is_duplicate() => duplicates += 1,
                Err(err) => panic!("unexpected error: {err}"),
            }
        }
        assert_eq!(stored, 1);
        assert_eq!(duplicates, 7);
        assert_eq!(repo.count(DataType::Ticker).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn receipt_carries_load_timestamp() {
        let (_dir, repo) = repository().await;
        let before = Utc::now();

        let receipt = repo.persist(&ticker(1)).await.unwrap();

        assert!(receipt.loaded_at >= before);
        assert!(receipt.id > 0);
    }

    #[tokio::test]
    async fn trade_is_keyed_by_sequential_id() {
        let (_dir, repo) = repository().await;

        let first = repo.persist(&trade(5, 100)).await.unwrap();
        let err = repo.persist(&trade(5, 200)).await.unwrap_err();
        repo.persist(&trade(6, 100)).await.unwrap();

        assert!(err.is_duplicate(), "{err}");
        assert!(err.to_string().contains("seq=5"), "{err}");
        assert_eq!(repo.count(DataType::Trade).await.unwrap(), 2);

        let row = stored_text(
            &repo,
            r#"SELECT ask_bid, "change", stream_type, trade_price, best_bid_size
               FROM trade WHERE id = ?1"#,
            first.id,
        )
        .await;
        assert_eq!(row, ["ASK", "RISE", "REALTIME", "70000000.00", "0.7"]);
    }

    #[tokio::test]
    async fn decimals_are_stored_with_every_digit() {
        let (_dir, repo) = repository().await;
        let MarketRecord::Ticker(mut record) = ticker(1) else {
            unreachable!()
        };
        record.acc_trade_price_24h = Decimal::from_str("264409186318.2085412345").unwrap();
        record.acc_trade_volume_24h = Decimal::from_str("3803.836174361234567").unwrap();

        let receipt = repo.persist(&MarketRecord::Ticker(record)).await.unwrap();

        let row = stored_text(
            &repo,
            "SELECT acc_trade_price_24h, acc_trade_volume_24h FROM ticker WHERE id = ?1",
            receipt.id,
        )
        .await;
        assert_eq!(row, ["264409186318.2085412345", "3803.836174361234567"]);
    }
}
