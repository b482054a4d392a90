//! Persistence Adapters
//!
//! Implementations of [`MarketDataRepository`](crate::application::ports::MarketDataRepository).
//!
//! - `sqlite`: Pooled SQLite storage with uniqueness constraints on natural keys
//! - `in_memory`: In-process storage with failure injection

mod in_memory;
mod pool;
mod sqlite;

pub use in_memory::InMemoryRepository;
pub use pool::ConnectionPool;
pub use sqlite::SqliteRepository;
