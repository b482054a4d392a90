//! Broker Adapters
//!
//! Topology declaration and the in-process broker implementing the
//! broker ports.

mod in_memory;
mod topology;

pub use in_memory::{BrokerStats, InMemoryBroker, InMemoryConsumer, QueuedMessage};
pub use topology::{Binding, BrokerTopology, Exchange, ExchangeKind, TopicPattern};
