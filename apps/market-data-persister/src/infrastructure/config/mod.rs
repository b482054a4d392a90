//! Configuration Module
//!
//! Configuration loading for the persister service.

mod settings;

pub use settings::{
    BrokerSettings, ConfigError, DeadLetterSettings, FailureSettings, PersisterConfig,
    RoutingKeys, ServerSettings, StorageSettings,
};
