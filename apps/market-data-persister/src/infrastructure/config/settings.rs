//! Persister Configuration Settings
//!
//! Configuration types for the persister, loaded from environment variables.
//! Unparsable numeric and boolean values fall back to their defaults; bounds
//! are validated after loading.

use std::path::PathBuf;
use std::time::Duration;

use crate::application::services::{ConsumerSettings, FailureMode, RetryPolicy};

/// Routing patterns binding the consumer queue to the topic exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingKeys {
    /// Ticker binding pattern.
    pub ticker: String,
    /// Trade binding pattern.
    pub trade: String,
    /// Order book binding pattern.
    pub orderbook: String,
}

impl Default for RoutingKeys {
    fn default() -> Self {
        Self {
            ticker: "*.ticker.#".to_string(),
            trade: "*.trade.#".to_string(),
            orderbook: "*.orderbook.#".to_string(),
        }
    }
}

impl RoutingKeys {
    /// Patterns in binding order.
    #[must_use]
    pub fn patterns(&self) -> [&str; 3] {
        [&self.ticker, &self.trade, &self.orderbook]
    }
}

/// Dead-letter destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterSettings {
    /// Dead-letter exchange (direct).
    pub exchange: String,
    /// Dead-letter queue.
    pub queue: String,
    /// Routing key used for every dead-lettered message.
    pub routing_key: String,
}

impl Default for DeadLetterSettings {
    fn default() -> Self {
        Self {
            exchange: "market-data.dlx".to_string(),
            queue: "market-data.persist.dlq".to_string(),
            routing_key: "market-data.persist.dlq".to_string(),
        }
    }
}

/// Broker names and bindings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    /// Topic exchange the collectors publish to.
    pub exchange: String,
    /// Durable consumer queue.
    pub queue: String,
    /// Binding patterns.
    pub routing_keys: RoutingKeys,
    /// Dead-letter destination.
    pub dead_letter: DeadLetterSettings,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            exchange: "market-data".to_string(),
            queue: "market-data.persist".to_string(),
            routing_keys: RoutingKeys::default(),
            dead_letter: DeadLetterSettings::default(),
        }
    }
}

/// Failure handling mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureSettings {
    /// Nack fatal failures instead of dead-lettering.
    pub legacy_nack: bool,
    /// Requeue flag used by legacy nacks.
    pub nack_requeue: bool,
}

impl Default for FailureSettings {
    fn default() -> Self {
        Self {
            legacy_nack: false,
            nack_requeue: true,
        }
    }
}

/// SQLite storage settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageSettings {
    /// Database file.
    pub database_path: PathBuf,
    /// Number of pooled connections.
    pub pool_size: usize,
    /// Lock wait imposed by SQLite on each statement.
    pub busy_timeout: Duration,
    /// Maximum wait for a free pooled connection.
    pub checkout_timeout: Duration,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("market_data.db"),
            pool_size: 4,
            busy_timeout: Duration::from_millis(5000),
            checkout_timeout: Duration::from_millis(10_000),
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// Health check and metrics HTTP port (0 = disabled).
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8083 }
    }
}

/// Complete persister configuration.
#[derive(Debug, Clone)]
pub struct PersisterConfig {
    /// Broker names and bindings.
    pub broker: BrokerSettings,
    /// Worker pool bounds.
    pub consumer: ConsumerSettings,
    /// Local retry policy.
    pub retry: RetryPolicy,
    /// Failure handling mode.
    pub failure: FailureSettings,
    /// Storage settings.
    pub storage: StorageSettings,
    /// Server port settings.
    pub server: ServerSettings,
    /// Line-delimited bodies to replay on start (`-` = stdin).
    pub replay_file: Option<PathBuf>,
}

impl Default for PersisterConfig {
    fn default() -> Self {
        Self {
            broker: BrokerSettings::default(),
            consumer: ConsumerSettings::default(),
            retry: RetryPolicy::default(),
            failure: FailureSettings::default(),
            storage: StorageSettings::default(),
            server: ServerSettings::default(),
            replay_file: None,
        }
    }
}

impl PersisterConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if a bound is violated.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if a bound is violated.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);
        let defaults = Self::default();

        let broker = BrokerSettings {
            exchange: env.string("PERSISTER_EXCHANGE", defaults.broker.exchange),
            queue: env.string("PERSISTER_QUEUE", defaults.broker.queue),
            routing_keys: RoutingKeys {
                ticker: env.string(
                    "PERSISTER_ROUTING_KEY_TICKER",
                    defaults.broker.routing_keys.ticker,
                ),
                trade: env.string(
                    "PERSISTER_ROUTING_KEY_TRADE",
                    defaults.broker.routing_keys.trade,
                ),
                orderbook: env.string(
                    "PERSISTER_ROUTING_KEY_ORDERBOOK",
                    defaults.broker.routing_keys.orderbook,
                ),
            },
            dead_letter: DeadLetterSettings {
                exchange: env.string("PERSISTER_DLQ_EXCHANGE", defaults.broker.dead_letter.exchange),
                queue: env.string("PERSISTER_DLQ_QUEUE", defaults.broker.dead_letter.queue),
                routing_key: env.string(
                    "PERSISTER_DLQ_ROUTING_KEY",
                    defaults.broker.dead_letter.routing_key,
                ),
            },
        };

        let consumer = ConsumerSettings {
            min_consumers: env.parse(
                "PERSISTER_CONCURRENT_CONSUMERS",
                defaults.consumer.min_consumers,
            ),
            max_consumers: env.parse(
                "PERSISTER_MAX_CONCURRENT_CONSUMERS",
                defaults.consumer.max_consumers,
            ),
            prefetch: env.parse("PERSISTER_PREFETCH_COUNT", defaults.consumer.prefetch),
            ..defaults.consumer
        };

        let retry = RetryPolicy {
            max_attempts: env.parse("PERSISTER_RETRY_MAX_ATTEMPTS", defaults.retry.max_attempts),
            initial_backoff: env.millis(
                "PERSISTER_RETRY_INITIAL_BACKOFF_MS",
                defaults.retry.initial_backoff,
            ),
            max_backoff: env.millis("PERSISTER_RETRY_MAX_BACKOFF_MS", defaults.retry.max_backoff),
            ..defaults.retry
        };

        let failure = FailureSettings {
            legacy_nack: env.flag("PERSISTER_LEGACY_NACK", defaults.failure.legacy_nack),
            nack_requeue: env.flag("PERSISTER_NACK_REQUEUE", defaults.failure.nack_requeue),
        };

        let storage = StorageSettings {
            database_path: env
                .value("PERSISTER_DATABASE_PATH")
                .map_or(defaults.storage.database_path, PathBuf::from),
            pool_size: env.parse("PERSISTER_DB_POOL_SIZE", defaults.storage.pool_size),
            busy_timeout: env.millis(
                "PERSISTER_DB_BUSY_TIMEOUT_MS",
                defaults.storage.busy_timeout,
            ),
            checkout_timeout: env.millis(
                "PERSISTER_DB_CHECKOUT_TIMEOUT_MS",
                defaults.storage.checkout_timeout,
            ),
        };

        let server = ServerSettings {
            health_port: env.parse("PERSISTER_HEALTH_PORT", defaults.server.health_port),
        };

        let config = Self {
            broker,
            consumer,
            retry,
            failure,
            storage,
            server,
            replay_file: env.value("PERSISTER_REPLAY_FILE").map(PathBuf::from),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check bounds.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first violated bound.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.consumer.min_consumers < 1 {
            return Err(ConfigError::invalid(
                "PERSISTER_CONCURRENT_CONSUMERS",
                "must be at least 1",
            ));
        }
        if self.consumer.max_consumers < self.consumer.min_consumers {
            return Err(ConfigError::invalid(
                "PERSISTER_MAX_CONCURRENT_CONSUMERS",
                "must not be below PERSISTER_CONCURRENT_CONSUMERS",
            ));
        }
        if self.consumer.prefetch < 1 {
            return Err(ConfigError::invalid(
                "PERSISTER_PREFETCH_COUNT",
                "must be at least 1",
            ));
        }
        if self.retry.max_attempts < 1 {
            return Err(ConfigError::invalid(
                "PERSISTER_RETRY_MAX_ATTEMPTS",
                "must be at least 1",
            ));
        }
        if self.storage.pool_size < 1 {
            return Err(ConfigError::invalid(
                "PERSISTER_DB_POOL_SIZE",
                "must be at least 1",
            ));
        }
        Ok(())
    }

    /// Failure mode derived from the legacy flags and dead-letter settings.
    #[must_use]
    pub fn failure_mode(&self) -> FailureMode {
        if self.failure.legacy_nack {
            FailureMode::Nack {
                requeue: self.failure.nack_requeue,
            }
        } else {
            FailureMode::DeadLetter {
                exchange: self.broker.dead_letter.exchange.clone(),
                routing_key: self.broker.dead_letter.routing_key.clone(),
            }
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A value is outside its allowed range.
    #[error("invalid value for {key}: {reason}")]
    Invalid {
        /// Environment variable.
        key: String,
        /// Violated bound.
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &str, reason: &str) -> Self {
        Self::Invalid {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }
}

// =============================================================================
// Variable parsing
// =============================================================================

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn value(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, default: String) -> String {
        self.value(key).unwrap_or(default)
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.value(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    fn millis(&self, key: &str, default: Duration) -> Duration {
        self.value(key)
            .and_then(|v| v.parse::<u64>().ok())
            .map_or(default, Duration::from_millis)
    }

    fn flag(&self, key: &str, default: bool) -> bool {
        match self.value(key).map(|v| v.to_lowercase()).as_deref() {
            Some("true" | "1" | "yes" | "on") => true,
            Some("false" | "0" | "no" | "off") => false,
            _ => default,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<PersisterConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        PersisterConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_without_variables() {
        let config = load(&[]).unwrap();

        assert_eq!(config.broker.exchange, "market-data");
        assert_eq!(config.broker.queue, "market-data.persist");
        assert_eq!(
            config.broker.routing_keys.patterns(),
            ["*.ticker.#", "*.trade.#", "*.orderbook.#"]
        );
        assert_eq!(config.broker.dead_letter.exchange, "market-data.dlx");
        assert_eq!(config.broker.dead_letter.routing_key, "market-data.persist.dlq");
        assert_eq!(config.consumer.min_consumers, 2);
        assert_eq!(config.consumer.max_consumers, 4);
        assert_eq!(config.consumer.prefetch, 50);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.storage.pool_size, 4);
        assert_eq!(config.server.health_port, 8083);
        assert!(config.replay_file.is_none());
    }

    #[test]
    fn reads_overrides() {
        let config = load(&[
            ("PERSISTER_EXCHANGE", "md"),
            ("PERSISTER_PREFETCH_COUNT", "10"),
            ("PERSISTER_RETRY_MAX_ATTEMPTS", "5"),
            ("PERSISTER_RETRY_INITIAL_BACKOFF_MS", "25"),
            ("PERSISTER_DATABASE_PATH", "/tmp/md.db"),
            ("PERSISTER_REPLAY_FILE", "-"),
        ])
        .unwrap();

        assert_eq!(config.broker.exchange, "md");
        assert_eq!(config.consumer.prefetch, 10);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_backoff, Duration::from_millis(25));
        assert_eq!(config.storage.database_path, PathBuf::from("/tmp/md.db"));
        assert_eq!(config.replay_file, Some(PathBuf::from("-")));
    }

    #[test]
    fn unparsable_numbers_fall_back_to_defaults() {
        let config = load(&[("PERSISTER_PREFETCH_COUNT", "lots")]).unwrap();
        assert_eq!(config.consumer.prefetch, 50);
    }

    #[test]
    fn rejects_max_below_min() {
        let err = load(&[
            ("PERSISTER_CONCURRENT_CONSUMERS", "5"),
            ("PERSISTER_MAX_CONCURRENT_CONSUMERS", "3"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("PERSISTER_MAX_CONCURRENT_CONSUMERS"));
    }

    #[test]
    fn rejects_zero_retry_attempts() {
        assert!(load(&[("PERSISTER_RETRY_MAX_ATTEMPTS", "0")]).is_err());
    }

    #[test]
    fn failure_mode_follows_legacy_flag() {
        let dead_letter = load(&[]).unwrap().failure_mode();
        assert!(matches!(dead_letter, FailureMode::DeadLetter { .. }));

        let legacy = load(&[
            ("PERSISTER_LEGACY_NACK", "TRUE"),
            ("PERSISTER_NACK_REQUEUE", "false"),
        ])
        .unwrap()
        .failure_mode();
        assert_eq!(legacy, FailureMode::Nack { requeue: false });
    }
}
