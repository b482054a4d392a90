//! Broker Topology
//!
//! Exchanges, queues and bindings declared for the persister: one durable
//! queue bound to a topic exchange by three patterns, plus a direct
//! dead-letter exchange bound to the dead-letter queue.
//!
//! Topic patterns use AMQP semantics over dot-separated words: `*`
//! matches exactly one word, `#` matches zero or more.

use std::fmt;

use crate::application::ports::BrokerError;
use crate::infrastructure::config::BrokerSettings;

// =============================================================================
// Topic Pattern
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Word(String),
    Star,
    Hash,
}

/// Parsed topic binding pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    source: String,
    segments: Vec<Segment>,
}

impl TopicPattern {
    /// Parse a pattern such as `*.ticker.#`.
    #[must_use]
    pub fn new(pattern: &str) -> Self {
        let segments = pattern
            .split('.')
            .map(|word| match word {
                "*" => Segment::Star,
                "#" => Segment::Hash,
                other => Segment::Word(other.to_string()),
            })
            .collect();
        Self {
            source: pattern.to_string(),
            segments,
        }
    }

    /// Pattern text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether `routing_key` matches this pattern.
    #[must_use]
    pub fn matches(&self, routing_key: &str) -> bool {
        let words: Vec<&str> = routing_key.split('.').collect();
        match_words(&self.segments, &words)
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn match_words(segments: &[Segment], words: &[&str]) -> bool {
    let Some((segment, rest)) = segments.split_first() else {
        return words.is_empty();
    };
    match segment {
        Segment::Hash => (0..=words.len()).any(|skip| match_words(rest, &words[skip..])),
        Segment::Star => words
            .split_first()
            .is_some_and(|(_, tail)| match_words(rest, tail)),
        Segment::Word(expected) => words
            .split_first()
            .is_some_and(|(word, tail)| word == expected && match_words(rest, tail)),
    }
}

// =============================================================================
// Topology
// =============================================================================

/// Exchange routing behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Pattern routing.
    Topic,
    /// Exact routing key match.
    Direct,
}

/// Declared exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    /// Exchange name.
    pub name: String,
    /// Routing behavior.
    pub kind: ExchangeKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum BindingKey {
    Topic(TopicPattern),
    Direct(String),
}

/// Queue bound to an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    /// Source exchange.
    pub exchange: String,
    /// Destination queue.
    pub queue: String,
    key: BindingKey,
}

impl Binding {
    /// Binding key or pattern text.
    #[must_use]
    pub fn key(&self) -> &str {
        match &self.key {
            BindingKey::Topic(pattern) => pattern.as_str(),
            BindingKey::Direct(key) => key,
        }
    }

    fn accepts(&self, routing_key: &str) -> bool {
        match &self.key {
            BindingKey::Topic(pattern) => pattern.matches(routing_key),
            BindingKey::Direct(key) => key == routing_key,
        }
    }
}

/// Declared exchanges, queues and bindings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerTopology {
    exchanges: Vec<Exchange>,
    bindings: Vec<Binding>,
    consumer_queue: String,
    dead_letter_queue: String,
}

impl BrokerTopology {
    /// Derive the persister topology from broker settings.
    #[must_use]
    pub fn from_settings(settings: &BrokerSettings) -> Self {
        let dead_letter = &settings.dead_letter;
        let mut bindings: Vec<Binding> = settings
            .routing_keys
            .patterns()
            .iter()
            .map(|pattern| Binding {
                exchange: settings.exchange.clone(),
                queue: settings.queue.clone(),
                key: BindingKey::Topic(TopicPattern::new(pattern)),
            })
            .collect();
        bindings.push(Binding {
            exchange: dead_letter.exchange.clone(),
            queue: dead_letter.queue.clone(),
            key: BindingKey::Direct(dead_letter.routing_key.clone()),
        });

        Self {
            exchanges: vec![
                Exchange {
                    name: settings.exchange.clone(),
                    kind: ExchangeKind::Topic,
                },
                Exchange {
                    name: dead_letter.exchange.clone(),
                    kind: ExchangeKind::Direct,
                },
            ],
            bindings,
            consumer_queue: settings.queue.clone(),
            dead_letter_queue: dead_letter.queue.clone(),
        }
    }

    /// Declared exchanges.
    #[must_use]
    pub fn exchanges(&self) -> &[Exchange] {
        &self.exchanges
    }

    /// Declared bindings.
    #[must_use]
    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    /// Queue the persister consumes from.
    #[must_use]
    pub fn consumer_queue(&self) -> &str {
        &self.consumer_queue
    }

    /// Queue receiving dead-lettered messages.
    #[must_use]
    pub fn dead_letter_queue(&self) -> &str {
        &self.dead_letter_queue
    }

    /// Every declared queue.
    #[must_use]
    pub fn queues(&self) -> [&str; 2] {
        [&self.consumer_queue, &self.dead_letter_queue]
    }

    /// Queues a message published to `exchange` with `routing_key` lands
    /// in. Each queue appears once even if several bindings match.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::UnknownExchange`] if the exchange is not
    /// declared.
    pub fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<&str>, BrokerError> {
        if !self.exchanges.iter().any(|e| e.name == exchange) {
            return Err(BrokerError::UnknownExchange {
                exchange: exchange.to_string(),
            });
        }

        let mut queues: Vec<&str> = Vec::new();
        for binding in self
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange && b.accepts(routing_key))
        {
            if !queues.contains(&binding.queue.as_str()) {
                queues.push(&binding.queue);
            }
        }
        Ok(queues)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use test_case::test_case;

    use super::*;

    #[test_case("*.ticker.#", "upbit.ticker.krw-btc", true ; "star and hash")]
    #[test_case("*.ticker.#", "upbit.ticker", true ; "hash matches zero words")]
    #[test_case("*.ticker.#", "upbit.ticker.krw.btc", true ; "hash matches many words")]
    #[test_case("*.ticker.#", "ticker.krw-btc", false ; "star needs a word")]
    #[test_case("*.ticker.#", "upbit.trade.krw-btc", false ; "literal mismatch")]
    #[test_case("#", "", true ; "hash matches empty key")]
    #[test_case("a.*", "a", false ; "trailing star needs a word")]
    fn topic_matching(pattern: &str, key: &str, expected: bool) {
        assert_eq!(TopicPattern::new(pattern).matches(key), expected);
    }

    #[test]
    fn default_topology_routes_by_data_type() {
        let topology = BrokerTopology::from_settings(&BrokerSettings::default());

        assert_eq!(
            topology.route("market-data", "upbit.orderbook.krw-btc").unwrap(),
            vec!["market-data.persist"]
        );
        assert!(topology.route("market-data", "upbit.candle.krw-btc").unwrap().is_empty());
        assert_eq!(
            topology
                .route("market-data.dlx", "market-data.persist.dlq")
                .unwrap(),
            vec!["market-data.persist.dlq"]
        );
        assert!(topology.route("market-data.dlx", "other").unwrap().is_empty());
    }

    #[test]
    fn unknown_exchange_is_rejected() {
        let topology = BrokerTopology::from_settings(&BrokerSettings::default());
        assert_eq!(
            topology.route("nope", "x").unwrap_err(),
            BrokerError::UnknownExchange {
                exchange: "nope".to_string()
            }
        );
    }

    proptest! {
        #[test]
        fn hash_alone_matches_anything(words in prop::collection::vec("[a-z0-9-]{1,8}", 1..6)) {
            prop_assert!(TopicPattern::new("#").matches(&words.join(".")));
        }

        #[test]
        fn literal_pattern_matches_only_itself(
            words in prop::collection::vec("[a-z0-9-]{1,8}", 1..6),
            other in "[a-z0-9-]{1,8}",
        ) {
            let key = words.join(".");
            let pattern = TopicPattern::new(&key);
            prop_assert!(pattern.matches(&key));
            let changed = format!("{key}.{other}");
            prop_assert!(!pattern.matches(&changed));
        }

        #[test]
        fn star_per_word_matches_same_length(words in prop::collection::vec("[a-z0-9-]{1,8}", 1..6)) {
            let pattern = vec!["*"; words.len()].join(".");
            prop_assert!(TopicPattern::new(&pattern).matches(&words.join(".")));
        }
    }
}
