//! Replay Input
//!
//! Feeds line-delimited raw bodies into the broker for reprocessing, the
//! same bodies the pipeline logs when it drops or dead-letters a message.
//!
//! A line whose exchange, data type and market code can be read is
//! published to the topic exchange as `{exchange}.{dataType}.{marketCode}`
//! (lower-cased). Any other line, or one no binding accepts, goes straight
//! onto the consumer queue so that it still reaches the pipeline.

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, info};

use crate::application::decoder::decode;
use crate::application::ports::{BrokerError, OutboundMessage};
use crate::application::router::{Route, route};
use crate::infrastructure::broker::InMemoryBroker;

/// Counts from one replay run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Non-blank lines read.
    pub lines: u64,
    /// Lines published through the topic exchange.
    pub published: u64,
    /// Lines placed directly on the consumer queue.
    pub enqueued: u64,
}

/// Replay failure.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    /// Reading the input failed.
    #[error("failed to read replay input")]
    Io(#[from] std::io::Error),

    /// The broker refused a message.
    #[error("broker rejected replayed message")]
    Broker(#[from] BrokerError),
}

/// Topic routing key for a raw body, if one can be derived.
#[must_use]
pub fn routing_key_for(body: &[u8]) -> Option<String> {
    let decoded = decode(body).ok()?;
    let Route::Dispatch(data_type) = route(decoded.data_type_tag()) else {
        return None;
    };
    let exchange = decoded.metadata().exchange.as_deref()?.trim();
    let market_code = decoded
        .tree()
        .get("payload")?
        .get("marketCode")?
        .as_str()?
        .trim();
    if exchange.is_empty() || market_code.is_empty() {
        return None;
    }
    Some(format!("{exchange}.{}.{market_code}", data_type.as_str()).to_lowercase())
}

/// Replay every non-blank line of `reader` into `broker`.
///
/// # Errors
///
/// Returns [`ReplayError`] if reading fails or the broker is closed.
pub async fn replay<R>(
    reader: R,
    broker: &InMemoryBroker,
    exchange: &str,
) -> Result<ReplaySummary, ReplayError>
where
    R: AsyncBufRead + Unpin,
{
    let mut summary = ReplaySummary::default();
    let mut lines = reader.lines();

    while let Some(line) = lines.next_line().await? {
        let body = line.trim();
        if body.is_empty() {
            continue;
        }
        summary.lines += 1;

        let published = match routing_key_for(body.as_bytes()) {
            Some(routing_key) => {
                let reached = broker.publish(OutboundMessage {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.clone(),
                    body: body.as_bytes().to_vec(),
                    headers: std::collections::BTreeMap::new(),
                })?;
                debug!(routing_key, reached, "Replayed line published");
                reached > 0
            }
            None => false,
        };

        if published {
            summary.published += 1;
        } else {
            broker.enqueue(body.as_bytes())?;
            summary.enqueued += 1;
        }
    }

    info!(
        lines = summary.lines,
        published = summary.published,
        enqueued = summary.enqueued,
        "Replay input consumed"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;
    use crate::application::ports::QueueDepth;
    use crate::infrastructure::broker::BrokerTopology;
    use crate::infrastructure::config::BrokerSettings;

    const TICKER: &str = r#"{"metadata":{"exchange":"UPBIT","dataType":"TICKER"},"payload":{"marketCode":"KRW-BTC"}}"#;

    #[test_case(TICKER, Some("upbit.ticker.krw-btc") ; "ticker")]
    #[test_case(r#"{"metadata":{"exchange":"UPBIT","dataType":"ORDERBOOK"},"payload":{"marketCode":"KRW-ETH"}}"#, Some("upbit.orderbook.krw-eth") ; "order book")]
    #[test_case(r#"{"metadata":{"exchange":"UPBIT","dataType":null},"payload":{"marketCode":"KRW-BTC"}}"#, None ; "missing type")]
    #[test_case(r#"{"metadata":{"dataType":"TRADE"},"payload":{"marketCode":"KRW-BTC"}}"#, None ; "missing exchange")]
    #[test_case("not json", None ; "malformed")]
    fn derives_routing_key(body: &str, expected: Option<&str>) {
        assert_eq!(routing_key_for(body.as_bytes()).as_deref(), expected);
    }

    #[tokio::test]
    async fn replays_lines_by_routability() {
        let broker =
            InMemoryBroker::new(BrokerTopology::from_settings(&BrokerSettings::default()));
        let input = format!("{TICKER}\n\n{{broken\n");

        let summary = replay(input.as_bytes(), &broker, "market-data").await.unwrap();

        assert_eq!(
            summary,
            ReplaySummary {
                lines: 2,
                published: 1,
                enqueued: 1,
            }
        );
        assert_eq!(broker.backlog(), 2);
    }
}
