//! Consumer Pool
//!
//! Elastic pool of workers, each owning one broker consumer. The pool
//! keeps `min_consumers` workers running and adds workers up to
//! `max_consumers` while the backlog exceeds the prefetch credit of the
//! active workers. Extra workers retire after sitting idle.
//!
//! Shutdown is checked only between messages: a worker finishes and
//! settles the delivery it holds before it exits.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::delivery::DeliveryController;
use crate::application::ports::{
    BrokerConnection, BrokerError, Delivery, DeliveryChannel, MessageSource,
};

// =============================================================================
// Settings
// =============================================================================

/// Worker pool bounds and timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSettings {
    /// Workers kept running at all times.
    pub min_consumers: usize,
    /// Upper bound on workers.
    pub max_consumers: usize,
    /// Unacknowledged-delivery credit per worker.
    pub prefetch: u16,
    /// How often the pool checks whether to scale up.
    pub scale_interval: Duration,
    /// Idle time after which an elastic worker retires.
    pub idle_timeout: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            min_consumers: 2,
            max_consumers: 4,
            prefetch: 50,
            scale_interval: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(30),
        }
    }
}

// =============================================================================
// Activity
// =============================================================================

/// Live counters shared between the pool and observers such as `/health`.
#[derive(Debug, Clone, Default)]
pub struct PoolActivity {
    active: Arc<AtomicUsize>,
    handled: Arc<AtomicU64>,
}

impl PoolActivity {
    /// Workers currently running.
    #[must_use]
    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Deliveries handled since start.
    #[must_use]
    pub fn deliveries_handled(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }
}

/// Decrements the active-worker count when the worker ends, panics included.
struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn enter(active: &Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::Relaxed);
        Self(Arc::clone(active))
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Totals reported when the pool stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolSummary {
    /// Workers started over the pool's lifetime.
    pub workers_started: usize,
    /// Deliveries handled over the pool's lifetime.
    pub deliveries_handled: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerKind {
    Core,
    Elastic,
}

#[derive(Debug)]
struct WorkerExit {
    consumer_tag: String,
    kind: WorkerKind,
    handled: u64,
}

enum Next {
    Delivery(Delivery),
    Closed,
    Idle,
}

// =============================================================================
// Pool
// =============================================================================

/// Elastic worker pool over a broker connection.
pub struct ConsumerPool<B: BrokerConnection> {
    broker: Arc<B>,
    controller: Arc<DeliveryController>,
    settings: ConsumerSettings,
    activity: PoolActivity,
}

impl<B: BrokerConnection> ConsumerPool<B> {
    /// Create a pool. Nothing runs until [`ConsumerPool::run`].
    #[must_use]
    pub fn new(
        broker: Arc<B>,
        controller: Arc<DeliveryController>,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            broker,
            controller,
            settings,
            activity: PoolActivity::default(),
        }
    }

    /// Shared activity counters.
    #[must_use]
    pub fn activity(&self) -> PoolActivity {
        self.activity.clone()
    }

    /// Run until `shutdown` fires or every consumer's source closes, then
    /// wait for in-flight deliveries to settle.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] if a core consumer cannot be opened.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<PoolSummary, BrokerError> {
        let mut workers = JoinSet::new();
        let mut summary = PoolSummary::default();

        for _ in 0..self.settings.min_consumers.max(1) {
            self.spawn_worker(&mut workers, WorkerKind::Core, &shutdown)
                .await?;
            summary.workers_started += 1;
        }
        info!(
            workers = summary.workers_started,
            max_workers = self.settings.max_consumers,
            prefetch = self.settings.prefetch,
            "Consumer pool started"
        );

        let mut scale = tokio::time::interval(self.settings.scale_interval);
        scale.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("Consumer pool shutting down");
                    break;
                }
                _ = scale.tick() => {
                    if self.should_scale_up() {
                        match self.spawn_worker(&mut workers, WorkerKind::Elastic, &shutdown).await {
                            Ok(()) => {
                                summary.workers_started += 1;
                                info!(
                                    active = self.activity.active_workers(),
                                    backlog = self.broker.backlog(),
                                    "Started elastic consumer"
                                );
                            }
                            Err(err) => warn!(error = %err, "Failed to open elastic consumer"),
                        }
                    }
                }
                Some(joined) = workers.join_next() => {
                    summary.deliveries_handled += log_exit(joined);
                    if workers.is_empty() {
                        info!("All consumers finished");
                        break;
                    }
                }
            }
        }

        while let Some(joined) = workers.join_next().await {
            summary.deliveries_handled += log_exit(joined);
        }
        info!(
            workers_started = summary.workers_started,
            deliveries = summary.deliveries_handled,
            "Consumer pool drained"
        );
        Ok(summary)
    }

    fn should_scale_up(&self) -> bool {
        let active = self.activity.active_workers();
        active < self.settings.max_consumers
            && self.broker.backlog() > active * usize::from(self.settings.prefetch)
    }

    async fn spawn_worker(
        &self,
        workers: &mut JoinSet<WorkerExit>,
        kind: WorkerKind,
        shutdown: &CancellationToken,
    ) -> Result<(), BrokerError> {
        let consumer = self.broker.open_consumer(self.settings.prefetch).await?;
        let controller = Arc::clone(&self.controller);
        let shutdown = shutdown.clone();
        let guard = ActiveGuard::enter(&self.activity.active);
        let handled = Arc::clone(&self.activity.handled);
        let idle_timeout = match kind {
            WorkerKind::Core => None,
            WorkerKind::Elastic => Some(self.settings.idle_timeout),
        };

        workers.spawn(async move {
            let _guard = guard;
            let count =
                run_worker(&consumer, &controller, &shutdown, idle_timeout, &handled).await;
            WorkerExit {
                consumer_tag: consumer.consumer_tag().to_string(),
                kind,
                handled: count,
            }
        });
        Ok(())
    }
}

async fn run_worker<C>(
    consumer: &C,
    controller: &DeliveryController,
    shutdown: &CancellationToken,
    idle_timeout: Option<Duration>,
    handled: &AtomicU64,
) -> u64
where
    C: MessageSource + DeliveryChannel,
{
    let mut count = 0;
    debug!(consumer_tag = consumer.consumer_tag(), "Consumer started");

    loop {
        let next = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            next = next_or_idle(consumer, idle_timeout) => next,
        };

        let delivery = match next {
            Next::Delivery(delivery) => delivery,
            Next::Closed => {
                debug!(consumer_tag = consumer.consumer_tag(), "Source closed");
                break;
            }
            Next::Idle => {
                debug!(consumer_tag = consumer.consumer_tag(), "Elastic consumer idle, retiring");
                break;
            }
        };

        let report = controller.handle(delivery, consumer).await;
        debug!(
            consumer_tag = consumer.consumer_tag(),
            delivery_tag = report.tag,
            outcome = %report.outcome,
            state = %report.final_state(),
            "Delivery settled"
        );
        count += 1;
        handled.fetch_add(1, Ordering::Relaxed);
    }

    count
}

async fn next_or_idle<C: MessageSource>(consumer: &C, idle_timeout: Option<Duration>) -> Next {
    let next = match idle_timeout {
        None => consumer.next_delivery().await,
        Some(limit) => match tokio::time::timeout(limit, consumer.next_delivery()).await {
            Ok(next) => next,
            Err(_) => return Next::Idle,
        },
    };
    next.map_or(Next::Closed, Next::Delivery)
}

fn log_exit(joined: Result<WorkerExit, tokio::task::JoinError>) -> u64 {
    match joined {
        Ok(exit) => {
            debug!(
                consumer_tag = %exit.consumer_tag,
                elastic = exit.kind == WorkerKind::Elastic,
                handled = exit.handled,
                "Consumer stopped"
            );
            exit.handled
        }
        Err(err) => {
            error!(error = %err, "Consumer task failed");
            0
        }
    }
}
