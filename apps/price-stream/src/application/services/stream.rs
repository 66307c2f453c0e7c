//! Price Stream Service
//!
//! Explicitly constructed facade over the whole streaming core. Owns one
//! [`ReconnectManager`] per source, the subscription registry, the event bus
//! and the routing tasks, and ties their lifetimes to `start()`/`stop()`.
//!
//! Several services can run side by side in one process; nothing here is
//! global apart from the metrics recorder.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Notify, broadcast, mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::reconnect::ReconnectManager;
use super::routing::{DemandSync, Router, ThrottleCommand, run_throttle};
use super::status::{StatusBoard, StreamStatus};
use crate::application::ports::{FeedEventSink, SourceConnector, SourceEvent};
use crate::domain::connection::{ProtocolErrorWindow, SourceDescriptor};
use crate::domain::failover::{FailoverCoordinator, FailoverEvent};
use crate::domain::subscription::{ConsumerId, SubscriptionRegistry};
use crate::domain::throttle::ThrottleBuffer;
use crate::domain::tick::{SourceId, Symbol, SymbolSet, normalize_symbol};
use crate::infrastructure::broadcast::{ConsumerFilter, EventBus, OnClose, TickStream};
use crate::infrastructure::config::StreamConfig;
use crate::infrastructure::metrics;

const EVENT_QUEUE: usize = 4096;
const THROTTLE_QUEUE: usize = 4096;
const FAILOVER_QUEUE: usize = 256;

// =============================================================================
// Errors
// =============================================================================

/// Service construction and lifecycle errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    /// No connector was supplied.
    #[error("at least one source connector is required")]
    NoSources,

    /// Two connectors share a source id.
    #[error("source {0} configured twice")]
    DuplicateSource(SourceId),

    /// Connector or reset target not present in the configuration.
    #[error("unknown source: {0}")]
    UnknownSource(SourceId),

    /// `start()` was called twice, or after `stop()`.
    #[error("service already started")]
    AlreadyStarted,
}

// =============================================================================
// Service
// =============================================================================

struct Pending {
    events: mpsc::Receiver<SourceEvent>,
    coordinator: FailoverCoordinator,
    demand: watch::Sender<SymbolSet>,
}

#[derive(Debug)]
struct ConsumerEntry {
    filter: ConsumerFilter,
    streams: usize,
}

type Consumers = Arc<Mutex<HashMap<ConsumerId, ConsumerEntry>>>;

/// The streaming core.
pub struct PriceStreamService {
    config: StreamConfig,
    managers: Vec<Arc<ReconnectManager>>,
    registry: Arc<SubscriptionRegistry>,
    bus: Arc<EventBus>,
    board: Arc<StatusBoard>,
    demand: watch::Receiver<SymbolSet>,
    demand_changed: Arc<Notify>,
    failovers: broadcast::Sender<FailoverEvent>,
    consumers: Consumers,
    pending: Mutex<Option<Pending>>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl std::fmt::Debug for PriceStreamService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriceStreamService")
            .field("sources", &self.sources())
            .field("consumers", &self.consumers.lock().len())
            .finish_non_exhaustive()
    }
}

impl PriceStreamService {
    /// Build a service over `connectors`.
    ///
    /// When `config.sources` is non-empty every connector must appear in it.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError`] if no connector is given, a source id repeats,
    /// or a connector is missing from the configuration.
    pub fn new(
        config: StreamConfig,
        connectors: Vec<Arc<dyn SourceConnector>>,
    ) -> Result<Self, ServiceError> {
        if connectors.is_empty() {
            return Err(ServiceError::NoSources);
        }

        let configured: HashSet<SourceId> = config.sources.iter().map(|s| s.descriptor.id).collect();
        let mut seen = HashSet::new();
        for connector in &connectors {
            let id = connector.id();
            if !seen.insert(id) {
                return Err(ServiceError::DuplicateSource(id));
            }
            if !configured.is_empty() && !configured.contains(&id) {
                return Err(ServiceError::UnknownSource(id));
            }
        }

        let descriptors: Vec<SourceDescriptor> =
            connectors.iter().map(|c| c.descriptor().clone()).collect();
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let (demand_tx, demand_rx) = watch::channel(SymbolSet::new());

        let managers = connectors
            .into_iter()
            .map(|connector| {
                let window =
                    ProtocolErrorWindow::new(config.protocol.max_errors, config.protocol.window);
                let sink = FeedEventSink::new(connector.id(), events_tx.clone(), window);
                Arc::new(ReconnectManager::new(connector, config.reconnect.clone(), sink))
            })
            .collect();

        Ok(Self {
            board: Arc::new(StatusBoard::new(&descriptors)),
            bus: Arc::new(EventBus::new(config.consumer_queue)),
            managers,
            registry: Arc::new(SubscriptionRegistry::new()),
            demand: demand_rx,
            demand_changed: Arc::new(Notify::new()),
            failovers: broadcast::channel(FAILOVER_QUEUE).0,
            consumers: Arc::new(Mutex::new(HashMap::new())),
            pending: Mutex::new(Some(Pending {
                events: events_rx,
                coordinator: FailoverCoordinator::new(descriptors),
                demand: demand_tx,
            })),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            config,
        })
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Spawn the routing tasks and connect every source.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::AlreadyStarted`] on a second call.
    pub fn start(&self) -> Result<(), ServiceError> {
        let Some(Pending {
            events,
            coordinator,
            demand,
        }) = self.pending.lock().take()
        else {
            return Err(ServiceError::AlreadyStarted);
        };

        let (throttle_tx, throttle_rx) = mpsc::channel::<ThrottleCommand>(THROTTLE_QUEUE);

        self.tracker.spawn(run_throttle(
            ThrottleBuffer::new(self.config.throttle_interval),
            throttle_rx,
            Arc::clone(&self.bus),
            self.cancel.clone(),
        ));

        let router = Router::new(
            coordinator,
            events,
            self.demand.clone(),
            throttle_tx,
            self.failovers.clone(),
            Arc::clone(&self.board),
            self.config.stale_heartbeats,
        );
        self.tracker.spawn(router.run(self.cancel.clone()));

        let sync = DemandSync {
            registry: Arc::clone(&self.registry),
            changed: Arc::clone(&self.demand_changed),
            demand,
            managers: self.managers.clone(),
            batch: self.config.resubscribe_batch,
        };
        self.tracker.spawn(sync.run(self.cancel.clone()));

        // Demand registered before start still needs a sync pass
        if !self.registry.symbols_in_demand().is_empty() {
            self.demand_changed.notify_one();
        }

        let initial = self.demand.borrow().clone();
        for manager in &self.managers {
            manager.connect(initial.clone(), &self.tracker, &self.cancel);
        }

        tracing::info!(
            sources = self.managers.len(),
            throttle_ms = u64::try_from(self.config.throttle_interval.as_millis()).unwrap_or(u64::MAX),
            "Price stream started"
        );
        Ok(())
    }

    /// Disconnect every source, end every consumer stream and wait for all
    /// tasks to finish.
    pub async fn stop(&self) {
        tracing::info!("Stopping price stream");
        self.pending.lock().take();
        self.cancel.cancel();

        for manager in &self.managers {
            manager.disconnect().await;
            // The router is gone, so record the final state here
            self.board.record_state(manager.source(), manager.state());
            metrics::set_connection_state(manager.source(), manager.state());
        }
        self.bus.shutdown();

        self.tracker.close();
        self.tracker.wait().await;
        self.bus.drained().await;
        tracing::info!("Price stream stopped");
    }

    // =========================================================================
    // Consumers
    // =========================================================================

    /// Subscribe `consumer` to `symbols` and return a stream of their ticks.
    ///
    /// Symbols are normalized; invalid ones are skipped. A consumer may hold
    /// several streams, each seeing the consumer's whole symbol set. When its
    /// last stream is dropped the consumer's subscriptions are released.
    pub fn subscribe<I, S>(&self, consumer: ConsumerId, symbols: I) -> TickStream
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let symbols = normalize_all(consumer, symbols);

        let (filter, changed, active) = {
            let mut consumers = self.consumers.lock();
            let changes = self.registry.subscribe(consumer, symbols);
            let entry = consumers.entry(consumer).or_insert_with(|| ConsumerEntry {
                filter: ConsumerFilter::default(),
                streams: 0,
            });
            entry.streams += 1;
            entry.filter.replace(self.registry.consumer_symbols(consumer));
            (entry.filter.clone(), !changes.is_empty(), consumers.len())
        };

        metrics::set_active_consumers(active);
        if changed {
            self.demand_changed.notify_one();
        }
        tracing::debug!(consumer, symbols = filter.symbols().len(), "Consumer subscribed");

        let consumers = Arc::clone(&self.consumers);
        let registry = Arc::clone(&self.registry);
        let demand_changed = Arc::clone(&self.demand_changed);
        let on_close: OnClose = Box::new(move || {
            release_stream(consumer, &consumers, &registry, &demand_changed);
        });

        self.bus.add_consumer(filter, Some(on_close))
    }

    /// Remove `symbols` from `consumer`. Open streams stop receiving them.
    pub fn unsubscribe<I, S>(&self, consumer: ConsumerId, symbols: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let symbols = normalize_all(consumer, symbols);

        let changed = {
            let consumers = self.consumers.lock();
            let changes = self.registry.unsubscribe(consumer, symbols);
            if let Some(entry) = consumers.get(&consumer) {
                entry.filter.replace(self.registry.consumer_symbols(consumer));
            }
            !changes.is_empty()
        };

        if changed {
            self.demand_changed.notify_one();
        }
        tracing::debug!(consumer, "Consumer unsubscribed");
    }

    // =========================================================================
    // Observability and Control
    // =========================================================================

    /// Snapshot of routing decisions and source health. Read-only.
    #[must_use]
    pub fn status(&self) -> StreamStatus {
        let mut status = self.board.snapshot(Instant::now());
        status.consumers = self.consumers.lock().len();
        status
    }

    /// Receive every active-source change from now on.
    #[must_use]
    pub fn failover_events(&self) -> broadcast::Receiver<FailoverEvent> {
        self.failovers.subscribe()
    }

    /// Leave `FailedPermanently` (or cut a pending backoff short) for a source.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::UnknownSource`] if the source is not part of
    /// this service.
    pub fn reset_source(&self, source: SourceId) -> Result<(), ServiceError> {
        let manager = self
            .managers
            .iter()
            .find(|m| m.source() == source)
            .ok_or(ServiceError::UnknownSource(source))?;
        manager.reset();
        Ok(())
    }

    /// Configured sources in preference order.
    #[must_use]
    pub fn sources(&self) -> Vec<SourceId> {
        let mut ranked: Vec<&SourceDescriptor> = self.managers.iter().map(|m| m.descriptor()).collect();
        ranked.sort_by_key(|d| (d.priority, d.id));
        ranked.into_iter().map(|d| d.id).collect()
    }

    /// Consumer subscriptions.
    #[must_use]
    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// Event bus the throttled ticks are published on.
    #[must_use]
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Configuration the service was built with.
    #[must_use]
    pub const fn config(&self) -> &StreamConfig {
        &self.config
    }
}

impl Drop for PriceStreamService {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn normalize_all<I, S>(consumer: ConsumerId, symbols: I) -> Vec<Symbol>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    symbols
        .into_iter()
        .filter_map(|raw| match normalize_symbol(raw.as_ref()) {
            Ok(symbol) => Some(symbol),
            Err(e) => {
                tracing::warn!(consumer, symbol = raw.as_ref(), error = %e, "Ignoring invalid symbol");
                None
            }
        })
        .collect()
}

fn release_stream(
    consumer: ConsumerId,
    consumers: &Mutex<HashMap<ConsumerId, ConsumerEntry>>,
    registry: &SubscriptionRegistry,
    demand_changed: &Notify,
) {
    let (changed, active) = {
        let mut consumers = consumers.lock();
        let Some(entry) = consumers.get_mut(&consumer) else {
            return;
        };
        entry.streams = entry.streams.saturating_sub(1);
        if entry.streams > 0 {
            return;
        }
        consumers.remove(&consumer);
        let changes = registry.consumer_disconnected(consumer);
        (!changes.is_empty(), consumers.len())
    };

    metrics::set_active_consumers(active);
    if changed {
        demand_changed.notify_one();
    }
    tracing::debug!(consumer, "Consumer released");
}
