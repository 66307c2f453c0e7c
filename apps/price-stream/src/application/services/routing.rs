//! Tick Routing
//!
//! The three long-lived tasks between the connectors and the event bus.
//!
//! ```text
//! connectors ──SourceEvent──▶ Router ──ThrottleCommand──▶ Throttle ──▶ EventBus
//!                              ▲
//! registry ──Notify──▶ DemandSync ──watch──┘ (and update_symbols on every manager)
//! ```
//!
//! - [`Router`] owns the [`FailoverCoordinator`]: it applies connector
//!   events, forwards ticks from the active source only, and sweeps for
//!   symbols that went silent on their active source.
//! - The throttle task owns the [`ThrottleBuffer`] and its trailing timer.
//! - The demand sync task batches registry changes before pushing the new
//!   symbol set to connectors, so subscribe churn does not thrash upstreams.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, broadcast, mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::reconnect::ReconnectManager;
use super::status::StatusBoard;
use crate::application::ports::{ConnectorEvent, FeedError, SourceEvent};
use crate::domain::failover::{FailoverCoordinator, FailoverEvent};
use crate::domain::subscription::SubscriptionRegistry;
use crate::domain::throttle::ThrottleBuffer;
use crate::domain::tick::{PriceTick, SourceId, Symbol, SymbolSet};
use crate::infrastructure::broadcast::EventBus;
use crate::infrastructure::metrics::{self, DropReason};

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

// =============================================================================
// Router
// =============================================================================

/// Work handed from the router to the throttle task.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ThrottleCommand {
    /// Tick from the active source of a symbol in demand.
    Tick(PriceTick),
    /// Symbols that left demand.
    Forget(SymbolSet),
}

/// Applies connector events to the failover state and forwards live ticks.
pub(crate) struct Router {
    coordinator: FailoverCoordinator,
    events: mpsc::Receiver<SourceEvent>,
    demand: watch::Receiver<SymbolSet>,
    throttle: mpsc::Sender<ThrottleCommand>,
    failovers: broadcast::Sender<FailoverEvent>,
    board: Arc<StatusBoard>,
    in_demand: SymbolSet,
    last_tick: HashMap<(SourceId, Symbol), Instant>,
    stale_after: HashMap<SourceId, Duration>,
    sweep_every: Duration,
}

impl Router {
    /// Create a router. A symbol is stale once its active source has been
    /// silent on it for `stale_heartbeats` heartbeat timeouts.
    pub(crate) fn new(
        coordinator: FailoverCoordinator,
        events: mpsc::Receiver<SourceEvent>,
        demand: watch::Receiver<SymbolSet>,
        throttle: mpsc::Sender<ThrottleCommand>,
        failovers: broadcast::Sender<FailoverEvent>,
        board: Arc<StatusBoard>,
        stale_heartbeats: u32,
    ) -> Self {
        let stale_after = coordinator
            .ranked()
            .iter()
            .map(|d| (d.id, d.heartbeat_timeout * stale_heartbeats.max(1)))
            .collect();
        let sweep_every = coordinator
            .ranked()
            .iter()
            .map(|d| d.heartbeat_timeout / 10)
            .min()
            .unwrap_or(Duration::from_secs(1))
            .max(MIN_SWEEP_INTERVAL);

        Self {
            coordinator,
            events,
            demand,
            throttle,
            failovers,
            board,
            in_demand: SymbolSet::new(),
            last_tick: HashMap::new(),
            stale_after,
            sweep_every,
        }
    }

    pub(crate) async fn run(mut self, cancel: CancellationToken) {
        let mut sweep = tokio::time::interval(self.sweep_every);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.apply_demand().await;

        tracing::info!(
            sources = self.coordinator.ranked().len(),
            sweep_ms = u64::try_from(self.sweep_every.as_millis()).unwrap_or(u64::MAX),
            "Router started"
        );

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                changed = self.demand.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.apply_demand().await;
                }
                _ = sweep.tick() => self.sweep(Instant::now()),
                event = self.events.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
            }
        }

        tracing::info!("Router stopped");
    }

    async fn handle(&mut self, SourceEvent { source, event }: SourceEvent) {
        let now = Instant::now();
        match event {
            ConnectorEvent::StateChanged(state) => {
                tracing::debug!(source = %source, state = %state, "Source state changed");
                metrics::set_connection_state(source, state);
                self.board.record_state(source, state);
                let events = self.coordinator.on_state_changed(source, state, now);
                self.emit(events);
            }
            ConnectorEvent::Tracking(symbols) => {
                self.board.record_tracking(source, symbols.len());
                let events = self.coordinator.on_tracking_changed(source, symbols, now);
                self.emit(events);
            }
            ConnectorEvent::Tick(tick) => self.route(source, tick, now).await,
            ConnectorEvent::Reconnecting { attempt, .. } => {
                self.board.record_reconnect(source, attempt);
            }
            ConnectorEvent::Error(error) => {
                if matches!(error, FeedError::Protocol(_)) {
                    metrics::record_protocol_error(source);
                    metrics::record_ticks_dropped(DropReason::Protocol, 1);
                }
                self.board.record_error(source, &error);
            }
        }
    }

    async fn route(&mut self, source: SourceId, tick: PriceTick, now: Instant) {
        metrics::record_tick_received(source);
        self.board.record_tick(source);

        if !self.in_demand.contains(tick.symbol()) {
            metrics::record_ticks_dropped(DropReason::NoDemand, 1);
            return;
        }

        let symbol = tick.symbol().to_string();
        if self.coordinator.is_stale(source, &symbol) {
            tracing::info!(source = %source, symbol = %symbol, "Silent symbol resumed");
            let events = self.coordinator.clear_stale(source, &symbol, now);
            self.emit(events);
        }
        self.last_tick.insert((source, symbol), now);

        if !self.coordinator.is_active(source, tick.symbol()) {
            metrics::record_ticks_dropped(DropReason::InactiveSource, 1);
            return;
        }

        self.board.record_forwarded(tick.symbol(), now);
        if self.throttle.send(ThrottleCommand::Tick(tick)).await.is_err() {
            tracing::trace!("Throttle task gone, tick discarded");
        }
    }

    async fn apply_demand(&mut self) {
        let demand = self.demand.borrow_and_update().clone();
        let removed: SymbolSet = self.in_demand.difference(&demand).cloned().collect();

        self.coordinator.set_demand(&demand, Instant::now());
        self.board.sync_decisions(self.coordinator.decisions());
        self.last_tick.retain(|(_, symbol), _| demand.contains(symbol));
        self.in_demand = demand;

        if !removed.is_empty() {
            tracing::debug!(removed = removed.len(), "Symbols left demand");
            if self.throttle.send(ThrottleCommand::Forget(removed)).await.is_err() {
                tracing::trace!("Throttle task gone");
            }
        }
    }

    fn sweep(&mut self, now: Instant) {
        let fallback = self.coordinator.fallback();
        let mut events = Vec::new();

        for decision in self.coordinator.decisions() {
            let Some(source) = decision.active_source_id else {
                continue;
            };
            if Some(source) == fallback {
                continue;
            }
            let Some(&limit) = self.stale_after.get(&source) else {
                continue;
            };

            let symbol = decision.symbol;
            let last_tick = self.last_tick.get(&(source, symbol.clone())).copied();
            let Some(reference) = self.coordinator.assigned_since(&symbol).max(last_tick) else {
                continue;
            };
            let silence = now.saturating_duration_since(reference);
            if silence < limit {
                continue;
            }

            tracing::warn!(
                source = %source,
                symbol = %symbol,
                silence_ms = u64::try_from(silence.as_millis()).unwrap_or(u64::MAX),
                "Tracked symbol went silent"
            );
            self.board
                .record_error(source, &FeedError::StaleData { symbol: symbol.clone(), silence });
            events.extend(self.coordinator.mark_stale(source, &symbol, now));
        }

        self.emit(events);
    }

    fn emit(&self, events: Vec<FailoverEvent>) {
        for event in events {
            tracing::warn!(
                symbol = %event.symbol,
                from = event.from_source.map_or("none", SourceId::as_str),
                to = event.to_source.map_or("none", SourceId::as_str),
                "Failover"
            );
            metrics::record_failover(event.to_source);
            self.board.set_active(&event.symbol, event.to_source);
            // No subscribers is fine
            let _ = self.failovers.send(event);
        }
    }
}

// =============================================================================
// Throttle Task
// =============================================================================

/// Drive a [`ThrottleBuffer`] and publish what it releases.
pub(crate) async fn run_throttle(
    mut buffer: ThrottleBuffer,
    mut commands: mpsc::Receiver<ThrottleCommand>,
    bus: Arc<EventBus>,
    cancel: CancellationToken,
) {
    loop {
        let deadline = buffer.next_deadline();
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = sleep_until(deadline) => {
                for tick in buffer.fire(Instant::now()) {
                    bus.publish(tick);
                }
            }
            command = commands.recv() => match command {
                Some(ThrottleCommand::Tick(tick)) => {
                    let coalesced = buffer.coalesced();
                    if let Some(tick) = buffer.accept(tick, Instant::now()) {
                        bus.publish(tick);
                    }
                    if buffer.coalesced() > coalesced {
                        metrics::record_tick_coalesced();
                    }
                }
                Some(ThrottleCommand::Forget(symbols)) => {
                    for symbol in &symbols {
                        buffer.forget(symbol);
                    }
                }
                None => break,
            },
        }
    }

    tracing::debug!("Throttle stopped");
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// =============================================================================
// Demand Sync Task
// =============================================================================

/// Pushes registry changes to the router and every connector.
pub(crate) struct DemandSync {
    pub(crate) registry: Arc<SubscriptionRegistry>,
    pub(crate) changed: Arc<Notify>,
    pub(crate) demand: watch::Sender<SymbolSet>,
    pub(crate) managers: Vec<Arc<ReconnectManager>>,
    pub(crate) batch: Duration,
}

impl DemandSync {
    pub(crate) async fn run(self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = self.changed.notified() => {}
            }
            // Collapse bursts of subscribe/unsubscribe into one update
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.batch) => {}
            }

            let demand = self.registry.symbols_in_demand();
            metrics::set_symbols_in_demand(demand.len());

            let modified = self.demand.send_if_modified(|current| {
                if *current == demand {
                    false
                } else {
                    current.clone_from(&demand);
                    true
                }
            });
            if !modified {
                continue;
            }

            tracing::info!(symbols = demand.len(), "Demand changed");
            for manager in &self.managers {
                manager.update_symbols(demand.clone());
            }
        }

        tracing::debug!("Demand sync stopped");
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use rust_decimal::Decimal;

    use super::*;
    use crate::application::ports::ErrorKind;
    use crate::domain::connection::{ConnectionState, SourceDescriptor};
    use crate::infrastructure::broadcast::ConsumerFilter;

    const HEARTBEAT: Duration = Duration::from_secs(5);

    struct Harness {
        events: mpsc::Sender<SourceEvent>,
        demand: watch::Sender<SymbolSet>,
        throttled: mpsc::Receiver<ThrottleCommand>,
        failovers: broadcast::Receiver<FailoverEvent>,
        board: Arc<StatusBoard>,
        cancel: CancellationToken,
    }

    impl Harness {
        fn start(stale_heartbeats: u32) -> Self {
            let sources = vec![
                SourceDescriptor::push(SourceId::Primary, 0, "ws://primary.invalid")
                    .with_heartbeat_timeout(HEARTBEAT),
                SourceDescriptor::poll(
                    SourceId::Polling,
                    2,
                    "http://poll.invalid",
                    Duration::from_secs(1),
                )
                .with_heartbeat_timeout(HEARTBEAT),
            ];
            let board = Arc::new(StatusBoard::new(&sources));
            let (events_tx, events_rx) = mpsc::channel(64);
            let (demand_tx, demand_rx) = watch::channel(SymbolSet::new());
            let (throttle_tx, throttle_rx) = mpsc::channel(64);
            let (failover_tx, failover_rx) = broadcast::channel(16);
            let router = Router::new(
                FailoverCoordinator::new(sources),
                events_rx,
                demand_rx,
                throttle_tx,
                failover_tx,
                Arc::clone(&board),
                stale_heartbeats,
            );
            let cancel = CancellationToken::new();
            tokio::spawn(router.run(cancel.clone()));

            Self {
                events: events_tx,
                demand: demand_tx,
                throttled: throttle_rx,
                failovers: failover_rx,
                board,
                cancel,
            }
        }

        async fn send(&self, source: SourceId, event: ConnectorEvent) {
            self.events
                .send(SourceEvent { source, event })
                .await
                .unwrap();
            settle().await;
        }

        async fn live(&self, source: SourceId, symbols: &[&str]) {
            self.send(source, ConnectorEvent::StateChanged(ConnectionState::Connected))
                .await;
            self.send(source, ConnectorEvent::Tracking(set(symbols))).await;
        }

        async fn want(&self, symbols: &[&str]) {
            self.demand.send_replace(set(symbols));
            settle().await;
        }

        fn take_failovers(&mut self) -> Vec<FailoverEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.failovers.try_recv() {
                events.push(event);
            }
            events
        }

        fn forwarded(&mut self) -> Vec<PriceTick> {
            let mut ticks = Vec::new();
            while let Ok(command) = self.throttled.try_recv() {
                if let ThrottleCommand::Tick(tick) = command {
                    ticks.push(tick);
                }
            }
            ticks
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn set(symbols: &[&str]) -> SymbolSet {
        symbols.iter().map(ToString::to_string).collect()
    }

    fn tick(symbol: &str, price: i64, source: SourceId) -> PriceTick {
        PriceTick::new(symbol.to_string(), Decimal::from(price), source, chrono::Utc::now())
    }

    #[tokio::test(start_paused = true)]
    async fn forwards_only_active_source() {
        let mut h = Harness::start(3);
        h.want(&["BTCUSDT"]).await;
        h.live(SourceId::Primary, &["BTCUSDT"]).await;
        h.live(SourceId::Polling, &["BTCUSDT"]).await;

        h.send(SourceId::Primary, ConnectorEvent::Tick(tick("BTCUSDT", 1, SourceId::Primary)))
            .await;
        h.send(SourceId::Polling, ConnectorEvent::Tick(tick("BTCUSDT", 2, SourceId::Polling)))
            .await;
        h.send(SourceId::Primary, ConnectorEvent::Tick(tick("ETHUSDT", 3, SourceId::Primary)))
            .await;

        let forwarded = h.forwarded();
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].source_id(), SourceId::Primary);

        let status = h.board.snapshot(Instant::now());
        assert_eq!(status.connection_states[&SourceId::Primary].ticks_received, 2);
        assert_eq!(status.active_source_per_symbol["BTCUSDT"], Some(SourceId::Primary));
        h.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn degraded_primary_fails_over_to_polling() {
        let mut h = Harness::start(3);
        h.want(&["BTCUSDT"]).await;
        h.live(SourceId::Primary, &["BTCUSDT"]).await;
        h.live(SourceId::Polling, &["BTCUSDT"]).await;
        h.take_failovers();

        h.send(SourceId::Primary, ConnectorEvent::StateChanged(ConnectionState::Degraded))
            .await;

        let events = h.take_failovers();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].symbol, "BTCUSDT");
        assert_eq!(events[0].from_source, Some(SourceId::Primary));
        assert_eq!(events[0].to_source, Some(SourceId::Polling));

        h.send(SourceId::Polling, ConnectorEvent::Tick(tick("BTCUSDT", 5, SourceId::Polling)))
            .await;
        let forwarded = h.forwarded();
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].source_id(), SourceId::Polling);
        h.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn silent_symbol_fails_over_and_recovers() {
        let mut h = Harness::start(1);
        h.want(&["BTCUSDT"]).await;
        h.live(SourceId::Primary, &["BTCUSDT"]).await;
        h.live(SourceId::Polling, &["BTCUSDT"]).await;
        h.send(SourceId::Primary, ConnectorEvent::Tick(tick("BTCUSDT", 1, SourceId::Primary)))
            .await;
        h.take_failovers();

        tokio::time::advance(HEARTBEAT + HEARTBEAT / 2).await;
        settle().await;

        let events = h.take_failovers();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].to_source, Some(SourceId::Polling));
        let status = h.board.snapshot(Instant::now());
        let last_error = status.connection_states[&SourceId::Primary]
            .last_error
            .clone()
            .unwrap();
        assert_eq!(last_error.kind, ErrorKind::StaleData);

        h.send(SourceId::Primary, ConnectorEvent::Tick(tick("BTCUSDT", 2, SourceId::Primary)))
            .await;
        let events = h.take_failovers();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].to_source, Some(SourceId::Primary));
        h.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn demand_removal_forgets_throttle_state() {
        let mut h = Harness::start(3);
        h.want(&["BTCUSDT", "ETHUSDT"]).await;
        h.want(&["ETHUSDT"]).await;

        let mut forgotten = Vec::new();
        while let Ok(command) = h.throttled.try_recv() {
            forgotten.push(command);
        }
        assert_eq!(forgotten, vec![ThrottleCommand::Forget(set(&["BTCUSDT"]))]);

        let status = h.board.snapshot(Instant::now());
        assert!(status.active_source_per_symbol.contains_key("ETHUSDT"));
        assert!(!status.active_source_per_symbol.contains_key("BTCUSDT"));
        h.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_task_coalesces_bursts() {
        let bus = Arc::new(EventBus::new(16));
        let mut stream = bus.add_consumer(ConsumerFilter::new(set(&["BTCUSDT"])), None);
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        tokio::spawn(run_throttle(
            ThrottleBuffer::new(Duration::from_millis(100)),
            rx,
            Arc::clone(&bus),
            cancel.clone(),
        ));

        // 100 at t=0, 101 at t=20ms, 102 at t=150ms
        let feed = |price| ThrottleCommand::Tick(tick("BTCUSDT", price, SourceId::Primary));
        tx.send(feed(100)).await.unwrap();
        settle().await;
        tokio::time::advance(Duration::from_millis(20)).await;
        tx.send(feed(101)).await.unwrap();
        settle().await;
        tokio::time::advance(Duration::from_millis(80)).await;
        settle().await;
        assert_eq!(bus.stats().published, 1);

        tokio::time::advance(Duration::from_millis(50)).await;
        tx.send(feed(102)).await.unwrap();
        settle().await;

        let first = stream.next().await.unwrap();
        let second = stream.next().await.unwrap();
        assert_eq!(first.price(), Decimal::from(101));
        assert_eq!(second.price(), Decimal::from(102));
        assert_eq!(bus.stats().published, 2);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn demand_sync_batches_changes() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let changed = Arc::new(Notify::new());
        let (demand_tx, mut demand_rx) = watch::channel(SymbolSet::new());
        let cancel = CancellationToken::new();
        let sync = DemandSync {
            registry: Arc::clone(&registry),
            changed: Arc::clone(&changed),
            demand: demand_tx,
            managers: Vec::new(),
            batch: Duration::from_millis(50),
        };
        tokio::spawn(sync.run(cancel.clone()));

        registry.subscribe(1, ["BTCUSDT".to_string()]);
        changed.notify_one();
        registry.subscribe(2, ["ETHUSDT".to_string()]);
        changed.notify_one();
        registry.unsubscribe(2, ["ETHUSDT".to_string()]);
        changed.notify_one();

        demand_rx.changed().await.unwrap();
        assert_eq!(*demand_rx.borrow_and_update(), set(&["BTCUSDT"]));

        tokio::time::advance(Duration::from_millis(200)).await;
        settle().await;
        assert!(!demand_rx.has_changed().unwrap());
        cancel.cancel();
    }
}
