//! Event Bus
//!
//! Single ingress point for throttled ticks, fanned out to every registered
//! consumer over a tokio broadcast channel.
//!
//! # Delivery
//!
//! - Publishing never blocks and never waits on consumers.
//! - Each consumer reads from its own cursor into a bounded ring of
//!   `capacity` ticks. A consumer that falls more than `capacity` ticks
//!   behind loses the oldest ones (drop-oldest). Delivery is **lossy**:
//!   skipped ticks are counted in `price_stream_ticks_dropped_total` with
//!   reason `consumer_lag` and never replayed.
//! - Ticks for one symbol arrive in publish order. There is no ordering
//!   guarantee across symbols.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::domain::tick::{PriceTick, SymbolSet};
use crate::infrastructure::metrics::{self, DropReason};

/// Default per-consumer queue depth.
pub const DEFAULT_CONSUMER_QUEUE: usize = 1024;

// =============================================================================
// Consumer Identity and Filter
// =============================================================================

/// Opaque handle for a registered consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsumerHandle(Uuid);

impl ConsumerHandle {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ConsumerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Symbols a consumer wants. Shared with the caller so the set can change
/// while the stream stays open.
#[derive(Debug, Clone, Default)]
pub struct ConsumerFilter(Arc<RwLock<SymbolSet>>);

impl ConsumerFilter {
    /// Create a filter for `symbols`.
    #[must_use]
    pub fn new(symbols: SymbolSet) -> Self {
        Self(Arc::new(RwLock::new(symbols)))
    }

    /// Whether ticks for `symbol` pass.
    #[must_use]
    pub fn matches(&self, symbol: &str) -> bool {
        self.0.read().contains(symbol)
    }

    /// Replace the symbol set.
    pub fn replace(&self, symbols: SymbolSet) {
        *self.0.write() = symbols;
    }

    /// Snapshot of the symbol set.
    #[must_use]
    pub fn symbols(&self) -> SymbolSet {
        self.0.read().clone()
    }
}

// =============================================================================
// Tick Stream
// =============================================================================

type Registry = Arc<Mutex<HashMap<ConsumerHandle, CancellationToken>>>;

/// Callback run once when a consumer stream is dropped.
pub type OnClose = Box<dyn FnOnce() + Send>;

/// Stream of ticks for one consumer. Ends when the consumer is removed or
/// the bus shuts down. Dropping it unregisters the consumer.
pub struct TickStream {
    handle: ConsumerHandle,
    inner: Pin<Box<dyn Stream<Item = PriceTick> + Send>>,
    registry: Registry,
    on_close: Option<OnClose>,
}

impl TickStream {
    /// Handle identifying this consumer on the bus.
    #[must_use]
    pub const fn handle(&self) -> ConsumerHandle {
        self.handle
    }
}

impl std::fmt::Debug for TickStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TickStream")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl Stream for TickStream {
    type Item = PriceTick;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl Drop for TickStream {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.handle);
        if let Some(on_close) = self.on_close.take() {
            on_close();
        }
    }
}

// =============================================================================
// Event Bus
// =============================================================================

/// Bus statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventBusStats {
    /// Registered consumers.
    pub consumers: usize,
    /// Ticks published since start.
    pub published: u64,
}

/// Fan-out of throttled ticks to consumers.
#[derive(Debug)]
pub struct EventBus {
    tx: broadcast::Sender<PriceTick>,
    consumers: Registry,
    shutdown: CancellationToken,
    callbacks: TaskTracker,
    published: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CONSUMER_QUEUE)
    }
}

impl EventBus {
    /// Create a bus whose consumers each buffer up to `capacity` ticks.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            tx: broadcast::channel(capacity.max(1)).0,
            consumers: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
            callbacks: TaskTracker::new(),
            published: AtomicU64::new(0),
        }
    }

    /// Publish a tick to every consumer. Returns how many consumers were open.
    pub fn publish(&self, tick: PriceTick) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        metrics::record_ticks_published(1);
        self.tx.send(tick).unwrap_or(0)
    }

    /// Register a consumer and return its stream.
    #[must_use]
    pub fn add_consumer(&self, filter: ConsumerFilter, on_close: Option<OnClose>) -> TickStream {
        let handle = ConsumerHandle::new();
        let stop = self.shutdown.child_token();
        self.consumers.lock().insert(handle, stop.clone());

        let inner = BroadcastStream::new(self.tx.subscribe())
            .filter_map(move |item| {
                let filter = filter.clone();
                async move {
                    match item {
                        Ok(tick) if filter.matches(tick.symbol()) => Some(tick),
                        Ok(_) => None,
                        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                            tracing::warn!(consumer = %handle, skipped, "Consumer lagging, oldest ticks dropped");
                            metrics::record_ticks_dropped(DropReason::ConsumerLag, skipped);
                            None
                        }
                    }
                }
            })
            .take_until(stop.cancelled_owned());

        tracing::debug!(consumer = %handle, "Consumer registered");
        TickStream {
            handle,
            inner: Box::pin(inner),
            registry: Arc::clone(&self.consumers),
            on_close,
        }
    }

    /// Register a callback consumer. Each callback runs on its own task so a
    /// slow callback only delays itself.
    pub fn add_callback<F>(&self, filter: ConsumerFilter, callback: F) -> ConsumerHandle
    where
        F: Fn(PriceTick) + Send + 'static,
    {
        let mut stream = self.add_consumer(filter, None);
        let handle = stream.handle();
        self.callbacks.spawn(async move {
            while let Some(tick) = stream.next().await {
                callback(tick);
            }
        });
        handle
    }

    /// Unregister a consumer; its stream ends. Returns `false` if unknown.
    pub fn remove_consumer(&self, handle: ConsumerHandle) -> bool {
        let Some(token) = self.consumers.lock().remove(&handle) else {
            return false;
        };
        token.cancel();
        tracing::debug!(consumer = %handle, "Consumer removed");
        true
    }

    /// End every consumer stream.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.callbacks.close();
    }

    /// Wait for callback tasks to return. Completes only after [`shutdown`](Self::shutdown).
    pub async fn drained(&self) {
        self.callbacks.wait().await;
    }

    /// Registered consumer count.
    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.consumers.lock().len()
    }

    /// Bus statistics.
    #[must_use]
    pub fn stats(&self) -> EventBusStats {
        EventBusStats {
            consumers: self.consumer_count(),
            published: self.published.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use chrono::Utc;
    use rust_decimal::Decimal;

    use super::*;
    use crate::domain::tick::SourceId;

    fn tick(symbol: &str, price: i64) -> PriceTick {
        PriceTick::new(symbol.to_string(), Decimal::from(price), SourceId::Primary, Utc::now())
    }

    fn filter(symbols: &[&str]) -> ConsumerFilter {
        ConsumerFilter::new(symbols.iter().map(ToString::to_string).collect())
    }

    async fn next(stream: &mut TickStream) -> Option<PriceTick> {
        tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn consumers_receive_only_their_symbols() {
        let bus = EventBus::new(16);
        let mut btc = bus.add_consumer(filter(&["BTCUSDT"]), None);
        let mut both = bus.add_consumer(filter(&["BTCUSDT", "ETHUSDT"]), None);

        bus.publish(tick("ETHUSDT", 1));
        bus.publish(tick("BTCUSDT", 2));

        assert_eq!(next(&mut btc).await.unwrap().price(), Decimal::from(2));
        assert_eq!(next(&mut both).await.unwrap().symbol(), "ETHUSDT");
        assert_eq!(next(&mut both).await.unwrap().symbol(), "BTCUSDT");
    }

    #[tokio::test]
    async fn filtered_ticks_leave_stream_pending() {
        let bus = EventBus::new(16);
        let mut btc = bus.add_consumer(filter(&["BTCUSDT"]), None);

        let mut pending = tokio_test::task::spawn(btc.next());
        tokio_test::assert_pending!(pending.poll());

        bus.publish(tick("ETHUSDT", 1));
        tokio_test::assert_pending!(pending.poll());

        bus.publish(tick("BTCUSDT", 2));
        assert!(pending.is_woken());
        let received = tokio_test::assert_ready!(pending.poll());
        assert_eq!(received.unwrap().price(), Decimal::from(2));
    }

    #[tokio::test]
    async fn slow_consumer_loses_oldest_without_blocking_others() {
        let bus = EventBus::new(4);
        let mut slow = bus.add_consumer(filter(&["BTCUSDT"]), None);
        let mut fast = bus.add_consumer(filter(&["BTCUSDT"]), None);

        for price in 1..=10 {
            bus.publish(tick("BTCUSDT", price));
            assert_eq!(next(&mut fast).await.unwrap().price(), Decimal::from(price));
        }

        let mut received = Vec::new();
        for _ in 0..4 {
            received.push(next(&mut slow).await.unwrap().price());
        }
        let expected: Vec<Decimal> = (7..=10).map(Decimal::from).collect();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn remove_consumer_ends_stream_and_runs_on_close() {
        let bus = EventBus::new(16);
        let closed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&closed);
        let mut stream = bus.add_consumer(
            filter(&["BTCUSDT"]),
            Some(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        );
        assert_eq!(bus.consumer_count(), 1);

        assert!(bus.remove_consumer(stream.handle()));
        assert!(!bus.remove_consumer(stream.handle()));
        assert!(next(&mut stream).await.is_none());

        drop(stream);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(bus.consumer_count(), 0);
    }

    #[tokio::test]
    async fn filter_can_change_while_open() {
        let bus = EventBus::new(16);
        let shared = filter(&["BTCUSDT"]);
        let mut stream = bus.add_consumer(shared.clone(), None);

        shared.replace(filter(&["ETHUSDT"]).symbols());
        bus.publish(tick("BTCUSDT", 1));
        bus.publish(tick("ETHUSDT", 2));

        assert_eq!(next(&mut stream).await.unwrap().symbol(), "ETHUSDT");
    }

    #[tokio::test]
    async fn callbacks_run_on_their_own_task() {
        let bus = EventBus::new(16);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = bus.add_callback(filter(&["BTCUSDT"]), move |t| {
            let _ = tx.send(t.price());
        });

        bus.publish(tick("BTCUSDT", 42));
        assert_eq!(rx.recv().await, Some(Decimal::from(42)));

        assert!(bus.remove_consumer(handle));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn shutdown_ends_all_streams() {
        let bus = EventBus::default();
        let mut a = bus.add_consumer(filter(&["A"]), None);
        let mut b = bus.add_consumer(filter(&["B"]), None);
        bus.shutdown();
        assert!(next(&mut a).await.is_none());
        assert!(next(&mut b).await.is_none());
        assert_eq!(bus.stats().consumers, 2);
    }

    #[tokio::test]
    async fn shutdown_waits_for_callback_tasks() {
        let bus = EventBus::new(16);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _handle = bus.add_callback(filter(&["BTCUSDT"]), move |t| {
            let _ = tx.send(t.price());
        });
        bus.publish(tick("BTCUSDT", 7));
        assert_eq!(rx.recv().await, Some(Decimal::from(7)));

        bus.shutdown();
        tokio::time::timeout(Duration::from_secs(1), bus.drained())
            .await
            .unwrap();
        // The finished task dropped the sender
        assert_eq!(rx.try_recv(), Err(tokio::sync::mpsc::error::TryRecvError::Disconnected));
    }
}
