//! Reconnection Management
//!
//! [`ReconnectPolicy`] computes exponential backoff with jitter.
//! [`ReconnectManager`] wraps exactly one [`SourceConnector`] and keeps it
//! running: it restarts sessions after failures, gives up after the
//! configured number of attempts, and parks in `FailedPermanently` until
//! [`ReconnectManager::reset`] is called.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::application::ports::{ErrorKind, FeedError, FeedEventSink, SourceConnector};
use crate::domain::connection::{ConnectionState, SourceDescriptor};
use crate::domain::tick::{SourceId, SymbolSet};
use crate::infrastructure::metrics;

// =============================================================================
// Policy
// =============================================================================

/// Configuration for reconnection behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt.
    pub base_delay: Duration,
    /// Maximum delay between reconnection attempts.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Jitter as a fraction (0.2 = ±20%).
    pub jitter_factor: f64,
    /// Attempts before giving up (0 = unlimited).
    pub max_attempts: u32,
    /// Connected time after which the attempt counter resets.
    pub stability_threshold: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.2,
            max_attempts: 10,
            stability_threshold: Duration::from_secs(30),
        }
    }
}

/// Exponential backoff: `min(base * multiplier^attempt, cap)` with jitter.
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempt_count: u32,
}

impl ReconnectPolicy {
    /// Create a new reconnection policy.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempt_count: 0,
        }
    }

    /// Un-jittered delay for a zero-based attempt number.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        #[allow(clippy::cast_precision_loss)]
        let base_millis = self.config.base_delay.as_millis() as f64;
        #[allow(clippy::cast_possible_wrap)]
        let scaled = base_millis * self.config.multiplier.powi(attempt.min(64) as i32);
        #[allow(clippy::cast_precision_loss)]
        let cap_millis = self.config.max_delay.as_millis() as f64;

        let millis = if scaled.is_finite() { scaled.min(cap_millis) } else { cap_millis };
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Duration::from_millis(millis.max(0.0) as u64)
    }

    /// Next delay, or `None` once attempts are exhausted.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.should_retry() {
            return None;
        }

        let delay = self.delay_for_attempt(self.attempt_count);
        self.attempt_count += 1;
        Some(self.apply_jitter(delay))
    }

    /// Account for a finished session; a stable session resets the counter.
    pub fn on_session_end(&mut self, connected_for: Option<Duration>) {
        if connected_for.is_some_and(|d| d >= self.config.stability_threshold) {
            self.reset();
        }
    }

    /// Reset after an explicit reset or a stable connection.
    pub const fn reset(&mut self) {
        self.attempt_count = 0;
    }

    /// Attempts made since the last reset.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Whether another attempt is allowed.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.config.max_attempts == 0 || self.attempt_count < self.config.max_attempts
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return duration;
        }

        #[allow(clippy::cast_precision_loss)]
        let base_millis = duration.as_millis() as f64;
        let jitter_range = base_millis * self.config.jitter_factor;
        let jitter: f64 = rand::rng().random_range(-jitter_range..=jitter_range);
        let adjusted_millis = (base_millis + jitter).max(1.0);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Duration::from_millis(adjusted_millis as u64)
    }
}

// =============================================================================
// Manager
// =============================================================================

struct Session {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Keeps one connector connected.
///
/// `connect`, `update_symbols` and `disconnect` form the connector contract
/// seen by the rest of the service. Symbol updates go through a watch
/// channel so the running session applies only the delta.
pub struct ReconnectManager {
    connector: Arc<dyn SourceConnector>,
    config: ReconnectConfig,
    sink: FeedEventSink,
    symbols_tx: watch::Sender<SymbolSet>,
    reset_tx: watch::Sender<u64>,
    session: Mutex<Option<Session>>,
}

impl ReconnectManager {
    /// Wrap a connector.
    #[must_use]
    pub fn new(connector: Arc<dyn SourceConnector>, config: ReconnectConfig, sink: FeedEventSink) -> Self {
        let (symbols_tx, _) = watch::channel(SymbolSet::new());
        let (reset_tx, _) = watch::channel(0);
        Self {
            connector,
            config,
            sink,
            symbols_tx,
            reset_tx,
            session: Mutex::new(None),
        }
    }

    /// Wrapped source.
    #[must_use]
    pub fn source(&self) -> SourceId {
        self.connector.id()
    }

    /// Static description of the wrapped source.
    #[must_use]
    pub fn descriptor(&self) -> &SourceDescriptor {
        self.connector.descriptor()
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.sink.state()
    }

    /// Symbols the connector is asked to track.
    #[must_use]
    pub fn symbols(&self) -> SymbolSet {
        self.symbols_tx.borrow().clone()
    }

    /// Whether a supervision loop is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.session
            .lock()
            .as_ref()
            .is_some_and(|s| !s.handle.is_finished())
    }

    /// Start supervising the connector. A no-op when already running.
    pub fn connect(&self, symbols: SymbolSet, tracker: &TaskTracker, parent: &CancellationToken) {
        self.update_symbols(symbols);

        let mut session = self.session.lock();
        if session.as_ref().is_some_and(|s| !s.handle.is_finished()) {
            return;
        }

        let cancel = parent.child_token();
        let supervisor = Supervisor {
            connector: Arc::clone(&self.connector),
            sink: self.sink.clone(),
            policy: ReconnectPolicy::new(self.config.clone()),
            symbols_rx: self.symbols_tx.subscribe(),
            reset_rx: self.reset_tx.subscribe(),
            cancel: cancel.clone(),
        };
        let handle = tracker.spawn(supervisor.run());
        *session = Some(Session { cancel, handle });
    }

    /// Replace the tracked symbol set. Returns `false` when nothing changed.
    pub fn update_symbols(&self, symbols: SymbolSet) -> bool {
        self.symbols_tx.send_if_modified(|current| {
            if *current == symbols {
                false
            } else {
                *current = symbols;
                true
            }
        })
    }

    /// Cancel the session and any pending reconnect, then wait for teardown.
    pub async fn disconnect(&self) {
        let session = self.session.lock().take();
        if let Some(session) = session {
            session.cancel.cancel();
            if let Err(e) = session.handle.await {
                tracing::warn!(source = %self.source(), error = %e, "Supervisor task failed");
            }
        }
        self.sink.set_state(ConnectionState::Disconnected).await;
    }

    /// Leave `FailedPermanently` (or skip a pending backoff) and retry now.
    pub fn reset(&self) {
        tracing::info!(source = %self.source(), "Reconnect reset requested");
        self.reset_tx.send_modify(|generation| *generation += 1);
    }
}

struct Supervisor {
    connector: Arc<dyn SourceConnector>,
    sink: FeedEventSink,
    policy: ReconnectPolicy,
    symbols_rx: watch::Receiver<SymbolSet>,
    reset_rx: watch::Receiver<u64>,
    cancel: CancellationToken,
}

impl Supervisor {
    async fn run(mut self) {
        let source = self.connector.id();

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            // Resets requested while healthy do not carry over
            self.reset_rx.borrow_and_update();

            tracing::info!(source = %source, endpoint = %self.connector.descriptor().endpoint, "Connecting");
            self.sink.set_state(ConnectionState::Connecting).await;

            let session_cancel = self.cancel.child_token();
            let result = tokio::select! {
                () = self.cancel.cancelled() => Ok(()),
                result = self.connector.connect(
                    self.symbols_rx.clone(),
                    self.sink.clone(),
                    session_cancel.clone(),
                ) => result,
            };
            session_cancel.cancel();

            if self.cancel.is_cancelled() {
                break;
            }

            self.policy.on_session_end(self.sink.connected_for(Instant::now()));

            match result {
                Ok(()) => {
                    tracing::warn!(source = %source, "Session ended without error");
                    self.sink.set_state(ConnectionState::Disconnected).await;
                }
                Err(e) if e.kind() == ErrorKind::Authentication => {
                    tracing::error!(source = %source, error = %e, "Authentication rejected, not retrying");
                    self.sink.error(e).await;
                    if !self.park().await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    let state = if e.degrades() {
                        ConnectionState::Degraded
                    } else {
                        ConnectionState::Disconnected
                    };
                    tracing::warn!(source = %source, error = %e, state = %state, "Session ended");
                    self.sink.error(e).await;
                    self.sink.set_state(state).await;
                }
            }

            let Some(delay) = self.policy.next_delay() else {
                tracing::error!(
                    source = %source,
                    attempts = self.policy.attempt_count(),
                    "Reconnect attempts exhausted"
                );
                if !self.park().await {
                    break;
                }
                continue;
            };

            let attempt = self.policy.attempt_count();
            tracing::info!(
                source = %source,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Reconnecting"
            );
            metrics::record_reconnect(source);
            self.sink.reconnecting(attempt, delay).await;

            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
                changed = self.reset_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.policy.reset();
                }
            }
        }

        tracing::info!(source = %source, "Supervisor stopped");
    }

    /// Sit in `FailedPermanently` until reset. Returns `false` on shutdown.
    async fn park(&mut self) -> bool {
        self.sink.set_state(ConnectionState::FailedPermanently).await;

        tokio::select! {
            () = self.cancel.cancelled() => false,
            changed = self.reset_rx.changed() => {
                if changed.is_err() {
                    return false;
                }
                tracing::info!(source = %self.connector.id(), "Leaving failed state after reset");
                self.policy.reset();
                true
            }
        }
    }
}
