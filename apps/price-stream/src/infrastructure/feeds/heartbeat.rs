//! Heartbeat Watchdog
//!
//! Detects silent push connections. Any inbound frame (price, keepalive,
//! ping or pong) counts as activity. The watchdog asks the connection to
//! send a WebSocket ping every `ping_interval` and reports a timeout once
//! nothing has arrived for `timeout`.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Configuration for heartbeat behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Interval between ping frames.
    pub ping_interval: Duration,
    /// Maximum silence before the connection is considered dead.
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self::from_timeout(Duration::from_secs(5))
    }
}

impl HeartbeatConfig {
    /// Create a new configuration with custom values.
    #[must_use]
    pub const fn new(ping_interval: Duration, timeout: Duration) -> Self {
        Self {
            ping_interval,
            timeout,
        }
    }

    /// Ping at half the timeout.
    #[must_use]
    pub fn from_timeout(timeout: Duration) -> Self {
        Self::new(timeout / 2, timeout)
    }

    /// How often silence is checked.
    fn check_interval(&self) -> Duration {
        (self.timeout / 10).max(Duration::from_millis(10))
    }
}

/// Events emitted by the heartbeat watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Send a ping frame.
    SendPing,
    /// Silence exceeded the timeout.
    Timeout,
}

/// Activity clock shared between the watchdog and the read loop.
#[derive(Debug)]
pub struct HeartbeatState {
    last_activity: RwLock<Instant>,
}

impl Default for HeartbeatState {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatState {
    /// Create state with activity recorded now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_activity: RwLock::new(Instant::now()),
        }
    }

    /// Record inbound activity.
    pub fn record_activity(&self) {
        *self.last_activity.write() = Instant::now();
    }

    /// Time since the last inbound frame.
    #[must_use]
    pub fn silence(&self) -> Duration {
        self.last_activity.read().elapsed()
    }
}

/// Watchdog that monitors connection liveness. Runs as a future polled by
/// the session that owns it.
pub struct HeartbeatManager {
    config: HeartbeatConfig,
    state: Arc<HeartbeatState>,
    event_tx: mpsc::Sender<HeartbeatEvent>,
    cancel: CancellationToken,
}

impl HeartbeatManager {
    /// Create a new watchdog.
    #[must_use]
    pub const fn new(
        config: HeartbeatConfig,
        state: Arc<HeartbeatState>,
        event_tx: mpsc::Sender<HeartbeatEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            state,
            event_tx,
            cancel,
        }
    }

    /// Run until cancelled or a timeout is detected.
    pub async fn run(self) {
        let mut check = tokio::time::interval(self.config.check_interval());
        check.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_ping = Instant::now();

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("Heartbeat watchdog cancelled");
                    break;
                }
                _ = check.tick() => {
                    let silence = self.state.silence();
                    if silence > self.config.timeout {
                        tracing::warn!(
                            silence_ms = u64::try_from(silence.as_millis()).unwrap_or(u64::MAX),
                            timeout_ms = u64::try_from(self.config.timeout.as_millis()).unwrap_or(u64::MAX),
                            "Heartbeat timeout detected"
                        );
                        let _ = self.event_tx.send(HeartbeatEvent::Timeout).await;
                        break;
                    }

                    if last_ping.elapsed() >= self.config.ping_interval {
                        last_ping = Instant::now();
                        if self.event_tx.send(HeartbeatEvent::SendPing).await.is_err() {
                            tracing::debug!("Event channel closed, stopping heartbeat");
                            break;
                        }
                    }
                }
            }
        }
    }
}
