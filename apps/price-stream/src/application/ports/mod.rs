//! Port Interfaces
//!
//! Contracts between the streaming core and upstream feed adapters,
//! following the Hexagonal Architecture pattern.
//!
//! ## Driven Ports (Outbound)
//!
//! - [`SourceConnector`]: one upstream connection session (push or poll)
//!
//! Connectors report everything they observe through a [`FeedEventSink`]:
//! state transitions, normalized ticks, the symbols they track, and errors.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::domain::connection::{ConnectionState, ProtocolErrorWindow, SourceDescriptor};
use crate::domain::tick::{PriceTick, RawTick, SourceId, Symbol, SymbolSet, normalize};

// =============================================================================
// Error Taxonomy
// =============================================================================

/// Broad error classes surfaced through status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network fault; retried with backoff.
    TransientNetwork,
    /// Credentials rejected; requires an explicit reset.
    Authentication,
    /// Malformed payload.
    Protocol,
    /// A tracked symbol went silent.
    StaleData,
}

/// Errors raised by connectors and the streaming core.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FeedError {
    /// Connection-level I/O failure.
    #[error("network error: {0}")]
    TransientNetwork(String),

    /// Upstream rejected the credentials.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Payload could not be decoded or normalized.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Too many protocol errors inside the window.
    #[error("{count} protocol errors within {window:?}")]
    ProtocolThreshold {
        /// Errors counted inside the window.
        count: usize,
        /// Window length.
        window: Duration,
    },

    /// No tick for a tracked symbol for too long.
    #[error("no tick for {symbol} in {silence:?}")]
    StaleData {
        /// Silent symbol.
        symbol: Symbol,
        /// Observed silence.
        silence: Duration,
    },

    /// Neither ticks nor keepalives within the heartbeat timeout.
    #[error("heartbeat timeout after {0:?}")]
    HeartbeatTimeout(Duration),

    /// Poll requests failed too many times in a row.
    #[error("{0} consecutive poll failures")]
    ConsecutiveFailures(u32),

    /// A remote wait exceeded its configured timeout.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Upstream closed the connection.
    #[error("connection closed")]
    ConnectionClosed,
}

impl FeedError {
    /// Taxonomy class of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Authentication(_) => ErrorKind::Authentication,
            Self::Protocol(_) | Self::ProtocolThreshold { .. } => ErrorKind::Protocol,
            Self::StaleData { .. } => ErrorKind::StaleData,
            Self::TransientNetwork(_)
            | Self::HeartbeatTimeout(_)
            | Self::ConsecutiveFailures(_)
            | Self::Timeout(_)
            | Self::ConnectionClosed => ErrorKind::TransientNetwork,
        }
    }

    /// Whether the session ended because the source became unhealthy
    /// rather than because the transport dropped.
    #[must_use]
    pub const fn degrades(&self) -> bool {
        matches!(
            self,
            Self::HeartbeatTimeout(_)
                | Self::ProtocolThreshold { .. }
                | Self::ConsecutiveFailures(_)
                | Self::StaleData { .. }
                | Self::Timeout(_)
        )
    }

    /// Whether reconnecting can help.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::Authentication(_))
    }
}

// =============================================================================
// Connector Events
// =============================================================================

/// Something a connector observed.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectorEvent {
    /// Connection state transition.
    StateChanged(ConnectionState),
    /// Normalized price tick.
    Tick(PriceTick),
    /// Symbols the upstream is currently delivering.
    Tracking(SymbolSet),
    /// A reconnect is scheduled.
    Reconnecting {
        /// Attempt number (1-based).
        attempt: u32,
        /// Delay before the attempt.
        delay: Duration,
    },
    /// Non-fatal or session-ending error.
    Error(FeedError),
}

/// A connector event tagged with its source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceEvent {
    /// Originating source.
    pub source: SourceId,
    /// What happened.
    pub event: ConnectorEvent,
}

// =============================================================================
// Event Sink
// =============================================================================

#[derive(Debug)]
struct SinkState {
    state: ConnectionState,
    connected_since: Option<Instant>,
    protocol: ProtocolErrorWindow,
}

/// Handle through which a connector reports to the streaming core.
///
/// Cheap to clone; all clones share the same state and protocol error window.
#[derive(Debug, Clone)]
pub struct FeedEventSink {
    source: SourceId,
    events: mpsc::Sender<SourceEvent>,
    shared: Arc<Mutex<SinkState>>,
}

impl FeedEventSink {
    /// Create a sink for `source` that forwards into `events`.
    #[must_use]
    pub fn new(
        source: SourceId,
        events: mpsc::Sender<SourceEvent>,
        protocol: ProtocolErrorWindow,
    ) -> Self {
        Self {
            source,
            events,
            shared: Arc::new(Mutex::new(SinkState {
                state: ConnectionState::Disconnected,
                connected_since: None,
                protocol,
            })),
        }
    }

    /// Source this sink reports for.
    #[must_use]
    pub const fn source(&self) -> SourceId {
        self.source
    }

    /// Last state reported through this sink.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    /// How long the source has been continuously connected.
    #[must_use]
    pub fn connected_for(&self, now: Instant) -> Option<Duration> {
        self.shared
            .lock()
            .connected_since
            .map(|since| now.saturating_duration_since(since))
    }

    /// Report a state transition. Repeated states are not re-emitted.
    pub async fn set_state(&self, state: ConnectionState) {
        let changed = {
            let mut shared = self.shared.lock();
            if shared.state == state {
                false
            } else {
                shared.state = state;
                if state.is_connected() {
                    shared.connected_since = Some(Instant::now());
                    shared.protocol.clear();
                } else {
                    shared.connected_since = None;
                }
                true
            }
        };

        if changed {
            self.emit(ConnectorEvent::StateChanged(state)).await;
        }
    }

    /// Report a normalized tick.
    pub async fn tick(&self, tick: PriceTick) {
        self.emit(ConnectorEvent::Tick(tick)).await;
    }

    /// Normalize and report a raw payload.
    ///
    /// # Errors
    ///
    /// Returns [`FeedError::ProtocolThreshold`] when the payload is malformed
    /// and the protocol error threshold is exceeded.
    pub async fn raw_tick(&self, raw: &RawTick) -> Result<(), FeedError> {
        match normalize(raw, self.source) {
            Ok(tick) => {
                self.tick(tick).await;
                Ok(())
            }
            Err(e) => self.protocol_error(format!("{e} in {raw:?}")).await,
        }
    }

    /// Count a malformed payload. The payload itself is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`FeedError::ProtocolThreshold`] once too many errors land in the window.
    pub async fn protocol_error(&self, detail: impl Into<String>) -> Result<(), FeedError> {
        let now = Instant::now();
        let (exceeded, count, window) = {
            let mut shared = self.shared.lock();
            let exceeded = shared.protocol.record(now);
            (exceeded, shared.protocol.recent(now), shared.protocol.window())
        };

        let detail = detail.into();
        tracing::debug!(source = %self.source, detail = %detail, "Dropped malformed payload");
        self.emit(ConnectorEvent::Error(FeedError::Protocol(detail))).await;

        if exceeded {
            Err(FeedError::ProtocolThreshold { count, window })
        } else {
            Ok(())
        }
    }

    /// Report the symbols currently delivered by the upstream.
    pub async fn tracking(&self, symbols: SymbolSet) {
        self.emit(ConnectorEvent::Tracking(symbols)).await;
    }

    /// Report a scheduled reconnect.
    pub async fn reconnecting(&self, attempt: u32, delay: Duration) {
        self.emit(ConnectorEvent::Reconnecting { attempt, delay }).await;
    }

    /// Report an error.
    pub async fn error(&self, error: FeedError) {
        self.emit(ConnectorEvent::Error(error)).await;
    }

    async fn emit(&self, event: ConnectorEvent) {
        let event = SourceEvent {
            source: self.source,
            event,
        };
        if self.events.send(event).await.is_err() {
            tracing::trace!(source = %self.source, "Event channel closed");
        }
    }
}

// =============================================================================
// Source Connector
// =============================================================================

/// One upstream feed.
///
/// `connect` runs a single session: it opens the transport, keeps the
/// upstream subscription in line with `symbols` (applying only the delta
/// whenever the watched set changes), reports through `sink`, and returns
/// when the session ends. It returns `Ok(())` only when `cancel` fires;
/// every other exit is an error the caller classifies for reconnection.
/// Dropping the returned future releases the transport.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// Static description of the source.
    fn descriptor(&self) -> &SourceDescriptor;

    /// Source identity.
    fn id(&self) -> SourceId {
        self.descriptor().id
    }

    /// Run one connection session.
    async fn connect(
        &self,
        symbols: watch::Receiver<SymbolSet>,
        sink: FeedEventSink,
        cancel: CancellationToken,
    ) -> Result<(), FeedError>;
}
