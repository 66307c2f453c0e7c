//! Connection Model
//!
//! Static description of each upstream source and the connection states a
//! connector moves through at runtime.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use super::tick::SourceId;

// =============================================================================
// Connection State
// =============================================================================

/// Lifecycle state of one source connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not connected and not trying.
    #[default]
    Disconnected,
    /// Connection or authentication in progress.
    Connecting,
    /// Live and delivering data.
    Connected,
    /// Unhealthy; a reconnect is scheduled.
    Degraded,
    /// Retries exhausted or credentials rejected; waits for an explicit reset.
    FailedPermanently,
}

impl ConnectionState {
    /// State name for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Degraded => "degraded",
            Self::FailedPermanently => "failed_permanently",
        }
    }

    /// Whether the connection is live.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Numeric encoding for the connection state gauge.
    #[must_use]
    pub const fn as_gauge(self) -> f64 {
        match self {
            Self::Disconnected => 0.0,
            Self::Connecting => 1.0,
            Self::Connected => 2.0,
            Self::Degraded => 3.0,
            Self::FailedPermanently => 4.0,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Source Descriptor
// =============================================================================

/// How a source delivers data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum TransportKind {
    /// Persistent streaming connection.
    Push,
    /// Fixed-interval request/response.
    Poll {
        /// Time between poll cycles.
        #[serde(with = "duration_millis")]
        interval: Duration,
    },
}

impl TransportKind {
    /// Whether this is a polling transport.
    #[must_use]
    pub const fn is_poll(self) -> bool {
        matches!(self, Self::Poll { .. })
    }

    /// Transport name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Poll { .. } => "poll",
        }
    }
}

/// Static configuration of one upstream source. Immutable after load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceDescriptor {
    /// Source identity.
    pub id: SourceId,
    /// Rank; lower is preferred.
    pub priority: u8,
    /// Push or poll.
    pub transport: TransportKind,
    /// WebSocket URL or HTTP endpoint.
    pub endpoint: String,
    /// Maximum silence before the source is considered degraded.
    #[serde(with = "duration_millis")]
    pub heartbeat_timeout: Duration,
    /// Poll failures tolerated in a row before degrading.
    pub max_consecutive_failures: u32,
    /// Upper bound on any single remote wait (connect, auth, request).
    #[serde(with = "duration_millis")]
    pub request_timeout: Duration,
}

impl SourceDescriptor {
    /// Push source with default timeouts.
    #[must_use]
    pub fn push(id: SourceId, priority: u8, endpoint: impl Into<String>) -> Self {
        Self {
            id,
            priority,
            transport: TransportKind::Push,
            endpoint: endpoint.into(),
            heartbeat_timeout: Duration::from_secs(5),
            max_consecutive_failures: 3,
            request_timeout: Duration::from_secs(10),
        }
    }

    /// Poll source with default timeouts.
    #[must_use]
    pub fn poll(id: SourceId, priority: u8, endpoint: impl Into<String>, interval: Duration) -> Self {
        Self {
            id,
            priority,
            transport: TransportKind::Poll { interval },
            endpoint: endpoint.into(),
            heartbeat_timeout: interval.saturating_mul(3),
            max_consecutive_failures: 3,
            request_timeout: Duration::from_secs(10),
        }
    }

    /// Override the heartbeat timeout.
    #[must_use]
    pub const fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    /// Override the consecutive failure limit.
    #[must_use]
    pub const fn with_max_consecutive_failures(mut self, max: u32) -> Self {
        self.max_consecutive_failures = max;
        self
    }

    /// Override the request timeout.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::Serializer;

    #[allow(clippy::trivially_copy_pass_by_ref)]
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }
}

// =============================================================================
// Protocol Error Window
// =============================================================================

/// Sliding-window counter of malformed payloads.
///
/// A connector stays up while errors are sporadic; once more than
/// `max_errors` land inside `window` the connection is treated as degraded.
#[derive(Debug, Clone)]
pub struct ProtocolErrorWindow {
    max_errors: u32,
    window: Duration,
    errors: VecDeque<Instant>,
    total: u64,
}

impl ProtocolErrorWindow {
    /// Create an empty window.
    #[must_use]
    pub const fn new(max_errors: u32, window: Duration) -> Self {
        Self {
            max_errors,
            window,
            errors: VecDeque::new(),
            total: 0,
        }
    }

    /// Record one error at `now`. Returns `true` when the threshold is exceeded.
    pub fn record(&mut self, now: Instant) -> bool {
        self.total += 1;
        self.errors.push_back(now);
        self.evict(now);
        self.errors.len() > self.max_errors as usize
    }

    /// Errors currently inside the window.
    #[must_use]
    pub fn recent(&mut self, now: Instant) -> usize {
        self.evict(now);
        self.errors.len()
    }

    /// Errors recorded since creation.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.total
    }

    /// Window length.
    #[must_use]
    pub const fn window(&self) -> Duration {
        self.window
    }

    /// Forget recent errors, e.g. on a fresh session.
    pub fn clear(&mut self) {
        self.errors.clear();
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&oldest) = self.errors.front() {
            if now.saturating_duration_since(oldest) > self.window {
                self.errors.pop_front();
            } else {
                break;
            }
        }
    }
}
