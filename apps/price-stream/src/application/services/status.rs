//! Stream Status
//!
//! Read-only view of the streaming core for dashboards and health checks.
//!
//! The routing task is the only writer of the [`StatusBoard`]; `status()`
//! takes a snapshot under a short read lock and never touches routing state,
//! so polling it repeatedly cannot race with a failover decision.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::Instant;

use crate::application::ports::{ErrorKind, FeedError};
use crate::domain::connection::{ConnectionState, SourceDescriptor};
use crate::domain::failover::FailoverDecision;
use crate::domain::tick::{SourceId, Symbol};

// =============================================================================
// Status Types
// =============================================================================

/// Most recent error reported by a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LastError {
    /// Taxonomy class.
    pub kind: ErrorKind,
    /// Human-readable detail.
    pub message: String,
    /// When it was reported.
    pub at: DateTime<Utc>,
}

/// Health of one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceStatus {
    /// Current connection state.
    pub state: ConnectionState,
    /// Rank (lower is preferred).
    pub priority: u8,
    /// `push` or `poll`.
    pub transport: &'static str,
    /// Pending reconnect attempt (0 while connected).
    pub reconnect_attempts: u32,
    /// Normalized ticks received since start.
    pub ticks_received: u64,
    /// Malformed payloads since start.
    pub protocol_errors: u64,
    /// Symbols the upstream currently delivers.
    pub tracked_symbols: usize,
    /// When the source last became `Connected`.
    pub last_connected_at: Option<DateTime<Utc>>,
    /// Most recent error.
    pub last_error: Option<LastError>,
}

impl SourceStatus {
    fn new(descriptor: &SourceDescriptor) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            priority: descriptor.priority,
            transport: descriptor.transport.as_str(),
            reconnect_attempts: 0,
            ticks_received: 0,
            protocol_errors: 0,
            tracked_symbols: 0,
            last_connected_at: None,
            last_error: None,
        }
    }
}

/// Snapshot returned by `status()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamStatus {
    /// Source whose ticks are forwarded, per symbol in demand.
    pub active_source_per_symbol: BTreeMap<Symbol, Option<SourceId>>,
    /// Health of every configured source.
    pub connection_states: BTreeMap<SourceId, SourceStatus>,
    /// Milliseconds since the last forwarded tick, per symbol in demand.
    pub last_tick_age_ms_per_symbol: BTreeMap<Symbol, Option<u64>>,
    /// Consumers with at least one open stream.
    pub consumers: usize,
    /// Distinct symbols in demand.
    pub symbols_in_demand: usize,
}

impl StreamStatus {
    /// Whether any source is currently `Connected`.
    #[must_use]
    pub fn any_connected(&self) -> bool {
        self.connection_states
            .values()
            .any(|s| s.state.is_connected())
    }

    /// Symbols that currently have no source.
    #[must_use]
    pub fn unsourced_symbols(&self) -> Vec<&Symbol> {
        self.active_source_per_symbol
            .iter()
            .filter(|(_, source)| source.is_none())
            .map(|(symbol, _)| symbol)
            .collect()
    }
}

// =============================================================================
// Status Board
// =============================================================================

#[derive(Debug, Default)]
struct BoardState {
    sources: BTreeMap<SourceId, SourceStatus>,
    active: BTreeMap<Symbol, Option<SourceId>>,
    last_tick_at: HashMap<Symbol, Instant>,
}

/// Shared health snapshot written by the routing task.
#[derive(Debug, Default)]
pub struct StatusBoard {
    state: RwLock<BoardState>,
}

impl StatusBoard {
    /// Create a board for the configured sources.
    #[must_use]
    pub fn new<'a>(sources: impl IntoIterator<Item = &'a SourceDescriptor>) -> Self {
        let sources = sources
            .into_iter()
            .map(|d| (d.id, SourceStatus::new(d)))
            .collect();
        Self {
            state: RwLock::new(BoardState {
                sources,
                ..BoardState::default()
            }),
        }
    }

    pub(crate) fn record_state(&self, source: SourceId, state: ConnectionState) {
        let mut board = self.state.write();
        if let Some(status) = board.sources.get_mut(&source) {
            status.state = state;
            if state.is_connected() {
                status.reconnect_attempts = 0;
                status.last_connected_at = Some(Utc::now());
            }
        }
    }

    pub(crate) fn record_tick(&self, source: SourceId) {
        if let Some(status) = self.state.write().sources.get_mut(&source) {
            status.ticks_received += 1;
        }
    }

    pub(crate) fn record_tracking(&self, source: SourceId, tracked: usize) {
        if let Some(status) = self.state.write().sources.get_mut(&source) {
            status.tracked_symbols = tracked;
        }
    }

    pub(crate) fn record_reconnect(&self, source: SourceId, attempt: u32) {
        if let Some(status) = self.state.write().sources.get_mut(&source) {
            status.reconnect_attempts = attempt;
        }
    }

    pub(crate) fn record_error(&self, source: SourceId, error: &FeedError) {
        if let Some(status) = self.state.write().sources.get_mut(&source) {
            if matches!(error, FeedError::Protocol(_)) {
                status.protocol_errors += 1;
            }
            status.last_error = Some(LastError {
                kind: error.kind(),
                message: error.to_string(),
                at: Utc::now(),
            });
        }
    }

    pub(crate) fn record_forwarded(&self, symbol: &str, now: Instant) {
        let mut board = self.state.write();
        if let Some(at) = board.last_tick_at.get_mut(symbol) {
            *at = now;
        } else {
            board.last_tick_at.insert(symbol.to_string(), now);
        }
    }

    pub(crate) fn set_active(&self, symbol: &str, source: Option<SourceId>) {
        if let Some(active) = self.state.write().active.get_mut(symbol) {
            *active = source;
        }
    }

    /// Replace the per-symbol view with the coordinator's decisions.
    pub(crate) fn sync_decisions(&self, decisions: Vec<FailoverDecision>) {
        let mut board = self.state.write();
        board.active = decisions
            .into_iter()
            .map(|d| (d.symbol, d.active_source_id))
            .collect();
        let BoardState {
            active,
            last_tick_at,
            ..
        } = &mut *board;
        last_tick_at.retain(|symbol, _| active.contains_key(symbol));
    }

    /// Take a snapshot. Consumer counts are filled in by the caller.
    #[must_use]
    pub fn snapshot(&self, now: Instant) -> StreamStatus {
        let board = self.state.read();
        let last_tick_age_ms_per_symbol = board
            .active
            .keys()
            .map(|symbol| {
                let age = board.last_tick_at.get(symbol).map(|at| {
                    u64::try_from(now.saturating_duration_since(*at).as_millis()).unwrap_or(u64::MAX)
                });
                (symbol.clone(), age)
            })
            .collect();

        StreamStatus {
            active_source_per_symbol: board.active.clone(),
            connection_states: board.sources.clone(),
            last_tick_age_ms_per_symbol,
            consumers: 0,
            symbols_in_demand: board.active.len(),
        }
    }
}
