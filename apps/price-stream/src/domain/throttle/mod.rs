//! Throttle Buffer
//!
//! Per-symbol rate limiter with trailing-edge coalescing. Bursts inside one
//! throttle window collapse into a single emission carrying the freshest
//! value received in that window.
//!
//! The buffer is a pure state machine: callers pass the current instant and
//! drive the trailing timer themselves using [`ThrottleBuffer::next_deadline`].
//!
//! # Rules
//!
//! For a tick arriving at `now`:
//! - If a trailing timer is armed, the tick replaces the pending value.
//! - Otherwise, if the symbol has been quiet for a full window (no emission
//!   and no update within `interval`), the tick is forwarded at once.
//! - Otherwise a timer is armed for `last_emitted + interval` (or
//!   `now + interval` for a symbol never emitted) and the tick is held.
//!
//! Under continuous updates this yields one emission per window; an
//! isolated update is never held longer than one window.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use super::tick::{PriceTick, Symbol};

#[derive(Debug, Default)]
struct SymbolWindow {
    last_emitted_at: Option<Instant>,
    last_received_at: Option<Instant>,
    last_value: Option<PriceTick>,
    deadline: Option<Instant>,
}

impl SymbolWindow {
    fn quiet_for(last: Option<Instant>, now: Instant, interval: Duration) -> bool {
        last.is_some_and(|at| now.saturating_duration_since(at) >= interval)
    }
}

/// Per-symbol trailing-edge throttle.
#[derive(Debug)]
pub struct ThrottleBuffer {
    interval: Duration,
    symbols: HashMap<Symbol, SymbolWindow>,
    coalesced: u64,
}

impl ThrottleBuffer {
    /// Create a buffer with the given throttle window.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            symbols: HashMap::new(),
            coalesced: 0,
        }
    }

    /// Throttle window.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Accept a tick. Returns it back when it should be forwarded immediately.
    pub fn accept(&mut self, tick: PriceTick, now: Instant) -> Option<PriceTick> {
        let interval = self.interval;
        let window = self.symbols.entry(tick.symbol().to_string()).or_default();
        let previous_received = window.last_received_at.replace(now);

        if window.deadline.is_some() {
            if window.last_value.replace(tick).is_some() {
                self.coalesced += 1;
            }
            return None;
        }

        let emitted_long_ago = SymbolWindow::quiet_for(window.last_emitted_at, now, interval);
        let idle_long_enough = SymbolWindow::quiet_for(previous_received, now, interval);

        if emitted_long_ago || idle_long_enough {
            window.last_emitted_at = Some(now);
            return Some(tick);
        }

        let deadline = window
            .last_emitted_at
            .map_or(now + interval, |emitted| emitted + interval);
        window.deadline = Some(deadline);
        window.last_value = Some(tick);
        None
    }

    /// Earliest armed trailing timer, if any.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.symbols.values().filter_map(|w| w.deadline).min()
    }

    /// Fire every trailing timer due at `now`, returning the held values in deadline order.
    pub fn fire(&mut self, now: Instant) -> Vec<PriceTick> {
        let mut due: Vec<(Instant, PriceTick)> = Vec::new();

        for window in self.symbols.values_mut() {
            let Some(deadline) = window.deadline else {
                continue;
            };
            if deadline > now {
                continue;
            }
            window.deadline = None;
            if let Some(tick) = window.last_value.take() {
                window.last_emitted_at = Some(now);
                due.push((deadline, tick));
            }
        }

        due.sort_by_key(|(deadline, _)| *deadline);
        due.into_iter().map(|(_, tick)| tick).collect()
    }

    /// Drop all state for a symbol that left demand.
    pub fn forget(&mut self, symbol: &str) {
        self.symbols.remove(symbol);
    }

    /// When the symbol was last forwarded.
    #[must_use]
    pub fn last_emitted_at(&self, symbol: &str) -> Option<Instant> {
        self.symbols.get(symbol).and_then(|w| w.last_emitted_at)
    }

    /// Value currently held for a symbol.
    #[must_use]
    pub fn pending(&self, symbol: &str) -> Option<&PriceTick> {
        self.symbols.get(symbol).and_then(|w| w.last_value.as_ref())
    }

    /// Updates replaced before they could be emitted.
    #[must_use]
    pub const fn coalesced(&self) -> u64 {
        self.coalesced
    }

    /// Symbols with throttle state.
    #[must_use]
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    /// Whether no symbol has throttle state.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}
