//! Failover Coordinator
//!
//! Decides which source is active for each symbol in demand.
//!
//! # Selection Rule
//!
//! The active source for a symbol is the highest-priority source that is
//! `Connected`, reports the symbol as tracked, and has not been marked stale
//! for it. If none qualifies, the lowest-priority source (the polling feed
//! when one is configured) is used unconditionally, unless it has failed
//! permanently, in which case the symbol has no source.
//!
//! Every input returns the [`FailoverEvent`]s it caused. A symbol's first
//! assignment and its removal from demand produce no event.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use super::connection::{ConnectionState, SourceDescriptor};
use super::tick::{SourceId, Symbol, SymbolSet};

/// Active source switch for one symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailoverEvent {
    /// Affected symbol.
    pub symbol: Symbol,
    /// Previously active source.
    pub from_source: Option<SourceId>,
    /// Newly active source (`None` when no source is left).
    pub to_source: Option<SourceId>,
    /// When the switch happened.
    pub at: DateTime<Utc>,
}

/// Current routing decision for one symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailoverDecision {
    /// Symbol.
    pub symbol: Symbol,
    /// Source whose ticks are forwarded.
    pub active_source_id: Option<SourceId>,
}

#[derive(Debug, Clone, Copy)]
struct Assignment {
    source: Option<SourceId>,
    since: Instant,
}

/// Ranks sources and tracks the active one per symbol.
#[derive(Debug)]
pub struct FailoverCoordinator {
    ranked: Vec<SourceDescriptor>,
    fallback: Option<SourceId>,
    states: HashMap<SourceId, ConnectionState>,
    tracking: HashMap<SourceId, SymbolSet>,
    stale: HashSet<(SourceId, Symbol)>,
    assignments: BTreeMap<Symbol, Assignment>,
}

impl FailoverCoordinator {
    /// Create a coordinator over the configured sources.
    #[must_use]
    pub fn new(sources: impl IntoIterator<Item = SourceDescriptor>) -> Self {
        let mut ranked: Vec<SourceDescriptor> = sources.into_iter().collect();
        ranked.sort_by_key(|s| (s.priority, s.id));

        let fallback = ranked
            .iter()
            .rev()
            .find(|s| s.transport.is_poll())
            .or_else(|| ranked.last())
            .map(|s| s.id);

        Self {
            ranked,
            fallback,
            states: HashMap::new(),
            tracking: HashMap::new(),
            stale: HashSet::new(),
            assignments: BTreeMap::new(),
        }
    }

    /// Sources in preference order.
    #[must_use]
    pub fn ranked(&self) -> &[SourceDescriptor] {
        &self.ranked
    }

    /// Descriptor of a source.
    #[must_use]
    pub fn descriptor(&self, source: SourceId) -> Option<&SourceDescriptor> {
        self.ranked.iter().find(|s| s.id == source)
    }

    /// Source used when nothing better qualifies.
    #[must_use]
    pub const fn fallback(&self) -> Option<SourceId> {
        self.fallback
    }

    /// Last reported state of a source.
    #[must_use]
    pub fn state(&self, source: SourceId) -> ConnectionState {
        self.states.get(&source).copied().unwrap_or_default()
    }

    /// Compute the source that should be active for a symbol.
    #[must_use]
    pub fn select(&self, symbol: &str) -> Option<SourceId> {
        let preferred = self.ranked.iter().map(|s| s.id).find(|&id| {
            self.state(id).is_connected()
                && self.tracking.get(&id).is_some_and(|set| set.contains(symbol))
                && !self.stale.contains(&(id, symbol.to_string()))
        });

        preferred.or_else(|| {
            self.fallback
                .filter(|&id| self.state(id) != ConnectionState::FailedPermanently)
        })
    }

    /// Replace the set of symbols in demand. New symbols get their initial assignment.
    pub fn set_demand(&mut self, demand: &SymbolSet, now: Instant) {
        self.assignments.retain(|symbol, _| demand.contains(symbol));
        self.stale.retain(|(_, symbol)| demand.contains(symbol));

        for symbol in demand {
            if !self.assignments.contains_key(symbol) {
                let source = self.select(symbol);
                self.assignments
                    .insert(symbol.clone(), Assignment { source, since: now });
            }
        }
    }

    /// A source changed connection state.
    pub fn on_state_changed(
        &mut self,
        source: SourceId,
        state: ConnectionState,
        now: Instant,
    ) -> Vec<FailoverEvent> {
        let previous = self.states.insert(source, state);
        if previous == Some(state) {
            return Vec::new();
        }
        if state.is_connected() {
            // Fresh session gets another chance on every symbol
            self.stale.retain(|(id, _)| *id != source);
        }
        self.recompute(now)
    }

    /// A source reported the symbols it is tracking.
    pub fn on_tracking_changed(
        &mut self,
        source: SourceId,
        symbols: SymbolSet,
        now: Instant,
    ) -> Vec<FailoverEvent> {
        if self.tracking.get(&source) == Some(&symbols) {
            return Vec::new();
        }
        self.tracking.insert(source, symbols);
        self.recompute(now)
    }

    /// A source stopped delivering a symbol while reporting it as tracked.
    pub fn mark_stale(&mut self, source: SourceId, symbol: &str, now: Instant) -> Vec<FailoverEvent> {
        if !self.stale.insert((source, symbol.to_string())) {
            return Vec::new();
        }
        self.recompute(now)
    }

    /// A previously stale source delivered the symbol again.
    pub fn clear_stale(&mut self, source: SourceId, symbol: &str, now: Instant) -> Vec<FailoverEvent> {
        if !self.stale.remove(&(source, symbol.to_string())) {
            return Vec::new();
        }
        self.recompute(now)
    }

    /// Whether a source is marked stale for a symbol.
    #[must_use]
    pub fn is_stale(&self, source: SourceId, symbol: &str) -> bool {
        self.stale.contains(&(source, symbol.to_string()))
    }

    /// Source whose ticks are currently forwarded for a symbol.
    #[must_use]
    pub fn active_source(&self, symbol: &str) -> Option<SourceId> {
        self.assignments.get(symbol).and_then(|a| a.source)
    }

    /// Whether ticks from `source` for `symbol` should be forwarded.
    #[must_use]
    pub fn is_active(&self, source: SourceId, symbol: &str) -> bool {
        self.active_source(symbol) == Some(source)
    }

    /// When the current assignment for a symbol began.
    #[must_use]
    pub fn assigned_since(&self, symbol: &str) -> Option<Instant> {
        self.assignments.get(symbol).map(|a| a.since)
    }

    /// Current decision for every symbol in demand.
    #[must_use]
    pub fn decisions(&self) -> Vec<FailoverDecision> {
        self.assignments
            .iter()
            .map(|(symbol, assignment)| FailoverDecision {
                symbol: symbol.clone(),
                active_source_id: assignment.source,
            })
            .collect()
    }

    fn recompute(&mut self, now: Instant) -> Vec<FailoverEvent> {
        let symbols: Vec<Symbol> = self.assignments.keys().cloned().collect();
        let mut events = Vec::new();

        for symbol in symbols {
            let selected = self.select(&symbol);
            let Some(assignment) = self.assignments.get_mut(&symbol) else {
                continue;
            };
            if assignment.source == selected {
                continue;
            }

            events.push(FailoverEvent {
                symbol,
                from_source: assignment.source,
                to_source: selected,
                at: Utc::now(),
            });
            *assignment = Assignment {
                source: selected,
                since: now,
            };
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn sources() -> Vec<SourceDescriptor> {
        vec![
            SourceDescriptor::poll(SourceId::Polling, 2, "http://poll", Duration::from_secs(1)),
            SourceDescriptor::push(SourceId::Primary, 0, "ws://primary"),
            SourceDescriptor::push(SourceId::Secondary, 1, "ws://secondary"),
        ]
    }

    fn set(list: &[&str]) -> SymbolSet {
        list.iter().map(ToString::to_string).collect()
    }

    fn live(coordinator: &mut FailoverCoordinator, source: SourceId, symbols: &[&str]) {
        let now = Instant::now();
        coordinator.on_state_changed(source, ConnectionState::Connected, now);
        coordinator.on_tracking_changed(source, set(symbols), now);
    }

    #[test]
    fn ranks_by_priority_and_picks_poll_fallback() {
        let coordinator = FailoverCoordinator::new(sources());
        let ids: Vec<_> = coordinator.ranked().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![SourceId::Primary, SourceId::Secondary, SourceId::Polling]);
        assert_eq!(coordinator.fallback(), Some(SourceId::Polling));
    }

    #[test]
    fn fallback_used_when_nothing_connected() {
        let mut coordinator = FailoverCoordinator::new(sources());
        coordinator.set_demand(&set(&["BTCUSDT"]), Instant::now());

        assert_eq!(coordinator.active_source("BTCUSDT"), Some(SourceId::Polling));
    }

    #[test]
    fn highest_priority_connected_tracking_source_wins() {
        let mut coordinator = FailoverCoordinator::new(sources());
        coordinator.set_demand(&set(&["BTCUSDT"]), Instant::now());

        live(&mut coordinator, SourceId::Secondary, &["BTCUSDT"]);
        assert_eq!(coordinator.active_source("BTCUSDT"), Some(SourceId::Secondary));

        live(&mut coordinator, SourceId::Primary, &["BTCUSDT"]);
        assert_eq!(coordinator.active_source("BTCUSDT"), Some(SourceId::Primary));
        assert!(coordinator.is_active(SourceId::Primary, "BTCUSDT"));
        assert!(!coordinator.is_active(SourceId::Secondary, "BTCUSDT"));
    }

    #[test]
    fn connected_but_not_tracking_is_skipped() {
        let mut coordinator = FailoverCoordinator::new(sources());
        coordinator.set_demand(&set(&["BTCUSDT", "ETHUSDT"]), Instant::now());
        live(&mut coordinator, SourceId::Primary, &["BTCUSDT"]);

        assert_eq!(coordinator.active_source("BTCUSDT"), Some(SourceId::Primary));
        assert_eq!(coordinator.active_source("ETHUSDT"), Some(SourceId::Polling));
    }

    #[test]
    fn degraded_primary_fails_over_to_next_connected() {
        let mut coordinator = FailoverCoordinator::new(sources());
        coordinator.set_demand(&set(&["BTCUSDT"]), Instant::now());
        live(&mut coordinator, SourceId::Primary, &["BTCUSDT"]);
        live(&mut coordinator, SourceId::Secondary, &["BTCUSDT"]);

        let events =
            coordinator.on_state_changed(SourceId::Primary, ConnectionState::Degraded, Instant::now());

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].symbol, "BTCUSDT");
        assert_eq!(events[0].from_source, Some(SourceId::Primary));
        assert_eq!(events[0].to_source, Some(SourceId::Secondary));
    }

    #[test]
    fn recovery_promotes_back() {
        let mut coordinator = FailoverCoordinator::new(sources());
        coordinator.set_demand(&set(&["BTCUSDT"]), Instant::now());
        live(&mut coordinator, SourceId::Primary, &["BTCUSDT"]);
        coordinator.on_state_changed(SourceId::Primary, ConnectionState::Degraded, Instant::now());
        assert_eq!(coordinator.active_source("BTCUSDT"), Some(SourceId::Polling));

        let events =
            coordinator.on_state_changed(SourceId::Primary, ConnectionState::Connected, Instant::now());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].to_source, Some(SourceId::Primary));
    }

    #[test]
    fn repeated_state_is_not_an_event() {
        let mut coordinator = FailoverCoordinator::new(sources());
        coordinator.set_demand(&set(&["BTCUSDT"]), Instant::now());
        live(&mut coordinator, SourceId::Primary, &["BTCUSDT"]);

        let events =
            coordinator.on_state_changed(SourceId::Primary, ConnectionState::Connected, Instant::now());
        assert!(events.is_empty());
    }

    #[test]
    fn stale_source_is_demoted_until_cleared() {
        let mut coordinator = FailoverCoordinator::new(sources());
        coordinator.set_demand(&set(&["BTCUSDT"]), Instant::now());
        live(&mut coordinator, SourceId::Primary, &["BTCUSDT"]);

        let events = coordinator.mark_stale(SourceId::Primary, "BTCUSDT", Instant::now());
        assert_eq!(events[0].to_source, Some(SourceId::Polling));
        assert!(coordinator.is_stale(SourceId::Primary, "BTCUSDT"));
        assert!(coordinator.mark_stale(SourceId::Primary, "BTCUSDT", Instant::now()).is_empty());

        let events = coordinator.clear_stale(SourceId::Primary, "BTCUSDT", Instant::now());
        assert_eq!(events[0].to_source, Some(SourceId::Primary));
    }

    #[test]
    fn all_failed_leaves_symbol_without_source() {
        let mut coordinator = FailoverCoordinator::new(sources());
        coordinator.set_demand(&set(&["BTCUSDT"]), Instant::now());

        let events = coordinator.on_state_changed(
            SourceId::Polling,
            ConnectionState::FailedPermanently,
            Instant::now(),
        );

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].to_source, None);
        assert_eq!(coordinator.active_source("BTCUSDT"), None);
        assert_eq!(
            coordinator.decisions(),
            vec![FailoverDecision {
                symbol: "BTCUSDT".to_string(),
                active_source_id: None
            }]
        );
    }

    #[test]
    fn removed_demand_emits_nothing() {
        let mut coordinator = FailoverCoordinator::new(sources());
        coordinator.set_demand(&set(&["BTCUSDT"]), Instant::now());
        coordinator.mark_stale(SourceId::Polling, "BTCUSDT", Instant::now());

        coordinator.set_demand(&SymbolSet::new(), Instant::now());
        assert!(coordinator.decisions().is_empty());
        assert!(coordinator.active_source("BTCUSDT").is_none());
        assert!(!coordinator.is_stale(SourceId::Polling, "BTCUSDT"));
    }

    #[test]
    fn without_poll_source_lowest_priority_is_fallback() {
        let coordinator = FailoverCoordinator::new(vec![
            SourceDescriptor::push(SourceId::Primary, 0, "ws://a"),
            SourceDescriptor::push(SourceId::Secondary, 5, "ws://b"),
        ]);
        assert_eq!(coordinator.fallback(), Some(SourceId::Secondary));
    }
}
