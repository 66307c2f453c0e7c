//! Subscription Registry
//!
//! Tracks which symbols are wanted by which consumers.
//!
//! # Design
//!
//! The registry keeps:
//! - The symbol set of every consumer
//! - A reference count per symbol across all consumers
//!
//! The union of all consumer sets is the demand every connector is told to
//! track. All mutation goes through a single mutex so `symbols_in_demand()`
//! is always consistent with the reference counts.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::Serialize;

use super::tick::{Symbol, SymbolSet};

// =============================================================================
// Types
// =============================================================================

/// Unique identifier for a consumer.
pub type ConsumerId = u64;

/// Per-symbol demand as seen by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SymbolSubscription {
    /// Subscribed symbol.
    pub symbol: Symbol,
    /// Number of consumers wanting it.
    pub ref_count: usize,
}

/// Changes to the aggregate demand caused by one registry operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionChanges {
    /// Symbols that entered demand (refcount 0 → 1).
    pub added: SymbolSet,
    /// Symbols that left demand (refcount 1 → 0).
    pub removed: SymbolSet,
}

impl SubscriptionChanges {
    /// Check if demand changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SubscriptionStats {
    /// Consumers with at least one symbol.
    pub consumers: usize,
    /// Distinct symbols in demand.
    pub symbols: usize,
    /// Sum of all reference counts.
    pub total_subscriptions: usize,
}

// =============================================================================
// Registry State
// =============================================================================

#[derive(Debug, Default)]
struct RegistryState {
    consumer_symbols: BTreeMap<ConsumerId, SymbolSet>,
    symbol_refcount: BTreeMap<Symbol, usize>,
}

impl RegistryState {
    fn add(&mut self, consumer: ConsumerId, symbols: impl IntoIterator<Item = Symbol>) -> SymbolSet {
        let consumer_set = self.consumer_symbols.entry(consumer).or_default();
        let mut added = SymbolSet::new();

        for symbol in symbols {
            // Re-subscribing the same symbol does not bump the count
            if !consumer_set.insert(symbol.clone()) {
                continue;
            }

            let refcount = self.symbol_refcount.entry(symbol.clone()).or_insert(0);
            *refcount += 1;
            if *refcount == 1 {
                added.insert(symbol);
            }
        }

        if consumer_set.is_empty() {
            self.consumer_symbols.remove(&consumer);
        }
        added
    }

    fn remove(&mut self, consumer: ConsumerId, symbols: impl IntoIterator<Item = Symbol>) -> SymbolSet {
        let Some(consumer_set) = self.consumer_symbols.get_mut(&consumer) else {
            return SymbolSet::new();
        };

        let mut released = Vec::new();
        for symbol in symbols {
            if consumer_set.remove(&symbol) {
                released.push(symbol);
            }
        }
        if consumer_set.is_empty() {
            self.consumer_symbols.remove(&consumer);
        }

        self.release(released)
    }

    fn remove_consumer(&mut self, consumer: ConsumerId) -> SymbolSet {
        self.consumer_symbols
            .remove(&consumer)
            .map_or_else(SymbolSet::new, |symbols| self.release(symbols))
    }

    fn release(&mut self, symbols: impl IntoIterator<Item = Symbol>) -> SymbolSet {
        let mut removed = SymbolSet::new();
        for symbol in symbols {
            if let Some(refcount) = self.symbol_refcount.get_mut(&symbol) {
                *refcount = refcount.saturating_sub(1);
                if *refcount == 0 {
                    self.symbol_refcount.remove(&symbol);
                    removed.insert(symbol);
                }
            }
        }
        removed
    }
}

// =============================================================================
// Subscription Registry
// =============================================================================

/// Thread-safe reference-counted symbol registry.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    state: Mutex<RegistryState>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add symbols to a consumer's subscription.
    pub fn subscribe(
        &self,
        consumer: ConsumerId,
        symbols: impl IntoIterator<Item = Symbol>,
    ) -> SubscriptionChanges {
        let added = self.state.lock().add(consumer, symbols);
        SubscriptionChanges {
            added,
            removed: SymbolSet::new(),
        }
    }

    /// Remove symbols from a consumer's subscription.
    pub fn unsubscribe(
        &self,
        consumer: ConsumerId,
        symbols: impl IntoIterator<Item = Symbol>,
    ) -> SubscriptionChanges {
        let removed = self.state.lock().remove(consumer, symbols);
        SubscriptionChanges {
            added: SymbolSet::new(),
            removed,
        }
    }

    /// Drop every subscription held by a consumer.
    pub fn consumer_disconnected(&self, consumer: ConsumerId) -> SubscriptionChanges {
        let removed = self.state.lock().remove_consumer(consumer);
        SubscriptionChanges {
            added: SymbolSet::new(),
            removed,
        }
    }

    /// Union of all consumers' symbols.
    #[must_use]
    pub fn symbols_in_demand(&self) -> SymbolSet {
        self.state.lock().symbol_refcount.keys().cloned().collect()
    }

    /// Symbols a single consumer is subscribed to.
    #[must_use]
    pub fn consumer_symbols(&self, consumer: ConsumerId) -> SymbolSet {
        self.state
            .lock()
            .consumer_symbols
            .get(&consumer)
            .cloned()
            .unwrap_or_default()
    }

    /// Current reference count of a symbol.
    #[must_use]
    pub fn ref_count(&self, symbol: &str) -> usize {
        self.state
            .lock()
            .symbol_refcount
            .get(symbol)
            .copied()
            .unwrap_or(0)
    }

    /// Per-symbol demand.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<SymbolSubscription> {
        self.state
            .lock()
            .symbol_refcount
            .iter()
            .map(|(symbol, ref_count)| SymbolSubscription {
                symbol: symbol.clone(),
                ref_count: *ref_count,
            })
            .collect()
    }

    /// Registry statistics.
    #[must_use]
    pub fn stats(&self) -> SubscriptionStats {
        let state = self.state.lock();
        SubscriptionStats {
            consumers: state.consumer_symbols.len(),
            symbols: state.symbol_refcount.len(),
            total_subscriptions: state.symbol_refcount.values().sum(),
        }
    }
}
