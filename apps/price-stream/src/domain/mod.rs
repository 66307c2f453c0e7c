//! Domain Layer - Core streaming types and algorithms.
//!
//! Pure state machines with no I/O: the tick model, connection model,
//! subscription reference counting, throttling and failover selection.
//! Time is passed in explicitly so every rule is testable without sleeping.

/// Price ticks, source identity and normalization.
pub mod tick;

/// Connection states, source descriptors and the protocol error window.
pub mod connection;

/// Reference-counted consumer subscriptions.
pub mod subscription;

/// Per-symbol trailing-edge throttle.
pub mod throttle;

/// Active source selection per symbol.
pub mod failover;
