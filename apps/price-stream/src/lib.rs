#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Price Stream - Real-Time Market Price Streaming Core
//!
//! Keeps live prices flowing to in-process consumers from a ranked set of
//! upstream feeds. Each feed runs under its own reconnect supervisor; a
//! failover coordinator picks the active feed per symbol; a per-symbol
//! throttle coalesces bursts before an event bus fans ticks out.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Pure types and state machines
//!   - `tick`: Price ticks, source identity, normalization
//!   - `connection`: Connection states and source descriptors
//!   - `subscription`: Reference-counted consumer subscriptions
//!   - `throttle`: Per-symbol trailing-edge throttle
//!   - `failover`: Active source selection
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: The `SourceConnector` port and the error taxonomy
//!   - `services`: Reconnect supervision, routing, status, the service facade
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `feeds`: WebSocket push and HTTP poll connectors
//!   - `broadcast`: Event bus with per-consumer bounded queues
//!   - `config`: Environment configuration
//!   - `health`: Health check HTTP endpoint
//!   - `metrics`, `telemetry`: Prometheus and OpenTelemetry
//!
//! # Data Flow
//!
//! ```text
//! primary (ws)  ──┐  ReconnectManager
//!                 │        │
//! secondary (ws)──┼──▶ Router ──▶ Throttle ──▶ EventBus ──▶ TickStream (consumer 1)
//!                 │  (failover)                        ──▶ TickStream (consumer N)
//! polling (http)──┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core streaming types with no external dependencies.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::connection::{ConnectionState, SourceDescriptor, TransportKind};
pub use domain::failover::{FailoverDecision, FailoverEvent};
pub use domain::subscription::{ConsumerId, SubscriptionRegistry};
pub use domain::tick::{PriceTick, RawTick, SourceId, Symbol, SymbolSet};

// Ports and services
pub use application::ports::{ErrorKind, FeedError, FeedEventSink, SourceConnector};
pub use application::services::{
    PriceStreamService, ReconnectConfig, ServiceError, SourceStatus, StreamStatus,
};

// Infrastructure config
pub use infrastructure::config::{ConfigError, SourceSettings, StreamConfig};

// Feeds
pub use infrastructure::feeds::{
    Credentials, HttpPriceFetcher, PollConnector, PriceFetcher, PushConnector, PushConnectorConfig,
    connector_for,
};

// Event bus
pub use infrastructure::broadcast::{ConsumerFilter, ConsumerHandle, EventBus, TickStream};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
