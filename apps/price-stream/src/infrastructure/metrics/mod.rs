//! Prometheus Metrics Module
//!
//! Exposes streaming metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Ticks**: received per source, published, dropped by reason, coalesced
//! - **Connections**: state gauge per source, reconnect attempts, failovers
//! - **Consumers**: active consumers, symbols in demand, lag
//! - **Errors**: protocol errors per source
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Recording
//! functions are no-ops until [`init_metrics`] installs the recorder.

use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::domain::connection::ConnectionState;
use crate::domain::tick::SourceId;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Later calls return the existing handle.
///
/// # Errors
///
/// Returns an error if the recorder cannot be installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "price_stream_ticks_received_total",
        "Normalized ticks received from upstream sources"
    );
    describe_counter!(
        "price_stream_ticks_published_total",
        "Ticks published to consumers after throttling"
    );
    describe_counter!(
        "price_stream_ticks_dropped_total",
        "Ticks dropped before reaching a consumer, by reason"
    );
    describe_counter!(
        "price_stream_ticks_coalesced_total",
        "Ticks superseded inside a throttle window"
    );

    describe_gauge!(
        "price_stream_connection_state",
        "Connection state per source (0=disconnected .. 4=failed_permanently)"
    );
    describe_counter!(
        "price_stream_reconnects_total",
        "Reconnection attempts per source"
    );
    describe_counter!(
        "price_stream_failovers_total",
        "Active source changes per symbol"
    );
    describe_counter!(
        "price_stream_protocol_errors_total",
        "Malformed payloads per source"
    );

    describe_gauge!(
        "price_stream_active_consumers",
        "Consumers with at least one open stream"
    );
    describe_gauge!(
        "price_stream_symbols_in_demand",
        "Symbols with at least one subscriber"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Why a tick never reached a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Tick came from a source that is not active for the symbol.
    InactiveSource,
    /// Nobody subscribes to the symbol.
    NoDemand,
    /// Consumer fell behind and skipped ticks.
    ConsumerLag,
    /// Payload could not be normalized.
    Protocol,
}

impl DropReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::InactiveSource => "inactive_source",
            Self::NoDemand => "no_demand",
            Self::ConsumerLag => "consumer_lag",
            Self::Protocol => "protocol",
        }
    }
}

/// Record a normalized tick from `source`.
pub fn record_tick_received(source: SourceId) {
    counter!(
        "price_stream_ticks_received_total",
        "source" => source.as_str()
    )
    .increment(1);
}

/// Record ticks handed to the event bus.
pub fn record_ticks_published(count: u64) {
    counter!("price_stream_ticks_published_total").increment(count);
}

/// Record dropped ticks.
pub fn record_ticks_dropped(reason: DropReason, count: u64) {
    counter!(
        "price_stream_ticks_dropped_total",
        "reason" => reason.as_str()
    )
    .increment(count);
}

/// Record a tick superseded inside a throttle window.
pub fn record_tick_coalesced() {
    counter!("price_stream_ticks_coalesced_total").increment(1);
}

/// Update the connection state gauge for a source.
pub fn set_connection_state(source: SourceId, state: ConnectionState) {
    gauge!(
        "price_stream_connection_state",
        "source" => source.as_str()
    )
    .set(state.as_gauge());
}

/// Record a reconnection attempt.
pub fn record_reconnect(source: SourceId) {
    counter!(
        "price_stream_reconnects_total",
        "source" => source.as_str()
    )
    .increment(1);
}

/// Record an active source change for one symbol.
pub fn record_failover(to: Option<SourceId>) {
    counter!(
        "price_stream_failovers_total",
        "to" => to.map_or("none", SourceId::as_str)
    )
    .increment(1);
}

/// Record a malformed payload.
pub fn record_protocol_error(source: SourceId) {
    counter!(
        "price_stream_protocol_errors_total",
        "source" => source.as_str()
    )
    .increment(1);
}

/// Update the active consumer count.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_consumers(count: usize) {
    gauge!("price_stream_active_consumers").set(count as f64);
}

/// Update the symbols-in-demand count.
#[allow(clippy::cast_precision_loss)]
pub fn set_symbols_in_demand(count: usize) {
    gauge!("price_stream_symbols_in_demand").set(count as f64);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_reason_as_str() {
        assert_eq!(DropReason::InactiveSource.as_str(), "inactive_source");
        assert_eq!(DropReason::NoDemand.as_str(), "no_demand");
        assert_eq!(DropReason::ConsumerLag.as_str(), "consumer_lag");
        assert_eq!(DropReason::Protocol.as_str(), "protocol");
    }

    #[test]
    fn recording_without_recorder_is_noop() {
        record_tick_received(SourceId::Primary);
        record_ticks_dropped(DropReason::ConsumerLag, 3);
        set_connection_state(SourceId::Polling, ConnectionState::Degraded);
        record_failover(None);
    }
}
