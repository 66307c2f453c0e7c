//! Poll Connector
//!
//! [`SourceConnector`] for request/response feeds. Every interval it asks
//! the endpoint for the full current symbol set and reports the prices it
//! gets back. A run of failed requests ends the session as degraded.
//!
//! # Endpoint
//!
//! `GET {endpoint}?symbols=BTCUSDT,ETHUSDT` answering either
//! `{"data":[{"symbol":"BTC","priceUsd":"64000.1"}],"timestamp":...}` or a
//! bare array of `{"symbol","price"}` objects.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::messages::PollResponse;
use crate::application::ports::{FeedError, FeedEventSink, SourceConnector};
use crate::domain::connection::{ConnectionState, SourceDescriptor, TransportKind};
use crate::domain::tick::{RawTick, Symbol, SymbolSet};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

// =============================================================================
// Fetcher
// =============================================================================

/// One request against a polling endpoint.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PriceFetcher: Send + Sync {
    /// Fetch current prices for `symbols`.
    async fn fetch(&self, symbols: &[Symbol]) -> Result<Vec<RawTick>, FeedError>;
}

/// Parse a polling endpoint body.
///
/// # Errors
///
/// Returns [`FeedError::Protocol`] if the body matches neither accepted shape.
pub fn parse_poll_response(body: &str) -> Result<Vec<RawTick>, FeedError> {
    serde_json::from_str::<PollResponse>(body)
        .map(PollResponse::into_raw_ticks)
        .map_err(|e| FeedError::Protocol(format!("invalid poll response: {e}")))
}

/// HTTP fetcher backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpPriceFetcher {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpPriceFetcher {
    /// Create a fetcher for `endpoint` with a per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, FeedError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FeedError::TransientNetwork(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            timeout,
        })
    }

    fn map_error(&self, err: &reqwest::Error) -> FeedError {
        if err.is_timeout() {
            FeedError::Timeout(self.timeout)
        } else {
            FeedError::TransientNetwork(err.to_string())
        }
    }
}

#[async_trait]
impl PriceFetcher for HttpPriceFetcher {
    async fn fetch(&self, symbols: &[Symbol]) -> Result<Vec<RawTick>, FeedError> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("symbols", symbols.join(","))])
            .send()
            .await
            .map_err(|e| self.map_error(&e))?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(FeedError::Authentication(format!(
                    "poll endpoint returned {}",
                    response.status()
                )));
            }
            status if !status.is_success() => {
                return Err(FeedError::TransientNetwork(format!(
                    "poll endpoint returned {status}"
                )));
            }
            _ => {}
        }

        let body = response.text().await.map_err(|e| self.map_error(&e))?;
        parse_poll_response(&body)
    }
}

// =============================================================================
// Poll Connector
// =============================================================================

/// Fixed-interval polling connector.
#[derive(Debug)]
pub struct PollConnector<F> {
    descriptor: SourceDescriptor,
    fetcher: F,
}

impl<F: PriceFetcher> PollConnector<F> {
    /// Create a poll connector.
    #[must_use]
    pub const fn new(descriptor: SourceDescriptor, fetcher: F) -> Self {
        Self {
            descriptor,
            fetcher,
        }
    }

    /// Time between poll cycles, never shorter than 10 ms.
    #[must_use]
    pub fn interval(&self) -> Duration {
        match self.descriptor.transport {
            TransportKind::Poll { interval } => interval.max(MIN_POLL_INTERVAL),
            TransportKind::Push => DEFAULT_POLL_INTERVAL,
        }
    }
}

#[async_trait]
impl<F: PriceFetcher + 'static> SourceConnector for PollConnector<F> {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    async fn connect(
        &self,
        mut symbols: watch::Receiver<SymbolSet>,
        sink: FeedEventSink,
        cancel: CancellationToken,
    ) -> Result<(), FeedError> {
        let source = self.descriptor.id;
        let request_timeout = self.descriptor.request_timeout;
        let max_failures = self.descriptor.max_consecutive_failures;

        tracing::info!(
            source = %source,
            endpoint = %self.descriptor.endpoint,
            interval_ms = u64::try_from(self.interval().as_millis()).unwrap_or(u64::MAX),
            "Starting poll loop"
        );
        sink.set_state(ConnectionState::Connected).await;

        let mut ticker = tokio::time::interval(self.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tracked: Option<SymbolSet> = None;
        let mut failures: u32 = 0;

        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            let wanted = symbols.borrow_and_update().clone();
            if tracked.as_ref() != Some(&wanted) {
                sink.tracking(wanted.clone()).await;
                tracked = Some(wanted.clone());
            }
            if wanted.is_empty() {
                continue;
            }

            let batch: Vec<Symbol> = wanted.into_iter().collect();
            let request = tokio::time::timeout(request_timeout, self.fetcher.fetch(&batch));
            let result = tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                result = request => result.unwrap_or(Err(FeedError::Timeout(request_timeout))),
            };

            match result {
                Ok(ticks) => {
                    failures = 0;
                    for raw in &ticks {
                        sink.raw_tick(raw).await?;
                    }
                }
                Err(e @ FeedError::Authentication(_)) => return Err(e),
                Err(e) => {
                    failures += 1;
                    tracing::warn!(source = %source, failures, error = %e, "Poll request failed");
                    sink.error(e).await;
                    if failures >= max_failures {
                        return Err(FeedError::ConsecutiveFailures(failures));
                    }
                }
            }
        }
    }
}
