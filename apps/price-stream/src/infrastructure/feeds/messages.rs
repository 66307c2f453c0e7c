//! Feed Wire Messages
//!
//! JSON message types exchanged with push feeds and returned by the
//! polling endpoint.
//!
//! # Server → Client
//!
//! ```json
//! {"type":"price","symbol":"BTC-USDT","price":"64210.5","ts":1700000000000}
//! {"type":"heartbeat"}
//! {"type":"authenticated"}
//! {"type":"subscribed","symbols":["BTC-USDT"]}
//! {"type":"error","code":402,"message":"auth failed"}
//! ```
//!
//! # Client → Server
//!
//! ```json
//! {"action":"auth","key":"...","secret":"..."}
//! {"action":"subscribe","symbols":["BTCUSDT"]}
//! {"action":"unsubscribe","symbols":["BTCUSDT"]}
//! ```

use serde::{Deserialize, Serialize};

use crate::domain::tick::RawTick;

// =============================================================================
// Price Value
// =============================================================================

/// Price as sent upstream: either a JSON string or a JSON number.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum PriceValue {
    /// `"64210.5"`
    Text(String),
    /// `64210.5`
    Number(serde_json::Number),
}

impl PriceValue {
    /// Text form handed to normalization.
    #[must_use]
    pub fn into_text(self) -> String {
        match self {
            Self::Text(text) => text,
            Self::Number(number) => number.to_string(),
        }
    }
}

// =============================================================================
// Server Messages
// =============================================================================

/// Price update.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PriceMessage {
    /// Upstream symbol spelling.
    pub symbol: String,
    /// Price.
    pub price: PriceValue,
    /// Epoch milliseconds.
    #[serde(default, alias = "timestamp")]
    pub ts: Option<i64>,
}

impl PriceMessage {
    /// Convert into a raw tick for normalization.
    #[must_use]
    pub fn into_raw(self) -> RawTick {
        RawTick::new(self.symbol, self.price.into_text(), self.ts)
    }
}

/// Subscription acknowledgement carrying the full current subscription list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubscribedMessage {
    /// Symbols currently subscribed upstream.
    #[serde(default)]
    pub symbols: Vec<String>,
}

/// Error reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ErrorMessage {
    /// Numeric error code.
    pub code: u16,
    /// Human-readable message.
    #[serde(default, alias = "msg")]
    pub message: String,
}

/// Decoded server message.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    /// Price update.
    Price(PriceMessage),
    /// Application keepalive.
    Heartbeat,
    /// Authentication accepted.
    Authenticated,
    /// Subscription acknowledgement.
    Subscribed(SubscribedMessage),
    /// Server error.
    Error(ErrorMessage),
}

// =============================================================================
// Client Requests
// =============================================================================

/// Request sent to a push feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ClientRequest {
    /// Authenticate the session.
    Auth {
        /// API key.
        key: String,
        /// API secret.
        secret: String,
    },
    /// Add symbols.
    Subscribe {
        /// Symbols to add.
        symbols: Vec<String>,
    },
    /// Remove symbols.
    Unsubscribe {
        /// Symbols to remove.
        symbols: Vec<String>,
    },
}

impl ClientRequest {
    /// Serialize to JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// =============================================================================
// Poll Responses
// =============================================================================

/// One quote in a poll response.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PollQuote {
    /// Upstream symbol spelling.
    pub symbol: String,
    /// Price (`price` or coincap-style `priceUsd`).
    #[serde(alias = "priceUsd")]
    pub price: PriceValue,
    /// Per-quote epoch milliseconds.
    #[serde(default)]
    pub timestamp: Option<i64>,
}

/// Poll endpoint body: `{"data":[...],"timestamp":...}` or a bare array.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum PollResponse {
    /// Envelope with a shared timestamp.
    Envelope {
        /// Quotes.
        data: Vec<PollQuote>,
        /// Response-level epoch milliseconds.
        #[serde(default)]
        timestamp: Option<i64>,
    },
    /// Bare array of quotes.
    Bare(Vec<PollQuote>),
}

impl PollResponse {
    /// Flatten into raw ticks; per-quote timestamps win over the envelope's.
    #[must_use]
    pub fn into_raw_ticks(self) -> Vec<RawTick> {
        let (quotes, shared_ts) = match self {
            Self::Envelope { data, timestamp } => (data, timestamp),
            Self::Bare(data) => (data, None),
        };
        quotes
            .into_iter()
            .map(|q| RawTick::new(q.symbol, q.price.into_text(), q.timestamp.or(shared_ts)))
            .collect()
    }
}
