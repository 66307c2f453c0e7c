//! Price Tick Types
//!
//! Canonical representation of a live price observation, independent of
//! which upstream feed produced it. Raw payloads from any connector are
//! turned into a [`PriceTick`] by [`normalize`].

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Normalized market symbol (e.g. `BTCUSDT`).
pub type Symbol = String;

/// Ordered set of symbols.
pub type SymbolSet = BTreeSet<Symbol>;

// =============================================================================
// Source Identity
// =============================================================================

/// Identity of an upstream price source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceId {
    /// Low-latency push feed.
    Primary,
    /// Secondary push feed.
    Secondary,
    /// Request/response polling feed.
    Polling,
}

impl SourceId {
    /// All known sources.
    pub const ALL: [Self; 3] = [Self::Primary, Self::Secondary, Self::Polling];

    /// Source name used in logs, metrics and configuration.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
            Self::Polling => "polling",
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown source name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown source: {0}")]
pub struct UnknownSource(pub String);

impl FromStr for SourceId {
    type Err = UnknownSource;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "primary" => Ok(Self::Primary),
            "secondary" => Ok(Self::Secondary),
            "polling" | "poll" => Ok(Self::Polling),
            other => Err(UnknownSource(other.to_string())),
        }
    }
}

// =============================================================================
// Price Tick
// =============================================================================

/// One normalized price observation. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceTick {
    symbol: Symbol,
    price: Decimal,
    source_id: SourceId,
    observed_at: DateTime<Utc>,
}

impl PriceTick {
    /// Create a new tick.
    #[must_use]
    pub const fn new(
        symbol: Symbol,
        price: Decimal,
        source_id: SourceId,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol,
            price,
            source_id,
            observed_at,
        }
    }

    /// Symbol this tick belongs to.
    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Observed price.
    #[must_use]
    pub const fn price(&self) -> Decimal {
        self.price
    }

    /// Source that produced the tick.
    #[must_use]
    pub const fn source_id(&self) -> SourceId {
        self.source_id
    }

    /// Time the price was observed upstream (or received, if the payload had no timestamp).
    #[must_use]
    pub const fn observed_at(&self) -> DateTime<Utc> {
        self.observed_at
    }
}

// =============================================================================
// Normalization
// =============================================================================

/// Price payload as delivered by a connector, before validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTick {
    /// Upstream symbol spelling (`btc-usdt`, `BTC/USDT`, ...).
    pub symbol: String,
    /// Price text as received.
    pub price: String,
    /// Upstream timestamp in epoch milliseconds, when provided.
    pub timestamp_ms: Option<i64>,
}

impl RawTick {
    /// Create a raw tick.
    #[must_use]
    pub fn new(
        symbol: impl Into<String>,
        price: impl Into<String>,
        timestamp_ms: Option<i64>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            price: price.into(),
            timestamp_ms,
        }
    }
}

/// Reasons a raw payload cannot become a [`PriceTick`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NormalizeError {
    /// Symbol is empty after normalization.
    #[error("empty symbol")]
    EmptySymbol,
    /// Price text is not a decimal number.
    #[error("invalid price '{0}'")]
    InvalidPrice(String),
    /// Price is zero or negative.
    #[error("non-positive price {0}")]
    NonPositivePrice(Decimal),
    /// Timestamp is outside the representable range.
    #[error("invalid timestamp {0}")]
    InvalidTimestamp(i64),
}

/// Canonical symbol spelling: upper-case with separators removed.
///
/// # Errors
///
/// Returns [`NormalizeError::EmptySymbol`] if nothing is left.
pub fn normalize_symbol(raw: &str) -> Result<Symbol, NormalizeError> {
    let symbol: String = raw
        .chars()
        .filter(|c| !matches!(c, '-' | '/' | '_') && !c.is_whitespace())
        .flat_map(char::to_uppercase)
        .collect();

    if symbol.is_empty() {
        return Err(NormalizeError::EmptySymbol);
    }
    Ok(symbol)
}

/// Parse a price in plain or scientific notation.
fn parse_price(raw: &str) -> Result<Decimal, NormalizeError> {
    let text = raw.trim();
    let price = Decimal::from_str(text)
        .or_else(|_| Decimal::from_scientific(text))
        .map_err(|_| NormalizeError::InvalidPrice(raw.to_string()))?;

    if price <= Decimal::ZERO {
        return Err(NormalizeError::NonPositivePrice(price));
    }
    Ok(price.normalize())
}

/// Turn a raw connector payload into a [`PriceTick`].
///
/// When the payload carries no timestamp the local clock is used.
///
/// # Errors
///
/// Returns a [`NormalizeError`] for malformed symbols, prices or timestamps.
pub fn normalize(raw: &RawTick, source_id: SourceId) -> Result<PriceTick, NormalizeError> {
    let symbol = normalize_symbol(&raw.symbol)?;
    let price = parse_price(&raw.price)?;
    let observed_at = match raw.timestamp_ms {
        Some(ms) => Utc
            .timestamp_millis_opt(ms)
            .single()
            .ok_or(NormalizeError::InvalidTimestamp(ms))?,
        None => Utc::now(),
    };

    Ok(PriceTick::new(symbol, price, source_id, observed_at))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("btc-usdt", "BTCUSDT" ; "dash separator")]
    #[test_case("BTC/USDT", "BTCUSDT" ; "slash separator")]
    #[test_case(" eth_usd ", "ETHUSD" ; "underscore and padding")]
    #[test_case("SOLUSDT", "SOLUSDT" ; "already canonical")]
    fn symbol_normalization(raw: &str, expected: &str) {
        assert_eq!(normalize_symbol(raw).unwrap(), expected);
    }

    #[test]
    fn empty_symbol_rejected() {
        assert_eq!(normalize_symbol(" -/_ "), Err(NormalizeError::EmptySymbol));
    }

    #[test_case("100.50", "100.5" ; "plain")]
    #[test_case("1.2e3", "1200" ; "scientific")]
    #[test_case(" 0.00001 ", "0.00001" ; "small with padding")]
    fn price_parsing(raw: &str, expected: &str) {
        let tick = normalize(&RawTick::new("btcusdt", raw, Some(0)), SourceId::Primary).unwrap();
        assert_eq!(tick.price(), expected.parse::<Decimal>().unwrap());
    }

    #[test_case("abc" ; "not a number")]
    #[test_case("" ; "empty")]
    fn invalid_price_rejected(raw: &str) {
        let err = normalize(&RawTick::new("BTCUSDT", raw, None), SourceId::Primary).unwrap_err();
        assert!(matches!(err, NormalizeError::InvalidPrice(_)));
    }

    #[test]
    fn non_positive_price_rejected() {
        let err = normalize(&RawTick::new("BTCUSDT", "-1", None), SourceId::Primary).unwrap_err();
        assert!(matches!(err, NormalizeError::NonPositivePrice(_)));

        let err = normalize(&RawTick::new("BTCUSDT", "0", None), SourceId::Primary).unwrap_err();
        assert!(matches!(err, NormalizeError::NonPositivePrice(_)));
    }

    #[test]
    fn timestamp_from_payload() {
        let tick = normalize(
            &RawTick::new("BTCUSDT", "1", Some(1_700_000_000_000)),
            SourceId::Secondary,
        )
        .unwrap();
        assert_eq!(tick.observed_at().timestamp_millis(), 1_700_000_000_000);
        assert_eq!(tick.source_id(), SourceId::Secondary);
    }

    #[test]
    fn missing_timestamp_uses_clock() {
        let before = Utc::now();
        let tick = normalize(&RawTick::new("BTCUSDT", "1", None), SourceId::Polling).unwrap();
        assert!(tick.observed_at() >= before);
    }

    #[test]
    fn out_of_range_timestamp_rejected() {
        let err =
            normalize(&RawTick::new("BTCUSDT", "1", Some(i64::MAX)), SourceId::Primary).unwrap_err();
        assert_eq!(err, NormalizeError::InvalidTimestamp(i64::MAX));
    }

    #[test]
    fn source_id_round_trips_through_str() {
        for id in SourceId::ALL {
            assert_eq!(id.as_str().parse::<SourceId>().unwrap(), id);
        }
        assert_eq!("POLL".parse::<SourceId>().unwrap(), SourceId::Polling);
        assert!("tertiary".parse::<SourceId>().is_err());
    }

    #[test]
    fn tick_serializes_camel_case() {
        let tick = normalize(&RawTick::new("BTCUSDT", "101", Some(0)), SourceId::Primary).unwrap();
        let json = serde_json::to_value(&tick).unwrap();
        assert_eq!(json["symbol"], "BTCUSDT");
        assert_eq!(json["sourceId"], "primary");
        assert_eq!(json["price"], "101");
    }
}
