//! Stream Configuration Settings
//!
//! Configuration types for the streaming core, loaded once from environment
//! variables at startup and immutable afterwards. Unparsable numeric values
//! fall back to their defaults.

use std::time::Duration;

use crate::application::services::reconnect::ReconnectConfig;
use crate::domain::connection::SourceDescriptor;
use crate::domain::tick::SourceId;
use crate::infrastructure::feeds::auth::Credentials;

const PREFIX: &str = "PRICE_STREAM";

/// Protocol error threshold settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolSettings {
    /// Malformed payloads tolerated inside the window.
    pub max_errors: u32,
    /// Sliding window length.
    pub window: Duration,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            max_errors: 20,
            window: Duration::from_secs(10),
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerSettings {
    /// Health check HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8083 }
    }
}

/// One configured upstream source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSettings {
    /// Static description.
    pub descriptor: SourceDescriptor,
    /// Push-feed credentials, if any.
    pub credentials: Option<Credentials>,
}

/// Complete streaming configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    /// Per-symbol throttle window.
    pub throttle_interval: Duration,
    /// Window over which registry changes are batched before connectors
    /// are told to resubscribe.
    pub resubscribe_batch: Duration,
    /// Heartbeat intervals of silence before a symbol is stale.
    pub stale_heartbeats: u32,
    /// Per-consumer event bus capacity.
    pub consumer_queue: usize,
    /// Backoff settings shared by every source.
    pub reconnect: ReconnectConfig,
    /// Protocol error threshold.
    pub protocol: ProtocolSettings,
    /// Enabled sources, ordered as configured.
    pub sources: Vec<SourceSettings>,
    /// Server ports.
    pub server: ServerSettings,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            throttle_interval: Duration::from_millis(100),
            resubscribe_batch: Duration::from_millis(50),
            stale_heartbeats: 3,
            consumer_queue: 1024,
            reconnect: ReconnectConfig::default(),
            protocol: ProtocolSettings::default(),
            sources: Vec::new(),
            server: ServerSettings::default(),
        }
    }
}

impl StreamConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if no source is configured or a value is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if no source is configured or a value is invalid.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);
        let defaults = Self::default();
        let reconnect_defaults = ReconnectConfig::default();

        let reconnect = ReconnectConfig {
            base_delay: env.millis("RECONNECT_BASE_MS", reconnect_defaults.base_delay),
            max_delay: env.secs("RECONNECT_CAP_SECS", reconnect_defaults.max_delay),
            max_attempts: env.parse("RECONNECT_MAX_ATTEMPTS", reconnect_defaults.max_attempts),
            jitter_factor: env
                .parse("RECONNECT_JITTER", reconnect_defaults.jitter_factor)
                .clamp(0.0, 1.0),
            stability_threshold: env.secs("STABILITY_SECS", reconnect_defaults.stability_threshold),
            ..reconnect_defaults
        };

        let protocol = ProtocolSettings {
            max_errors: env.parse("PROTOCOL_MAX_ERRORS", defaults.protocol.max_errors),
            window: env.secs("PROTOCOL_WINDOW_SECS", defaults.protocol.window),
        };

        let priority_order = parse_priority(
            &env.get("SOURCE_PRIORITY")
                .unwrap_or_else(|| "primary,secondary,polling".to_string()),
        )?;

        let mut sources = Vec::new();
        for id in SourceId::ALL {
            let rank = priority_order
                .iter()
                .position(|p| *p == id)
                .unwrap_or(priority_order.len() + id as usize);
            if let Some(source) = load_source(&env, id, u8::try_from(rank).unwrap_or(u8::MAX))? {
                sources.push(source);
            }
        }
        if sources.is_empty() {
            return Err(ConfigError::NoSources);
        }
        sources.sort_by_key(|s| s.descriptor.priority);

        Ok(Self {
            throttle_interval: env.millis("THROTTLE_MS", defaults.throttle_interval),
            resubscribe_batch: env.millis("RESUBSCRIBE_BATCH_MS", defaults.resubscribe_batch),
            stale_heartbeats: env.parse("STALE_HEARTBEATS", defaults.stale_heartbeats).max(1),
            consumer_queue: env.parse("CONSUMER_QUEUE", defaults.consumer_queue).max(1),
            reconnect,
            protocol,
            sources,
            server: ServerSettings {
                health_port: env.parse("HEALTH_PORT", defaults.server.health_port),
            },
        })
    }

    /// Descriptors of every enabled source.
    #[must_use]
    pub fn descriptors(&self) -> Vec<SourceDescriptor> {
        self.sources.iter().map(|s| s.descriptor.clone()).collect()
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// No source has an endpoint configured.
    #[error("no sources configured: set at least one PRICE_STREAM_<ID>_URL")]
    NoSources,
    /// Priority list names an unknown or repeated source.
    #[error("invalid source priority: {0}")]
    InvalidPriority(String),
    /// A period that must be positive was set to zero.
    #[error("environment variable {0} must be greater than zero")]
    ZeroDuration(String),
}

// =============================================================================
// Parsing
// =============================================================================

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

fn env_key(name: &str) -> String {
    format!("{PREFIX}_{name}")
}

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn get(&self, name: &str) -> Option<String> {
        (self.0)(&env_key(name))
    }

    fn parse<T: std::str::FromStr>(&self, name: &str, default: T) -> T {
        self.get(name)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn secs(&self, name: &str, default: Duration) -> Duration {
        self.get(name)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_secs)
    }

    fn millis(&self, name: &str, default: Duration) -> Duration {
        self.get(name)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_millis)
    }
}

fn non_zero(name: &str, value: Duration) -> Result<Duration, ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::ZeroDuration(env_key(name)));
    }
    Ok(value)
}

fn parse_priority(raw: &str) -> Result<Vec<SourceId>, ConfigError> {
    let mut order = Vec::new();
    for name in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let id: SourceId = name
            .parse()
            .map_err(|_| ConfigError::InvalidPriority(format!("unknown source '{name}'")))?;
        if order.contains(&id) {
            return Err(ConfigError::InvalidPriority(format!("'{name}' listed twice")));
        }
        order.push(id);
    }
    Ok(order)
}

fn load_source<F: Fn(&str) -> Option<String>>(
    env: &Env<'_, F>,
    id: SourceId,
    priority: u8,
) -> Result<Option<SourceSettings>, ConfigError> {
    let tag = id.as_str().to_uppercase();
    let Some(url) = env.get(&format!("{tag}_URL")) else {
        return Ok(None);
    };
    let url = url.trim().to_string();
    if url.is_empty() {
        return Err(ConfigError::EmptyValue(env_key(&format!("{tag}_URL"))));
    }

    let base = match id {
        SourceId::Polling => {
            let interval = non_zero(
                "POLLING_INTERVAL_MS",
                env.millis("POLLING_INTERVAL_MS", Duration::from_secs(1)),
            )?;
            SourceDescriptor::poll(id, priority, url, interval)
        }
        SourceId::Primary | SourceId::Secondary => SourceDescriptor::push(id, priority, url),
    };
    let heartbeat_key = format!("{tag}_HEARTBEAT_SECS");
    let heartbeat = non_zero(&heartbeat_key, env.secs(&heartbeat_key, base.heartbeat_timeout))?;
    let max_failures = env
        .parse(&format!("{tag}_MAX_FAILURES"), base.max_consecutive_failures)
        .max(1);
    let timeout_key = format!("{tag}_TIMEOUT_SECS");
    let timeout = non_zero(&timeout_key, env.secs(&timeout_key, base.request_timeout))?;
    let descriptor = base
        .with_heartbeat_timeout(heartbeat)
        .with_max_consecutive_failures(max_failures)
        .with_request_timeout(timeout);

    let credentials = match (env.get(&format!("{tag}_KEY")), env.get(&format!("{tag}_SECRET"))) {
        (None, None) => None,
        (Some(_), None) => {
            return Err(ConfigError::MissingEnvVar(env_key(&format!("{tag}_SECRET"))));
        }
        (None, Some(_)) => {
            return Err(ConfigError::MissingEnvVar(env_key(&format!("{tag}_KEY"))));
        }
        (Some(key), Some(secret)) => Some(
            Credentials::new(key, secret)
                .map_err(|_| ConfigError::EmptyValue(env_key(&format!("{tag}_KEY"))))?,
        ),
    };

    Ok(Some(SourceSettings {
        descriptor,
        credentials,
    }))
}
