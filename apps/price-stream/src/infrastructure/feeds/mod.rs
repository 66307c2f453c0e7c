//! Upstream Feed Adapters
//!
//! [`SourceConnector`](crate::application::ports::SourceConnector)
//! implementations for the two transport kinds:
//!
//! - **Push**: WebSocket stream with optional auth and a heartbeat watchdog
//! - **Poll**: fixed-interval HTTP requests

pub mod auth;
pub mod codec;
pub mod heartbeat;
pub mod messages;
pub mod poll;
pub mod push;

pub use auth::{AUTH_TIMEOUT, AuthError, AuthHandler, AuthState, Credentials};
pub use codec::{CodecError, JsonCodec};
pub use heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState};
pub use messages::{ClientRequest, FeedMessage, PollResponse, PriceValue};
pub use poll::{HttpPriceFetcher, PollConnector, PriceFetcher, parse_poll_response};
pub use push::{PushConnector, PushConnectorConfig};

use std::sync::Arc;

use crate::application::ports::{FeedError, SourceConnector};
use crate::domain::connection::TransportKind;
use crate::infrastructure::config::SourceSettings;

/// Build the connector matching a configured source's transport.
///
/// # Errors
///
/// Returns an error if the HTTP client for a polling source cannot be built.
pub fn connector_for(settings: &SourceSettings) -> Result<Arc<dyn SourceConnector>, FeedError> {
    let descriptor = settings.descriptor.clone();
    match descriptor.transport {
        TransportKind::Push => {
            let mut config = PushConnectorConfig::new(descriptor);
            if let Some(credentials) = &settings.credentials {
                config = config.with_credentials(credentials.clone());
            }
            Ok(Arc::new(PushConnector::new(config)))
        }
        TransportKind::Poll { .. } => {
            let fetcher = HttpPriceFetcher::new(descriptor.endpoint.clone(), descriptor.request_timeout)?;
            Ok(Arc::new(PollConnector::new(descriptor, fetcher)))
        }
    }
}
