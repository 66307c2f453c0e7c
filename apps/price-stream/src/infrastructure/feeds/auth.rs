//! Push Feed Authentication
//!
//! Push feeds that require credentials expect an `auth` request right after
//! the socket opens and answer with `{"type":"authenticated"}` or an error.
//! A session that is not authenticated within [`AUTH_TIMEOUT`] is dropped.
//!
//! # Error Codes
//!
//! - 401: Not authenticated
//! - 402: Invalid credentials
//! - 403: Forbidden
//! - 404: Authentication timeout
//! - 406: Connection limit exceeded

use std::time::Duration;

use thiserror::Error;

use super::messages::{ClientRequest, ErrorMessage};
use crate::application::ports::FeedError;

/// Maximum time allowed for authentication after the socket opens.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during authentication.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// Must authenticate before subscribing.
    #[error("not authenticated: must authenticate before making requests")]
    NotAuthenticated,

    /// Invalid API key or secret.
    #[error("authentication failed: invalid API key or secret")]
    InvalidCredentials,

    /// Credentials valid but not permitted on this feed.
    #[error("forbidden: credentials not permitted on this feed")]
    Forbidden,

    /// Server gave up waiting for credentials.
    #[error("authentication timeout")]
    Timeout,

    /// Too many concurrent connections for this account.
    #[error("connection limit exceeded")]
    ConnectionLimitExceeded,

    /// Credentials could not be built.
    #[error("invalid credentials: {0}")]
    InvalidMessage(String),

    /// Any other server-side error.
    #[error("server error ({code}): {message}")]
    ServerError {
        /// Error code from server.
        code: u16,
        /// Error message from server.
        message: String,
    },
}

impl AuthError {
    /// Whether this code belongs to the authentication family.
    #[must_use]
    pub const fn is_auth_code(code: u16) -> bool {
        matches!(code, 401..=404)
    }
}

impl From<&ErrorMessage> for AuthError {
    fn from(err: &ErrorMessage) -> Self {
        match err.code {
            401 => Self::NotAuthenticated,
            402 => Self::InvalidCredentials,
            403 => Self::Forbidden,
            404 => Self::Timeout,
            406 => Self::ConnectionLimitExceeded,
            code => Self::ServerError {
                code,
                message: err.message.clone(),
            },
        }
    }
}

impl From<AuthError> for FeedError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::ConnectionLimitExceeded => Self::TransientNetwork(err.to_string()),
            AuthError::ServerError { .. } => Self::Protocol(err.to_string()),
            AuthError::NotAuthenticated
            | AuthError::InvalidCredentials
            | AuthError::Forbidden
            | AuthError::Timeout
            | AuthError::InvalidMessage(_) => Self::Authentication(err.to_string()),
        }
    }
}

// =============================================================================
// Credentials
// =============================================================================

/// API credentials for a push feed.
///
/// `Debug` redacts the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    key: String,
    secret: String,
}

impl Credentials {
    /// Create new credentials.
    ///
    /// # Errors
    ///
    /// Returns an error if either key or secret is empty.
    pub fn new(key: impl Into<String>, secret: impl Into<String>) -> Result<Self, AuthError> {
        let key = key.into();
        let secret = secret.into();

        if key.is_empty() {
            return Err(AuthError::InvalidMessage("API key cannot be empty".to_string()));
        }
        if secret.is_empty() {
            return Err(AuthError::InvalidMessage("API secret cannot be empty".to_string()));
        }

        Ok(Self { key, secret })
    }

    /// API key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Build the `auth` request.
    #[must_use]
    pub fn to_request(&self) -> ClientRequest {
        ClientRequest::Auth {
            key: self.key.clone(),
            secret: self.secret.clone(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("key", &self.key)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

// =============================================================================
// Authentication Handler
// =============================================================================

/// Authentication progress for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthState {
    /// Nothing sent yet.
    #[default]
    Pending,
    /// Request sent, awaiting response.
    Sent,
    /// Accepted.
    Authenticated,
    /// Rejected.
    Failed,
}

/// Tracks authentication for one push session.
#[derive(Debug)]
pub struct AuthHandler {
    credentials: Option<Credentials>,
    state: AuthState,
}

impl AuthHandler {
    /// Create a handler. Without credentials the session counts as authenticated.
    #[must_use]
    pub const fn new(credentials: Option<Credentials>) -> Self {
        let state = if credentials.is_some() {
            AuthState::Pending
        } else {
            AuthState::Authenticated
        };
        Self { credentials, state }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> AuthState {
        self.state
    }

    /// Whether subscriptions may be sent.
    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        matches!(self.state, AuthState::Authenticated)
    }

    /// Take the auth request to send, if one is due.
    pub fn begin(&mut self) -> Option<ClientRequest> {
        if self.state != AuthState::Pending {
            return None;
        }
        let request = self.credentials.as_ref().map(Credentials::to_request)?;
        self.state = AuthState::Sent;
        Some(request)
    }

    /// Server accepted the credentials.
    pub const fn on_authenticated(&mut self) {
        self.state = AuthState::Authenticated;
    }

    /// Server reported an error; returns the mapped failure.
    pub fn on_error(&mut self, msg: &ErrorMessage) -> AuthError {
        self.state = AuthState::Failed;
        AuthError::from(msg)
    }
}
