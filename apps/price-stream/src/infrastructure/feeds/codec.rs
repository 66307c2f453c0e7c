//! Feed Codec
//!
//! Decodes JSON text frames from push feeds. Servers may send a single
//! message object or an array of them; the `"type"` field selects the
//! message shape.

use crate::infrastructure::feeds::messages::{
    ErrorMessage, FeedMessage, PriceMessage, SubscribedMessage,
};

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Unknown message type.
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    /// Invalid message format.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),
}

/// JSON codec for push feeds.
#[derive(Debug, Default, Clone)]
pub struct JsonCodec;

impl JsonCodec {
    /// Create a new JSON codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode a JSON text frame into feed messages.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON parsing fails, the `"type"` field is missing
    /// or unknown, or the frame is neither an array nor an object.
    pub fn decode(&self, text: &str) -> Result<Vec<FeedMessage>, CodecError> {
        let trimmed = text.trim();

        if trimmed.starts_with('[') {
            let values: Vec<serde_json::Value> = serde_json::from_str(trimmed)?;
            values.into_iter().map(Self::decode_value).collect()
        } else if trimmed.starts_with('{') {
            let value: serde_json::Value = serde_json::from_str(trimmed)?;
            Ok(vec![Self::decode_value(value)?])
        } else {
            let preview: String = trimmed.chars().take(50).collect();
            Err(CodecError::InvalidFormat(format!(
                "expected JSON array or object, got: {preview}..."
            )))
        }
    }

    fn decode_value(value: serde_json::Value) -> Result<FeedMessage, CodecError> {
        let msg_type = value.get("type").and_then(|v| v.as_str());

        match msg_type {
            Some("price" | "tick") => {
                let m: PriceMessage = serde_json::from_value(value)?;
                Ok(FeedMessage::Price(m))
            }
            Some("heartbeat") => Ok(FeedMessage::Heartbeat),
            Some("authenticated") => Ok(FeedMessage::Authenticated),
            Some("subscribed") => {
                let m: SubscribedMessage = serde_json::from_value(value)?;
                Ok(FeedMessage::Subscribed(m))
            }
            Some("error") => {
                let m: ErrorMessage = serde_json::from_value(value)?;
                Ok(FeedMessage::Error(m))
            }
            Some(other) => Err(CodecError::UnknownMessageType(other.to_string())),
            None => Err(CodecError::InvalidFormat("missing \"type\" field".to_string())),
        }
    }
}
