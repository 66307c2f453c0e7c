//! Configuration Module
//!
//! Configuration loading for the streaming service.

mod settings;

pub use settings::{ConfigError, ProtocolSettings, ServerSettings, SourceSettings, StreamConfig};
