//! Application Layer - Use cases and port definitions.
//!
//! This layer wires the domain to the outside world: the connector port
//! the feeds implement, and the services that run the streaming pipeline.

/// Port interfaces for upstream feeds.
pub mod ports;

/// Supervision, routing and the service facade.
pub mod services;
