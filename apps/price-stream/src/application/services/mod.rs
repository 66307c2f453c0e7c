//! Application Services
//!
//! - [`reconnect`]: backoff policy and per-source supervision
//! - [`routing`]: router, throttle and demand sync tasks
//! - [`status`]: read-only health snapshot
//! - [`stream`]: the [`PriceStreamService`] facade

pub mod reconnect;
pub(crate) mod routing;
pub mod status;
pub mod stream;

pub use reconnect::{ReconnectConfig, ReconnectManager, ReconnectPolicy};
pub use status::{LastError, SourceStatus, StatusBoard, StreamStatus};
pub use stream::{PriceStreamService, ServiceError};
