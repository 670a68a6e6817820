//! Core types shared by every layer:
//! - **IDs**: stream and connection identifiers
//! - **Errors**: classified error type with thiserror derives
//! - **Config**: protocol limits, server and observability settings

mod config;
mod errors;
mod ids;

pub use config::{Config, ConnConfig, ObservabilityConfig, ServerConfig, MIN_FRAME_PAYLOAD};
pub use errors::{Error, ErrorClass, Result};
pub use ids::{ConnId, StreamId};
