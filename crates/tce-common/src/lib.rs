//! # TCE Common
//!
//! Identifiers, errors, configuration and retry policy shared by every
//! crate of the transaction coordination engine.

pub mod config;
pub mod error;
pub mod retry;
pub mod types;
pub mod utils;

pub use config::*;
pub use error::{Error, ErrorClass, Result};
pub use retry::RetryPolicy;
pub use types::*;

/// Re-export commonly used external types
pub mod prelude {
    pub use super::config::*;
    pub use super::error::{Error, ErrorClass, Result};
    pub use super::retry::RetryPolicy;
    pub use super::types::*;
    pub use async_trait::async_trait;
    pub use tracing::{debug, error, info, instrument, trace, warn};
}
