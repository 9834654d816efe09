//! # TCE Server
//!
//! Deployable process around the coordination engine: configuration loading,
//! logging, the HTTP API, HTTP clients for participants and business actions,
//! and background maintenance workers.

pub mod api;
pub mod bootstrap;
pub mod remote;
pub mod workers;

pub use api::{router, ApiError, AppState};
pub use bootstrap::{build_engine, init_logging, load_config, Overrides};
pub use remote::{HttpActionInvoker, HttpParticipant};
pub use workers::{WorkerConfig, WorkerManager};
