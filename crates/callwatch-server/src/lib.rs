//! # Callwatch-Server
//!
//! HTTP surface for the Callwatch core: call lifecycle commands and the
//! supervisor monitoring endpoints, plus logging setup for the binary.

pub mod api;
pub mod logging;

pub use api::{create_router, ApiError, AppState};
pub use logging::setup_logging;
