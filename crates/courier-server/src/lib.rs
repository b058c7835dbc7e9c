//! # courier-server
//!
//! HTTP and WebSocket front end for the Courier relay: the connection
//! gateway, the health and online-users endpoints, configuration and metrics.

pub mod config;
pub mod handlers;
pub mod metrics;

pub use config::Config;
pub use handlers::{app, run_server, serve, AppState};
