//! # warden-server
//!
//! Axum HTTP + WebSocket transport for the Warden session broker.
//!
//! - `GET /ws`: each connection opens one broker channel; frames are
//!   `{id, type, payload}` requests answered with `{id, success, result|error}`
//! - `GET /health`: broker counters as JSON
//! - `GET /metrics`: Prometheus text format
//!
//! Liveness is ping-based: a client silent for two ping intervals is dropped
//! and its channel closed.

#![deny(unsafe_code)]

pub mod config;
pub mod errors;
pub mod health;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::ServerConfig;
pub use errors::ServerError;
pub use server::{AppState, WardenServer};
pub use shutdown::{DEFAULT_SHUTDOWN_TIMEOUT, ShutdownCoordinator};
