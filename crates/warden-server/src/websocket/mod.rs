//! WebSocket transport: one connection is one broker channel.

pub mod handler;
pub mod heartbeat;
pub mod session;
