//! # warden-core
//!
//! Shared vocabulary for the Warden session broker crates:
//!
//! - **Branded IDs**: `ChannelId`, `SubscriptionId`, `RequestId` as newtypes so a
//!   subscription id can never be passed where a pending-request id is expected
//! - **Logging**: `tracing` subscriber initialization and in-memory log capture
//!   for tests

#![deny(unsafe_code)]

pub mod ids;
pub mod logging;

pub use ids::{ChannelId, RequestId, SubscriptionId};
