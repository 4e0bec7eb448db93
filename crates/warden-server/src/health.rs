//! `/health` endpoint.

use std::time::Instant;

use serde::Serialize;
use warden_broker::BrokerStats;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// `"ok"`, or `"shuttingDown"` once shutdown has begun.
    pub status: &'static str,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Attached channels.
    pub channels: usize,
    /// Live subscriptions.
    pub subscriptions: usize,
    /// Pending approval requests.
    pub pending: usize,
    /// Keyring lock flag.
    pub locked: bool,
}

/// Build a health response from broker counters.
pub fn health_check(start_time: Instant, stats: BrokerStats, shutting_down: bool) -> HealthResponse {
    HealthResponse {
        status: if shutting_down { "shuttingDown" } else { "ok" },
        uptime_secs: start_time.elapsed().as_secs(),
        channels: stats.channels,
        subscriptions: stats.subscriptions,
        pending: stats.pending,
        locked: stats.locked,
    }
}
