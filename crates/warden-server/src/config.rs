//! Server configuration.

use std::time::Duration;

use warden_settings::ServerSettings;

/// Clients that miss this many consecutive pings are disconnected.
pub const MAX_MISSED_PINGS: u32 = 2;

/// Configuration for the Warden server.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind; `0` auto-assigns.
    pub port: u16,
    /// Maximum concurrently attached channels.
    pub max_connections: usize,
    /// Outbound queue depth per channel.
    pub channel_buffer: usize,
    /// Interval between server pings.
    pub ping_interval: Duration,
}

impl ServerConfig {
    /// From the `server` settings section.
    pub fn from_settings(settings: &ServerSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            max_connections: settings.max_connections,
            channel_buffer: settings.channel_buffer.max(1),
            ping_interval: Duration::from_secs(settings.ping_interval_secs.max(1)),
        }
    }

    /// `host:port`.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Silence after which a client is considered gone.
    pub fn liveness_timeout(&self) -> Duration {
        self.ping_interval * MAX_MISSED_PINGS
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_settings(&ServerSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_settings() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 9850);
        assert_eq!(cfg.max_connections, 32);
        assert_eq!(cfg.ping_interval, Duration::from_secs(30));
        assert_eq!(cfg.bind_addr(), "127.0.0.1:9850");
    }

    #[test]
    fn liveness_is_two_intervals() {
        let cfg = ServerConfig {
            ping_interval: Duration::from_secs(10),
            ..ServerConfig::default()
        };
        assert_eq!(cfg.liveness_timeout(), Duration::from_secs(20));
    }

    #[test]
    fn zero_values_are_clamped() {
        let cfg = ServerConfig::from_settings(&ServerSettings {
            channel_buffer: 0,
            ping_interval_secs: 0,
            ..ServerSettings::default()
        });
        assert_eq!(cfg.channel_buffer, 1);
        assert_eq!(cfg.ping_interval, Duration::from_secs(1));
    }
}
