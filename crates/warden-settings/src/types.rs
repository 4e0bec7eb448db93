//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]`, so partial
//! JSON is accepted and missing fields take their production defaults.

use serde::{Deserialize, Serialize};

/// Default idle-lock timeout in minutes.
pub const DEFAULT_AUTO_LOCK_MINUTES: u32 = 15;

/// Upper bound accepted for `lock.timeAutoLock` (one day).
pub const MAX_AUTO_LOCK_MINUTES: u32 = 1440;

/// Root settings type.
///
/// ```json
/// {
///   "lock": { "timeAutoLock": 5 },
///   "server": { "port": 9850 }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WardenSettings {
    /// Keyring lock policy.
    pub lock: LockSettings,
    /// Broker runtime limits.
    pub broker: BrokerSettings,
    /// Transport settings.
    pub server: ServerSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

/// Keyring lock policy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LockSettings {
    /// Idle minutes before the keyring locks. `0` means "always lock": lock
    /// right after every sensitive operation instead of on a timer.
    pub time_auto_lock: u32,
}

impl LockSettings {
    /// Whether the "always lock" policy is in effect.
    pub fn always_lock(&self) -> bool {
        self.time_auto_lock == 0
    }
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            time_auto_lock: DEFAULT_AUTO_LOCK_MINUTES,
        }
    }
}

/// Broker runtime limits.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrokerSettings {
    /// Maximum seconds a plain call may run. Approval-gated calls are exempt.
    pub handler_timeout_secs: u64,
    /// Number of settled request ids remembered for duplicate detection.
    pub settled_history: usize,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            handler_timeout_secs: 300,
            settled_history: 256,
        }
    }
}

/// WebSocket transport settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` = auto-assign).
    pub port: u16,
    /// Maximum concurrently attached UI channels.
    pub max_connections: usize,
    /// Outbound queue depth per channel.
    pub channel_buffer: usize,
    /// Seconds between server pings.
    pub ping_interval_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9850,
            max_connections: 32,
            channel_buffer: 256,
            ping_interval_secs: 30,
        }
    }
}

/// Logging configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults() {
        let s = WardenSettings::default();
        assert_eq!(s.lock.time_auto_lock, DEFAULT_AUTO_LOCK_MINUTES);
        assert!(!s.lock.always_lock());
        assert_eq!(s.broker.handler_timeout_secs, 300);
        assert_eq!(s.broker.settled_history, 256);
        assert_eq!(s.server.host, "127.0.0.1");
        assert_eq!(s.server.port, 9850);
        assert_eq!(s.logging.level, "info");
    }

    #[test]
    fn zero_timeout_is_always_lock() {
        let lock = LockSettings { time_auto_lock: 0 };
        assert!(lock.always_lock());
    }

    #[test]
    fn camel_case_wire_format() {
        let v = serde_json::to_value(WardenSettings::default()).unwrap();
        assert_eq!(v["lock"]["timeAutoLock"], 15);
        assert_eq!(v["server"]["maxConnections"], 32);
        assert_eq!(v["broker"]["handlerTimeoutSecs"], 300);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let s: WardenSettings = serde_json::from_value(json!({"lock": {"timeAutoLock": 0}})).unwrap();
        assert!(s.lock.always_lock());
        assert_eq!(s.server, ServerSettings::default());
    }
}
