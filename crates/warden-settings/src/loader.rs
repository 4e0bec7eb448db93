//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`WardenSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `WARDEN_*` environment variable overrides
//! 4. Validate ranges

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::{MAX_AUTO_LOCK_MINUTES, WardenSettings};

/// Resolve the default settings file (`~/.warden/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".warden").join("settings.json")
}

/// Load settings from [`settings_path`].
pub fn load_settings() -> Result<WardenSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from `path`, falling back to defaults when it does not exist.
///
/// Invalid JSON or out-of-range values are errors; invalid environment
/// overrides are ignored with a warning.
pub fn load_settings_from_path(path: &Path) -> Result<WardenSettings> {
    let mut settings = load_file_layer(path)?;
    apply_env_overrides(&mut settings);
    validate(&settings)?;
    Ok(settings)
}

/// Defaults with the file at `path` merged over them, without environment
/// overrides. This is the layer written back when settings change.
pub fn load_file_layer(path: &Path) -> Result<WardenSettings> {
    let defaults = serde_json::to_value(WardenSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "no settings file, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursively merge `source` into `target`.
///
/// Objects merge per key; arrays and primitives in `source` replace the
/// target value; `null` in `source` leaves the target untouched.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Check value ranges that serde cannot express.
pub fn validate(settings: &WardenSettings) -> Result<()> {
    if settings.lock.time_auto_lock > MAX_AUTO_LOCK_MINUTES {
        return Err(SettingsError::InvalidValue(format!(
            "lock.timeAutoLock must be at most {MAX_AUTO_LOCK_MINUTES} minutes, got {}",
            settings.lock.time_auto_lock
        )));
    }
    if settings.server.channel_buffer == 0 {
        return Err(SettingsError::InvalidValue(
            "server.channelBuffer must be positive".to_string(),
        ));
    }
    if settings.server.ping_interval_secs == 0 {
        return Err(SettingsError::InvalidValue(
            "server.pingIntervalSecs must be positive".to_string(),
        ));
    }
    Ok(())
}

/// Apply `WARDEN_*` environment overrides.
pub fn apply_env_overrides(settings: &mut WardenSettings) {
    if let Some(v) = read_env_range("WARDEN_AUTO_LOCK_MINUTES", 0, MAX_AUTO_LOCK_MINUTES) {
        settings.lock.time_auto_lock = v;
    }
    if let Some(v) = read_env_string("WARDEN_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read_env_range("WARDEN_PORT", 1u16, u16::MAX) {
        settings.server.port = v;
    }
    if let Some(v) = read_env_range("WARDEN_MAX_CONNECTIONS", 1usize, 10_000) {
        settings.server.max_connections = v;
    }
    if let Some(v) = read_env_string("WARDEN_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_env_bool("WARDEN_LOG_JSON") {
        settings.logging.json = v;
    }
}

/// Parse a boolean: `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`, any case.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a number and accept it only inside `min..=max`.
pub fn parse_in_range<T>(val: &str, min: T, max: T) -> Option<T>
where
    T: FromStr + PartialOrd,
{
    let n: T = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let parsed = parse_bool(&val);
    if parsed.is_none() {
        warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    parsed
}

fn read_env_range<T>(name: &str, min: T, max: T) -> Option<T>
where
    T: FromStr + PartialOrd,
{
    let val = std::env::var(name).ok()?;
    let parsed = parse_in_range(&val, min, max);
    if parsed.is_none() {
        warn!(key = name, value = %val, "out-of-range env var, ignoring");
    }
    parsed
}
