//! # warden-settings
//!
//! Settings for the Warden session broker, loaded from three layers (in
//! priority order):
//! 1. **Compiled defaults**: [`WardenSettings::default()`]
//! 2. **User file**: `~/.warden/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `WARDEN_*` overrides (highest priority)
//!
//! [`SettingsStore`] holds the live value, persists updates, and notifies
//! subscribers (the broker's lock policy follows `lock.timeAutoLock`).

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod store;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, deep_merge, load_file_layer, load_settings, load_settings_from_path,
    settings_path, validate,
};
pub use store::SettingsStore;
pub use types::*;
