//! Live settings with persistence and change notification.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::errors::Result;
use crate::loader::{apply_env_overrides, deep_merge, load_file_layer, validate};
use crate::types::WardenSettings;

/// Holds the current [`WardenSettings`] and publishes every change.
///
/// Updates are JSON patches deep-merged over the current value. The store
/// also keeps the persisted layer (defaults plus file, without environment or
/// command-line overrides); each patch is merged into both, and only the
/// persisted layer is written to the backing file. The write happens before
/// subscribers are notified; a failed write leaves both values unchanged.
pub struct SettingsStore {
    tx: watch::Sender<WardenSettings>,
    path: Option<PathBuf>,
    persisted: Mutex<WardenSettings>,
}

impl SettingsStore {
    /// Store with an optional backing file, whose content is `settings`.
    pub fn new(settings: WardenSettings, path: Option<PathBuf>) -> Self {
        Self::layered(settings.clone(), settings, path)
    }

    /// Store whose live value `live` carries overrides that `persisted`
    /// (what the backing file holds) does not.
    pub fn layered(live: WardenSettings, persisted: WardenSettings, path: Option<PathBuf>) -> Self {
        let (tx, _rx) = watch::channel(live);
        Self {
            tx,
            path,
            persisted: Mutex::new(persisted),
        }
    }

    /// Store that never touches the filesystem.
    pub fn in_memory(settings: WardenSettings) -> Self {
        Self::new(settings, None)
    }

    /// Load from `path` (defaults when absent) and persist updates back to it.
    /// Environment overrides apply to the live value only.
    pub fn load(path: &Path) -> Result<Self> {
        let persisted = load_file_layer(path)?;
        let mut live = persisted.clone();
        apply_env_overrides(&mut live);
        validate(&live)?;
        Ok(Self::layered(live, persisted, Some(path.to_path_buf())))
    }

    /// Current snapshot.
    pub fn get(&self) -> WardenSettings {
        self.tx.borrow().clone()
    }

    /// Receiver that observes every future change.
    pub fn subscribe(&self) -> watch::Receiver<WardenSettings> {
        self.tx.subscribe()
    }

    /// Backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Deep-merge `patch` over the current settings.
    ///
    /// Returns the resulting settings. Subscribers are notified only when the
    /// value actually changed.
    pub fn update(&self, patch: Value) -> Result<WardenSettings> {
        let mut persisted = self.persisted.lock();

        let current = self.get();
        let next = merge_patch(&current, &patch)?;
        validate(&next)?;
        let stored = merge_patch(&persisted, &patch)?;

        if next == current && stored == *persisted {
            debug!("settings update is a no-op");
            return Ok(next);
        }

        if let Some(path) = &self.path {
            persist(path, &stored)?;
        }
        *persisted = stored;

        if next != current {
            let _ = self.tx.send_replace(next.clone());
            info!(time_auto_lock = next.lock.time_auto_lock, "settings updated");
        }
        Ok(next)
    }

    /// Set the idle-lock timeout in minutes (`0` = always lock).
    pub fn set_auto_lock_minutes(&self, minutes: u32) -> Result<WardenSettings> {
        self.update(json!({ "lock": { "timeAutoLock": minutes } }))
    }
}

fn merge_patch(base: &WardenSettings, patch: &Value) -> Result<WardenSettings> {
    let merged = deep_merge(serde_json::to_value(base)?, patch.clone());
    Ok(serde_json::from_value(merged)?)
}

fn persist(path: &Path, settings: &WardenSettings) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(settings)?)?;
    std::fs::rename(&tmp, path)?;
    debug!(?path, "settings persisted");
    Ok(())
}
