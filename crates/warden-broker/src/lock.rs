//! Keyring lock policy: idle timer, always-lock, and skip-auto-lock.
//!
//! Lock and unlock transitions are serialized. An idle fire only locks if
//! no activity re-armed the timer between the fire and the moment it holds
//! the transition gate.

use std::fmt;
use std::sync::{Arc, Weak};

use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, watch};
use tracing::{debug, info};

use crate::collaborators::Keyring;
use crate::errors::BrokerError;
use crate::timer::{FireAction, IdleTimer, Suppression, SuppressionGuard};

/// Why the keyring was locked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockReason {
    /// Idle timer expired.
    Idle,
    /// A UI asked for it.
    Explicit,
    /// Always-lock policy after a sensitive operation.
    AlwaysLock,
    /// Timeout was switched to 0 (always lock).
    PolicyChange,
}

impl LockReason {
    /// Metric label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Explicit => "explicit",
            Self::AlwaysLock => "always_lock",
            Self::PolicyChange => "policy_change",
        }
    }
}

impl fmt::Display for LockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the session's lock state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockState {
    /// Configured idle timeout in minutes.
    pub time_auto_lock: u32,
    /// Lock after every sensitive operation (`time_auto_lock == 0`).
    pub always_lock: bool,
    /// Timer-driven and always-lock locking is currently suppressed.
    pub skip_auto_lock: bool,
    /// Whether the keyring is locked.
    pub locked: bool,
}

#[derive(Clone, Copy)]
struct Policy {
    minutes: u32,
    applied: bool,
}

/// Owns the idle timer and every lock transition.
pub struct LockController {
    keyring: Arc<dyn Keyring>,
    timer: IdleTimer,
    skip: Suppression,
    policy: Mutex<Policy>,
    locked: watch::Sender<bool>,
    transition: AsyncMutex<()>,
}

impl LockController {
    /// Build a controller. The timer stays disarmed until the first
    /// [`LockController::apply_auto_lock`].
    pub fn new(keyring: Arc<dyn Keyring>, initially_locked: bool) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            let on_fire: FireAction = Arc::new(move |epoch| {
                let weak = weak.clone();
                Box::pin(async move {
                    match weak.upgrade() {
                        Some(controller) => controller.lock_on_idle(epoch).await,
                        None => Ok(()),
                    }
                })
            });
            let skip = Suppression::new();
            let (locked, _) = watch::channel(initially_locked);
            Self {
                keyring,
                timer: IdleTimer::new(on_fire, skip.clone()),
                skip,
                policy: Mutex::new(Policy {
                    minutes: 0,
                    applied: false,
                }),
                locked,
                transition: AsyncMutex::new(()),
            }
        })
    }

    /// Lock the keyring and cancel the idle timer.
    ///
    /// Observers see `true` only on an unlocked → locked transition. When the
    /// keyring refuses, the timer keeps its armed state.
    pub async fn lock(&self, reason: LockReason) -> Result<(), BrokerError> {
        let _gate = self.transition.lock().await;
        self.lock_keyring(reason).await
    }

    /// Idle-timer lock for the fire that consumed `epoch`. A no-op when the
    /// timer was re-armed or disarmed since, e.g. by an unlock.
    async fn lock_on_idle(&self, epoch: u64) -> Result<(), BrokerError> {
        let _gate = self.transition.lock().await;
        if !self.timer.is_current(epoch) {
            debug!("idle lock superseded by activity");
            return Ok(());
        }
        if self.skip.is_active() {
            debug!("idle lock suppressed");
            return Ok(());
        }
        self.lock_keyring(LockReason::Idle).await
    }

    async fn lock_keyring(&self, reason: LockReason) -> Result<(), BrokerError> {
        self.keyring
            .lock()
            .await
            .map_err(|e| BrokerError::LockPolicy {
                message: format!("failed to lock keyring: {e}"),
            })?;
        self.timer.disarm();

        let transitioned = self.locked.send_if_modified(|locked| {
            let was_locked = *locked;
            *locked = true;
            !was_locked
        });
        if transitioned {
            counter!("broker_locks_total", "reason" => reason.as_str()).increment(1);
            info!(%reason, "keyring locked");
        } else {
            debug!(%reason, "keyring already locked");
        }
        Ok(())
    }

    /// Unlock with the master password and restart the idle timer.
    ///
    /// A wrong password is a [`BrokerError::LockPolicy`] and leaves the timer
    /// as it was.
    pub async fn unlock(&self, password: &str) -> Result<(), BrokerError> {
        let _gate = self.transition.lock().await;
        self.keyring
            .unlock(password)
            .await
            .map_err(|e| BrokerError::LockPolicy {
                message: format!("unlock failed: {e}"),
            })?;

        let transitioned = self.locked.send_if_modified(|locked| {
            let was_locked = *locked;
            *locked = false;
            was_locked
        });
        if transitioned {
            info!("keyring unlocked");
        }
        self.touch();
        Ok(())
    }

    /// Restart the idle window. Called for every inbound dispatch.
    pub fn touch(&self) {
        let minutes = self.policy.lock().minutes;
        if minutes > 0 {
            self.timer.arm(minutes);
        }
    }

    /// Apply a configured timeout.
    ///
    /// A changed value cancels the timer, then re-arms it for `minutes > 0`,
    /// or for `0` locks immediately unless this is the first application
    /// since construction or skip-auto-lock is active.
    pub async fn apply_auto_lock(&self, minutes: u32) -> Result<(), BrokerError> {
        let (changed, first) = {
            let mut policy = self.policy.lock();
            let first = !policy.applied;
            let changed = first || policy.minutes != minutes;
            policy.minutes = minutes;
            policy.applied = true;
            (changed, first)
        };
        if !changed {
            return Ok(());
        }

        debug!(minutes, first, "applying auto-lock timeout");
        self.timer.disarm();
        if minutes > 0 {
            self.timer.arm(minutes);
        } else if !first && !self.skip.is_active() {
            self.lock(LockReason::PolicyChange).await?;
        }
        Ok(())
    }

    /// Post-sensitive-operation hook: lock when the always-lock policy is in
    /// effect, unless `first_run` or skip-auto-lock exempts it.
    ///
    /// Returns whether a lock was performed.
    pub async fn lock_if_always(&self, first_run: bool) -> Result<bool, BrokerError> {
        if !self.always_lock() {
            return Ok(false);
        }
        if first_run || self.skip.is_active() {
            debug!(first_run, "always-lock suppressed");
            return Ok(false);
        }
        self.lock(LockReason::AlwaysLock).await?;
        Ok(true)
    }

    /// Suppress timer-driven and always-lock locking while the guard lives.
    pub fn skip_auto_lock(&self) -> SuppressionGuard {
        self.skip.hold()
    }

    /// Whether `timeAutoLock == 0`.
    pub fn always_lock(&self) -> bool {
        let policy = self.policy.lock();
        policy.applied && policy.minutes == 0
    }

    /// Whether the idle timer is armed.
    pub fn timer_armed(&self) -> bool {
        self.timer.is_armed()
    }

    /// Current lock state.
    pub fn state(&self) -> LockState {
        let policy = *self.policy.lock();
        LockState {
            time_auto_lock: policy.minutes,
            always_lock: policy.applied && policy.minutes == 0,
            skip_auto_lock: self.skip.is_active(),
            locked: *self.locked.borrow(),
        }
    }

    /// Whether the keyring is locked, as last observed.
    pub fn is_locked(&self) -> bool {
        *self.locked.borrow()
    }

    /// Stream of lock transitions.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.locked.subscribe()
    }

    /// Stop the idle timer for good.
    pub fn shutdown(&self) {
        self.timer.disarm();
    }
}
