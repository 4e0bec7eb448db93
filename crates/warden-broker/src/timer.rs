//! Idle-lock timer.
//!
//! A single cancellable one-shot timer. Each [`IdleTimer::arm`] or
//! [`IdleTimer::disarm`] starts a new epoch; a sleeping timer task only fires
//! if its epoch is still current when it wakes, and consumes the epoch before
//! running the action, so the action runs at most once per arm. The action
//! receives the epoch it consumed and can check [`IdleTimer::is_current`]
//! later to learn whether the timer was re-armed or disarmed meanwhile.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tracing::{debug, error, warn};

use crate::errors::BrokerError;

/// Action run when the timer fires, given the epoch the fire consumed.
pub type FireAction =
    Arc<dyn Fn(u64) -> BoxFuture<'static, Result<(), BrokerError>> + Send + Sync>;

/// Shared "suppress timer-driven locking" flag.
///
/// Active while at least one [`SuppressionGuard`] is alive.
#[derive(Clone, Default)]
pub struct Suppression {
    holders: Arc<AtomicUsize>,
}

impl Suppression {
    /// Create an inactive flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Activate until the returned guard is dropped.
    pub fn hold(&self) -> SuppressionGuard {
        let _ = self.holders.fetch_add(1, Ordering::SeqCst);
        SuppressionGuard {
            holders: Arc::clone(&self.holders),
        }
    }

    /// Whether any guard is alive.
    pub fn is_active(&self) -> bool {
        self.holders.load(Ordering::SeqCst) > 0
    }
}

/// Keeps a [`Suppression`] active.
#[must_use = "suppression ends when the guard is dropped"]
pub struct SuppressionGuard {
    holders: Arc<AtomicUsize>,
}

impl Drop for SuppressionGuard {
    fn drop(&mut self) {
        let _ = self.holders.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct TimerState {
    epoch: u64,
    task: Option<AbortHandle>,
}

/// Single-shot idle timer with epoch invalidation.
pub struct IdleTimer {
    state: Arc<Mutex<TimerState>>,
    on_fire: FireAction,
    suppression: Suppression,
}

impl IdleTimer {
    /// Create a disarmed timer.
    pub fn new(on_fire: FireAction, suppression: Suppression) -> Self {
        Self {
            state: Arc::new(Mutex::new(TimerState::default())),
            on_fire,
            suppression,
        }
    }

    /// Cancel any pending fire and, when `minutes > 0`, schedule one after
    /// `minutes * 60` seconds.
    pub fn arm(&self, minutes: u32) {
        self.arm_after(Duration::from_secs(u64::from(minutes) * 60));
    }

    /// Like [`IdleTimer::arm`] with an explicit delay. A zero delay disarms.
    pub fn arm_after(&self, delay: Duration) {
        let mut state = self.state.lock();
        state.epoch += 1;
        if let Some(task) = state.task.take() {
            task.abort();
        }
        if delay.is_zero() {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("no runtime available, idle timer not armed");
            return;
        };

        let epoch = state.epoch;
        let shared = Arc::clone(&self.state);
        let on_fire = Arc::clone(&self.on_fire);
        let suppression = self.suppression.clone();

        let handle = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let fired = {
                let mut state = shared.lock();
                if state.epoch != epoch {
                    return;
                }
                state.epoch += 1;
                state.task = None;
                state.epoch
            };
            if suppression.is_active() {
                debug!("idle timer fired while suppressed, skipping lock");
                return;
            }
            if let Err(err) = on_fire(fired).await {
                error!(error = %err, code = err.code(), "idle lock action failed");
            }
        });
        state.task = Some(handle.abort_handle());
    }

    /// Cancel any pending fire.
    pub fn disarm(&self) {
        let mut state = self.state.lock();
        state.epoch += 1;
        if let Some(task) = state.task.take() {
            task.abort();
        }
    }

    /// Whether no arm or disarm happened since `epoch` was observed.
    pub fn is_current(&self, epoch: u64) -> bool {
        self.state.lock().epoch == epoch
    }

    #[cfg(test)]
    pub(crate) fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    /// Whether a fire is scheduled.
    pub fn is_armed(&self) -> bool {
        self.state.lock().task.is_some()
    }
}

impl Drop for IdleTimer {
    fn drop(&mut self) {
        self.disarm();
    }
}
