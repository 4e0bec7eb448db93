//! Session broker: the composition root.
//!
//! One [`SessionBroker`] owns one [`SessionState`] (lock controller, idle
//! timer, subscription registry, pending queue, channels) and the dispatch
//! table. Nothing is global, so tests can run many brokers side by side.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use warden_core::ChannelId;
use warden_settings::BrokerSettings;

use crate::channel::{Channel, ChannelRegistry};
use crate::collaborators::Services;
use crate::dispatch::{DispatchTable, HandlerContext};
use crate::errors::BrokerError;
use crate::lock::LockController;
use crate::pending::PendingQueue;
use crate::subscriptions::{ReplyBarrier, SubscriptionRegistry};
use crate::types::{ChannelMessage, InboundMessage, Reply, Response};

/// Broker runtime limits.
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// Upper bound for plain calls.
    pub handler_timeout: Duration,
    /// Settled request ids remembered for duplicate detection.
    pub settled_history: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::from_settings(&BrokerSettings::default())
    }
}

impl BrokerConfig {
    /// From the `broker` settings section.
    pub fn from_settings(settings: &BrokerSettings) -> Self {
        Self {
            handler_timeout: Duration::from_secs(settings.handler_timeout_secs),
            settled_history: settings.settled_history,
        }
    }
}

/// State shared by every handler of one session.
pub struct SessionState {
    /// Lock policy and idle timer.
    pub lock: Arc<LockController>,
    /// Live subscriptions.
    pub subscriptions: Arc<SubscriptionRegistry>,
    /// Approval-gated requests.
    pub pending: PendingQueue,
    /// Open channels.
    pub channels: ChannelRegistry,
    /// External collaborators.
    pub services: Services,
    shutdown: CancellationToken,
}

impl SessionState {
    /// Run `job` in the background until it finishes or the broker shuts down.
    pub fn spawn_job<F>(&self, name: &'static str, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.shutdown.clone();
        drop(tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => debug!(job = name, "background job cancelled"),
                () = job => debug!(job = name, "background job finished"),
            }
        }));
    }

    /// Whether the broker is shutting down.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Point-in-time counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerStats {
    /// Open channels.
    pub channels: usize,
    /// Live subscriptions.
    pub subscriptions: usize,
    /// Pending requests.
    pub pending: usize,
    /// Keyring locked.
    pub locked: bool,
}

/// The session broker.
pub struct SessionBroker {
    state: Arc<SessionState>,
    table: DispatchTable,
    started_at: Instant,
}

impl SessionBroker {
    /// Build a broker and apply the persisted lock policy.
    ///
    /// Must be called inside a tokio runtime.
    pub async fn new(config: BrokerConfig, services: Services) -> Result<Arc<Self>, BrokerError> {
        let table = DispatchTable::with_builtin_handlers(config.handler_timeout)?;

        let locked = services.keyring.is_locked().await;
        let lock = LockController::new(Arc::clone(&services.keyring), locked);
        let mut settings_rx = services.settings.subscribe();
        let initial = settings_rx.borrow_and_update().lock.time_auto_lock;
        lock.apply_auto_lock(initial).await?;

        let state = Arc::new(SessionState {
            lock,
            subscriptions: SubscriptionRegistry::new(),
            pending: PendingQueue::new(config.settled_history),
            channels: ChannelRegistry::new(),
            services,
            shutdown: CancellationToken::new(),
        });

        let watcher_lock = Arc::clone(&state.lock);
        state.spawn_job("settings-watcher", async move {
            while settings_rx.changed().await.is_ok() {
                let minutes = settings_rx.borrow_and_update().lock.time_auto_lock;
                if let Err(err) = watcher_lock.apply_auto_lock(minutes).await {
                    error!(error = %err, minutes, "failed to apply auto-lock setting");
                }
            }
        });

        info!(time_auto_lock = initial, locked, "session broker started");
        Ok(Arc::new(Self {
            state,
            table,
            started_at: Instant::now(),
        }))
    }

    /// Shared session state.
    pub fn state(&self) -> &Arc<SessionState> {
        &self.state
    }

    /// Attach a UI surface whose outbound queue is `tx`.
    pub fn open_channel(&self, tx: mpsc::Sender<ChannelMessage>) -> Arc<Channel> {
        let channel = self.state.channels.open(tx);
        info!(channel_id = %channel.id(), "channel opened");
        channel
    }

    /// Detach a UI surface, tearing down its subscriptions.
    ///
    /// Pending requests it created stay queued. Returns the number of
    /// subscriptions torn down; unknown or already-closed ids return 0.
    pub fn close_channel(&self, id: &ChannelId) -> usize {
        let Some(channel) = self.state.channels.close(id) else {
            debug!(channel_id = %id, "close of unknown channel ignored");
            return 0;
        };
        let torn_down = self.state.subscriptions.cancel_all_for_channel(id);
        info!(
            channel_id = %id,
            subscriptions = torn_down,
            dropped = channel.dropped_count(),
            "channel closed"
        );
        torn_down
    }

    /// Dispatch one request arriving on `channel_id`.
    ///
    /// Subscriptions opened by the request start forwarding once this returns.
    pub async fn handle(
        &self,
        channel_id: &ChannelId,
        request_id: &str,
        message_type: &str,
        payload: Value,
    ) -> Result<Reply, BrokerError> {
        let (latch, ready) = ReplyBarrier::pair();
        let outcome = self
            .route(channel_id, request_id, message_type, payload, ready)
            .await;
        latch.release();
        outcome
    }

    async fn route(
        &self,
        channel_id: &ChannelId,
        request_id: &str,
        message_type: &str,
        payload: Value,
        ready: ReplyBarrier,
    ) -> Result<Reply, BrokerError> {
        let channel = self
            .state
            .channels
            .get(channel_id)
            .ok_or_else(|| BrokerError::not_found("channel", channel_id.as_str()))?;
        let ctx = HandlerContext {
            session: Arc::clone(&self.state),
            channel,
            request_id: request_id.to_owned(),
            ready,
        };
        self.table.dispatch(&ctx, message_type, payload).await
    }

    /// Dispatch `message` and queue the response on `channel`.
    ///
    /// Returns whether the response was delivered; a response for a channel
    /// that closed meanwhile is discarded. Events of a subscription opened by
    /// `message` are queued after its response.
    pub async fn handle_message(&self, channel: &Arc<Channel>, message: InboundMessage) -> bool {
        let (latch, ready) = ReplyBarrier::pair();
        let outcome = self
            .route(
                channel.id(),
                &message.id,
                &message.message_type,
                message.payload,
                ready,
            )
            .await;
        let response = Response::from_outcome(&message.id, outcome);
        let delivered = channel.send(ChannelMessage::Response(response));
        latch.release();
        if !delivered {
            warn!(
                channel_id = %channel.id(),
                request_id = %message.id,
                message_type = %message.message_type,
                "response undeliverable, discarded"
            );
        }
        delivered
    }

    /// Current counters.
    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            channels: self.state.channels.len(),
            subscriptions: self.state.subscriptions.len(),
            pending: self.state.pending.len(),
            locked: self.state.lock.is_locked(),
        }
    }

    /// Time since construction.
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Stop background work, close every channel, and cancel pending waiters.
    pub fn shutdown(&self) {
        if self.state.shutdown.is_cancelled() {
            return;
        }
        self.state.shutdown.cancel();
        self.state.lock.shutdown();
        for channel in self.state.channels.drain() {
            let _ = self.state.subscriptions.cancel_all_for_channel(channel.id());
        }
        let _ = self.state.subscriptions.cancel_all();
        let cancelled = self.state.pending.clear();
        info!(pending_cancelled = cancelled, "session broker shut down");
    }
}

impl Drop for SessionBroker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
