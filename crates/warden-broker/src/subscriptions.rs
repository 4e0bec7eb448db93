//! Subscription registry and stream forwarding.
//!
//! Every subscription stores exactly one teardown closure over what it
//! created. A stream-backed subscription owns a [`DeliveryGate`] and the task
//! that drains the stream; teardown closes the gate under the same lock that
//! deliveries take and aborts the task, so once teardown returns nothing more
//! reaches the channel.
//!
//! Forwarding starts only once the reply carrying the subscription id has
//! been queued, so a client never sees an event for an id it does not know.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, trace};
use warden_core::{ChannelId, SubscriptionId};

use crate::channel::Channel;
use crate::types::{ChannelEvent, ChannelMessage};

/// Teardown action, run at most once.
pub type Teardown = Box<dyn FnOnce() + Send>;

struct Entry {
    channel_id: ChannelId,
    teardown: Teardown,
}

/// Gate between a subscription's forwarder and its channel.
pub struct DeliveryGate {
    channel: Mutex<Option<Arc<Channel>>>,
}

impl DeliveryGate {
    /// Open gate onto `channel`.
    pub fn new(channel: Arc<Channel>) -> Self {
        Self {
            channel: Mutex::new(Some(channel)),
        }
    }

    /// Send through the gate. `false` when closed or the channel refused.
    pub fn deliver(&self, message: ChannelMessage) -> bool {
        match &*self.channel.lock() {
            Some(channel) => channel.send(message),
            None => false,
        }
    }

    /// Close the gate. Waits for an in-progress delivery to finish.
    pub fn close(&self) {
        let _ = self.channel.lock().take();
    }

    /// Whether the gate is closed.
    pub fn is_closed(&self) -> bool {
        self.channel.lock().is_none()
    }
}

/// Held by whoever queues the reply; dropping it releases every
/// [`ReplyBarrier`] cloned from the same pair.
pub struct ReplyLatch {
    _tx: watch::Sender<()>,
}

impl ReplyLatch {
    /// Release the barrier.
    pub fn release(self) {}
}

/// Waits until the matching [`ReplyLatch`] is released.
#[derive(Clone)]
pub struct ReplyBarrier {
    rx: watch::Receiver<()>,
}

impl ReplyBarrier {
    /// A latch and its barrier.
    pub fn pair() -> (ReplyLatch, Self) {
        let (tx, rx) = watch::channel(());
        (ReplyLatch { _tx: tx }, Self { rx })
    }

    /// A barrier that is already released.
    pub fn released() -> Self {
        let (latch, barrier) = Self::pair();
        latch.release();
        barrier
    }

    /// Resolve once the latch is gone.
    pub async fn wait(mut self) {
        while self.rx.changed().await.is_ok() {}
    }
}

/// Maps subscription ids to their owning channel and teardown.
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: Mutex<HashMap<SubscriptionId, Entry>>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a teardown under a fresh id.
    pub fn register(&self, channel_id: ChannelId, teardown: Teardown) -> SubscriptionId {
        let id = SubscriptionId::new();
        self.insert(id.clone(), channel_id, teardown);
        id
    }

    fn insert(&self, id: SubscriptionId, channel_id: ChannelId, teardown: Teardown) {
        let _ = self
            .entries
            .lock()
            .insert(id, Entry { channel_id, teardown });
    }

    /// Remove `id` and run its teardown. Unknown ids are a silent no-op.
    ///
    /// Returns whether a subscription was torn down.
    pub fn cancel(&self, id: &SubscriptionId) -> bool {
        let entry = self.entries.lock().remove(id);
        match entry {
            Some(entry) => {
                (entry.teardown)();
                debug!(subscription_id = %id, channel_id = %entry.channel_id, "subscription cancelled");
                true
            }
            None => {
                trace!(subscription_id = %id, "cancel of unknown subscription ignored");
                false
            }
        }
    }

    /// Tear down every subscription owned by `channel_id`. Returns the count.
    pub fn cancel_all_for_channel(&self, channel_id: &ChannelId) -> usize {
        let owned: Vec<(SubscriptionId, Entry)> = {
            let mut entries = self.entries.lock();
            let ids: Vec<SubscriptionId> = entries
                .iter()
                .filter(|(_, e)| &e.channel_id == channel_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| entries.remove(&id).map(|e| (id, e)))
                .collect()
        };
        let count = owned.len();
        for (_, entry) in owned {
            (entry.teardown)();
        }
        if count > 0 {
            debug!(channel_id = %channel_id, count, "channel subscriptions torn down");
        }
        count
    }

    /// Tear down everything.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<Entry> = self.entries.lock().drain().map(|(_, e)| e).collect();
        let count = drained.len();
        for entry in drained {
            (entry.teardown)();
        }
        count
    }

    /// Whether `id` is live.
    pub fn contains(&self, id: &SubscriptionId) -> bool {
        self.entries.lock().contains_key(id)
    }

    /// Total live subscriptions.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no subscription is live.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Forward `stream` to `channel` as subscription deliveries tagged with
    /// `request_id`, until cancelled, the channel closes, or the stream ends.
    /// Nothing is forwarded before `ready` is released.
    ///
    /// Must be called from within a tokio runtime.
    pub fn subscribe_stream(
        self: &Arc<Self>,
        channel: &Arc<Channel>,
        request_id: &str,
        stream: BoxStream<'static, Value>,
        ready: ReplyBarrier,
    ) -> SubscriptionId {
        let id = SubscriptionId::new();
        let gate = Arc::new(DeliveryGate::new(Arc::clone(channel)));
        let task: Arc<Mutex<Option<AbortHandle>>> = Arc::new(Mutex::new(None));

        let teardown: Teardown = {
            let gate = Arc::clone(&gate);
            let task = Arc::clone(&task);
            Box::new(move || {
                gate.close();
                if let Some(handle) = task.lock().take() {
                    handle.abort();
                }
            })
        };
        self.insert(id.clone(), channel.id().clone(), teardown);

        let handle = tokio::spawn(forward(
            stream,
            ready,
            Arc::clone(&gate),
            id.clone(),
            request_id.to_owned(),
            Arc::downgrade(self),
        ));
        *task.lock() = Some(handle.abort_handle());
        // Teardown may have run before the handle was stored.
        if gate.is_closed() {
            handle.abort();
        }

        // Registered after close_channel already swept this channel.
        if !channel.is_open() {
            let _ = self.cancel(&id);
        }
        id
    }
}

async fn forward(
    mut stream: BoxStream<'static, Value>,
    ready: ReplyBarrier,
    gate: Arc<DeliveryGate>,
    id: SubscriptionId,
    request_id: String,
    registry: Weak<SubscriptionRegistry>,
) {
    ready.wait().await;
    while let Some(data) = stream.next().await {
        let message = ChannelMessage::Event(ChannelEvent::delivery(&request_id, id.clone(), data));
        if !gate.deliver(message) && gate.is_closed() {
            return;
        }
    }
    debug!(subscription_id = %id, "subscription stream ended");
    if let Some(registry) = registry.upgrade() {
        let _ = registry.cancel(&id);
    }
}
