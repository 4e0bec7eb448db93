//! Channels: one open connection between a UI surface and the broker.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use warden_core::ChannelId;

use crate::types::ChannelMessage;

/// Outbound half of one attached UI surface.
pub struct Channel {
    id: ChannelId,
    tx: mpsc::Sender<ChannelMessage>,
    open: AtomicBool,
    dropped: AtomicU64,
    opened_at: Instant,
}

impl Channel {
    /// Wrap the sending half of a channel's outbound queue.
    pub fn new(id: ChannelId, tx: mpsc::Sender<ChannelMessage>) -> Self {
        Self {
            id,
            tx,
            open: AtomicBool::new(true),
            dropped: AtomicU64::new(0),
            opened_at: Instant::now(),
        }
    }

    /// Channel id.
    pub fn id(&self) -> &ChannelId {
        &self.id
    }

    /// Queue a message without waiting.
    ///
    /// Returns `false` when the channel is closed or its queue is full; the
    /// message is dropped and counted.
    pub fn send(&self, message: ChannelMessage) -> bool {
        if self.is_open() && self.tx.try_send(message).is_ok() {
            true
        } else {
            let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Whether the channel still accepts messages.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.tx.is_closed()
    }

    /// Mark closed. Returns `true` on the first call only.
    pub(crate) fn mark_closed(&self) -> bool {
        self.open.swap(false, Ordering::SeqCst)
    }

    /// Messages dropped because the channel was closed or full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Time since the channel was opened.
    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }
}

/// All currently open channels.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: RwLock<HashMap<ChannelId, Arc<Channel>>>,
}

impl ChannelRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new channel around `tx`.
    pub fn open(&self, tx: mpsc::Sender<ChannelMessage>) -> Arc<Channel> {
        let channel = Arc::new(Channel::new(ChannelId::new(), tx));
        let _ = self
            .channels
            .write()
            .insert(channel.id().clone(), Arc::clone(&channel));
        channel
    }

    /// Look up an open channel.
    pub fn get(&self, id: &ChannelId) -> Option<Arc<Channel>> {
        self.channels.read().get(id).cloned()
    }

    /// Mark the channel closed and remove it. `None` if it was not open.
    pub fn close(&self, id: &ChannelId) -> Option<Arc<Channel>> {
        let channel = self.channels.write().remove(id)?;
        let _ = channel.mark_closed();
        Some(channel)
    }

    /// Remove and close every channel.
    pub fn drain(&self) -> Vec<Arc<Channel>> {
        let drained: Vec<_> = self.channels.write().drain().map(|(_, c)| c).collect();
        for channel in &drained {
            let _ = channel.mark_closed();
        }
        drained
    }

    /// Number of open channels.
    pub fn len(&self) -> usize {
        self.channels.read().len()
    }

    /// Whether no channel is open.
    pub fn is_empty(&self) -> bool {
        self.channels.read().is_empty()
    }
}
