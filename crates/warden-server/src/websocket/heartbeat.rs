//! Ping-based liveness tracking.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Liveness state of one client.
///
/// The reader marks the client alive on every inbound frame (pongs
/// included); the writer calls [`Heartbeat::tick`] before each ping.
pub struct Heartbeat {
    alive: AtomicBool,
    missed: AtomicU32,
    max_missed: u32,
}

impl Heartbeat {
    /// Client is dropped after `max_missed` consecutive silent intervals.
    pub fn new(max_missed: u32) -> Self {
        Self {
            alive: AtomicBool::new(true),
            missed: AtomicU32::new(0),
            max_missed: max_missed.max(1),
        }
    }

    /// Record activity from the client.
    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::Relaxed);
        self.missed.store(0, Ordering::Relaxed);
    }

    /// Close one interval. Returns `false` once the client has been silent
    /// for `max_missed` intervals in a row.
    pub fn tick(&self) -> bool {
        if self.alive.swap(false, Ordering::Relaxed) {
            self.missed.store(0, Ordering::Relaxed);
            return true;
        }
        let missed = self.missed.fetch_add(1, Ordering::Relaxed) + 1;
        missed < self.max_missed
    }

    /// Consecutive silent intervals so far.
    pub fn missed(&self) -> u32 {
        self.missed.load(Ordering::Relaxed)
    }
}
