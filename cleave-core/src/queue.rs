//! # Packet Queue - Bounded Per-Stream FIFO
//!
//! One queue per output channel: the demux engine's producer thread pushes,
//! the channel's dispatch thread pops. A single mutex guards the deque;
//! a condvar gives the consumer a bounded wait instead of a spin. The queue
//! itself never blocks or rejects on enqueue - the soft capacity cap is
//! enforced by the engine's backpressure policy, not here.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::packet::Packet;

/// Entry in a channel's FIFO. End-of-stream rides the same queue as data so
/// that data-before-EOS ordering is structural.
#[derive(Debug)]
pub enum QueueEntry {
    Packet(Packet),
    EndOfStream,
}

pub struct PacketQueue {
    entries: Mutex<VecDeque<QueueEntry>>,
    ready: Condvar,
}

impl PacketQueue {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(32)),
            ready: Condvar::new(),
        }
    }

    /// Append to the tail. Never blocks.
    pub fn enqueue(&self, entry: QueueEntry) {
        self.entries.lock().push_back(entry);
        self.ready.notify_one();
    }

    /// Pop the head, or `None` when empty. Never blocks.
    pub fn try_dequeue(&self) -> Option<QueueEntry> {
        self.entries.lock().pop_front()
    }

    /// Pop the head, waiting up to `timeout` for an entry to arrive.
    ///
    /// The wait is bounded so the caller can re-check stop/flush flags every
    /// wake cycle; a `clear` also wakes all waiters.
    pub fn dequeue_timeout(&self, timeout: Duration) -> Option<QueueEntry> {
        let deadline = Instant::now() + timeout;
        let mut entries = self.entries.lock();

        while entries.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            self.ready.wait_for(&mut entries, remaining);
        }

        entries.pop_front()
    }

    /// Snapshot size, used for backpressure heuristics.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drop all buffered entries and wake any waiting consumer so it can
    /// re-check its flush flag.
    pub fn clear(&self) {
        self.entries.lock().clear();
        self.ready.notify_all();
    }
}

impl Default for PacketQueue {
    fn default() -> Self {
        Self::new()
    }
}
