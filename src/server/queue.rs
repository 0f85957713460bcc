//! Bounded connection admission queue
//!
//! Keeps the set of live client connections bounded under sustained
//! overload. Entries are ordered by admission time; when the queue is
//! full, admitting a new connection evicts the oldest one, whose handle
//! is returned so the caller can force-close it. Touching an existing
//! entry never reorders it: this is an admission list, not an LRU, so
//! long-lived relays are not protected from eviction under load.

use std::collections::VecDeque;
use std::sync::Weak;
use tokio::sync::Notify;

/// Stable integer identity of one client connection.
pub type ConnId = u64;

/// An entry removed to make room for a new admission.
#[derive(Debug)]
pub struct Evicted {
    /// Id of the evicted connection
    pub id: ConnId,
    /// Close handle; upgrading fails if the connection already went away
    pub handle: Weak<Notify>,
}

/// FIFO of admitted connection ids with bounded capacity.
#[derive(Debug)]
pub struct ConnectionQueue {
    entries: VecDeque<(ConnId, Weak<Notify>)>,
    capacity: usize,
}

impl ConnectionQueue {
    /// Create a queue admitting at most `capacity` connections.
    ///
    /// Scratch space is reserved at twice the capacity so steady-state
    /// churn does not reallocate.
    pub fn new(capacity: usize) -> Self {
        ConnectionQueue {
            entries: VecDeque::with_capacity(capacity.saturating_mul(2)),
            capacity,
        }
    }

    /// Number of admitted connections.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the queue holds no connections.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether admitting one more connection would evict.
    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Admit `id`, evicting the oldest entry first if at capacity.
    ///
    /// If `id` is already present its handle is refreshed in place and
    /// nothing is evicted; admission order is preserved.
    pub fn insert_or_touch(&mut self, id: ConnId, handle: Weak<Notify>) -> Option<Evicted> {
        if let Some(entry) = self.entries.iter_mut().find(|(entry_id, _)| *entry_id == id) {
            entry.1 = handle;
            return None;
        }
        let evicted = if self.is_full() { self.pop_oldest() } else { None };
        self.entries.push_back((id, handle));
        evicted
    }

    /// Remove and return the oldest admitted entry.
    pub fn pop_oldest(&mut self) -> Option<Evicted> {
        self.entries
            .pop_front()
            .map(|(id, handle)| Evicted { id, handle })
    }

    /// Remove `id` from the queue. Returns whether it was present.
    pub fn erase(&mut self, id: ConnId) -> bool {
        match self.entries.iter().position(|(entry_id, _)| *entry_id == id) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }
}
