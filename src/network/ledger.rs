//! Request Correlation
//!
//! Per-connection table from request ID to whatever is waiting on that
//! request. The server keys pending challenges by the IDs its peers choose;
//! the client keys its own outstanding calls by IDs drawn from an [`IdCycle`].
//!
//! An entry is consumed exactly once: [`Ledger::take`] removes it, so a second
//! confirmation for the same ID finds nothing.

use std::collections::HashMap;

use super::protocol::RequestId;

/// Pending entries for one connection, keyed by request ID.
#[derive(Debug)]
pub struct Ledger<V> {
    entries: HashMap<RequestId, V>,
}

impl<V> Default for Ledger<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Ledger<V> {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self { entries: HashMap::new() }
    }

    /// Record a pending entry. Returns the entry it replaced, if the ID was reused.
    pub fn insert(&mut self, id: RequestId, value: V) -> Option<V> {
        self.entries.insert(id, value)
    }

    /// Remove and return the entry for `id`.
    pub fn take(&mut self, id: RequestId) -> Option<V> {
        self.entries.remove(&id)
    }

    /// Whether `id` is pending.
    pub fn contains(&self, id: RequestId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every entry, handing them back for cleanup.
    pub fn drain(&mut self) -> impl Iterator<Item = (RequestId, V)> + '_ {
        self.entries.drain()
    }
}

/// Self-generated request IDs: increments and wraps around.
#[derive(Debug, Default, Clone)]
pub struct IdCycle {
    next: RequestId,
}

impl IdCycle {
    /// Start a cycle at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Next ID in the cycle.
    pub fn next_id(&mut self) -> RequestId {
        let id = self.next;
        self.next = self.next.wrapping_add(1);
        id
    }
}
