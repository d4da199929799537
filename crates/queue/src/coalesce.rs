use std::collections::VecDeque;

use rustc_hash::FxHashSet;
use synk_core::SyncKey;

/// FIFO of pending keys where repeated pushes of a queued key collapse into one entry.
#[derive(Debug, Default)]
pub struct Coalescer {
    pending: FxHashSet<SyncKey>,
    order: VecDeque<SyncKey>,
    coalesced: u64,
}

impl Coalescer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Pushes folded into an already pending entry.
    pub fn coalesced(&self) -> u64 {
        self.coalesced
    }

    pub fn contains(&self, key: &SyncKey) -> bool {
        self.pending.contains(key)
    }

    /// Returns false when the key was already pending.
    pub fn push(&mut self, key: SyncKey) -> bool {
        if self.pending.contains(&key) {
            self.coalesced += 1;
            return false;
        }
        self.pending.insert(key.clone());
        self.order.push_back(key);
        true
    }

    pub fn pop(&mut self) -> Option<SyncKey> {
        let key = self.order.pop_front()?;
        self.pending.remove(&key);
        Some(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn k(name: &str) -> SyncKey {
        SyncKey::new("ns", name)
    }

    #[test]
    fn duplicate_pushes_collapse_and_keep_first_position() {
        let mut q = Coalescer::new();
        assert!(q.push(k("a")));
        assert!(q.push(k("b")));
        assert!(!q.push(k("a")));
        assert!(!q.push(k("a")));
        assert_eq!(q.len(), 2);
        assert_eq!(q.coalesced(), 2);
        assert_eq!(q.pop(), Some(k("a")));
        assert_eq!(q.pop(), Some(k("b")));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn popped_key_can_be_queued_again() {
        let mut q = Coalescer::new();
        q.push(k("a"));
        assert_eq!(q.pop(), Some(k("a")));
        assert!(!q.contains(&k("a")));
        assert!(q.push(k("a")));
        assert!(q.contains(&k("a")));
    }
}
