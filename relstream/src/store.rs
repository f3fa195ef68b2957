//! Ordered segment storage keyed by sequence number.
//!
//! The same structure backs both directions of a connection: the send side
//! keeps encoded packets awaiting acknowledgment (the timestamp is the last
//! transmission), the receive side keeps payloads that arrived ahead of the
//! in-order point (the timestamp is the arrival).

use std::collections::BTreeMap;
use std::time::Instant;

/// One stored segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry<T> {
    pub value: T,
    /// Last send time (send side) or arrival time (receive side).
    pub stamp: Instant,
}

/// Segments ordered by ascending sequence number, at most one per number.
///
/// Never holds more than a window's worth of entries, so lookups stay cheap.
#[derive(Debug, Clone)]
pub struct SegmentStore<T> {
    entries: BTreeMap<u32, Entry<T>>,
}

impl<T> SegmentStore<T> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Insert a segment. Returns `false`, leaving the stored entry untouched,
    /// if `seq` is already present.
    pub fn insert(&mut self, seq: u32, value: T, now: Instant) -> bool {
        match self.entries.entry(seq) {
            std::collections::btree_map::Entry::Occupied(_) => false,
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(Entry { value, stamp: now });
                true
            }
        }
    }

    pub fn contains(&self, seq: u32) -> bool {
        self.entries.contains_key(&seq)
    }

    pub fn get(&self, seq: u32) -> Option<&Entry<T>> {
        self.entries.get(&seq)
    }

    pub fn get_mut(&mut self, seq: u32) -> Option<&mut Entry<T>> {
        self.entries.get_mut(&seq)
    }

    /// The lowest stored segment.
    pub fn first(&self) -> Option<(u32, &Entry<T>)> {
        self.entries.first_key_value().map(|(seq, e)| (*seq, e))
    }

    /// The lowest stored segment, mutably.
    pub fn first_mut(&mut self) -> Option<(u32, &mut Entry<T>)> {
        self.entries.iter_mut().next().map(|(seq, e)| (*seq, e))
    }

    pub fn remove(&mut self, seq: u32) -> Option<T> {
        self.entries.remove(&seq).map(|e| e.value)
    }

    /// Remove and return the lowest stored segment.
    pub fn remove_first(&mut self) -> Option<(u32, T)> {
        self.entries.pop_first().map(|(seq, e)| (seq, e.value))
    }

    /// Remove every segment numbered below `bound`, returning how many went.
    pub fn remove_below(&mut self, bound: u32) -> usize {
        let kept = self.entries.split_off(&bound);
        let removed = self.entries.len();
        self.entries = kept;
        removed
    }

    /// Iterate in ascending sequence order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &Entry<T>)> {
        self.entries.iter().map(|(seq, e)| (*seq, e))
    }

    /// Iterate mutably in ascending sequence order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u32, &mut Entry<T>)> {
        self.entries.iter_mut().map(|(seq, e)| (*seq, e))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for SegmentStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_is_idempotent() {
        let now = Instant::now();
        let mut store = SegmentStore::new();
        assert!(store.insert(3, "first", now));
        assert!(!store.insert(3, "second", now));
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(3).unwrap().value, "first");
    }

    #[test]
    fn iterates_in_sequence_order() {
        let now = Instant::now();
        let mut store = SegmentStore::new();
        for seq in [5, 1, 4, 2] {
            store.insert(seq, seq * 10, now);
        }
        let seqs: Vec<u32> = store.iter().map(|(seq, _)| seq).collect();
        assert_eq!(seqs, vec![1, 2, 4, 5]);
        assert_eq!(store.first().map(|(seq, _)| seq), Some(1));
    }

    #[test]
    fn remove_first_pops_lowest() {
        let now = Instant::now();
        let mut store = SegmentStore::new();
        store.insert(7, 'b', now);
        store.insert(6, 'a', now);
        assert_eq!(store.remove_first(), Some((6, 'a')));
        assert_eq!(store.remove_first(), Some((7, 'b')));
        assert_eq!(store.remove_first(), None);
        assert!(store.is_empty());
    }

    #[test]
    fn remove_below_is_exclusive() {
        let now = Instant::now();
        let mut store = SegmentStore::new();
        for seq in 1..=5 {
            store.insert(seq, (), now);
        }
        assert_eq!(store.remove_below(3), 2);
        assert!(!store.contains(2));
        assert!(store.contains(3));
        assert_eq!(store.remove_below(3), 0);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn stamp_is_mutable() {
        let t0 = Instant::now();
        let t1 = t0 + std::time::Duration::from_millis(10);
        let mut store = SegmentStore::new();
        store.insert(1, (), t0);
        store.get_mut(1).unwrap().stamp = t1;
        assert_eq!(store.get(1).unwrap().stamp, t1);
        for (_, entry) in store.iter_mut() {
            entry.stamp = t0;
        }
        assert_eq!(store.first().unwrap().1.stamp, t0);
    }
}
