// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::BTreeMap;
use std::mem;

/// Identifies one entry of an [`OrderedQueue`].
///
/// Keys order by fire time first and by insertion order second, which makes the queue
/// stable for entries that share a fire time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryKey {
    when: i64,

    /// Insertion counter that keeps entries with the same fire time apart and in order.
    sequence: u64,
}

impl EntryKey {
    const fn new(when: i64, sequence: u64) -> Self {
        Self { when, sequence }
    }

    /// The fire time this entry was inserted with.
    #[must_use]
    pub const fn when(&self) -> i64 {
        self.when
    }
}

/// Pending values kept in ascending order of their fire time.
///
/// Insert, peek-minimum, extract-minimum and removal by [`EntryKey`] are all `O(log n)`.
/// Values that share a fire time are extracted in the order they were inserted.
///
/// # Examples
///
/// ```
/// use timerloop::OrderedQueue;
///
/// let mut queue = OrderedQueue::new();
/// queue.insert(20, "late");
/// let key = queue.insert(10, "early");
/// queue.insert(10, "early too");
///
/// assert_eq!(queue.peek_min(), Some((key, &"early")));
/// assert_eq!(queue.extract_min().map(|(_, v)| v), Some("early"));
/// assert_eq!(queue.extract_min().map(|(_, v)| v), Some("early too"));
/// assert_eq!(queue.extract_min().map(|(_, v)| v), Some("late"));
/// assert!(queue.extract_min().is_none());
/// ```
#[derive(Debug)]
pub struct OrderedQueue<V> {
    entries: BTreeMap<EntryKey, V>,
    next_sequence: u64,
}

impl<V> Default for OrderedQueue<V> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_sequence: 0,
        }
    }
}

impl<V> OrderedQueue<V> {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of entries in the queue.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the queue holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Inserts a value that becomes due at `when`.
    ///
    /// Returns the key of the new entry, which can later be passed to [`OrderedQueue::remove`].
    pub fn insert(&mut self, when: i64, value: V) -> EntryKey {
        let key = EntryKey::new(when, self.next_sequence);
        self.next_sequence = self.next_sequence.wrapping_add(1);
        self.entries.insert(key, value);

        key
    }

    /// Returns the entry with the smallest fire time without removing it.
    #[must_use]
    pub fn peek_min(&self) -> Option<(EntryKey, &V)> {
        self.entries.first_key_value().map(|(key, value)| (*key, value))
    }

    /// Returns the entry with the largest fire time without removing it.
    #[must_use]
    pub fn last(&self) -> Option<(EntryKey, &V)> {
        self.entries.last_key_value().map(|(key, value)| (*key, value))
    }

    /// Removes and returns the entry with the smallest fire time.
    pub fn extract_min(&mut self) -> Option<(EntryKey, V)> {
        self.entries.pop_first()
    }

    /// Removes the entry with the given key.
    ///
    /// Returns `None` if the entry is not in the queue.
    pub fn remove(&mut self, key: EntryKey) -> Option<V> {
        self.entries.remove(&key)
    }

    /// Removes and returns, in order, every entry whose fire time is at or before `now`.
    pub fn extract_due(&mut self, now: i64) -> Vec<(EntryKey, V)> {
        match self.entries.first_key_value() {
            Some((first, _)) if first.when <= now => {}
            _ => return Vec::new(),
        }

        // `split_off` keeps keys at or above the split point, so splitting at the first key
        // past `now` leaves exactly the due entries behind.
        let ready = match now.checked_add(1) {
            Some(after_now) => {
                let pending = self.entries.split_off(&EntryKey::new(after_now, 0));
                mem::replace(&mut self.entries, pending)
            }
            None => mem::take(&mut self.entries),
        };

        ready.into_iter().collect()
    }

    /// Removes every entry, returning them in ascending order.
    pub fn drain(&mut self) -> Vec<(EntryKey, V)> {
        mem::take(&mut self.entries).into_iter().collect()
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assert_types() {
        static_assertions::assert_impl_all!(OrderedQueue<u32>: Send, Sync);
        static_assertions::assert_impl_all!(EntryKey: Send, Sync, Copy);
    }

    #[test]
    fn empty_queue() {
        let mut queue = OrderedQueue::<u32>::new();

        assert!(queue.is_empty());
        assert!(queue.peek_min().is_none());
        assert!(queue.extract_min().is_none());
        assert!(queue.extract_due(i64::MAX).is_empty());
    }

    #[test]
    fn extract_min_is_non_decreasing() {
        let mut queue = OrderedQueue::new();
        let mut rng = fastrand::Rng::with_seed(7);

        for i in 0..500 {
            queue.insert(rng.i64(0..50), i);
        }

        let mut previous = i64::MIN;
        while let Some((key, _)) = queue.extract_min() {
            assert!(key.when() >= previous);
            previous = key.when();
        }
    }

    #[test]
    fn equal_keys_preserve_insertion_order() {
        let mut queue = OrderedQueue::new();
        let mut rng = fastrand::Rng::with_seed(11);
        let mut inserted = Vec::new();

        for i in 0..300 {
            let when = rng.i64(0..5);
            queue.insert(when, i);
            inserted.push((when, i));
        }

        // A stable sort by fire time is exactly the order the queue must produce.
        inserted.sort_by_key(|(when, _)| *when);
        let extracted: Vec<_> = std::iter::from_fn(|| queue.extract_min().map(|(key, v)| (key.when(), v))).collect();

        assert_eq!(extracted, inserted);
    }

    #[test]
    fn peek_does_not_remove() {
        let mut queue = OrderedQueue::new();
        let key = queue.insert(3, 'a');

        assert_eq!(queue.peek_min(), Some((key, &'a')));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn remove_specific_entry() {
        let mut queue = OrderedQueue::new();
        let first = queue.insert(5, "first");
        let second = queue.insert(5, "second");

        assert_eq!(queue.remove(first), Some("first"));
        assert_eq!(queue.remove(first), None);
        assert_eq!(queue.peek_min(), Some((second, &"second")));
    }

    #[test]
    fn extract_due_includes_now() {
        let mut queue = OrderedQueue::new();
        queue.insert(10, 'a');
        queue.insert(10, 'b');
        queue.insert(11, 'c');
        queue.insert(9, 'd');

        let due: Vec<_> = queue.extract_due(10).into_iter().map(|(_, v)| v).collect();

        assert_eq!(due, vec!['d', 'a', 'b']);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.peek_min().map(|(key, _)| key.when()), Some(11));
    }

    #[test]
    fn extract_due_at_max_takes_everything() {
        let mut queue = OrderedQueue::new();
        queue.insert(i64::MAX, 'a');
        queue.insert(0, 'b');

        assert_eq!(queue.extract_due(i64::MAX).len(), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn extract_due_nothing_ready() {
        let mut queue = OrderedQueue::new();
        queue.insert(100, 'a');

        assert!(queue.extract_due(99).is_empty());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn last_returns_farthest_entry() {
        let mut queue = OrderedQueue::new();
        queue.insert(1, 'a');
        let far = queue.insert(50, 'b');
        queue.insert(7, 'c');

        assert_eq!(queue.last(), Some((far, &'b')));
    }

    #[test]
    fn drain_empties_in_order() {
        let mut queue = OrderedQueue::new();
        queue.insert(2, 'b');
        queue.insert(1, 'a');

        let drained: Vec<_> = queue.drain().into_iter().map(|(_, v)| v).collect();

        assert_eq!(drained, vec!['a', 'b']);
        assert!(queue.is_empty());
        assert!(queue.peek_min().is_none());
    }
}
