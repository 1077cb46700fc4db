use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use tokio::time::Instant;

struct Entry<T> {
    due: Instant,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.due
            .cmp(&other.due)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

/// Items held back until a deadline. Entries with the same deadline come out
/// in insertion order.
pub struct DelayQueue<T> {
    heap: BinaryHeap<Reverse<Entry<T>>>,
    seq: u64,
}

impl<T> Default for DelayQueue<T> {
    fn default() -> Self {
        DelayQueue {
            heap: BinaryHeap::new(),
            seq: 0,
        }
    }
}

impl<T> DelayQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_at(&mut self, due: Instant, item: T) {
        self.seq += 1;
        self.heap.push(Reverse(Entry {
            due,
            seq: self.seq,
            item,
        }));
    }

    /// Earliest deadline among the queued entries.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(entry)| entry.due)
    }

    /// Removes and returns every entry due at or before `now`, earliest first.
    pub fn pop_due(&mut self, now: Instant) -> Vec<T> {
        let mut due = Vec::new();
        while self.next_deadline().is_some_and(|deadline| deadline <= now) {
            if let Some(Reverse(entry)) = self.heap.pop() {
                due.push(entry.item);
            }
        }
        due
    }

    /// Drops every entry matching `predicate`, returning how many were removed.
    pub fn cancel(&mut self, mut predicate: impl FnMut(&T) -> bool) -> usize {
        let before = self.heap.len();
        self.heap.retain(|Reverse(entry)| !predicate(&entry.item));
        before - self.heap.len()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Queued items with their deadlines, earliest first.
    pub fn pending(&self) -> Vec<(Instant, &T)> {
        let mut entries: Vec<_> = self.heap.iter().map(|Reverse(entry)| entry).collect();
        entries.sort();
        entries.into_iter().map(|entry| (entry.due, &entry.item)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn releases_only_due_entries_in_deadline_order() {
        let now = Instant::now();
        let mut queue = DelayQueue::new();
        queue.push_at(now + Duration::from_secs(3), "c");
        queue.push_at(now + Duration::from_secs(1), "a");
        queue.push_at(now + Duration::from_secs(2), "b");

        assert_eq!(queue.next_deadline(), Some(now + Duration::from_secs(1)));
        assert!(queue.pop_due(now).is_empty());
        assert_eq!(queue.pop_due(now + Duration::from_secs(2)), vec!["a", "b"]);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop_due(now + Duration::from_secs(10)), vec!["c"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn equal_deadlines_keep_insertion_order() {
        let due = Instant::now();
        let mut queue = DelayQueue::new();
        for i in 0..5 {
            queue.push_at(due, i);
        }
        assert_eq!(queue.pop_due(due), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn cancelled_entries_never_fire() {
        let now = Instant::now();
        let mut queue = DelayQueue::new();
        queue.push_at(now, 1);
        queue.push_at(now + Duration::from_secs(1), 2);
        queue.push_at(now + Duration::from_secs(2), 3);

        assert_eq!(queue.cancel(|item| item % 2 == 1), 2);
        assert_eq!(
            queue.pending(),
            vec![(now + Duration::from_secs(1), &2)]
        );
        assert_eq!(queue.pop_due(now + Duration::from_secs(5)), vec![2]);
    }
}
