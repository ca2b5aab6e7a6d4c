use std::collections::{BTreeMap, HashMap};

use crate::TimerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerEvent<T> {
    pub id: TimerId,
    pub deadline_ns: u64,
    pub payload: T,
}

/// One-shot event queue ordered by `(deadline, arrival)`.
///
/// Two events with the same deadline pop in the order they were scheduled.
#[derive(Debug)]
pub struct TimerQueue<T> {
    next_seq: u64,
    pending: BTreeMap<(u64, u64), (TimerId, T)>,
    by_id: HashMap<TimerId, (u64, u64)>,
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self {
            next_seq: 0,
            pending: BTreeMap::new(),
            by_id: HashMap::new(),
        }
    }
}

impl<T> TimerQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, deadline_ns: u64, payload: T) -> TimerId {
        let seq = self.next_seq;
        self.next_seq += 1;
        let id = TimerId(seq);
        self.pending.insert((deadline_ns, seq), (id, payload));
        self.by_id.insert(id, (deadline_ns, seq));
        id
    }

    pub fn cancel(&mut self, id: TimerId) -> Result<T, TimerError> {
        let key = self
            .by_id
            .remove(&id)
            .ok_or(TimerError::UnknownTimer(id))?;
        self.pending
            .remove(&key)
            .map(|(_, payload)| payload)
            .ok_or(TimerError::UnknownTimer(id))
    }

    pub fn contains(&self, id: TimerId) -> bool {
        self.by_id.contains_key(&id)
    }

    pub fn deadline_of(&self, id: TimerId) -> Option<u64> {
        self.by_id.get(&id).map(|&(deadline, _)| deadline)
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.pending.keys().next().map(|&(deadline, _)| deadline)
    }

    /// Removes and returns the earliest event whose deadline is `<= now_ns`.
    pub fn pop_due(&mut self, now_ns: u64) -> Option<TimerEvent<T>> {
        let entry = self.pending.first_entry()?;
        let (deadline_ns, _) = *entry.key();
        if deadline_ns > now_ns {
            return None;
        }
        let (id, payload) = entry.remove();
        self.by_id.remove(&id);
        Some(TimerEvent {
            id,
            deadline_ns,
            payload,
        })
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.by_id.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_deadline_pops_in_arrival_order() {
        let mut q = TimerQueue::new();
        q.schedule(100, 'b');
        q.schedule(50, 'a');
        q.schedule(100, 'c');

        let order: Vec<char> = std::iter::from_fn(|| q.pop_due(100).map(|e| e.payload)).collect();
        assert_eq!(order, vec!['a', 'b', 'c']);
        assert!(q.is_empty());
    }

    #[test]
    fn pop_due_respects_now() {
        let mut q = TimerQueue::new();
        q.schedule(10, ());
        assert!(q.pop_due(9).is_none());
        assert_eq!(q.next_deadline(), Some(10));
        assert_eq!(q.pop_due(10).map(|e| e.deadline_ns), Some(10));
    }

    #[test]
    fn cancel_removes_and_reports_unknown_ids() {
        let mut q = TimerQueue::new();
        let id = q.schedule(10, 7u8);
        assert!(q.contains(id));
        assert_eq!(q.cancel(id), Ok(7));
        assert!(!q.contains(id));
        assert_eq!(q.cancel(id), Err(TimerError::UnknownTimer(id)));
        assert!(q.pop_due(u64::MAX).is_none());
    }
}
