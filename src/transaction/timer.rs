use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        RwLock,
    },
    time::{Duration, Instant},
};

/// Ordered deadline queue for transaction timers.
///
/// Entries are keyed by `(deadline, id)` so equal deadlines stay distinct
/// and drain in schedule order; a secondary id index makes cancellation
/// cheap. Cancellation is idempotent: cancelling an already-fired or
/// already-cancelled id is a no-op, which makes late cancels after a
/// transaction terminated safe.
pub struct TimerQueue<T> {
    entries: RwLock<BTreeMap<(Instant, u64), T>>,
    index: RwLock<HashMap<u64, Instant>>,
    next_id: AtomicU64,
}

impl<T> TimerQueue<T> {
    pub fn new() -> Self {
        TimerQueue {
            entries: RwLock::new(BTreeMap::new()),
            index: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn schedule(&self, delay: Duration, value: T) -> u64 {
        self.schedule_at(Instant::now() + delay, value)
    }

    pub fn schedule_at(&self, deadline: Instant, value: T) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.write().unwrap().insert((deadline, id), value);
        self.index.write().unwrap().insert(id, deadline);
        id
    }

    pub fn cancel(&self, id: u64) -> Option<T> {
        let deadline = self.index.write().unwrap().remove(&id)?;
        self.entries.write().unwrap().remove(&(deadline, id))
    }

    /// Earliest pending deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries
            .read()
            .unwrap()
            .keys()
            .next()
            .map(|(deadline, _)| *deadline)
    }

    /// Removes and returns every entry due at or before `now`.
    pub fn drain_expired(&self, now: Instant) -> Vec<T> {
        let expired: Vec<(Instant, u64)> = {
            let entries = self.entries.read().unwrap();
            entries
                .range(..=(now, u64::MAX))
                .map(|(key, _)| *key)
                .collect()
        };
        if expired.is_empty() {
            return Vec::new();
        }
        let mut fired = Vec::with_capacity(expired.len());
        let mut entries = self.entries.write().unwrap();
        let mut index = self.index.write().unwrap();
        for key in expired {
            if let Some(value) = entries.remove(&key) {
                index.remove(&key.1);
                fired.push(value);
            }
        }
        fired
    }
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
