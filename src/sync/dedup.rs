//! Bounded set of processed command ids

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use crate::protocol::CommandId;

/// Remembers which commands were already applied.
///
/// Ids are evicted oldest-first once the set grows past `capacity`, but an id
/// is never evicted before it is `min_age` old. Under a burst faster than
/// `capacity / min_age` the set temporarily exceeds `capacity` rather than
/// forget an id a delayed duplicate could still hit.
#[derive(Debug)]
pub struct ProcessedIdSet {
    ids: HashSet<CommandId>,
    order: VecDeque<(CommandId, Instant)>,
    capacity: usize,
    min_age: Duration,
}

impl ProcessedIdSet {
    pub fn new(capacity: usize, min_age: Duration) -> Self {
        Self {
            ids: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            min_age,
        }
    }

    pub fn contains(&self, id: &CommandId) -> bool {
        self.ids.contains(id)
    }

    /// Remember an id; returns false if it was already present
    pub fn insert(&mut self, id: CommandId) -> bool {
        self.insert_at(id, Instant::now())
    }

    pub fn insert_at(&mut self, id: CommandId, now: Instant) -> bool {
        if !self.ids.insert(id.clone()) {
            return false;
        }
        self.order.push_back((id, now));
        self.evict(now);
        true
    }

    fn evict(&mut self, now: Instant) {
        while self.order.len() > self.capacity {
            let Some((_, inserted_at)) = self.order.front() else {
                break;
            };
            if now.saturating_duration_since(*inserted_at) < self.min_age {
                break;
            }
            if let Some((oldest, _)) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.ids.clear();
        self.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: usize) -> CommandId {
        CommandId::generate("blue", n as u64, 0)
    }

    #[test]
    fn duplicate_insert_is_refused() {
        let mut set = ProcessedIdSet::new(10, Duration::from_secs(1));
        assert!(set.insert(id(1)));
        assert!(!set.insert(id(1)));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn size_stays_bounded_when_old_ids_are_evictable() {
        let window = Duration::from_secs(60);
        let mut set = ProcessedIdSet::new(100, window);
        let start = Instant::now();

        // one id per second for far longer than the window
        for n in 0..1_000 {
            let now = start + Duration::from_secs(n as u64);
            set.insert_at(id(n), now);
            assert!(set.len() <= 100);
        }

        // everything younger than the window survived
        for n in (1_000 - 60)..1_000 {
            assert!(set.contains(&id(n)), "id {} was evicted too early", n);
        }
        assert!(!set.contains(&id(0)));
    }

    #[test]
    fn young_ids_survive_a_burst_past_capacity() {
        let mut set = ProcessedIdSet::new(10, Duration::from_secs(60));
        let now = Instant::now();
        for n in 0..25 {
            set.insert_at(id(n), now);
        }
        assert_eq!(set.len(), 25);
        assert!(set.contains(&id(0)));

        // once they age out, the set shrinks back to capacity
        set.insert_at(id(99), now + Duration::from_secs(61));
        assert_eq!(set.len(), 10);
        assert!(set.contains(&id(99)));
        assert!(!set.contains(&id(0)));
    }
}
