use super::replacer::{AccessType, Replacer};
use crate::typedef::FrameId;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Represents a node in the LRU-K replacer, maintaining access history and
/// evictability status.
#[derive(Debug)]
struct LrukNode {
    is_evictable: bool,
    history: VecDeque<u64>, // Stores the last K access timestamps, oldest first
}

impl LrukNode {
    /// Creates a node with its first access recorded. Not evictable by default.
    fn new(first_timestamp: u64, k: usize) -> Self {
        let mut history = VecDeque::with_capacity(k);
        history.push_back(first_timestamp);
        Self {
            is_evictable: false,
            history,
        }
    }

    /// Gets the earliest remembered timestamp.
    fn earliest_timestamp(&self) -> u64 {
        *self.history.front().unwrap()
    }

    /// Calculates the backward K-distance of this node at `current_timestamp`.
    /// `None` stands for +infinity (fewer than k recorded accesses).
    fn backward_k_distance(&self, current_timestamp: u64, k: usize) -> Option<u64> {
        if self.history.len() < k {
            return None;
        }
        // With exactly k timestamps retained, the front is the k-th most recent.
        Some(current_timestamp - self.earliest_timestamp())
    }

    /// Inserts a new access timestamp, maintaining the last K timestamps.
    fn insert_history_timestamp(&mut self, current_timestamp: u64, k: usize) {
        assert!(self.history.is_empty() || current_timestamp > *self.history.back().unwrap());
        self.history.push_back(current_timestamp);
        if self.history.len() > k {
            self.history.pop_front();
        }
    }
}

#[derive(Debug)]
struct LrukReplacerInner {
    node_store: HashMap<FrameId, LrukNode>,
    evictable_size: usize, // Number of evictable nodes
    current_timestamp: u64,
}

/// Implements the LRU-K replacement policy.
///
/// A single mutex protects the node map, the timestamp counter, and the
/// evictable counter; timestamps are monotonic within one replacer instance.
#[derive(Debug)]
pub struct LrukReplacer {
    inner: Mutex<LrukReplacerInner>,
    capacity: usize, // Number of frames the replacer may track
    k: usize,        // Number of accesses to track per frame
}

impl LrukReplacer {
    /// Creates a new LRU-K replacer instance.
    pub fn new(capacity: usize, k: usize) -> Self {
        assert!(k > 0, "LRU-K requires k > 0");
        LrukReplacer {
            inner: Mutex::new(LrukReplacerInner {
                node_store: HashMap::new(),
                evictable_size: 0,
                current_timestamp: 0,
            }),
            capacity,
            k,
        }
    }
}

impl Replacer for LrukReplacer {
    /// Records access to a frame and updates its history.
    fn record_access(&self, frame_id: FrameId, _access_type: AccessType) {
        assert!(
            frame_id < self.capacity,
            "Frame id {} is out of range (capacity {})",
            frame_id,
            self.capacity
        );

        let mut inner = self.inner.lock().unwrap();
        inner.current_timestamp += 1;
        let now = inner.current_timestamp;

        inner
            .node_store
            .entry(frame_id)
            .and_modify(|node| node.insert_history_timestamp(now, self.k))
            .or_insert_with(|| LrukNode::new(now, self.k));
    }

    /// Toggles the evictable flag of a tracked frame.
    fn set_evictable(&self, frame_id: FrameId, evictable: bool) {
        let mut inner = self.inner.lock().unwrap();
        // Release the guard before panicking so the mutex is not poisoned.
        if !inner.node_store.contains_key(&frame_id) {
            drop(inner);
            panic!("Frame id {} is not tracked by the replacer", frame_id);
        }

        let node = inner.node_store.get_mut(&frame_id).unwrap();
        if node.is_evictable != evictable {
            node.is_evictable = evictable;
            if evictable {
                inner.evictable_size += 1;
            } else {
                inner.evictable_size -= 1;
            }
        }
    }

    /// Evicts the evictable frame with the largest backward k-distance.
    ///
    /// Frames with fewer than k recorded accesses have an infinite distance;
    /// ties among those are broken towards the earliest remembered access.
    fn evict(&self) -> Option<FrameId> {
        let mut inner = self.inner.lock().unwrap();
        let now = inner.current_timestamp;

        let mut victim: Option<(FrameId, Option<u64>, u64)> = None;
        for (&frame_id, node) in &inner.node_store {
            if !node.is_evictable {
                continue;
            }
            let k_distance = node.backward_k_distance(now, self.k);
            let earliest = node.earliest_timestamp();
            let better = match victim {
                None => true,
                Some((_, best_distance, best_earliest)) => {
                    match (k_distance, best_distance) {
                        (None, Some(_)) => true,
                        (Some(_), None) => false,
                        (None, None) => earliest < best_earliest,
                        (Some(d), Some(best)) => {
                            d > best || (d == best && earliest < best_earliest)
                        }
                    }
                }
            };
            if better {
                victim = Some((frame_id, k_distance, earliest));
            }
        }

        let (frame_id, _, _) = victim?;
        inner.node_store.remove(&frame_id);
        inner.evictable_size -= 1;
        Some(frame_id)
    }

    /// Stops tracking a frame. The frame must be evictable if tracked.
    fn remove(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock().unwrap();
        let evictable = match inner.node_store.get(&frame_id) {
            None => return,
            Some(node) => node.is_evictable,
        };
        // Release the guard before panicking so the mutex is not poisoned.
        if !evictable {
            drop(inner);
            panic!(
                "Frame id {} is not evictable and cannot be removed",
                frame_id
            );
        }
        inner.node_store.remove(&frame_id);
        inner.evictable_size -= 1;
    }

    /// Returns the number of evictable frames.
    fn size(&self) -> usize {
        self.inner.lock().unwrap().evictable_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loamdb_error::assert_errors;

    fn record(replacer: &LrukReplacer, frame_id: FrameId) {
        replacer.record_access(frame_id, AccessType::Unknown);
    }

    #[test]
    fn test_lruk_replacer_basic() {
        let lru_replacer = LrukReplacer::new(8, 2);

        // Add six frames to the replacer. Frame 6 stays non-evictable.
        record(&lru_replacer, 1);
        record(&lru_replacer, 2);
        record(&lru_replacer, 3);
        record(&lru_replacer, 4);
        record(&lru_replacer, 5);
        record(&lru_replacer, 6);
        lru_replacer.set_evictable(1, true);
        lru_replacer.set_evictable(2, true);
        lru_replacer.set_evictable(3, true);
        lru_replacer.set_evictable(4, true);
        lru_replacer.set_evictable(5, true);
        lru_replacer.set_evictable(6, false);

        // The size of the replacer is the number of evictable frames
        assert_eq!(5, lru_replacer.size());

        // Record an access for frame 1
        record(&lru_replacer, 1);

        // All evictable frames have infinite distance; evict in order of the
        // oldest remembered access. Frame 1 keeps its original first access.
        assert_eq!(Some(2), lru_replacer.evict());
        assert_eq!(Some(3), lru_replacer.evict());
        assert_eq!(Some(4), lru_replacer.evict());
        assert_eq!(2, lru_replacer.size());

        // Insert new frames [3, 4] and update history
        record(&lru_replacer, 3);
        record(&lru_replacer, 4);
        record(&lru_replacer, 5);
        record(&lru_replacer, 4);
        lru_replacer.set_evictable(3, true);
        lru_replacer.set_evictable(4, true);
        assert_eq!(4, lru_replacer.size());

        // Expect frame 3 to be evicted next
        assert_eq!(Some(3), lru_replacer.evict());
        assert_eq!(3, lru_replacer.size());

        // Set frame 6 to be evictable and evict it
        lru_replacer.set_evictable(6, true);
        assert_eq!(4, lru_replacer.size());
        assert_eq!(Some(6), lru_replacer.evict());
        assert_eq!(3, lru_replacer.size());

        // Mark frame 1 as non-evictable
        lru_replacer.set_evictable(1, false);
        assert_eq!(2, lru_replacer.size());

        // Expect frame 5 to be evicted next
        assert_eq!(Some(5), lru_replacer.evict());
        assert_eq!(1, lru_replacer.size());

        // Update history for frame 1 and make it evictable
        record(&lru_replacer, 1);
        record(&lru_replacer, 1);
        lru_replacer.set_evictable(1, true);
        assert_eq!(2, lru_replacer.size());

        // Evict the last two frames
        assert_eq!(Some(4), lru_replacer.evict());
        assert_eq!(1, lru_replacer.size());
        assert_eq!(Some(1), lru_replacer.evict());
        assert_eq!(0, lru_replacer.size());

        // Insert frame 1 again and mark it as non-evictable
        record(&lru_replacer, 1);
        lru_replacer.set_evictable(1, false);
        assert_eq!(0, lru_replacer.size());

        // A failed eviction should not change the size of the replacer
        assert_eq!(None, lru_replacer.evict());

        // Mark frame 1 as evictable again and evict it
        lru_replacer.set_evictable(1, true);
        assert_eq!(1, lru_replacer.size());
        assert_eq!(Some(1), lru_replacer.evict());
        assert_eq!(0, lru_replacer.size());

        // Ensure that eviction on an empty replacer does nothing strange
        assert_eq!(None, lru_replacer.evict());
        assert_eq!(0, lru_replacer.size());
    }

    #[test]
    fn test_lruk_replacer_evict() {
        {
            // Empty and try removing
            let lru_replacer = LrukReplacer::new(16, 2);
            assert_eq!(None, lru_replacer.evict());
        }

        {
            // Can only evict an element if evictable=true
            let lru_replacer = LrukReplacer::new(16, 2);
            record(&lru_replacer, 2);
            lru_replacer.set_evictable(2, false);
            assert_eq!(None, lru_replacer.evict());
            lru_replacer.set_evictable(2, true);
            assert_eq!(Some(2), lru_replacer.evict());
        }

        {
            // Elements with less than k history have max backward k-distance
            // and get evicted first
            let lru_replacer = LrukReplacer::new(16, 3);
            record(&lru_replacer, 1);
            record(&lru_replacer, 1);
            record(&lru_replacer, 2);
            record(&lru_replacer, 1);
            lru_replacer.set_evictable(2, true);
            lru_replacer.set_evictable(1, true);

            assert_eq!(Some(2), lru_replacer.evict());
            assert_eq!(Some(1), lru_replacer.evict());
        }

        {
            // Select the element with the largest backward k-distance to evict
            let lru_replacer = LrukReplacer::new(16, 3);
            record(&lru_replacer, 1);
            record(&lru_replacer, 2);
            record(&lru_replacer, 3);
            record(&lru_replacer, 3);
            record(&lru_replacer, 3);
            record(&lru_replacer, 2);
            record(&lru_replacer, 2);
            record(&lru_replacer, 1);
            record(&lru_replacer, 1);
            record(&lru_replacer, 3);
            record(&lru_replacer, 2);
            record(&lru_replacer, 1);
            lru_replacer.set_evictable(2, true);
            lru_replacer.set_evictable(1, true);
            lru_replacer.set_evictable(3, true);

            assert_eq!(Some(3), lru_replacer.evict());
            assert_eq!(Some(2), lru_replacer.evict());
            assert_eq!(Some(1), lru_replacer.evict());
        }

        {
            let lru_replacer = LrukReplacer::new(16, 3);
            record(&lru_replacer, 2);
            record(&lru_replacer, 2);
            record(&lru_replacer, 2);
            record(&lru_replacer, 1);
            record(&lru_replacer, 1);
            lru_replacer.set_evictable(2, true);
            lru_replacer.set_evictable(1, true);

            assert_eq!(Some(1), lru_replacer.evict());

            record(&lru_replacer, 1);
            lru_replacer.set_evictable(1, true);

            assert_eq!(Some(1), lru_replacer.evict());
        }

        {
            let lru_replacer = LrukReplacer::new(16, 3);
            record(&lru_replacer, 1);
            record(&lru_replacer, 2);
            record(&lru_replacer, 3);
            record(&lru_replacer, 4);
            record(&lru_replacer, 1);
            record(&lru_replacer, 2);
            record(&lru_replacer, 3);
            record(&lru_replacer, 1);
            record(&lru_replacer, 2);
            lru_replacer.set_evictable(1, true);
            lru_replacer.set_evictable(2, true);
            lru_replacer.set_evictable(3, true);
            lru_replacer.set_evictable(4, true);

            assert_eq!(Some(3), lru_replacer.evict());
            record(&lru_replacer, 4);
            record(&lru_replacer, 4);

            assert_eq!(Some(1), lru_replacer.evict());
            assert_eq!(Some(2), lru_replacer.evict());
            assert_eq!(Some(4), lru_replacer.evict());
        }

        {
            let lru_replacer = LrukReplacer::new(1010, 3);
            for j in 0..4 {
                for i in (j * 250)..1000 {
                    record(&lru_replacer, i);
                    lru_replacer.set_evictable(i, true);
                }
            }
            assert_eq!(1000, lru_replacer.size());

            for i in 250..500 {
                lru_replacer.set_evictable(i, false);
            }
            assert_eq!(750, lru_replacer.size());

            for i in 0..100 {
                lru_replacer.remove(i);
            }
            assert_eq!(650, lru_replacer.size());

            for i in 100..600 {
                if !(250..500).contains(&i) {
                    assert_eq!(Some(i), lru_replacer.evict());
                }
            }
            assert_eq!(400, lru_replacer.size());

            for i in 250..500 {
                lru_replacer.set_evictable(i, true);
            }
            assert_eq!(650, lru_replacer.size());

            for i in 600..750 {
                record(&lru_replacer, i);
                record(&lru_replacer, i);
            }
            assert_eq!(650, lru_replacer.size());

            for i in 250..500 {
                assert_eq!(Some(i), lru_replacer.evict());
            }
            assert_eq!(400, lru_replacer.size());

            for i in 750..1000 {
                assert_eq!(Some(i), lru_replacer.evict());
            }
            assert_eq!(150, lru_replacer.size());

            for i in 600..750 {
                assert_eq!(Some(i), lru_replacer.evict());
            }
            assert_eq!(0, lru_replacer.size());
        }
    }

    // The infinite-distance tie-break: frames below k accesses leave in order
    // of their oldest remembered access, then finite distances take over.
    #[test]
    fn test_lruk_replacer_infinity_tie_break() {
        let lru_replacer = LrukReplacer::new(7, 2);

        for frame_id in [1, 2, 3, 4, 1, 2, 3, 4, 5, 6] {
            record(&lru_replacer, frame_id);
        }
        for frame_id in 1..=6 {
            lru_replacer.set_evictable(frame_id, true);
        }

        assert_eq!(Some(5), lru_replacer.evict());
        assert_eq!(Some(6), lru_replacer.evict());
        assert_eq!(Some(1), lru_replacer.evict());
        assert_eq!(Some(2), lru_replacer.evict());
        assert_eq!(Some(3), lru_replacer.evict());
        assert_eq!(Some(4), lru_replacer.evict());
        assert_eq!(None, lru_replacer.evict());
    }

    #[test]
    fn test_lruk_replacer_programmer_errors() {
        let lru_replacer = LrukReplacer::new(4, 2);

        // Out-of-range frame ids are rejected outright.
        assert_errors!(record(&lru_replacer, 4));

        // Toggling evictability of an untracked frame is a programmer error.
        assert_errors!(lru_replacer.set_evictable(0, true));

        // Removing a tracked, non-evictable frame is a programmer error;
        // removing an unknown frame is a no-op.
        record(&lru_replacer, 0);
        assert_errors!(lru_replacer.remove(0));
        lru_replacer.remove(3);

        lru_replacer.set_evictable(0, true);
        lru_replacer.remove(0);
        assert_eq!(0, lru_replacer.size());
    }

    #[test]
    fn test_lruk_replacer_set_evictable_idempotent() {
        let lru_replacer = LrukReplacer::new(4, 2);
        record(&lru_replacer, 1);

        lru_replacer.set_evictable(1, true);
        lru_replacer.set_evictable(1, true);
        assert_eq!(1, lru_replacer.size());

        lru_replacer.set_evictable(1, false);
        lru_replacer.set_evictable(1, false);
        assert_eq!(0, lru_replacer.size());
    }
}
