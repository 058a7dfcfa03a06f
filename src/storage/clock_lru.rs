use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;
use tracing::error;

/// Sweeps over the whole list before eviction is declared impossible.
pub const MAX_NUM_ROUNDS: usize = 3;

/// Second-chance replacement over a fixed number of slots.
///
/// Each occupied slot holds a row id and an access bit. The evict hand skips
/// (and clears) slots whose bit is set; callers additionally reject
/// candidates that are still referenced and ask again.
#[derive(Debug)]
pub struct ClockLru {
    row_ids: Vec<AtomicI32>,
    accessed: Vec<AtomicBool>,
    evict_hand: AtomicUsize,

    /// Slots never used so far are `insert_hand..capacity`.
    insert_hand: AtomicUsize,
    empty_slots: Mutex<VecDeque<usize>>,
}

const EMPTY: i32 = -1;

impl ClockLru {
    pub fn new(capacity: usize) -> Self {
        Self {
            row_ids: (0..capacity).map(|_| AtomicI32::new(EMPTY)).collect(),
            accessed: (0..capacity).map(|_| AtomicBool::new(false)).collect(),
            evict_hand: AtomicUsize::new(0),
            insert_hand: AtomicUsize::new(0),
            empty_slots: Mutex::new(VecDeque::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.row_ids.len()
    }

    /// Take a free slot for `row_id`.
    ///
    /// # Panics
    /// If no slot is free; the caller must evict first.
    pub fn insert(&self, row_id: i32) -> usize {
        let slot = match self.empty_slots.lock().pop_front() {
            Some(slot) => slot,
            None => {
                let slot = self.insert_hand.fetch_add(1, Ordering::AcqRel);
                if slot >= self.capacity() {
                    error!(capacity = self.capacity(), "clock list is full");
                    panic!(
                        "clock list of capacity {} is full; evict before inserting",
                        self.capacity()
                    );
                }
                slot
            }
        };
        self.row_ids[slot].store(row_id, Ordering::Release);
        self.accessed[slot].store(true, Ordering::Release);
        slot
    }

    /// Mark `slot` recently used.
    pub fn reference(&self, slot: usize) {
        self.accessed[slot].store(true, Ordering::Relaxed);
    }

    /// Next candidate under the hand: an occupied slot whose access bit was
    /// clear. Bits passed over are cleared.
    ///
    /// Callers serialize eviction; concurrent calls are not supported.
    ///
    /// # Panics
    /// When [`MAX_NUM_ROUNDS`] sweeps find no candidate.
    pub fn find_one_to_evict(&self) -> (usize, i32) {
        let capacity = self.capacity();
        for _ in 0..MAX_NUM_ROUNDS * capacity.max(1) {
            let slot = self.evict_hand.fetch_add(1, Ordering::AcqRel) % capacity.max(1);
            let row_id = self.row_ids.get(slot).map(|r| r.load(Ordering::Acquire));
            match row_id {
                Some(EMPTY) | None => continue,
                Some(row_id) => {
                    if self.accessed[slot].swap(false, Ordering::AcqRel) {
                        continue;
                    }
                    return (slot, row_id);
                }
            }
        }
        error!(
            capacity,
            rounds = MAX_NUM_ROUNDS,
            "no evictable row; capacity must exceed concurrently referenced rows plus inserting threads"
        );
        panic!(
            "no evictable row after {} rounds over {} slots; capacity must exceed \
             concurrently referenced rows plus inserting threads",
            MAX_NUM_ROUNDS, capacity
        );
    }

    /// Free `slot` after its row left the storage.
    pub fn evict(&self, slot: usize) {
        self.row_ids[slot].store(EMPTY, Ordering::Release);
        self.accessed[slot].store(false, Ordering::Release);
        self.empty_slots.lock().push_back(slot);
    }

    /// Give the candidate another pass, used when it turned out to be busy.
    pub fn skip(&self, slot: usize) {
        self.reference(slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_chance_skips_recently_used() {
        let lru = ClockLru::new(3);
        let a = lru.insert(10);
        let _b = lru.insert(11);
        let _c = lru.insert(12);

        // first sweep clears all bits, then slot a is the first candidate
        assert_eq!((a, 10), lru.find_one_to_evict());
        lru.evict(a);

        let d = lru.insert(13);
        assert_eq!(a, d);
        assert_eq!(11, lru.find_one_to_evict().1);
    }

    #[test]
    #[should_panic(expected = "no evictable row")]
    fn empty_list_has_nothing_to_evict() {
        ClockLru::new(4).find_one_to_evict();
    }

    #[test]
    #[should_panic(expected = "is full")]
    fn insert_beyond_capacity_panics() {
        let lru = ClockLru::new(1);
        lru.insert(1);
        lru.insert(2);
    }
}
