use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::error;
use tracing::trace;

use super::clock_lru::ClockLru;
use super::clock_lru::MAX_NUM_ROUNDS;
use crate::row::ClientRow;
use crate::row::RowAccessor;
use crate::util_types::striped_map::StripedMap;

#[derive(Debug)]
struct StorageEntry {
    row: Arc<ClientRow>,
    slot: usize,
}

/// Row cache bounded by `capacity`, with CLOCK eviction of unreferenced rows.
///
/// Precondition: `capacity` exceeds the number of rows referenced at the same
/// time plus the number of concurrently inserting threads. A violation is
/// fatal.
#[derive(Debug)]
pub struct BoundedSparseProcessStorage {
    capacity: usize,
    num_rows: AtomicUsize,
    rows: StripedMap<StorageEntry>,
    clock_lru: ClockLru,

    /// One eviction at a time.
    evict_lock: Mutex<()>,
}

impl BoundedSparseProcessStorage {
    pub fn new(capacity: usize, lock_pool_size: usize) -> Self {
        Self {
            capacity,
            num_rows: AtomicUsize::new(0),
            rows: StripedMap::new(lock_pool_size),
            clock_lru: ClockLru::new(capacity),
            evict_lock: Mutex::new(()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn find(&self, row_id: i32) -> Option<RowAccessor> {
        let stripe = self.rows.lock(row_id);
        let entry = stripe.get(&row_id)?;
        self.clock_lru.reference(entry.slot);
        Some(RowAccessor::new(entry.row.clone()))
    }

    pub fn contains(&self, row_id: i32) -> bool {
        self.rows.lock(row_id).contains_key(&row_id)
    }

    /// Store `row` under `row_id`. If the id is already cached its contents
    /// and clock are replaced in place and false is returned.
    pub fn insert(&self, row_id: i32, row: ClientRow) -> bool {
        self.insert_and_access(row_id, row).0
    }

    /// Like [`Self::insert`], also returning an accessor on the stored row.
    pub fn insert_and_access(&self, row_id: i32, row: ClientRow) -> (bool, RowAccessor) {
        if let Some(accessor) = self.find_and_update(row_id, &row) {
            return (false, accessor);
        }

        let prev = self.num_rows.fetch_add(1, Ordering::AcqRel);
        if prev + 1 > self.capacity {
            self.num_rows.fetch_sub(1, Ordering::AcqRel);
            self.evict_one_row();
        }

        let mut stripe = self.rows.lock(row_id);
        if let Some(entry) = stripe.get(&row_id) {
            // lost a race with another inserter; the eviction above was
            // spurious
            entry.row.swap_in(row);
            self.clock_lru.reference(entry.slot);
            let accessor = RowAccessor::new(entry.row.clone());
            drop(stripe);
            self.num_rows.fetch_sub(1, Ordering::AcqRel);
            return (false, accessor);
        }
        let slot = self.clock_lru.insert(row_id);
        let row = Arc::new(row);
        let accessor = RowAccessor::new(row.clone());
        stripe.insert(row_id, StorageEntry { row, slot });
        (true, accessor)
    }

    fn find_and_update(&self, row_id: i32, row: &ClientRow) -> Option<RowAccessor> {
        let stripe = self.rows.lock(row_id);
        let entry = stripe.get(&row_id)?;
        {
            let mut data = entry.row.write();
            *data = row.read().clone();
        }
        entry.row.set_clock(row.clock());
        self.clock_lru.reference(entry.slot);
        Some(RowAccessor::new(entry.row.clone()))
    }

    fn evict_one_row(&self) {
        let _evicting = self.evict_lock.lock();
        for _ in 0..MAX_NUM_ROUNDS * self.capacity.max(1) {
            let (slot, row_id) = self.clock_lru.find_one_to_evict();
            let mut stripe = self.rows.lock(row_id);
            let evictable = match stripe.get(&row_id) {
                Some(entry) => entry.slot == slot && entry.row.ref_count() == 0,
                None => false,
            };
            if evictable {
                stripe.remove(&row_id);
                self.clock_lru.evict(slot);
                trace!(row_id, "evicted row");
                return;
            }
            self.clock_lru.skip(slot);
        }
        error!(
            capacity = self.capacity,
            "every cached row is referenced; eviction cannot make room"
        );
        panic!(
            "process storage of capacity {} cannot evict: every candidate is referenced",
            self.capacity
        );
    }
}

#[cfg(test)]
mod tests {
    use proptest::collection;
    use proptest::prelude::*;
    use test_strategy::proptest;

    use super::*;
    use crate::config_models::RowType;
    use crate::row::Row;

    fn client_row(clock: i32, value: f32) -> ClientRow {
        let mut row = Row::new(RowType::Dense, 2);
        row.inc(0, value);
        ClientRow::new(clock, row)
    }

    #[test]
    fn insert_then_find() {
        let storage = BoundedSparseProcessStorage::new(4, 2);
        assert!(storage.insert(7, client_row(1, 3.0)));
        let accessor = storage.find(7).unwrap();
        assert_eq!(3.0, accessor.get(0));
        assert_eq!(1, accessor.clock());
        assert!(storage.contains(7));
        assert!(storage.find(8).is_none());
    }

    #[test]
    fn second_insert_replaces_in_place() {
        let storage = BoundedSparseProcessStorage::new(4, 2);
        storage.insert(1, client_row(0, 1.0));
        let held = storage.find(1).unwrap();
        assert!(!storage.insert(1, client_row(5, 9.0)));
        assert_eq!(9.0, held.get(0));
        assert_eq!(5, held.clock());
        assert_eq!(1, storage.len());
    }

    #[test]
    fn referenced_rows_survive_eviction() {
        let storage = BoundedSparseProcessStorage::new(2, 2);
        storage.insert(1, client_row(0, 1.0));
        let pinned = storage.find(1).unwrap();
        for row_id in 2..20 {
            storage.insert(row_id, client_row(0, 0.0));
            assert!(storage.len() <= 2);
            assert!(storage.contains(1));
        }
        drop(pinned);
        for row_id in 100..105 {
            storage.insert(row_id, client_row(0, 0.0));
        }
        assert!(!storage.contains(1));
    }

    #[test]
    #[should_panic(expected = "cannot evict")]
    fn all_rows_referenced_is_fatal() {
        let storage = BoundedSparseProcessStorage::new(2, 2);
        storage.insert(1, client_row(0, 0.0));
        storage.insert(2, client_row(0, 0.0));
        let _a = storage.find(1).unwrap();
        let _b = storage.find(2).unwrap();
        storage.insert(3, client_row(0, 0.0));
    }

    /// Op kinds: 0 insert, 1 find and hold, 2 release oldest held.
    #[proptest]
    fn capacity_bound_and_pinned_rows(
        #[strategy(2..8usize)] capacity: usize,
        #[strategy(collection::vec((0..3u8, 0..30i32), 1..200))] ops: Vec<(u8, i32)>,
    ) {
        let storage = BoundedSparseProcessStorage::new(capacity, 4);
        let mut held: Vec<(i32, RowAccessor)> = vec![];
        for (kind, row_id) in ops {
            match kind {
                0 => {
                    // at most capacity - 1 rows pinned while inserting
                    if held.len() < capacity - 1 {
                        storage.insert(row_id, client_row(0, row_id as f32));
                    }
                }
                1 => {
                    if held.len() < capacity - 1 {
                        if let Some(accessor) = storage.find(row_id) {
                            held.push((row_id, accessor));
                        }
                    }
                }
                _ => {
                    if !held.is_empty() {
                        held.remove(0);
                    }
                }
            }
            prop_assert!(storage.len() <= capacity);
            for (row_id, accessor) in &held {
                prop_assert!(storage.contains(*row_id));
                prop_assert_eq!(*row_id as f32, accessor.get(0));
            }
        }
    }
}
