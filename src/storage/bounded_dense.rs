use std::sync::Arc;

use parking_lot::Mutex;

use crate::row::ClientRow;
use crate::row::RowAccessor;

/// Row cache holding every row id in `0..capacity` without eviction.
#[derive(Debug)]
pub struct BoundedDenseProcessStorage {
    rows: Vec<Mutex<Option<Arc<ClientRow>>>>,
}

impl BoundedDenseProcessStorage {
    pub fn new(capacity: usize) -> Self {
        Self {
            rows: (0..capacity).map(|_| Mutex::new(None)).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.rows.len()
    }

    fn slot(&self, row_id: i32) -> &Mutex<Option<Arc<ClientRow>>> {
        match usize::try_from(row_id).ok().and_then(|idx| self.rows.get(idx)) {
            Some(slot) => slot,
            None => panic!(
                "row {} outside dense process storage of capacity {}",
                row_id,
                self.rows.len()
            ),
        }
    }

    pub fn find(&self, row_id: i32) -> Option<RowAccessor> {
        self.slot(row_id).lock().as_ref().cloned().map(RowAccessor::new)
    }

    pub fn contains(&self, row_id: i32) -> bool {
        self.slot(row_id).lock().is_some()
    }

    pub fn insert(&self, row_id: i32, row: ClientRow) -> bool {
        self.insert_and_access(row_id, row).0
    }

    pub fn insert_and_access(&self, row_id: i32, row: ClientRow) -> (bool, RowAccessor) {
        let mut slot = self.slot(row_id).lock();
        match slot.as_ref() {
            Some(existing) => {
                existing.swap_in(row);
                (false, RowAccessor::new(existing.clone()))
            }
            None => {
                let row = Arc::new(row);
                *slot = Some(row.clone());
                (true, RowAccessor::new(row))
            }
        }
    }

    pub fn len(&self) -> usize {
        self.rows.iter().filter(|slot| slot.lock().is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_models::RowType;
    use crate::row::Row;

    #[test]
    fn rows_live_at_their_index() {
        let storage = BoundedDenseProcessStorage::new(4);
        assert!(!storage.contains(2));
        assert!(storage.insert(2, ClientRow::new(0, Row::new(RowType::Dense, 1))));
        assert!(!storage.insert(2, ClientRow::new(3, Row::new(RowType::Dense, 1))));
        assert_eq!(3, storage.find(2).unwrap().clock());
        assert_eq!(1, storage.len());
    }

    #[test]
    #[should_panic(expected = "outside dense process storage")]
    fn out_of_range_row_is_fatal() {
        BoundedDenseProcessStorage::new(4).contains(4);
    }
}
