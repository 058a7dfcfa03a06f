use std::sync::atomic::AtomicI32;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::RwLock;
use parking_lot::RwLockReadGuard;
use parking_lot::RwLockWriteGuard;

use super::Row;

/// A cached row together with the clock it is fresh up to and the number of
/// live accessors. Rows with live accessors are never evicted.
#[derive(Debug)]
pub struct ClientRow {
    clock: AtomicI32,
    data: RwLock<Row>,
    ref_count: AtomicUsize,
}

impl ClientRow {
    pub fn new(clock: i32, data: Row) -> Self {
        Self {
            clock: AtomicI32::new(clock),
            data: RwLock::new(data),
            ref_count: AtomicUsize::new(0),
        }
    }

    pub fn clock(&self) -> i32 {
        self.clock.load(Ordering::Acquire)
    }

    pub fn set_clock(&self, clock: i32) {
        self.clock.store(clock, Ordering::Release);
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Row> {
        self.data.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Row> {
        self.data.write()
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Replace clock and contents with those of `other`. Accessors already
    /// handed out observe the new contents.
    pub fn swap_in(&self, other: ClientRow) {
        let ClientRow { clock, data, .. } = other;
        *self.data.write() = data.into_inner();
        self.set_clock(clock.into_inner());
    }
}

/// Shared handle on a cached row. Creating one bumps the row's reference
/// count, dropping it releases the reference.
#[derive(Debug)]
pub struct RowAccessor {
    row: Arc<ClientRow>,
}

impl RowAccessor {
    pub fn new(row: Arc<ClientRow>) -> Self {
        row.ref_count.fetch_add(1, Ordering::AcqRel);
        Self { row }
    }

    pub fn clock(&self) -> i32 {
        self.row.clock()
    }

    pub fn get(&self, col: i32) -> f32 {
        self.row.read().get(col)
    }

    pub fn to_dense(&self) -> Vec<f32> {
        self.row.read().to_dense()
    }

    pub fn copy_to_vec(&self) -> Vec<(i32, f32)> {
        self.row.read().copy_to_vec()
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Row> {
        self.row.read()
    }

    pub fn client_row(&self) -> &Arc<ClientRow> {
        &self.row
    }
}

impl Clone for RowAccessor {
    fn clone(&self) -> Self {
        Self::new(self.row.clone())
    }
}

impl Drop for RowAccessor {
    fn drop(&mut self) {
        self.row.ref_count.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_models::RowType;

    #[test]
    fn accessors_track_reference_count() {
        let row = Arc::new(ClientRow::new(3, Row::new(RowType::Dense, 4)));
        assert_eq!(0, row.ref_count());
        let first = RowAccessor::new(row.clone());
        let second = first.clone();
        assert_eq!(2, row.ref_count());
        drop(first);
        assert_eq!(1, row.ref_count());
        drop(second);
        assert_eq!(0, row.ref_count());
    }

    #[test]
    fn swap_in_is_visible_through_existing_accessor() {
        let row = Arc::new(ClientRow::new(1, Row::new(RowType::Dense, 4)));
        let accessor = RowAccessor::new(row.clone());

        let mut fresh = Row::new(RowType::Dense, 4);
        fresh.inc(2, 7.0);
        row.swap_in(ClientRow::new(5, fresh));

        assert_eq!(5, accessor.clock());
        assert_eq!(7.0, accessor.get(2));
        assert_eq!(1, row.ref_count());
    }
}
