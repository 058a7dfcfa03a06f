use parking_lot::Mutex;

use super::recycle::RowOpLogRecycle;
use super::row_oplog::RowOpLog;
use super::row_oplog::RowOpLogFactory;
use crate::oplog_meta::RowOpLogMeta;
use crate::util_types::striped_map::StripedMap;

const RECYCLE_CAPACITY: usize = 1024;

#[derive(Debug)]
enum PartitionStore {
    Sparse(StripedMap<RowOpLog>),
    Dense(Vec<Mutex<Option<RowOpLog>>>),
}

/// Row oplogs of the rows that map to one communication channel.
///
/// Each row oplog is only touched under its row's lock; callers work on it
/// through closures.
#[derive(Debug)]
pub struct OpLogPartition {
    store: PartitionStore,
    recycle: RowOpLogRecycle,
}

impl OpLogPartition {
    pub fn new_sparse(factory: RowOpLogFactory, lock_pool_size: usize) -> Self {
        Self {
            store: PartitionStore::Sparse(StripedMap::new(lock_pool_size)),
            recycle: RowOpLogRecycle::new(factory, RECYCLE_CAPACITY),
        }
    }

    /// Row ids must stay below `capacity`.
    pub fn new_dense(factory: RowOpLogFactory, capacity: usize) -> Self {
        Self {
            store: PartitionStore::Dense((0..capacity).map(|_| Mutex::new(None)).collect()),
            recycle: RowOpLogRecycle::new(factory, RECYCLE_CAPACITY),
        }
    }

    fn dense_slot(slots: &[Mutex<Option<RowOpLog>>], row_id: i32) -> &Mutex<Option<RowOpLog>> {
        match usize::try_from(row_id).ok().and_then(|idx| slots.get(idx)) {
            Some(slot) => slot,
            None => panic!(
                "row {} outside dense oplog of capacity {}",
                row_id,
                slots.len()
            ),
        }
    }

    /// Run `f` on the row's oplog, creating it if absent.
    pub fn with_row_oplog<R>(&self, row_id: i32, f: impl FnOnce(&mut RowOpLog) -> R) -> R {
        match &self.store {
            PartitionStore::Sparse(map) => {
                let mut stripe = map.lock(row_id);
                let oplog = stripe.entry(row_id).or_insert_with(|| self.recycle.get());
                f(oplog)
            }
            PartitionStore::Dense(slots) => {
                let mut slot = Self::dense_slot(slots, row_id).lock();
                let oplog = slot.get_or_insert_with(|| self.recycle.get());
                f(oplog)
            }
        }
    }

    /// Run `f` on the row's oplog if there is one.
    pub fn find_row_oplog<R>(&self, row_id: i32, f: impl FnOnce(&mut RowOpLog) -> R) -> Option<R> {
        self.lock_row_oplog(row_id, |oplog| oplog.map(f))
    }

    /// Run `f` under the row's lock whether or not the row has an oplog.
    pub fn lock_row_oplog<R>(
        &self,
        row_id: i32,
        f: impl FnOnce(Option<&mut RowOpLog>) -> R,
    ) -> R {
        match &self.store {
            PartitionStore::Sparse(map) => f(map.lock(row_id).get_mut(&row_id)),
            PartitionStore::Dense(slots) => f(Self::dense_slot(slots, row_id).lock().as_mut()),
        }
    }

    pub fn get_erase_oplog(&self, row_id: i32) -> Option<RowOpLog> {
        self.get_erase_oplog_if(row_id, |_| true)
    }

    /// Remove and return the row's oplog if `pred` accepts it.
    pub fn get_erase_oplog_if(
        &self,
        row_id: i32,
        pred: impl FnOnce(&RowOpLog) -> bool,
    ) -> Option<RowOpLog> {
        match &self.store {
            PartitionStore::Sparse(map) => {
                let mut stripe = map.lock(row_id);
                if pred(stripe.get(&row_id)?) {
                    stripe.remove(&row_id)
                } else {
                    None
                }
            }
            PartitionStore::Dense(slots) => {
                let mut slot = Self::dense_slot(slots, row_id).lock();
                if pred(slot.as_ref()?) {
                    slot.take()
                } else {
                    None
                }
            }
        }
    }

    /// Hand out the row's pending scheduling meta and mark it consumed, so
    /// later increments start a fresh meta.
    pub fn get_invalidate_oplog_meta(&self, row_id: i32) -> Option<RowOpLogMeta> {
        self.find_row_oplog(row_id, |oplog| {
            let meta = oplog.meta_mut()?;
            if !meta.is_valid() {
                return None;
            }
            Some(std::mem::take(meta))
        })
        .flatten()
    }

    /// Return an erased oplog to the free list.
    pub fn recycle(&self, oplog: RowOpLog) {
        self.recycle.put_back(oplog);
    }

    pub fn num_row_oplogs(&self) -> usize {
        match &self.store {
            PartitionStore::Sparse(map) => map.len(),
            PartitionStore::Dense(slots) => slots.iter().filter(|s| s.lock().is_some()).count(),
        }
    }

    /// Rows with an oplog, ascending.
    pub fn row_ids(&self) -> Vec<i32> {
        match &self.store {
            PartitionStore::Sparse(map) => map.keys(),
            PartitionStore::Dense(slots) => (0i32..)
                .zip(slots.iter())
                .filter(|(_, slot)| slot.lock().is_some())
                .map(|(row_id, _)| row_id)
                .collect(),
        }
    }
}
