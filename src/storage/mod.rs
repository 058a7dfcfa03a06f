//! Process-wide row cache shared by all application threads of a client.

pub mod bounded_dense;
pub mod bounded_sparse;
pub mod clock_lru;

pub use bounded_dense::BoundedDenseProcessStorage;
pub use bounded_sparse::BoundedSparseProcessStorage;

use crate::config_models::ClientTableConfig;
use crate::config_models::ProcessStorageType;
use crate::row::ClientRow;
use crate::row::RowAccessor;

#[derive(Debug)]
pub enum ProcessStorage {
    BoundedSparse(BoundedSparseProcessStorage),
    BoundedDense(BoundedDenseProcessStorage),
}

impl ProcessStorage {
    pub fn new(config: &ClientTableConfig, lock_pool_size: usize) -> Self {
        match config.process_storage_type {
            ProcessStorageType::BoundedSparse => ProcessStorage::BoundedSparse(
                BoundedSparseProcessStorage::new(config.process_cache_capacity, lock_pool_size),
            ),
            ProcessStorageType::BoundedDense => ProcessStorage::BoundedDense(
                BoundedDenseProcessStorage::new(config.process_cache_capacity),
            ),
        }
    }

    /// Accessor on the cached row; bumps its reference count.
    pub fn find(&self, row_id: i32) -> Option<RowAccessor> {
        match self {
            ProcessStorage::BoundedSparse(s) => s.find(row_id),
            ProcessStorage::BoundedDense(s) => s.find(row_id),
        }
    }

    /// Existence check without taking a reference.
    pub fn contains(&self, row_id: i32) -> bool {
        match self {
            ProcessStorage::BoundedSparse(s) => s.contains(row_id),
            ProcessStorage::BoundedDense(s) => s.contains(row_id),
        }
    }

    /// False if `row_id` was cached already; its contents are then replaced.
    pub fn insert(&self, row_id: i32, row: ClientRow) -> bool {
        match self {
            ProcessStorage::BoundedSparse(s) => s.insert(row_id, row),
            ProcessStorage::BoundedDense(s) => s.insert(row_id, row),
        }
    }

    pub fn insert_and_access(&self, row_id: i32, row: ClientRow) -> (bool, RowAccessor) {
        match self {
            ProcessStorage::BoundedSparse(s) => s.insert_and_access(row_id, row),
            ProcessStorage::BoundedDense(s) => s.insert_and_access(row_id, row),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ProcessStorage::BoundedSparse(s) => s.len(),
            ProcessStorage::BoundedDense(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
