//! Consistency controllers: how one table answers reads and records
//! increments under a consistency model.
//!
//! A row is fresh enough for a reader at clock `c` when its clock is at
//! least `c - staleness`. Readers of stale or missing rows block until the
//! bg worker of the row's channel installs a fresh copy.

pub mod ssp;
pub mod ssp_aggr;
pub mod ssp_push;

use std::fmt::Debug;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

pub use self::ssp::SspConsistencyController;
pub use self::ssp_aggr::SspAggrConsistencyController;
pub use self::ssp_push::SspPushConsistencyController;
use crate::bg_worker::BgWorkerGroup;
use crate::bg_worker::RowReply;
use crate::client::ClientTable;
use crate::client::ThreadTable;
use crate::config_models::ConsistencyModel;
use crate::config_models::PsConfig;
use crate::errors::PsError;
use crate::errors::PsResult;
use crate::oplog_meta::RowOpLogMeta;
use crate::row::RowAccessor;

pub trait ConsistencyController: Send + Sync + Debug {
    fn table(&self) -> &Arc<ClientTable>;

    fn bg(&self) -> &BgWorkerGroup;

    /// Block until a row fresh enough for a reader at `clock` is cached.
    fn get(
        &self,
        row_id: i32,
        clock: i32,
        cancel: Option<&CancellationToken>,
    ) -> PsResult<RowAccessor>;

    fn inc(&self, thread: &mut ThreadTable, row_id: i32, col: i32, delta: f32, clock: i32);

    fn batch_inc(
        &self,
        thread: &mut ThreadTable,
        row_id: i32,
        cols: &[i32],
        deltas: &[f32],
        clock: i32,
    );

    fn dense_batch_inc(
        &self,
        thread: &mut ThreadTable,
        row_id: i32,
        index_st: i32,
        deltas: &[f32],
        clock: i32,
    );

    /// Start fetching a row without waiting. `None` when a fresh enough copy
    /// is cached already.
    fn get_async(&self, row_id: i32, clock: i32) -> PsResult<Option<RowReply>> {
        let stalest = clock - self.table().staleness();
        if is_fresh(self.table(), row_id, stalest) {
            return Ok(None);
        }
        Ok(Some(self.bg().request_row(
            self.table().table_id(),
            row_id,
            stalest,
        )?))
    }

    /// Move the thread's private state into the shared oplog ahead of a clock
    /// tick.
    fn flush_thread_cache(&self, thread: &mut ThreadTable, clock: i32) {
        flush_thread_oplogs(self, thread, clock);
    }

    fn clock(&self, thread: &mut ThreadTable, clock: i32) {
        self.flush_thread_cache(thread, clock);
    }

    /// Read through the thread's private row cache.
    fn thread_get(&self, thread: &mut ThreadTable, row_id: i32, col: i32, clock: i32) -> PsResult<f32> {
        if let Some(row) = thread.cached_row(row_id) {
            return Ok(row.get(col));
        }
        let accessor = self.get(row_id, clock, None)?;
        let row = accessor.read().clone();
        thread.insert_row(row_id, row);
        Ok(thread
            .cached_row(row_id)
            .map(|row| row.get(col))
            .unwrap_or_default())
    }

    fn thread_inc(&self, thread: &mut ThreadTable, row_id: i32, col: i32, delta: f32) {
        thread.thread_inc(row_id, col, delta);
    }

    fn thread_batch_inc(&self, thread: &mut ThreadTable, row_id: i32, cols: &[i32], deltas: &[f32]) {
        thread.thread_batch_inc(row_id, cols, deltas);
    }
}

/// The controller of `table` under the configured consistency model.
pub fn create_controller(
    config: &PsConfig,
    table: Arc<ClientTable>,
    bg: Arc<BgWorkerGroup>,
) -> Arc<dyn ConsistencyController> {
    match config.consistency_model {
        ConsistencyModel::Ssp => Arc::new(SspConsistencyController::new(table, bg)),
        ConsistencyModel::SspPush => Arc::new(SspPushConsistencyController::new(table, bg)),
        ConsistencyModel::SspAggr if config.update_sort_policy.is_value_based() => {
            Arc::new(SspAggrConsistencyController::new_value_based(table, bg))
        }
        ConsistencyModel::SspAggr => Arc::new(SspAggrConsistencyController::new(table, bg)),
    }
}

pub(crate) fn is_fresh(table: &ClientTable, row_id: i32, stalest: i32) -> bool {
    table
        .storage()
        .find(row_id)
        .is_some_and(|accessor| accessor.clock() >= stalest)
}

/// Wait for a row fetch, giving up when `cancel` fires.
pub(crate) fn wait_row_reply(
    reply: RowReply,
    cancel: Option<&CancellationToken>,
) -> PsResult<RowAccessor> {
    match cancel {
        None => futures::executor::block_on(reply)?,
        Some(token) => futures::executor::block_on(async {
            tokio::select! {
                biased;
                row = reply => row.unwrap_or(Err(PsError::ShutDown)),
                _ = token.cancelled() => Err(PsError::Cancelled),
            }
        }),
    }
}

/// Push the thread-level oplog through the controller's batch increment and
/// publish the rows the thread touched.
pub(crate) fn flush_thread_oplogs<C: ConsistencyController + ?Sized>(
    controller: &C,
    thread: &mut ThreadTable,
    clock: i32,
) {
    for (row_id, oplog) in thread.take_thread_oplogs() {
        let (cols, deltas): (Vec<i32>, Vec<f32>) = oplog.entries().into_iter().unzip();
        controller.batch_inc(thread, row_id, &cols, &deltas, clock);
    }
    thread.flush_oplog_index(controller.table().oplog_index());
}

/// Record updates in the table's partitioned oplog under the row's lock,
/// mirroring them into the cached row for read-your-writes tables.
pub(crate) fn record_updates(
    table: &ClientTable,
    thread: &mut ThreadTable,
    row_id: i32,
    updates: &[(i32, f32)],
    meta: Option<RowOpLogMeta>,
) {
    let Some(partition) = table.oplog().partition_of_row(row_id) else {
        panic!(
            "table {} has no partitioned oplog for row {}",
            table.table_id(),
            row_id
        );
    };
    partition.with_row_oplog(row_id, |oplog| {
        for (col, delta) in updates {
            oplog.inc(*col, *delta);
        }
        if let (Some(meta), Some(row_meta)) = (meta, oplog.meta_mut()) {
            row_meta.merge(&meta, true);
        }
        if table.applies_inc_to_cache() {
            if let Some(accessor) = table.storage().find(row_id) {
                let mut row = accessor.client_row().write();
                for (col, delta) in updates {
                    row.inc(*col, *delta);
                }
            }
        }
    });
    thread.index_update(row_id);
}

pub(crate) fn pairs(cols: &[i32], deltas: &[f32]) -> Vec<(i32, f32)> {
    cols.iter().copied().zip(deltas.iter().copied()).collect()
}

pub(crate) fn dense_pairs(index_st: i32, deltas: &[f32]) -> Vec<(i32, f32)> {
    (index_st..).zip(deltas.iter().copied()).collect()
}
