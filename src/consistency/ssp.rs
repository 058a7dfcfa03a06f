use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::dense_pairs;
use super::pairs;
use super::record_updates;
use super::wait_row_reply;
use super::ConsistencyController;
use crate::bg_worker::BgWorkerGroup;
use crate::client::ClientTable;
use crate::client::ThreadTable;
use crate::errors::PsResult;
use crate::row::RowAccessor;

/// Pull-based SSP: stale rows are fetched from their server on demand, and
/// increments are mirrored into cached rows right away.
#[derive(Debug)]
pub struct SspConsistencyController {
    table: Arc<ClientTable>,
    bg: Arc<BgWorkerGroup>,
}

impl SspConsistencyController {
    pub fn new(table: Arc<ClientTable>, bg: Arc<BgWorkerGroup>) -> Self {
        Self { table, bg }
    }
}

impl ConsistencyController for SspConsistencyController {
    fn table(&self) -> &Arc<ClientTable> {
        &self.table
    }

    fn bg(&self) -> &BgWorkerGroup {
        &self.bg
    }

    fn get(
        &self,
        row_id: i32,
        clock: i32,
        cancel: Option<&CancellationToken>,
    ) -> PsResult<RowAccessor> {
        let stalest = clock - self.table.staleness();
        if let Some(accessor) = self.table.storage().find(row_id) {
            if accessor.clock() >= stalest {
                return Ok(accessor);
            }
        }
        trace!(
            "table {}: fetching row {} at clock {}",
            self.table.table_id(),
            row_id,
            stalest
        );
        let reply = self.bg.request_row(self.table.table_id(), row_id, stalest)?;
        wait_row_reply(reply, cancel)
    }

    fn inc(&self, thread: &mut ThreadTable, row_id: i32, col: i32, delta: f32, _clock: i32) {
        record_updates(&self.table, thread, row_id, &[(col, delta)], None);
    }

    fn batch_inc(
        &self,
        thread: &mut ThreadTable,
        row_id: i32,
        cols: &[i32],
        deltas: &[f32],
        _clock: i32,
    ) {
        record_updates(&self.table, thread, row_id, &pairs(cols, deltas), None);
    }

    fn dense_batch_inc(
        &self,
        thread: &mut ThreadTable,
        row_id: i32,
        index_st: i32,
        deltas: &[f32],
        _clock: i32,
    ) {
        record_updates(
            &self.table,
            thread,
            row_id,
            &dense_pairs(index_st, deltas),
            None,
        );
    }
}
