use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::dense_pairs;
use super::pairs;
use super::record_updates;
use super::ssp_push::SspPushConsistencyController;
use super::ConsistencyController;
use crate::bg_worker::BgWorkerGroup;
use crate::client::ClientTable;
use crate::client::ThreadTable;
use crate::errors::PsResult;
use crate::oplog_meta::RowOpLogMeta;
use crate::row::RowAccessor;

/// SSP with pushes and bandwidth-driven early communication.
///
/// Each increment also records the row's scheduling meta: the earliest clock
/// it was written at and, under a value-based sort policy, its importance.
/// Bg workers use the metas to send the most urgent rows before the clock
/// boundary whenever the link is idle.
#[derive(Debug)]
pub struct SspAggrConsistencyController {
    table: Arc<ClientTable>,
    bg: Arc<BgWorkerGroup>,
    value_based: bool,
}

impl SspAggrConsistencyController {
    pub fn new(table: Arc<ClientTable>, bg: Arc<BgWorkerGroup>) -> Self {
        Self {
            table,
            bg,
            value_based: false,
        }
    }

    /// The value variant ranks rows by the magnitude of their pending deltas
    /// relative to the cached values.
    pub fn new_value_based(table: Arc<ClientTable>, bg: Arc<BgWorkerGroup>) -> Self {
        Self {
            table,
            bg,
            value_based: true,
        }
    }

    pub fn is_value_based(&self) -> bool {
        self.value_based
    }

    fn update_meta(&self, row_id: i32, updates: &[(i32, f32)], clock: i32) -> RowOpLogMeta {
        if !self.value_based {
            return RowOpLogMeta::new(clock, 0.0);
        }
        let cached = self.table.storage().find(row_id);
        let importance = updates
            .iter()
            .map(|(col, delta)| {
                let value = cached.as_ref().map(|row| row.get(*col)).unwrap_or_default();
                importance(*delta, value)
            })
            .sum();
        RowOpLogMeta::new(clock, importance)
    }

    fn record(&self, thread: &mut ThreadTable, row_id: i32, updates: &[(i32, f32)], clock: i32) {
        let meta = self.update_meta(row_id, updates, clock);
        record_updates(&self.table, thread, row_id, updates, Some(meta));
    }
}

/// Magnitude of `delta` relative to `value`; the plain magnitude when the
/// value is zero.
pub fn importance(delta: f32, value: f32) -> f64 {
    let delta = f64::from(delta).abs();
    let value = f64::from(value).abs();
    if value == 0.0 {
        delta
    } else {
        delta / value
    }
}

impl ConsistencyController for SspAggrConsistencyController {
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
        SspPushConsistencyController::get_pushed(&self.table, &self.bg, row_id, clock, cancel)
    }

    fn inc(&self, thread: &mut ThreadTable, row_id: i32, col: i32, delta: f32, clock: i32) {
        self.record(thread, row_id, &[(col, delta)], clock);
    }

    fn batch_inc(
        &self,
        thread: &mut ThreadTable,
        row_id: i32,
        cols: &[i32],
        deltas: &[f32],
        clock: i32,
    ) {
        self.record(thread, row_id, &pairs(cols, deltas), clock);
    }

    fn dense_batch_inc(
        &self,
        thread: &mut ThreadTable,
        row_id: i32,
        index_st: i32,
        deltas: &[f32],
        clock: i32,
    ) {
        self.record(thread, row_id, &dense_pairs(index_st, deltas), clock);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn importance_is_relative_to_the_current_value() {
        assert_eq!(0.5, importance(-1.0, 2.0));
        assert_eq!(3.0, importance(3.0, 0.0));
        assert_eq!(0.0, importance(0.0, 5.0));
    }
}
