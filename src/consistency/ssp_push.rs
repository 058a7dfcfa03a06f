use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::dense_pairs;
use super::flush_thread_oplogs;
use super::pairs;
use super::record_updates;
use super::wait_row_reply;
use super::ConsistencyController;
use crate::bg_worker::BgWorkerGroup;
use crate::client::ClientTable;
use crate::client::ThreadTable;
use crate::errors::PsResult;
use crate::oplog::AppendOnlyBuffer;
use crate::row::RowAccessor;

/// SSP with server pushes. Servers push the rows a client subscribed to when
/// their clock advances, so a cached row only needs the system clock to
/// catch up; increments reach the cache through those pushes.
///
/// Tables with an append-only oplog record increments in per-thread buffers
/// that the bg worker replays.
#[derive(Debug)]
pub struct SspPushConsistencyController {
    table: Arc<ClientTable>,
    bg: Arc<BgWorkerGroup>,
}

impl SspPushConsistencyController {
    pub fn new(table: Arc<ClientTable>, bg: Arc<BgWorkerGroup>) -> Self {
        Self { table, bg }
    }

    /// Append through `write`; a full buffer is handed to the bg worker and
    /// replaced, blocking while the thread's pool is exhausted.
    fn append(
        &self,
        thread: &mut ThreadTable,
        row_id: i32,
        write: impl Fn(&mut AppendOnlyBuffer) -> bool,
    ) {
        let channel = thread.channel_of_row(row_id);
        let thread_id = thread.thread_id();
        let Some(partition) = self.table.oplog().append_only_partition(channel) else {
            panic!("table {} has no append-only oplog", self.table.table_id());
        };
        let Some(slot) = thread.append_buffer_slot(channel) else {
            panic!("channel {} outside thread table", channel);
        };
        let buffer = slot.get_or_insert_with(|| partition.register_thread(thread_id));
        if write(buffer) {
            return;
        }

        if let Some(full) = slot.take() {
            partition.push_buffer(full);
            if let Err(err) = self.bg.append_buffer_ready(self.table.table_id(), channel) {
                trace!("append buffer not announced: {}", err);
            }
        }
        let mut fresh = partition.next_buffer(thread_id);
        assert!(
            write(&mut fresh),
            "update batch larger than an append-only buffer of table {}",
            self.table.table_id()
        );
        *slot = Some(fresh);
    }

    /// Hand every non-empty buffer of the thread to the bg workers.
    fn flush_append_buffers(&self, thread: &mut ThreadTable) {
        for (channel, buffer) in thread.take_append_buffers() {
            let Some(partition) = self.table.oplog().append_only_partition(channel) else {
                continue;
            };
            let has_updates = !buffer.is_empty();
            partition.push_buffer(buffer);
            if has_updates {
                if let Err(err) = self.bg.append_buffer_ready(self.table.table_id(), channel) {
                    trace!("append buffer not announced: {}", err);
                }
            }
        }
    }

    pub(crate) fn get_pushed(
        table: &ClientTable,
        bg: &BgWorkerGroup,
        row_id: i32,
        clock: i32,
        cancel: Option<&CancellationToken>,
    ) -> PsResult<RowAccessor> {
        let stalest = clock - table.staleness();
        if let Some(accessor) = table.storage().find(row_id) {
            if accessor.clock() >= stalest {
                return Ok(accessor);
            }
        }
        if table.storage().contains(row_id) {
            // Subscribed rows are pushed before the clock that covers them.
            bg.wait_system_clock(stalest, cancel)?;
            if let Some(accessor) = table.storage().find(row_id) {
                return Ok(accessor);
            }
        }
        let reply = bg.request_row(table.table_id(), row_id, stalest)?;
        wait_row_reply(reply, cancel)
    }
}

impl ConsistencyController for SspPushConsistencyController {
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
        Self::get_pushed(&self.table, &self.bg, row_id, clock, cancel)
    }

    fn inc(&self, thread: &mut ThreadTable, row_id: i32, col: i32, delta: f32, _clock: i32) {
        if self.table.oplog().is_append_only() {
            self.append(thread, row_id, |buffer| buffer.inc(row_id, col, delta));
        } else {
            record_updates(&self.table, thread, row_id, &[(col, delta)], None);
        }
    }

    fn batch_inc(
        &self,
        thread: &mut ThreadTable,
        row_id: i32,
        cols: &[i32],
        deltas: &[f32],
        _clock: i32,
    ) {
        if self.table.oplog().is_append_only() {
            self.append(thread, row_id, |buffer| buffer.batch_inc(row_id, cols, deltas));
        } else {
            record_updates(&self.table, thread, row_id, &pairs(cols, deltas), None);
        }
    }

    fn dense_batch_inc(
        &self,
        thread: &mut ThreadTable,
        row_id: i32,
        index_st: i32,
        deltas: &[f32],
        _clock: i32,
    ) {
        if self.table.oplog().is_append_only() {
            self.append(thread, row_id, |buffer| {
                buffer.dense_batch_inc(row_id, index_st, deltas)
            });
        } else {
            record_updates(
                &self.table,
                thread,
                row_id,
                &dense_pairs(index_st, deltas),
                None,
            );
        }
    }

    fn flush_thread_cache(&self, thread: &mut ThreadTable, clock: i32) {
        flush_thread_oplogs(self, thread, clock);
        if self.table.oplog().is_append_only() {
            self.flush_append_buffers(thread);
        }
    }
}
