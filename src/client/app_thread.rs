use std::cell::Cell;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::table_group::TableGroup;
use super::table_group::TableHandle;
use super::thread_table::ThreadTable;
use crate::bg_worker::RowReply;
use crate::consistency::wait_row_reply;
use crate::errors::PsResult;
use crate::row::RowAccessor;

/// Handle of one registered application thread.
///
/// Carries the thread's clock and its per-table state. Every operation acts
/// at the thread's current clock. Dropping the handle flushes pending updates
/// and deregisters the thread.
#[derive(Debug)]
pub struct AppThread {
    group: Arc<TableGroup>,
    thread_id: i32,
    clock: i32,
    tables: HashMap<i32, ThreadTable>,
    pending_async: VecDeque<RowReply>,
    _not_sync: PhantomData<Cell<()>>,
}

impl AppThread {
    pub(crate) fn new(group: Arc<TableGroup>, thread_id: i32, clock: i32) -> Self {
        Self {
            group,
            thread_id,
            clock,
            tables: HashMap::new(),
            pending_async: VecDeque::new(),
            _not_sync: PhantomData,
        }
    }

    pub fn thread_id(&self) -> i32 {
        self.thread_id
    }

    pub fn clock(&self) -> i32 {
        self.clock
    }

    fn thread_table(&mut self, table_id: i32) -> PsResult<(TableHandle, &mut ThreadTable)> {
        let handle = self.group.table_handle(table_id)?;
        let thread_id = self.thread_id;
        let thread_table = self
            .tables
            .entry(table_id)
            .or_insert_with(|| ThreadTable::new(&handle.table, thread_id));
        Ok((handle, thread_table))
    }

    /// Read a row fresh enough for this thread's clock, blocking as needed.
    pub fn get(&mut self, table_id: i32, row_id: i32) -> PsResult<RowAccessor> {
        let handle = self.group.table_handle(table_id)?;
        handle.controller.get(row_id, self.clock, None)
    }

    /// Like [`AppThread::get`], giving up with `Cancelled` when `cancel`
    /// fires first.
    pub fn get_cancellable(
        &mut self,
        table_id: i32,
        row_id: i32,
        cancel: &CancellationToken,
    ) -> PsResult<RowAccessor> {
        let handle = self.group.table_handle(table_id)?;
        handle.controller.get(row_id, self.clock, Some(cancel))
    }

    /// Start fetching a row without waiting for it. Once
    /// `max_pending_async_get_cnt` fetches are outstanding, waits for all of
    /// them first.
    pub fn get_async(&mut self, table_id: i32, row_id: i32) -> PsResult<()> {
        if self.pending_async.len() >= self.group.config().max_pending_async_get_cnt {
            self.wait_pending_async_get()?;
        }
        let handle = self.group.table_handle(table_id)?;
        if let Some(reply) = handle.controller.get_async(row_id, self.clock)? {
            self.pending_async.push_back(reply);
        }
        Ok(())
    }

    pub fn num_pending_async_get(&self) -> usize {
        self.pending_async.len()
    }

    /// Wait for every outstanding [`AppThread::get_async`].
    pub fn wait_pending_async_get(&mut self) -> PsResult<()> {
        while let Some(reply) = self.pending_async.pop_front() {
            wait_row_reply(reply, None)?;
        }
        Ok(())
    }

    pub fn inc(&mut self, table_id: i32, row_id: i32, col: i32, delta: f32) -> PsResult<()> {
        let clock = self.clock;
        let (handle, thread_table) = self.thread_table(table_id)?;
        handle.controller.inc(thread_table, row_id, col, delta, clock);
        Ok(())
    }

    pub fn batch_inc(
        &mut self,
        table_id: i32,
        row_id: i32,
        cols: &[i32],
        deltas: &[f32],
    ) -> PsResult<()> {
        let clock = self.clock;
        let (handle, thread_table) = self.thread_table(table_id)?;
        handle
            .controller
            .batch_inc(thread_table, row_id, cols, deltas, clock);
        Ok(())
    }

    /// Increment the columns `index_st..index_st + deltas.len()`.
    pub fn dense_batch_inc(
        &mut self,
        table_id: i32,
        row_id: i32,
        index_st: i32,
        deltas: &[f32],
    ) -> PsResult<()> {
        let clock = self.clock;
        let (handle, thread_table) = self.thread_table(table_id)?;
        handle
            .controller
            .dense_batch_inc(thread_table, row_id, index_st, deltas, clock);
        Ok(())
    }

    /// Read one value through the thread's private row cache, which sees the
    /// thread's own `thread_inc`s.
    pub fn thread_get(&mut self, table_id: i32, row_id: i32, col: i32) -> PsResult<f32> {
        let clock = self.clock;
        let (handle, thread_table) = self.thread_table(table_id)?;
        handle.controller.thread_get(thread_table, row_id, col, clock)
    }

    /// Increment in the thread-level oplog; shared on the next clock.
    pub fn thread_inc(&mut self, table_id: i32, row_id: i32, col: i32, delta: f32) -> PsResult<()> {
        let (handle, thread_table) = self.thread_table(table_id)?;
        handle.controller.thread_inc(thread_table, row_id, col, delta);
        Ok(())
    }

    pub fn thread_batch_inc(
        &mut self,
        table_id: i32,
        row_id: i32,
        cols: &[i32],
        deltas: &[f32],
    ) -> PsResult<()> {
        let (handle, thread_table) = self.thread_table(table_id)?;
        handle
            .controller
            .thread_batch_inc(thread_table, row_id, cols, deltas);
        Ok(())
    }

    /// Finish the current clock: flush this thread's updates of every table,
    /// then advance its clock.
    pub fn clock_tick(&mut self) -> PsResult<()> {
        self.flush_tables();
        self.group.clock_thread(self.thread_id)?;
        self.clock += 1;
        Ok(())
    }

    /// Clock enough times that every later read observes the updates of
    /// every thread up to now.
    pub fn global_barrier(&mut self) -> PsResult<()> {
        for _ in 0..=self.group.max_staleness() {
            self.clock_tick()?;
        }
        Ok(())
    }

    fn flush_tables(&mut self) {
        let clock = self.clock;
        for handle in self.group.table_handles() {
            if let Some(thread_table) = self.tables.get_mut(&handle.table.table_id()) {
                handle.controller.clock(thread_table, clock);
            }
        }
    }
}

impl Drop for AppThread {
    fn drop(&mut self) {
        self.flush_tables();
        if let Err(err) = self.wait_pending_async_get() {
            warn!("thread {}: pending fetches failed: {}", self.thread_id, err);
        }
        self.group.deregister_thread(self.thread_id);
    }
}
