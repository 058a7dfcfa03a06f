use std::collections::BTreeSet;
use std::collections::HashMap;

use itertools::Itertools;

use super::client_table::ClientTable;
use crate::config_models::entity_id::channel_for_row;
use crate::config_models::RowOpLogType;
use crate::oplog::AppendOnlyBuffer;
use crate::oplog::RowOpLog;
use crate::oplog::RowOpLogFactory;
use crate::oplog::TableOpLogIndex;
use crate::row::Row;

/// State one application thread keeps for one table: the rows it touched
/// since its last clock (per channel), its private row cache and oplog used by
/// the `thread_*` operations, and its append-only buffers.
#[derive(Debug)]
pub struct ThreadTable {
    table_id: i32,
    thread_id: i32,
    num_channels: i32,
    oplog_index: Vec<BTreeSet<i32>>,

    row_cache: HashMap<i32, Row>,
    row_cache_capacity: usize,
    oplog_factory: RowOpLogFactory,
    oplogs: HashMap<i32, RowOpLog>,

    append_buffers: Vec<Option<AppendOnlyBuffer>>,
}

impl ThreadTable {
    pub fn new(table: &ClientTable, thread_id: i32) -> Self {
        let num_channels = table.oplog().num_channels();
        let num_slots = usize::try_from(num_channels).unwrap_or_default();
        Self {
            table_id: table.table_id(),
            thread_id,
            num_channels,
            oplog_index: vec![BTreeSet::new(); num_slots],
            row_cache: HashMap::new(),
            row_cache_capacity: table.config().thread_cache_capacity.max(1),
            oplog_factory: RowOpLogFactory::new(
                RowOpLogType::Sparse,
                table.info().dense_row_oplog_capacity,
                false,
            ),
            oplogs: HashMap::new(),
            append_buffers: (0..num_slots).map(|_| None).collect(),
        }
    }

    pub fn table_id(&self) -> i32 {
        self.table_id
    }

    pub fn thread_id(&self) -> i32 {
        self.thread_id
    }

    pub fn channel_of_row(&self, row_id: i32) -> i32 {
        channel_for_row(row_id, self.num_channels)
    }

    /// Remember that `row_id` has pending updates.
    pub fn index_update(&mut self, row_id: i32) {
        let channel = self.channel_of_row(row_id);
        if let Some(rows) = usize::try_from(channel)
            .ok()
            .and_then(|ch| self.oplog_index.get_mut(ch))
        {
            rows.insert(row_id);
        }
    }

    pub fn num_indexed_rows(&self) -> usize {
        self.oplog_index.iter().map(BTreeSet::len).sum()
    }

    /// Publish the touched rows to the table-wide index the bg workers drain.
    pub fn flush_oplog_index(&mut self, index: &TableOpLogIndex) {
        for (channel, rows) in (0..).zip(self.oplog_index.iter_mut()) {
            if !rows.is_empty() {
                index.add_index(channel, std::mem::take(rows));
            }
        }
    }

    pub fn cached_row(&self, row_id: i32) -> Option<&Row> {
        self.row_cache.get(&row_id)
    }

    /// Cache a private copy of a row, with this thread's unflushed updates
    /// applied. Evicts an arbitrary row when full.
    pub fn insert_row(&mut self, row_id: i32, mut row: Row) {
        if !self.row_cache.contains_key(&row_id) && self.row_cache.len() >= self.row_cache_capacity
        {
            if let Some(victim) = self.row_cache.keys().next().copied() {
                self.row_cache.remove(&victim);
            }
        }
        if let Some(oplog) = self.oplogs.get(&row_id) {
            oplog.apply_to_row(&mut row);
        }
        self.row_cache.insert(row_id, row);
    }

    pub fn thread_inc(&mut self, row_id: i32, col: i32, delta: f32) {
        let factory = self.oplog_factory;
        self.oplogs
            .entry(row_id)
            .or_insert_with(|| factory.create())
            .inc(col, delta);
        if let Some(row) = self.row_cache.get_mut(&row_id) {
            row.inc(col, delta);
        }
    }

    pub fn thread_batch_inc(&mut self, row_id: i32, cols: &[i32], deltas: &[f32]) {
        let factory = self.oplog_factory;
        self.oplogs
            .entry(row_id)
            .or_insert_with(|| factory.create())
            .batch_inc(cols, deltas);
        if let Some(row) = self.row_cache.get_mut(&row_id) {
            row.batch_inc(cols, deltas);
        }
    }

    /// Take the thread-level oplog and drop the private row copies, which
    /// are stale once the updates are shared.
    pub fn take_thread_oplogs(&mut self) -> Vec<(i32, RowOpLog)> {
        self.row_cache.clear();
        self.oplogs
            .drain()
            .sorted_unstable_by_key(|(row_id, _)| *row_id)
            .collect()
    }

    pub fn append_buffer_slot(&mut self, channel: i32) -> Option<&mut Option<AppendOnlyBuffer>> {
        usize::try_from(channel)
            .ok()
            .and_then(|ch| self.append_buffers.get_mut(ch))
    }

    /// Every held append-only buffer with its channel.
    pub fn take_append_buffers(&mut self) -> Vec<(i32, AppendOnlyBuffer)> {
        (0..)
            .zip(self.append_buffers.iter_mut())
            .filter_map(|(channel, slot)| slot.take().map(|buffer| (channel, buffer)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_models::ClientTableConfig;
    use crate::config_models::PsConfig;

    fn table(num_channels: i32) -> ClientTable {
        let config = PsConfig {
            num_comm_channels_per_client: num_channels,
            ..Default::default()
        };
        ClientTable::new(7, ClientTableConfig::default(), &config).unwrap()
    }

    #[test]
    fn index_is_split_by_channel() {
        let table = table(2);
        let mut thread_table = ThreadTable::new(&table, 200);
        for row_id in [1, 2, 3, 4, 4] {
            thread_table.index_update(row_id);
        }
        assert_eq!(4, thread_table.num_indexed_rows());

        thread_table.flush_oplog_index(table.oplog_index());
        assert_eq!(0, thread_table.num_indexed_rows());
        assert_eq!(vec![2, 4], table.oplog_index().reset_partition(0));
        assert_eq!(vec![1, 3], table.oplog_index().reset_partition(1));
    }

    #[test]
    fn cached_rows_see_the_threads_own_updates() {
        let table = table(1);
        let mut thread_table = ThreadTable::new(&table, 200);
        thread_table.thread_inc(5, 0, 2.0);
        thread_table.insert_row(5, table.sample_row());
        assert_eq!(Some(2.0), thread_table.cached_row(5).map(|row| row.get(0)));

        thread_table.thread_batch_inc(5, &[0, 1], &[1.0, 3.0]);
        let row = thread_table.cached_row(5).unwrap();
        assert_eq!(3.0, row.get(0));
        assert_eq!(3.0, row.get(1));

        let oplogs = thread_table.take_thread_oplogs();
        assert_eq!(1, oplogs.len());
        assert_eq!(vec![(0, 3.0), (1, 3.0)], oplogs[0].1.entries());
        assert!(thread_table.cached_row(5).is_none());
    }

    #[test]
    fn row_cache_stays_within_capacity() {
        let table = table(1);
        let mut thread_table = ThreadTable::new(&table, 200);
        thread_table.insert_row(1, table.sample_row());
        thread_table.insert_row(2, table.sample_row());
        assert!(thread_table.cached_row(2).is_some());
        assert!(thread_table.cached_row(1).is_none());
    }
}
