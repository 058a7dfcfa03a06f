use std::collections::HashSet;

use itertools::Itertools;
use parking_lot::Mutex;

use super::append_only::AppendBufferConfig;
use super::append_only::AppendOnlyOpLogPartition;
use super::partition::OpLogPartition;
use super::row_oplog::RowOpLogFactory;
use super::update_codec::UpdateCodec;
use crate::config_models::entity_id::channel_for_row;
use crate::config_models::ClientTableConfig;
use crate::config_models::OpLogType;

#[derive(Debug)]
enum Partitions {
    Partitioned(Vec<OpLogPartition>),
    AppendOnly(Vec<AppendOnlyOpLogPartition>),
}

/// Table-wide oplog, split into one partition per communication channel so
/// each bg worker only drains the rows it owns.
#[derive(Debug)]
pub struct TableOpLog {
    num_channels: i32,
    factory: RowOpLogFactory,
    partitions: Partitions,
}

impl TableOpLog {
    pub fn new(
        config: &ClientTableConfig,
        factory: RowOpLogFactory,
        num_channels: i32,
        lock_pool_size: usize,
    ) -> Self {
        let channels = 0..num_channels;
        let partitions = match config.oplog_type {
            OpLogType::Sparse => Partitions::Partitioned(
                channels
                    .map(|_| OpLogPartition::new_sparse(factory, lock_pool_size))
                    .collect(),
            ),
            OpLogType::Dense => Partitions::Partitioned(
                channels
                    .map(|_| OpLogPartition::new_dense(factory, config.oplog_capacity))
                    .collect(),
            ),
            OpLogType::AppendOnly => {
                let buffer_config = AppendBufferConfig {
                    kind: config.append_only_oplog_type,
                    codec: UpdateCodec::for_table(&config.table_info),
                    capacity: config.append_only_buff_capacity,
                    row_capacity: config.table_info.row_capacity,
                    pool_size: config.per_thread_append_only_buff_pool_size,
                };
                Partitions::AppendOnly(
                    channels
                        .map(|_| AppendOnlyOpLogPartition::new(buffer_config))
                        .collect(),
                )
            }
        };
        Self {
            num_channels,
            factory,
            partitions,
        }
    }

    pub fn factory(&self) -> &RowOpLogFactory {
        &self.factory
    }

    pub fn num_channels(&self) -> i32 {
        self.num_channels
    }

    pub fn is_append_only(&self) -> bool {
        matches!(self.partitions, Partitions::AppendOnly(_))
    }

    pub fn channel_of_row(&self, row_id: i32) -> i32 {
        channel_for_row(row_id, self.num_channels)
    }

    /// Hash-indexed partition of `channel`; `None` for append-only tables.
    pub fn partition(&self, channel: i32) -> Option<&OpLogPartition> {
        match &self.partitions {
            Partitions::Partitioned(partitions) => partitions.get(usize::try_from(channel).ok()?),
            Partitions::AppendOnly(_) => None,
        }
    }

    pub fn partition_of_row(&self, row_id: i32) -> Option<&OpLogPartition> {
        self.partition(self.channel_of_row(row_id))
    }

    pub fn append_only_partition(&self, channel: i32) -> Option<&AppendOnlyOpLogPartition> {
        match &self.partitions {
            Partitions::AppendOnly(partitions) => partitions.get(usize::try_from(channel).ok()?),
            Partitions::Partitioned(_) => None,
        }
    }
}

/// Rows with pending oplogs, per channel. Application threads publish the
/// rows they touched on clock; the channel's bg worker takes the whole set.
#[derive(Debug)]
pub struct TableOpLogIndex {
    partitions: Vec<Mutex<HashSet<i32>>>,
}

impl TableOpLogIndex {
    pub fn new(num_channels: i32) -> Self {
        Self {
            partitions: (0..num_channels).map(|_| Mutex::new(HashSet::new())).collect(),
        }
    }

    fn partition(&self, channel: i32) -> &Mutex<HashSet<i32>> {
        match usize::try_from(channel).ok().and_then(|c| self.partitions.get(c)) {
            Some(partition) => partition,
            None => panic!(
                "channel {} outside oplog index of {} channels",
                channel,
                self.partitions.len()
            ),
        }
    }

    pub fn add_index(&self, channel: i32, rows: impl IntoIterator<Item = i32>) {
        self.partition(channel).lock().extend(rows);
    }

    /// Take every indexed row of `channel`, ascending.
    pub fn reset_partition(&self, channel: i32) -> Vec<i32> {
        let rows = std::mem::take(&mut *self.partition(channel).lock());
        rows.into_iter().sorted_unstable().collect()
    }

    pub fn num_rows(&self, channel: i32) -> usize {
        self.partition(channel).lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_models::RowOpLogType;

    #[test]
    fn rows_land_in_their_channel_partition() {
        let config = ClientTableConfig::default();
        let factory = RowOpLogFactory::new(RowOpLogType::Sparse, 10, false);
        let oplog = TableOpLog::new(&config, factory, 3, 8);
        assert!(!oplog.is_append_only());
        assert!(oplog.append_only_partition(0).is_none());

        for row_id in 0..9 {
            oplog
                .partition_of_row(row_id)
                .unwrap()
                .with_row_oplog(row_id, |o| o.inc(0, 1.0));
        }
        assert_eq!(vec![1, 4, 7], oplog.partition(1).unwrap().row_ids());
        assert!(oplog.partition(3).is_none());
    }

    #[test]
    fn append_only_tables_have_no_row_partitions() {
        let config = ClientTableConfig {
            oplog_type: OpLogType::AppendOnly,
            ..Default::default()
        };
        let factory = RowOpLogFactory::new(RowOpLogType::Dense, 10, false);
        let oplog = TableOpLog::new(&config, factory, 2, 8);
        assert!(oplog.is_append_only());
        assert!(oplog.partition_of_row(0).is_none());
        assert!(oplog.append_only_partition(1).is_some());
    }

    #[test]
    fn index_partition_is_taken_whole() {
        let index = TableOpLogIndex::new(2);
        index.add_index(0, [4, 2]);
        index.add_index(0, [2, 8]);
        index.add_index(1, [3]);
        assert_eq!(3, index.num_rows(0));
        assert_eq!(vec![2, 4, 8], index.reset_partition(0));
        assert!(index.reset_partition(0).is_empty());
        assert_eq!(1, index.num_rows(1));
    }
}
