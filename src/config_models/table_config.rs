use serde::Deserialize;
use serde::Serialize;

use super::ps_config::ConsistencyModel;
use super::ps_config::PsConfig;
use crate::errors::PsError;
use crate::errors::PsResult;

/// Storage layout of a row, chosen once per table.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display,
)]
pub enum RowType {
    #[default]
    Dense,
    Sparse,
    SortedVector,
}

/// Per-row delta accumulator selected by the row-oplog factory.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display,
)]
pub enum RowOpLogType {
    #[default]
    Dense,
    VersionDense,
    Sparse,
    SparseVector,
    Float16Dense,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display,
)]
pub enum OpLogType {
    /// Row oplogs in striped hash maps.
    #[default]
    Sparse,

    /// Row oplogs in an array indexed by row id; row ids must stay below
    /// `oplog_capacity`.
    Dense,

    /// Raw increments appended to per-thread byte buffers, replayed by the bg
    /// worker.
    AppendOnly,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display,
)]
pub enum AppendOnlyOpLogType {
    #[default]
    Inc,
    BatchInc,
    DenseBatchInc,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display,
)]
pub enum ProcessStorageType {
    #[default]
    BoundedSparse,
    BoundedDense,
}

/// Table properties shared by clients and servers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableInfo {
    pub table_staleness: i32,
    pub row_type: RowType,

    /// Number of columns of a dense row; upper bound on columns otherwise.
    pub row_capacity: usize,

    /// Ship row oplogs in the dense format instead of the sparse one.
    pub oplog_dense_serialized: bool,
    pub row_oplog_type: RowOpLogType,

    /// Number of columns covered by a dense row oplog.
    pub dense_row_oplog_capacity: usize,
}

impl Default for TableInfo {
    fn default() -> Self {
        Self {
            table_staleness: 0,
            row_type: RowType::Dense,
            row_capacity: 100,
            oplog_dense_serialized: false,
            row_oplog_type: RowOpLogType::Dense,
            dense_row_oplog_capacity: 100,
        }
    }
}

impl TableInfo {
    /// Bytes used by one serialized update value.
    pub fn update_size(&self) -> usize {
        match self.row_oplog_type {
            RowOpLogType::Float16Dense => 2,
            _ => 4,
        }
    }

    pub fn is_versioned(&self) -> bool {
        self.row_oplog_type == RowOpLogType::VersionDense
    }
}

/// Immutable per-table client configuration, fixed at table creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientTableConfig {
    pub table_info: TableInfo,
    pub process_cache_capacity: usize,
    pub thread_cache_capacity: usize,
    pub oplog_capacity: usize,
    pub oplog_type: OpLogType,
    pub append_only_oplog_type: AppendOnlyOpLogType,
    pub append_only_buff_capacity: usize,
    pub per_thread_append_only_buff_pool_size: usize,

    /// Apply replayed append-only buffers to cached rows every this many
    /// buffers; 0 disables.
    pub bg_apply_append_oplog_freq: i32,
    pub process_storage_type: ProcessStorageType,
}

impl Default for ClientTableConfig {
    fn default() -> Self {
        Self {
            table_info: TableInfo::default(),
            process_cache_capacity: 1000,
            thread_cache_capacity: 1,
            oplog_capacity: 1000,
            oplog_type: OpLogType::Sparse,
            append_only_oplog_type: AppendOnlyOpLogType::Inc,
            append_only_buff_capacity: 1024 * 1024,
            per_thread_append_only_buff_pool_size: 3,
            bg_apply_append_oplog_freq: 0,
            process_storage_type: ProcessStorageType::BoundedSparse,
        }
    }
}

impl ClientTableConfig {
    pub fn validate(&self, ps_config: &PsConfig) -> PsResult<()> {
        let info = &self.table_info;
        if info.table_staleness < 0 {
            return Err(PsError::InvalidConfig(format!(
                "table staleness must be non-negative, got {}",
                info.table_staleness
            )));
        }
        if info.row_capacity == 0 {
            return Err(PsError::InvalidConfig("row capacity must be positive".into()));
        }
        if self.process_cache_capacity == 0 {
            return Err(PsError::InvalidConfig(
                "process cache capacity must be positive".into(),
            ));
        }
        let dense_oplog = matches!(
            info.row_oplog_type,
            RowOpLogType::Dense | RowOpLogType::VersionDense | RowOpLogType::Float16Dense
        );
        if dense_oplog && info.dense_row_oplog_capacity == 0 {
            return Err(PsError::InvalidConfig(
                "dense row oplogs need a positive dense_row_oplog_capacity".into(),
            ));
        }
        if info.oplog_dense_serialized && info.dense_row_oplog_capacity == 0 {
            return Err(PsError::InvalidConfig(
                "dense serialization needs a positive dense_row_oplog_capacity".into(),
            ));
        }
        if (dense_oplog || info.oplog_dense_serialized)
            && info.dense_row_oplog_capacity < info.row_capacity
        {
            return Err(PsError::InvalidConfig(format!(
                "dense_row_oplog_capacity {} does not cover row capacity {}",
                info.dense_row_oplog_capacity, info.row_capacity
            )));
        }
        if self.oplog_type == OpLogType::AppendOnly {
            if ps_config.consistency_model != ConsistencyModel::SspPush {
                return Err(PsError::InvalidConfig(
                    "append-only oplogs are only supported with the SspPush model".into(),
                ));
            }
            if self.per_thread_append_only_buff_pool_size == 0 {
                return Err(PsError::InvalidConfig(
                    "append-only buffer pool needs at least one buffer".into(),
                ));
            }
            if self.append_only_buff_capacity < 64 {
                return Err(PsError::InvalidConfig(format!(
                    "append-only buffer capacity {} is too small",
                    self.append_only_buff_capacity
                )));
            }
            if self.append_only_oplog_type == AppendOnlyOpLogType::DenseBatchInc
                && info.row_type != RowType::Dense
            {
                return Err(PsError::InvalidConfig(
                    "dense append-only buffers need dense rows".into(),
                ));
            }
        }
        if self.oplog_type == OpLogType::Dense && self.oplog_capacity == 0 {
            return Err(PsError::InvalidConfig(
                "dense oplog needs a positive oplog capacity".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        ClientTableConfig::default()
            .validate(&PsConfig::default())
            .unwrap();
    }

    #[test]
    fn append_only_requires_push_model() {
        let config = ClientTableConfig {
            oplog_type: OpLogType::AppendOnly,
            ..Default::default()
        };
        let ssp = PsConfig::default();
        assert!(matches!(
            config.validate(&ssp),
            Err(PsError::InvalidConfig(_))
        ));

        let push = PsConfig {
            consistency_model: ConsistencyModel::SspPush,
            ..Default::default()
        };
        config.validate(&push).unwrap();
    }

    #[test]
    fn dense_oplogs_must_cover_the_row() {
        let narrow = |row_oplog_type, oplog_dense_serialized| ClientTableConfig {
            table_info: TableInfo {
                row_capacity: 200,
                dense_row_oplog_capacity: 100,
                row_oplog_type,
                oplog_dense_serialized,
                ..Default::default()
            },
            ..Default::default()
        };
        let ps_config = PsConfig::default();
        for config in [
            narrow(RowOpLogType::Dense, false),
            narrow(RowOpLogType::Float16Dense, false),
            narrow(RowOpLogType::Sparse, true),
        ] {
            assert!(matches!(
                config.validate(&ps_config),
                Err(PsError::InvalidConfig(_))
            ));
        }
        narrow(RowOpLogType::Sparse, false)
            .validate(&ps_config)
            .unwrap();
    }

    #[test]
    fn float16_oplog_uses_two_byte_updates() {
        let info = TableInfo {
            row_oplog_type: RowOpLogType::Float16Dense,
            ..Default::default()
        };
        assert_eq!(2, info.update_size());
        assert_eq!(4, TableInfo::default().update_size());
    }
}
