use crate::config_models::ClientTableConfig;
use crate::config_models::ConsistencyModel;
use crate::config_models::PsConfig;
use crate::config_models::TableInfo;
use crate::errors::PsResult;
use crate::oplog::RowOpLogFactory;
use crate::oplog::TableOpLog;
use crate::oplog::TableOpLogIndex;
use crate::oplog::UpdateCodec;
use crate::row::ClientRow;
use crate::row::Row;
use crate::row::RowAccessor;
use crate::storage::ProcessStorage;

/// Client-side state of one table, shared by the application threads and
/// the bg workers of a process.
#[derive(Debug)]
pub struct ClientTable {
    table_id: i32,
    config: ClientTableConfig,
    codec: UpdateCodec,
    storage: ProcessStorage,
    oplog: TableOpLog,
    oplog_index: TableOpLogIndex,

    /// Increments are mirrored into cached rows for read-your-writes.
    applies_inc_to_cache: bool,
}

impl ClientTable {
    pub fn new(table_id: i32, config: ClientTableConfig, ps_config: &PsConfig) -> PsResult<Self> {
        config.validate(ps_config)?;
        let info = &config.table_info;
        let factory = RowOpLogFactory::new(
            info.row_oplog_type,
            info.dense_row_oplog_capacity,
            ps_config.consistency_model == ConsistencyModel::SspAggr,
        );
        let num_channels = ps_config.num_comm_channels_per_client;
        Ok(Self {
            table_id,
            codec: UpdateCodec::for_table(info),
            storage: ProcessStorage::new(&config, ps_config.lock_pool_size),
            oplog: TableOpLog::new(&config, factory, num_channels, ps_config.lock_pool_size),
            oplog_index: TableOpLogIndex::new(num_channels),
            applies_inc_to_cache: ps_config.consistency_model == ConsistencyModel::Ssp,
            config,
        })
    }

    pub fn table_id(&self) -> i32 {
        self.table_id
    }

    pub fn config(&self) -> &ClientTableConfig {
        &self.config
    }

    pub fn info(&self) -> &TableInfo {
        &self.config.table_info
    }

    pub fn staleness(&self) -> i32 {
        self.config.table_info.table_staleness
    }

    pub fn codec(&self) -> UpdateCodec {
        self.codec
    }

    pub fn storage(&self) -> &ProcessStorage {
        &self.storage
    }

    pub fn oplog(&self) -> &TableOpLog {
        &self.oplog
    }

    pub fn oplog_index(&self) -> &TableOpLogIndex {
        &self.oplog_index
    }

    pub fn applies_inc_to_cache(&self) -> bool {
        self.applies_inc_to_cache
    }

    /// A fresh, zeroed row of this table's type.
    pub fn sample_row(&self) -> Row {
        Row::new(self.info().row_type, self.info().row_capacity)
    }

    /// Install a row fetched from or pushed by a server.
    ///
    /// `replay` re-applies local updates the server had not seen. When the
    /// table mirrors increments into its cache, the still unsent oplog of the
    /// row is applied as well, under the row's oplog lock so that no
    /// concurrent increment is lost.
    pub fn install_row(
        &self,
        row_id: i32,
        clock: i32,
        mut row: Row,
        replay: impl FnOnce(&mut Row),
    ) -> RowAccessor {
        replay(&mut row);
        let partition = self
            .applies_inc_to_cache
            .then(|| self.oplog.partition_of_row(row_id))
            .flatten();
        match partition {
            Some(partition) => partition.lock_row_oplog(row_id, |oplog| {
                if let Some(oplog) = oplog {
                    oplog.apply_to_row(&mut row);
                }
                self.storage
                    .insert_and_access(row_id, ClientRow::new(clock, row))
                    .1
            }),
            None => {
                self.storage
                    .insert_and_access(row_id, ClientRow::new(clock, row))
                    .1
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_models::OpLogType;

    fn ps_config(model: ConsistencyModel) -> PsConfig {
        PsConfig {
            consistency_model: model,
            num_comm_channels_per_client: 2,
            ..Default::default()
        }
    }

    #[test]
    fn installed_rows_include_unsent_increments() {
        let table =
            ClientTable::new(0, ClientTableConfig::default(), &ps_config(ConsistencyModel::Ssp))
                .unwrap();
        assert!(table.applies_inc_to_cache());
        table
            .oplog()
            .partition_of_row(3)
            .unwrap()
            .with_row_oplog(3, |oplog| oplog.inc(1, 2.0));

        let mut server_row = table.sample_row();
        server_row.inc(1, 10.0);
        let accessor = table.install_row(3, 4, server_row, |row| row.inc(0, 1.0));
        assert_eq!(4, accessor.clock());
        assert_eq!(12.0, accessor.get(1));
        assert_eq!(1.0, accessor.get(0));
        assert_eq!(1, table.storage().len());
    }

    #[test]
    fn push_tables_cache_server_values_only() {
        let table = ClientTable::new(
            0,
            ClientTableConfig::default(),
            &ps_config(ConsistencyModel::SspPush),
        )
        .unwrap();
        table
            .oplog()
            .partition_of_row(3)
            .unwrap()
            .with_row_oplog(3, |oplog| oplog.inc(1, 2.0));
        let accessor = table.install_row(3, 0, table.sample_row(), |_| {});
        assert_eq!(0.0, accessor.get(1));
    }

    #[test]
    fn invalid_table_config_is_rejected() {
        let config = ClientTableConfig {
            oplog_type: OpLogType::AppendOnly,
            ..Default::default()
        };
        assert!(ClientTable::new(0, config, &ps_config(ConsistencyModel::Ssp)).is_err());
    }
}
