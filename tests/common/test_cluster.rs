use std::sync::Arc;

use ssp_ps::client::TableGroup;
use ssp_ps::comm_bus::CommBus;
use ssp_ps::comm_bus::InProcCommBus;
use ssp_ps::config_models::ClientTableConfig;
use ssp_ps::config_models::ConsistencyModel;
use ssp_ps::config_models::PsConfig;
use ssp_ps::config_models::TableInfo;

/// Every client of a cluster, living in the test process and sharing one
/// in-process bus.
pub struct TestCluster {
    pub bus: InProcCommBus,
    pub groups: Vec<Arc<TableGroup>>,
}

impl TestCluster {
    pub fn config(model: ConsistencyModel, num_tables: i32) -> PsConfig {
        PsConfig {
            consistency_model: model,
            num_tables,
            num_comm_channels_per_client: 2,
            num_app_threads: 2,
            bg_idle_milli: 1,
            server_idle_milli: 1,
            ..PsConfig::default()
        }
    }

    pub fn table_config(staleness: i32, row_capacity: usize) -> ClientTableConfig {
        ClientTableConfig {
            table_info: TableInfo {
                table_staleness: staleness,
                row_capacity,
                dense_row_oplog_capacity: row_capacity,
                ..TableInfo::default()
            },
            ..ClientTableConfig::default()
        }
    }

    /// Start `num_clients` clients, then create `tables` on each of them.
    /// Servers only start once every client connected, so all clients are
    /// initialized before any table is created.
    pub fn start(
        num_clients: i32,
        config: PsConfig,
        tables: &[(i32, ClientTableConfig)],
    ) -> anyhow::Result<Self> {
        let bus = InProcCommBus::new(0);
        let groups = (0..num_clients)
            .map(|client_id| {
                let config = PsConfig {
                    client_id,
                    num_clients,
                    ..config.clone()
                };
                let client_bus: Arc<dyn CommBus> = Arc::new(bus.for_client(client_id));
                TableGroup::init(config, client_bus)
            })
            .collect::<Result<Vec<_>, _>>()?;

        for group in &groups {
            for (table_id, table_config) in tables {
                group.create_table(*table_id, table_config.clone())?;
            }
        }
        for group in &groups {
            group.create_table_done()?;
        }
        Ok(Self { bus, groups })
    }

    pub fn single(config: PsConfig, tables: &[(i32, ClientTableConfig)]) -> anyhow::Result<Self> {
        Self::start(1, config, tables)
    }

    pub fn group(&self, client_id: usize) -> &Arc<TableGroup> {
        &self.groups[client_id]
    }

    /// Shut every client down. The name node releases the bg workers only
    /// once all of them asked to stop, so clients shut down concurrently.
    pub fn shutdown(self) {
        std::thread::scope(|scope| {
            for group in &self.groups {
                scope.spawn(move || group.shutdown());
            }
        });
    }
}
