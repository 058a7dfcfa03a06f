// recursion limit for macros (e.g. tokio::select!)
#![recursion_limit = "256"]

pub mod bg_worker;
pub mod client;
pub mod comm_bus;
pub mod config_models;
pub mod consistency;
pub mod errors;
pub mod oplog;
pub mod oplog_meta;
pub mod protocol;
pub mod row;
pub mod server;
pub mod storage;
pub mod util_types;

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use anyhow::Result;
use bytesize::ByteSize;
use tracing::info;

use crate::client::TableGroup;
use crate::comm_bus::CommBus;
use crate::comm_bus::InProcCommBus;
use crate::config_models::cli_args;
use crate::config_models::ClientTableConfig;
use crate::config_models::TableInfo;

/// Table driven by [`initialize`].
pub const WORKLOAD_TABLE_ID: i32 = 0;

/// Start a single-client cluster and run the increment workload described by
/// `args`: every application thread adds 1 to each cell of the first
/// `num_rows` rows once per clock.
pub fn initialize(args: cli_args::Args) -> Result<()> {
    let config = args.ps_config()?;
    let bus = InProcCommBus::new(config.client_id);
    let group = TableGroup::init(config, Arc::new(bus.clone()) as Arc<dyn CommBus>)?;

    let table_config = ClientTableConfig {
        table_info: TableInfo {
            table_staleness: args.staleness,
            row_capacity: args.row_capacity,
            dense_row_oplog_capacity: args.row_capacity,
            ..TableInfo::default()
        },
        ..ClientTableConfig::default()
    };
    group.create_table(WORKLOAD_TABLE_ID, table_config)?;
    group.create_table_done()?;

    let start = Instant::now();
    let threads = (0..args.num_app_threads)
        .map(|_| group.register_thread())
        .collect::<Result<Vec<_>, _>>()?;
    let workers = threads
        .into_iter()
        .map(|mut thread| {
            let args = args.clone();
            std::thread::Builder::new()
                .name(format!("app-{}", thread.thread_id()))
                .spawn(move || -> Result<f32> {
                    let deltas = vec![1.0; args.row_capacity];
                    for _ in 0..args.num_iterations {
                        for row_id in 0..args.num_rows {
                            thread.dense_batch_inc(WORKLOAD_TABLE_ID, row_id, 0, &deltas)?;
                        }
                        thread.clock_tick()?;
                    }
                    thread.global_barrier()?;
                    Ok(thread.get(WORKLOAD_TABLE_ID, 0)?.get(0))
                })
                .context("spawning application thread")
        })
        .collect::<Result<Vec<_>>>()?;

    for worker in workers {
        let value = worker
            .join()
            .map_err(|_| anyhow::anyhow!("application thread panicked"))??;
        info!("row 0 column 0 reads {}", value);
    }
    info!(
        "workload finished in {}; {} moved between threads",
        humantime::format_duration(start.elapsed()),
        ByteSize::b(bus.in_proc_bytes() + bus.inter_proc_bytes())
    );

    group.shutdown();
    Ok(())
}
