use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use parking_lot::RwLock;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::app_thread::AppThread;
use super::client_table::ClientTable;
use crate::bg_worker::BgWorkerGroup;
use crate::comm_bus::CommBus;
use crate::config_models::entity_id::app_thread_id;
use crate::config_models::entity_id::EntityId;
use crate::config_models::ClientTableConfig;
use crate::config_models::PsConfig;
use crate::consistency::create_controller;
use crate::consistency::ConsistencyController;
use crate::errors::PsError;
use crate::errors::PsResult;
use crate::server::ServerThreadGroup;
use crate::util_types::VectorClockMt;

/// A table together with the controller enforcing its consistency model.
#[derive(Debug, Clone)]
pub(crate) struct TableHandle {
    pub(crate) table: Arc<ClientTable>,
    pub(crate) controller: Arc<dyn ConsistencyController>,
}

/// Entry point of a client process: owns its server threads, bg workers and
/// tables, and tracks the clocks of its application threads.
///
/// Lifecycle: [`TableGroup::init`], [`TableGroup::create_table`] for every
/// table, [`TableGroup::create_table_done`], then application threads call
/// [`TableGroup::register_thread`] and work through their [`AppThread`].
/// [`TableGroup::shutdown`] once every thread is done.
#[derive(Debug)]
pub struct TableGroup {
    config: Arc<PsConfig>,
    bg: Arc<BgWorkerGroup>,
    servers: Mutex<Option<ServerThreadGroup>>,
    tables: RwLock<BTreeMap<i32, TableHandle>>,
    max_staleness: AtomicI32,
    app_clocks: VectorClockMt,

    /// Last clock shipped to the bg workers.
    process_clock: AtomicI32,
    next_thread_idx: AtomicI32,
    shut_down: AtomicBool,
}

impl TableGroup {
    /// Start the server threads (and the name node on client 0) and the bg
    /// workers of this process on `bus`.
    pub fn init(config: PsConfig, bus: Arc<dyn CommBus>) -> PsResult<Arc<Self>> {
        config.validate()?;
        let config = Arc::new(config);
        let servers = ServerThreadGroup::start(config.clone(), bus.clone())?;
        let bg = Arc::new(BgWorkerGroup::start(config.clone(), bus)?);
        info!(
            "client {} of {} started: {} channels, {} model",
            config.client_id,
            config.num_clients,
            config.num_comm_channels_per_client,
            config.consistency_model
        );
        Ok(Arc::new(Self {
            config,
            bg,
            servers: Mutex::new(Some(servers)),
            tables: RwLock::new(BTreeMap::new()),
            max_staleness: AtomicI32::new(0),
            app_clocks: VectorClockMt::new(),
            process_clock: AtomicI32::new(0),
            next_thread_idx: AtomicI32::new(0),
            shut_down: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &PsConfig {
        &self.config
    }

    pub fn bg(&self) -> &BgWorkerGroup {
        &self.bg
    }

    /// Create `table_id` on every server. Blocks until all servers have it.
    pub fn create_table(&self, table_id: i32, table_config: ClientTableConfig) -> PsResult<()> {
        if self.tables.read().contains_key(&table_id) {
            return Err(PsError::TableExists(table_id));
        }
        let table = Arc::new(ClientTable::new(table_id, table_config, &self.config)?);
        self.bg.register_table(table.clone());
        self.bg.create_table(table_id, table.info().clone())?;

        self.max_staleness
            .fetch_max(table.staleness(), Ordering::AcqRel);
        let controller = create_controller(&self.config, table.clone(), self.bg.clone());
        self.tables
            .write()
            .insert(table_id, TableHandle { table, controller });
        debug!("client {}: table {} created", self.config.client_id, table_id);
        Ok(())
    }

    /// Block until every client created every table.
    pub fn create_table_done(&self) -> PsResult<()> {
        self.bg.wait_created_all_tables()
    }

    pub fn num_tables(&self) -> usize {
        self.tables.read().len()
    }

    pub fn max_staleness(&self) -> i32 {
        self.max_staleness.load(Ordering::Acquire)
    }

    /// Register an application thread. It starts at the current clock of
    /// the process.
    pub fn register_thread(self: &Arc<Self>) -> PsResult<AppThread> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(PsError::ShutDown);
        }
        let idx = self.next_thread_idx.fetch_add(1, Ordering::AcqRel);
        let thread_id = app_thread_id(self.config.client_id, idx);
        let clock = self
            .app_clocks
            .get_min_clock()
            .max(self.process_clock.load(Ordering::Acquire));
        self.app_clocks.add_clock(thread_id, clock);
        debug!("thread {} registered at clock {}", thread_id, clock);
        Ok(AppThread::new(self.clone(), thread_id, clock))
    }

    pub(crate) fn table_handle(&self, table_id: i32) -> PsResult<TableHandle> {
        self.tables
            .read()
            .get(&table_id)
            .cloned()
            .ok_or(PsError::UnknownTable(table_id))
    }

    pub(crate) fn table_handles(&self) -> Vec<TableHandle> {
        self.tables.read().values().cloned().collect()
    }

    /// Tick the clock of `thread_id`. When it was the slowest thread of the
    /// process, the bg workers ship the oplogs of the new clock.
    pub(crate) fn clock_thread(&self, thread_id: EntityId) -> PsResult<()> {
        if self.app_clocks.get_clock(thread_id).is_none() {
            return Err(PsError::ThreadNotRegistered);
        }
        if let Some(new_min) = self.app_clocks.tick(thread_id) {
            debug!("process clock advanced to {}", new_min);
            self.process_clock.fetch_max(new_min, Ordering::AcqRel);
            self.bg.clock_all_tables(new_min)?;
        }
        Ok(())
    }

    pub(crate) fn deregister_thread(&self, thread_id: EntityId) {
        if let Some(new_min) = self.app_clocks.remove_clock(thread_id) {
            self.process_clock.fetch_max(new_min, Ordering::AcqRel);
            if let Err(err) = self.bg.clock_all_tables(new_min) {
                warn!("thread {} deregistered after shutdown: {}", thread_id, err);
            }
        }
        debug!("thread {} deregistered", thread_id);
    }

    /// Stop the bg workers through their shutdown handshake, then wait for
    /// the server threads and the name node. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.bg.shutdown();
        if let Some(servers) = self.servers.lock().take() {
            servers.join();
        }
        info!("client {} shut down", self.config.client_id);
    }
}
