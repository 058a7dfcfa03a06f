//! Background workers: one per communication channel of a client process.
//!
//! Application threads never talk to servers. They hand commands to the bg
//! worker of the row's channel and block on the reply, or on the shared view
//! of the server clocks the workers maintain.

pub mod channel;
pub(crate) mod row_request_oplog_mgr;
pub(crate) mod worker;

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Condvar;
use parking_lot::Mutex;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;

pub use self::channel::RowReply;
use self::channel::AppToBg;
use self::worker::BgWorker;
use crate::client::ClientTable;
use crate::comm_bus::CommBus;
use crate::config_models::entity_id::all_server_ids;
use crate::config_models::entity_id::bg_thread_id;
use crate::config_models::entity_id::channel_for_row;
use crate::config_models::entity_id::EntityId;
use crate::config_models::PsConfig;
use crate::config_models::TableInfo;
use crate::errors::PsError;
use crate::errors::PsResult;
use crate::util_types::VectorClock;

/// Poll interval of blocking clock waits, bounding how late a cancellation
/// or shutdown is noticed.
const CLOCK_WAIT_POLL: Duration = Duration::from_millis(10);

/// State shared by the bg workers of a process and the application threads.
#[derive(Debug)]
pub(crate) struct BgShared {
    tables: RwLock<BTreeMap<i32, Arc<ClientTable>>>,

    /// Clock of every server as reported by its clock pushes.
    server_clock: Mutex<VectorClock>,
    server_clock_changed: Condvar,

    created_all_tables: Mutex<bool>,
    created_all_tables_cv: Condvar,

    shut_down: AtomicBool,
}

impl BgShared {
    fn new(config: &PsConfig) -> Self {
        Self {
            tables: RwLock::new(BTreeMap::new()),
            server_clock: Mutex::new(VectorClock::with_ids(all_server_ids(
                config.num_clients,
                config.num_comm_channels_per_client,
            ))),
            server_clock_changed: Condvar::new(),
            created_all_tables: Mutex::new(false),
            created_all_tables_cv: Condvar::new(),
            shut_down: AtomicBool::new(false),
        }
    }

    pub(crate) fn table(&self, table_id: i32) -> Option<Arc<ClientTable>> {
        self.tables.read().get(&table_id).cloned()
    }

    pub(crate) fn tables(&self) -> Vec<Arc<ClientTable>> {
        self.tables.read().values().cloned().collect()
    }

    pub(crate) fn update_server_clock(&self, server_id: EntityId, clock: i32) {
        let mut clocks = self.server_clock.lock();
        if let Some(new_min) = clocks.tick_until(server_id, clock) {
            debug!("system clock advanced to {}", new_min);
            self.server_clock_changed.notify_all();
        }
    }

    pub(crate) fn set_created_all_tables(&self) {
        *self.created_all_tables.lock() = true;
        self.created_all_tables_cv.notify_all();
    }

    pub(crate) fn mark_shut_down(&self) {
        self.shut_down.store(true, Ordering::Release);
        // Take the locks so no waiter misses the flag between its check and
        // its wait.
        drop(self.server_clock.lock());
        self.server_clock_changed.notify_all();
        drop(self.created_all_tables.lock());
        self.created_all_tables_cv.notify_all();
    }

    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

/// The bg workers of one client process.
#[derive(Debug)]
pub struct BgWorkerGroup {
    config: Arc<PsConfig>,
    shared: Arc<BgShared>,
    commands: Vec<mpsc::UnboundedSender<AppToBg>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl BgWorkerGroup {
    /// Register the inbox of every worker, then spawn them. They connect to
    /// the name node and their servers on their own.
    pub fn start(config: Arc<PsConfig>, bus: Arc<dyn CommBus>) -> PsResult<Self> {
        let shared = Arc::new(BgShared::new(&config));
        let mut workers = vec![];
        for channel in 0..config.num_comm_channels_per_client {
            let id = bg_thread_id(config.client_id, channel);
            workers.push((id, channel, bus.register(id)?));
        }

        let mut commands = vec![];
        let mut handles = vec![];
        for (id, channel, inbox) in workers {
            let (tx, rx) = mpsc::unbounded_channel();
            let worker = BgWorker::new(id, channel, config.clone(), bus.clone(), shared.clone());
            let handle = worker
                .spawn(inbox, rx)
                .map_err(|err| PsError::Thread(err.to_string()))?;
            commands.push(tx);
            handles.push(handle);
        }
        Ok(Self {
            config,
            shared,
            commands,
            handles: Mutex::new(handles),
        })
    }

    fn send_command(&self, channel: i32, command: AppToBg) -> PsResult<()> {
        let sender = usize::try_from(channel)
            .ok()
            .and_then(|channel| self.commands.get(channel))
            .ok_or(PsError::ShutDown)?;
        sender.send(command).map_err(|_| PsError::ShutDown)
    }

    pub(crate) fn register_table(&self, table: Arc<ClientTable>) {
        self.shared.tables.write().insert(table.table_id(), table);
    }

    pub fn table(&self, table_id: i32) -> Option<Arc<ClientTable>> {
        self.shared.table(table_id)
    }

    /// Create a table on every server through the head worker and the name
    /// node. Returns once all servers have it.
    pub fn create_table(&self, table_id: i32, table_info: TableInfo) -> PsResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send_command(
            0,
            AppToBg::CreateTable {
                table_id,
                table_info,
                reply,
            },
        )?;
        futures::executor::block_on(rx)?
    }

    /// Block until the name node reports every table of every client created.
    pub fn wait_created_all_tables(&self) -> PsResult<()> {
        let mut created = self.shared.created_all_tables.lock();
        while !*created {
            if self.shared.is_shut_down() {
                return Err(PsError::ShutDown);
            }
            self.shared
                .created_all_tables_cv
                .wait_for(&mut created, CLOCK_WAIT_POLL);
        }
        Ok(())
    }

    /// Ask the worker of the row's channel for a row at least as fresh as
    /// `clock`.
    pub fn request_row(&self, table_id: i32, row_id: i32, clock: i32) -> PsResult<RowReply> {
        let (reply, rx) = oneshot::channel();
        let channel = channel_for_row(row_id, self.config.num_comm_channels_per_client);
        self.send_command(
            channel,
            AppToBg::RequestRow {
                table_id,
                row_id,
                clock,
                reply,
            },
        )?;
        Ok(rx)
    }

    /// Every application thread reached `clock`: ship the oplogs of all
    /// tables on every channel.
    pub fn clock_all_tables(&self, clock: i32) -> PsResult<()> {
        for channel in 0..self.config.num_comm_channels_per_client {
            self.send_command(channel, AppToBg::ClockAllTables { clock })?;
        }
        Ok(())
    }

    pub fn append_buffer_ready(&self, table_id: i32, channel: i32) -> PsResult<()> {
        self.send_command(channel, AppToBg::AppendBufferReady { table_id })
    }

    /// Minimum clock over all servers, as seen through their pushes.
    pub fn system_clock(&self) -> i32 {
        self.shared.server_clock.lock().get_min_clock()
    }

    /// Block until every server reached `clock`.
    pub fn wait_system_clock(&self, clock: i32, cancel: Option<&CancellationToken>) -> PsResult<()> {
        let mut clocks = self.shared.server_clock.lock();
        loop {
            if clocks.get_min_clock() >= clock {
                return Ok(());
            }
            if self.shared.is_shut_down() {
                return Err(PsError::ShutDown);
            }
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                return Err(PsError::Cancelled);
            }
            self.shared
                .server_clock_changed
                .wait_for(&mut clocks, CLOCK_WAIT_POLL);
        }
    }

    /// Run the shutdown handshake of every worker and wait for them.
    pub fn shutdown(&self) {
        for sender in &self.commands {
            let _ = sender.send(AppToBg::ShutDown);
        }
        for handle in std::mem::take(&mut *self.handles.lock()) {
            let name = handle.thread().name().unwrap_or("bg").to_string();
            if handle.join().is_err() {
                error!("{} panicked", name);
            }
        }
        self.shared.mark_shut_down();
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn system_clock_waits_for_the_slowest_server() {
        let config = PsConfig {
            num_clients: 2,
            ..Default::default()
        };
        let shared = Arc::new(BgShared::new(&config));
        let servers = all_server_ids(2, 1);

        let waiter = {
            let shared = shared.clone();
            thread::spawn(move || {
                let mut clocks = shared.server_clock.lock();
                while clocks.get_min_clock() < 1 {
                    shared.server_clock_changed.wait(&mut clocks);
                }
                clocks.get_min_clock()
            })
        };
        shared.update_server_clock(servers[0], 3);
        shared.update_server_clock(servers[1], 1);
        assert_eq!(1, waiter.join().unwrap());
    }

    #[test]
    fn shut_down_is_observed_by_table_creation_waiters() {
        let shared = BgShared::new(&PsConfig::default());
        shared.mark_shut_down();
        assert!(shared.is_shut_down());
        shared.set_created_all_tables();
        assert!(*shared.created_all_tables.lock());
    }
}
