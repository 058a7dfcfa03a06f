//! Server side of the runtime: the authoritative rows, the threads serving
//! them, and the name node sequencing the cluster.

pub mod name_node;
#[allow(clippy::module_inception)]
pub mod server;
pub mod server_table;
pub mod server_thread;
pub mod snapshot;

use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::error;

use self::name_node::NameNodeThread;
use self::server_thread::ServerThread;
use crate::comm_bus::CommBus;
use crate::config_models::entity_id::name_node_id;
use crate::config_models::entity_id::server_thread_id;
use crate::config_models::PsConfig;
use crate::errors::PsError;
use crate::errors::PsResult;

/// The server threads of one client process, plus the name node when the
/// process is client 0.
#[derive(Debug)]
pub struct ServerThreadGroup {
    handles: Vec<JoinHandle<()>>,
}

impl ServerThreadGroup {
    /// Register every inbox, then spawn the threads.
    pub fn start(config: Arc<PsConfig>, bus: Arc<dyn CommBus>) -> PsResult<Self> {
        let mut threads = vec![];
        if config.client_id == 0 {
            let inbox = bus.register(name_node_id())?;
            threads.push((None, inbox));
        }
        for channel in 0..config.num_comm_channels_per_client {
            let id = server_thread_id(config.client_id, channel);
            threads.push((Some(id), bus.register(id)?));
        }

        let mut handles = vec![];
        for (id, inbox) in threads {
            let spawned = match id {
                None => NameNodeThread::new(config.clone(), bus.clone()).spawn(inbox),
                Some(id) => ServerThread::new(id, config.clone(), bus.clone()).spawn(inbox),
            };
            handles.push(spawned.map_err(|err| PsError::Thread(err.to_string()))?);
        }
        Ok(Self { handles })
    }

    /// Wait for every thread; they exit after the shutdown handshake.
    pub fn join(self) {
        for handle in self.handles {
            let name = handle.thread().name().unwrap_or("server").to_string();
            if handle.join().is_err() {
                error!("{} panicked", name);
            }
        }
    }
}
