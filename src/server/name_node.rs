use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::bail;
use anyhow::Result;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::comm_bus::BusInbox;
use crate::comm_bus::CommBus;
use crate::comm_bus::Envelope;
use crate::config_models::entity_id::all_server_ids;
use crate::config_models::entity_id::bg_thread_id;
use crate::config_models::entity_id::head_bg_id;
use crate::config_models::entity_id::is_bg_thread;
use crate::config_models::entity_id::name_node_id;
use crate::config_models::entity_id::EntityId;
use crate::config_models::PsConfig;
use crate::protocol::PsMsg;

#[derive(Debug, Default)]
struct CreateTableState {
    num_servers_replied: usize,

    /// Head bg workers that asked for the table.
    requesters: BTreeSet<EntityId>,
    replied: BTreeSet<EntityId>,
}

/// Sequences cluster start-up, table creation and shutdown.
///
/// A table is created on every server once; each client's request is answered
/// only after all servers acknowledged it.
#[derive(Debug)]
pub(crate) struct NameNodeThread {
    config: Arc<PsConfig>,
    bus: Arc<dyn CommBus>,
    server_ids: Vec<EntityId>,
    bg_ids: Vec<EntityId>,
    tables: BTreeMap<i32, CreateTableState>,
    num_tables_done: usize,
    num_shut_down_bgs: usize,
}

impl NameNodeThread {
    pub(crate) fn new(config: Arc<PsConfig>, bus: Arc<dyn CommBus>) -> Self {
        let num_channels = config.num_comm_channels_per_client;
        let server_ids = all_server_ids(config.num_clients, num_channels);
        let bg_ids = (0..config.num_clients)
            .flat_map(|c| (0..num_channels).map(move |ch| bg_thread_id(c, ch)))
            .collect();
        Self {
            config,
            bus,
            server_ids,
            bg_ids,
            tables: BTreeMap::new(),
            num_tables_done: 0,
            num_shut_down_bgs: 0,
        }
    }

    pub(crate) fn spawn(self, inbox: BusInbox) -> Result<JoinHandle<()>> {
        let handle = std::thread::Builder::new()
            .name("name-node".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        error!("name node: cannot build runtime: {}", err);
                        return;
                    }
                };
                if let Err(err) = runtime.block_on(self.run(inbox)) {
                    error!("name node stopped: {:?}", err);
                }
            })?;
        Ok(handle)
    }

    fn send(&self, to: EntityId, msg: &PsMsg) -> Result<()> {
        trace!("name node -> {}: {}", to, msg);
        self.bus.send_msg(name_node_id(), to, msg)?;
        Ok(())
    }

    async fn init(&mut self, inbox: &mut BusInbox) -> Result<Vec<Envelope>> {
        let mut num_servers = 0;
        let mut num_bgs = 0;
        let mut early = vec![];
        while num_servers < self.server_ids.len() || num_bgs < self.bg_ids.len() {
            let Some(envelope) = inbox.recv().await else {
                bail!("name node inbox closed during init");
            };
            match envelope.decode()? {
                PsMsg::ServerConnect => num_servers += 1,
                PsMsg::ClientConnect { .. } if is_bg_thread(envelope.from) => num_bgs += 1,
                _ => early.push(envelope),
            }
        }
        for bg_id in &self.bg_ids {
            self.send(*bg_id, &PsMsg::ClientStart)?;
        }
        info!(
            "name node started: {} servers, {} bg workers",
            num_servers, num_bgs
        );
        Ok(early)
    }

    async fn run(mut self, mut inbox: BusInbox) -> Result<()> {
        for envelope in self.init(&mut inbox).await? {
            if self.handle_msg(envelope)? {
                return Ok(());
            }
        }
        while let Some(envelope) = inbox.recv().await {
            if self.handle_msg(envelope)? {
                info!("name node shut down");
                return Ok(());
            }
        }
        bail!("name node inbox closed")
    }

    fn handle_msg(&mut self, envelope: Envelope) -> Result<bool> {
        let from = envelope.from;
        let msg = envelope.decode()?;
        trace!("name node <- {}: {}", from, msg);
        match msg {
            PsMsg::CreateTable {
                table_id,
                table_info,
            } => {
                let is_new = !self.tables.contains_key(&table_id);
                self.tables.entry(table_id).or_default().requesters.insert(from);
                if is_new {
                    debug!("name node: creating table {} on all servers", table_id);
                    let msg = PsMsg::CreateTable {
                        table_id,
                        table_info,
                    };
                    for server_id in &self.server_ids {
                        self.send(*server_id, &msg)?;
                    }
                }
                self.reply_create_table(table_id)?;
            }
            PsMsg::CreateTableReply { table_id } => {
                let Some(state) = self.tables.get_mut(&table_id) else {
                    bail!("name node: reply for unknown table {}", table_id);
                };
                state.num_servers_replied += 1;
                self.reply_create_table(table_id)?;
            }
            PsMsg::ClientShutDown => {
                self.num_shut_down_bgs += 1;
                if self.num_shut_down_bgs == self.bg_ids.len() {
                    for bg_id in &self.bg_ids {
                        self.send(*bg_id, &PsMsg::ServerShutDownAck)?;
                    }
                    return Ok(true);
                }
            }
            other => warn!("name node: unexpected {} from {}", other, from),
        }
        Ok(false)
    }

    /// Answer pending requesters once every server created the table, and
    /// announce the end of table creation once every table is done.
    fn reply_create_table(&mut self, table_id: i32) -> Result<()> {
        let num_servers = self.server_ids.len();
        let num_clients = usize::try_from(self.config.num_clients)?;
        let Some(state) = self.tables.get_mut(&table_id) else {
            return Ok(());
        };
        if state.num_servers_replied < num_servers {
            return Ok(());
        }
        let pending: Vec<EntityId> = state.requesters.difference(&state.replied).copied().collect();
        state.replied.extend(pending.iter().copied());
        let done = !pending.is_empty() && state.replied.len() == num_clients;
        for requester in pending {
            self.send(requester, &PsMsg::CreateTableReply { table_id })?;
        }
        if done {
            self.num_tables_done += 1;
            debug!(
                "name node: table {} created, {} of {} tables done",
                table_id, self.num_tables_done, self.config.num_tables
            );
            if self.num_tables_done == usize::try_from(self.config.num_tables)? {
                for client_id in 0..self.config.num_clients {
                    self.send(head_bg_id(client_id), &PsMsg::CreatedAllTables)?;
                }
            }
        }
        Ok(())
    }
}
