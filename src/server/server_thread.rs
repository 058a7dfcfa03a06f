use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::bail;
use anyhow::Result;
use bytesize::ByteSize;
use tokio::select;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;
use tracing::warn;

use super::server::Server;
use crate::comm_bus::BusInbox;
use crate::comm_bus::CommBus;
use crate::comm_bus::Envelope;
use crate::config_models::entity_id::name_node_id;
use crate::config_models::entity_id::EntityId;
use crate::config_models::ConsistencyModel;
use crate::config_models::PsConfig;
use crate::errors::PsError;
use crate::protocol::MsgTracker;
use crate::protocol::PsMsg;
use crate::util_types::comm_pacer::BandwidthPacer;
use crate::util_types::comm_pacer::CommPacer;
use crate::util_types::comm_pacer::NoPacer;

/// Loop of one server thread: handshake with the name node and the bg
/// workers of its channel, then serve tables until every bg worker shut down.
#[derive(Debug)]
pub(crate) struct ServerThread {
    id: EntityId,
    config: Arc<PsConfig>,
    bus: Arc<dyn CommBus>,
    server: Server,
    tracker: MsgTracker,
    pacer: Box<dyn CommPacer>,
    num_shut_down_bgs: usize,
}

impl ServerThread {
    pub(crate) fn new(id: EntityId, config: Arc<PsConfig>, bus: Arc<dyn CommBus>) -> Self {
        let server = Server::new(id, config.clone());
        let mut tracker = MsgTracker::new(config.max_pending_msgs, config.max_pending_acks);
        for bg_id in server.bg_ids() {
            tracker.add_entity(*bg_id);
        }
        let pacer: Box<dyn CommPacer> = match config.consistency_model {
            ConsistencyModel::SspAggr => Box::new(BandwidthPacer::new(config.bandwidth_mbps)),
            _ => Box::new(NoPacer),
        };
        Self {
            id,
            config,
            bus,
            server,
            tracker,
            pacer,
            num_shut_down_bgs: 0,
        }
    }

    /// Run on a dedicated OS thread with its own single-threaded runtime.
    pub(crate) fn spawn(self, inbox: BusInbox) -> Result<JoinHandle<()>> {
        let id = self.id;
        let handle = std::thread::Builder::new()
            .name(format!("server-{}", id))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        error!("server {}: cannot build runtime: {}", id, err);
                        return;
                    }
                };
                if let Err(err) = runtime.block_on(self.run(inbox)) {
                    error!("server {} stopped: {:?}", id, err);
                }
            })?;
        Ok(handle)
    }

    fn send(&self, to: EntityId, msg: &PsMsg) -> Result<usize> {
        trace!("server {} -> {}: {}", self.id, to, msg);
        Ok(self.bus.send_msg(self.id, to, msg)?)
    }

    /// Connect to the name node, wait for every bg worker of the channel and
    /// let them start. Returns messages that arrived early.
    async fn init(&mut self, inbox: &mut BusInbox) -> Result<Vec<Envelope>> {
        self.send(name_node_id(), &PsMsg::ServerConnect)?;
        let mut connected = 0;
        let mut early = vec![];
        while connected < self.server.bg_ids().len() {
            let Some(envelope) = inbox.recv().await else {
                bail!("server {} inbox closed during init", self.id);
            };
            match envelope.decode()? {
                PsMsg::ClientConnect { client_id } => {
                    debug!("server {}: client {} connected", self.id, client_id);
                    connected += 1;
                }
                _ => early.push(envelope),
            }
        }
        for bg_id in self.server.bg_ids().to_vec() {
            self.send(bg_id, &PsMsg::ClientStart)?;
        }
        info!("server {} started", self.id);
        Ok(early)
    }

    async fn run(mut self, mut inbox: BusInbox) -> Result<()> {
        let early = self.init(&mut inbox).await?;
        for envelope in early {
            if self.handle_msg(envelope)? {
                return Ok(());
            }
        }

        loop {
            let idle = Duration::from_millis(self.reset_idle_milli());
            select! {
                msg = inbox.recv() => {
                    let Some(envelope) = msg else {
                        bail!("server {} inbox closed", self.id);
                    };
                    if self.handle_msg(envelope)? {
                        break;
                    }
                }
                _ = tokio::time::sleep(idle) => {
                    #[cfg(feature = "log-idle-loops")]
                    trace!("server {} idle after {:?}", self.id, idle);
                    self.server_idle_work()?;
                }
            }
        }
        info!("server {} shut down", self.id);
        Ok(())
    }

    /// Handle one message. Returns true once the thread should exit.
    fn handle_msg(&mut self, envelope: Envelope) -> Result<bool> {
        let from = envelope.from;
        let msg = envelope.decode()?;
        trace!("server {} <- {}: {}", self.id, from, msg);
        match msg {
            PsMsg::CreateTable {
                table_id,
                table_info,
            } => {
                match self.server.create_table(table_id, table_info) {
                    Ok(()) => {}
                    Err(PsError::TableExists(table_id)) => {
                        warn!("server {}: table {} created twice", self.id, table_id);
                    }
                    Err(err) => return Err(err.into()),
                }
                self.send(name_node_id(), &PsMsg::CreateTableReply { table_id })?;
            }
            PsMsg::RowRequest {
                table_id,
                row_id,
                clock,
            } => {
                if let Some(reply) = self.server.handle_row_request(from, table_id, row_id, clock)? {
                    self.send(from, &reply)?;
                }
            }
            PsMsg::ClientSendOpLog {
                seq,
                is_clock,
                clock,
                version,
                oplog,
            } => self.handle_oplog(from, seq, is_clock, clock, version, &oplog)?,
            PsMsg::BgPushRowAck { ack_seq } => self.tracker.recv_ack(from, ack_seq),
            PsMsg::ClientShutDown => {
                self.num_shut_down_bgs += 1;
                debug!(
                    "server {}: {} of {} bg workers shut down",
                    self.id,
                    self.num_shut_down_bgs,
                    self.server.bg_ids().len()
                );
                if self.num_shut_down_bgs == self.server.bg_ids().len() {
                    for bg_id in self.server.bg_ids().to_vec() {
                        self.send(bg_id, &PsMsg::ServerShutDownAck)?;
                    }
                    return Ok(true);
                }
            }
            other => warn!("server {}: unexpected {} from {}", self.id, other, from),
        }
        Ok(false)
    }

    fn handle_oplog(
        &mut self,
        from: EntityId,
        seq: u64,
        is_clock: bool,
        clock: i32,
        version: i32,
        oplog: &[u8],
    ) -> Result<()> {
        let num_rows = self.server.apply_oplog(from, version, oplog)?;
        debug!(
            "server {}: applied {} rows ({}) from {}, version {}",
            self.id,
            num_rows,
            ByteSize(oplog.len() as u64),
            from,
            version
        );
        let ack_due = self.tracker.recv_msg(from, seq);
        let new_clock = if is_clock {
            self.server.clock_until(from, clock)
        } else {
            None
        };
        if ack_due || is_clock {
            self.tracker.ack_all(from);
            self.send(from, &PsMsg::ServerOpLogAck { ack_seq: seq, version })?;
        }
        if let Some(new_clock) = new_clock {
            self.on_clock_advanced(new_clock)?;
        }
        Ok(())
    }

    fn on_clock_advanced(&mut self, new_clock: i32) -> Result<()> {
        debug!("server {} clock advanced to {}", self.id, new_clock);
        for (bg_id, reply) in self.server.take_ready_requests()? {
            self.send(bg_id, &reply)?;
        }
        if self.config.consistency_model.pushes_rows() {
            self.server_push_row(true, usize::MAX)?;
        }
        Ok(())
    }

    /// Push dirty subscribed rows. Clock pushes go to every bg worker of the
    /// channel, rows or not, so their view of the server clock advances.
    fn server_push_row(&mut self, is_clock: bool, row_limit: usize) -> Result<()> {
        let mut payloads = self.server.create_push_rows(row_limit);
        let clock = self.server.clock();
        let mut num_bytes = 0;
        for bg_id in self.server.bg_ids().to_vec() {
            let payload = payloads.remove(&bg_id);
            if payload.is_none() && !is_clock {
                continue;
            }
            let rows = payload.unwrap_or_default().encode();
            let seq = self.tracker.inc_get_seq(bg_id);
            let msg = PsMsg::ServerPushRow {
                version: self.server.bg_version(bg_id),
                seq,
                is_clock,
                clock,
                rows,
            };
            num_bytes += self.send(bg_id, &msg)?;
        }
        self.pacer.on_sent(num_bytes);
        Ok(())
    }

    fn reset_idle_milli(&self) -> u64 {
        self.pacer.idle_millis(self.config.server_idle_milli.max(1))
    }

    /// Early pushes of the aggregating model, paced by bandwidth and gated
    /// by the in-flight window.
    fn server_idle_work(&mut self) -> Result<()> {
        if self.config.consistency_model != ConsistencyModel::SspAggr {
            return Ok(());
        }
        if !self.pacer.allow_send()
            || !self.tracker.check_send_all()
            || self.server.num_dirty_subscribed_rows() == 0
        {
            return Ok(());
        }
        self.server_push_row(false, self.config.server_push_row_upper_bound.max(1))
    }
}
