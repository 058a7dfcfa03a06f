use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::bail;
use anyhow::Result;
use bytesize::ByteSize;
use tokio::select;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;
use tracing::warn;

use super::channel::AppToBg;
use super::row_request_oplog_mgr::RowRequestOpLogMgr;
use super::BgShared;
use crate::client::ClientTable;
use crate::comm_bus::BusInbox;
use crate::comm_bus::CommBus;
use crate::comm_bus::Envelope;
use crate::config_models::entity_id::name_node_id;
use crate::config_models::entity_id::server_for_row;
use crate::config_models::entity_id::server_ids_for_channel;
use crate::config_models::entity_id::EntityId;
use crate::config_models::ConsistencyModel;
use crate::config_models::PsConfig;
use crate::errors::PsResult;
use crate::oplog::bg_oplog::max_row_payload_size;
use crate::oplog::bg_oplog::row_payload_size;
use crate::oplog::AppendOnlyRowOpLogBuffer;
use crate::oplog::BgOpLog;
use crate::oplog::OpLogPartition;
use crate::oplog_meta::TableOpLogMeta;
use crate::protocol::MsgTracker;
use crate::protocol::PsMsg;
use crate::row::Row;
use crate::row::RowAccessor;
use crate::server::server_table::decode_row;
use crate::server::server_table::decode_rows;
use crate::util_types::comm_pacer::BandwidthPacer;
use crate::util_types::comm_pacer::CommPacer;
use crate::util_types::comm_pacer::NoPacer;

/// Replay state of one append-only table on this channel.
#[derive(Debug)]
struct AppendOnlyReplay {
    /// Updates replayed from buffers, not yet sent.
    unsent: AppendOnlyRowOpLogBuffer,
    num_buffers: i32,

    /// Replayed updates not yet mirrored into cached rows.
    unapplied: Vec<(i32, Vec<(i32, f32)>)>,
}

/// Loop of one bg worker: ships the oplogs of its channel to the servers,
/// fetches rows for application threads and applies rows pushed by servers.
#[derive(Debug)]
pub(crate) struct BgWorker {
    id: EntityId,
    channel: i32,
    config: Arc<PsConfig>,
    bus: Arc<dyn CommBus>,
    shared: Arc<BgShared>,
    server_ids: Vec<EntityId>,
    tracker: MsgTracker,
    pacer: Box<dyn CommPacer>,

    /// Version of the last oplog batch sent.
    version: i32,
    clock: i32,

    /// Clock reported to the servers: every update of earlier clocks was
    /// sent. Trails `clock` when the aggregating model holds updates back.
    pushed_clock: i32,
    row_requests: RowRequestOpLogMgr,
    table_metas: HashMap<i32, TableOpLogMeta>,
    append_replays: HashMap<i32, AppendOnlyReplay>,
    pending_creates: HashMap<i32, oneshot::Sender<PsResult<()>>>,

    shutting_down: bool,
    num_shutdown_acks: usize,
}

impl BgWorker {
    pub(crate) fn new(
        id: EntityId,
        channel: i32,
        config: Arc<PsConfig>,
        bus: Arc<dyn CommBus>,
        shared: Arc<BgShared>,
    ) -> Self {
        let server_ids = server_ids_for_channel(channel, config.num_clients);
        let mut tracker = MsgTracker::new(config.max_pending_msgs, config.max_pending_acks);
        for server_id in &server_ids {
            tracker.add_entity(*server_id);
        }
        let pacer: Box<dyn CommPacer> = match config.consistency_model {
            ConsistencyModel::SspAggr => Box::new(BandwidthPacer::new(config.bandwidth_mbps)),
            _ => Box::new(NoPacer),
        };
        Self {
            id,
            channel,
            config,
            bus,
            shared,
            server_ids,
            tracker,
            pacer,
            version: 0,
            clock: 0,
            pushed_clock: 0,
            row_requests: RowRequestOpLogMgr::new(),
            table_metas: HashMap::new(),
            append_replays: HashMap::new(),
            pending_creates: HashMap::new(),
            shutting_down: false,
            num_shutdown_acks: 0,
        }
    }

    pub(crate) fn spawn(
        self,
        inbox: BusInbox,
        commands: mpsc::UnboundedReceiver<AppToBg>,
    ) -> Result<JoinHandle<()>> {
        let id = self.id;
        let handle = std::thread::Builder::new()
            .name(format!("bg-{}", id))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        error!("bg worker {}: cannot build runtime: {}", id, err);
                        return;
                    }
                };
                if let Err(err) = runtime.block_on(self.run(inbox, commands)) {
                    error!("bg worker {} stopped: {:?}", id, err);
                }
            })?;
        Ok(handle)
    }

    fn send(&self, to: EntityId, msg: &PsMsg) -> Result<usize> {
        trace!("bg {} -> {}: {}", self.id, to, msg);
        Ok(self.bus.send_msg(self.id, to, msg)?)
    }

    fn table(&self, table_id: i32) -> Option<Arc<ClientTable>> {
        self.shared.table(table_id)
    }

    /// Connect to the name node and the servers of the channel, then wait
    /// until all of them let this worker start.
    async fn init(&mut self, inbox: &mut BusInbox) -> Result<Vec<Envelope>> {
        let connect = PsMsg::ClientConnect {
            client_id: self.config.client_id,
        };
        self.send(name_node_id(), &connect)?;
        for server_id in self.server_ids.clone() {
            self.send(server_id, &connect)?;
        }

        let expected = 1 + self.server_ids.len();
        let mut started = 0;
        let mut early = vec![];
        while started < expected {
            let Some(envelope) = inbox.recv().await else {
                bail!("bg worker {} inbox closed during init", self.id);
            };
            match envelope.decode()? {
                PsMsg::ClientStart => started += 1,
                _ => early.push(envelope),
            }
        }
        info!("bg worker {} started", self.id);
        Ok(early)
    }

    async fn run(
        mut self,
        mut inbox: BusInbox,
        mut commands: mpsc::UnboundedReceiver<AppToBg>,
    ) -> Result<()> {
        let result = self.serve(&mut inbox, &mut commands).await;
        self.row_requests.fail_all();
        self.shared.mark_shut_down();
        result
    }

    async fn serve(
        &mut self,
        inbox: &mut BusInbox,
        commands: &mut mpsc::UnboundedReceiver<AppToBg>,
    ) -> Result<()> {
        let early = self.init(inbox).await?;
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
                        bail!("bg worker {} inbox closed", self.id);
                    };
                    if self.handle_msg(envelope)? {
                        break;
                    }
                }
                Some(command) = commands.recv() => self.handle_command(command)?,
                _ = tokio::time::sleep(idle) => {
                    #[cfg(feature = "log-idle-loops")]
                    trace!("bg worker {} idle after {:?}", self.id, idle);
                    self.bg_idle_work()?;
                }
            }
        }
        info!("bg worker {} shut down", self.id);
        Ok(())
    }

    fn handle_command(&mut self, command: AppToBg) -> Result<()> {
        trace!("bg {} command {}", self.id, command);
        match command {
            AppToBg::CreateTable {
                table_id,
                table_info,
                reply,
            } => {
                self.pending_creates.insert(table_id, reply);
                self.send(
                    name_node_id(),
                    &PsMsg::CreateTable {
                        table_id,
                        table_info,
                    },
                )?;
            }
            AppToBg::RequestRow {
                table_id,
                row_id,
                clock,
                reply,
            } => self.request_row(table_id, row_id, clock, reply)?,
            AppToBg::ClockAllTables { clock } => {
                self.clock = clock;
                self.send_oplogs(true)?;
            }
            AppToBg::AppendBufferReady { table_id } => {
                if let Some(table) = self.table(table_id) {
                    self.replay_append_buffers(&table);
                }
            }
            AppToBg::ShutDown => {
                if self.shutting_down {
                    return Ok(());
                }
                self.shutting_down = true;
                debug!("bg worker {} shutting down", self.id);
                self.send(name_node_id(), &PsMsg::ClientShutDown)?;
                for server_id in self.server_ids.clone() {
                    self.send(server_id, &PsMsg::ClientShutDown)?;
                }
            }
        }
        Ok(())
    }

    fn request_row(
        &mut self,
        table_id: i32,
        row_id: i32,
        clock: i32,
        reply: oneshot::Sender<PsResult<RowAccessor>>,
    ) -> Result<()> {
        // A push or another reply may have cached the row meanwhile.
        if let Some(accessor) = self
            .table(table_id)
            .and_then(|table| table.storage().find(row_id))
            .filter(|accessor| accessor.clock() >= clock)
        {
            let _ = reply.send(Ok(accessor));
            return Ok(());
        }
        if self.row_requests.add_row_request(table_id, row_id, clock, reply) {
            self.send_row_request(table_id, row_id, clock)?;
        }
        Ok(())
    }

    fn send_row_request(&self, table_id: i32, row_id: i32, clock: i32) -> Result<()> {
        let server_id = self.server_of_row(row_id);
        self.send(
            server_id,
            &PsMsg::RowRequest {
                table_id,
                row_id,
                clock,
            },
        )?;
        Ok(())
    }

    fn server_of_row(&self, row_id: i32) -> EntityId {
        server_for_row(
            row_id,
            self.config.num_comm_channels_per_client,
            self.config.num_clients,
        )
    }

    /// Handle one message. Returns true once the shutdown handshake is done.
    fn handle_msg(&mut self, envelope: Envelope) -> Result<bool> {
        let from = envelope.from;
        let msg = envelope.decode()?;
        trace!("bg {} <- {}: {}", self.id, from, msg);
        match msg {
            PsMsg::CreateTableReply { table_id } => match self.pending_creates.remove(&table_id) {
                Some(reply) => {
                    let _ = reply.send(Ok(()));
                }
                None => warn!("bg worker {}: unexpected reply for table {}", self.id, table_id),
            },
            PsMsg::CreatedAllTables => self.shared.set_created_all_tables(),
            PsMsg::RowRequestReply {
                table_id,
                row_id,
                clock,
                version,
                row_data,
            } => self.handle_row_reply(from, table_id, row_id, clock, version, &row_data)?,
            PsMsg::ServerOpLogAck { ack_seq, version } => {
                self.tracker.recv_ack(from, ack_seq);
                self.row_requests.ack_oplog(from, version);
            }
            PsMsg::ServerPushRow {
                version,
                seq,
                is_clock,
                clock,
                rows,
            } => self.handle_push_row(from, version, seq, is_clock, clock, &rows)?,
            PsMsg::ServerShutDownAck => {
                self.num_shutdown_acks += 1;
                if self.num_shutdown_acks == 1 + self.server_ids.len() {
                    return Ok(true);
                }
            }
            other => warn!("bg worker {}: unexpected {} from {}", self.id, other, from),
        }
        Ok(false)
    }

    fn handle_row_reply(
        &mut self,
        from: EntityId,
        table_id: i32,
        row_id: i32,
        clock: i32,
        version: i32,
        row_data: &[u8],
    ) -> Result<()> {
        let Some(table) = self.table(table_id) else {
            bail!("bg worker {}: row reply for unknown table {}", self.id, table_id);
        };
        let mut buf = row_data;
        let (row, _) = decode_row(table.info(), &mut buf);
        let accessor = self.install_row(&table, from, version, row_id, clock, row);

        let (waiters, rerequest) = self.row_requests.take_satisfied(table_id, row_id, clock);
        for waiter in waiters {
            let _ = waiter.send(Ok(accessor.clone()));
        }
        if let Some(clock) = rerequest {
            self.send_row_request(table_id, row_id, clock)?;
        }
        Ok(())
    }

    fn handle_push_row(
        &mut self,
        from: EntityId,
        version: i32,
        seq: u64,
        is_clock: bool,
        clock: i32,
        rows: &[u8],
    ) -> Result<()> {
        let ack_due = self.tracker.recv_msg(from, seq);
        let shared = self.shared.clone();
        let decoded = decode_rows(rows, |table_id| {
            shared.table(table_id).map(|table| table.info().clone())
        })?;
        let num_rows = decoded.len();
        for row in decoded {
            if let Some(table) = self.table(row.table_id) {
                self.install_row(&table, from, version, row.row_id, clock, row.row);
            }
        }
        debug!(
            "bg worker {}: {} rows pushed by {} at clock {}",
            self.id, num_rows, from, clock
        );
        if is_clock {
            self.shared.update_server_clock(from, clock);
        }
        if ack_due && !self.shutting_down {
            self.tracker.ack_all(from);
            self.send(from, &PsMsg::BgPushRowAck { ack_seq: seq })?;
        }
        Ok(())
    }

    /// Install a server row, replaying the local updates the server had not
    /// applied when it produced the row.
    fn install_row(
        &mut self,
        table: &ClientTable,
        server_id: EntityId,
        version: i32,
        row_id: i32,
        clock: i32,
        row: Row,
    ) -> RowAccessor {
        let table_id = table.table_id();
        let row_requests = &self.row_requests;
        let mut append_replay = self.append_replays.get_mut(&table_id);
        let mirrors_appends = table.config().bg_apply_append_oplog_freq > 0;
        table.install_row(row_id, clock, row, |row| {
            if table.applies_inc_to_cache() || mirrors_appends {
                row_requests.replay_sent_oplogs(server_id, version, table_id, row_id, row);
            }
            if let Some(replay) = append_replay.as_mut().filter(|_| mirrors_appends) {
                if let Some(oplog) = replay.unsent.get_row_oplog(row_id) {
                    oplog.apply_to_row(row);
                }
                replay.unapplied.retain(|(unapplied_row, _)| *unapplied_row != row_id);
            }
        })
    }

    /// Replay every queued append-only buffer of `table` into row oplogs,
    /// mirroring them into cached rows every `bg_apply_append_oplog_freq`
    /// buffers.
    fn replay_append_buffers(&mut self, table: &ClientTable) {
        let Some(partition) = table.oplog().append_only_partition(self.channel) else {
            return;
        };
        let apply_freq = table.config().bg_apply_append_oplog_freq;
        let factory = *table.oplog().factory();
        let replay = self
            .append_replays
            .entry(table.table_id())
            .or_insert_with(|| AppendOnlyReplay {
                unsent: AppendOnlyRowOpLogBuffer::new(factory),
                num_buffers: 0,
                unapplied: vec![],
            });
        while let Some(buffer) = partition.take_buffer() {
            for (row_id, updates) in buffer.records() {
                replay.unsent.batch_inc(row_id, &updates);
                if apply_freq > 0 {
                    replay.unapplied.push((row_id, updates));
                }
            }
            partition.put_back_buffer(buffer);
            replay.num_buffers += 1;

            if apply_freq > 0 && replay.num_buffers % apply_freq == 0 {
                for (row_id, updates) in replay.unapplied.drain(..) {
                    if let Some(accessor) = table.storage().find(row_id) {
                        let mut row = accessor.client_row().write();
                        for (col, delta) in updates {
                            row.inc(col, delta);
                        }
                    }
                }
            }
        }
    }

    /// Collect the pending oplogs of every table on this channel into one
    /// batch per server.
    fn collect_clock_oplogs(&mut self) -> BTreeMap<EntityId, BgOpLog> {
        let num_channels = self.config.num_comm_channels_per_client;
        let num_clients = self.config.num_clients;
        let route = |row_id| server_for_row(row_id, num_channels, num_clients);
        let tables = self.shared.tables();
        let mut batches: BTreeMap<EntityId, BgOpLog> = BTreeMap::new();

        if self.config.consistency_model == ConsistencyModel::SspAggr {
            let clock_to_push = self.aggr_clock_to_push(&tables);
            let budget_bytes = self.config.oplog_push_upper_bound_kb * 1024;
            for table in &tables {
                let Some(partition) = table.oplog().partition(self.channel) else {
                    continue;
                };
                table.oplog_index().reset_partition(self.channel);
                let meta = table_meta(&mut self.table_metas, &self.config, table);
                collect_aggr_table_oplogs(
                    meta,
                    table,
                    partition,
                    clock_to_push,
                    budget_bytes,
                    route,
                    &mut batches,
                );
            }
            self.pushed_clock = self.pushed_clock.max(clock_to_push + 1);
            return batches;
        }

        for table in &tables {
            let table_id = table.table_id();
            if table.oplog().is_append_only() {
                self.replay_append_buffers(table);
                if let Some(replay) = self.append_replays.get_mut(&table_id) {
                    let dense = table.info().oplog_dense_serialized;
                    for (row_id, oplog) in replay.unsent.drain() {
                        batches.entry(route(row_id)).or_default().add_row_oplog(
                            table_id,
                            dense,
                            table.codec(),
                            row_id,
                            oplog,
                        );
                    }
                }
                continue;
            }

            let Some(partition) = table.oplog().partition(self.channel) else {
                continue;
            };
            for row_id in table.oplog_index().reset_partition(self.channel) {
                take_row_oplog(table, partition, row_id, route(row_id), &mut batches);
            }
        }
        self.pushed_clock = self.clock;
        batches
    }

    /// Last clock whose updates the aggregating model ships at clock time.
    /// Updates of later clocks wait for idle sends or a later clock, within
    /// `oplog_push_staleness_tolerance` of the tightest staleness bound.
    fn aggr_clock_to_push(&self, tables: &[Arc<ClientTable>]) -> i32 {
        let completed = self.clock - 1;
        let min_staleness = tables
            .iter()
            .map(|table| table.staleness())
            .min()
            .unwrap_or(0);
        (completed - min_staleness + self.config.oplog_push_staleness_tolerance).min(completed)
    }

    /// Ship the oplogs of the current clock. Every server of the channel gets
    /// a message, with or without updates, so its view of this worker's
    /// clock advances.
    fn send_oplogs(&mut self, is_clock: bool) -> Result<()> {
        let batches = self.collect_clock_oplogs();
        self.send_batches(batches, is_clock)
    }

    fn send_batches(
        &mut self,
        mut batches: BTreeMap<EntityId, BgOpLog>,
        is_clock: bool,
    ) -> Result<()> {
        self.version += 1;
        let mut num_bytes = 0;
        for server_id in self.server_ids.clone() {
            let batch = batches.remove(&server_id).unwrap_or_default();
            if batch.is_empty() && !is_clock {
                continue;
            }
            let seq = self.tracker.inc_get_seq(server_id);
            let msg = PsMsg::ClientSendOpLog {
                seq,
                is_clock,
                clock: self.pushed_clock,
                version: self.version,
                oplog: batch.serialize(),
            };
            num_bytes += self.send(server_id, &msg)?;
            if !batch.is_empty() {
                self.row_requests
                    .add_sent_oplog(server_id, self.version, batch);
            }
        }
        self.pacer.on_sent(num_bytes);
        debug!(
            "bg worker {}: sent version {} at clock {} ({})",
            self.id,
            self.version,
            self.pushed_clock,
            ByteSize(num_bytes as u64)
        );
        Ok(())
    }

    fn reset_idle_milli(&self) -> u64 {
        self.pacer.idle_millis(self.config.bg_idle_milli.max(1))
    }

    /// Early sends of the aggregating model: ship the most important pending
    /// row oplogs when the link and the in-flight window allow it.
    fn bg_idle_work(&mut self) -> Result<()> {
        if self.config.consistency_model != ConsistencyModel::SspAggr || self.shutting_down {
            return Ok(());
        }
        if !self.pacer.allow_send() || !self.tracker.check_send_all() {
            return Ok(());
        }

        let num_channels = self.config.num_comm_channels_per_client;
        let num_clients = self.config.num_clients;
        let route = |row_id| server_for_row(row_id, num_channels, num_clients);
        let budget_bytes = self.config.oplog_push_upper_bound_kb * 1024;
        let mut batches: BTreeMap<EntityId, BgOpLog> = BTreeMap::new();
        let mut num_rows = 0;
        for table in self.shared.tables() {
            let Some(partition) = table.oplog().partition(self.channel) else {
                continue;
            };
            let meta = table_meta(&mut self.table_metas, &self.config, &table);
            read_oplog_metas(meta, partition);
            let (sent, _) =
                send_by_importance(meta, &table, partition, budget_bytes, route, &mut batches);
            num_rows += sent;
        }
        if num_rows == 0 {
            return Ok(());
        }
        trace!("bg worker {}: early send of {} rows", self.id, num_rows);
        self.send_batches(batches, false)
    }
}

/// Scheduler of `table`'s row oplogs on one channel, created on first use.
fn table_meta<'a>(
    metas: &'a mut HashMap<i32, TableOpLogMeta>,
    config: &PsConfig,
    table: &ClientTable,
) -> &'a mut TableOpLogMeta {
    metas.entry(table.table_id()).or_insert_with(|| {
        TableOpLogMeta::new(
            config.update_sort_policy,
            table.config().oplog_capacity,
            config.row_candidate_factor,
        )
    })
}

/// Move the pending metas of the partition's row oplogs into `meta`.
fn read_oplog_metas(meta: &mut TableOpLogMeta, partition: &OpLogPartition) {
    for row_id in partition.row_ids() {
        if let Some(row_meta) = partition.get_invalidate_oplog_meta(row_id) {
            meta.insert_merge_row_oplog_meta(row_id, row_meta);
        }
    }
}

/// Move the row's oplog into the batch of `server_id`. Returns the payload
/// bytes it adds, `None` when the row has nothing to send.
fn take_row_oplog(
    table: &ClientTable,
    partition: &OpLogPartition,
    row_id: i32,
    server_id: EntityId,
    batches: &mut BTreeMap<EntityId, BgOpLog>,
) -> Option<usize> {
    let mut oplog = partition.get_erase_oplog(row_id)?;
    if oplog.clear_zeros_and_get_non_zero_size() == 0 {
        partition.recycle(oplog);
        return None;
    }
    let dense = table.info().oplog_dense_serialized;
    let num_bytes = row_payload_size(dense, table.codec(), &oplog);
    batches.entry(server_id).or_default().add_row_oplog(
        table.table_id(),
        dense,
        table.codec(),
        row_id,
        oplog,
    );
    Some(num_bytes)
}

/// Clock-time selection of the aggregating model for one table: every row
/// whose pending updates date from `clock_to_push` or earlier, then the most
/// important remaining rows while the batch stays under `budget_bytes`.
/// Shipped rows leave the scheduler. Returns the number of rows shipped.
fn collect_aggr_table_oplogs(
    meta: &mut TableOpLogMeta,
    table: &ClientTable,
    partition: &OpLogPartition,
    clock_to_push: i32,
    budget_bytes: usize,
    route: impl Fn(i32) -> EntityId,
    batches: &mut BTreeMap<EntityId, BgOpLog>,
) -> usize {
    read_oplog_metas(meta, partition);
    let mut num_rows = 0;
    let mut num_bytes = 0;
    if clock_to_push >= 0 {
        meta.init_get_upto_clock(clock_to_push);
        while let Some(row_id) = meta.get_and_clear_next_upto_clock() {
            if let Some(bytes) = take_row_oplog(table, partition, row_id, route(row_id), batches) {
                num_rows += 1;
                num_bytes += bytes;
            }
        }
    }
    let (topped_up, _) = send_by_importance(
        meta,
        table,
        partition,
        budget_bytes.saturating_sub(num_bytes),
        route,
        batches,
    );
    num_rows + topped_up
}

/// Drain `meta` in its policy's order until `budget_bytes` is spent. Returns
/// the rows and bytes added to `batches`.
fn send_by_importance(
    meta: &mut TableOpLogMeta,
    table: &ClientTable,
    partition: &OpLogPartition,
    budget_bytes: usize,
    route: impl Fn(i32) -> EntityId,
    batches: &mut BTreeMap<EntityId, BgOpLog>,
) -> (usize, usize) {
    if budget_bytes == 0 || meta.get_num_row_oplogs() == 0 {
        return (0, 0);
    }
    meta.prepare(rows_per_push(table, budget_bytes));
    let mut num_rows = 0;
    let mut num_bytes = 0;
    while num_bytes < budget_bytes {
        let Some(row_id) = meta.get_and_clear_next_in_order() else {
            break;
        };
        if let Some(bytes) = take_row_oplog(table, partition, row_id, route(row_id), batches) {
            num_rows += 1;
            num_bytes += bytes;
        }
    }
    (num_rows, num_bytes)
}

/// Rows of `table` that surely fit in `budget_bytes` of payload.
fn rows_per_push(table: &ClientTable, budget_bytes: usize) -> usize {
    let info = table.info();
    let num_cols = if info.oplog_dense_serialized {
        info.dense_row_oplog_capacity
    } else {
        info.row_capacity
    };
    let row_bytes = max_row_payload_size(info.oplog_dense_serialized, table.codec(), num_cols);
    (budget_bytes / row_bytes).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_models::ClientTableConfig;
    use crate::config_models::UpdateSortPolicy;
    use crate::oplog_meta::RowOpLogMeta;

    fn aggr_table() -> (PsConfig, ClientTable) {
        let config = PsConfig {
            consistency_model: ConsistencyModel::SspAggr,
            update_sort_policy: UpdateSortPolicy::RelativeMagnitude,
            num_comm_channels_per_client: 1,
            ..Default::default()
        };
        let table = ClientTable::new(0, ClientTableConfig::default(), &config).unwrap();
        (config, table)
    }

    fn inc_at(table: &ClientTable, row_id: i32, delta: f32, clock: i32) {
        table
            .oplog()
            .partition_of_row(row_id)
            .unwrap()
            .with_row_oplog(row_id, |oplog| {
                oplog.inc(0, delta);
                let meta = RowOpLogMeta::new(clock, f64::from(delta.abs()));
                oplog.meta_mut().unwrap().merge(&meta, true);
            });
    }

    fn shipped(batches: &BTreeMap<EntityId, BgOpLog>, row_id: i32) -> Option<f32> {
        batches
            .values()
            .find_map(|batch| batch.find_row_oplog(0, row_id))
            .and_then(|oplog| oplog.find(0))
    }

    #[test]
    fn clock_sends_hold_back_rows_of_later_clocks() {
        let (config, table) = aggr_table();
        inc_at(&table, 1, 1.0, 0);
        inc_at(&table, 2, 2.0, 1);
        inc_at(&table, 3, 50.0, 3);
        let partition = table.oplog().partition(0).unwrap();
        let mut metas = HashMap::new();

        let mut batches = BTreeMap::new();
        let meta = table_meta(&mut metas, &config, &table);
        let num_rows = collect_aggr_table_oplogs(meta, &table, partition, 1, 0, |_| 1, &mut batches);
        assert_eq!(2, num_rows);
        assert_eq!(Some(1.0), shipped(&batches, 1));
        assert_eq!(Some(2.0), shipped(&batches, 2));
        assert_eq!(None, shipped(&batches, 3));
        assert!(!meta.exists(1));
        assert!(!meta.exists(2));
        assert!(meta.exists(3));
        assert_eq!(vec![3], partition.row_ids());

        // a shipped row starts over with the clock of its next update
        inc_at(&table, 1, 0.25, 5);
        let mut batches = BTreeMap::new();
        let meta = table_meta(&mut metas, &config, &table);
        let num_rows = collect_aggr_table_oplogs(meta, &table, partition, 2, 0, |_| 1, &mut batches);
        assert_eq!(0, num_rows);
        assert!(batches.is_empty());

        let mut batches = BTreeMap::new();
        let meta = table_meta(&mut metas, &config, &table);
        let num_rows = collect_aggr_table_oplogs(meta, &table, partition, 5, 0, |_| 1, &mut batches);
        assert_eq!(2, num_rows);
        assert_eq!(Some(0.25), shipped(&batches, 1));
        assert_eq!(Some(50.0), shipped(&batches, 3));
        assert!(partition.row_ids().is_empty());
    }

    #[test]
    fn clock_sends_top_up_by_importance_within_budget() {
        let (config, table) = aggr_table();
        inc_at(&table, 1, 1.0, 0);
        inc_at(&table, 5, 9.0, 4);
        inc_at(&table, 6, 0.5, 4);
        let partition = table.oplog().partition(0).unwrap();
        let mut metas = HashMap::new();
        let meta = table_meta(&mut metas, &config, &table);

        let one_row = max_row_payload_size(false, table.codec(), 1);
        let mut batches = BTreeMap::new();
        let num_rows =
            collect_aggr_table_oplogs(meta, &table, partition, 0, 2 * one_row, |_| 1, &mut batches);
        assert_eq!(2, num_rows);
        assert_eq!(Some(1.0), shipped(&batches, 1));
        assert_eq!(Some(9.0), shipped(&batches, 5));
        assert_eq!(None, shipped(&batches, 6));
        assert!(meta.exists(6));
        assert_eq!(vec![6], partition.row_ids());
    }

    #[test]
    fn push_budget_counts_whole_rows() {
        let (_, table) = aggr_table();
        let row_bytes = max_row_payload_size(false, table.codec(), table.info().row_capacity);
        assert_eq!(1, rows_per_push(&table, 0));
        assert_eq!(3, rows_per_push(&table, 3 * row_bytes + row_bytes / 2));
    }
}
