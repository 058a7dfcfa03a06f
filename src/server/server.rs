use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;
use tracing::warn;

use super::server_table::RowsPayload;
use super::server_table::ServerTable;
use super::snapshot;
use crate::config_models::entity_id::bg_ids_for_channel;
use crate::config_models::entity_id::bg_thread_id;
use crate::config_models::entity_id::channel_of;
use crate::config_models::entity_id::client_id_of;
use crate::config_models::entity_id::EntityId;
use crate::config_models::PsConfig;
use crate::config_models::TableInfo;
use crate::errors::PsError;
use crate::errors::PsResult;
use crate::oplog::bg_oplog::parse_bg_oplog;
use crate::oplog::UpdateCodec;
use crate::protocol::PsMsg;
use crate::util_types::VectorClock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingRowRequest {
    bg_id: EntityId,
    table_id: i32,
    row_id: i32,
}

/// State of one server thread: its share of every table, the clocks of the
/// bg workers feeding it, and row requests waiting for the clock to catch up.
///
/// Pure state machine; the server thread loop owns the I/O.
#[derive(Debug)]
pub struct Server {
    server_id: EntityId,
    config: Arc<PsConfig>,
    tables: BTreeMap<i32, ServerTable>,
    bg_ids: Vec<EntityId>,
    bg_clock: VectorClock,

    /// Last oplog version applied, per bg worker.
    bg_versions: HashMap<EntityId, i32>,

    /// Keyed by the server clock the request waits for.
    pending_requests: BTreeMap<i32, Vec<PendingRowRequest>>,
}

impl Server {
    pub fn new(server_id: EntityId, config: Arc<PsConfig>) -> Self {
        let bg_ids = bg_ids_for_channel(channel_of(server_id), config.num_clients);
        Self {
            server_id,
            tables: BTreeMap::new(),
            bg_clock: VectorClock::with_ids(bg_ids.iter().copied()),
            bg_versions: bg_ids.iter().map(|bg| (*bg, 0)).collect(),
            bg_ids,
            pending_requests: BTreeMap::new(),
            config,
        }
    }

    pub fn server_id(&self) -> EntityId {
        self.server_id
    }

    pub fn bg_ids(&self) -> &[EntityId] {
        &self.bg_ids
    }

    /// Minimum clock over every bg worker of this channel.
    pub fn clock(&self) -> i32 {
        self.bg_clock.get_min_clock()
    }

    pub fn bg_version(&self, bg_id: EntityId) -> i32 {
        self.bg_versions.get(&bg_id).copied().unwrap_or_default()
    }

    pub fn table(&self, table_id: i32) -> Option<&ServerTable> {
        self.tables.get(&table_id)
    }

    pub fn num_tables(&self) -> usize {
        self.tables.len()
    }

    pub fn create_table(&mut self, table_id: i32, info: TableInfo) -> PsResult<()> {
        if self.tables.contains_key(&table_id) {
            return Err(PsError::TableExists(table_id));
        }
        let table = if self.config.resume_clock > 0 {
            snapshot::read_snapshot(
                &self.config.resume_dir,
                self.server_id,
                table_id,
                self.config.resume_clock,
            )?
        } else {
            ServerTable::new(table_id, info)
        };
        debug!(
            "server {} created table {} with {} rows",
            self.server_id,
            table_id,
            table.num_rows()
        );
        self.tables.insert(table_id, table);
        Ok(())
    }

    /// Apply an oplog batch of `bg_id` and record its version. Returns the
    /// number of rows updated.
    pub fn apply_oplog(&mut self, bg_id: EntityId, version: i32, payload: &[u8]) -> PsResult<usize> {
        let tables = &self.tables;
        let updates = parse_bg_oplog(payload, |table_id| {
            tables
                .get(&table_id)
                .map(|table| UpdateCodec::for_table(table.info()))
        })?;
        let num_rows = updates.len();
        for row in updates {
            if let Some(table) = self.tables.get_mut(&row.table_id) {
                table.apply_row_batch_inc(row.row_id, &row.updates);
            }
        }
        self.bg_versions.insert(bg_id, version);
        Ok(num_rows)
    }

    /// Advance `bg_id` to `clock`. Returns the new server clock if it moved.
    pub fn clock_until(&mut self, bg_id: EntityId, clock: i32) -> Option<i32> {
        let new_clock = self.bg_clock.tick_until(bg_id, clock)?;
        if self.config.snapshot_clock > 0 && new_clock % self.config.snapshot_clock == 0 {
            if let Err(err) = self.snapshot(new_clock) {
                warn!("server {} failed to snapshot at clock {}: {}", self.server_id, new_clock, err);
            }
        }
        Some(new_clock)
    }

    fn snapshot(&self, clock: i32) -> PsResult<()> {
        for table in self.tables.values() {
            snapshot::write_snapshot(&self.config.snapshot_dir, self.server_id, clock, table)?;
        }
        Ok(())
    }

    /// Answer a row request if the server clock satisfies it, otherwise park
    /// it until [`Server::take_ready_requests`] releases it.
    pub fn handle_row_request(
        &mut self,
        bg_id: EntityId,
        table_id: i32,
        row_id: i32,
        clock: i32,
    ) -> PsResult<Option<PsMsg>> {
        if !self.tables.contains_key(&table_id) {
            return Err(PsError::UnknownTable(table_id));
        }
        if clock > self.clock() {
            self.pending_requests
                .entry(clock)
                .or_default()
                .push(PendingRowRequest {
                    bg_id,
                    table_id,
                    row_id,
                });
            return Ok(None);
        }
        self.row_reply(bg_id, table_id, row_id).map(Some)
    }

    fn row_reply(&mut self, bg_id: EntityId, table_id: i32, row_id: i32) -> PsResult<PsMsg> {
        let clock = self.clock();
        let version = self.bg_version(bg_id);
        let subscribe = self.config.consistency_model.pushes_rows();
        let table = self
            .tables
            .get_mut(&table_id)
            .ok_or(PsError::UnknownTable(table_id))?;
        let row = table.find_create_row(row_id);
        if subscribe {
            row.subscribe(client_id_of(bg_id));
        }
        let mut row_data = Vec::with_capacity(row.serialized_size());
        row.serialize(&mut row_data);
        Ok(PsMsg::RowRequestReply {
            table_id,
            row_id,
            clock,
            version,
            row_data,
        })
    }

    /// Replies for every parked request the current clock satisfies.
    pub fn take_ready_requests(&mut self) -> PsResult<Vec<(EntityId, PsMsg)>> {
        let still_waiting = self.pending_requests.split_off(&(self.clock() + 1));
        let ready = std::mem::replace(&mut self.pending_requests, still_waiting);
        let mut replies = vec![];
        for request in ready.into_values().flatten() {
            let reply = self.row_reply(request.bg_id, request.table_id, request.row_id)?;
            replies.push((request.bg_id, reply));
        }
        Ok(replies)
    }

    pub fn num_pending_requests(&self) -> usize {
        self.pending_requests.values().map(Vec::len).sum()
    }

    /// Collect dirty subscribed rows, at most `row_limit` of them, into one
    /// payload per subscribed bg worker. Collected rows are marked clean.
    pub fn create_push_rows(&mut self, row_limit: usize) -> BTreeMap<EntityId, RowsPayload> {
        let channel = channel_of(self.server_id);
        let mut payloads: BTreeMap<EntityId, RowsPayload> = BTreeMap::new();
        let mut budget = row_limit;
        for (table_id, table) in self.tables.iter_mut() {
            if budget == 0 {
                break;
            }
            let row_ids = table.take_dirty_subscribed_rows(budget);
            budget -= row_ids.len();
            for row_id in row_ids {
                let Some(row) = table.find_row(row_id) else {
                    continue;
                };
                for client_id in row.subscribers() {
                    payloads
                        .entry(bg_thread_id(client_id, channel))
                        .or_default()
                        .add_row(*table_id, row_id, row);
                }
            }
        }
        payloads
    }

    pub fn num_dirty_subscribed_rows(&self) -> usize {
        self.tables
            .values()
            .map(ServerTable::num_dirty_subscribed_rows)
            .sum()
    }
}
