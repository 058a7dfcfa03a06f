use std::collections::BTreeMap;
use std::collections::HashMap;

use tokio::sync::oneshot;
use tracing::trace;

use crate::config_models::entity_id::EntityId;
use crate::errors::PsError;
use crate::errors::PsResult;
use crate::oplog::BgOpLog;
use crate::row::Row;
use crate::row::RowAccessor;

type RowWaiter = oneshot::Sender<PsResult<RowAccessor>>;

/// Bookkeeping of one bg worker: outstanding row requests, merged per row,
/// and the oplogs sent to each server that the server has not yet reported
/// as applied.
#[derive(Debug, Default)]
pub(crate) struct RowRequestOpLogMgr {
    /// Waiters per (table, row) with the clock each needs.
    pending: HashMap<(i32, i32), Vec<(i32, RowWaiter)>>,
    sent_oplogs: BTreeMap<EntityId, BTreeMap<i32, BgOpLog>>,
}

impl RowRequestOpLogMgr {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a waiter. Returns true if a request must go to the server;
    /// false when one is already in flight for the row.
    pub(crate) fn add_row_request(
        &mut self,
        table_id: i32,
        row_id: i32,
        clock: i32,
        reply: RowWaiter,
    ) -> bool {
        match self.pending.get_mut(&(table_id, row_id)) {
            Some(waiters) => {
                waiters.push((clock, reply));
                false
            }
            None => {
                self.pending.insert((table_id, row_id), vec![(clock, reply)]);
                true
            }
        }
    }

    /// A server reply of `clock` arrived: take the waiters it satisfies.
    /// Also returns the clock to request again when some waiters need a
    /// fresher row.
    pub(crate) fn take_satisfied(
        &mut self,
        table_id: i32,
        row_id: i32,
        clock: i32,
    ) -> (Vec<RowWaiter>, Option<i32>) {
        let Some(waiters) = self.pending.get_mut(&(table_id, row_id)) else {
            return (vec![], None);
        };
        let (satisfied, waiting): (Vec<_>, Vec<_>) = std::mem::take(waiters)
            .into_iter()
            .partition(|(wanted, _)| *wanted <= clock);
        let satisfied = satisfied.into_iter().map(|(_, reply)| reply).collect();

        let Some(max_wanted) = waiting.iter().map(|(wanted, _)| *wanted).max() else {
            self.pending.remove(&(table_id, row_id));
            return (satisfied, None);
        };
        *waiters = waiting;
        (satisfied, Some(max_wanted))
    }

    pub(crate) fn num_pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Keep a sent oplog until `server` reports `version` applied.
    pub(crate) fn add_sent_oplog(&mut self, server: EntityId, version: i32, oplog: BgOpLog) {
        self.sent_oplogs
            .entry(server)
            .or_default()
            .insert(version, oplog);
    }

    /// `server` applied everything up to `version`.
    pub(crate) fn ack_oplog(&mut self, server: EntityId, version: i32) {
        if let Some(sent) = self.sent_oplogs.get_mut(&server) {
            *sent = sent.split_off(&(version + 1));
            trace!(
                "server {} applied version {}, {} oplogs unacked",
                server,
                version,
                sent.len()
            );
        }
    }

    pub(crate) fn num_sent_oplogs(&self) -> usize {
        self.sent_oplogs.values().map(BTreeMap::len).sum()
    }

    /// Re-apply the oplogs sent to `server` after `version` to `row`.
    pub(crate) fn replay_sent_oplogs(
        &self,
        server: EntityId,
        version: i32,
        table_id: i32,
        row_id: i32,
        row: &mut Row,
    ) {
        let Some(sent) = self.sent_oplogs.get(&server) else {
            return;
        };
        for oplog in sent.range(version + 1..).map(|(_, oplog)| oplog) {
            if let Some(row_oplog) = oplog.find_row_oplog(table_id, row_id) {
                row_oplog.apply_to_row(row);
            }
        }
    }

    /// Fail every outstanding request; the worker is going away.
    pub(crate) fn fail_all(&mut self) {
        for (_, waiters) in self.pending.drain() {
            for (_, reply) in waiters {
                let _ = reply.send(Err(PsError::ShutDown));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_models::RowOpLogType;
    use crate::config_models::RowType;
    use crate::oplog::RowOpLogFactory;
    use crate::oplog::UpdateCodec;

    fn waiter() -> (RowWaiter, oneshot::Receiver<PsResult<RowAccessor>>) {
        oneshot::channel()
    }

    #[test]
    fn concurrent_requests_share_one_server_request() {
        let mut mgr = RowRequestOpLogMgr::new();
        let (a, _a_rx) = waiter();
        let (b, _b_rx) = waiter();
        let (c, _c_rx) = waiter();
        assert!(mgr.add_row_request(0, 1, 2, a));
        assert!(!mgr.add_row_request(0, 1, 2, b));
        assert!(!mgr.add_row_request(0, 1, 4, c));
        assert_eq!(1, mgr.num_pending_requests());

        let (satisfied, rerequest) = mgr.take_satisfied(0, 1, 3);
        assert_eq!(2, satisfied.len());
        assert_eq!(Some(4), rerequest);
        assert_eq!(1, mgr.num_pending_requests());

        let (satisfied, rerequest) = mgr.take_satisfied(0, 1, 4);
        assert_eq!(1, satisfied.len());
        assert_eq!(None, rerequest);
        assert_eq!(0, mgr.num_pending_requests());
    }

    #[test]
    fn unrelated_rows_are_untouched() {
        let mut mgr = RowRequestOpLogMgr::new();
        let (a, _a_rx) = waiter();
        assert!(mgr.add_row_request(0, 1, 0, a));
        let (satisfied, rerequest) = mgr.take_satisfied(0, 2, 10);
        assert!(satisfied.is_empty());
        assert_eq!(None, rerequest);
        assert_eq!(1, mgr.num_pending_requests());
    }

    #[test]
    fn only_unapplied_versions_are_replayed() {
        let factory = RowOpLogFactory::new(RowOpLogType::Sparse, 10, false);
        let mut mgr = RowRequestOpLogMgr::new();
        for version in 1..=3 {
            let mut row_oplog = factory.create();
            row_oplog.inc(0, version as f32);
            let mut oplog = BgOpLog::new();
            oplog.add_row_oplog(0, false, UpdateCodec::F32, 5, row_oplog);
            mgr.add_sent_oplog(1, version, oplog);
        }

        let mut row = Row::new(RowType::Dense, 10);
        mgr.replay_sent_oplogs(1, 1, 0, 5, &mut row);
        assert_eq!(5.0, row.get(0));

        mgr.ack_oplog(1, 2);
        assert_eq!(1, mgr.num_sent_oplogs());
        let mut row = Row::new(RowType::Dense, 10);
        mgr.replay_sent_oplogs(1, 0, 0, 5, &mut row);
        assert_eq!(3.0, row.get(0));
    }

    #[tokio::test]
    async fn pending_requests_fail_on_shutdown() {
        let mut mgr = RowRequestOpLogMgr::new();
        let (a, a_rx) = waiter();
        mgr.add_row_request(0, 1, 0, a);
        mgr.fail_all();
        assert!(matches!(a_rx.await, Ok(Err(PsError::ShutDown))));
    }
}
