use tokio::sync::oneshot;

use crate::config_models::TableInfo;
use crate::errors::PsResult;
use crate::row::RowAccessor;

/// Receiving end of a row fetch; resolves once a fresh enough row is cached.
pub type RowReply = oneshot::Receiver<PsResult<RowAccessor>>;

/// Commands application threads send to the bg worker of a channel.
#[derive(Debug, strum::Display)]
pub(crate) enum AppToBg {
    /// Only sent to the head bg worker.
    CreateTable {
        table_id: i32,
        table_info: TableInfo,
        reply: oneshot::Sender<PsResult<()>>,
    },

    /// Fetch a row at least as fresh as `clock`.
    RequestRow {
        table_id: i32,
        row_id: i32,
        clock: i32,
        reply: oneshot::Sender<PsResult<RowAccessor>>,
    },

    /// Every application thread finished `clock - 1`; ship all oplogs.
    ClockAllTables { clock: i32 },

    /// An append-only buffer of the table was queued.
    AppendBufferReady { table_id: i32 },

    ShutDown,
}
