//! Recoverable error surface of the parameter-server runtime.
//!
//! Protocol violations and broken capacity preconditions are not represented
//! here: they abort the process with a diagnostic, since they mean a peer or a
//! caller already broke a guarantee the runtime depends on.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PsError {
    #[error("the wait was cancelled")]
    Cancelled,

    #[error("the table group is shutting down")]
    ShutDown,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("table {0} already exists")]
    TableExists(i32),

    #[error("unknown table {0}")]
    UnknownTable(i32),

    #[error("calling thread is not registered with the table group")]
    ThreadNotRegistered,

    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error("comm bus error: {0}")]
    Bus(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("cannot start thread: {0}")]
    Thread(String),
}

pub type PsResult<T> = Result<T, PsError>;

impl From<bincode::Error> for PsError {
    fn from(err: bincode::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

impl From<std::io::Error> for PsError {
    fn from(err: std::io::Error) -> Self {
        Self::Snapshot(err.to_string())
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for PsError {
    fn from(_err: tokio::sync::oneshot::error::RecvError) -> Self {
        Self::ShutDown
    }
}
