//! Client-side operation logs: per-row delta accumulators, the table-wide
//! partitions holding them, and the batches bg workers ship to servers.

pub mod append_only;
pub mod bg_oplog;
pub mod partition;
pub mod recycle;
pub mod row_oplog;
pub mod table_oplog;
pub mod update_codec;

pub use append_only::AppendOnlyBuffer;
pub use append_only::AppendOnlyOpLogPartition;
pub use append_only::AppendOnlyRowOpLogBuffer;
pub use bg_oplog::BgOpLog;
pub use partition::OpLogPartition;
pub use row_oplog::RowOpLog;
pub use row_oplog::RowOpLogFactory;
pub use table_oplog::TableOpLog;
pub use table_oplog::TableOpLogIndex;
pub use update_codec::UpdateCodec;
