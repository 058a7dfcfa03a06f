pub mod cli_args;
pub mod entity_id;
pub mod ps_config;
pub mod table_config;

pub use ps_config::ConsistencyModel;
pub use ps_config::PsConfig;
pub use ps_config::UpdateSortPolicy;
pub use table_config::AppendOnlyOpLogType;
pub use table_config::ClientTableConfig;
pub use table_config::OpLogType;
pub use table_config::ProcessStorageType;
pub use table_config::RowOpLogType;
pub use table_config::RowType;
pub use table_config::TableInfo;
