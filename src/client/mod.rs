//! Application-facing side of a client process.

pub mod app_thread;
pub mod client_table;
pub mod table_group;
pub mod thread_table;

pub use app_thread::AppThread;
pub use client_table::ClientTable;
pub use table_group::TableGroup;
pub use thread_table::ThreadTable;
