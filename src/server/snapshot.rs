//! Server table snapshots written at configured clock boundaries and read
//! back when a cluster resumes.

use std::fs;
use std::io::BufReader;
use std::io::BufWriter;
use std::path::Path;
use std::path::PathBuf;

use tracing::info;

use super::server_table::ServerTable;
use crate::config_models::entity_id::EntityId;
use crate::errors::PsError;
use crate::errors::PsResult;

pub fn snapshot_path(dir: &Path, server_id: EntityId, table_id: i32, clock: i32) -> PathBuf {
    dir.join(format!(
        "server_table_{}_{}_clock_{}.bin",
        server_id, table_id, clock
    ))
}

pub fn write_snapshot(
    dir: &Path,
    server_id: EntityId,
    clock: i32,
    table: &ServerTable,
) -> PsResult<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = snapshot_path(dir, server_id, table.table_id(), clock);
    let writer = BufWriter::new(fs::File::create(&path)?);
    bincode::serialize_into(writer, table)
        .map_err(|err| PsError::Snapshot(format!("{}: {}", path.display(), err)))?;
    info!(
        "server {} wrote snapshot of table {} ({} rows) at clock {}",
        server_id,
        table.table_id(),
        table.num_rows(),
        clock
    );
    Ok(path)
}

pub fn read_snapshot(
    dir: &Path,
    server_id: EntityId,
    table_id: i32,
    clock: i32,
) -> PsResult<ServerTable> {
    let path = snapshot_path(dir, server_id, table_id, clock);
    let reader = BufReader::new(fs::File::open(&path).map_err(|err| {
        PsError::Snapshot(format!("cannot open {}: {}", path.display(), err))
    })?);
    let table: ServerTable = bincode::deserialize_from(reader)
        .map_err(|err| PsError::Snapshot(format!("{}: {}", path.display(), err)))?;
    if table.table_id() != table_id {
        return Err(PsError::Snapshot(format!(
            "{} holds table {}, expected {}",
            path.display(),
            table.table_id(),
            table_id
        )));
    }
    Ok(table)
}
