use std::collections::BTreeMap;

use bytes::Buf;
use bytes::BufMut;
use serde::Deserialize;
use serde::Serialize;

use crate::config_models::TableInfo;
use crate::errors::PsError;
use crate::errors::PsResult;
use crate::row::server_row::ServerRow;
use crate::row::Row;

/// The rows of one table owned by one server thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerTable {
    table_id: i32,
    info: TableInfo,
    rows: BTreeMap<i32, ServerRow>,
}

impl ServerTable {
    pub fn new(table_id: i32, info: TableInfo) -> Self {
        Self {
            table_id,
            info,
            rows: BTreeMap::new(),
        }
    }

    pub fn table_id(&self) -> i32 {
        self.table_id
    }

    pub fn info(&self) -> &TableInfo {
        &self.info
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn find_row(&self, row_id: i32) -> Option<&ServerRow> {
        self.rows.get(&row_id)
    }

    /// Rows spring into existence zeroed on first access.
    pub fn find_create_row(&mut self, row_id: i32) -> &mut ServerRow {
        let info = &self.info;
        self.rows.entry(row_id).or_insert_with(|| {
            ServerRow::new(
                Row::new(info.row_type, info.row_capacity),
                info.is_versioned(),
            )
        })
    }

    pub fn apply_row_batch_inc(&mut self, row_id: i32, updates: &[(i32, f32)]) {
        self.find_create_row(row_id).apply_batch_inc(updates);
    }

    /// Dirty rows with subscribers, ascending by row id, at most `limit` of
    /// them. Returned rows are marked clean.
    pub fn take_dirty_subscribed_rows(&mut self, limit: usize) -> Vec<i32> {
        let mut taken = Vec::new();
        for (row_id, row) in self.rows.iter_mut() {
            if taken.len() >= limit {
                break;
            }
            if row.is_dirty() && row.has_subscribers() {
                row.reset_dirty();
                taken.push(*row_id);
            }
        }
        taken
    }

    pub fn num_dirty_subscribed_rows(&self) -> usize {
        self.rows
            .values()
            .filter(|row| row.is_dirty() && row.has_subscribers())
            .count()
    }
}

/// Read one row in the layout of [`ServerRow::serialize`].
pub fn decode_row(info: &TableInfo, buf: &mut impl Buf) -> (Row, Option<u64>) {
    let row = Row::deserialize(info.row_type, info.row_capacity, buf);
    let version = info.is_versioned().then(|| buf.get_u64_le());
    (row, version)
}

/// Builds the rows payload of a push message:
/// `[i32 num_tables]` then per table `[i32 table_id][i32 num_rows]` and
/// `num_rows` × `[i32 row_id][row]`.
#[derive(Debug, Default)]
pub struct RowsPayload {
    tables: BTreeMap<i32, (i32, Vec<u8>)>,
}

impl RowsPayload {
    pub fn add_row(&mut self, table_id: i32, row_id: i32, row: &ServerRow) {
        let (num_rows, bytes) = self.tables.entry(table_id).or_default();
        *num_rows += 1;
        bytes.put_i32_le(row_id);
        row.serialize(bytes);
    }

    pub fn num_rows(&self) -> usize {
        self.tables
            .values()
            .map(|(n, _)| usize::try_from(*n).unwrap_or_default())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.put_i32_le(self.tables.len() as i32);
        for (table_id, (num_rows, bytes)) in &self.tables {
            buf.put_i32_le(*table_id);
            buf.put_i32_le(*num_rows);
            buf.put_slice(bytes);
        }
        buf
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedRow {
    pub table_id: i32,
    pub row_id: i32,
    pub row: Row,
    pub version: Option<u64>,
}

/// Decode a payload built by [`RowsPayload::encode`].
pub fn decode_rows(
    payload: &[u8],
    info_of: impl Fn(i32) -> Option<TableInfo>,
) -> PsResult<Vec<DecodedRow>> {
    let mut buf = payload;
    if buf.is_empty() {
        return Ok(vec![]);
    }
    let num_tables = buf.get_i32_le();
    let mut rows = vec![];
    for _ in 0..num_tables {
        if buf.remaining() < 8 {
            return Err(PsError::Codec("truncated rows payload".to_string()));
        }
        let table_id = buf.get_i32_le();
        let num_rows = buf.get_i32_le();
        let info = info_of(table_id).ok_or(PsError::UnknownTable(table_id))?;
        for _ in 0..num_rows {
            let row_id = buf.get_i32_le();
            let (row, version) = decode_row(&info, &mut buf);
            rows.push(DecodedRow {
                table_id,
                row_id,
                row,
                version,
            });
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_models::RowOpLogType;
    use crate::config_models::RowType;

    fn sparse_info() -> TableInfo {
        TableInfo {
            row_type: RowType::Sparse,
            row_oplog_type: RowOpLogType::Sparse,
            row_capacity: 50,
            ..Default::default()
        }
    }

    #[test]
    fn dirty_rows_are_taken_once() {
        let mut table = ServerTable::new(1, sparse_info());
        table.apply_row_batch_inc(4, &[(0, 1.0)]);
        table.apply_row_batch_inc(2, &[(3, 1.0)]);
        table.apply_row_batch_inc(9, &[(3, 1.0)]);
        table.find_create_row(4).subscribe(0);
        table.find_create_row(9).subscribe(1);

        assert_eq!(2, table.num_dirty_subscribed_rows());
        assert_eq!(vec![4], table.take_dirty_subscribed_rows(1));
        assert_eq!(vec![9], table.take_dirty_subscribed_rows(10));
        assert!(table.take_dirty_subscribed_rows(10).is_empty());
        assert!(table.find_row(2).unwrap().is_dirty());
    }

    #[test]
    fn rows_payload_decodes_per_table() {
        let dense_info = TableInfo {
            row_capacity: 2,
            row_oplog_type: RowOpLogType::VersionDense,
            ..Default::default()
        };
        let mut dense = ServerTable::new(0, dense_info.clone());
        dense.apply_row_batch_inc(1, &[(1, 4.0)]);
        let mut sparse = ServerTable::new(3, sparse_info());
        sparse.apply_row_batch_inc(8, &[(40, -1.0)]);

        let mut payload = RowsPayload::default();
        payload.add_row(0, 1, dense.find_row(1).unwrap());
        payload.add_row(3, 8, sparse.find_row(8).unwrap());
        assert_eq!(2, payload.num_rows());

        let decoded = decode_rows(&payload.encode(), |table| match table {
            0 => Some(dense_info.clone()),
            3 => Some(sparse_info()),
            _ => None,
        })
        .unwrap();
        assert_eq!(2, decoded.len());
        assert_eq!(vec![0.0, 4.0], decoded[0].row.to_dense());
        assert_eq!(Some(1), decoded[0].version);
        assert_eq!((3, 8), (decoded[1].table_id, decoded[1].row_id));
        assert_eq!(vec![(40, -1.0)], decoded[1].row.copy_to_vec());
        assert_eq!(None, decoded[1].version);
    }
}
