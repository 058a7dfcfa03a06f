//! Oplog batch a bg worker ships to one server thread in a single message.
//!
//! Payload layout, little endian:
//! `[i32 num_tables]` then per table `[i32 table_id][u8 dense][i32 num_rows]`
//! followed by `num_rows` × `[i32 row_id][row oplog]`, the row oplog in the
//! dense or sparse serialization selected by the `dense` flag.

use std::collections::BTreeMap;

use bytes::Buf;
use bytes::BufMut;

use super::row_oplog::RowOpLog;
use super::update_codec::UpdateCodec;
use crate::errors::PsError;
use crate::errors::PsResult;

/// `[i32 num_tables]`
pub const PAYLOAD_HEADER_BYTES: usize = 4;

/// `[i32 table_id][u8 dense][i32 num_rows]`
pub const TABLE_HEADER_BYTES: usize = 9;

/// `[i32 row_id]` ahead of every row oplog.
pub const ROW_HEADER_BYTES: usize = 4;

/// Bytes `oplog` takes in a payload, row header included.
pub fn row_payload_size(dense_serialized: bool, codec: UpdateCodec, oplog: &RowOpLog) -> usize {
    ROW_HEADER_BYTES
        + if dense_serialized {
            oplog.dense_serialized_size(codec)
        } else {
            oplog.sparse_serialized_size(codec)
        }
}

/// Largest payload share of one row oplog covering `num_cols` columns.
pub fn max_row_payload_size(dense_serialized: bool, codec: UpdateCodec, num_cols: usize) -> usize {
    ROW_HEADER_BYTES
        + if dense_serialized {
            RowOpLog::dense_size_of(num_cols, codec)
        } else {
            RowOpLog::sparse_size_of(num_cols, codec)
        }
}

#[derive(Debug, Clone)]
pub struct BgOpLogPartition {
    dense_serialized: bool,
    codec: UpdateCodec,
    rows: BTreeMap<i32, RowOpLog>,
}

impl BgOpLogPartition {
    pub fn row_ids(&self) -> impl Iterator<Item = i32> + '_ {
        self.rows.keys().copied()
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    fn serialized_size(&self) -> usize {
        let rows: usize = self
            .rows
            .values()
            .map(|oplog| row_payload_size(self.dense_serialized, self.codec, oplog))
            .sum();
        TABLE_HEADER_BYTES + rows
    }
}

#[derive(Debug, Clone, Default)]
pub struct BgOpLog {
    tables: BTreeMap<i32, BgOpLogPartition>,
}

impl BgOpLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a row oplog. A row added twice keeps the sum of both.
    pub fn add_row_oplog(
        &mut self,
        table_id: i32,
        dense_serialized: bool,
        codec: UpdateCodec,
        row_id: i32,
        oplog: RowOpLog,
    ) {
        let partition = self
            .tables
            .entry(table_id)
            .or_insert_with(|| BgOpLogPartition {
                dense_serialized,
                codec,
                rows: BTreeMap::new(),
            });
        match partition.rows.get_mut(&row_id) {
            Some(existing) => {
                for (col, delta) in oplog.entries() {
                    existing.inc(col, delta);
                }
            }
            None => {
                partition.rows.insert(row_id, oplog);
            }
        }
    }

    pub fn find_row_oplog(&self, table_id: i32, row_id: i32) -> Option<&RowOpLog> {
        self.tables.get(&table_id)?.rows.get(&row_id)
    }

    pub fn partition(&self, table_id: i32) -> Option<&BgOpLogPartition> {
        self.tables.get(&table_id)
    }

    pub fn is_empty(&self) -> bool {
        self.tables.values().all(|p| p.rows.is_empty())
    }

    pub fn num_rows(&self) -> usize {
        self.tables.values().map(BgOpLogPartition::num_rows).sum()
    }

    pub fn serialized_size(&self) -> usize {
        PAYLOAD_HEADER_BYTES
            + self
                .tables
                .values()
                .map(BgOpLogPartition::serialized_size)
                .sum::<usize>()
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.serialized_size());
        buf.put_i32_le(self.tables.len() as i32);
        for (table_id, partition) in &self.tables {
            buf.put_i32_le(*table_id);
            buf.put_u8(u8::from(partition.dense_serialized));
            buf.put_i32_le(partition.rows.len() as i32);
            for (row_id, oplog) in &partition.rows {
                buf.put_i32_le(*row_id);
                if partition.dense_serialized {
                    oplog.serialize_dense(partition.codec, &mut buf);
                } else {
                    oplog.serialize_sparse(partition.codec, &mut buf);
                }
            }
        }
        buf
    }
}

/// Updates of one row decoded from a bg oplog payload.
#[derive(Debug, Clone, PartialEq)]
pub struct RowUpdates {
    pub table_id: i32,
    pub row_id: i32,
    pub updates: Vec<(i32, f32)>,
}

/// Decode a payload written by [`BgOpLog::serialize`]. `codec_of` resolves a
/// table's update encoding.
pub fn parse_bg_oplog(
    payload: &[u8],
    codec_of: impl Fn(i32) -> Option<UpdateCodec>,
) -> PsResult<Vec<RowUpdates>> {
    let mut buf = payload;
    if buf.is_empty() {
        return Ok(vec![]);
    }
    let truncated = || PsError::Codec("truncated bg oplog payload".to_string());
    if buf.remaining() < PAYLOAD_HEADER_BYTES {
        return Err(truncated());
    }
    let num_tables = buf.get_i32_le();
    let mut parsed = vec![];
    for _ in 0..num_tables {
        if buf.remaining() < TABLE_HEADER_BYTES {
            return Err(truncated());
        }
        let table_id = buf.get_i32_le();
        let dense = buf.get_u8() != 0;
        let num_rows = buf.get_i32_le();
        let codec = codec_of(table_id).ok_or(PsError::UnknownTable(table_id))?;
        for _ in 0..num_rows {
            if buf.remaining() < ROW_HEADER_BYTES + RowOpLog::sparse_size_of(0, codec) {
                return Err(truncated());
            }
            let row_id = buf.get_i32_le();
            let row_oplog = if dense {
                RowOpLog::parse_dense_serialized(codec, 0, &mut buf)
            } else {
                RowOpLog::parse_sparse_serialized(codec, &mut buf)
            };
            parsed.push(RowUpdates {
                table_id,
                row_id,
                updates: row_oplog.updates,
            });
        }
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_models::RowOpLogType;
    use crate::oplog::row_oplog::RowOpLogFactory;

    fn oplog(factory: &RowOpLogFactory, updates: &[(i32, f32)]) -> RowOpLog {
        let mut oplog = factory.create();
        for (col, delta) in updates {
            oplog.inc(*col, *delta);
        }
        oplog
    }

    #[test]
    fn payload_carries_every_table() {
        let sparse = RowOpLogFactory::new(RowOpLogType::Sparse, 8, false);
        let dense = RowOpLogFactory::new(RowOpLogType::Dense, 3, false);

        let mut bg_oplog = BgOpLog::new();
        bg_oplog.add_row_oplog(1, false, UpdateCodec::F32, 7, oplog(&sparse, &[(5, 1.5)]));
        bg_oplog.add_row_oplog(1, false, UpdateCodec::F32, 7, oplog(&sparse, &[(5, 1.0)]));
        bg_oplog.add_row_oplog(2, true, UpdateCodec::F16, 0, oplog(&dense, &[(2, -2.0)]));
        assert_eq!(2, bg_oplog.num_rows());
        assert_eq!(Some(2.5), bg_oplog.find_row_oplog(1, 7).unwrap().find(5));

        let payload = bg_oplog.serialize();
        assert_eq!(bg_oplog.serialized_size(), payload.len());

        let parsed = parse_bg_oplog(&payload, |table| match table {
            1 => Some(UpdateCodec::F32),
            2 => Some(UpdateCodec::F16),
            _ => None,
        })
        .unwrap();
        assert_eq!(
            vec![
                RowUpdates {
                    table_id: 1,
                    row_id: 7,
                    updates: vec![(5, 2.5)],
                },
                RowUpdates {
                    table_id: 2,
                    row_id: 0,
                    updates: vec![(0, 0.0), (1, 0.0), (2, -2.0)],
                },
            ],
            parsed
        );
    }

    #[test]
    fn row_sizes_add_up_to_the_payload() {
        let factory = RowOpLogFactory::new(RowOpLogType::Sparse, 8, false);
        for dense_serialized in [false, true] {
            let row = oplog(&factory, &[(0, 1.0), (3, 2.0), (7, 3.0)]);
            let row_size = row_payload_size(dense_serialized, UpdateCodec::F32, &row);
            assert!(row_size <= max_row_payload_size(dense_serialized, UpdateCodec::F32, 8));

            let mut bg_oplog = BgOpLog::new();
            bg_oplog.add_row_oplog(0, dense_serialized, UpdateCodec::F32, 4, row);
            assert_eq!(
                PAYLOAD_HEADER_BYTES + TABLE_HEADER_BYTES + row_size,
                bg_oplog.serialize().len()
            );
        }
    }

    #[test]
    fn unknown_table_is_reported() {
        let factory = RowOpLogFactory::new(RowOpLogType::Sparse, 8, false);
        let mut bg_oplog = BgOpLog::new();
        bg_oplog.add_row_oplog(9, false, UpdateCodec::F32, 0, oplog(&factory, &[(0, 1.0)]));
        assert_eq!(
            Err(PsError::UnknownTable(9)),
            parse_bg_oplog(&bg_oplog.serialize(), |_| None)
        );
    }

    #[test]
    fn empty_payload_means_clock_only() {
        assert!(parse_bg_oplog(&[], |_| None).unwrap().is_empty());
        assert!(parse_bg_oplog(&BgOpLog::new().serialize(), |_| None)
            .unwrap()
            .is_empty());
    }
}
