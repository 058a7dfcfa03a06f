//! Row storage variants shared by the client cache and the servers.

pub mod client_row;
pub mod server_row;

use std::collections::HashMap;

use bytes::Buf;
use bytes::BufMut;
use serde::Deserialize;
use serde::Serialize;

pub use client_row::ClientRow;
pub use client_row::RowAccessor;
pub use server_row::ServerRow;

use crate::config_models::RowType;

/// Fixed-width row: one value per column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseRow {
    values: Vec<f32>,
}

/// Hash-map row; absent columns read as zero and zeros are never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparseRow {
    entries: HashMap<i32, f32>,
    capacity: usize,
}

/// Sparse row kept as a column-sorted vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortedVectorRow {
    entries: Vec<(i32, f32)>,
    capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Row {
    Dense(DenseRow),
    Sparse(SparseRow),
    SortedVector(SortedVectorRow),
}

impl Row {
    pub fn new(row_type: RowType, capacity: usize) -> Self {
        match row_type {
            RowType::Dense => Row::Dense(DenseRow {
                values: vec![0.0; capacity],
            }),
            RowType::Sparse => Row::Sparse(SparseRow {
                entries: HashMap::new(),
                capacity,
            }),
            RowType::SortedVector => Row::SortedVector(SortedVectorRow {
                entries: Vec::new(),
                capacity,
            }),
        }
    }

    pub fn row_type(&self) -> RowType {
        match self {
            Row::Dense(_) => RowType::Dense,
            Row::Sparse(_) => RowType::Sparse,
            Row::SortedVector(_) => RowType::SortedVector,
        }
    }

    pub fn capacity(&self) -> usize {
        match self {
            Row::Dense(row) => row.values.len(),
            Row::Sparse(row) => row.capacity,
            Row::SortedVector(row) => row.capacity,
        }
    }

    pub fn get(&self, col: i32) -> f32 {
        match self {
            Row::Dense(row) => usize::try_from(col)
                .ok()
                .and_then(|c| row.values.get(c))
                .copied()
                .unwrap_or(0.0),
            Row::Sparse(row) => row.entries.get(&col).copied().unwrap_or(0.0),
            Row::SortedVector(row) => match row.entries.binary_search_by_key(&col, |e| e.0) {
                Ok(idx) => row.entries[idx].1,
                Err(_) => 0.0,
            },
        }
    }

    /// # Panics
    /// If a dense row is indexed outside its capacity.
    pub fn inc(&mut self, col: i32, delta: f32) {
        match self {
            Row::Dense(row) => {
                let idx = dense_index(col, row.values.len());
                row.values[idx] += delta;
            }
            Row::Sparse(row) => {
                let entry = row.entries.entry(col).or_insert(0.0);
                *entry += delta;
                if *entry == 0.0 {
                    row.entries.remove(&col);
                }
            }
            Row::SortedVector(row) => match row.entries.binary_search_by_key(&col, |e| e.0) {
                Ok(idx) => {
                    row.entries[idx].1 += delta;
                    if row.entries[idx].1 == 0.0 {
                        row.entries.remove(idx);
                    }
                }
                Err(idx) => {
                    if delta != 0.0 {
                        row.entries.insert(idx, (col, delta));
                    }
                }
            },
        }
    }

    pub fn batch_inc(&mut self, cols: &[i32], deltas: &[f32]) {
        for (col, delta) in cols.iter().zip(deltas) {
            self.inc(*col, *delta);
        }
    }

    /// Add `deltas` to the consecutive columns starting at `index_st`.
    pub fn dense_batch_inc(&mut self, index_st: i32, deltas: &[f32]) {
        match self {
            Row::Dense(row) => {
                let start = dense_index(index_st, row.values.len());
                let end = start + deltas.len();
                assert!(
                    end <= row.values.len(),
                    "dense batch inc past row capacity {}",
                    row.values.len()
                );
                for (value, delta) in row.values[start..end].iter_mut().zip(deltas) {
                    *value += delta;
                }
            }
            _ => {
                for (offset, delta) in (index_st..).zip(deltas) {
                    self.inc(offset, *delta);
                }
            }
        }
    }

    /// Non-zero entries in ascending column order.
    pub fn copy_to_vec(&self) -> Vec<(i32, f32)> {
        match self {
            Row::Dense(row) => (0i32..)
                .zip(row.values.iter().copied())
                .filter(|(_, v)| *v != 0.0)
                .collect(),
            Row::Sparse(row) => {
                let mut entries: Vec<(i32, f32)> =
                    row.entries.iter().map(|(c, v)| (*c, *v)).collect();
                entries.sort_unstable_by_key(|e| e.0);
                entries
            }
            Row::SortedVector(row) => row.entries.clone(),
        }
    }

    /// Values of columns `0..capacity`.
    pub fn to_dense(&self) -> Vec<f32> {
        match self {
            Row::Dense(row) => row.values.clone(),
            _ => {
                let mut values = vec![0.0; self.capacity()];
                for (col, value) in self.copy_to_vec() {
                    if let Some(slot) = usize::try_from(col).ok().and_then(|c| values.get_mut(c)) {
                        *slot = value;
                    }
                }
                values
            }
        }
    }

    pub fn num_entries(&self) -> usize {
        match self {
            Row::Dense(row) => row.values.len(),
            Row::Sparse(row) => row.entries.len(),
            Row::SortedVector(row) => row.entries.len(),
        }
    }

    pub fn serialized_size(&self) -> usize {
        match self {
            Row::Dense(row) => row.values.len() * 4,
            _ => 4 + self.num_entries() * 8,
        }
    }

    /// Dense rows: `[f32 × capacity]`. Sparse rows:
    /// `[i32 n][(i32 col, f32 value) × n]` in column order.
    pub fn serialize(&self, buf: &mut impl BufMut) {
        match self {
            Row::Dense(row) => {
                for value in &row.values {
                    buf.put_f32_le(*value);
                }
            }
            _ => {
                let entries = self.copy_to_vec();
                buf.put_i32_le(entries.len() as i32);
                for (col, value) in entries {
                    buf.put_i32_le(col);
                    buf.put_f32_le(value);
                }
            }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.serialized_size());
        self.serialize(&mut buf);
        buf
    }

    /// Read a row in the layout written by [`Row::serialize`]. Consumes
    /// exactly the row's bytes from `buf`.
    pub fn deserialize(row_type: RowType, capacity: usize, buf: &mut impl Buf) -> Self {
        let mut row = Row::new(row_type, capacity);
        match &mut row {
            Row::Dense(dense) => {
                for value in dense.values.iter_mut() {
                    *value = buf.get_f32_le();
                }
            }
            _ => {
                let num_entries = buf.get_i32_le();
                for _ in 0..num_entries {
                    let col = buf.get_i32_le();
                    let value = buf.get_f32_le();
                    row.inc(col, value);
                }
            }
        }
        row
    }

    pub fn reset(&mut self) {
        match self {
            Row::Dense(row) => row.values.iter_mut().for_each(|v| *v = 0.0),
            Row::Sparse(row) => row.entries.clear(),
            Row::SortedVector(row) => row.entries.clear(),
        }
    }
}

fn dense_index(col: i32, capacity: usize) -> usize {
    match usize::try_from(col) {
        Ok(idx) if idx < capacity => idx,
        _ => panic!("column {} outside dense row of capacity {}", col, capacity),
    }
}

#[cfg(test)]
mod tests {
    use proptest::collection;
    use proptest::prelude::*;
    use test_strategy::proptest;

    use super::*;

    #[test]
    fn sparse_rows_drop_zeroed_columns() {
        for row_type in [RowType::Sparse, RowType::SortedVector] {
            let mut row = Row::new(row_type, 100);
            row.inc(5, 2.0);
            row.inc(3, 1.0);
            row.inc(5, -2.0);
            assert_eq!(vec![(3, 1.0)], row.copy_to_vec());
            assert_eq!(1, row.num_entries());
        }
    }

    #[test]
    fn dense_batch_inc_on_every_row_type() {
        for row_type in [RowType::Dense, RowType::Sparse, RowType::SortedVector] {
            let mut row = Row::new(row_type, 6);
            row.dense_batch_inc(2, &[1.0, 0.0, 3.0]);
            assert_eq!(vec![0.0, 0.0, 1.0, 0.0, 3.0, 0.0], row.to_dense());
        }
    }

    #[test]
    #[should_panic(expected = "outside dense row")]
    fn dense_row_rejects_out_of_range_column() {
        Row::new(RowType::Dense, 4).inc(4, 1.0);
    }

    #[proptest]
    fn serialization_consumes_exactly_the_row(
        #[strategy(0..3usize)] type_idx: usize,
        #[strategy(collection::vec((0..32i32, -100i32..100), 0..40))] updates: Vec<(i32, i32)>,
    ) {
        let row_type = [RowType::Dense, RowType::Sparse, RowType::SortedVector][type_idx];
        let mut row = Row::new(row_type, 32);
        for (col, delta) in &updates {
            row.inc(*col, *delta as f32);
        }
        let mut bytes = row.to_bytes();
        prop_assert_eq!(row.serialized_size(), bytes.len());
        bytes.extend_from_slice(&[0xAB; 3]);

        let mut reader = bytes.as_slice();
        let decoded = Row::deserialize(row_type, 32, &mut reader);
        prop_assert_eq!(3, reader.len());
        prop_assert_eq!(row.copy_to_vec(), decoded.copy_to_vec());
    }
}
