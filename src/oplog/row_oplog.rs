use std::collections::HashMap;

use bytes::Buf;
use bytes::BufMut;

use super::update_codec::UpdateCodec;
use crate::config_models::RowOpLogType;
use crate::oplog_meta::RowOpLogMeta;
use crate::row::Row;

/// Deltas for a fixed range of columns `0..capacity`.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseRowOpLog {
    deltas: Vec<f32>,
}

/// Deltas keyed by column in a hash map; iteration sorts the keys.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseRowOpLog {
    deltas: HashMap<i32, f32>,
    capacity: usize,
}

/// Deltas in a column-sorted vector.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseVectorRowOpLog {
    deltas: Vec<(i32, f32)>,
    capacity: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RowOpLogStore {
    Dense(DenseRowOpLog),
    Sparse(SparseRowOpLog),
    SparseVector(SparseVectorRowOpLog),
}

macro_rules! with_store {
    ($store:expr, $s:ident => $body:expr) => {
        match $store {
            RowOpLogStore::Dense($s) => $body,
            RowOpLogStore::Sparse($s) => $body,
            RowOpLogStore::SparseVector($s) => $body,
        }
    };
}

impl DenseRowOpLog {
    fn new(capacity: usize) -> Self {
        Self {
            deltas: vec![0.0; capacity],
        }
    }

    fn index(&self, col: i32) -> Option<usize> {
        usize::try_from(col).ok().filter(|c| *c < self.deltas.len())
    }

    fn find(&self, col: i32) -> Option<f32> {
        self.index(col).map(|c| self.deltas[c])
    }

    fn find_mut(&mut self, col: i32) -> Option<&mut f32> {
        let idx = self.index(col)?;
        Some(&mut self.deltas[idx])
    }

    fn find_create(&mut self, col: i32) -> &mut f32 {
        match self.index(col) {
            Some(idx) => &mut self.deltas[idx],
            None => panic!(
                "column {} outside dense row oplog of capacity {}",
                col,
                self.deltas.len()
            ),
        }
    }

    fn entries(&self) -> Vec<(i32, f32)> {
        (0i32..).zip(self.deltas.iter().copied()).collect()
    }

    fn for_each_mut(&mut self, mut f: impl FnMut(i32, &mut f32)) {
        for (col, delta) in (0i32..).zip(self.deltas.iter_mut()) {
            f(col, delta);
        }
    }

    fn size(&self) -> usize {
        self.deltas.len()
    }

    fn clear_zeros_and_get_non_zero_size(&mut self) -> usize {
        self.deltas.iter().filter(|d| **d != 0.0).count()
    }

    fn capacity(&self) -> usize {
        self.deltas.len()
    }

    fn reset(&mut self) {
        self.deltas.iter_mut().for_each(|d| *d = 0.0);
    }
}

impl SparseRowOpLog {
    fn find(&self, col: i32) -> Option<f32> {
        self.deltas.get(&col).copied()
    }

    fn find_mut(&mut self, col: i32) -> Option<&mut f32> {
        self.deltas.get_mut(&col)
    }

    fn find_create(&mut self, col: i32) -> &mut f32 {
        self.deltas.entry(col).or_insert(0.0)
    }

    fn entries(&self) -> Vec<(i32, f32)> {
        let mut entries: Vec<(i32, f32)> = self.deltas.iter().map(|(c, d)| (*c, *d)).collect();
        entries.sort_unstable_by_key(|e| e.0);
        entries
    }

    fn for_each_mut(&mut self, mut f: impl FnMut(i32, &mut f32)) {
        let mut cols: Vec<i32> = self.deltas.keys().copied().collect();
        cols.sort_unstable();
        for col in cols {
            if let Some(delta) = self.deltas.get_mut(&col) {
                f(col, delta);
            }
        }
    }

    fn size(&self) -> usize {
        self.deltas.len()
    }

    fn clear_zeros_and_get_non_zero_size(&mut self) -> usize {
        self.deltas.retain(|_, d| *d != 0.0);
        self.deltas.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn reset(&mut self) {
        self.deltas.clear();
    }
}

impl SparseVectorRowOpLog {
    fn find(&self, col: i32) -> Option<f32> {
        self.deltas
            .binary_search_by_key(&col, |e| e.0)
            .ok()
            .map(|idx| self.deltas[idx].1)
    }

    fn find_mut(&mut self, col: i32) -> Option<&mut f32> {
        let idx = self.deltas.binary_search_by_key(&col, |e| e.0).ok()?;
        Some(&mut self.deltas[idx].1)
    }

    fn find_create(&mut self, col: i32) -> &mut f32 {
        let idx = match self.deltas.binary_search_by_key(&col, |e| e.0) {
            Ok(idx) => idx,
            Err(idx) => {
                self.deltas.insert(idx, (col, 0.0));
                idx
            }
        };
        &mut self.deltas[idx].1
    }

    fn entries(&self) -> Vec<(i32, f32)> {
        self.deltas.clone()
    }

    fn for_each_mut(&mut self, mut f: impl FnMut(i32, &mut f32)) {
        for (col, delta) in &mut self.deltas {
            f(*col, delta);
        }
    }

    fn size(&self) -> usize {
        self.deltas.len()
    }

    fn clear_zeros_and_get_non_zero_size(&mut self) -> usize {
        self.deltas.retain(|e| e.1 != 0.0);
        self.deltas.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn reset(&mut self) {
        self.deltas.clear();
    }
}

/// Updates decoded from a serialized row oplog.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRowOpLog {
    pub updates: Vec<(i32, f32)>,

    /// Bytes consumed from the input.
    pub serialized_size: usize,
}

/// Accumulated, not yet sent deltas of one row.
///
/// Carries a version stamp for the versioned variant and, when the table is
/// scheduled by importance, the row's [`RowOpLogMeta`].
#[derive(Debug, Clone, PartialEq)]
pub struct RowOpLog {
    oplog_type: RowOpLogType,
    store: RowOpLogStore,
    version: u32,
    meta: Option<RowOpLogMeta>,
}

impl RowOpLog {
    pub fn oplog_type(&self) -> RowOpLogType {
        self.oplog_type
    }

    pub fn find(&self, col: i32) -> Option<f32> {
        with_store!(&self.store, s => s.find(col))
    }

    pub fn find_mut(&mut self, col: i32) -> Option<&mut f32> {
        with_store!(&mut self.store, s => s.find_mut(col))
    }

    /// # Panics
    /// If a dense oplog is indexed outside its capacity.
    pub fn find_create(&mut self, col: i32) -> &mut f32 {
        with_store!(&mut self.store, s => s.find_create(col))
    }

    pub fn inc(&mut self, col: i32, delta: f32) {
        *self.find_create(col) += delta;
    }

    pub fn batch_inc(&mut self, cols: &[i32], deltas: &[f32]) {
        for (col, delta) in cols.iter().zip(deltas) {
            self.inc(*col, *delta);
        }
    }

    pub fn dense_batch_inc(&mut self, index_st: i32, deltas: &[f32]) {
        for (col, delta) in (index_st..).zip(deltas) {
            self.inc(col, *delta);
        }
    }

    /// Entries in ascending column order. Dense oplogs yield every column.
    pub fn entries(&self) -> Vec<(i32, f32)> {
        with_store!(&self.store, s => s.entries())
    }

    /// Visit entries mutably in ascending column order.
    pub fn for_each_mut(&mut self, f: impl FnMut(i32, &mut f32)) {
        with_store!(&mut self.store, s => s.for_each_mut(f))
    }

    pub fn get_size(&self) -> usize {
        with_store!(&self.store, s => s.size())
    }

    /// Drop entries whose accumulated delta is exactly zero and count the
    /// rest. Dense oplogs keep their slots and only count.
    pub fn clear_zeros_and_get_non_zero_size(&mut self) -> usize {
        with_store!(&mut self.store, s => s.clear_zeros_and_get_non_zero_size())
    }

    pub fn is_dense(&self) -> bool {
        matches!(self.store, RowOpLogStore::Dense(_))
    }

    /// Columns covered by the dense serialization.
    pub fn dense_capacity(&self) -> usize {
        with_store!(&self.store, s => s.capacity())
    }

    fn non_zero_entries(&self) -> Vec<(i32, f32)> {
        let mut entries = self.entries();
        entries.retain(|e| e.1 != 0.0);
        entries
    }

    /// Sparse serialized size of `num_updates` updates.
    pub fn sparse_size_of(num_updates: usize, codec: UpdateCodec) -> usize {
        4 + num_updates * (4 + codec.update_size())
    }

    /// Dense serialized size of `capacity` columns.
    pub fn dense_size_of(capacity: usize, codec: UpdateCodec) -> usize {
        4 + capacity * codec.update_size()
    }

    pub fn sparse_serialized_size(&self, codec: UpdateCodec) -> usize {
        Self::sparse_size_of(self.non_zero_entries().len(), codec)
    }

    pub fn dense_serialized_size(&self, codec: UpdateCodec) -> usize {
        Self::dense_size_of(self.dense_capacity(), codec)
    }

    /// `[i32 n][i32 col × n][update × n]`, non-zero entries only. Returns the
    /// number of bytes written.
    pub fn serialize_sparse(&self, codec: UpdateCodec, buf: &mut impl BufMut) -> usize {
        let entries = self.non_zero_entries();
        buf.put_i32_le(entries.len() as i32);
        for (col, _) in &entries {
            buf.put_i32_le(*col);
        }
        for (_, delta) in &entries {
            codec.put(buf, *delta);
        }
        Self::sparse_size_of(entries.len(), codec)
    }

    /// `[i32 n][update × n]` for columns `0..n`. Returns the number of bytes
    /// written.
    pub fn serialize_dense(&self, codec: UpdateCodec, buf: &mut impl BufMut) -> usize {
        let capacity = self.dense_capacity();
        buf.put_i32_le(capacity as i32);
        match &self.store {
            RowOpLogStore::Dense(dense) => {
                for delta in &dense.deltas {
                    codec.put(buf, *delta);
                }
            }
            store => {
                let mut values = vec![0.0f32; capacity];
                for (col, delta) in with_store!(store, s => s.entries()) {
                    if let Some(slot) = usize::try_from(col).ok().and_then(|c| values.get_mut(c)) {
                        *slot = delta;
                    }
                }
                for value in values {
                    codec.put(buf, value);
                }
            }
        }
        Self::dense_size_of(capacity, codec)
    }

    pub fn parse_sparse_serialized(codec: UpdateCodec, buf: &mut impl Buf) -> ParsedRowOpLog {
        let num_updates = usize::try_from(buf.get_i32_le()).unwrap_or_default();
        let cols: Vec<i32> = (0..num_updates).map(|_| buf.get_i32_le()).collect();
        let updates = cols.into_iter().map(|col| (col, codec.get(buf))).collect();
        ParsedRowOpLog {
            updates,
            serialized_size: 4 + num_updates * (4 + codec.update_size()),
        }
    }

    /// Column ids start at `index_st`.
    pub fn parse_dense_serialized(
        codec: UpdateCodec,
        index_st: i32,
        buf: &mut impl Buf,
    ) -> ParsedRowOpLog {
        let num_updates = usize::try_from(buf.get_i32_le()).unwrap_or_default();
        let updates = (index_st..)
            .take(num_updates)
            .map(|col| (col, codec.get(buf)))
            .collect();
        ParsedRowOpLog {
            updates,
            serialized_size: 4 + num_updates * codec.update_size(),
        }
    }

    /// Replace the deltas of columns `index_st..` with `deltas`.
    pub fn overwrite_with_dense_update(&mut self, deltas: &[f32], index_st: i32) {
        for (col, delta) in (index_st..).zip(deltas) {
            *self.find_create(col) = *delta;
        }
    }

    /// Add every delta to `row`.
    pub fn apply_to_row(&self, row: &mut Row) {
        for (col, delta) in self.entries() {
            if delta != 0.0 {
                row.inc(col, delta);
            }
        }
    }

    /// Back to the state of a freshly created oplog.
    pub fn reset(&mut self) {
        with_store!(&mut self.store, s => s.reset());
        self.version = 0;
        if let Some(meta) = self.meta.as_mut() {
            *meta = RowOpLogMeta::default();
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Versioned oplogs count the batches folded into them.
    pub fn bump_version(&mut self) {
        if self.oplog_type == RowOpLogType::VersionDense {
            self.version = self.version.wrapping_add(1);
        }
    }

    pub fn meta(&self) -> Option<&RowOpLogMeta> {
        self.meta.as_ref()
    }

    pub fn meta_mut(&mut self) -> Option<&mut RowOpLogMeta> {
        self.meta.as_mut()
    }
}

/// Builds row oplogs of the type configured for a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowOpLogFactory {
    oplog_type: RowOpLogType,
    capacity: usize,
    with_meta: bool,
}

impl RowOpLogFactory {
    /// `capacity` is the dense column range; sparse variants use it only for
    /// dense serialization. `with_meta` attaches scheduling metadata.
    pub fn new(oplog_type: RowOpLogType, capacity: usize, with_meta: bool) -> Self {
        Self {
            oplog_type,
            capacity,
            with_meta,
        }
    }

    pub fn oplog_type(&self) -> RowOpLogType {
        self.oplog_type
    }

    pub fn create(&self) -> RowOpLog {
        let store = match self.oplog_type {
            RowOpLogType::Dense | RowOpLogType::VersionDense | RowOpLogType::Float16Dense => {
                RowOpLogStore::Dense(DenseRowOpLog::new(self.capacity))
            }
            RowOpLogType::Sparse => RowOpLogStore::Sparse(SparseRowOpLog {
                deltas: HashMap::new(),
                capacity: self.capacity,
            }),
            RowOpLogType::SparseVector => RowOpLogStore::SparseVector(SparseVectorRowOpLog {
                deltas: Vec::new(),
                capacity: self.capacity,
            }),
        };
        RowOpLog {
            oplog_type: self.oplog_type,
            store,
            version: 0,
            meta: self.with_meta.then(RowOpLogMeta::default),
        }
    }
}
