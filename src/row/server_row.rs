use std::collections::BTreeSet;

use bytes::BufMut;
use serde::Deserialize;
use serde::Serialize;

use super::Row;

/// Authoritative copy of a row held by a server thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRow {
    row: Row,

    /// Clients receiving this row on every push.
    subscribers: BTreeSet<i32>,

    /// Updated since the last push.
    dirty: bool,

    /// Bumped per applied batch when the table is versioned.
    version: Option<u64>,
}

impl ServerRow {
    pub fn new(row: Row, versioned: bool) -> Self {
        Self {
            row,
            subscribers: BTreeSet::new(),
            dirty: false,
            version: versioned.then_some(0),
        }
    }

    pub fn row(&self) -> &Row {
        &self.row
    }

    pub fn apply_batch_inc(&mut self, updates: &[(i32, f32)]) {
        for (col, delta) in updates {
            self.row.inc(*col, *delta);
        }
        self.dirty = true;
        if let Some(version) = self.version.as_mut() {
            *version += 1;
        }
    }

    /// Returns true if `client_id` was not subscribed before.
    pub fn subscribe(&mut self, client_id: i32) -> bool {
        self.subscribers.insert(client_id)
    }

    pub fn subscribers(&self) -> impl Iterator<Item = i32> + '_ {
        self.subscribers.iter().copied()
    }

    pub fn has_subscribers(&self) -> bool {
        !self.subscribers.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn reset_dirty(&mut self) {
        self.dirty = false;
    }

    pub fn version(&self) -> Option<u64> {
        self.version
    }

    pub fn serialized_size(&self) -> usize {
        self.row.serialized_size() + if self.version.is_some() { 8 } else { 0 }
    }

    /// Row payload, followed by the u64 version for versioned tables.
    pub fn serialize(&self, buf: &mut impl BufMut) {
        self.row.serialize(buf);
        if let Some(version) = self.version {
            buf.put_u64_le(version);
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Buf;

    use super::*;
    use crate::config_models::RowType;

    #[test]
    fn versioned_row_appends_version() {
        let mut row = ServerRow::new(Row::new(RowType::Dense, 2), true);
        row.apply_batch_inc(&[(0, 1.5)]);
        row.apply_batch_inc(&[(1, 2.5)]);
        assert!(row.is_dirty());

        let mut bytes = Vec::new();
        row.serialize(&mut bytes);
        assert_eq!(row.serialized_size(), bytes.len());

        let mut reader = bytes.as_slice();
        let decoded = Row::deserialize(RowType::Dense, 2, &mut reader);
        assert_eq!(vec![1.5, 2.5], decoded.to_dense());
        assert_eq!(2, reader.get_u64_le());
    }

    #[test]
    fn subscribe_reports_new_subscribers_only() {
        let mut row = ServerRow::new(Row::new(RowType::Sparse, 10), false);
        assert!(!row.has_subscribers());
        assert!(row.subscribe(1));
        assert!(!row.subscribe(1));
        assert!(row.subscribe(0));
        assert_eq!(vec![0, 1], row.subscribers().collect::<Vec<_>>());
        assert_eq!(None, row.version());
    }
}
