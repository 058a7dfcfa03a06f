use std::collections::HashMap;

use rand::Rng;

use super::RowOpLogMeta;

/// Metas in a hash map; the in-order drain picks a uniformly random row.
#[derive(Debug, Default)]
pub struct RandomTableOpLogMeta {
    metas: HashMap<i32, RowOpLogMeta>,

    /// Row ids for O(1) random pick and removal.
    rows: Vec<i32>,
    positions: HashMap<i32, usize>,
    upto_rows: Vec<i32>,
}

impl RandomTableOpLogMeta {
    pub fn new() -> Self {
        Self::default()
    }

    pub(super) fn insert_merge(&mut self, row_id: i32, meta: RowOpLogMeta, accumulate: bool) {
        match self.metas.get_mut(&row_id) {
            Some(existing) => existing.merge(&meta, accumulate),
            None => {
                self.metas.insert(row_id, meta);
                self.positions.insert(row_id, self.rows.len());
                self.rows.push(row_id);
            }
        }
    }

    pub(super) fn prepare(&mut self, _num_rows_to_send: usize) {}

    fn remove(&mut self, row_id: i32) -> Option<RowOpLogMeta> {
        let meta = self.metas.remove(&row_id)?;
        if let Some(pos) = self.positions.remove(&row_id) {
            self.rows.swap_remove(pos);
            if let Some(moved) = self.rows.get(pos) {
                self.positions.insert(*moved, pos);
            }
        }
        Some(meta)
    }

    pub(super) fn get_and_clear_next_in_order(&mut self) -> Option<i32> {
        if self.rows.is_empty() {
            return None;
        }
        let pick = rand::rng().random_range(0..self.rows.len());
        let row_id = self.rows[pick];
        self.remove(row_id);
        Some(row_id)
    }

    pub(super) fn init_get_upto_clock(&mut self, clock: i32) {
        let mut upto: Vec<i32> = self
            .metas
            .iter()
            .filter(|(_, meta)| meta.clock <= clock)
            .map(|(row, _)| *row)
            .collect();
        // drained with pop(), so keep the lowest row id last
        upto.sort_unstable_by(|a, b| b.cmp(a));
        self.upto_rows = upto;
    }

    pub(super) fn get_and_clear_next_upto_clock(&mut self) -> Option<i32> {
        while let Some(row_id) = self.upto_rows.pop() {
            if self.remove(row_id).is_some() {
                return Some(row_id);
            }
        }
        None
    }

    pub(super) fn num_valid(&self) -> usize {
        self.metas.len()
    }

    pub(super) fn exists(&self, row_id: i32) -> bool {
        self.metas.contains_key(&row_id)
    }
}

/// Metas in an array indexed by row id. Each row in the sweep is selected
/// with probability `num_to_send / num_valid`, fixed by the last prepare.
#[derive(Debug)]
pub struct RandomTableOpLogMetaDense {
    metas: Vec<RowOpLogMeta>,
    num_valid: usize,
    select_prob: f64,
    next_idx: usize,
    upto_clock: i32,
    upto_idx: usize,
}

impl RandomTableOpLogMetaDense {
    pub fn new(num_rows: usize) -> Self {
        Self {
            metas: vec![RowOpLogMeta::default(); num_rows],
            num_valid: 0,
            select_prob: 1.0,
            next_idx: 0,
            upto_clock: -1,
            upto_idx: 0,
        }
    }

    fn slot(&self, row_id: i32) -> usize {
        match usize::try_from(row_id) {
            Ok(idx) if idx < self.metas.len() => idx,
            _ => panic!(
                "row {} outside dense oplog meta of {} rows",
                row_id,
                self.metas.len()
            ),
        }
    }

    pub(super) fn insert_merge(&mut self, row_id: i32, meta: RowOpLogMeta, accumulate: bool) {
        let idx = self.slot(row_id);
        if !self.metas[idx].is_valid() {
            self.num_valid += 1;
            self.metas[idx] = meta;
        } else {
            self.metas[idx].merge(&meta, accumulate);
        }
    }

    pub(super) fn prepare(&mut self, num_rows_to_send: usize) {
        self.select_prob = if self.num_valid == 0 {
            1.0
        } else {
            (num_rows_to_send as f64 / self.num_valid as f64).min(1.0)
        };
    }

    fn clear(&mut self, idx: usize) -> i32 {
        self.metas[idx] = RowOpLogMeta::default();
        self.num_valid -= 1;
        idx as i32
    }

    pub(super) fn get_and_clear_next_in_order(&mut self) -> Option<i32> {
        if self.num_valid == 0 {
            return None;
        }
        let len = self.metas.len();
        let mut rng = rand::rng();
        let mut first_valid = None;
        for offset in 0..len {
            let idx = (self.next_idx + offset) % len;
            if !self.metas[idx].is_valid() {
                continue;
            }
            first_valid.get_or_insert(idx);
            if rng.random_bool(self.select_prob) {
                self.next_idx = (idx + 1) % len;
                return Some(self.clear(idx));
            }
        }
        // a full sweep without a hit; take the first candidate so each call
        // makes progress
        let idx = first_valid?;
        self.next_idx = (idx + 1) % len;
        Some(self.clear(idx))
    }

    pub(super) fn init_get_upto_clock(&mut self, clock: i32) {
        self.upto_clock = clock;
        self.upto_idx = 0;
    }

    pub(super) fn get_and_clear_next_upto_clock(&mut self) -> Option<i32> {
        while self.upto_idx < self.metas.len() {
            let idx = self.upto_idx;
            self.upto_idx += 1;
            let meta = self.metas[idx];
            if meta.is_valid() && meta.clock <= self.upto_clock {
                return Some(self.clear(idx));
            }
        }
        None
    }

    pub(super) fn num_valid(&self) -> usize {
        self.num_valid
    }

    pub(super) fn exists(&self, row_id: i32) -> bool {
        usize::try_from(row_id)
            .ok()
            .and_then(|idx| self.metas.get(idx))
            .is_some_and(|meta| meta.is_valid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_pick_removes_row_and_keeps_index_consistent() {
        let mut meta = RandomTableOpLogMeta::new();
        for row in 0..50 {
            meta.insert_merge(row, RowOpLogMeta::new(0, 0.0), false);
        }
        let mut seen = std::collections::HashSet::new();
        while let Some(row) = meta.get_and_clear_next_in_order() {
            assert!(seen.insert(row));
            for (pos, row) in meta.rows.iter().enumerate() {
                assert_eq!(Some(&pos), meta.positions.get(row));
            }
        }
        assert_eq!(50, seen.len());
    }

    #[test]
    fn dense_probability_is_bounded_by_one() {
        let mut meta = RandomTableOpLogMetaDense::new(16);
        meta.insert_merge(3, RowOpLogMeta::new(0, 0.0), false);
        meta.prepare(10);
        assert_eq!(1.0, meta.select_prob);

        for row in 4..12 {
            meta.insert_merge(row, RowOpLogMeta::new(0, 0.0), false);
        }
        meta.prepare(3);
        assert!((meta.select_prob - 3.0 / 9.0).abs() < 1e-12);
    }
}
