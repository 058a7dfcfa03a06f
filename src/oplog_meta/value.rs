use std::cmp::Ordering;
use std::collections::HashMap;

use priority_queue::PriorityQueue;
use rand::seq::index;

use super::importance_order;
use super::RowOpLogMeta;

/// Heap key: larger importance wins, then the lower row id.
#[derive(Debug, Clone, Copy)]
struct ValuePriority {
    importance: f64,
    row_id: i32,
}

impl PartialEq for ValuePriority {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ValuePriority {}

impl PartialOrd for ValuePriority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ValuePriority {
    fn cmp(&self, other: &Self) -> Ordering {
        self.importance
            .total_cmp(&other.importance)
            .then(other.row_id.cmp(&self.row_id))
    }
}

/// Exact importance ranking on a binary max-heap.
#[derive(Debug, Default)]
pub struct ValueTableOpLogMeta {
    queue: PriorityQueue<i32, ValuePriority>,
    metas: HashMap<i32, RowOpLogMeta>,
    upto_rows: Vec<i32>,
}

impl ValueTableOpLogMeta {
    pub fn new() -> Self {
        Self::default()
    }

    pub(super) fn insert_merge(&mut self, row_id: i32, meta: RowOpLogMeta, accumulate: bool) {
        let merged = match self.metas.get_mut(&row_id) {
            Some(existing) => {
                existing.merge(&meta, accumulate);
                *existing
            }
            None => {
                self.metas.insert(row_id, meta);
                meta
            }
        };
        let priority = ValuePriority {
            importance: merged.importance,
            row_id,
        };
        self.queue.push(row_id, priority);
    }

    pub(super) fn prepare(&mut self, _num_rows_to_send: usize) {}

    pub(super) fn get_and_clear_next_in_order(&mut self) -> Option<i32> {
        let (row_id, _) = self.queue.pop()?;
        self.metas.remove(&row_id);
        Some(row_id)
    }

    pub(super) fn init_get_upto_clock(&mut self, clock: i32) {
        let mut upto: Vec<i32> = self
            .metas
            .iter()
            .filter(|(_, meta)| meta.clock <= clock)
            .map(|(row, _)| *row)
            .collect();
        upto.sort_unstable_by(|a, b| b.cmp(a));
        self.upto_rows = upto;
    }

    pub(super) fn get_and_clear_next_upto_clock(&mut self) -> Option<i32> {
        while let Some(row_id) = self.upto_rows.pop() {
            if self.metas.remove(&row_id).is_some() {
                self.queue.remove(&row_id);
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

/// Approximate importance ranking: each prepare samples a bounded candidate
/// set and sorts only that.
#[derive(Debug)]
pub struct ValueTableOpLogMetaApprox {
    metas: HashMap<i32, RowOpLogMeta>,
    row_candidate_factor: usize,

    /// Candidates in drain order, reversed so `pop` yields the next one.
    candidates: Vec<i32>,
    upto_rows: Vec<i32>,
}

impl ValueTableOpLogMetaApprox {
    pub fn new(row_candidate_factor: usize) -> Self {
        Self {
            metas: HashMap::new(),
            row_candidate_factor: row_candidate_factor.max(1),
            candidates: Vec::new(),
            upto_rows: Vec::new(),
        }
    }

    pub(super) fn insert_merge(&mut self, row_id: i32, meta: RowOpLogMeta, accumulate: bool) {
        match self.metas.get_mut(&row_id) {
            Some(existing) => existing.merge(&meta, accumulate),
            None => {
                self.metas.insert(row_id, meta);
            }
        }
    }

    pub(super) fn prepare(&mut self, num_rows_to_send: usize) {
        let num_candidates = self.row_candidate_factor.saturating_mul(num_rows_to_send.max(1));
        let all_rows: Vec<i32> = self.metas.keys().copied().collect();
        let sampled: Vec<i32> = if all_rows.len() <= num_candidates {
            all_rows
        } else {
            index::sample(&mut rand::rng(), all_rows.len(), num_candidates)
                .into_iter()
                .map(|idx| all_rows[idx])
                .collect()
        };
        let mut ranked: Vec<(i32, f64)> = sampled
            .into_iter()
            .map(|row| (row, self.metas[&row].importance))
            .collect();
        ranked.sort_unstable_by(|a, b| importance_order(*a, *b));
        self.candidates = ranked.into_iter().rev().map(|(row, _)| row).collect();
    }

    pub(super) fn get_and_clear_next_in_order(&mut self) -> Option<i32> {
        while let Some(row_id) = self.candidates.pop() {
            if self.metas.remove(&row_id).is_some() {
                return Some(row_id);
            }
        }
        None
    }

    pub(super) fn init_get_upto_clock(&mut self, clock: i32) {
        let mut upto: Vec<i32> = self
            .metas
            .iter()
            .filter(|(_, meta)| meta.clock <= clock)
            .map(|(row, _)| *row)
            .collect();
        upto.sort_unstable_by(|a, b| b.cmp(a));
        self.upto_rows = upto;
    }

    pub(super) fn get_and_clear_next_upto_clock(&mut self) -> Option<i32> {
        while let Some(row_id) = self.upto_rows.pop() {
            if self.metas.remove(&row_id).is_some() {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merged_importance_reorders_heap() {
        let mut meta = ValueTableOpLogMeta::new();
        meta.insert_merge(1, RowOpLogMeta::new(0, 3.0), true);
        meta.insert_merge(2, RowOpLogMeta::new(0, 4.0), true);
        meta.insert_merge(1, RowOpLogMeta::new(1, 2.0), true);
        assert_eq!(Some(1), meta.get_and_clear_next_in_order());
        assert_eq!(Some(2), meta.get_and_clear_next_in_order());
        assert_eq!(None, meta.get_and_clear_next_in_order());
    }

    #[test]
    fn approx_limits_candidates_per_round() {
        let mut meta = ValueTableOpLogMetaApprox::new(2);
        for row in 0..100 {
            meta.insert_merge(row, RowOpLogMeta::new(0, f64::from(row)), true);
        }
        meta.prepare(3);
        let mut drained = vec![];
        while let Some(row) = meta.get_and_clear_next_in_order() {
            drained.push(row);
        }
        assert_eq!(6, drained.len());

        // importance equals row id here
        assert!(drained.windows(2).all(|w| w[0] > w[1]));
        assert_eq!(94, meta.num_valid());
    }
}
