//! Scheduling metadata deciding which row oplogs a bg worker sends first.
//!
//! Every policy follows the same cycle: metas are merged in while oplogs are
//! collected, [`TableOpLogMeta::prepare`] fixes a selection for this round,
//! then the caller drains rows either in the policy's order or up to a clock.
//! Drained rows are cleared.

mod fixed_dense;
mod random;
mod value;

use std::cmp::Ordering;

pub use fixed_dense::FixedTableOpLogMetaDense;
pub use random::RandomTableOpLogMeta;
pub use random::RandomTableOpLogMetaDense;
pub use value::ValueTableOpLogMeta;
pub use value::ValueTableOpLogMetaApprox;

use crate::config_models::UpdateSortPolicy;

/// Scheduling state of one row's pending oplog.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RowOpLogMeta {
    /// Earliest clock at which the pending oplog was written; -1 when there
    /// is nothing pending.
    pub clock: i32,

    /// Accumulated magnitude of the unsent deltas.
    pub importance: f64,
}

impl Default for RowOpLogMeta {
    fn default() -> Self {
        Self {
            clock: -1,
            importance: 0.0,
        }
    }
}

impl RowOpLogMeta {
    pub fn new(clock: i32, importance: f64) -> Self {
        Self { clock, importance }
    }

    pub fn is_valid(&self) -> bool {
        self.clock >= 0
    }

    /// Keep the earlier clock; add importance when `accumulate` is set.
    pub fn merge(&mut self, other: &RowOpLogMeta, accumulate: bool) {
        if !self.is_valid() || (other.is_valid() && other.clock < self.clock) {
            self.clock = other.clock;
        }
        if accumulate {
            self.importance += other.importance;
        } else {
            self.importance = other.importance;
        }
    }
}

/// Ranking used by the importance-based policies: higher importance first,
/// lower row id on ties.
pub(crate) fn importance_order(a: (i32, f64), b: (i32, f64)) -> Ordering {
    b.1.total_cmp(&a.1).then(a.0.cmp(&b.0))
}

#[derive(Debug)]
pub enum TableOpLogMeta {
    FixedDense(FixedTableOpLogMetaDense),
    Random(RandomTableOpLogMeta),
    RandomDense(RandomTableOpLogMetaDense),
    Value(ValueTableOpLogMeta),
    ValueApprox(ValueTableOpLogMetaApprox),
}

macro_rules! with_policy {
    ($meta:expr, $p:ident => $body:expr) => {
        match $meta {
            TableOpLogMeta::FixedDense($p) => $body,
            TableOpLogMeta::Random($p) => $body,
            TableOpLogMeta::RandomDense($p) => $body,
            TableOpLogMeta::Value($p) => $body,
            TableOpLogMeta::ValueApprox($p) => $body,
        }
    };
}

impl TableOpLogMeta {
    /// `dense_num_rows` bounds row ids for the dense policies.
    pub fn new(
        policy: UpdateSortPolicy,
        dense_num_rows: usize,
        row_candidate_factor: usize,
    ) -> Self {
        match policy {
            UpdateSortPolicy::FixedOrder => {
                TableOpLogMeta::FixedDense(FixedTableOpLogMetaDense::new(dense_num_rows))
            }
            UpdateSortPolicy::Random => TableOpLogMeta::Random(RandomTableOpLogMeta::new()),
            UpdateSortPolicy::RandomDense => {
                TableOpLogMeta::RandomDense(RandomTableOpLogMetaDense::new(dense_num_rows))
            }
            UpdateSortPolicy::RelativeMagnitude => {
                TableOpLogMeta::Value(ValueTableOpLogMeta::new())
            }
            UpdateSortPolicy::RelativeMagnitudeApprox => {
                TableOpLogMeta::ValueApprox(ValueTableOpLogMetaApprox::new(row_candidate_factor))
            }
        }
    }

    fn accumulates_importance(&self) -> bool {
        matches!(
            self,
            TableOpLogMeta::Value(_) | TableOpLogMeta::ValueApprox(_)
        )
    }

    pub fn insert_merge_row_oplog_meta(&mut self, row_id: i32, meta: RowOpLogMeta) {
        let accumulate = self.accumulates_importance();
        with_policy!(self, p => p.insert_merge(row_id, meta, accumulate))
    }

    pub fn prepare(&mut self, num_rows_to_send: usize) {
        with_policy!(self, p => p.prepare(num_rows_to_send))
    }

    /// Next row in this policy's order, cleared on return.
    pub fn get_and_clear_next_in_order(&mut self) -> Option<i32> {
        with_policy!(self, p => p.get_and_clear_next_in_order())
    }

    pub fn init_get_upto_clock(&mut self, clock: i32) {
        with_policy!(self, p => p.init_get_upto_clock(clock))
    }

    /// Next row whose meta clock is at or before the clock given to
    /// [`TableOpLogMeta::init_get_upto_clock`], cleared on return.
    pub fn get_and_clear_next_upto_clock(&mut self) -> Option<i32> {
        with_policy!(self, p => p.get_and_clear_next_upto_clock())
    }

    pub fn get_num_row_oplogs(&self) -> usize {
        with_policy!(self, p => p.num_valid())
    }

    pub fn exists(&self, row_id: i32) -> bool {
        with_policy!(self, p => p.exists(row_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_policies() -> Vec<TableOpLogMeta> {
        [
            UpdateSortPolicy::FixedOrder,
            UpdateSortPolicy::Random,
            UpdateSortPolicy::RandomDense,
            UpdateSortPolicy::RelativeMagnitude,
            UpdateSortPolicy::RelativeMagnitudeApprox,
        ]
        .into_iter()
        .map(|policy| TableOpLogMeta::new(policy, 64, 4))
        .collect()
    }

    #[test]
    fn merge_keeps_earlier_clock() {
        let mut meta = RowOpLogMeta::default();
        meta.merge(&RowOpLogMeta::new(4, 1.0), true);
        meta.merge(&RowOpLogMeta::new(2, 2.0), true);
        meta.merge(&RowOpLogMeta::new(7, 0.5), true);
        assert_eq!(RowOpLogMeta::new(2, 3.5), meta);

        meta.merge(&RowOpLogMeta::new(9, 0.25), false);
        assert_eq!(RowOpLogMeta::new(2, 0.25), meta);
    }

    #[test]
    fn every_policy_drains_each_row_exactly_once() {
        for mut meta in all_policies() {
            for row in [3, 17, 42, 8] {
                meta.insert_merge_row_oplog_meta(row, RowOpLogMeta::new(1, f64::from(row)));
            }
            meta.insert_merge_row_oplog_meta(17, RowOpLogMeta::new(0, 1.0));
            assert_eq!(4, meta.get_num_row_oplogs());

            meta.prepare(4);
            let mut drained = vec![];
            while let Some(row) = meta.get_and_clear_next_in_order() {
                drained.push(row);
            }
            drained.sort_unstable();
            assert_eq!(vec![3, 8, 17, 42], drained, "{:?}", meta);
            assert_eq!(0, meta.get_num_row_oplogs());
            assert!(!meta.exists(3));
        }
    }

    #[test]
    fn upto_clock_drain_skips_later_rows() {
        for mut meta in all_policies() {
            meta.insert_merge_row_oplog_meta(1, RowOpLogMeta::new(0, 1.0));
            meta.insert_merge_row_oplog_meta(2, RowOpLogMeta::new(3, 1.0));
            meta.insert_merge_row_oplog_meta(5, RowOpLogMeta::new(1, 1.0));

            meta.init_get_upto_clock(1);
            let mut drained = vec![];
            while let Some(row) = meta.get_and_clear_next_upto_clock() {
                drained.push(row);
            }
            drained.sort_unstable();
            assert_eq!(vec![1, 5], drained, "{:?}", meta);
            assert!(meta.exists(2));
            assert_eq!(1, meta.get_num_row_oplogs());
        }
    }

    #[test]
    fn value_policy_drains_by_importance() {
        let (a, b, c) = (10, 11, 12);
        let mut meta = TableOpLogMeta::new(UpdateSortPolicy::RelativeMagnitude, 0, 1);
        meta.insert_merge_row_oplog_meta(a, RowOpLogMeta::new(0, 5.0));
        meta.insert_merge_row_oplog_meta(b, RowOpLogMeta::new(0, 20.0));
        meta.insert_merge_row_oplog_meta(c, RowOpLogMeta::new(0, 1.0));
        meta.prepare(3);

        assert_eq!(Some(b), meta.get_and_clear_next_in_order());
        assert_eq!(Some(a), meta.get_and_clear_next_in_order());
        assert_eq!(Some(c), meta.get_and_clear_next_in_order());
        assert_eq!(None, meta.get_and_clear_next_in_order());
    }

    #[test]
    fn importance_ties_break_on_lower_row_id() {
        for policy in [
            UpdateSortPolicy::RelativeMagnitude,
            UpdateSortPolicy::RelativeMagnitudeApprox,
        ] {
            let mut meta = TableOpLogMeta::new(policy, 0, 10);
            for row in [9, 4, 6] {
                meta.insert_merge_row_oplog_meta(row, RowOpLogMeta::new(0, 2.0));
            }
            meta.prepare(3);
            assert_eq!(Some(4), meta.get_and_clear_next_in_order());
            assert_eq!(Some(6), meta.get_and_clear_next_in_order());
            assert_eq!(Some(9), meta.get_and_clear_next_in_order());
        }
    }
}
