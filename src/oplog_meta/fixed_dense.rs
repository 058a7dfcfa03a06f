use super::RowOpLogMeta;

/// Metas in an array indexed by row id. The in-order drain sweeps the array
/// cyclically and resumes where the previous round stopped.
#[derive(Debug)]
pub struct FixedTableOpLogMetaDense {
    metas: Vec<RowOpLogMeta>,
    num_valid: usize,
    next_idx: usize,
    upto_clock: i32,
    upto_idx: usize,
}

impl FixedTableOpLogMetaDense {
    pub fn new(num_rows: usize) -> Self {
        Self {
            metas: vec![RowOpLogMeta::default(); num_rows],
            num_valid: 0,
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

    pub(super) fn prepare(&mut self, _num_rows_to_send: usize) {}

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
        let idx = (0..len)
            .map(|offset| (self.next_idx + offset) % len)
            .find(|idx| self.metas[*idx].is_valid())?;
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
    fn in_order_drain_wraps_around() {
        let mut meta = FixedTableOpLogMetaDense::new(8);
        for row in [1, 5, 6] {
            meta.insert_merge(row, RowOpLogMeta::new(0, 0.0), false);
        }
        assert_eq!(Some(1), meta.get_and_clear_next_in_order());
        assert_eq!(Some(5), meta.get_and_clear_next_in_order());

        // row 2 lies behind the hand and is reached after the wrap
        meta.insert_merge(2, RowOpLogMeta::new(1, 0.0), false);
        assert_eq!(Some(6), meta.get_and_clear_next_in_order());
        assert_eq!(Some(2), meta.get_and_clear_next_in_order());
        assert_eq!(None, meta.get_and_clear_next_in_order());
    }

    #[test]
    #[should_panic(expected = "outside dense oplog meta")]
    fn rejects_rows_beyond_capacity() {
        FixedTableOpLogMetaDense::new(4).insert_merge(4, RowOpLogMeta::new(0, 0.0), false);
    }
}
