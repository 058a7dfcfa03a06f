use std::collections::HashMap;

use parking_lot::Mutex;
use parking_lot::MutexGuard;

/// Hash map keyed by row id, split into independently locked stripes.
///
/// All mutation of one row happens under its stripe lock, so two threads
/// touching different stripes never contend.
#[derive(Debug)]
pub struct StripedMap<V> {
    stripes: Vec<Mutex<HashMap<i32, V>>>,
}

impl<V> StripedMap<V> {
    pub fn new(num_stripes: usize) -> Self {
        let num_stripes = num_stripes.max(1);
        Self {
            stripes: (0..num_stripes).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    pub fn stripe_of(&self, row_id: i32) -> usize {
        // row ids are dense small integers in practice; spread neighbours
        let mixed = (row_id as u32).wrapping_mul(0x9e37_79b9);
        (mixed as usize) % self.stripes.len()
    }

    /// Lock the stripe holding `row_id`.
    pub fn lock(&self, row_id: i32) -> MutexGuard<'_, HashMap<i32, V>> {
        self.stripes[self.stripe_of(row_id)].lock()
    }

    pub fn num_stripes(&self) -> usize {
        self.stripes.len()
    }

    pub fn lock_stripe(&self, stripe: usize) -> MutexGuard<'_, HashMap<i32, V>> {
        self.stripes[stripe].lock()
    }

    /// Sum of the stripe sizes. Not a snapshot: stripes are locked one at a
    /// time.
    pub fn len(&self) -> usize {
        self.stripes.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Row ids currently present, in ascending order.
    pub fn keys(&self) -> Vec<i32> {
        let mut keys: Vec<i32> = self
            .stripes
            .iter()
            .flat_map(|s| s.lock().keys().copied().collect::<Vec<_>>())
            .collect();
        keys.sort_unstable();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_land_in_their_stripe() {
        let map: StripedMap<i32> = StripedMap::new(8);
        for row in 0..100 {
            map.lock(row).insert(row, row * 2);
        }
        assert_eq!(100, map.len());
        for row in 0..100 {
            let stripe = map.stripe_of(row);
            assert_eq!(Some(&(row * 2)), map.lock_stripe(stripe).get(&row));
        }
        assert_eq!((0..100).collect::<Vec<_>>(), map.keys());
    }

    #[test]
    fn zero_stripes_rounds_up_to_one() {
        let map: StripedMap<()> = StripedMap::new(0);
        assert_eq!(1, map.num_stripes());
        assert!(map.is_empty());
    }
}
