use std::collections::HashMap;

use parking_lot::Mutex;

use crate::config_models::entity_id::EntityId;

/// Logical clocks of a set of entities together with their minimum.
///
/// Clocks never decrease. [`VectorClock::tick`] reports a new minimum only
/// when the ticking entity was the unique slowest one; every other tick has no
/// globally observable effect.
#[derive(Debug, Clone)]
pub struct VectorClock {
    clocks: HashMap<EntityId, i32>,

    /// -1 while no entity is tracked.
    min_clock: i32,
}

impl Default for VectorClock {
    fn default() -> Self {
        Self::new()
    }
}

impl VectorClock {
    pub fn new() -> Self {
        Self {
            clocks: HashMap::new(),
            min_clock: -1,
        }
    }

    /// All `ids` start at clock 0.
    pub fn with_ids(ids: impl IntoIterator<Item = EntityId>) -> Self {
        let mut clock = Self::new();
        for id in ids {
            clock.add_clock(id, 0);
        }
        clock
    }

    /// Start tracking `id` at `clock`. Returns false if `id` is already
    /// tracked, in which case nothing changes.
    pub fn add_clock(&mut self, id: EntityId, clock: i32) -> bool {
        if self.clocks.contains_key(&id) {
            return false;
        }
        self.clocks.insert(id, clock);
        if self.min_clock == -1 || clock < self.min_clock {
            self.min_clock = clock;
        }
        true
    }

    /// Stop tracking `id`. Returns the new minimum if it advanced.
    pub fn remove_clock(&mut self, id: EntityId) -> Option<i32> {
        let removed = self.clocks.remove(&id)?;
        if removed != self.min_clock {
            return None;
        }
        let new_min = self.clocks.values().copied().min().unwrap_or(-1);
        let advanced = new_min > self.min_clock;
        self.min_clock = new_min;
        advanced.then_some(new_min)
    }

    /// Advance `id` by one. Returns the new minimum if `id` was the unique
    /// slowest entity.
    ///
    /// # Panics
    /// If `id` is not tracked.
    pub fn tick(&mut self, id: EntityId) -> Option<i32> {
        let old_clock = self.clock_of(id);
        let was_unique_min =
            old_clock == self.min_clock && !self.is_shared_min(id, old_clock);
        self.clocks.insert(id, old_clock + 1);
        if was_unique_min {
            self.min_clock += 1;
            Some(self.min_clock)
        } else {
            None
        }
    }

    /// Tick `id` until it reaches `clock`. Returns the latest new minimum
    /// observed along the way, if any. A target at or below the current clock
    /// is a no-op.
    pub fn tick_until(&mut self, id: EntityId, clock: i32) -> Option<i32> {
        let mut new_min = None;
        while self.clock_of(id) < clock {
            if let Some(min) = self.tick(id) {
                new_min = Some(min);
            }
        }
        new_min
    }

    pub fn get_clock(&self, id: EntityId) -> Option<i32> {
        self.clocks.get(&id).copied()
    }

    pub fn get_min_clock(&self) -> i32 {
        self.min_clock
    }

    pub fn len(&self) -> usize {
        self.clocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clocks.is_empty()
    }

    fn clock_of(&self, id: EntityId) -> i32 {
        match self.clocks.get(&id) {
            Some(clock) => *clock,
            None => panic!("entity {} is not tracked by this vector clock", id),
        }
    }

    fn is_shared_min(&self, id: EntityId, clock: i32) -> bool {
        self.clocks
            .iter()
            .any(|(other, other_clock)| *other != id && *other_clock == clock)
    }
}

/// [`VectorClock`] behind a mutex, for clocks shared by application threads.
#[derive(Debug, Default)]
pub struct VectorClockMt {
    inner: Mutex<VectorClock>,
}

impl VectorClockMt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_clock(&self, id: EntityId, clock: i32) -> bool {
        self.inner.lock().add_clock(id, clock)
    }

    pub fn remove_clock(&self, id: EntityId) -> Option<i32> {
        self.inner.lock().remove_clock(id)
    }

    pub fn tick(&self, id: EntityId) -> Option<i32> {
        self.inner.lock().tick(id)
    }

    pub fn tick_until(&self, id: EntityId, clock: i32) -> Option<i32> {
        self.inner.lock().tick_until(id, clock)
    }

    pub fn get_clock(&self, id: EntityId) -> Option<i32> {
        self.inner.lock().get_clock(id)
    }

    pub fn get_min_clock(&self) -> i32 {
        self.inner.lock().get_min_clock()
    }
}
