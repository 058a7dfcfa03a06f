use parking_lot::Mutex;

use super::row_oplog::RowOpLog;
use super::row_oplog::RowOpLogFactory;

/// Free list of reset row oplogs, drawn from before constructing new ones.
#[derive(Debug)]
pub struct RowOpLogRecycle {
    factory: RowOpLogFactory,
    free: Mutex<Vec<RowOpLog>>,
    max_free: usize,
}

impl RowOpLogRecycle {
    pub fn new(factory: RowOpLogFactory, max_free: usize) -> Self {
        Self {
            factory,
            free: Mutex::new(Vec::new()),
            max_free,
        }
    }

    pub fn factory(&self) -> &RowOpLogFactory {
        &self.factory
    }

    pub fn get(&self) -> RowOpLog {
        self.free.lock().pop().unwrap_or_else(|| self.factory.create())
    }

    /// Reset `oplog` and keep it for reuse, unless the free list is full.
    pub fn put_back(&self, mut oplog: RowOpLog) {
        let mut free = self.free.lock();
        if free.len() < self.max_free {
            oplog.reset();
            free.push(oplog);
        }
    }

    pub fn num_free(&self) -> usize {
        self.free.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_models::RowOpLogType;

    #[test]
    fn recycled_oplogs_come_back_pristine() {
        let factory = RowOpLogFactory::new(RowOpLogType::Sparse, 8, true);
        let recycle = RowOpLogRecycle::new(factory, 1);

        let mut oplog = recycle.get();
        oplog.inc(3, 2.0);
        oplog.meta_mut().unwrap().clock = 4;
        recycle.put_back(oplog);
        recycle.put_back(factory.create());
        assert_eq!(1, recycle.num_free());

        assert_eq!(factory.create(), recycle.get());
        assert_eq!(0, recycle.num_free());
    }
}
