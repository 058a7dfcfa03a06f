//! Append-only oplog: application threads append raw increments to private
//! byte buffers; full buffers are queued for the bg worker, which replays them
//! into per-row oplogs and hands the buffer back to its owner's pool.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Buf;
use bytes::BufMut;
use itertools::Itertools;
use parking_lot::Condvar;
use parking_lot::Mutex;

use super::row_oplog::RowOpLog;
use super::row_oplog::RowOpLogFactory;
use super::update_codec::UpdateCodec;
use crate::config_models::AppendOnlyOpLogType;

/// Shape of the buffers of one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendBufferConfig {
    pub kind: AppendOnlyOpLogType,
    pub codec: UpdateCodec,

    /// Buffer size in bytes.
    pub capacity: usize,

    /// Columns per record of a dense buffer.
    pub row_capacity: usize,
    pub pool_size: usize,
}

/// One thread's buffer of raw update records.
///
/// Layouts: `Inc` holds `[i32 row][i32 col][update]` records, `BatchInc`
/// holds `[i32 row][i32 n][i32 col × n][update × n]`, `DenseBatchInc` holds
/// `[i32 row][update × row_capacity]`.
#[derive(Debug)]
pub struct AppendOnlyBuffer {
    config: AppendBufferConfig,
    owner: i32,
    buf: Vec<u8>,
}

impl AppendOnlyBuffer {
    pub fn new(config: AppendBufferConfig, owner: i32) -> Self {
        Self {
            config,
            owner,
            buf: Vec::with_capacity(config.capacity),
        }
    }

    pub fn owner(&self) -> i32 {
        self.owner
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn reset(&mut self) {
        self.buf.clear();
    }

    fn fits(&self, num_bytes: usize) -> bool {
        self.buf.len() + num_bytes <= self.config.capacity
    }

    fn dense_record_size(&self) -> usize {
        4 + self.config.row_capacity * self.config.codec.update_size()
    }

    fn put_dense_record(&mut self, row_id: i32, updates: impl Iterator<Item = (i32, f32)>) {
        let mut values = vec![0.0f32; self.config.row_capacity];
        for (col, delta) in updates {
            match usize::try_from(col).ok().and_then(|c| values.get_mut(c)) {
                Some(slot) => *slot += delta,
                None => panic!(
                    "column {} outside dense append buffer row of capacity {}",
                    col, self.config.row_capacity
                ),
            }
        }
        self.buf.put_i32_le(row_id);
        for value in values {
            self.config.codec.put(&mut self.buf, value);
        }
    }

    /// Append one update. Returns false, writing nothing, when the buffer is
    /// full.
    pub fn inc(&mut self, row_id: i32, col: i32, delta: f32) -> bool {
        self.batch_inc(row_id, &[col], &[delta])
    }

    /// Append a batch atomically: either all updates fit or none is written.
    pub fn batch_inc(&mut self, row_id: i32, cols: &[i32], deltas: &[f32]) -> bool {
        let codec = self.config.codec;
        let n = cols.len().min(deltas.len());
        match self.config.kind {
            AppendOnlyOpLogType::Inc => {
                if !self.fits(n * (8 + codec.update_size())) {
                    return false;
                }
                for (col, delta) in cols.iter().zip(deltas) {
                    self.buf.put_i32_le(row_id);
                    self.buf.put_i32_le(*col);
                    codec.put(&mut self.buf, *delta);
                }
            }
            AppendOnlyOpLogType::BatchInc => {
                if !self.fits(8 + n * (4 + codec.update_size())) {
                    return false;
                }
                self.buf.put_i32_le(row_id);
                self.buf.put_i32_le(n as i32);
                for col in &cols[..n] {
                    self.buf.put_i32_le(*col);
                }
                for delta in &deltas[..n] {
                    codec.put(&mut self.buf, *delta);
                }
            }
            AppendOnlyOpLogType::DenseBatchInc => {
                if !self.fits(self.dense_record_size()) {
                    return false;
                }
                self.put_dense_record(row_id, cols.iter().copied().zip(deltas.iter().copied()));
            }
        }
        true
    }

    pub fn dense_batch_inc(&mut self, row_id: i32, index_st: i32, deltas: &[f32]) -> bool {
        match self.config.kind {
            AppendOnlyOpLogType::DenseBatchInc => {
                if !self.fits(self.dense_record_size()) {
                    return false;
                }
                self.put_dense_record(row_id, (index_st..).zip(deltas.iter().copied()));
                true
            }
            _ => {
                let cols: Vec<i32> = (index_st..).take(deltas.len()).collect();
                self.batch_inc(row_id, &cols, deltas)
            }
        }
    }

    /// Decode every record, in append order.
    pub fn records(&self) -> Vec<(i32, Vec<(i32, f32)>)> {
        let codec = self.config.codec;
        let mut reader = self.buf.as_slice();
        let mut records = Vec::new();
        while reader.has_remaining() {
            let row_id = reader.get_i32_le();
            match self.config.kind {
                AppendOnlyOpLogType::Inc => {
                    let col = reader.get_i32_le();
                    records.push((row_id, vec![(col, codec.get(&mut reader))]));
                }
                AppendOnlyOpLogType::BatchInc => {
                    let n = usize::try_from(reader.get_i32_le()).unwrap_or_default();
                    let cols: Vec<i32> = (0..n).map(|_| reader.get_i32_le()).collect();
                    let updates = cols.into_iter().map(|c| (c, codec.get(&mut reader))).collect();
                    records.push((row_id, updates));
                }
                AppendOnlyOpLogType::DenseBatchInc => {
                    let updates = (0i32..)
                        .take(self.config.row_capacity)
                        .map(|c| (c, codec.get(&mut reader)))
                        .filter(|(_, d)| *d != 0.0)
                        .collect();
                    records.push((row_id, updates));
                }
            }
        }
        records
    }
}

/// Fixed set of buffers owned by one application thread.
#[derive(Debug)]
pub struct BufferPool {
    free: Mutex<Vec<AppendOnlyBuffer>>,
    available: Condvar,
}

impl BufferPool {
    pub fn new(config: AppendBufferConfig, owner: i32) -> Self {
        Self {
            free: Mutex::new(
                (0..config.pool_size.max(1))
                    .map(|_| AppendOnlyBuffer::new(config, owner))
                    .collect(),
            ),
            available: Condvar::new(),
        }
    }

    /// Block until a buffer is free.
    pub fn get_buff(&self) -> AppendOnlyBuffer {
        let mut free = self.free.lock();
        loop {
            if let Some(buff) = free.pop() {
                return buff;
            }
            self.available.wait(&mut free);
        }
    }

    pub fn put_buff(&self, mut buff: AppendOnlyBuffer) {
        buff.reset();
        self.free.lock().push(buff);
        self.available.notify_one();
    }

    pub fn num_free(&self) -> usize {
        self.free.lock().len()
    }
}

/// Append-only oplog of the rows of one communication channel.
#[derive(Debug)]
pub struct AppendOnlyOpLogPartition {
    config: AppendBufferConfig,
    pools: Mutex<HashMap<i32, Arc<BufferPool>>>,
    shared_queue: Mutex<VecDeque<AppendOnlyBuffer>>,
}

impl AppendOnlyOpLogPartition {
    pub fn new(config: AppendBufferConfig) -> Self {
        Self {
            config,
            pools: Mutex::new(HashMap::new()),
            shared_queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn config(&self) -> AppendBufferConfig {
        self.config
    }

    fn pool(&self, thread_id: i32) -> Arc<BufferPool> {
        self.pools
            .lock()
            .entry(thread_id)
            .or_insert_with(|| Arc::new(BufferPool::new(self.config, thread_id)))
            .clone()
    }

    /// Set up `thread_id`'s pool and hand out its first buffer.
    pub fn register_thread(&self, thread_id: i32) -> AppendOnlyBuffer {
        self.pool(thread_id).get_buff()
    }

    /// Queue a filled buffer for the bg worker. Empty buffers go straight
    /// back to their pool.
    pub fn push_buffer(&self, buff: AppendOnlyBuffer) {
        if buff.is_empty() {
            self.pool(buff.owner()).put_buff(buff);
        } else {
            self.shared_queue.lock().push_back(buff);
        }
    }

    /// Next buffer for `thread_id`; blocks while all of its buffers are
    /// queued or being replayed.
    pub fn next_buffer(&self, thread_id: i32) -> AppendOnlyBuffer {
        self.pool(thread_id).get_buff()
    }

    /// Bg side: take the oldest queued buffer.
    pub fn take_buffer(&self) -> Option<AppendOnlyBuffer> {
        self.shared_queue.lock().pop_front()
    }

    /// Bg side: return a replayed buffer to its owner.
    pub fn put_back_buffer(&self, buff: AppendOnlyBuffer) {
        self.pool(buff.owner()).put_buff(buff);
    }

    pub fn num_queued(&self) -> usize {
        self.shared_queue.lock().len()
    }
}

/// Bg-side replay target: per-row oplogs rebuilt from append-only buffers.
#[derive(Debug)]
pub struct AppendOnlyRowOpLogBuffer {
    factory: RowOpLogFactory,
    oplogs: HashMap<i32, RowOpLog>,
}

impl AppendOnlyRowOpLogBuffer {
    pub fn new(factory: RowOpLogFactory) -> Self {
        Self {
            factory,
            oplogs: HashMap::new(),
        }
    }

    pub fn batch_inc(&mut self, row_id: i32, updates: &[(i32, f32)]) {
        let oplog = self
            .oplogs
            .entry(row_id)
            .or_insert_with(|| self.factory.create());
        for (col, delta) in updates {
            oplog.inc(*col, *delta);
        }
    }

    pub fn get_row_oplog(&self, row_id: i32) -> Option<&RowOpLog> {
        self.oplogs.get(&row_id)
    }

    pub fn num_rows(&self) -> usize {
        self.oplogs.len()
    }

    /// Take every row oplog, ascending by row id.
    pub fn drain(&mut self) -> Vec<(i32, RowOpLog)> {
        self.oplogs
            .drain()
            .sorted_unstable_by_key(|(row_id, _)| *row_id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::config_models::RowOpLogType;

    fn config(kind: AppendOnlyOpLogType, capacity: usize) -> AppendBufferConfig {
        AppendBufferConfig {
            kind,
            codec: UpdateCodec::F32,
            capacity,
            row_capacity: 4,
            pool_size: 2,
        }
    }

    #[test]
    fn records_decode_in_append_order() {
        for kind in [
            AppendOnlyOpLogType::Inc,
            AppendOnlyOpLogType::BatchInc,
            AppendOnlyOpLogType::DenseBatchInc,
        ] {
            let mut buff = AppendOnlyBuffer::new(config(kind, 1024), 7);
            assert!(buff.inc(1, 2, 0.5));
            assert!(buff.batch_inc(3, &[0, 3], &[1.0, 2.0]));
            assert!(buff.dense_batch_inc(5, 1, &[4.0, 5.0]));

            let mut rows: HashMap<i32, Vec<(i32, f32)>> = HashMap::new();
            for (row, updates) in buff.records() {
                rows.entry(row).or_default().extend(updates);
            }
            assert_eq!(vec![(2, 0.5)], rows[&1], "{}", kind);
            assert_eq!(vec![(0, 1.0), (3, 2.0)], rows[&3], "{}", kind);
            assert_eq!(vec![(1, 4.0), (2, 5.0)], rows[&5], "{}", kind);
        }
    }

    #[test]
    fn full_buffer_rejects_whole_batch() {
        // room for exactly two Inc records
        let mut buff = AppendOnlyBuffer::new(config(AppendOnlyOpLogType::Inc, 24), 0);
        assert!(buff.inc(0, 0, 1.0));
        assert!(!buff.batch_inc(0, &[1, 2], &[1.0, 1.0]));
        assert_eq!(12, buff.size());
        assert!(buff.inc(0, 1, 1.0));
        assert!(!buff.inc(0, 2, 1.0));
    }

    #[test]
    fn writer_blocks_until_bg_returns_a_buffer() {
        let partition = Arc::new(AppendOnlyOpLogPartition::new(config(
            AppendOnlyOpLogType::Inc,
            64,
        )));
        let mut first = partition.register_thread(1);
        first.inc(0, 0, 1.0);
        partition.push_buffer(first);
        let mut second = partition.next_buffer(1);
        second.inc(0, 0, 1.0);
        partition.push_buffer(second);

        let writer = {
            let partition = partition.clone();
            thread::spawn(move || partition.next_buffer(1))
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!writer.is_finished());

        let queued = partition.take_buffer().unwrap();
        assert_eq!(1, queued.records().len());
        partition.put_back_buffer(queued);
        let third = writer.join().unwrap();
        assert!(third.is_empty());
        assert_eq!(1, partition.num_queued());
    }

    #[test]
    fn replay_accumulates_per_row() {
        let factory = RowOpLogFactory::new(RowOpLogType::Sparse, 4, false);
        let mut replay = AppendOnlyRowOpLogBuffer::new(factory);
        replay.batch_inc(2, &[(0, 1.0), (1, 1.0)]);
        replay.batch_inc(2, &[(0, 2.0)]);
        replay.batch_inc(1, &[(3, 1.0)]);
        assert_eq!(Some(3.0), replay.get_row_oplog(2).unwrap().find(0));

        let drained = replay.drain();
        assert_eq!(vec![1, 2], drained.iter().map(|e| e.0).collect::<Vec<_>>());
        assert_eq!(0, replay.num_rows());
    }
}
