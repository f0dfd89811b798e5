//! Bounded, rate-limited record channel
//!
//! A [`MemoryChannel`] connects exactly one producer thread to one consumer
//! thread. It bounds the queue by record count and by record memory size,
//! and throttles the producer against two independent rate ceilings
//! (records/s and bytes/s) using a sliding measurement window:
//!
//! ```text
//!  reader ──push──▶ ┌──────────────────────────┐ ──pull──▶ writer
//!                   │ VecDeque<Message>         │
//!   throttle ◀──────│ capacity / byte_capacity  │
//!                   └──────────────────────────┘
//!                          │ every transfer
//!                          ▼
//!                       Counters
//! ```
//!
//! Once a full window has elapsed since the last snapshot, the producer's
//! rate over that window is compared to each enabled ceiling and the
//! producer sleeps `rate * elapsed / ceiling - elapsed`, taking the larger
//! of the two values. Bursts are amortized rather than rejected.

use crate::config::ChannelConfig;
use crate::counters::{CounterKey, Counters};
use crate::error::{Result, SyncError};
use crate::logging;
use crate::record::Record;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Longest single wait on a condition before re-checking state
const WAIT_SLICE: Duration = Duration::from_millis(200);

/// Item carried by a channel
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Record(Record),
    /// End of stream, delivered after every preceding record
    Terminate,
}

impl Message {
    pub fn is_terminate(&self) -> bool {
        matches!(self, Message::Terminate)
    }

    pub fn into_record(self) -> Option<Record> {
        match self {
            Message::Record(record) => Some(record),
            Message::Terminate => None,
        }
    }

    fn memory_size(&self) -> usize {
        match self {
            Message::Record(record) => record.memory_size(),
            Message::Terminate => 0,
        }
    }

    fn byte_size(&self) -> u64 {
        match self {
            Message::Record(record) => record.byte_size() as u64,
            Message::Terminate => 0,
        }
    }
}

struct Queue {
    items: VecDeque<Message>,
    memory: usize,
}

impl Queue {
    /// An empty queue admits anything so oversize batches cannot deadlock
    fn has_room(&self, count: usize, memory: usize, config: &ChannelConfig) -> bool {
        self.items.is_empty()
            || (self.items.len() + count <= config.capacity
                && self.memory + memory <= config.byte_capacity)
    }
}

/// Snapshot the throttle compares against
struct Window {
    started: Instant,
    records: u64,
    bytes: u64,
}

/// Single-producer/single-consumer bounded channel
pub struct MemoryChannel {
    group_id: usize,
    task_id: usize,
    config: ChannelConfig,
    counters: Arc<Counters>,
    queue: Mutex<Queue>,
    not_full: Condvar,
    not_empty: Condvar,
    closed: AtomicBool,
    window: Mutex<Window>,
    throttle_wake: Condvar,
    wait_reader_ns: AtomicU64,
    wait_writer_ns: AtomicU64,
}

impl std::fmt::Debug for MemoryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryChannel")
            .field("group_id", &self.group_id)
            .field("task_id", &self.task_id)
            .field("size", &self.size())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl MemoryChannel {
    /// Create a channel for one (group, task) pair
    pub fn new(
        group_id: usize,
        task_id: usize,
        config: ChannelConfig,
        counters: Arc<Counters>,
    ) -> Result<Self> {
        if config.capacity == 0 {
            return Err(SyncError::illegal_argument(format!(
                "channel capacity [{}] must be greater than 0",
                config.capacity
            )));
        }
        logging::log_channel_limits_once(&config);

        Ok(Self {
            group_id,
            task_id,
            queue: Mutex::new(Queue {
                items: VecDeque::with_capacity(config.capacity.min(4096)),
                memory: 0,
            }),
            config,
            window: Mutex::new(Window {
                started: Instant::now(),
                records: counters.total_read_records(),
                bytes: counters.total_read_bytes(),
            }),
            counters,
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            closed: AtomicBool::new(false),
            throttle_wake: Condvar::new(),
            wait_reader_ns: AtomicU64::new(0),
            wait_writer_ns: AtomicU64::new(0),
        })
    }

    pub fn group_id(&self) -> usize {
        self.group_id
    }

    pub fn task_id(&self) -> usize {
        self.task_id
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn counters(&self) -> &Arc<Counters> {
        &self.counters
    }

    /// Enqueue one record
    pub fn push(&self, record: Record) -> Result<()> {
        let bytes = record.byte_size() as u64;
        let memory = record.memory_size();
        self.enqueue(std::iter::once(Message::Record(record)), 1, memory)?;
        self.stat_push(1, bytes);
        Ok(())
    }

    /// Enqueue a batch atomically. An empty batch is a caller bug.
    pub fn push_all(&self, records: Vec<Record>) -> Result<()> {
        if records.is_empty() {
            return Err(SyncError::illegal_argument("records to push must not be empty"));
        }
        let count = records.len();
        let bytes: u64 = records.iter().map(|r| r.byte_size() as u64).sum();
        let memory: usize = records.iter().map(Record::memory_size).sum();
        self.enqueue(records.into_iter().map(Message::Record), count, memory)?;
        self.stat_push(count as u64, bytes);
        Ok(())
    }

    /// Enqueue the end-of-stream marker; throughput counters are untouched
    pub fn push_terminate(&self) -> Result<()> {
        self.enqueue(std::iter::once(Message::Terminate), 1, 0)
    }

    /// Blocking retrieval of one message. A closed, drained channel yields
    /// [`Message::Terminate`].
    pub fn pull(&self) -> Message {
        let start = Instant::now();
        let message = {
            let mut queue = self.queue.lock();
            loop {
                if let Some(message) = queue.items.pop_front() {
                    queue.memory -= message.memory_size();
                    break message;
                }
                if self.is_closed() {
                    break Message::Terminate;
                }
                self.not_empty.wait_for(&mut queue, WAIT_SLICE);
            }
        };
        self.not_full.notify_one();
        self.wait_reader_ns
            .fetch_add(start.elapsed().as_nanos() as u64, Ordering::Relaxed);

        if let Message::Record(record) = &message {
            self.stat_pull(1, record.byte_size() as u64);
        }
        message
    }

    /// Blocking retrieval of up to `max` messages
    pub fn pull_all(&self, max: usize) -> Vec<Message> {
        let max = max.max(1);
        let start = Instant::now();
        let batch: Vec<Message> = {
            let mut queue = self.queue.lock();
            loop {
                if !queue.items.is_empty() {
                    let take = max.min(queue.items.len());
                    let batch: Vec<Message> = queue.items.drain(..take).collect();
                    queue.memory -= batch.iter().map(Message::memory_size).sum::<usize>();
                    break batch;
                }
                if self.is_closed() {
                    break vec![Message::Terminate];
                }
                self.not_empty.wait_for(&mut queue, WAIT_SLICE);
            }
        };
        self.not_full.notify_one();
        self.wait_reader_ns
            .fetch_add(start.elapsed().as_nanos() as u64, Ordering::Relaxed);

        let records = batch.iter().filter(|m| !m.is_terminate()).count() as u64;
        if records > 0 {
            let bytes = batch.iter().map(Message::byte_size).sum();
            self.stat_pull(records, bytes);
        }
        batch
    }

    /// Number of queued messages
    pub fn size(&self) -> usize {
        self.queue.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().items.is_empty()
    }

    /// Bytes of record memory currently queued
    pub fn memory_bytes(&self) -> usize {
        self.queue.lock().memory
    }

    /// Drop everything queued and wake a blocked producer
    pub fn clear(&self) {
        let mut queue = self.queue.lock();
        queue.items.clear();
        queue.memory = 0;
        drop(queue);
        self.not_full.notify_all();
    }

    /// Mark the channel permanently closed. Idempotent.
    ///
    /// Queued messages can still be pulled; afterwards pulls yield
    /// [`Message::Terminate`]. Pushes fail and a throttled producer wakes up.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(
            group_id = self.group_id,
            task_id = self.task_id,
            "Channel closed"
        );
        // Taking the locks orders the flag store before any waiter re-checks it
        drop(self.queue.lock());
        self.not_full.notify_all();
        self.not_empty.notify_all();
        drop(self.window.lock());
        self.throttle_wake.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn enqueue<I>(&self, items: I, count: usize, memory: usize) -> Result<()>
    where
        I: IntoIterator<Item = Message>,
    {
        let start = Instant::now();
        {
            let mut queue = self.queue.lock();
            while !self.is_closed() && !queue.has_room(count, memory, &self.config) {
                self.not_full.wait_for(&mut queue, WAIT_SLICE);
            }
            if self.is_closed() {
                return Err(SyncError::ChannelClosed);
            }
            queue.items.extend(items);
            queue.memory += memory;
        }
        self.not_empty.notify_one();
        self.wait_writer_ns
            .fetch_add(start.elapsed().as_nanos() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn stat_push(&self, records: u64, bytes: u64) {
        self.counters.increase(CounterKey::ReadSucceedRecords, records);
        self.counters.increase(CounterKey::ReadSucceedBytes, bytes);
        self.publish_wait_times();
        self.throttle();
    }

    fn stat_pull(&self, records: u64, bytes: u64) {
        self.counters.increase(CounterKey::WriteReceivedRecords, records);
        self.counters.increase(CounterKey::WriteReceivedBytes, bytes);
        self.publish_wait_times();
    }

    fn publish_wait_times(&self) {
        self.counters.set(
            CounterKey::WaitReaderTime,
            self.wait_reader_ns.load(Ordering::Relaxed),
        );
        self.counters.set(
            CounterKey::WaitWriterTime,
            self.wait_writer_ns.load(Ordering::Relaxed),
        );
    }

    /// Runs on the producer thread after every push
    fn throttle(&self) {
        if !self.config.is_rate_limited() {
            return;
        }

        let mut window = self.window.lock();
        let now = Instant::now();
        let interval = now.duration_since(window.started);
        if interval < self.config.flow_control_interval() {
            return;
        }

        let records = self.counters.total_read_records();
        let bytes = self.counters.total_read_bytes();
        let delay = throttle_delay(
            &self.config,
            records.saturating_sub(window.records),
            bytes.saturating_sub(window.bytes),
            interval.as_millis() as u64,
        );

        if !delay.is_zero() {
            trace!(
                group_id = self.group_id,
                task_id = self.task_id,
                "Channel throttling producer for {:?}",
                delay
            );
            let deadline = now + delay;
            while !self.is_closed() && Instant::now() < deadline {
                self.throttle_wake.wait_until(&mut window, deadline);
            }
        }

        window.started = now;
        window.records = records;
        window.bytes = bytes;
    }
}

/// Sleep required to bring the observed rates down to the ceilings.
///
/// `records` and `bytes` were transferred over `interval_ms`. Each enabled
/// ceiling yields `rate * interval / ceiling - interval`; the larger wins.
pub fn throttle_delay(config: &ChannelConfig, records: u64, bytes: u64, interval_ms: u64) -> Duration {
    if interval_ms == 0 {
        return Duration::ZERO;
    }

    let required = |amount: u64, ceiling: i64| -> u64 {
        if ceiling <= 0 {
            return 0;
        }
        let ceiling = ceiling as u64;
        let rate = amount * 1000 / interval_ms;
        if rate > ceiling {
            (rate * interval_ms / ceiling).saturating_sub(interval_ms)
        } else {
            0
        }
    };

    let sleep_ms = required(bytes, config.byte_speed).max(required(records, config.record_speed));
    Duration::from_millis(sleep_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Column;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    fn record_of(bytes: usize) -> Record {
        Record::from_columns(vec![Column::String("x".repeat(bytes))])
    }

    fn channel(config: ChannelConfig) -> (Arc<MemoryChannel>, Arc<Counters>) {
        let counters = Arc::new(Counters::new());
        let channel = MemoryChannel::new(0, 0, config, counters.clone()).unwrap();
        (Arc::new(channel), counters)
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = ChannelConfig::unthrottled().with_capacity(0, 1024);
        let err = MemoryChannel::new(0, 0, config, Arc::new(Counters::new())).unwrap_err();
        assert!(matches!(err, SyncError::IllegalArgument(_)));
    }

    #[test]
    fn test_fifo_round_trip_with_terminate() {
        let (channel, _) = channel(ChannelConfig::unthrottled());
        for i in 0..5 {
            channel.push(Record::from_columns(vec![Column::Long(i)])).unwrap();
        }
        channel.push_terminate().unwrap();

        for i in 0..5 {
            let record = channel.pull().into_record().unwrap();
            assert_eq!(record.column(0), Some(&Column::Long(i)));
        }
        assert!(channel.pull().is_terminate());
        assert!(channel.is_empty());
    }

    #[test]
    fn test_empty_batch_rejected() {
        let (channel, _) = channel(ChannelConfig::unthrottled());
        let err = channel.push_all(Vec::new()).unwrap_err();
        assert!(matches!(err, SyncError::IllegalArgument(_)));
    }

    #[test]
    fn test_counters_follow_transfers() {
        let (channel, counters) = channel(ChannelConfig::unthrottled());
        channel.push_all(vec![record_of(10), record_of(20)]).unwrap();
        channel.push(record_of(5)).unwrap();
        channel.push_terminate().unwrap();

        assert_eq!(counters.get(CounterKey::ReadSucceedRecords), 3);
        assert_eq!(counters.get(CounterKey::ReadSucceedBytes), 35);

        let batch = channel.pull_all(32);
        assert_eq!(batch.len(), 4);
        assert!(batch[3].is_terminate());
        assert_eq!(counters.get(CounterKey::WriteReceivedRecords), 3);
        assert_eq!(counters.get(CounterKey::WriteReceivedBytes), 35);
    }

    #[test]
    fn test_pull_all_respects_max() {
        let (channel, _) = channel(ChannelConfig::unthrottled());
        channel
            .push_all((0..10).map(|_| record_of(1)).collect())
            .unwrap();
        assert_eq!(channel.pull_all(4).len(), 4);
        assert_eq!(channel.size(), 6);
    }

    #[test]
    fn test_push_all_blocks_until_room() {
        let config = ChannelConfig::unthrottled().with_capacity(10, 1024 * 1024);
        let (channel, _) = channel(config);
        for _ in 0..10 {
            channel.push(record_of(100)).unwrap();
        }

        let done = Arc::new(AtomicBool::new(false));
        let producer = {
            let channel = channel.clone();
            let done = done.clone();
            thread::spawn(move || {
                channel
                    .push_all((0..5).map(|_| record_of(100)).collect())
                    .unwrap();
                done.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert!(!done.load(Ordering::SeqCst));

        for _ in 0..4 {
            channel.pull();
        }
        thread::sleep(Duration::from_millis(100));
        assert!(!done.load(Ordering::SeqCst));

        channel.pull();
        producer.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(channel.size(), 10);
    }

    #[test]
    fn test_byte_capacity_admits_oversize_into_empty_queue() {
        let config = ChannelConfig::unthrottled().with_capacity(100, 256);
        let (channel, _) = channel(config);

        channel.push(record_of(1000)).unwrap();
        assert_eq!(channel.size(), 1);

        let blocked = {
            let channel = channel.clone();
            thread::spawn(move || channel.push(record_of(10)))
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(channel.size(), 1);

        assert!(channel.pull().into_record().is_some());
        blocked.join().unwrap().unwrap();
        assert_eq!(channel.size(), 1);
    }

    #[test]
    fn test_close_is_idempotent_and_wakes_peers() {
        let (channel, _) = channel(ChannelConfig::unthrottled());
        let consumer = {
            let channel = channel.clone();
            thread::spawn(move || channel.pull())
        };
        thread::sleep(Duration::from_millis(50));
        channel.close();
        channel.close();

        assert!(consumer.join().unwrap().is_terminate());
        assert!(channel.pull().is_terminate());
        assert!(channel.pull_all(8)[0].is_terminate());
        assert!(matches!(
            channel.push(record_of(1)),
            Err(SyncError::ChannelClosed)
        ));
    }

    #[test]
    fn test_close_keeps_queued_records() {
        let (channel, _) = channel(ChannelConfig::unthrottled());
        channel.push(record_of(1)).unwrap();
        channel.close();
        assert!(channel.pull().into_record().is_some());
        assert!(channel.pull().is_terminate());
    }

    #[test]
    fn test_clear() {
        let (channel, _) = channel(ChannelConfig::unthrottled());
        channel.push_all(vec![record_of(4), record_of(4)]).unwrap();
        assert!(channel.memory_bytes() > 0);
        channel.clear();
        assert!(channel.is_empty());
        assert_eq!(channel.memory_bytes(), 0);
    }

    #[test]
    fn test_throttle_delay_below_ceiling_is_zero() {
        let config = ChannelConfig::default().with_speed(1000, 1024 * 1024);
        assert_eq!(throttle_delay(&config, 999, 1000, 1000), Duration::ZERO);
        assert_eq!(throttle_delay(&config, 10, 10, 0), Duration::ZERO);
    }

    #[test]
    fn test_throttle_delay_takes_larger_ceiling() {
        let config = ChannelConfig::default().with_speed(1000, 1000);
        // 2000 rec/s against 1000: sleep one more interval
        assert_eq!(throttle_delay(&config, 2000, 0, 1000), Duration::from_millis(1000));
        // 4000 B/s against 1000 dominates
        assert_eq!(throttle_delay(&config, 2000, 4000, 1000), Duration::from_millis(3000));

        let disabled = ChannelConfig::unthrottled();
        assert_eq!(throttle_delay(&disabled, 1_000_000, 1_000_000, 10), Duration::ZERO);
    }

    /// Push `count` records of `bytes` each at roughly 1/ms, return the elapsed time
    fn push_paced(config: ChannelConfig, count: u64, bytes: usize) -> Duration {
        let (channel, counters) = channel(config);

        let consumer = {
            let channel = channel.clone();
            thread::spawn(move || while !channel.pull().is_terminate() {})
        };

        let start = Instant::now();
        for _ in 0..count {
            channel.push(record_of(bytes)).unwrap();
            thread::sleep(Duration::from_millis(1));
        }
        let elapsed = start.elapsed();
        channel.push_terminate().unwrap();
        consumer.join().unwrap();

        assert_eq!(counters.get(CounterKey::WriteReceivedRecords), count);
        elapsed
    }

    #[test]
    fn test_rate_converges_to_record_ceiling() {
        let config = ChannelConfig::unthrottled()
            .with_speed(200, 0)
            .with_flow_control_interval(Duration::from_millis(50));

        let elapsed = push_paced(config, 500, 8);
        let rate = 500.0 / elapsed.as_secs_f64();
        assert!((170.0..=230.0).contains(&rate), "record rate {} off ceiling 200", rate);
    }

    #[test]
    fn test_rate_converges_to_byte_ceiling() {
        // the record ceiling is far away, only bytes/s binds
        let config = ChannelConfig::unthrottled()
            .with_speed(1_000_000, 20_000)
            .with_flow_control_interval(Duration::from_millis(50));

        let elapsed = push_paced(config, 500, 100);
        let rate = (500 * 100) as f64 / elapsed.as_secs_f64();
        assert!(
            (17_000.0..=23_000.0).contains(&rate),
            "byte rate {} off ceiling 20000",
            rate
        );
    }

    #[test]
    fn test_close_interrupts_throttle_sleep() {
        let config = ChannelConfig::unthrottled()
            .with_speed(1, 0)
            .with_flow_control_interval(Duration::from_millis(50));
        let (channel, _) = channel(config);
        for _ in 0..50 {
            channel.push(record_of(1)).unwrap();
        }
        thread::sleep(Duration::from_millis(60));

        let producer = {
            let channel = channel.clone();
            thread::spawn(move || {
                let start = Instant::now();
                let _ = channel.push(record_of(1));
                start.elapsed()
            })
        };
        thread::sleep(Duration::from_millis(100));
        channel.close();

        let waited = producer.join().unwrap();
        assert!(waited < Duration::from_secs(5));
    }
}
