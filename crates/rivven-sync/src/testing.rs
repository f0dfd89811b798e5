//! Testing utilities for task plugins
//!
//! Scripted reader/writer plugins driven by a [`MockTask`] payload, so the
//! group and scheduler paths can be exercised without a real data source.
//!
//! # Example
//!
//! ```rust,ignore
//! use rivven_sync::testing::*;
//!
//! let factory = MockTaskFactory::new();
//! let units = work_units(vec![MockTask::new().with_records(10)]);
//! let report = JobScheduler::new(SyncConfig::default(), Arc::new(factory.clone()))?
//!     .run(units)?;
//!
//! assert!(report.is_success());
//! assert_eq!(factory.written().len(), 10);
//! ```

use crate::assign::WorkUnit;
use crate::error::{ErrorCode, Result, SyncError};
use crate::exchanger::{RecordReceiver, RecordSender};
use crate::plugin::{ReaderTask, TaskContext, TaskFactory, WriterTask};
use crate::record::{Column, Record};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Mock Task
// ============================================================================

/// Script for one reader/writer pair
#[derive(Debug, Clone, Default)]
pub struct MockTask {
    records: u64,
    read_delay: Option<Duration>,
    fail_reader_at: Option<u64>,
    fail_writer_attempts: u32,
    failover: bool,
    fail_create: bool,
    panic_create: bool,
    dirty_every: Option<u64>,
}

impl MockTask {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records the reader produces
    pub fn with_records(mut self, records: u64) -> Self {
        self.records = records;
        self
    }

    /// Sleep after every record sent
    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = Some(delay);
        self
    }

    /// Fail the reader before sending record `index`
    pub fn fail_reader_at(mut self, index: u64) -> Self {
        self.fail_reader_at = Some(index);
        self
    }

    /// Fail writer init for the first `attempts` attempts
    pub fn fail_writer_attempts(mut self, attempts: u32) -> Self {
        self.fail_writer_attempts = attempts;
        self
    }

    /// Declare the writer able to fail over
    pub fn with_failover(mut self) -> Self {
        self.failover = true;
        self
    }

    /// Make the factory refuse to build this task
    pub fn fail_create(mut self) -> Self {
        self.fail_create = true;
        self
    }

    /// Make the factory panic while building this task
    pub fn panic_create(mut self) -> Self {
        self.panic_create = true;
        self
    }

    /// Writer rejects every record whose id is a multiple of `n`
    pub fn dirty_every(mut self, n: u64) -> Self {
        self.dirty_every = Some(n.max(1));
        self
    }

    pub fn records(&self) -> u64 {
        self.records
    }
}

/// Number the tasks as work units
pub fn work_units(tasks: Vec<MockTask>) -> Vec<WorkUnit<MockTask>> {
    tasks
        .into_iter()
        .enumerate()
        .map(|(id, task)| WorkUnit::new(id, task))
        .collect()
}

/// Record `[id, "row-<id>"]`
pub fn mock_record(sender: &dyn RecordSender, id: u64) -> Record {
    let mut record = sender.create_record();
    record.add_column(Column::Long(id as i64));
    record.add_column(Column::String(format!("row-{}", id)));
    record
}

// ============================================================================
// Mock Reader / Writer
// ============================================================================

/// Reader producing `MockTask::records` rows
#[derive(Debug)]
pub struct MockReader {
    task: MockTask,
}

impl ReaderTask for MockReader {
    fn start_read(&mut self, sender: &mut dyn RecordSender) -> Result<()> {
        for id in 0..self.task.records {
            if self.task.fail_reader_at == Some(id) {
                return Err(SyncError::plugin(
                    ErrorCode::ExecuteFail,
                    format!("mock reader failed at record {}", id),
                ));
            }
            let record = mock_record(sender, id);
            sender.send(record)?;
            if let Some(delay) = self.task.read_delay {
                std::thread::sleep(delay);
            }
        }
        sender.flush()
    }
}

/// Writer collecting rows into the factory's shared sink
pub struct MockWriter {
    task: MockTask,
    written: Arc<Mutex<Vec<Record>>>,
    ctx: Option<TaskContext>,
}

impl WriterTask for MockWriter {
    fn init(&mut self, ctx: &TaskContext) -> Result<()> {
        if ctx.attempt < self.task.fail_writer_attempts {
            return Err(SyncError::plugin(
                ErrorCode::ConnectError,
                format!("mock writer unavailable on attempt {}", ctx.attempt),
            ));
        }
        self.ctx = Some(ctx.clone());
        Ok(())
    }

    fn start_write(&mut self, receiver: &mut dyn RecordReceiver) -> Result<()> {
        let ctx = self
            .ctx
            .as_ref()
            .ok_or_else(|| SyncError::runtime("mock writer not initialized"))?;

        while let Some(record) = receiver.receive()? {
            let id = record.column(0).and_then(Column::as_i64).unwrap_or(0) as u64;
            match self.task.dirty_every {
                Some(n) if id % n == 0 => {
                    let err = SyncError::plugin(ErrorCode::IllegalValue, "rejected by mock writer");
                    ctx.collector
                        .collect_dirty_record(&record, Some(&err), "write failed")?;
                }
                _ => self.written.lock().push(record),
            }
        }
        Ok(())
    }

    fn supports_failover(&self) -> bool {
        self.task.failover
    }
}

// ============================================================================
// Mock Factory
// ============================================================================

/// Factory building [`MockReader`]/[`MockWriter`] pairs.
///
/// Clones share the written records and creation counts.
#[derive(Debug, Clone, Default)]
pub struct MockTaskFactory {
    written: Arc<Mutex<Vec<Record>>>,
    created: Arc<Mutex<HashMap<usize, u32>>>,
}

impl MockTaskFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record accepted by a writer
    pub fn written(&self) -> Vec<Record> {
        self.written.lock().clone()
    }

    /// How often the pair of `task_id` was built
    pub fn created(&self, task_id: usize) -> u32 {
        self.created.lock().get(&task_id).copied().unwrap_or(0)
    }
}

impl TaskFactory<MockTask> for MockTaskFactory {
    fn create_reader(&self, unit: &WorkUnit<MockTask>) -> Result<Box<dyn ReaderTask>> {
        *self.created.lock().entry(unit.task_id).or_insert(0) += 1;
        if unit.payload.panic_create {
            panic!("reader factory broke on task {}", unit.task_id);
        }
        if unit.payload.fail_create {
            return Err(SyncError::plugin(
                ErrorCode::PluginInitError,
                format!("cannot build reader for task {}", unit.task_id),
            ));
        }
        Ok(Box::new(MockReader {
            task: unit.payload.clone(),
        }))
    }

    fn create_writer(&self, unit: &WorkUnit<MockTask>) -> Result<Box<dyn WriterTask>> {
        Ok(Box::new(MockWriter {
            task: unit.payload.clone(),
            written: self.written.clone(),
            ctx: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannel;
    use crate::collector::{PluginKind, TaskCollector};
    use crate::config::{ChannelConfig, ExchangerConfig};
    use crate::counters::{CounterKey, Counters};
    use crate::exchanger::ExchangerPair;
    use crate::transformer::TransformChain;

    #[test]
    fn test_mock_pair_moves_records() {
        let counters = Arc::new(Counters::new());
        let channel = Arc::new(
            MemoryChannel::new(0, 0, ChannelConfig::unthrottled(), counters.clone()).unwrap(),
        );
        let writer_collector = Arc::new(TaskCollector::new(counters.clone(), PluginKind::Writer));
        let mut pair = ExchangerPair::new(
            channel,
            &ExchangerConfig::default(),
            TransformChain::default(),
            Arc::new(TaskCollector::new(counters.clone(), PluginKind::Reader)),
            writer_collector.clone(),
        );

        let factory = MockTaskFactory::new();
        let unit = WorkUnit::new(7, MockTask::new().with_records(10).dirty_every(5));
        let mut reader = factory.create_reader(&unit).unwrap();
        let mut writer = factory.create_writer(&unit).unwrap();
        let ctx = TaskContext {
            group_id: 0,
            task_id: 7,
            attempt: 0,
            collector: writer_collector,
        };

        reader.start_read(pair.sender.as_mut()).unwrap();
        pair.sender.terminate().unwrap();
        writer.init(&ctx).unwrap();
        writer.start_write(pair.receiver.as_mut()).unwrap();

        // ids 0 and 5 are rejected
        assert_eq!(factory.written().len(), 8);
        assert_eq!(factory.created(7), 1);
        assert_eq!(counters.get(CounterKey::WriteFailedRecords), 2);
    }

    #[test]
    fn test_factory_refuses_marked_task() {
        let factory = MockTaskFactory::new();
        let unit = WorkUnit::new(1, MockTask::new().fail_create());
        assert!(factory.create_reader(&unit).is_err());
        assert_eq!(factory.created(1), 1);
    }
}
