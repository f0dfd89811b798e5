//! Connector plugin contract
//!
//! Readers and writers are driven through the same phases by a
//! [`Runner`](crate::runner::Runner). Every phase may fail with a
//! [`SyncError`](crate::error::SyncError); `start_read` and `start_write`
//! move the data.

use crate::assign::WorkUnit;
use crate::collector::RecordCollector;
use crate::error::Result;
use crate::exchanger::{RecordReceiver, RecordSender};
use std::sync::Arc;

/// Identity and services handed to a task at init
#[derive(Clone)]
pub struct TaskContext {
    pub group_id: usize,
    pub task_id: usize,
    /// 0 for the first attempt, incremented on every failover retry
    pub attempt: u32,
    /// Dirty-record sink for this task and side
    pub collector: Arc<dyn RecordCollector>,
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("group_id", &self.group_id)
            .field("task_id", &self.task_id)
            .field("attempt", &self.attempt)
            .finish()
    }
}

/// Reader side of a connector
pub trait ReaderTask: Send {
    fn init(&mut self, _ctx: &TaskContext) -> Result<()> {
        Ok(())
    }

    fn prepare(&mut self) -> Result<()> {
        Ok(())
    }

    /// Produce every record of the work unit
    fn start_read(&mut self, sender: &mut dyn RecordSender) -> Result<()>;

    fn post(&mut self) -> Result<()> {
        Ok(())
    }

    fn destroy(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Writer side of a connector
pub trait WriterTask: Send {
    fn init(&mut self, _ctx: &TaskContext) -> Result<()> {
        Ok(())
    }

    fn prepare(&mut self) -> Result<()> {
        Ok(())
    }

    /// Consume records until the receiver reports the end of stream
    fn start_write(&mut self, receiver: &mut dyn RecordReceiver) -> Result<()>;

    fn post(&mut self) -> Result<()> {
        Ok(())
    }

    fn destroy(&mut self) -> Result<()> {
        Ok(())
    }

    /// Whether a failed task may be retried from scratch
    fn supports_failover(&self) -> bool {
        false
    }
}

/// Builds the reader and writer of a work unit
pub trait TaskFactory<T>: Send + Sync {
    fn create_reader(&self, unit: &WorkUnit<T>) -> Result<Box<dyn ReaderTask>>;

    fn create_writer(&self, unit: &WorkUnit<T>) -> Result<Box<dyn WriterTask>>;
}
