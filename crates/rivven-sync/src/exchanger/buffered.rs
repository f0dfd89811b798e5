//! Batching exchanger
//!
//! Outgoing records accumulate until either `buffer_size` records or the
//! channel's `byte_capacity` bytes of record memory are buffered, then move
//! through the channel in one `push_all`. A single record larger than the
//! channel's byte capacity never enters it and is collected as dirty. Incoming records are pulled one batch at a
//! time and served from a local queue.

use super::{RecordReceiver, RecordSender, ShutdownHandle};
use crate::channel::{MemoryChannel, Message};
use crate::collector::RecordCollector;
use crate::config::ExchangerConfig;
use crate::error::{Result, SyncError};
use crate::record::{Record, RecordKind};
use crate::transformer::{ChainOutcome, TransformChain};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::trace;

/// Buffered exchanger, usable as sender and as receiver
pub struct BufferedExchanger {
    channel: Arc<MemoryChannel>,
    collector: Arc<dyn RecordCollector>,
    transforms: TransformChain,
    handle: ShutdownHandle,
    record_kind: RecordKind,
    buffer_size: usize,
    byte_capacity: usize,
    /// Outgoing batch
    buffer: Vec<Record>,
    buffer_bytes: usize,
    /// Incoming batch
    received: VecDeque<Record>,
    terminated: bool,
}

impl BufferedExchanger {
    pub fn new(
        channel: Arc<MemoryChannel>,
        collector: Arc<dyn RecordCollector>,
        config: &ExchangerConfig,
    ) -> Self {
        let byte_capacity = channel.config().byte_capacity;
        Self {
            handle: ShutdownHandle::new(channel.clone()),
            channel,
            collector,
            transforms: TransformChain::default(),
            record_kind: config.record_kind,
            buffer_size: config.buffer_size.max(1),
            byte_capacity,
            buffer: Vec::with_capacity(config.buffer_size.max(1)),
            buffer_bytes: 0,
            received: VecDeque::new(),
            terminated: false,
        }
    }

    /// Run `transforms` on every outgoing record
    pub fn with_transforms(mut self, transforms: TransformChain) -> Self {
        self.transforms = transforms;
        self
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.handle.clone()
    }

    /// Records waiting in the outgoing buffer
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn is_full_with(&self, record: &Record) -> bool {
        self.buffer.len() >= self.buffer_size
            || self.buffer_bytes + record.memory_size() > self.byte_capacity
    }

    fn do_flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.buffer);
        self.buffer_bytes = 0;
        trace!(records = batch.len(), "Flushing batch to channel");
        self.channel
            .push_all(batch)
            .map_err(|e| self.handle.map_err(e))
    }
}

impl RecordSender for BufferedExchanger {
    fn create_record(&self) -> Record {
        self.record_kind.create()
    }

    fn send(&mut self, mut record: Record) -> Result<()> {
        self.handle.ensure_running()?;

        let outcome = self.transforms.apply(&mut record)?;
        self.transforms.publish(self.channel.counters());
        match outcome {
            ChainOutcome::Pass => {}
            ChainOutcome::Filtered => return Ok(()),
            ChainOutcome::Dirty(err) => {
                return self
                    .collector
                    .collect_dirty_record(&record, Some(&err), "transformer failed");
            }
        }

        if record.memory_size() > self.byte_capacity {
            let err = SyncError::runtime(format!(
                "single record exceeds size limit of {} bytes",
                self.byte_capacity
            ));
            return self
                .collector
                .collect_dirty_record(&record, Some(&err), "single record exceeds size limit");
        }

        if self.is_full_with(&record) {
            self.do_flush()?;
        }
        self.buffer_bytes += record.memory_size();
        self.buffer.push(record);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.handle.ensure_running()?;
        self.do_flush()
    }

    fn terminate(&mut self) -> Result<()> {
        self.handle.ensure_running()?;
        self.do_flush()?;
        self.channel
            .push_terminate()
            .map_err(|e| self.handle.map_err(e))
    }

    fn shutdown(&mut self) {
        self.buffer.clear();
        self.buffer_bytes = 0;
        self.received.clear();
        self.handle.shutdown();
    }
}

impl RecordReceiver for BufferedExchanger {
    fn create_record(&self) -> Record {
        self.record_kind.create()
    }

    fn receive(&mut self) -> Result<Option<Record>> {
        self.handle.ensure_running()?;

        while self.received.is_empty() && !self.terminated {
            let batch = self.channel.pull_all(self.buffer_size);
            self.handle.ensure_running()?;
            for message in batch {
                match message {
                    Message::Record(record) => self.received.push_back(record),
                    Message::Terminate => {
                        self.terminated = true;
                        break;
                    }
                }
            }
        }
        Ok(self.received.pop_front())
    }

    fn shutdown(&mut self) {
        RecordSender::shutdown(self);
    }
}
