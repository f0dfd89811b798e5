//! Exchangers: the record send/receive contract seen by connector code
//!
//! An exchanger wraps one [`MemoryChannel`] and hides the channel's message
//! type from readers and writers:
//!
//! - [`BufferedExchanger`] batches records through `push_all`/`pull_all`
//! - [`DirectExchanger`] moves one record per channel operation
//!
//! Both run the reader-side [`TransformChain`](crate::transformer::TransformChain)
//! before a record enters the channel, divert failing records to the
//! [`RecordCollector`](crate::collector::RecordCollector), and report the
//! end of stream as `Ok(None)`.
//!
//! Shutdown is shared through a [`ShutdownHandle`], so the group supervisor
//! can stop an exchanger whose owner is blocked inside the channel.

mod buffered;
mod direct;

pub use buffered::BufferedExchanger;
pub use direct::DirectExchanger;

use crate::channel::MemoryChannel;
use crate::collector::RecordCollector;
use crate::config::{ExchangerConfig, ExchangerKind};
use crate::error::{Result, SyncError};
use crate::record::Record;
use crate::transformer::TransformChain;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Contract exposed to reader plugins
pub trait RecordSender: Send {
    /// Create an empty record of the configured representation
    fn create_record(&self) -> Record;

    /// Send one record towards the writer
    fn send(&mut self, record: Record) -> Result<()>;

    /// Push any locally buffered records into the channel
    fn flush(&mut self) -> Result<()>;

    /// Flush, then signal end of stream
    fn terminate(&mut self) -> Result<()>;

    /// Stop the exchanger; later operations fail with `ShutDownTask`
    fn shutdown(&mut self);
}

/// Contract exposed to writer plugins
pub trait RecordReceiver: Send {
    /// Create an empty record of the configured representation
    fn create_record(&self) -> Record;

    /// Next record, or `None` once the reader terminated
    fn receive(&mut self) -> Result<Option<Record>>;

    /// Stop the exchanger; later operations fail with `ShutDownTask`
    fn shutdown(&mut self);
}

/// Cross-thread shutdown switch for one exchanger
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    channel: Arc<MemoryChannel>,
}

impl ShutdownHandle {
    pub fn new(channel: Arc<MemoryChannel>) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            channel,
        }
    }

    /// Set the flag, drain and close the channel so a blocked peer returns.
    /// Idempotent.
    pub fn shutdown(&self) {
        if !self.flag.swap(true, Ordering::AcqRel) {
            debug!(
                group_id = self.channel.group_id(),
                task_id = self.channel.task_id(),
                "Exchanger shut down"
            );
        }
        self.channel.clear();
        self.channel.close();
    }

    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Fail fast once shut down
    pub(crate) fn ensure_running(&self) -> Result<()> {
        if self.is_shutdown() {
            Err(SyncError::ShutDownTask)
        } else {
            Ok(())
        }
    }

    /// A channel error seen after shutdown is reported as `ShutDownTask`
    pub(crate) fn map_err(&self, err: SyncError) -> SyncError {
        if self.is_shutdown() {
            SyncError::ShutDownTask
        } else {
            err
        }
    }
}

/// Reader/writer exchangers for one task, plus their shutdown handles
pub struct ExchangerPair {
    pub sender: Box<dyn RecordSender>,
    pub receiver: Box<dyn RecordReceiver>,
    pub sender_handle: ShutdownHandle,
    pub receiver_handle: ShutdownHandle,
}

impl ExchangerPair {
    /// Build the configured exchanger variant on both ends of `channel`.
    /// Transformers are attached to the sending side.
    pub fn new(
        channel: Arc<MemoryChannel>,
        config: &ExchangerConfig,
        transforms: TransformChain,
        reader_collector: Arc<dyn RecordCollector>,
        writer_collector: Arc<dyn RecordCollector>,
    ) -> Self {
        match config.kind {
            ExchangerKind::Buffered => {
                let sender = BufferedExchanger::new(channel.clone(), reader_collector, config)
                    .with_transforms(transforms);
                let receiver = BufferedExchanger::new(channel, writer_collector, config);
                Self {
                    sender_handle: sender.shutdown_handle(),
                    receiver_handle: receiver.shutdown_handle(),
                    sender: Box::new(sender),
                    receiver: Box::new(receiver),
                }
            }
            ExchangerKind::Direct => {
                let sender = DirectExchanger::new(channel.clone(), reader_collector, config)
                    .with_transforms(transforms);
                let receiver = DirectExchanger::new(channel, writer_collector, config);
                Self {
                    sender_handle: sender.shutdown_handle(),
                    receiver_handle: receiver.shutdown_handle(),
                    sender: Box::new(sender),
                    receiver: Box::new(receiver),
                }
            }
        }
    }

    /// Shut both ends down
    pub fn shutdown_handles(&self) -> [ShutdownHandle; 2] {
        [self.sender_handle.clone(), self.receiver_handle.clone()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{PluginKind, TaskCollector};
    use crate::config::ChannelConfig;
    use crate::counters::Counters;
    use crate::record::Column;

    fn pair(kind: ExchangerKind) -> ExchangerPair {
        let counters = Arc::new(Counters::new());
        let channel = Arc::new(
            MemoryChannel::new(0, 0, ChannelConfig::unthrottled(), counters.clone()).unwrap(),
        );
        let config = ExchangerConfig {
            kind,
            ..ExchangerConfig::default()
        };
        ExchangerPair::new(
            channel,
            &config,
            TransformChain::default(),
            Arc::new(TaskCollector::new(counters.clone(), PluginKind::Reader)),
            Arc::new(TaskCollector::new(counters, PluginKind::Writer)),
        )
    }

    #[test]
    fn test_pair_round_trip_for_both_kinds() {
        for kind in [ExchangerKind::Buffered, ExchangerKind::Direct] {
            let mut pair = pair(kind);
            for i in 0..3 {
                pair.sender
                    .send(Record::from_columns(vec![Column::Long(i)]))
                    .unwrap();
            }
            pair.sender.terminate().unwrap();

            for i in 0..3 {
                let record = pair.receiver.receive().unwrap().unwrap();
                assert_eq!(record.column(0), Some(&Column::Long(i)));
            }
            assert!(pair.receiver.receive().unwrap().is_none());
            assert!(pair.receiver.receive().unwrap().is_none());
        }
    }

    #[test]
    fn test_external_shutdown_unblocks_receiver() {
        let mut pair = pair(ExchangerKind::Buffered);
        let handle = pair.receiver_handle.clone();
        let waiter = std::thread::spawn(move || {
            let result = pair.receiver.receive();
            (result, pair)
        });
        std::thread::sleep(std::time::Duration::from_millis(50));
        handle.shutdown();

        let (result, _pair) = waiter.join().unwrap();
        assert!(matches!(result, Err(SyncError::ShutDownTask)));
    }
}
