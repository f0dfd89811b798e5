//! Record-at-a-time exchanger

use super::{RecordReceiver, RecordSender, ShutdownHandle};
use crate::channel::{MemoryChannel, Message};
use crate::collector::RecordCollector;
use crate::config::ExchangerConfig;
use crate::error::Result;
use crate::record::{Record, RecordKind};
use crate::transformer::{ChainOutcome, TransformChain};
use std::sync::Arc;

/// Sends and receives one record per channel operation.
///
/// Transformer statistics are published into the channel's counters after
/// every send so they stay in step with the channel's own counts.
pub struct DirectExchanger {
    channel: Arc<MemoryChannel>,
    collector: Arc<dyn RecordCollector>,
    transforms: TransformChain,
    handle: ShutdownHandle,
    record_kind: RecordKind,
    terminated: bool,
}

impl DirectExchanger {
    pub fn new(
        channel: Arc<MemoryChannel>,
        collector: Arc<dyn RecordCollector>,
        config: &ExchangerConfig,
    ) -> Self {
        Self {
            handle: ShutdownHandle::new(channel.clone()),
            channel,
            collector,
            transforms: TransformChain::default(),
            record_kind: config.record_kind,
            terminated: false,
        }
    }

    pub fn with_transforms(mut self, transforms: TransformChain) -> Self {
        self.transforms = transforms;
        self
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.handle.clone()
    }
}

impl RecordSender for DirectExchanger {
    fn create_record(&self) -> Record {
        self.record_kind.create()
    }

    fn send(&mut self, mut record: Record) -> Result<()> {
        self.handle.ensure_running()?;

        let outcome = self.transforms.apply(&mut record)?;
        let result = match outcome {
            ChainOutcome::Pass => self
                .channel
                .push(record)
                .map_err(|e| self.handle.map_err(e)),
            ChainOutcome::Filtered => Ok(()),
            ChainOutcome::Dirty(err) => {
                self.collector
                    .collect_dirty_record(&record, Some(&err), "transformer failed")
            }
        };
        self.transforms.publish(self.channel.counters());
        result
    }

    fn flush(&mut self) -> Result<()> {
        self.handle.ensure_running()
    }

    fn terminate(&mut self) -> Result<()> {
        self.handle.ensure_running()?;
        self.channel
            .push_terminate()
            .map_err(|e| self.handle.map_err(e))
    }

    fn shutdown(&mut self) {
        self.handle.shutdown();
    }
}

impl RecordReceiver for DirectExchanger {
    fn create_record(&self) -> Record {
        self.record_kind.create()
    }

    fn receive(&mut self) -> Result<Option<Record>> {
        self.handle.ensure_running()?;
        if self.terminated {
            return Ok(None);
        }

        let message = self.channel.pull();
        self.handle.ensure_running()?;
        match message {
            Message::Record(record) => Ok(Some(record)),
            Message::Terminate => {
                self.terminated = true;
                Ok(None)
            }
        }
    }

    fn shutdown(&mut self) {
        self.handle.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{PluginKind, TaskCollector};
    use crate::config::ChannelConfig;
    use crate::counters::{CounterKey, Counters};
    use crate::record::Column;
    use crate::transformer::{PadSide, TransformStep};

    fn exchangers(chain: TransformChain) -> (Arc<Counters>, DirectExchanger, DirectExchanger) {
        let counters = Arc::new(Counters::new());
        let channel = Arc::new(
            MemoryChannel::new(0, 0, ChannelConfig::unthrottled(), counters.clone()).unwrap(),
        );
        let config = ExchangerConfig::default();
        let sender = DirectExchanger::new(
            channel.clone(),
            Arc::new(TaskCollector::new(counters.clone(), PluginKind::Reader)),
            &config,
        )
        .with_transforms(chain);
        let receiver = DirectExchanger::new(
            channel,
            Arc::new(TaskCollector::new(counters.clone(), PluginKind::Writer)),
            &config,
        );
        (counters, sender, receiver)
    }

    #[test]
    fn test_each_send_reaches_channel() {
        let (counters, mut sender, mut receiver) = exchangers(TransformChain::default());
        sender.send(Record::from_columns(vec![Column::Long(1)])).unwrap();
        assert_eq!(counters.get(CounterKey::ReadSucceedRecords), 1);

        sender.terminate().unwrap();
        assert!(receiver.receive().unwrap().is_some());
        assert!(receiver.receive().unwrap().is_none());
        assert!(receiver.receive().unwrap().is_none());
    }

    #[test]
    fn test_transform_rewrites_and_failures_are_dirty() {
        let chain = TransformChain::from_steps(&[
            TransformStep::Pad {
                column: 0,
                side: PadSide::Left,
                length: 3,
                pad: "0".to_string(),
            },
            TransformStep::Substr {
                column: 1,
                start: 2,
                length: 1,
            },
        ])
        .unwrap();
        let (counters, mut sender, mut receiver) = exchangers(chain);

        sender
            .send(Record::from_columns(vec![Column::Long(7), Column::from("abc")]))
            .unwrap();
        // "a" is too short for start index 2
        sender
            .send(Record::from_columns(vec![Column::Long(8), Column::from("a")]))
            .unwrap();
        sender.terminate().unwrap();

        let record = receiver.receive().unwrap().unwrap();
        assert_eq!(record.column(0), Some(&Column::from("007")));
        assert_eq!(record.column(1), Some(&Column::from("c")));
        assert!(receiver.receive().unwrap().is_none());

        assert_eq!(counters.get(CounterKey::ReadFailedRecords), 1);
        assert_eq!(counters.get(CounterKey::TransformerSucceedRecords), 1);
        assert_eq!(counters.get(CounterKey::TransformerFailedRecords), 1);
    }

    #[test]
    fn test_shutdown_twice_then_every_call_fails() {
        let (_, mut sender, mut receiver) = exchangers(TransformChain::default());
        RecordSender::shutdown(&mut sender);
        RecordSender::shutdown(&mut sender);
        RecordReceiver::shutdown(&mut receiver);

        for _ in 0..2 {
            assert!(sender
                .send(Record::from_columns(vec![Column::Long(1)]))
                .unwrap_err()
                .is_shutdown());
            assert!(sender.flush().unwrap_err().is_shutdown());
            assert!(receiver.receive().unwrap_err().is_shutdown());
        }
    }
}
