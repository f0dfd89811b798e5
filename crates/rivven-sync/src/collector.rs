//! Dirty-record collection
//!
//! Records a connector could not process are handed to a [`RecordCollector`]
//! instead of failing the task. The collector bumps the failed counters of
//! the side that owns it and logs a bounded number of samples.

use crate::counters::{CounterKey, Counters};
use crate::error::{Result, SyncError};
use crate::record::Record;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, warn};

/// Default number of dirty samples written to the log
pub const DEFAULT_MAX_DIRTY_LOG: i64 = 128;

/// The role of the plugin owning a collector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    Reader,
    Writer,
    Transformer,
    Handler,
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginKind::Reader => write!(f, "reader"),
            PluginKind::Writer => write!(f, "writer"),
            PluginKind::Transformer => write!(f, "transformer"),
            PluginKind::Handler => write!(f, "handler"),
        }
    }
}

/// Sink for records that could not be processed
pub trait RecordCollector: Send + Sync {
    /// Divert one record. Only fails for a collector owned by a role that
    /// has no failed counters.
    fn collect_dirty_record(
        &self,
        record: &Record,
        failure: Option<&SyncError>,
        message: &str,
    ) -> Result<()>;

    /// Attach a free-form diagnostic entry
    fn collect_message(&self, key: &str, value: &str) -> Result<()>;
}

#[derive(Serialize)]
struct DirtySample<'a> {
    #[serde(rename = "type")]
    kind: PluginKind,
    message: &'a str,
    exception: Option<String>,
    record: &'a [crate::record::Column],
}

/// Collector bound to one task's counters
pub struct TaskCollector {
    counters: Arc<Counters>,
    kind: PluginKind,
    max_dirty_log: i64,
    logged: AtomicU64,
    first_logged: AtomicBool,
}

impl TaskCollector {
    pub fn new(counters: Arc<Counters>, kind: PluginKind) -> Self {
        Self::with_max_dirty_log(counters, kind, DEFAULT_MAX_DIRTY_LOG)
    }

    /// A non-positive `max_dirty_log` logs every dirty record
    pub fn with_max_dirty_log(counters: Arc<Counters>, kind: PluginKind, max_dirty_log: i64) -> Self {
        Self {
            counters,
            kind,
            max_dirty_log,
            logged: AtomicU64::new(0),
            first_logged: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> PluginKind {
        self.kind
    }

    /// Number of samples written to the log so far
    pub fn logged_samples(&self) -> u64 {
        self.logged.load(Ordering::Relaxed)
    }

    fn log_sample(&self, record: &Record, failure: Option<&SyncError>, message: &str) {
        if self.max_dirty_log > 0 {
            let limit = self.max_dirty_log as u64;
            let claimed = self
                .logged
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                    (n < limit).then_some(n + 1)
                });
            if claimed.is_err() {
                return;
            }
        } else {
            self.logged.fetch_add(1, Ordering::Relaxed);
        }

        let sample = DirtySample {
            kind: self.kind,
            message,
            exception: failure.map(|e| e.to_string()),
            record: record.columns(),
        };
        match serde_json::to_string(&sample) {
            Ok(json) => error!(target: "rivven_sync::dirty", "Dirty record: {}", json),
            Err(e) => warn!("Failed to serialize dirty record {}: {}", record, e),
        }

        if let Some(failure) = failure {
            if !self.first_logged.swap(true, Ordering::Relaxed) {
                error!(
                    target: "rivven_sync::dirty",
                    kind = %self.kind,
                    code = failure.code().code(),
                    "First dirty record failure: {:?}",
                    failure
                );
            }
        }
    }
}

impl RecordCollector for TaskCollector {
    fn collect_dirty_record(
        &self,
        record: &Record,
        failure: Option<&SyncError>,
        message: &str,
    ) -> Result<()> {
        let (records_key, bytes_key) = match self.kind {
            PluginKind::Reader => (CounterKey::ReadFailedRecords, CounterKey::ReadFailedBytes),
            PluginKind::Writer => (CounterKey::WriteFailedRecords, CounterKey::WriteFailedBytes),
            other => {
                return Err(SyncError::runtime(format!(
                    "unknown plugin type for dirty record collection: {}",
                    other
                )))
            }
        };
        self.counters.increase(records_key, 1);
        self.counters.increase(bytes_key, record.byte_size() as u64);

        self.log_sample(record, failure, message);
        Ok(())
    }

    fn collect_message(&self, key: &str, value: &str) -> Result<()> {
        if key.is_empty() {
            return Err(SyncError::illegal_argument("message key must not be empty"));
        }
        self.counters.add_message(key, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Column;

    fn record() -> Record {
        Record::from_columns(vec![Column::Long(1), Column::from("abc")])
    }

    #[test]
    fn test_reader_side_counts() {
        let counters = Arc::new(Counters::new());
        let collector = TaskCollector::new(counters.clone(), PluginKind::Reader);

        collector
            .collect_dirty_record(&record(), Some(&SyncError::runtime("bad")), "bad row")
            .unwrap();

        assert_eq!(counters.get(CounterKey::ReadFailedRecords), 1);
        assert_eq!(counters.get(CounterKey::ReadFailedBytes), 11);
        assert_eq!(counters.get(CounterKey::WriteFailedRecords), 0);
    }

    #[test]
    fn test_writer_side_counts() {
        let counters = Arc::new(Counters::new());
        let collector = TaskCollector::new(counters.clone(), PluginKind::Writer);

        collector.collect_dirty_record(&record(), None, "rejected").unwrap();
        collector.collect_dirty_record(&record(), None, "rejected").unwrap();

        assert_eq!(counters.get(CounterKey::WriteFailedRecords), 2);
        assert_eq!(counters.get(CounterKey::ReadFailedRecords), 0);
    }

    #[test]
    fn test_other_roles_are_rejected() {
        let counters = Arc::new(Counters::new());
        for kind in [PluginKind::Transformer, PluginKind::Handler] {
            let collector = TaskCollector::new(counters.clone(), kind);
            let err = collector
                .collect_dirty_record(&record(), None, "x")
                .unwrap_err();
            assert_eq!(err.code(), crate::error::ErrorCode::RuntimeError);
        }
    }

    #[test]
    fn test_sample_cap() {
        let counters = Arc::new(Counters::new());
        let collector = TaskCollector::with_max_dirty_log(counters.clone(), PluginKind::Reader, 2);
        for _ in 0..5 {
            collector.collect_dirty_record(&record(), None, "x").unwrap();
        }
        assert_eq!(collector.logged_samples(), 2);
        assert_eq!(counters.get(CounterKey::ReadFailedRecords), 5);

        let unlimited = TaskCollector::with_max_dirty_log(counters, PluginKind::Reader, 0);
        for _ in 0..5 {
            unlimited.collect_dirty_record(&record(), None, "x").unwrap();
        }
        assert_eq!(unlimited.logged_samples(), 5);
    }

    #[test]
    fn test_collect_message() {
        let counters = Arc::new(Counters::new());
        let collector = TaskCollector::new(counters.clone(), PluginKind::Writer);
        collector.collect_message("skipped", "table t1").unwrap();
        assert_eq!(counters.messages("skipped"), vec!["table t1".to_string()]);
        assert!(collector.collect_message("", "x").is_err());
    }
}
