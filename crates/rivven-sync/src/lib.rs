//! rivven-sync - Batch data-synchronization engine core for Rivven
//!
//! Moves records from reader plugins to writer plugins through bounded,
//! rate-limited in-memory channels. Work units are spread fairly across task
//! groups; every group runs its reader/writer pairs on dedicated threads and
//! rolls per-task statistics up into a job report.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  JobScheduler                                                   │
//! │  work units ──► assign_fairly ──► GroupConfig × ceil(C/K)       │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  TaskGroupRunner (one thread per group)                         │
//! │  └── TaskGroupContainer: ≤ channels task pairs in flight        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  Task pair                                                      │
//! │  Runner<ReaderLifecycle>                 Runner<WriterLifecycle>│
//! │    ReaderTask ─► RecordSender ─► MemoryChannel ─► RecordReceiver│
//! │                  (transforms)    (throttle)        ─► WriterTask│
//! │                        │                                 │      │
//! │                        └──── dirty records ─► Collector ◄┘      │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  Counters: task ─► group ─► job rollup, JobReport               │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use rivven_sync::prelude::*;
//!
//! struct MyFactory;
//!
//! impl TaskFactory<String> for MyFactory {
//!     fn create_reader(&self, unit: &WorkUnit<String>) -> Result<Box<dyn ReaderTask>> {
//!         // ...
//!     }
//!     fn create_writer(&self, unit: &WorkUnit<String>) -> Result<Box<dyn WriterTask>> {
//!         // ...
//!     }
//! }
//!
//! let config = SyncConfig::from_file("job.yaml")?;
//! let units = vec![
//!     WorkUnit::new(0, "orders".to_string()).with_reader_mark("db1"),
//!     WorkUnit::new(1, "users".to_string()).with_reader_mark("db2"),
//! ];
//! let report = JobScheduler::new(config, Arc::new(MyFactory))?.run(units)?;
//! println!("{}", report);
//! ```

// Error types
pub mod error;

// Configuration and logging
pub mod config;
pub mod logging;

// Data model and statistics
pub mod collector;
pub mod counters;
pub mod record;

// Transport
pub mod channel;
pub mod exchanger;
pub mod transformer;

// Execution
pub mod assign;
pub mod group;
pub mod plugin;
pub mod runner;
pub mod scheduler;

// Testing utilities
pub mod testing;

pub use assign::{assign_fairly, GroupConfig, MarkSide, WorkUnit};
pub use channel::{MemoryChannel, Message};
pub use collector::{PluginKind, RecordCollector, TaskCollector};
pub use config::{
    ChannelConfig, ErrorLimitConfig, ExchangerConfig, ExchangerKind, JobConfig, SyncConfig,
    TaskGroupConfig,
};
pub use counters::{CounterKey, Counters, CountersSnapshot, Progress, TaskState};
pub use error::{ErrorCode, Result, SyncError};
pub use exchanger::{
    BufferedExchanger, DirectExchanger, ExchangerPair, RecordReceiver, RecordSender,
    ShutdownHandle,
};
pub use group::{GroupHandle, TaskGroupContainer, TaskGroupRunner};
pub use plugin::{ReaderTask, TaskContext, TaskFactory, WriterTask};
pub use record::{Column, Record, RecordKind};
pub use runner::{Lifecycle, Phase, ReaderLifecycle, Runner, WriterLifecycle};
pub use scheduler::{ErrorRecordChecker, GroupReport, JobReport, JobScheduler};
pub use transformer::{TransformChain, TransformStep, Transformer};

/// Everything a plugin author or job driver needs
pub mod prelude {
    pub use crate::assign::WorkUnit;
    pub use crate::config::SyncConfig;
    pub use crate::error::{ErrorCode, Result, SyncError};
    pub use crate::exchanger::{RecordReceiver, RecordSender};
    pub use crate::plugin::{ReaderTask, TaskContext, TaskFactory, WriterTask};
    pub use crate::record::{Column, Record};
    pub use crate::scheduler::{JobReport, JobScheduler};
    pub use std::sync::Arc;
}
