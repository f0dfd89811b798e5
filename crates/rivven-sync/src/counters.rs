//! Shared statistics and state for a task, a group or a whole job
//!
//! [`Counters`] is mutated concurrently by channels, exchangers, collectors
//! and runners. Individual counters are atomic; consistency across counters
//! is eventual, which is enough for a polling rate limiter and a best-effort
//! progress report.
//!
//! Scopes roll up task → group → job with [`Counters::merge_from`] and
//! [`Counters::rollup`].

use crate::error::{ErrorCode, SyncError};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Number of named counters
pub const COUNTER_COUNT: usize = 15;

/// Named atomic counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterKey {
    ReadSucceedRecords,
    ReadSucceedBytes,
    ReadFailedRecords,
    ReadFailedBytes,
    WriteReceivedRecords,
    WriteReceivedBytes,
    WriteFailedRecords,
    WriteFailedBytes,
    /// Nanoseconds the consumer spent blocked on an empty channel
    WaitReaderTime,
    /// Nanoseconds the producer spent blocked on a full channel
    WaitWriterTime,
    /// Incremented once per successful task completion
    Stage,
    TransformerSucceedRecords,
    TransformerFailedRecords,
    TransformerFilterRecords,
    /// Nanoseconds spent inside transformers
    TransformerUsedTime,
}

impl CounterKey {
    pub const ALL: [CounterKey; COUNTER_COUNT] = [
        CounterKey::ReadSucceedRecords,
        CounterKey::ReadSucceedBytes,
        CounterKey::ReadFailedRecords,
        CounterKey::ReadFailedBytes,
        CounterKey::WriteReceivedRecords,
        CounterKey::WriteReceivedBytes,
        CounterKey::WriteFailedRecords,
        CounterKey::WriteFailedBytes,
        CounterKey::WaitReaderTime,
        CounterKey::WaitWriterTime,
        CounterKey::Stage,
        CounterKey::TransformerSucceedRecords,
        CounterKey::TransformerFailedRecords,
        CounterKey::TransformerFilterRecords,
        CounterKey::TransformerUsedTime,
    ];

    /// Stable name used in snapshots
    pub fn name(self) -> &'static str {
        match self {
            CounterKey::ReadSucceedRecords => "read_succeed_records",
            CounterKey::ReadSucceedBytes => "read_succeed_bytes",
            CounterKey::ReadFailedRecords => "read_failed_records",
            CounterKey::ReadFailedBytes => "read_failed_bytes",
            CounterKey::WriteReceivedRecords => "write_received_records",
            CounterKey::WriteReceivedBytes => "write_received_bytes",
            CounterKey::WriteFailedRecords => "write_failed_records",
            CounterKey::WriteFailedBytes => "write_failed_bytes",
            CounterKey::WaitReaderTime => "wait_reader_time",
            CounterKey::WaitWriterTime => "wait_writer_time",
            CounterKey::Stage => "stage",
            CounterKey::TransformerSucceedRecords => "transformer_succeed_records",
            CounterKey::TransformerFailedRecords => "transformer_failed_records",
            CounterKey::TransformerFilterRecords => "transformer_filter_records",
            CounterKey::TransformerUsedTime => "transformer_used_time",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Status of a task, group or job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    #[default]
    Running,
    Succeeded,
    Failed,
    Killed,
}

impl TaskState {
    pub fn is_finished(self) -> bool {
        !matches!(self, TaskState::Running)
    }

    pub fn is_failed(self) -> bool {
        matches!(self, TaskState::Failed | TaskState::Killed)
    }

    /// Combine two states: failure dominates, then running, then success
    pub fn merge(self, other: TaskState) -> TaskState {
        if self.is_failed() || other.is_failed() {
            TaskState::Failed
        } else if self == TaskState::Running || other == TaskState::Running {
            TaskState::Running
        } else {
            TaskState::Succeeded
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Running => write!(f, "running"),
            TaskState::Succeeded => write!(f, "succeeded"),
            TaskState::Failed => write!(f, "failed"),
            TaskState::Killed => write!(f, "killed"),
        }
    }
}

/// Concurrent statistics/state container for one scope
#[derive(Debug)]
pub struct Counters {
    values: [AtomicU64; COUNTER_COUNT],
    state: Mutex<TaskState>,
    failure: Mutex<Option<Arc<SyncError>>>,
    timestamp: AtomicI64,
    messages: Mutex<IndexMap<String, Vec<String>>>,
    phase_timings: Mutex<IndexMap<String, u64>>,
}

impl Default for Counters {
    fn default() -> Self {
        Self::new()
    }
}

impl Counters {
    pub fn new() -> Self {
        Self {
            values: std::array::from_fn(|_| AtomicU64::new(0)),
            state: Mutex::new(TaskState::Running),
            failure: Mutex::new(None),
            timestamp: AtomicI64::new(now_millis()),
            messages: Mutex::new(IndexMap::new()),
            phase_timings: Mutex::new(IndexMap::new()),
        }
    }

    pub fn get(&self, key: CounterKey) -> u64 {
        self.values[key.index()].load(Ordering::Relaxed)
    }

    pub fn increase(&self, key: CounterKey, delta: u64) {
        self.values[key.index()].fetch_add(delta, Ordering::Relaxed);
    }

    pub fn set(&self, key: CounterKey, value: u64) {
        self.values[key.index()].store(value, Ordering::Relaxed);
    }

    /// Succeeded plus failed records on the reader side
    pub fn total_read_records(&self) -> u64 {
        self.get(CounterKey::ReadSucceedRecords) + self.get(CounterKey::ReadFailedRecords)
    }

    /// Succeeded plus failed bytes on the reader side
    pub fn total_read_bytes(&self) -> u64 {
        self.get(CounterKey::ReadSucceedBytes) + self.get(CounterKey::ReadFailedBytes)
    }

    pub fn state(&self) -> TaskState {
        *self.state.lock()
    }

    /// Set the state. A failed scope stays failed; use [`Counters::force_state`]
    /// to leave it.
    pub fn set_state(&self, state: TaskState) {
        let mut current = self.state.lock();
        if current.is_failed() {
            return;
        }
        *current = state;
        self.touch();
    }

    pub fn force_state(&self, state: TaskState) {
        *self.state.lock() = state;
        self.touch();
    }

    /// Mark the scope failed and capture the error. The first failure wins.
    pub fn fail(&self, error: Arc<SyncError>) {
        {
            let mut failure = self.failure.lock();
            if failure.is_none() {
                *failure = Some(error);
            }
        }
        self.force_state(TaskState::Failed);
    }

    pub fn failure(&self) -> Option<Arc<SyncError>> {
        self.failure.lock().clone()
    }

    /// Milliseconds since the epoch of the last state change
    pub fn timestamp(&self) -> i64 {
        self.timestamp.load(Ordering::Relaxed)
    }

    pub fn touch(&self) {
        self.timestamp.store(now_millis(), Ordering::Relaxed);
    }

    pub fn add_message(&self, key: impl Into<String>, value: impl Into<String>) {
        self.messages
            .lock()
            .entry(key.into())
            .or_default()
            .push(value.into());
    }

    pub fn messages(&self, key: &str) -> Vec<String> {
        self.messages.lock().get(key).cloned().unwrap_or_default()
    }

    /// Accumulate time spent in a lifecycle phase
    pub fn record_phase(&self, label: &str, elapsed: Duration) {
        *self
            .phase_timings
            .lock()
            .entry(label.to_string())
            .or_insert(0) += elapsed.as_nanos() as u64;
    }

    pub fn phase_timing(&self, label: &str) -> Option<Duration> {
        self.phase_timings
            .lock()
            .get(label)
            .map(|nanos| Duration::from_nanos(*nanos))
    }

    /// Clear everything and return to running
    pub fn reset(&self) {
        for value in &self.values {
            value.store(0, Ordering::Relaxed);
        }
        *self.failure.lock() = None;
        self.messages.lock().clear();
        self.phase_timings.lock().clear();
        self.force_state(TaskState::Running);
    }

    /// Fold another scope into this one
    pub fn merge_from(&self, other: &Counters) {
        for key in CounterKey::ALL {
            self.increase(key, other.get(key));
        }

        if let Some(error) = other.failure() {
            let mut failure = self.failure.lock();
            if failure.is_none() {
                *failure = Some(error);
            }
        }

        {
            let mut state = self.state.lock();
            *state = state.merge(other.state());
        }

        {
            let theirs = other.messages.lock().clone();
            let mut ours = self.messages.lock();
            for (key, values) in theirs {
                ours.entry(key).or_default().extend(values);
            }
        }

        {
            let theirs = other.phase_timings.lock().clone();
            let mut ours = self.phase_timings.lock();
            for (label, nanos) in theirs {
                *ours.entry(label).or_insert(0) += nanos;
            }
        }

        self.timestamp
            .fetch_max(other.timestamp(), Ordering::Relaxed);
    }

    /// Overwrite this scope with the contents of `other`
    pub fn copy_from(&self, other: &Counters) {
        for key in CounterKey::ALL {
            self.set(key, other.get(key));
        }
        *self.failure.lock() = other.failure();
        *self.state.lock() = other.state();
        *self.messages.lock() = other.messages.lock().clone();
        *self.phase_timings.lock() = other.phase_timings.lock().clone();
        self.timestamp.store(other.timestamp(), Ordering::Relaxed);
    }

    /// Build a fresh scope summing all inputs.
    ///
    /// An empty rollup is `Succeeded`: a scope with no work has nothing left
    /// to run.
    pub fn rollup<'a, I>(scopes: I) -> Counters
    where
        I: IntoIterator<Item = &'a Counters>,
    {
        let total = Counters::new();
        total.force_state(TaskState::Succeeded);
        for scope in scopes {
            total.merge_from(scope);
        }
        total
    }

    /// Point-in-time copy
    pub fn snapshot(&self) -> CountersSnapshot {
        let counters = CounterKey::ALL
            .iter()
            .map(|key| (key.name().to_string(), self.get(*key)))
            .collect();
        CountersSnapshot {
            counters,
            state: self.state(),
            failure: self.failure().map(|e| CapturedFailure::from(e.as_ref())),
            timestamp: self.timestamp(),
            messages: self.messages.lock().clone(),
            phase_timings: self.phase_timings.lock().clone(),
        }
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Failure as seen by the reporting layer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapturedFailure {
    pub code: u32,
    pub kind: ErrorCode,
    pub message: String,
}

impl From<&SyncError> for CapturedFailure {
    fn from(error: &SyncError) -> Self {
        let kind = error.code();
        Self {
            code: kind.code(),
            kind,
            message: error.to_string(),
        }
    }
}

/// Serializable copy of a [`Counters`] scope
#[derive(Debug, Clone, Serialize)]
pub struct CountersSnapshot {
    pub counters: IndexMap<String, u64>,
    pub state: TaskState,
    pub failure: Option<CapturedFailure>,
    pub timestamp: i64,
    pub messages: IndexMap<String, Vec<String>>,
    pub phase_timings: IndexMap<String, u64>,
}

impl CountersSnapshot {
    pub fn get(&self, key: CounterKey) -> u64 {
        self.counters.get(key.name()).copied().unwrap_or(0)
    }

    pub fn total_read_records(&self) -> u64 {
        self.get(CounterKey::ReadSucceedRecords) + self.get(CounterKey::ReadFailedRecords)
    }

    pub fn total_read_bytes(&self) -> u64 {
        self.get(CounterKey::ReadSucceedBytes) + self.get(CounterKey::ReadFailedBytes)
    }

    pub fn total_error_records(&self) -> u64 {
        self.get(CounterKey::ReadFailedRecords) + self.get(CounterKey::WriteFailedRecords)
    }

    pub fn total_error_bytes(&self) -> u64 {
        self.get(CounterKey::ReadFailedBytes) + self.get(CounterKey::WriteFailedBytes)
    }

    pub fn write_succeed_records(&self) -> u64 {
        self.get(CounterKey::WriteReceivedRecords)
            .saturating_sub(self.get(CounterKey::WriteFailedRecords))
    }

    pub fn write_succeed_bytes(&self) -> u64 {
        self.get(CounterKey::WriteReceivedBytes)
            .saturating_sub(self.get(CounterKey::WriteFailedBytes))
    }
}

/// Progress line computed from two snapshots
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Progress {
    pub total_records: u64,
    pub total_bytes: u64,
    pub error_records: u64,
    pub error_bytes: u64,
    pub record_speed: u64,
    pub byte_speed: u64,
    pub wait_reader_time: Duration,
    pub wait_writer_time: Duration,
    pub transformer_succeed_records: u64,
    pub transformer_failed_records: u64,
    pub transformer_filter_records: u64,
    pub transformer_used_time: Duration,
    pub percentage: f64,
}

impl Progress {
    /// Speeds are measured over `elapsed` since `previous` (or since start).
    /// `total_stages` is the number of tasks in the scope.
    pub fn between(
        previous: Option<&CountersSnapshot>,
        current: &CountersSnapshot,
        elapsed: Duration,
        total_stages: u64,
    ) -> Self {
        let (prev_records, prev_bytes) = previous
            .map(|p| (p.total_read_records(), p.total_read_bytes()))
            .unwrap_or((0, 0));
        let millis = elapsed.as_millis().max(1) as u64;
        let record_speed =
            current.total_read_records().saturating_sub(prev_records) * 1000 / millis;
        let byte_speed = current.total_read_bytes().saturating_sub(prev_bytes) * 1000 / millis;

        let percentage = if total_stages == 0 {
            1.0
        } else {
            (current.get(CounterKey::Stage) as f64 / total_stages as f64).min(1.0)
        };

        Self {
            total_records: current.total_read_records(),
            total_bytes: current.total_read_bytes(),
            error_records: current.total_error_records(),
            error_bytes: current.total_error_bytes(),
            record_speed,
            byte_speed,
            wait_reader_time: Duration::from_nanos(current.get(CounterKey::WaitReaderTime)),
            wait_writer_time: Duration::from_nanos(current.get(CounterKey::WaitWriterTime)),
            transformer_succeed_records: current.get(CounterKey::TransformerSucceedRecords),
            transformer_failed_records: current.get(CounterKey::TransformerFailedRecords),
            transformer_filter_records: current.get(CounterKey::TransformerFilterRecords),
            transformer_used_time: Duration::from_nanos(
                current.get(CounterKey::TransformerUsedTime),
            ),
            percentage,
        }
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Total {} records, {} bytes | Speed {}/s, {} records/s | Error {} records, {} bytes | \
             All Task WaitWriterTime {:.3}s | All Task WaitReaderTime {:.3}s",
            self.total_records,
            self.total_bytes,
            human_bytes(self.byte_speed),
            self.record_speed,
            self.error_records,
            self.error_bytes,
            self.wait_writer_time.as_secs_f64(),
            self.wait_reader_time.as_secs_f64(),
        )?;
        let transformed = self.transformer_succeed_records
            + self.transformer_failed_records
            + self.transformer_filter_records;
        if transformed > 0 {
            write!(
                f,
                " | Transformer Success {} records | Transformer Error {} records | \
                 Transformer Filter {} records | Transformer usedTime {:.3}s",
                self.transformer_succeed_records,
                self.transformer_failed_records,
                self.transformer_filter_records,
                self.transformer_used_time.as_secs_f64(),
            )?;
        }
        write!(f, " | Percentage {:.2}%", self.percentage * 100.0)
    }
}

/// Render a byte count with a binary unit suffix
pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{}{}", bytes, UNITS[0])
    } else {
        format!("{:.2}{}", value, UNITS[unit])
    }
}
