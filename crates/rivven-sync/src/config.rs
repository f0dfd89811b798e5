//! Configuration types for rivven-sync
//!
//! ```yaml
//! job:
//!   channels: 8
//!   channels_per_group: 4
//!   error_limit:
//!     record: 100
//! channel:
//!   capacity: 2048
//!   record_speed: ${RECORD_SPEED:-10000}
//! exchanger:
//!   kind: buffered
//!   buffer_size: 32
//! transformers:
//!   - type: filter
//!     column: 1
//!     op: "<"
//!     value: "100"
//! ```

use crate::error::{Result, SyncError};
use crate::record::RecordKind;
use crate::transformer::TransformStep;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;
use validator::Validate;

/// Pre-compiled regex for environment variable expansion
/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize, Validate)]
pub struct SyncConfig {
    /// Job-level settings
    #[serde(default)]
    #[validate(nested)]
    pub job: JobConfig,

    /// Channel settings, applied to every task pair
    #[serde(default)]
    #[validate(nested)]
    pub channel: ChannelConfig,

    /// Exchanger settings
    #[serde(default)]
    #[validate(nested)]
    pub exchanger: ExchangerConfig,

    /// Task group container settings
    #[serde(default)]
    #[validate(nested)]
    pub task_group: TaskGroupConfig,

    /// Transformers applied on the reader side, in order
    #[serde(default)]
    pub transformers: Vec<TransformStep>,
}

/// Job-level settings
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct JobConfig {
    /// Total channel budget across all groups
    #[serde(default = "default_channels")]
    #[validate(range(min = 1))]
    pub channels: usize,

    /// Channels per task group
    #[serde(default = "default_channels_per_group")]
    #[validate(range(min = 1))]
    pub channels_per_group: usize,

    /// Poll interval of the scheduler (ms)
    #[serde(default = "default_job_sleep_interval_ms")]
    #[validate(range(min = 1))]
    pub sleep_interval_ms: u64,

    /// Interval between progress reports (ms)
    #[serde(default = "default_job_report_interval_ms")]
    #[validate(range(min = 1))]
    pub report_interval_ms: u64,

    /// Dirty-record limit
    #[serde(default)]
    #[validate(nested)]
    pub error_limit: ErrorLimitConfig,
}

fn default_channels() -> usize {
    1
}

fn default_channels_per_group() -> usize {
    5
}

fn default_job_sleep_interval_ms() -> u64 {
    1000
}

fn default_job_report_interval_ms() -> u64 {
    30_000
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            channels: default_channels(),
            channels_per_group: default_channels_per_group(),
            sleep_interval_ms: default_job_sleep_interval_ms(),
            report_interval_ms: default_job_report_interval_ms(),
            error_limit: ErrorLimitConfig::default(),
        }
    }
}

impl JobConfig {
    pub fn sleep_interval(&self) -> Duration {
        Duration::from_millis(self.sleep_interval_ms)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }
}

/// Dirty-record limit. `record` takes priority over `percentage`.
#[derive(Debug, Clone, Default, Deserialize, Serialize, Validate)]
pub struct ErrorLimitConfig {
    /// Maximum number of dirty records
    pub record: Option<u64>,

    /// Maximum ratio of dirty records to records read, 0.0 to 1.0
    #[validate(range(min = 0.0, max = 1.0))]
    pub percentage: Option<f64>,
}

/// Channel settings
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ChannelConfig {
    /// Maximum queued records
    #[serde(default = "default_channel_capacity")]
    #[validate(range(min = 1))]
    pub capacity: usize,

    /// Maximum queued bytes (record memory size)
    #[serde(default = "default_byte_capacity")]
    #[validate(range(min = 1))]
    pub byte_capacity: usize,

    /// Byte rate ceiling in bytes/s (<= 0 disables)
    #[serde(default = "default_byte_speed")]
    pub byte_speed: i64,

    /// Record rate ceiling in records/s (<= 0 disables)
    #[serde(default = "default_record_speed")]
    pub record_speed: i64,

    /// Measurement window of the rate limiter (ms)
    #[serde(default = "default_flow_control_interval_ms")]
    #[validate(range(min = 1))]
    pub flow_control_interval_ms: u64,
}

fn default_channel_capacity() -> usize {
    2048
}

fn default_byte_capacity() -> usize {
    8 * 1024 * 1024
}

fn default_byte_speed() -> i64 {
    1024 * 1024
}

fn default_record_speed() -> i64 {
    10_000
}

fn default_flow_control_interval_ms() -> u64 {
    1000
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            capacity: default_channel_capacity(),
            byte_capacity: default_byte_capacity(),
            byte_speed: default_byte_speed(),
            record_speed: default_record_speed(),
            flow_control_interval_ms: default_flow_control_interval_ms(),
        }
    }
}

impl ChannelConfig {
    /// Channel without rate ceilings
    pub fn unthrottled() -> Self {
        Self {
            byte_speed: 0,
            record_speed: 0,
            ..Self::default()
        }
    }

    pub fn with_capacity(mut self, capacity: usize, byte_capacity: usize) -> Self {
        self.capacity = capacity;
        self.byte_capacity = byte_capacity;
        self
    }

    pub fn with_speed(mut self, record_speed: i64, byte_speed: i64) -> Self {
        self.record_speed = record_speed;
        self.byte_speed = byte_speed;
        self
    }

    pub fn with_flow_control_interval(mut self, interval: Duration) -> Self {
        self.flow_control_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn is_rate_limited(&self) -> bool {
        self.byte_speed > 0 || self.record_speed > 0
    }

    pub fn flow_control_interval(&self) -> Duration {
        Duration::from_millis(self.flow_control_interval_ms)
    }
}

/// Which exchanger pair connects readers and writers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangerKind {
    /// Batches records through `push_all`/`pull_all`
    #[default]
    Buffered,
    /// One record per channel operation
    Direct,
}

/// Exchanger settings
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ExchangerConfig {
    #[serde(default)]
    pub kind: ExchangerKind,

    /// Records per batch
    #[serde(default = "default_buffer_size")]
    #[validate(range(min = 1))]
    pub buffer_size: usize,

    /// Record representation handed out by `create_record`
    #[serde(default)]
    pub record_kind: RecordKind,
}

fn default_buffer_size() -> usize {
    32
}

impl Default for ExchangerConfig {
    fn default() -> Self {
        Self {
            kind: ExchangerKind::default(),
            buffer_size: default_buffer_size(),
            record_kind: RecordKind::default(),
        }
    }
}

/// Task group container settings
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct TaskGroupConfig {
    /// Dirty samples logged per task (<= 0 means unlimited)
    #[serde(default = "default_max_dirty_log")]
    pub max_dirty_log: i64,

    /// Poll interval of the container (ms)
    #[serde(default = "default_group_sleep_interval_ms")]
    #[validate(range(min = 1))]
    pub sleep_interval_ms: u64,

    /// Interval between group reports (ms)
    #[serde(default = "default_group_report_interval_ms")]
    #[validate(range(min = 1))]
    pub report_interval_ms: u64,

    /// Total attempts of a task whose writer supports failover (1 never retries)
    #[serde(default = "default_task_max_retry_times")]
    pub task_max_retry_times: u32,

    /// Delay before a retry (ms)
    #[serde(default = "default_task_retry_interval_ms")]
    pub task_retry_interval_ms: u64,

    /// Maximum time to wait for a failed attempt's threads to exit (ms)
    #[serde(default = "default_task_max_wait_ms")]
    #[validate(range(min = 1))]
    pub task_max_wait_ms: u64,
}

fn default_max_dirty_log() -> i64 {
    crate::collector::DEFAULT_MAX_DIRTY_LOG
}

fn default_group_sleep_interval_ms() -> u64 {
    100
}

fn default_group_report_interval_ms() -> u64 {
    10_000
}

fn default_task_max_retry_times() -> u32 {
    1
}

fn default_task_retry_interval_ms() -> u64 {
    10_000
}

fn default_task_max_wait_ms() -> u64 {
    60_000
}

impl Default for TaskGroupConfig {
    fn default() -> Self {
        Self {
            max_dirty_log: default_max_dirty_log(),
            sleep_interval_ms: default_group_sleep_interval_ms(),
            report_interval_ms: default_group_report_interval_ms(),
            task_max_retry_times: default_task_max_retry_times(),
            task_retry_interval_ms: default_task_retry_interval_ms(),
            task_max_wait_ms: default_task_max_wait_ms(),
        }
    }
}

impl TaskGroupConfig {
    pub fn sleep_interval(&self) -> Duration {
        Duration::from_millis(self.sleep_interval_ms)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }

    pub fn task_retry_interval(&self) -> Duration {
        Duration::from_millis(self.task_retry_interval_ms)
    }

    pub fn task_max_wait(&self) -> Duration {
        Duration::from_millis(self.task_max_wait_ms)
    }
}

impl SyncConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            SyncError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&content)
    }

    /// Parse configuration from YAML, expanding environment variables first
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let expanded = Self::expand_env_vars(content);
        let config: Self = serde_yaml::from_str(&expanded)?;
        config.check()?;
        Ok(config)
    }

    /// Expand environment variables in the format ${VAR} or ${VAR:-default}
    fn expand_env_vars(content: &str) -> String {
        ENV_VAR_REGEX
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default = caps.get(2).map(|m| m.as_str());

                std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
            })
            .to_string()
    }

    /// Validate ranges and cross-field constraints
    pub fn check(&self) -> Result<()> {
        self.validate()?;

        if self.job.channels_per_group > self.job.channels {
            tracing::debug!(
                "channels_per_group {} exceeds channels {}, a single group will be used",
                self.job.channels_per_group,
                self.job.channels
            );
        }

        for step in &self.transformers {
            step.check()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.channel.capacity, 2048);
        assert_eq!(config.channel.byte_capacity, 8 * 1024 * 1024);
        assert_eq!(config.channel.byte_speed, 1024 * 1024);
        assert_eq!(config.channel.record_speed, 10_000);
        assert_eq!(config.channel.flow_control_interval(), Duration::from_secs(1));
        assert_eq!(config.exchanger.buffer_size, 32);
        assert_eq!(config.task_group.max_dirty_log, 128);
        assert_eq!(config.task_group.task_max_retry_times, 1);
        assert!(config.check().is_ok());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
job:
  channels: 8
  channels_per_group: 3
  error_limit:
    percentage: 0.1
channel:
  capacity: 100
  record_speed: 0
  byte_speed: -1
exchanger:
  kind: direct
  record_kind: lean
transformers:
  - type: substr
    column: 0
    start: 1
    length: 2
"#;
        let config = SyncConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.job.channels, 8);
        assert_eq!(config.job.channels_per_group, 3);
        assert_eq!(config.job.error_limit.percentage, Some(0.1));
        assert_eq!(config.channel.capacity, 100);
        assert!(!config.channel.is_rate_limited());
        assert_eq!(config.exchanger.kind, ExchangerKind::Direct);
        assert_eq!(config.exchanger.record_kind, RecordKind::Lean);
        assert_eq!(config.transformers.len(), 1);
    }

    #[test]
    fn test_env_var_expansion() {
        std::env::set_var("RIVVEN_SYNC_TEST_CAPACITY", "64");
        let yaml = r#"
channel:
  capacity: ${RIVVEN_SYNC_TEST_CAPACITY}
  record_speed: ${RIVVEN_SYNC_TEST_UNSET_SPEED:-500}
"#;
        let config = SyncConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.channel.capacity, 64);
        assert_eq!(config.channel.record_speed, 500);
        std::env::remove_var("RIVVEN_SYNC_TEST_CAPACITY");
    }

    #[test]
    fn test_rejects_zero_budget() {
        let yaml = r#"
job:
  channels: 0
"#;
        let err = SyncConfig::from_yaml_str(yaml).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::ConfigError);
    }

    #[test]
    fn test_rejects_bad_percentage() {
        let yaml = r#"
job:
  error_limit:
    percentage: 1.5
"#;
        assert!(SyncConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_rejects_unknown_filter_operator() {
        let yaml = r#"
transformers:
  - type: filter
    column: 0
    op: "~~"
    value: "x"
"#;
        assert!(SyncConfig::from_yaml_str(yaml).is_err());
    }
}
