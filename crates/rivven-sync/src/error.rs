//! Error types for rivven-sync
//!
//! Every failure carries a stable [`ErrorCode`] so that an outer reporting
//! layer can tell configuration problems, connector failures and runtime
//! faults apart without parsing messages.

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Result type alias for rivven-sync
pub type Result<T> = std::result::Result<T, SyncError>;

/// Stable, machine-readable error codes.
///
/// Codes are grouped by thousands: 1xxx configuration, 2xxx access,
/// 3xxx conversion, 4xxx execution, 5xxx runtime, 6xxx framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    RequiredValue,
    IllegalValue,
    ConfigError,
    PermissionError,
    ConnectError,
    LoginError,
    ConvertNotSupport,
    ConvertOverflow,
    NotSupportType,
    EncodingError,
    RetryFail,
    ExecuteFail,
    IoError,
    RuntimeError,
    HookInternalError,
    ShutDownTask,
    WaitTimeExceed,
    TaskHungExpired,
    PluginInstallError,
    PluginInitError,
    OverLimitError,
}

impl ErrorCode {
    /// Numeric code
    pub fn code(&self) -> u32 {
        match self {
            ErrorCode::RequiredValue => 1001,
            ErrorCode::IllegalValue => 1002,
            ErrorCode::ConfigError => 1003,
            ErrorCode::PermissionError => 2001,
            ErrorCode::ConnectError => 2002,
            ErrorCode::LoginError => 2003,
            ErrorCode::ConvertNotSupport => 3001,
            ErrorCode::ConvertOverflow => 3002,
            ErrorCode::NotSupportType => 3003,
            ErrorCode::EncodingError => 3004,
            ErrorCode::RetryFail => 4001,
            ErrorCode::ExecuteFail => 4002,
            ErrorCode::IoError => 4003,
            ErrorCode::RuntimeError => 5001,
            ErrorCode::HookInternalError => 5002,
            ErrorCode::ShutDownTask => 5003,
            ErrorCode::WaitTimeExceed => 5004,
            ErrorCode::TaskHungExpired => 5005,
            ErrorCode::PluginInstallError => 6001,
            ErrorCode::PluginInitError => 6002,
            ErrorCode::OverLimitError => 6003,
        }
    }

    /// Human readable description of the code
    pub fn description(&self) -> &'static str {
        match self {
            ErrorCode::RequiredValue => "missing required parameter value",
            ErrorCode::IllegalValue => "illegal parameter value",
            ErrorCode::ConfigError => "invalid configuration",
            ErrorCode::PermissionError => "permission denied",
            ErrorCode::ConnectError => "connection failed",
            ErrorCode::LoginError => "login failed",
            ErrorCode::ConvertNotSupport => "conversion not supported",
            ErrorCode::ConvertOverflow => "conversion overflow",
            ErrorCode::NotSupportType => "unsupported column type",
            ErrorCode::EncodingError => "encoding error",
            ErrorCode::RetryFail => "retries exhausted",
            ErrorCode::ExecuteFail => "execution failed",
            ErrorCode::IoError => "i/o error",
            ErrorCode::RuntimeError => "runtime error",
            ErrorCode::HookInternalError => "hook failed",
            ErrorCode::ShutDownTask => "task has been shut down",
            ErrorCode::WaitTimeExceed => "wait time exceeded",
            ErrorCode::TaskHungExpired => "task hung and expired",
            ErrorCode::PluginInstallError => "plugin installation failed",
            ErrorCode::PluginInitError => "plugin initialization failed",
            ErrorCode::OverLimitError => "dirty records over limit",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code(), self.description())
    }
}

/// Main error type for rivven-sync
#[derive(Error, Debug)]
pub enum SyncError {
    /// Configuration error, raised before any group starts
    #[error("Configuration error: {0}")]
    Config(String),

    /// Programming error in the arguments of a call
    #[error("Illegal argument: {0}")]
    IllegalArgument(String),

    /// Failure reported by a connector plugin
    #[error("Plugin error {code}: {message}")]
    Plugin { code: ErrorCode, message: String },

    /// Transformer failed on a record
    #[error("Transformer '{name}' error: {message}")]
    Transformer { name: String, message: String },

    /// Channel was closed while the caller was using it
    #[error("Channel closed")]
    ChannelClosed,

    /// Operation attempted on an exchanger after shutdown
    #[error("Task has been shut down")]
    ShutDownTask,

    /// Task code panicked
    #[error("Task panicked: {0}")]
    Panicked(String),

    /// Generic runtime error
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Failure that escaped a task group container
    #[error("Task group {group_id} failed: {source}")]
    GroupFailed {
        group_id: usize,
        #[source]
        source: Arc<SyncError>,
    },

    /// Dirty record count or ratio exceeded the configured limit
    #[error("Error limit exceeded: {0}")]
    OverLimit(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl SyncError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an illegal argument error
    pub fn illegal_argument(msg: impl Into<String>) -> Self {
        Self::IllegalArgument(msg.into())
    }

    /// Create a plugin error carrying a specific code
    pub fn plugin(code: ErrorCode, msg: impl Into<String>) -> Self {
        Self::Plugin {
            code,
            message: msg.into(),
        }
    }

    /// Create a transformer error
    pub fn transformer(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Transformer {
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a runtime error
    pub fn runtime(msg: impl Into<String>) -> Self {
        Self::Runtime(msg.into())
    }

    /// Stable code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            SyncError::Config(_) => ErrorCode::ConfigError,
            SyncError::IllegalArgument(_) => ErrorCode::IllegalValue,
            SyncError::Plugin { code, .. } => *code,
            SyncError::Transformer { .. } => ErrorCode::RuntimeError,
            SyncError::ChannelClosed => ErrorCode::RuntimeError,
            SyncError::ShutDownTask => ErrorCode::ShutDownTask,
            SyncError::Panicked(_) => ErrorCode::RuntimeError,
            SyncError::Runtime(_) => ErrorCode::RuntimeError,
            SyncError::GroupFailed { source, .. } => source.code(),
            SyncError::OverLimit(_) => ErrorCode::OverLimitError,
            SyncError::Io(_) => ErrorCode::IoError,
            SyncError::Yaml(_) => ErrorCode::ConfigError,
        }
    }

    /// Returns true if the error means the exchanger was shut down
    pub fn is_shutdown(&self) -> bool {
        matches!(self, SyncError::ShutDownTask)
    }
}

impl From<validator::ValidationErrors> for SyncError {
    fn from(err: validator::ValidationErrors) -> Self {
        SyncError::Config(err.to_string())
    }
}
