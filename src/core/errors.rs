//! SHEP-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the crate.
pub type Result<T> = std::result::Result<T, ShepherdError>;

/// Top-level error type for Shepherd.
#[derive(Debug, Error)]
pub enum ShepherdError {
    #[error("[SHEP-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[SHEP-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[SHEP-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[SHEP-2001] run directory missing or unreadable: {run_id}")]
    RunNotFound { run_id: String },

    #[error("[SHEP-2002] state document at {path} is corrupt: {details}")]
    CorruptState { path: PathBuf, details: String },

    #[error("[SHEP-2003] failed to acquire lock for run {run_id}")]
    LockContended { run_id: String },

    #[error("[SHEP-2101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[SHEP-3001] permission denied for {path}")]
    PermissionDenied { path: PathBuf },

    #[error("[SHEP-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[SHEP-3003] channel closed in component {component}")]
    ChannelClosed { component: &'static str },

    #[error("[SHEP-4001] scheduler command {command} failed: {details}")]
    SchedulerCommand { command: &'static str, details: String },

    #[error("[SHEP-4002] scheduler command {command} timed out after {timeout_sec}s")]
    SchedulerTimeout { command: &'static str, timeout_sec: u64 },

    #[error("[SHEP-4003] scheduler output unparseable for {command}: {details}")]
    SchedulerParse { command: &'static str, details: String },

    #[error("[SHEP-5001] another daemon instance already holds the PID file at {path}")]
    AlreadyRunning { path: PathBuf },

    #[error("[SHEP-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl ShepherdError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "SHEP-1001",
            Self::MissingConfig { .. } => "SHEP-1002",
            Self::ConfigParse { .. } => "SHEP-1003",
            Self::RunNotFound { .. } => "SHEP-2001",
            Self::CorruptState { .. } => "SHEP-2002",
            Self::LockContended { .. } => "SHEP-2003",
            Self::Serialization { .. } => "SHEP-2101",
            Self::PermissionDenied { .. } => "SHEP-3001",
            Self::Io { .. } => "SHEP-3002",
            Self::ChannelClosed { .. } => "SHEP-3003",
            Self::SchedulerCommand { .. } => "SHEP-4001",
            Self::SchedulerTimeout { .. } => "SHEP-4002",
            Self::SchedulerParse { .. } => "SHEP-4003",
            Self::AlreadyRunning { .. } => "SHEP-5001",
            Self::Runtime { .. } => "SHEP-3900",
        }
    }

    /// Whether retrying might resolve the failure without operator intervention.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::ChannelClosed { .. }
                | Self::LockContended { .. }
                | Self::SchedulerCommand { .. }
                | Self::SchedulerTimeout { .. }
                | Self::Runtime { .. }
        )
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

impl From<serde_json::Error> for ShepherdError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for ShepherdError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_errors() -> Vec<ShepherdError> {
        vec![
            ShepherdError::InvalidConfig { details: String::new() },
            ShepherdError::MissingConfig { path: PathBuf::new() },
            ShepherdError::ConfigParse { context: "", details: String::new() },
            ShepherdError::RunNotFound { run_id: String::new() },
            ShepherdError::CorruptState { path: PathBuf::new(), details: String::new() },
            ShepherdError::LockContended { run_id: String::new() },
            ShepherdError::Serialization { context: "", details: String::new() },
            ShepherdError::PermissionDenied { path: PathBuf::new() },
            ShepherdError::Io {
                path: PathBuf::new(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "test"),
            },
            ShepherdError::ChannelClosed { component: "" },
            ShepherdError::SchedulerCommand { command: "squeue", details: String::new() },
            ShepherdError::SchedulerTimeout { command: "sbatch", timeout_sec: 10 },
            ShepherdError::SchedulerParse { command: "squeue", details: String::new() },
            ShepherdError::AlreadyRunning { path: PathBuf::new() },
            ShepherdError::Runtime { details: String::new() },
        ]
    }

    #[test]
    fn error_codes_are_unique() {
        let codes: Vec<&str> = sample_errors().iter().map(ShepherdError::code).collect();
        let unique: std::collections::HashSet<&&str> = codes.iter().collect();
        assert_eq!(codes.len(), unique.len(), "error codes must be unique: {codes:?}");
    }

    #[test]
    fn error_codes_have_shep_prefix() {
        for err in sample_errors() {
            assert!(err.code().starts_with("SHEP-"), "code {} must start with SHEP-", err.code());
        }
    }

    #[test]
    fn error_display_includes_code() {
        let err = ShepherdError::InvalidConfig { details: "bad value".to_string() };
        let msg = err.to_string();
        assert!(msg.contains("SHEP-1001"), "display should contain error code: {msg}");
        assert!(msg.contains("bad value"), "display should contain details: {msg}");
    }

    #[test]
    fn retryable_errors_are_correct() {
        assert!(ShepherdError::LockContended { run_id: "r1".into() }.is_retryable());
        assert!(ShepherdError::SchedulerTimeout { command: "squeue", timeout_sec: 5 }.is_retryable());
        assert!(!ShepherdError::InvalidConfig { details: String::new() }.is_retryable());
        assert!(!ShepherdError::AlreadyRunning { path: PathBuf::new() }.is_retryable());
        assert!(!ShepherdError::CorruptState { path: PathBuf::new(), details: String::new() }.is_retryable());
    }

    #[test]
    fn io_convenience_constructor() {
        let err = ShepherdError::io(
            "/tmp/test.txt",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert_eq!(err.code(), "SHEP-3002");
        assert!(err.to_string().contains("/tmp/test.txt"));
    }

    #[test]
    fn from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: ShepherdError = json_err.into();
        assert_eq!(err.code(), "SHEP-2101");
    }

    #[test]
    fn from_toml_error() {
        let toml_err = toml::from_str::<toml::Value>("= invalid").unwrap_err();
        let err: ShepherdError = toml_err.into();
        assert_eq!(err.code(), "SHEP-1003");
    }
}
