use crate::file::Stage;
use crate::runner::ProtocolViolation;
use crate::validation::RejectionReason;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Validation error for '{file}': {reason}")]
    Validation {
        file: String,
        reason: RejectionReason,
    },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Stage {stage} failed for '{file}': {message}")]
    StageExecutionFailed {
        file: String,
        stage: Stage,
        message: String,
    },

    #[error("Stage runner protocol violation in {stage}: {violation}")]
    ProtocolViolation {
        stage: Stage,
        violation: ProtocolViolation,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] docbatch_storage::StorageError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    pub fn invalid_state<E: std::fmt::Display>(e: E) -> Self {
        Self::InvalidState(e.to_string())
    }

    pub fn serialization<E: std::fmt::Display>(e: E) -> Self {
        Self::Serialization(e.to_string())
    }

    pub fn config<E: std::fmt::Display>(e: E) -> Self {
        Self::Config(e.to_string())
    }

    pub fn stage_failed(file: impl Into<String>, stage: Stage, message: impl Into<String>) -> Self {
        Self::StageExecutionFailed {
            file: file.into(),
            stage,
            message: message.into(),
        }
    }

    pub fn transition(from: impl std::fmt::Display, to: impl std::fmt::Display) -> Self {
        Self::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err)
    }
}

/// Error category for retry logic
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Transient error - retry automatically (e.g., timeout, connection)
    Transient,
    /// Permanent error - don't retry (e.g., corrupt PDF, unsupported content)
    Permanent,
    /// Infrastructure error - retry, but worth alerting on (e.g., quota, disk full)
    Infrastructure,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Infrastructure => "infrastructure",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "transient" => Ok(ErrorCategory::Transient),
            "permanent" => Ok(ErrorCategory::Permanent),
            "infrastructure" => Ok(ErrorCategory::Infrastructure),
            _ => Err(OrchestratorError::config(format!(
                "Invalid error category: {}",
                s
            ))),
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorCategory::Permanent)
    }

    /// Classify a runner failure message when the runner did not say
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();

        if lower.contains("timeout") || lower.contains("connection") {
            ErrorCategory::Transient
        } else if lower.contains("quota") || lower.contains("out of memory") {
            ErrorCategory::Infrastructure
        } else if lower.contains("invalid") || lower.contains("unsupported") {
            ErrorCategory::Permanent
        } else {
            ErrorCategory::Transient // Default to retry
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
