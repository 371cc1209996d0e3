use std::fmt;

use thiserror::Error;

use crate::pipeline::StageKind;

/// Invalid or unreadable configuration. Raised while a pipeline is being
/// constructed; no pipeline instance exists afterwards.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid `{section}` config: {message}")]
    Invalid {
        section: &'static str,
        message: String,
    },
}

impl ConfigurationError {
    pub fn invalid(section: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            section,
            message: message.into(),
        }
    }
}

/// Failure of a single stage call.
#[derive(Debug, Error)]
pub enum StageError {
    /// The stage was handed input that breaks its contract.
    #[error("{0}")]
    Validation(String),

    /// The stage's own algorithm failed.
    #[error("{0}")]
    Processing(String),
}

impl StageError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn processing(message: impl Into<String>) -> Self {
        Self::Processing(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StageError::Validation(_) => ErrorKind::Validation,
            StageError::Processing(_) => ErrorKind::Processing,
        }
    }
}

impl From<anyhow::Error> for StageError {
    fn from(err: anyhow::Error) -> Self {
        // `{:#}` keeps the context chain on one line
        StageError::Processing(format!("{:#}", err))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Processing,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Validation => write!(f, "ValidationError"),
            ErrorKind::Processing => write!(f, "ProcessingError"),
        }
    }
}

/// Uniform error result of a pipeline run. Always names the failing stage.
#[derive(Debug, Clone, Error)]
#[error("pipeline failed at {stage}: {kind}: {message}")]
pub struct PipelineFailure {
    pub stage: StageKind,
    pub kind: ErrorKind,
    pub message: String,
    pub trace: Vec<String>,
}
