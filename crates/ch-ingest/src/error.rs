//! Error types for the ingestion library.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for workflow and ingestion operations.
#[derive(Error, Debug)]
pub enum IngestError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Endpoint connection failed (authentication, network, missing file)
    #[error("Connection error ({endpoint}): {message}")]
    Connection { endpoint: String, message: String },

    /// Relation or column missing at discovery or mapping time
    #[error("Schema error: {0}")]
    Schema(String),

    /// Mapping override referenced a source column that is not in the mapping
    #[error("Unknown source column: {0}")]
    UnknownSource(String),

    /// Mapping override referenced a target column that does not exist
    #[error("Unknown target column: {0}")]
    UnknownTarget(String),

    /// Mapping has nothing to transfer
    #[error("Mapping is empty - select at least one column with a target")]
    EmptyMapping,

    /// Two source columns feed the same target column
    #[error("Target column '{target}' is already mapped from '{source_column}'")]
    DuplicateTarget {
        target: String,
        source_column: String,
    },

    /// Workflow event is not legal in the current phase
    #[error("Invalid transition: cannot apply {event} in phase {phase}")]
    InvalidTransition { phase: String, event: String },

    /// A job is already preparing or running on this engine
    #[error("Job {0} is already running")]
    JobAlreadyRunning(String),

    /// Operation needs an ingestion job but there is none
    #[error("No active ingestion job")]
    NoActiveJob,

    /// Generic input validation failure
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Data transfer failed mid-stream
    #[error("Transfer failed for {relation}: {message}")]
    Transfer { relation: String, message: String },

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Delimited file read/write error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Job was cancelled (operator request, SIGINT, reset)
    #[error("Ingestion cancelled")]
    Cancelled,
}

/// Coarse error classification shared by job snapshots and exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    Schema,
    Validation,
    Transfer,
    Config,
    Io,
    Cancelled,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Schema => "schema",
            ErrorKind::Validation => "validation",
            ErrorKind::Transfer => "transfer",
            ErrorKind::Config => "config",
            ErrorKind::Io => "io",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Exit code for successful runs and completed jobs.
pub const EXIT_SUCCESS: u8 = 0;
/// Exit code for user, configuration and validation errors.
pub const EXIT_USER_ERROR: u8 = 1;
/// Exit code for a job that reached the Failed phase.
pub const EXIT_JOB_FAILED: u8 = 2;
/// Exit code for a cancelled job (128 + SIGINT).
pub const EXIT_CANCELLED: u8 = 130;

impl IngestError {
    /// Create a Connection error for the given endpoint kind.
    pub fn connection(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        IngestError::Connection {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Create a Transfer error
    pub fn transfer(relation: impl Into<String>, message: impl Into<String>) -> Self {
        IngestError::Transfer {
            relation: relation.into(),
            message: message.into(),
        }
    }

    /// Create an InvalidTransition error from anything printable.
    pub fn invalid_transition(phase: impl std::fmt::Display, event: impl std::fmt::Display) -> Self {
        IngestError::InvalidTransition {
            phase: phase.to_string(),
            event: event.to_string(),
        }
    }

    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            IngestError::Connection { .. } => ErrorKind::Connection,
            IngestError::Schema(_) | IngestError::UnknownSource(_) | IngestError::UnknownTarget(_) => {
                ErrorKind::Schema
            }
            IngestError::EmptyMapping
            | IngestError::DuplicateTarget { .. }
            | IngestError::InvalidTransition { .. }
            | IngestError::JobAlreadyRunning(_)
            | IngestError::NoActiveJob
            | IngestError::Validation(_) => ErrorKind::Validation,
            IngestError::Transfer { .. } => ErrorKind::Transfer,
            IngestError::Config(_) | IngestError::Yaml(_) => ErrorKind::Config,
            IngestError::Io(_) | IngestError::Json(_) | IngestError::Csv(_) => ErrorKind::Io,
            IngestError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self.kind() {
            ErrorKind::Transfer => EXIT_JOB_FAILED,
            ErrorKind::Cancelled => EXIT_CANCELLED,
            _ => EXIT_USER_ERROR,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for ingestion operations.
pub type Result<T> = std::result::Result<T, IngestError>;
