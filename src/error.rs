//! Error types for the shard consumer

use thiserror::Error;
use tokio::task::JoinError;

/// Main error type for processor and worker operations
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("Processor for shard {shard_id} must be initialized before {operation}")]
    NotInitialized {
        shard_id: String,
        operation: &'static str,
    },

    #[error("Processor already initialized for shard {0}")]
    AlreadyInitialized(String),

    #[error("Processor for shard {0} has already terminated")]
    Terminated(String),

    #[error("Checkpoint failed for shard {shard_id}: {source}")]
    CheckpointFailed {
        shard_id: String,
        #[source]
        source: CheckpointError,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Metrics(#[from] MetricsError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<JoinError> for ProcessorError {
    fn from(err: JoinError) -> Self {
        ProcessorError::Other(err.into())
    }
}

/// Result type for processor operations
pub type Result<T> = std::result::Result<T, ProcessorError>;

/// Error type for checkpoint operations
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Failed to save checkpoint: {0}")]
    SaveFailed(String),
}

/// Startup configuration errors; all of them are fatal
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("No configuration file given (set CONFIG_FILE or pass a path)")]
    MissingConfigFile,

    #[error("Could not read configuration file {path}: {source}")]
    Unreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Missing required configuration key '{0}'")]
    MissingKey(&'static str),

    #[error("Invalid value '{value}' for '{key}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Errors raised by the metric registry and the exposition server
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Failed to register metric: {0}")]
    Registration(#[source] prometheus::Error),

    #[error("Failed to update metric for shard {shard_id}: {source}")]
    Update {
        shard_id: String,
        #[source]
        source: prometheus::Error,
    },

    #[error("Failed to encode metrics: {0}")]
    Encode(String),

    #[error("Failed to bind metrics server to {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Metrics server failed: {0}")]
    Serve(String),
}

/// Failure while turning a single record into metric observations.
///
/// Contained per record by the shard processor; never aborts a batch.
#[derive(Debug, Error)]
pub enum RecordMetricError {
    #[error(transparent)]
    Metrics(#[from] MetricsError),

    #[error("Unusable arrival timestamp on record {sequence_number}: {reason}")]
    ArrivalTimestamp {
        sequence_number: String,
        reason: String,
    },
}
