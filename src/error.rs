//! Error types for the flow pipeline

use crate::queue::QueueError;
use crate::store::StoreError;
use thiserror::Error;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors raised while decoding CSV artifacts
///
/// Any of these aborts processing of the whole artifact; no partial output is
/// ever produced from a file that fails to parse.
#[derive(Debug, Error)]
pub enum ParseError {
    /// Underlying CSV reader or writer failure
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    /// A required column is absent from the header row
    #[error("missing column '{column}'")]
    MissingColumn {
        /// Expected column name
        column: String,
    },

    /// A timestamp did not match the configured format
    #[error("line {line}: invalid timestamp '{value}' (expected format '{format}')")]
    InvalidTimestamp {
        /// 1-based line in the source artifact
        line: u64,
        /// Offending value
        value: String,
        /// Format that was applied
        format: String,
    },

    /// A date column did not hold an ISO `YYYY-MM-DD` date
    #[error("line {line}: invalid date '{value}'")]
    InvalidDate {
        /// 1-based line in the source artifact
        line: u64,
        /// Offending value
        value: String,
    },

    /// A numeric column held something that is not a number
    #[error("line {line}: column '{column}' is not numeric: '{value}'")]
    InvalidNumber {
        /// 1-based line in the source artifact
        line: u64,
        /// Column name
        column: String,
        /// Offending value
        value: String,
    },

    /// Summing a column exceeded the integer range
    #[error("line {line}: sum of column '{column}' overflowed")]
    Overflow {
        /// 1-based line in the source artifact
        line: u64,
        /// Column name
        column: String,
    },

    /// The same key appears twice in an artifact that must be keyed uniquely
    #[error("line {line}: duplicate key {key}")]
    DuplicateKey {
        /// 1-based line in the source artifact
        line: u64,
        /// Rendered key
        key: String,
    },
}

/// Top level pipeline error
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed CSV artifact
    #[error("parse error in '{artifact}': {source}")]
    Parse {
        /// Artifact (object key or path) being parsed
        artifact: String,
        /// Underlying cause
        #[source]
        source: ParseError,
    },

    /// Malformed trigger message
    #[error("malformed payload: {0}")]
    Payload(String),

    /// A referenced artifact does not exist
    #[error("artifact not found: {0}")]
    NotFound(String),

    /// Object store failure
    #[error("store error: {0}")]
    Store(StoreError),

    /// The aggregate table holds no row for the requested pair
    #[error("pair not found in aggregate table: {0}")]
    PairNotFound(String),

    /// No daily summary holds a row for the requested pair
    #[error("no daily rows for pair {0}")]
    NoDailyRows(String),

    /// Message queue failure
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Concurrent writers kept winning the conditional commit
    #[error("commit conflict on '{key}' after {attempts} attempts")]
    Conflict {
        /// Object that could not be committed
        key: String,
        /// Attempts made
        attempts: u32,
    },

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Local I/O failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization of an internal document failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(key) => PipelineError::NotFound(key),
            StoreError::PreconditionFailed { key, .. } => PipelineError::Conflict { key, attempts: 1 },
            other => PipelineError::Store(other),
        }
    }
}

impl PipelineError {
    /// Wrap a parse error with the artifact it came from
    pub fn parse(artifact: impl Into<String>, source: ParseError) -> Self {
        PipelineError::Parse {
            artifact: artifact.into(),
            source,
        }
    }

    /// Whether this is a lost conditional commit
    pub fn is_conflict(&self) -> bool {
        matches!(self, PipelineError::Conflict { .. })
    }

    /// Check if redelivering the triggering event could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Store(e) => e.is_retryable(),
            PipelineError::Queue(_) => true,
            PipelineError::Conflict { .. } => true,
            PipelineError::Io(_) => true,
            PipelineError::Parse { .. } => false,
            PipelineError::Payload(_) => false,
            PipelineError::NotFound(_) => false,
            PipelineError::PairNotFound(_) | PipelineError::NoDailyRows(_) => false,
            PipelineError::Config(_) => false,
            PipelineError::Serialization(_) => false,
        }
    }

    /// Short label for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Parse { .. } => "parse",
            PipelineError::Payload(_) => "payload",
            PipelineError::NotFound(_) => "not_found",
            PipelineError::Store(_) => "store",
            PipelineError::PairNotFound(_) => "pair_not_found",
            PipelineError::NoDailyRows(_) => "no_daily_rows",
            PipelineError::Queue(_) => "queue",
            PipelineError::Conflict { .. } => "conflict",
            PipelineError::Config(_) => "config",
            PipelineError::Io(_) => "io",
            PipelineError::Serialization(_) => "serialization",
        }
    }

    /// Get error severity
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            PipelineError::Config(_) => ErrorSeverity::Fatal,
            PipelineError::Parse { .. } | PipelineError::Payload(_) => ErrorSeverity::Warning,
            PipelineError::Conflict { .. } => ErrorSeverity::Warning,
            _ => ErrorSeverity::Error,
        }
    }
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Bad input; the event is dropped but the worker keeps going
    Warning,
    /// Infrastructure trouble; the event may succeed on redelivery
    Error,
    /// The worker cannot run
    Fatal,
}
