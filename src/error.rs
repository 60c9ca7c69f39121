use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// How a failed task should be treated by the queue layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input. Log it, acknowledge the task and move on.
    Droppable,
    /// Transient failure. The task stays on the queue and is redelivered.
    Retryable,
}

/// Error returned by publishers, task handlers and middleware
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("dropping task: {0}")]
    Droppable(String),
    #[error("{0}")]
    Retryable(String),
}

impl TaskError {
    pub fn droppable(msg: impl Into<String>) -> Self {
        Self::Droppable(msg.into())
    }

    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Droppable(_) => ErrorKind::Droppable,
            Self::Retryable(_) => ErrorKind::Retryable,
        }
    }

    pub fn is_droppable(&self) -> bool {
        self.kind() == ErrorKind::Droppable
    }
}

impl IntoResponse for TaskError {
    fn into_response(self) -> Response {
        let status = match self.kind() {
            ErrorKind::Droppable => StatusCode::BAD_REQUEST,
            ErrorKind::Retryable => StatusCode::SERVICE_UNAVAILABLE,
        };

        let body = Json(json!({
            "error": {
                "message": self.to_string(),
                "type": match self.kind() {
                    ErrorKind::Droppable => "invalid_request",
                    ErrorKind::Retryable => "unavailable",
                },
            }
        }));

        (status, body).into_response()
    }
}

/// Body encoding failures
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("gzip: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CodecError> for TaskError {
    fn from(err: CodecError) -> Self {
        TaskError::Droppable(err.to_string())
    }
}

/// Task framing failures
#[derive(Debug, Error)]
pub enum WireFormatError {
    #[error("task type is {0} bytes, at most 255 allowed")]
    TypeTooLong(usize),
    #[error("encoded headers are {0} bytes, at most 65535 allowed")]
    HeadersTooLong(usize),
    #[error("truncated message: missing {0}")]
    Truncated(&'static str),
    #[error("task type is not valid utf-8")]
    InvalidType(#[from] std::string::FromUtf8Error),
    #[error("headers: {0}")]
    Headers(#[from] CodecError),
}

impl From<WireFormatError> for TaskError {
    fn from(err: WireFormatError) -> Self {
        TaskError::Droppable(err.to_string())
    }
}

/// Generic key-value and set storage failures
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt value under {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl From<StorageError> for TaskError {
    fn from(err: StorageError) -> Self {
        TaskError::Retryable(err.to_string())
    }
}

/// Proto-session backend failure. Cloned into every position a failed
/// transaction leaves unanswered.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("transaction failed: {0}")]
    Transaction(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("undecodable hit: {0}")]
    Decode(String),
}

impl From<sqlx::Error> for BackendError {
    fn from(err: sqlx::Error) -> Self {
        BackendError::Storage(err.to_string())
    }
}

impl From<StorageError> for BackendError {
    fn from(err: StorageError) -> Self {
        BackendError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(err: serde_json::Error) -> Self {
        BackendError::Decode(err.to_string())
    }
}

impl From<BackendError> for TaskError {
    fn from(err: BackendError) -> Self {
        TaskError::Retryable(err.to_string())
    }
}

/// Object store failures
#[derive(Debug, Error)]
pub enum BucketError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("invalid object key {0:?}")]
    InvalidKey(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("object store error: {0}")]
    Store(String),
}

impl From<object_store::Error> for BucketError {
    fn from(err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { path, .. } => BucketError::NotFound(path),
            other => BucketError::Store(other.to_string()),
        }
    }
}

impl From<BucketError> for TaskError {
    fn from(err: BucketError) -> Self {
        TaskError::Retryable(err.to_string())
    }
}

/// Queue consumer failures that end a poll pass
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bucket error: {0}")]
    Bucket(#[from] BucketError),
    #[error("handler failed: {0}")]
    Handler(#[from] TaskError),
    #[error("queue directory {0} is locked by another consumer")]
    Locked(String),
    #[error("batch processing timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("invalid queue configuration: {0}")]
    Config(String),
}

/// Logical/physical type mapping failure
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MappingError {
    #[error("mapper {mapper:?} does not support {direction} type {type_name}")]
    Unsupported {
        mapper: String,
        direction: &'static str,
        type_name: String,
    },
    #[error("cannot parse physical type {input:?}: {reason}")]
    Parse { input: String, reason: String },
    #[error("mapper graph is no longer alive")]
    Unresolved,
}

impl MappingError {
    pub fn unsupported_logical(mapper: &str, type_name: impl Into<String>) -> Self {
        Self::Unsupported {
            mapper: mapper.to_string(),
            direction: "logical",
            type_name: type_name.into(),
        }
    }

    pub fn unsupported_physical(mapper: &str, type_name: impl Into<String>) -> Self {
        Self::Unsupported {
            mapper: mapper.to_string(),
            direction: "physical",
            type_name: type_name.into(),
        }
    }
}

/// Value formatter failure at insertion time
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FormatError {
    #[error("expected {expected}, got {got}")]
    TypeMismatch { expected: &'static str, got: String },
    #[error("value {value} overflows {target}")]
    Overflow { value: String, target: &'static str },
    #[error("invalid date {0:?}, expected YYYY-MM-DD")]
    InvalidDate(String),
    #[error("invalid timestamp {0:?}")]
    InvalidTimestamp(String),
    #[error("field {field}: {source}")]
    Field {
        field: String,
        #[source]
        source: Box<FormatError>,
    },
}

impl From<FormatError> for TaskError {
    fn from(err: FormatError) -> Self {
        TaskError::Droppable(err.to_string())
    }
}
