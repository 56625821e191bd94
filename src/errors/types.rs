//! Error type definitions for the crawl scheduler
//!
//! This module defines all error types used throughout the service. The
//! hierarchy mirrors the failure domains of the system: requests that are
//! rejected up front, the durable store, and the extraction worker.

use thiserror::Error;

/// Top-level application error type
///
/// Every fallible operation reachable from the HTTP surface returns this type.
/// It uses `thiserror` to provide automatic error trait implementations and
/// proper error chaining.
#[derive(Error, Debug)]
pub enum AppError {
    /// Malformed request (missing url, invalid cron expression, unknown action)
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Resource not found errors
    #[error("Not found: {resource} with id {id}")]
    NotFound { resource: String, id: String },

    /// Durable store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// JSON encoding errors for task payloads
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

/// Durable store specific errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store could not be reached
    #[error("Store connection failed: {message}")]
    ConnectionFailed { message: String },

    /// A command was rejected or failed mid-flight
    #[error("Store command failed: {command} - {message}")]
    CommandFailed { command: String, message: String },

    /// A stored value could not be decoded
    #[error("Corrupt record at {key}: {message}")]
    CorruptRecord { key: String, message: String },

    /// Serializing a value for storage failed
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),
}

/// Extraction worker specific errors
///
/// These never reach the HTTP caller that enqueued the task; they drive the
/// retry state machine and end up as `lastError` on the task.
#[derive(Error, Debug)]
pub enum UpstreamError {
    /// The call did not complete within the configured timeout
    #[error("Extraction timed out after {seconds}s: {url}")]
    Timeout { url: String, seconds: u64 },

    /// Connection refused, DNS failure, broken body, ...
    #[error("Extraction request failed: {message}")]
    Transport { message: String },

    /// The worker answered with a non-2xx status
    #[error("Extraction returned HTTP {status}: {message}")]
    Status { status: u16, message: String },
}

/// Convenience methods for creating common error types
impl AppError {
    /// Create a validation error with a custom message
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a not found error for a specific resource
    pub fn not_found<R: Into<String>, I: Into<String>>(resource: R, id: I) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}

impl StoreError {
    /// Create a command failed error
    pub fn command_failed<C: Into<String>, M: Into<String>>(command: C, message: M) -> Self {
        Self::CommandFailed {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Create a corrupt record error
    pub fn corrupt_record<K: Into<String>, M: Into<String>>(key: K, message: M) -> Self {
        Self::CorruptRecord {
            key: key.into(),
            message: message.into(),
        }
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(error: redis::RedisError) -> Self {
        if error.is_io_error() || error.is_connection_refusal() || error.is_connection_dropped() {
            Self::ConnectionFailed {
                message: error.to_string(),
            }
        } else {
            Self::CommandFailed {
                command: error.code().unwrap_or("redis").to_string(),
                message: error.to_string(),
            }
        }
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(error: reqwest::Error) -> Self {
        if let Some(status) = error.status() {
            Self::Status {
                status: status.as_u16(),
                message: error.to_string(),
            }
        } else {
            Self::Transport {
                message: error.to_string(),
            }
        }
    }
}
