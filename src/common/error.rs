//! Error types for spokekv

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Lookup Errors ===
    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Key not found")]
    KeyNotFound,

    #[error("Table already exists: {0}")]
    TableExists(String),

    // === Consensus Errors ===
    #[error("Shard {0} unavailable: {1}")]
    Unavailable(u64, String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("Shard {0} stopped")]
    Stopped(u64),

    #[error("Log range compacted, first retained index is {0}")]
    Compacted(u64),

    #[error("Integrity violation on shard {shard}: {reason}")]
    Integrity { shard: u64, reason: String },

    // === Storage Errors ===
    #[error("Corrupted data: {0}")]
    Corrupted(String),

    #[error("Log error: {0}")]
    Log(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // === Network Errors ===
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { size: u64, limit: u64 },

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("TLS error: {0}")]
    Tls(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Unavailable(..)
                | Error::Timeout(_)
                | Error::Stopped(_)
                | Error::ConnectionFailed(_)
                | Error::Http(_)
        )
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::TableNotFound(_) | Error::KeyNotFound => StatusCode::NOT_FOUND,
            Error::TableExists(_) => StatusCode::CONFLICT,
            Error::Compacted(_) => StatusCode::GONE,
            Error::MessageTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Error::InvalidArgument(_) | Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::Unavailable(..) | Error::Stopped(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else if e.is_connect() {
            Error::ConnectionFailed(e.to_string())
        } else {
            Error::Http(e.to_string())
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Error::Timeout(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_taxonomy() {
        assert!(Error::Unavailable(10001, "no leader".into()).is_retryable());
        assert!(Error::Timeout("proposal".into()).is_retryable());
        assert!(Error::Stopped(10001).is_retryable());

        assert!(!Error::TableNotFound("t".into()).is_retryable());
        assert!(!Error::KeyNotFound.is_retryable());
        assert!(!Error::Integrity {
            shard: 10001,
            reason: "diverged".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_http_status_mapping() {
        use axum::http::StatusCode;
        assert_eq!(
            Error::TableNotFound("t".into()).to_http_status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(Error::Compacted(12).to_http_status(), StatusCode::GONE);
        assert_eq!(
            Error::Unavailable(1, "x".into()).to_http_status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
