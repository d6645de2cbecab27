//! Error handling for the relay broker

use std::fmt;

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Relay broker error types
#[derive(Debug, Clone)]
pub enum RelayError {
    /// Socket-level errors
    Network(String),
    /// WebSocket protocol errors
    Protocol(String),
    /// Buffer backend errors
    Storage(String),
    /// Record or config (de)serialization errors
    Serialization(String),
    /// Configuration error
    Config(String),
    /// Timeout error
    Timeout(String),
    /// Server internal error
    Internal(String),
}

impl RelayError {
    /// Get error code for this error type
    pub fn code(&self) -> u32 {
        match self {
            RelayError::Network(_) => 1000,
            RelayError::Protocol(_) => 1001,
            RelayError::Storage(_) => 1002,
            RelayError::Serialization(_) => 1003,
            RelayError::Config(_) => 1004,
            RelayError::Timeout(_) => 1005,
            RelayError::Internal(_) => 1006,
        }
    }

    /// Get human-readable error message
    pub fn message(&self) -> &str {
        match self {
            RelayError::Network(msg)
            | RelayError::Protocol(msg)
            | RelayError::Storage(msg)
            | RelayError::Serialization(msg)
            | RelayError::Config(msg)
            | RelayError::Timeout(msg)
            | RelayError::Internal(msg) => msg,
        }
    }

    pub fn network<T: Into<String>>(msg: T) -> Self {
        RelayError::Network(msg.into())
    }

    pub fn protocol<T: Into<String>>(msg: T) -> Self {
        RelayError::Protocol(msg.into())
    }

    pub fn storage<T: Into<String>>(msg: T) -> Self {
        RelayError::Storage(msg.into())
    }

    pub fn serialization<T: Into<String>>(msg: T) -> Self {
        RelayError::Serialization(msg.into())
    }

    pub fn config<T: Into<String>>(msg: T) -> Self {
        RelayError::Config(msg.into())
    }

    pub fn timeout<T: Into<String>>(msg: T) -> Self {
        RelayError::Timeout(msg.into())
    }

    pub fn internal<T: Into<String>>(msg: T) -> Self {
        RelayError::Internal(msg.into())
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::Network(msg) => write!(f, "Network error: {}", msg),
            RelayError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            RelayError::Storage(msg) => write!(f, "Storage error: {}", msg),
            RelayError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            RelayError::Config(msg) => write!(f, "Configuration error: {}", msg),
            RelayError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            RelayError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for RelayError {}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::Network(format!("IO error: {}", err))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for RelayError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        RelayError::Protocol(format!("WebSocket error: {}", err))
    }
}

impl From<redis::RedisError> for RelayError {
    fn from(err: redis::RedisError) -> Self {
        RelayError::Storage(format!("Redis error: {}", err))
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Serialization(format!("JSON error: {}", err))
    }
}
