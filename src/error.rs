//! Error taxonomy for device mesh operations
//!
//! Every failure the core can surface is a [`MeshError`]. Errors that cross the wire are mapped to
//! a stable [`ErrorCode`] and a sanitized message via [`MeshError::to_ack_error`].

use crate::protocol::messages::AckError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for device mesh operations
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("Validation failed: {message}")]
    Validation { message: String },

    #[error("Queue overflow: size {size} has reached maximum {max}")]
    Overflow { size: usize, max: usize },

    #[error("Network error: {message}")]
    Network { message: String, retryable: bool },

    #[error("Timed out: {message}")]
    Timeout { message: String },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Compression error: {message}")]
    Compression { message: String },

    #[error("Not found: {message}")]
    NotFound { message: String },

    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

/// Stable error codes carried in failed acknowledgments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    QueueOverflow,
    NetworkError,
    Timeout,
    ProtocolError,
    ProcessingError,
    CompressionError,
    NotFound,
    InvalidState,
    SerializationError,
    ConfigError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::QueueOverflow => "QUEUE_OVERFLOW",
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::ProcessingError => "PROCESSING_ERROR",
            ErrorCode::CompressionError => "COMPRESSION_ERROR",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::InvalidState => "INVALID_STATE",
            ErrorCode::SerializationError => "SERIALIZATION_ERROR",
            ErrorCode::ConfigError => "CONFIG_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl MeshError {
    /// Map to the wire error code
    pub fn code(&self) -> ErrorCode {
        match self {
            MeshError::Validation { .. } => ErrorCode::ValidationError,
            MeshError::Overflow { .. } => ErrorCode::QueueOverflow,
            MeshError::Network { .. } => ErrorCode::NetworkError,
            MeshError::Timeout { .. } => ErrorCode::Timeout,
            MeshError::Protocol { .. } => ErrorCode::ProtocolError,
            MeshError::Compression { .. } => ErrorCode::CompressionError,
            MeshError::NotFound { .. } => ErrorCode::NotFound,
            MeshError::InvalidState { .. } => ErrorCode::InvalidState,
            MeshError::Serialization(_) => ErrorCode::SerializationError,
            MeshError::Config(_) => ErrorCode::ConfigError,
        }
    }

    /// Whether the operation may succeed if retried later
    pub fn is_retryable(&self) -> bool {
        match self {
            MeshError::Network { retryable, .. } => *retryable,
            MeshError::Timeout { .. } | MeshError::Overflow { .. } => true,
            _ => false,
        }
    }

    /// Convert into the error payload of a failed acknowledgment
    pub fn to_ack_error(&self) -> AckError {
        AckError {
            code: self.code().as_str().to_string(),
            message: sanitize_error_message(&self.to_string()),
        }
    }

    /// Same as [`MeshError::to_ack_error`] but with an explicit code
    pub fn to_ack_error_with_code(&self, code: ErrorCode) -> AckError {
        AckError {
            code: code.as_str().to_string(),
            message: sanitize_error_message(&self.to_string()),
        }
    }

    /// Create validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create overflow error
    pub fn overflow(size: usize, max: usize) -> Self {
        Self::Overflow { size, max }
    }

    /// Create retryable network error
    pub fn network<S: Into<String>>(message: S) -> Self {
        Self::Network {
            message: message.into(),
            retryable: true,
        }
    }

    /// Create terminal network error
    pub fn network_fatal<S: Into<String>>(message: S) -> Self {
        Self::Network {
            message: message.into(),
            retryable: false,
        }
    }

    /// Create timeout error
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create compression error
    pub fn compression<S: Into<String>>(message: S) -> Self {
        Self::Compression {
            message: message.into(),
        }
    }

    /// Create not found error
    pub fn not_found<S: Into<String>>(message: S) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Create invalid state error
    pub fn invalid_state<S: Into<String>>(message: S) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }
}

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").expect("secret pattern is valid")
});

static SENSITIVE_PATH_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+")
        .expect("path pattern is valid")
});

const MAX_WIRE_MESSAGE_LEN: usize = 500;

/// Redact secrets and credential paths before a message leaves the process
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = SECRET_PATTERN.replace_all(message, "${1}=***").to_string();
    sanitized = SENSITIVE_PATH_PATTERN
        .replace_all(&sanitized, "/***REDACTED***/")
        .to_string();

    if sanitized.len() > MAX_WIRE_MESSAGE_LEN {
        let suffix = "...[truncated]";
        let mut cut = MAX_WIRE_MESSAGE_LEN - suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], suffix);
    }

    sanitized
}

/// Result type for mesh operations
pub type MeshResult<T> = Result<T, MeshError>;
