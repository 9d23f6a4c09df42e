//! Error types for the FleetSim engine
//!
//! This module provides a comprehensive error hierarchy following Rust best practices:
//! - `thiserror` for ergonomic error definitions
//! - Domain-specific error variants for actionable error handling
//! - Proper error context and source chaining
//! - HTTP status code mapping for API responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::borrow::Cow;
use thiserror::Error;

/// Result type alias for FleetSim operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the FleetSim engine
#[derive(Debug, Error)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    #[error("Configuration error: {message}")]
    Config {
        message: Cow<'static, str>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Missing required environment variable: {var}")]
    MissingEnvVar { var: &'static str },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidConfig {
        key: &'static str,
        message: Cow<'static, str>,
    },

    // ========================================================================
    // Connector Errors
    // ========================================================================
    #[error("Connection failed: {message}")]
    ConnectionFailed {
        message: Cow<'static, str>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Send failed: {message}")]
    SendFailed {
        message: Cow<'static, str>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Circuit breaker is open")]
    CircuitOpen,

    // ========================================================================
    // Payload Generation Errors
    // ========================================================================
    #[error("Payload generation failed: {message}")]
    PayloadGeneration { message: Cow<'static, str> },

    // ========================================================================
    // Engine State Errors
    // ========================================================================
    #[error("Simulation already running for project {project_id}")]
    AlreadyRunning { project_id: String },

    #[error("No simulation running for project {project_id}")]
    NotRunning { project_id: String },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound {
        entity_type: &'static str,
        id: String,
    },

    // ========================================================================
    // Serialization Errors
    // ========================================================================
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // ========================================================================
    // Generic Errors
    // ========================================================================
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error")]
    Internal {
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    // ========================================================================
    // Constructors for common error patterns
    // ========================================================================

    /// Create a configuration error
    pub fn config(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create an invalid-configuration error for a known key
    pub fn invalid_config(key: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self::InvalidConfig {
            key,
            message: message.into(),
        }
    }

    /// Create a connection error
    pub fn connection(message: impl Into<Cow<'static, str>>) -> Self {
        Self::ConnectionFailed {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<Cow<'static, str>>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::ConnectionFailed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a send error
    pub fn send(message: impl Into<Cow<'static, str>>) -> Self {
        Self::SendFailed {
            message: message.into(),
            source: None,
        }
    }

    /// Create a send error with source
    pub fn send_with_source(
        message: impl Into<Cow<'static, str>>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::SendFailed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a payload generation error
    pub fn payload(message: impl Into<Cow<'static, str>>) -> Self {
        Self::PayloadGeneration {
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(entity_type: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type,
            id: id.into(),
        }
    }

    /// Create an internal error
    pub fn internal(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal {
            source: Some(Box::new(source)),
        }
    }

    // ========================================================================
    // Error Classification
    // ========================================================================

    /// Returns true if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionFailed { .. }
                | Error::SendFailed { .. }
                | Error::Timeout { .. }
                | Error::Io(_)
        )
    }

    /// Returns true if this error was caused by establishing a session
    /// (as opposed to delivering a payload over one)
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::ConnectionFailed { .. })
    }

    /// Get HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::InvalidConfig { .. }
            | Error::Config { .. }
            | Error::AlreadyRunning { .. }
            | Error::NotRunning { .. }
            | Error::PayloadGeneration { .. } => StatusCode::BAD_REQUEST,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Error::CircuitOpen | Error::ConnectionFailed { .. } | Error::SendFailed { .. } => {
                StatusCode::BAD_GATEWAY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get error code for API responses
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Config { .. } | Error::MissingEnvVar { .. } | Error::InvalidConfig { .. } => {
                "CONFIG_INVALID"
            }
            Error::ConnectionFailed { .. } => "CONNECTION_FAILED",
            Error::SendFailed { .. } => "SEND_FAILED",
            Error::CircuitOpen => "CIRCUIT_OPEN",
            Error::PayloadGeneration { .. } => "PAYLOAD_GENERATION_FAILED",
            Error::AlreadyRunning { .. } => "ALREADY_RUNNING",
            Error::NotRunning { .. } => "NOT_RUNNING",
            Error::NotFound { .. } => "NOT_FOUND",
            Error::Json(_) => "SERIALIZATION_ERROR",
            Error::Timeout { .. } => "TIMEOUT",
            Error::Io(_) => "IO_ERROR",
            Error::Internal { .. } | Error::Other(_) => "INTERNAL_ERROR",
        }
    }
}

// ============================================================================
// Error Response for API
// ============================================================================

/// API error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();
        let message = self.to_string();

        // Don't expose internal error details in production
        let safe_message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            "An internal error occurred".to_string()
        } else {
            message
        };

        let body = ErrorResponse {
            error: ErrorBody {
                code,
                message: safe_message,
                details: None,
            },
        };

        (status, Json(body)).into_response()
    }
}

// ============================================================================
// From implementations for external error types
// ============================================================================

impl From<rdkafka::error::KafkaError> for Error {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        Error::SendFailed {
            message: err.to_string().into(),
            source: Some(Box::new(err)),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_builder() {
            Error::ConnectionFailed {
                message: err.to_string().into(),
                source: Some(Box::new(err)),
            }
        } else if err.is_timeout() {
            Error::Timeout { timeout_ms: 0 }
        } else {
            Error::SendFailed {
                message: err.to_string().into(),
                source: Some(Box::new(err)),
            }
        }
    }
}

impl From<std::env::VarError> for Error {
    fn from(_err: std::env::VarError) -> Self {
        Error::Config {
            message: "Environment variable error".into(),
            source: None,
        }
    }
}
