// Error taxonomy for the API client core.
//
// Every failure surfaced to callers is an `ApiError`; `kind()` tells callers which
// branch of the taxonomy they are on without matching on the full variant set.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Authentication,
    ResourceNotFound,
    Validation,
    RateLimited,
    Timeout,
    Api,
    CircuitOpen,
    Data,
    Configuration,
    Unexpected,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Authentication => "authentication",
            ErrorKind::ResourceNotFound => "resource_not_found",
            ErrorKind::Validation => "validation",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Api => "api",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Data => "data",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Unexpected => "unexpected",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// Diagnostics attached to errors raised from an HTTP exchange.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorContext {
    pub status_code: Option<u16>,
    pub url: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub scope_id: String,
    pub response_data: Option<Value>,
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Authentication failed: {message}")]
    Authentication {
        message: String,
        context: Box<ErrorContext>,
    },

    #[error("Resource not found: {message}")]
    ResourceNotFound {
        message: String,
        context: Box<ErrorContext>,
    },

    #[error("Validation error: {message}")]
    Validation {
        message: String,
        context: Box<ErrorContext>,
    },

    #[error("Rate limit exceeded: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<u64>,
        context: Box<ErrorContext>,
    },

    #[error("Request timeout: {message}")]
    Timeout {
        message: String,
        context: Box<ErrorContext>,
    },

    #[error("API error: {message}")]
    Api {
        message: String,
        status_code: Option<u16>,
        context: Box<ErrorContext>,
    },

    #[error("Circuit breaker open for {service}")]
    CircuitOpen {
        service: String,
        retry_after_ms: Option<u64>,
    },

    #[error("Data error: {0}")]
    Data(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unexpected error: {0}")]
    Unexpected(String),

    #[error("Request failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        retry_count: u32,
        #[source]
        source: Box<ApiError>,
    },
}

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Authentication { .. } => ErrorKind::Authentication,
            ApiError::ResourceNotFound { .. } => ErrorKind::ResourceNotFound,
            ApiError::Validation { .. } => ErrorKind::Validation,
            ApiError::RateLimited { .. } => ErrorKind::RateLimited,
            ApiError::Timeout { .. } => ErrorKind::Timeout,
            ApiError::Api { .. } => ErrorKind::Api,
            ApiError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            ApiError::Data(_) => ErrorKind::Data,
            ApiError::Configuration(_) => ErrorKind::Configuration,
            ApiError::Unexpected(_) => ErrorKind::Unexpected,
            ApiError::RetriesExhausted { source, .. } => source.kind(),
        }
    }

    /// Human readable message without the kind prefix used by `Display`.
    pub fn message(&self) -> String {
        match self {
            ApiError::Authentication { message, .. }
            | ApiError::ResourceNotFound { message, .. }
            | ApiError::Validation { message, .. }
            | ApiError::RateLimited { message, .. }
            | ApiError::Timeout { message, .. }
            | ApiError::Api { message, .. } => message.clone(),
            ApiError::CircuitOpen { service, .. } => format!("circuit open for {service}"),
            ApiError::Data(message)
            | ApiError::Configuration(message)
            | ApiError::Unexpected(message) => message.clone(),
            ApiError::RetriesExhausted { source, .. } => source.message(),
        }
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            ApiError::Authentication { context, .. }
            | ApiError::ResourceNotFound { context, .. }
            | ApiError::Validation { context, .. }
            | ApiError::RateLimited { context, .. }
            | ApiError::Timeout { context, .. }
            | ApiError::Api { context, .. } => Some(context),
            ApiError::RetriesExhausted { source, .. } => source.context(),
            _ => None,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            ApiError::Api { status_code, .. } => *status_code,
            ApiError::RetriesExhausted { source, .. } => source.status_code(),
            other => other.context().and_then(|c| c.status_code),
        }
    }

    pub fn retry_after(&self) -> Option<u64> {
        match self {
            ApiError::RateLimited { retry_after, .. } => *retry_after,
            ApiError::RetriesExhausted { source, .. } => source.retry_after(),
            _ => None,
        }
    }

    // Number of retries performed before the error surfaced.
    pub fn retry_count(&self) -> u32 {
        match self {
            ApiError::RetriesExhausted { retry_count, .. } => *retry_count,
            _ => 0,
        }
    }

    /// Whether the pipeline spends its retry budget on this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Authentication | ErrorKind::Timeout | ErrorKind::Api | ErrorKind::Unexpected
        )
    }
}

// Errors produced by the transport seam, before HTTP status classification.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("{0}")]
    Other(String),
}
