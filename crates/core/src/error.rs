//! Error types for the AgentPilot domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum; leaf errors that can be
//! caused by a flaky dependency expose `is_transient()` so the step
//! executor can decide whether a retry is worth the spend.

use thiserror::Error;

/// The top-level error type for AgentPilot operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- External API errors ---
    #[error("API call error: {0}")]
    Tool(#[from] ToolError),

    // --- Storage errors ---
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// Failures of the Model Invocation Port.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Malformed provider response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// Whether a retry could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Timeout(_) | Self::Network(_) => true,
            Self::ApiError { status_code, .. } => *status_code >= 500 || *status_code == 408,
            Self::InvalidResponse(_) => true,
            Self::AuthenticationFailed(_) | Self::ModelNotFound(_) | Self::NotConfigured(_) => false,
        }
    }
}

/// Failures of an external `api_call` operation.
#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Operation not registered: {0}")]
    NotFound(String),

    #[error("Operation failed: {operation}: {reason}")]
    ExecutionFailed { operation: String, reason: String },

    #[error("Operation returned status {status}: {operation}")]
    Status { operation: String, status: u16 },

    #[error("Operation timed out: {operation} after {timeout_secs}s")]
    Timeout { operation: String, timeout_secs: u64 },

    #[error("Invalid operation arguments: {0}")]
    InvalidArguments(String),
}

impl ToolError {
    /// Whether a retry could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ExecutionFailed { .. } | Self::Timeout { .. } => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429 || *status == 408,
            Self::NotFound(_) | Self::InvalidArguments(_) => false,
        }
    }
}

/// Failures of the memory store or the persistence collaborator.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Record already closed: {0}")]
    AlreadyClosed(String),
}
