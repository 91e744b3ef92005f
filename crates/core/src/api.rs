//! ApiCaller trait: the seam for `api_call` steps.
//!
//! An `api_call` step names an operation (e.g. "crm.lookup") and hands it a
//! JSON input. Whatever sits behind the operation (an HTTP endpoint, a local
//! action, a test double) implements [`ApiCaller`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ToolError;

/// One external operation invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiRequest {
    /// Operation name as written in the workflow
    pub operation: String,

    /// Resolved step inputs
    pub input: serde_json::Value,
}

/// The operation's reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse {
    /// Reply body. Object bodies are used as the step's raw result directly.
    pub body: serde_json::Value,

    /// Wall-clock latency in milliseconds
    pub latency_ms: u64,
}

/// Invokes external operations on behalf of `api_call` steps.
#[async_trait]
pub trait ApiCaller: Send + Sync {
    /// Execute the operation. One attempt; the executor owns retries.
    async fn call(&self, request: ApiRequest) -> Result<ApiResponse, ToolError>;

    /// Whether the operation is known to this caller.
    fn supports(&self, operation: &str) -> bool;
}
