//! API action registry: the callers behind `api_call` steps.
//!
//! Operations resolve in this order: configured HTTP endpoints
//! (`[api.endpoints.<operation>]`), then registered actions. The built-in
//! actions are `log`, `echo`, a simulated `email.send` and an `email.fetch`
//! that reads a configured (or sample) inbox.

use agentpilot_config::{ApiConfig, EndpointConfig, InboxMessage};
use agentpilot_core::api::{ApiCaller, ApiRequest, ApiResponse};
use agentpilot_core::error::ToolError;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Records its input in the log and returns it under `logged`.
pub struct LogAction;

#[async_trait]
impl ApiCaller for LogAction {
    async fn call(&self, request: ApiRequest) -> Result<ApiResponse, ToolError> {
        info!(operation = %request.operation, input = %request.input, "log action");
        Ok(ApiResponse {
            body: json!({ "logged": request.input }),
            latency_ms: 0,
        })
    }

    fn supports(&self, operation: &str) -> bool {
        operation == "log"
    }
}

/// Returns its input unchanged.
pub struct EchoAction;

#[async_trait]
impl ApiCaller for EchoAction {
    async fn call(&self, request: ApiRequest) -> Result<ApiResponse, ToolError> {
        Ok(ApiResponse {
            body: request.input,
            latency_ms: 0,
        })
    }

    fn supports(&self, operation: &str) -> bool {
        operation == "echo"
    }
}

/// Simulated mail delivery: acknowledges without sending anything.
pub struct EmailAction;

#[async_trait]
impl ApiCaller for EmailAction {
    async fn call(&self, request: ApiRequest) -> Result<ApiResponse, ToolError> {
        let to = request
            .input
            .get("to")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidArguments("email.send requires a 'to' address".into()))?;
        let subject = request.input.get("subject").and_then(Value::as_str).unwrap_or_default();
        let body_len = request.input.get("body").and_then(Value::as_str).map_or(0, str::len);

        Ok(ApiResponse {
            body: json!({ "sent": true, "to": to, "subject": subject, "body_len": body_len }),
            latency_ms: 0,
        })
    }

    fn supports(&self, operation: &str) -> bool {
        operation == "email.send"
    }
}

/// Reads a fixed inbox. Optional inputs: `subject_contains` (case-insensitive)
/// and `limit`.
pub struct EmailFetchAction {
    inbox: Vec<InboxMessage>,
}

impl EmailFetchAction {
    pub fn new(inbox: Vec<InboxMessage>) -> Self {
        Self { inbox }
    }

    /// Three messages, one of them an invoice.
    pub fn sample() -> Self {
        let message = |from: &str, subject: &str, body: &str| InboxMessage {
            from: from.into(),
            subject: subject.into(),
            body: body.into(),
        };
        Self::new(vec![
            message(
                "billing@northwind.test",
                "Invoice INV-2041 due 30 Nov",
                "Please find attached invoice INV-2041 for 1,250.00 EUR.",
            ),
            message("newsletter@vendor.test", "October product update", "What's new this month."),
            message("it@example.com", "Password expiry reminder", "Your password expires in 5 days."),
        ])
    }
}

#[async_trait]
impl ApiCaller for EmailFetchAction {
    async fn call(&self, request: ApiRequest) -> Result<ApiResponse, ToolError> {
        let needle = match request.input.get("subject_contains") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.to_lowercase()),
            Some(_) => {
                return Err(ToolError::InvalidArguments("email.fetch 'subject_contains' must be a string".into()));
            }
        };
        let limit = match request.input.get("limit") {
            None | Some(Value::Null) => usize::MAX,
            Some(v) => v
                .as_u64()
                .and_then(|n| usize::try_from(n).ok())
                .ok_or_else(|| ToolError::InvalidArguments("email.fetch 'limit' must be a non-negative integer".into()))?,
        };

        let messages: Vec<Value> = self
            .inbox
            .iter()
            .filter(|m| needle.as_ref().is_none_or(|n| m.subject.to_lowercase().contains(n.as_str())))
            .take(limit)
            .map(|m| json!({ "from": m.from, "subject": m.subject, "body": m.body }))
            .collect();
        debug!(matched = messages.len(), total = self.inbox.len(), "email.fetch");

        Ok(ApiResponse {
            body: json!({ "count": messages.len(), "total": self.inbox.len(), "messages": messages }),
            latency_ms: 0,
        })
    }

    fn supports(&self, operation: &str) -> bool {
        operation == "email.fetch"
    }
}

/// Calls one configured HTTP endpoint with the step input as JSON.
pub struct HttpApiCaller {
    operation: String,
    endpoint: EndpointConfig,
    client: reqwest::Client,
}

impl HttpApiCaller {
    pub fn new(operation: impl Into<String>, endpoint: EndpointConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(endpoint.timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            operation: operation.into(),
            endpoint,
            client,
        }
    }

    fn build_request(&self, input: &Value) -> Result<reqwest::RequestBuilder, ToolError> {
        let method = reqwest::Method::from_bytes(self.endpoint.method.to_uppercase().as_bytes())
            .map_err(|_| ToolError::InvalidArguments(format!("invalid HTTP method '{}'", self.endpoint.method)))?;

        let mut builder = if method == reqwest::Method::GET || method == reqwest::Method::DELETE {
            let query: Vec<(String, String)> = input
                .as_object()
                .map(|obj| {
                    obj.iter()
                        .map(|(k, v)| (k.clone(), v.as_str().map_or_else(|| v.to_string(), String::from)))
                        .collect()
                })
                .unwrap_or_default();
            self.client.request(method, &self.endpoint.url).query(&query)
        } else {
            self.client.request(method, &self.endpoint.url).json(input)
        };

        for (name, value) in &self.endpoint.headers {
            builder = builder.header(name, value);
        }
        Ok(builder)
    }
}

#[async_trait]
impl ApiCaller for HttpApiCaller {
    async fn call(&self, request: ApiRequest) -> Result<ApiResponse, ToolError> {
        let started = Instant::now();
        debug!(operation = %self.operation, url = %self.endpoint.url, "calling HTTP endpoint");

        let response = self.build_request(&request.input)?.send().await.map_err(|e| {
            if e.is_timeout() {
                ToolError::Timeout {
                    operation: self.operation.clone(),
                    timeout_secs: self.endpoint.timeout_secs,
                }
            } else {
                ToolError::ExecutionFailed {
                    operation: self.operation.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            return Err(ToolError::Status {
                operation: self.operation.clone(),
                status,
            });
        }

        let text = response.text().await.map_err(|e| ToolError::ExecutionFailed {
            operation: self.operation.clone(),
            reason: e.to_string(),
        })?;
        // Non-JSON bodies are kept as text
        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));

        Ok(ApiResponse {
            body,
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }

    fn supports(&self, operation: &str) -> bool {
        operation == self.operation
    }
}

/// Dispatches operations to registered callers.
pub struct ApiRegistry {
    endpoints: HashMap<String, Arc<dyn ApiCaller>>,
    actions: Vec<Arc<dyn ApiCaller>>,
}

impl ApiRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            endpoints: HashMap::new(),
            actions: Vec::new(),
        }
    }

    /// A registry with the built-in actions.
    pub fn with_builtins() -> Self {
        Self::with_inbox(EmailFetchAction::sample())
    }

    fn with_inbox(inbox: EmailFetchAction) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(LogAction));
        registry.register(Arc::new(EchoAction));
        registry.register(Arc::new(EmailAction));
        registry.register(Arc::new(inbox));
        registry
    }

    /// Built-ins plus one HTTP caller per configured endpoint. A configured
    /// inbox replaces the sample one behind `email.fetch`.
    pub fn from_config(config: &ApiConfig) -> Self {
        let mut registry = if config.inbox.is_empty() {
            Self::with_builtins()
        } else {
            Self::with_inbox(EmailFetchAction::new(config.inbox.clone()))
        };
        for (operation, endpoint) in &config.endpoints {
            registry.register_endpoint(operation.clone(), Arc::new(HttpApiCaller::new(operation, endpoint.clone())));
        }
        registry
    }

    /// Register an action matched through its `supports`.
    pub fn register(&mut self, action: Arc<dyn ApiCaller>) {
        self.actions.push(action);
    }

    /// Bind an operation name to a caller; takes precedence over actions.
    pub fn register_endpoint(&mut self, operation: impl Into<String>, caller: Arc<dyn ApiCaller>) {
        self.endpoints.insert(operation.into(), caller);
    }

    fn find(&self, operation: &str) -> Option<&Arc<dyn ApiCaller>> {
        self.endpoints
            .get(operation)
            .or_else(|| self.actions.iter().find(|a| a.supports(operation)))
    }

    /// Configured endpoint names, sorted.
    pub fn endpoint_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.endpoints.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for ApiRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[async_trait]
impl ApiCaller for ApiRegistry {
    async fn call(&self, request: ApiRequest) -> Result<ApiResponse, ToolError> {
        let caller = self
            .find(&request.operation)
            .ok_or_else(|| ToolError::NotFound(request.operation.clone()))?;
        caller.call(request).await
    }

    fn supports(&self, operation: &str) -> bool {
        self.find(operation).is_some()
    }
}
