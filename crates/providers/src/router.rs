//! Provider router: selects the backend for a model id.
//!
//! Model ids from the tier mapping are either bare (`gpt-4o-mini`, sent to the
//! default provider) or qualified with a registered provider name
//! (`ollama:llama3.1`, sent to that provider with the qualifier stripped).
//! The router is itself a [`Provider`], so the executor never sees it.

use agentpilot_config::EngineConfig;
use agentpilot_core::error::ProviderError;
use agentpilot_core::provider::{Provider, ProviderRequest, ProviderResponse};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::openai_compat::OpenAiCompatProvider;

/// Routes model invocations to the correct provider.
pub struct ProviderRouter {
    providers: HashMap<String, Arc<dyn Provider>>,
    default_provider: String,
}

impl ProviderRouter {
    /// Create a new router with a default provider.
    pub fn new(default_provider: impl Into<String>) -> Self {
        Self {
            providers: HashMap::new(),
            default_provider: default_provider.into(),
        }
    }

    /// Register a provider.
    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn Provider>) {
        self.providers.insert(name.into(), provider);
    }

    /// Get the default provider.
    pub fn default_provider(&self) -> Option<Arc<dyn Provider>> {
        self.providers.get(&self.default_provider).cloned()
    }

    /// Get a specific provider by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    /// Resolve a model id to `(provider, model id to send)`.
    pub fn resolve(&self, model: &str) -> Option<(Arc<dyn Provider>, String)> {
        if let Some((prefix, rest)) = model.split_once(':')
            && let Some(provider) = self.get(prefix)
        {
            return Some((provider, rest.to_string()));
        }
        self.default_provider().map(|p| (p, model.to_string()))
    }

    /// List all registered provider names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

#[async_trait]
impl Provider for ProviderRouter {
    fn name(&self) -> &str {
        "router"
    }

    async fn invoke(&self, mut request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let (provider, model) = self
            .resolve(&request.model)
            .ok_or_else(|| ProviderError::NotConfigured(format!("no provider for model '{}'", request.model)))?;
        request.model = model;
        provider.invoke(request).await
    }

    async fn health_check(&self) -> Result<bool, ProviderError> {
        match self.default_provider() {
            Some(provider) => provider.health_check().await,
            None => Ok(false),
        }
    }
}

/// Build the provider router from configuration.
pub fn build_from_config(config: &EngineConfig) -> ProviderRouter {
    let settings = &config.provider;
    let mut router = ProviderRouter::new(&settings.name);

    let api_key = config.api_key.clone().unwrap_or_default();
    let base_url = if settings.base_url.is_empty() {
        default_base_url(&settings.name)
    } else {
        settings.base_url.clone()
    };

    router.register(
        settings.name.clone(),
        Arc::new(OpenAiCompatProvider::with_timeout(
            &settings.name,
            base_url,
            api_key,
            Duration::from_secs(settings.timeout_secs),
        )),
    );

    if settings.name != "ollama" {
        router.register("ollama", Arc::new(OpenAiCompatProvider::ollama(None)));
    }

    router
}

/// Get the default base URL for well-known providers.
fn default_base_url(provider_name: &str) -> String {
    match provider_name {
        "openrouter" => "https://openrouter.ai/api/v1".into(),
        "openai" => "https://api.openai.com/v1".into(),
        "ollama" => "http://localhost:11434/v1".into(),
        "groq" => "https://api.groq.com/openai/v1".into(),
        "together" => "https://api.together.xyz/v1".into(),
        "vllm" => "http://localhost:8000/v1".into(),
        _ => format!("https://{provider_name}.api.example.com/v1"),
    }
}
