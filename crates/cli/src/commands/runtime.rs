//! Shared wiring: config loading, input parsing, and the collaborator set
//! every command runs against.

use agentpilot_audit::{AuditLogger, TracingSink};
use agentpilot_config::EngineConfig;
use agentpilot_core::memory::MemoryStore;
use agentpilot_core::persistence::ExecutionStore;
use agentpilot_memory::{InMemoryExecutionStore, InMemoryMemoryStore, NoopExecutionStore, SqliteStore};
use agentpilot_providers::{ApiRegistry, build_from_config};
use agentpilot_telemetry::{ModelPricing, PricingTable, TelemetryEngine};
use agentpilot_workflow::Collaborators;
use anyhow::{Context, bail};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

pub fn config_path(explicit: Option<&Path>) -> PathBuf {
    explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(|| EngineConfig::config_dir().join("config.toml"))
}

/// Load (and validate) configuration with env overrides applied.
pub fn load_config(explicit: Option<&Path>) -> anyhow::Result<EngineConfig> {
    let path = config_path(explicit);
    EngineConfig::load_with_env(&path).with_context(|| format!("failed to load config from {}", path.display()))
}

/// Parse `--input`: inline JSON, `@file`, or an empty object when absent.
pub fn parse_input(raw: Option<&str>) -> anyhow::Result<Value> {
    let Some(raw) = raw else {
        return Ok(Value::Object(Default::default()));
    };
    let text = match raw.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path).with_context(|| format!("failed to read input file {path}"))?,
        None => raw.to_string(),
    };
    serde_json::from_str(&text).context("input is not valid JSON")
}

pub struct Stores {
    pub memory: Arc<dyn MemoryStore>,
    pub executions: Arc<dyn ExecutionStore>,
}

/// Open the configured memory/persistence backend.
pub async fn open_stores(config: &EngineConfig) -> anyhow::Result<Stores> {
    match config.memory.backend.as_str() {
        "sqlite" => {
            let path = config.memory.resolved_path();
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            let store = Arc::new(
                SqliteStore::open(&path.to_string_lossy())
                    .await
                    .with_context(|| format!("failed to open {}", path.display()))?,
            );
            info!(path = %path.display(), "sqlite store opened");
            Ok(Stores {
                memory: store.clone(),
                executions: store,
            })
        }
        "in_memory" => Ok(Stores {
            memory: Arc::new(InMemoryMemoryStore::new()),
            executions: Arc::new(InMemoryExecutionStore::new()),
        }),
        "none" => Ok(Stores {
            memory: Arc::new(InMemoryMemoryStore::new()),
            executions: Arc::new(NoopExecutionStore),
        }),
        other => bail!("unknown memory backend '{other}' (expected sqlite, in_memory or none)"),
    }
}

pub fn pricing_table(config: &EngineConfig) -> PricingTable {
    let table = PricingTable::with_defaults();
    for (model, price) in &config.pricing {
        table.set(model.clone(), ModelPricing::new(price.input_per_m, price.output_per_m));
    }
    table
}

/// The full collaborator set for running workflows.
pub async fn collaborators(config: &EngineConfig) -> anyhow::Result<Collaborators> {
    let stores = open_stores(config).await?;
    let provider = Arc::new(build_from_config(config));
    let api = Arc::new(ApiRegistry::from_config(&config.api));

    Ok(Collaborators::new(provider, api, stores.memory, stores.executions)
        .with_telemetry(Arc::new(TelemetryEngine::with_pricing(pricing_table(config))))
        .with_audit(Arc::new(AuditLogger::with_sinks(vec![Box::new(TracingSink)]))))
}
