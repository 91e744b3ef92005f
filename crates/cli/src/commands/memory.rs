//! `agentpilot memory`: inspect and maintain learned memory.

use agentpilot_core::memory::MemoryQuery;
use agentpilot_routing::LearningEngine;
use std::path::Path;

use super::runtime;

pub async fn list(config_path: Option<&Path>, scope: &str, limit: usize) -> anyhow::Result<()> {
    let config = runtime::load_config(config_path)?;
    let stores = runtime::open_stores(&config).await?;

    let entries = stores.memory.list_top(&MemoryQuery::scope(scope).limit(limit)).await?;
    println!("🧠 Memory for '{scope}' ({} backend)", stores.memory.name());
    println!();
    if entries.is_empty() {
        println!("   No entries.");
        return Ok(());
    }
    for entry in &entries {
        println!(
            "   [{:>4.1}] {:<18} {:<24} updated {}",
            entry.importance,
            entry.key.memory_type,
            entry.key.key,
            entry.updated_at.format("%Y-%m-%d %H:%M")
        );
        println!("          {}", entry.value);
    }
    Ok(())
}

pub async fn sweep(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = runtime::load_config(config_path)?;
    let stores = runtime::open_stores(&config).await?;
    let learning = LearningEngine::new(config.learning.clone(), stores.memory.clone());

    let policy = learning.sweep_policy();
    let before = stores.memory.count().await?;
    let removed = learning.sweep().await?;
    println!(
        "🧹 Swept {removed} of {before} entries (importance < {}, idle > {} days)",
        policy.min_importance, policy.max_idle_days
    );
    Ok(())
}
