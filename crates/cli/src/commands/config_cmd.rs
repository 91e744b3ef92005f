//! `agentpilot config`: configuration management commands.

use agentpilot_config::EngineConfig;
use anyhow::{Context, bail};
use std::path::Path;

use super::runtime;

pub fn show(config_path: Option<&Path>) -> anyhow::Result<()> {
    let mut config = runtime::load_config(config_path)?;
    if config.api_key.is_some() {
        config.api_key = Some("[REDACTED]".into());
    }
    println!("# {}", runtime::config_path(config_path).display());
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

pub fn init(config_path: Option<&Path>, force: bool) -> anyhow::Result<()> {
    let path = runtime::config_path(config_path);
    write_default(&path, force)?;
    println!("✅ Wrote default configuration to {}", path.display());
    Ok(())
}

fn write_default(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, EngineConfig::default_toml()).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_init() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agentpilot/config.toml");
        write_default(&path, false).unwrap();

        let loaded = EngineConfig::load_from(&path).unwrap();
        assert_eq!(loaded.guardrails.max_steps, EngineConfig::default().guardrails.max_steps);
    }

    #[test]
    fn init_refuses_to_clobber_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "# mine\n").unwrap();

        assert!(write_default(&path, false).is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "# mine\n");

        write_default(&path, true).unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains("[guardrails]"));
    }
}
