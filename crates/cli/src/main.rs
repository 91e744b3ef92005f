//! AgentPilot CLI: the main entry point.
//!
//! Commands:
//! - `run`       Execute a workflow once
//! - `validate`  Parse and validate a workflow definition
//! - `analyze`   Complexity breakdown and tier per step, no model calls
//! - `memory`    Inspect or sweep learned memory
//! - `config`    Show or initialise configuration
//! - `daemon`    Run configured schedules until Ctrl-C

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(
    name = "agentpilot",
    about = "AgentPilot: cost-aware model routing for agent workflows",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ~/.agentpilot/config.toml)
    #[arg(short, long, global = true, env = "AGENTPILOT_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow
    Run {
        /// Workflow definition (.json or .toml)
        workflow: PathBuf,

        /// Invocation input: inline JSON or @path/to/input.json
        #[arg(short, long)]
        input: Option<String>,

        /// Override the workflow's agent intelligence score (0-10)
        #[arg(long)]
        agent_score: Option<f64>,
    },

    /// Validate a workflow definition
    Validate {
        workflow: PathBuf,
    },

    /// Show the complexity analysis and routing tier of every step
    Analyze {
        workflow: PathBuf,

        /// Invocation input used to resolve `input.*` references
        #[arg(short, long)]
        input: Option<String>,
    },

    /// Learned memory
    Memory {
        #[command(subcommand)]
        action: MemoryAction,
    },

    /// Configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Run configured schedules until interrupted
    Daemon,
}

#[derive(Subcommand)]
enum MemoryAction {
    /// Top entries of an agent's memory by importance
    List {
        /// Agent id
        #[arg(short, long)]
        scope: String,

        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },

    /// Remove stale low-importance entries
    Sweep,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration (secrets redacted)
    Show,

    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    if cli.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).with_target(false).init();
    }

    let config = cli.config.as_deref();
    match cli.command {
        Commands::Run {
            workflow,
            input,
            agent_score,
        } => commands::run::run(config, &workflow, input.as_deref(), agent_score).await?,
        Commands::Validate { workflow } => commands::validate::run(&workflow)?,
        Commands::Analyze { workflow, input } => commands::analyze::run(config, &workflow, input.as_deref())?,
        Commands::Memory { action } => match action {
            MemoryAction::List { scope, limit } => commands::memory::list(config, &scope, limit).await?,
            MemoryAction::Sweep => commands::memory::sweep(config).await?,
        },
        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_cmd::show(config)?,
            ConfigAction::Init { force } => commands::config_cmd::init(config, force)?,
        },
        Commands::Daemon => commands::daemon::run(config).await?,
    }

    Ok(())
}
