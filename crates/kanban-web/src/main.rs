use anyhow::{bail, Context};
use chrono::Utc;
use clap::Parser;
use kanban_agents::{default_adapter_for, AgentAdapter, CommandRunner};
use kanban_core::{load_app_config, AgentKind, AppConfig, Validate, ValidationLevel};
use kanban_store::SqliteStore;
use kanban_web::{run_web_server, WebState};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "config/kanband.toml";

#[derive(Debug, Clone, PartialEq, Eq, Parser)]
#[command(name = "kanband", about = "Runs coding agents for kanban cards and serves their events")]
struct Cli {
    /// Path to the daemon TOML config.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// Overrides `server.bind`.
    #[arg(long)]
    bind: Option<String>,
    /// Overrides `server.database_path`.
    #[arg(long)]
    db: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_app_config(&cli.config)
        .with_context(|| format!("failed to load config at {}", cli.config.display()))?;
    init_tracing(&config.logging.filter);
    let config = apply_overrides(config, &cli)?;
    check_config(&config)?;

    if let Some(parent) = config
        .server
        .database_path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let store = SqliteStore::open(&config.server.database_path).with_context(|| {
        format!(
            "failed to open database at {}",
            config.server.database_path.display()
        )
    })?;
    store.migrate().context("failed to migrate database")?;
    let interrupted = store.fail_interrupted_attempts(Utc::now())?;
    if interrupted > 0 {
        warn!(count = interrupted, "marked attempts from a previous run as failed");
    }

    let runner = CommandRunner::new(Duration::from_millis(config.runner.kill_grace_ms));
    let adapter: Arc<dyn AgentAdapter> = Arc::from(default_adapter_for(AgentKind::Codex, runner)?);
    let bind = config.server.bind.clone();
    let state = WebState::new(Arc::new(store), config, adapter);

    info!(bind = %bind, "starting kanband");
    run_web_server(&bind, state).await?;
    Ok(())
}

/// `RUST_LOG` wins over the configured filter.
fn init_tracing(filter: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn apply_overrides(mut config: AppConfig, cli: &Cli) -> anyhow::Result<AppConfig> {
    if let Some(bind) = &cli.bind {
        let trimmed = bind.trim();
        if trimmed.is_empty() {
            bail!("bind address must not be empty");
        }
        config.server.bind = trimmed.to_string();
    }
    if let Some(db) = &cli.db {
        config.server.database_path = db.clone();
    }
    Ok(config)
}

fn check_config(config: &AppConfig) -> anyhow::Result<()> {
    let issues = config.validate();
    for issue in issues
        .iter()
        .filter(|issue| issue.level == ValidationLevel::Warning)
    {
        warn!(code = %issue.code, "{}", issue.message);
    }
    let errors = issues
        .iter()
        .filter(|issue| issue.level == ValidationLevel::Error)
        .map(|issue| format!("{}: {}", issue.code, issue.message))
        .collect::<Vec<_>>();
    if !errors.is_empty() {
        bail!("config validation failed ({})", errors.join("; "));
    }
    Ok(())
}
