mod chat;
mod memory_cmds;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use persona_config::{AppConfig, ConfigHandle, TelemetryConfig};
use persona_runtime::SessionOrchestrator;

#[derive(Debug, Parser)]
#[command(
    name = "persona",
    version,
    about = "Persona conversations over a failover cascade of generation backends"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = "config/default.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Talk to a persona.  Without a message, reads turns from stdin.
    Chat {
        #[arg(long, default_value = "")]
        persona: String,
        #[arg(long, default_value = "cli")]
        client: String,
        message: Option<String>,
    },
    /// Print the comprehensive health report.
    Health {
        #[arg(long)]
        json: bool,
    },
    Memory {
        #[command(subcommand)]
        command: MemoryCommands,
    },
    /// Run one maintenance pass (decay, cleanup, integrity, dedup).
    Maintain,
    #[command(visible_alias = "config")]
    Configuration {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Debug, Subcommand)]
pub(crate) enum MemoryCommands {
    Stats,
    /// Archive low-importance working memory for a persona.
    Archive { persona: String },
    /// Scan persona documents for malformed and duplicate entries.
    Inspect,
    /// Merge duplicate canon and working entries for a persona.
    Dedup { persona: String },
    /// Promote a working memory entry into canon.
    Promote {
        persona: String,
        entry_id: String,
        #[arg(long, default_value = "general")]
        category: String,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigCommands {
    /// Load and validate the configuration, then print the effective values.
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    let _log_guard = init_tracing(&config.telemetry)?;

    if let Commands::Configuration { command: ConfigCommands::Check } = cli.command {
        print_config(&config)?;
        return Ok(());
    }

    let orchestrator = Arc::new(SessionOrchestrator::from_config(ConfigHandle::new(config))?);
    match cli.command {
        Commands::Chat {
            persona,
            client,
            message,
        } => match message {
            Some(message) => chat::run_single(&orchestrator, &persona, &client, &message).await?,
            None => chat::run_interactive(orchestrator.clone(), &cli.config, &persona, &client).await?,
        },
        Commands::Health { json } => {
            let report = orchestrator.health_report().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                memory_cmds::print_health(&report);
            }
        }
        Commands::Memory { command } => memory_cmds::run(&orchestrator, command).await?,
        Commands::Maintain => {
            let summary = orchestrator.run_maintenance_pass(chrono::Utc::now()).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Configuration { .. } => {}
    }

    orchestrator.drain_background().await;
    Ok(())
}

/// Stderr logging filtered by `RUST_LOG`, falling back to the configured
/// level.  A non-empty `log_dir` adds a daily rolling file.
fn init_tracing(telemetry: &TelemetryConfig) -> Result<Option<WorkerGuard>> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&telemetry.log_level)
            .with_context(|| format!("invalid telemetry.log_level '{}'", telemetry.log_level))?,
    };
    let stderr = tracing_subscriber::fmt::layer().with_writer(io::stderr);

    if telemetry.log_dir.trim().is_empty() {
        tracing_subscriber::registry().with(filter).with(stderr).init();
        return Ok(None);
    }

    let appender = tracing_appender::rolling::daily(&telemetry.log_dir, "persona.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
        .init();
    Ok(Some(guard))
}

fn print_config(config: &AppConfig) -> Result<()> {
    println!("configuration ok");
    println!("- default persona : {}", config.persona.default_persona);
    println!("- providers       : {}", config.cascade.providers.join(" -> "));
    println!("- data dir        : {}", config.memory.data_dir);
    println!();
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}
