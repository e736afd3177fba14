use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use gutpunch_core::config::GutPunchConfig;
use gutpunch_scheduler::{EngineSettings, Gateway, SchedulerEngine};
use serde::Serialize;
use tracing::info;

mod cli;
mod commands;
mod handlers;

use cli::{Cli, Commands, QueueCommands};
use commands::EnqueueArgs;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = cli
        .log_level
        .as_deref()
        .map(|level| format!("gutpunch={level},gutpunch_scheduler={level}"))
        .unwrap_or_else(|| "gutpunch=info,gutpunch_scheduler=info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    // load config: --config > GUTPUNCH_CONFIG env > ~/.gutpunch/gutpunch.toml
    let config_path = cli.config.clone().or_else(|| std::env::var("GUTPUNCH_CONFIG").ok());
    let config = GutPunchConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        GutPunchConfig::default()
    });

    let db_path = cli.db_path.clone().unwrap_or_else(|| config.database.path.clone());
    ensure_parent_dir(&db_path)?;
    info!(path = %db_path, "opening SQLite database");
    let gateway = Arc::new(Gateway::open(&db_path)?);

    let engine = Arc::new(SchedulerEngine::new(
        gateway,
        EngineSettings::from(&config.scheduler),
    ));
    handlers::register_builtin(&engine);

    match cli.command {
        Commands::Run => run(engine.clone()).await?,
        Commands::Tick => print_json(&engine.tick().await?)?,
        Commands::Enqueue {
            name,
            params,
            in_secs,
            at,
            queue,
            max_retries,
        } => {
            let job = commands::enqueue(
                &engine,
                EnqueueArgs {
                    name: &name,
                    params: params.as_deref(),
                    in_secs,
                    at: at.as_deref(),
                    queue: queue.as_deref(),
                    max_retries,
                },
            )?;
            print_json(&job)?;
        }
        Commands::Jobs { status, queue } => {
            print_json(&commands::list_jobs(&engine, status.as_deref(), queue.as_deref())?)?
        }
        Commands::Queues { command } => match command {
            QueueCommands::List => print_json(&commands::list_queues(&engine)?)?,
            QueueCommands::Create {
                name,
                priority,
                description,
            } => print_json(&commands::create_queue(
                &engine,
                &name,
                priority,
                description.as_deref(),
            )?)?,
            QueueCommands::Update {
                name,
                rename,
                priority,
                description,
            } => print_json(&commands::update_queue(
                &engine,
                &name,
                rename.as_deref(),
                priority,
                description.as_deref(),
            )?)?,
            QueueCommands::Delete { name } => {
                print_json(&commands::delete_queue(&engine, &name)?)?
            }
        },
        Commands::Drain { queue } => print_json(&engine.process_queue_jobs(&queue).await?)?,
        Commands::Stats => print_json(&commands::stats(&engine)?)?,
    }

    engine.gateway().close()?;
    Ok(())
}

/// Poll until Ctrl-C, then stop the timer and release storage in that order.
async fn run(engine: Arc<SchedulerEngine>) -> anyhow::Result<()> {
    info!(handlers = ?engine.registry().names(), "GutPunch scheduler running");
    let handle = engine.start();

    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received, shutting down");
    engine.shutdown(handle).await?;
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Ensure the parent directory for a file path exists.
fn ensure_parent_dir(path: &str) -> anyhow::Result<()> {
    match std::path::Path::new(path).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent)
            .with_context(|| format!("creating database directory {}", parent.display())),
        _ => Ok(()),
    }
}
