#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! dist-git importer daemon: polls the frontend for import tasks and runs each
//! one in its own `importer-agent` process.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use importer_core::config::{ImporterConfig, DEFAULT_CONFIG_PATH};
use importer_core::filters::Filters;
use importer_core::frontend::FrontendClient;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

mod dispatcher;
mod launcher;
mod pool;
mod worker;

use crate::dispatcher::{DispatchSettings, Dispatcher};
use crate::launcher::AgentLauncher;

#[derive(Debug, Parser)]
#[command(name = "importer-daemon", version, about = "dist-git importer daemon")]
struct Cli {
    /// Path to importer.toml.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log filter (env-filter syntax). Passed on to the agents.
    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    fmt()
        .with_target(false)
        .with_env_filter(EnvFilter::new(&cli.log))
        .init();

    let cfg = ImporterConfig::load_from(&cli.config)
        .with_context(|| format!("load config {}", cli.config.display()))?;
    let importer_id = cfg
        .importer_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    tokio::fs::create_dir_all(&cfg.per_task_log_dir)
        .await
        .with_context(|| format!("create {}", cfg.per_task_log_dir.display()))?;
    tokio::fs::create_dir_all(&cfg.work_dir)
        .await
        .with_context(|| format!("create {}", cfg.work_dir.display()))?;

    let frontend = FrontendClient::from_config(&cfg, &importer_id).context("frontend client")?;
    let launcher = AgentLauncher::from_config(&cfg, &cli.config, &cli.log, &importer_id)?;

    info!(
        importer_id = %importer_id,
        frontend = %cfg.frontend_base_url,
        agent = %launcher.program().display(),
        "importer starting"
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = stop_tx.send(true);
    });

    let mut dispatcher = Dispatcher::new(
        frontend,
        launcher,
        Filters::importer_defaults(),
        DispatchSettings::from_config(&cfg),
        stop_rx,
    );
    dispatcher.run().await;
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM");
                let _ = signal::ctrl_c().await;
                info!("shutdown requested");
                return;
            }
        };
        tokio::select! {
            _ = signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    let _ = signal::ctrl_c().await;
    info!("shutdown requested");
}
