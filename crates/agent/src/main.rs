#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Per-task import agent. Spawned by `importer-daemon` once per admitted task;
//! imports the package, reports the outcome to the frontend and exits.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use importer_core::config::{ImporterConfig, DEFAULT_CONFIG_PATH};
use importer_core::frontend::FrontendClient;
use importer_core::model::ImportTask;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

mod error;
mod exec;
mod import;
mod source;
mod srpm;

use crate::import::Importer;

#[derive(Debug, Parser)]
#[command(name = "importer-agent", version, about = "Imports one task into dist-git")]
struct Cli {
    /// Path to importer.toml.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// The task, as serialized by the daemon.
    #[arg(long)]
    task_json: String,

    /// Identifier of the spawning daemon, sent with the report.
    #[arg(long)]
    importer_id: Option<String>,

    /// Log filter (env-filter syntax).
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
    let task: ImportTask = serde_json::from_str(&cli.task_json).context("decode --task-json")?;
    let importer_id = cli
        .importer_id
        .or_else(|| cfg.importer_id.clone())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let frontend = FrontendClient::from_config(&cfg, &importer_id).context("frontend client")?;
    let importer = Importer::new(frontend, &cfg).context("download client")?;

    let task_id = task.task_id;
    let report = importer.run(task).await;
    info!(task_id, error = ?report.error(), "agent done");
    Ok(())
}
