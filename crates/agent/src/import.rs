//! The import procedure for a single task.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use importer_core::api::ImportReport;
use importer_core::config::{CommandTemplate, CommandsConfig, ImporterConfig, ToolsConfig};
use importer_core::frontend::{post_back_safe, Frontend};
use importer_core::model::{ImportTask, TaskId};
use importer_core::{new_ulid, now_ms};
use reqwest::Client;
use tracing::{info, warn};

use crate::error::ImportError;
use crate::exec;
use crate::source::Fetcher;
use crate::srpm;

/// Imports tasks into dist-git and reports the outcome to the frontend.
pub struct Importer<F> {
    frontend: F,
    http: Client,
    commands: CommandsConfig,
    tools: ToolsConfig,
    work_dir: PathBuf,
    cfg: ImporterConfig,
}

impl<F: Frontend> Importer<F> {
    pub fn new(frontend: F, cfg: &ImporterConfig) -> Result<Self, reqwest::Error> {
        let http = Client::builder()
            .connect_timeout(cfg.request_timeout())
            .build()?;
        Ok(Self {
            frontend,
            http,
            commands: cfg.commands.clone(),
            tools: cfg.tools.clone(),
            work_dir: cfg.work_dir.clone(),
            cfg: cfg.clone(),
        })
    }

    /// Imports `task` in a fresh work directory, reports the outcome and
    /// removes the directory. The report is returned as sent.
    ///
    /// A delivered report leaves the task's reported marker for the daemon.
    pub async fn run(&self, mut task: ImportTask) -> ImportReport {
        let started_ms = now_ms();
        let workdir = self
            .work_dir
            .join(format!("{}-{}", task.task_id, new_ulid()));
        self.do_import(&mut task, &workdir).await;

        let report = task.report();
        if post_back_safe(&self.frontend, &report).await {
            self.mark_reported(task.task_id).await;
        }

        if let Err(e) = tokio::fs::remove_dir_all(&workdir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(task_id = task.task_id, error = %e, workdir = %workdir.display(), "cannot remove work dir");
            }
        }
        info!(
            task_id = task.task_id,
            elapsed_ms = now_ms() - started_ms,
            "task complete"
        );
        report
    }

    async fn mark_reported(&self, task_id: TaskId) {
        let marker = self.cfg.task_reported_path(task_id);
        if let Some(parent) = marker.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        if let Err(e) = tokio::fs::write(&marker, b"").await {
            warn!(task_id, error = %e, marker = %marker.display(), "cannot leave reported marker");
        }
    }

    /// Runs the import steps, recording the result or the failure on `task`.
    pub async fn do_import(&self, task: &mut ImportTask, workdir: &Path) {
        info!(
            task_id = task.task_id,
            kind = %task.source_kind(),
            user = %task.user,
            project = %task.project,
            branch = %task.branch,
            "import starting"
        );
        match self.import(task, workdir).await {
            Ok(()) => info!(
                task_id = task.task_id,
                repo = %task.repo_name().unwrap_or_default(),
                git_hash = task.git_hash.as_deref().unwrap_or_default(),
                "import finished"
            ),
            Err(e) => {
                warn!(task_id = task.task_id, error = %e, "import failed");
                task.fail(e.code(), e.to_string());
            }
        }
    }

    async fn import(&self, task: &mut ImportTask, workdir: &Path) -> Result<(), ImportError> {
        let srpm = Fetcher::new(&self.http, &self.tools)
            .fetch(task, workdir)
            .await?;

        let (name, version) = srpm::query_name_evr(&self.commands.query, &srpm).await?;
        info!(task_id = task.task_id, package = %name, version = %version, "SRPM identified");
        task.package_name = Some(name);
        task.package_version = Some(version);

        let vars = placeholders(task, &srpm, workdir);
        self.hook("before_import", &self.commands.before_import, &vars, workdir)
            .await;
        let hash = self.git_import(&vars, workdir).await?;
        task.git_hash = Some(hash);
        self.hook("after_import", &self.commands.after_import, &vars, workdir)
            .await;
        Ok(())
    }

    /// Runs the import command; its last non-empty stdout line is the commit.
    async fn git_import(
        &self,
        vars: &BTreeMap<&str, String>,
        workdir: &Path,
    ) -> Result<String, ImportError> {
        let argv = self.commands.git_import.render(vars);
        let program = argv.first().map(String::as_str).unwrap_or_default();
        let out = exec::run(&argv, Some(workdir))
            .await
            .map_err(|e| ImportError::GitImport(format!("cannot run {program}: {e}")))?;
        if !out.success() {
            return Err(ImportError::GitImport(out.describe(program)));
        }
        out.stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .last()
            .map(str::to_string)
            .ok_or_else(|| ImportError::GitImport(format!("{program} printed no commit hash")))
    }

    /// Best-effort hook: failures are logged only.
    async fn hook(
        &self,
        name: &str,
        template: &CommandTemplate,
        vars: &BTreeMap<&str, String>,
        workdir: &Path,
    ) {
        if template.is_empty() {
            return;
        }
        let argv = template.render(vars);
        match exec::run(&argv, Some(workdir)).await {
            Ok(out) if out.success() => {}
            Ok(out) => {
                let program = argv.first().map(String::as_str).unwrap_or_default();
                warn!(hook = name, error = %out.describe(program), "hook failed")
            }
            Err(e) => warn!(hook = name, error = %e, "hook could not run"),
        }
    }
}

fn placeholders<'a>(task: &ImportTask, srpm: &Path, workdir: &Path) -> BTreeMap<&'a str, String> {
    BTreeMap::from([
        ("repo", task.repo_name().unwrap_or_default()),
        ("user", task.user.clone()),
        ("project", task.project.clone()),
        ("package", task.package_name.clone().unwrap_or_default()),
        ("branch", task.branch.clone()),
        ("srpm", srpm.display().to_string()),
        ("workdir", workdir.display().to_string()),
        ("output", workdir.join("output").display().to_string()),
        ("task_id", task.task_id.to_string()),
    ])
}
