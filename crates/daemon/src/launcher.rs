//! Turns an admitted task into the agent process that imports it.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use importer_core::config::ImporterConfig;
use importer_core::model::ImportTask;

use crate::worker::WorkUnit;

const AGENT_BIN: &str = "importer-agent";

/// Builds the work unit for a task.
pub trait Launcher {
    fn work_unit(&self, task: &ImportTask) -> Result<WorkUnit>;
}

/// Runs `importer-agent --task-json ...` with the task's log as output.
#[derive(Debug, Clone)]
pub struct AgentLauncher {
    program: PathBuf,
    config_path: PathBuf,
    log_filter: String,
    importer_id: String,
    cfg: ImporterConfig,
}

impl AgentLauncher {
    pub fn from_config(
        cfg: &ImporterConfig,
        config_path: &Path,
        log_filter: &str,
        importer_id: &str,
    ) -> Result<Self> {
        let program = match &cfg.agent_program {
            Some(p) => p.clone(),
            None => std::env::current_exe()
                .context("locate daemon executable")?
                .with_file_name(AGENT_BIN),
        };
        Ok(Self {
            program,
            config_path: config_path.to_path_buf(),
            log_filter: log_filter.to_string(),
            importer_id: importer_id.to_string(),
            cfg: cfg.clone(),
        })
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl Launcher for AgentLauncher {
    fn work_unit(&self, task: &ImportTask) -> Result<WorkUnit> {
        let task_json = serde_json::to_string(task).context("encode task")?;
        let args = vec![
            "--config".to_string(),
            self.config_path.display().to_string(),
            "--log".to_string(),
            self.log_filter.clone(),
            "--importer-id".to_string(),
            self.importer_id.clone(),
            "--task-json".to_string(),
            task_json,
        ];
        Ok(WorkUnit::new(&self.program, args)
            .with_log(self.cfg.task_log_path(task.task_id))
            .with_reported_marker(self.cfg.task_reported_path(task.task_id)))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use importer_core::model::{SourceKind, TaskDescriptor};

    use super::*;

    fn config(agent: Option<&str>) -> ImporterConfig {
        let mut text = String::from(
            "frontend_base_url = \"http://front\"\nfrontend_auth = \"pw\"\nper_task_log_dir = \"/tmp/tasks\"\n",
        );
        if let Some(agent) = agent {
            text.push_str(&format!("agent_program = \"{agent}\"\n"));
        }
        toml::from_str(&text).unwrap()
    }

    fn task() -> ImportTask {
        let desc = TaskDescriptor {
            task_id: 42,
            user: "u".into(),
            project: "p".into(),
            branch: "master".into(),
            source_type: SourceKind::Rubygems.tag(),
            source_json: r#"{"gem_name": "rake"}"#.into(),
            extra: BTreeMap::new(),
        };
        ImportTask::from_descriptor(&desc, "http://front").unwrap()
    }

    #[test]
    fn work_unit_carries_task_and_log() {
        let cfg = config(Some("/usr/libexec/importer-agent"));
        let launcher =
            AgentLauncher::from_config(&cfg, Path::new("/etc/importer.toml"), "debug", "imp-1")
                .unwrap();
        let unit = launcher.work_unit(&task()).unwrap();

        assert_eq!(unit.program, PathBuf::from("/usr/libexec/importer-agent"));
        assert_eq!(&unit.args[..4], ["--config", "/etc/importer.toml", "--log", "debug"]);
        assert_eq!(&unit.args[4..6], ["--importer-id", "imp-1"]);
        assert_eq!(unit.args[6], "--task-json");
        let back: ImportTask = serde_json::from_str(&unit.args[7]).unwrap();
        assert_eq!(back, task());
        assert_eq!(unit.log_path, Some(PathBuf::from("/tmp/tasks/42.log")));
        assert_eq!(
            unit.reported_marker,
            Some(PathBuf::from("/tmp/tasks/42.reported"))
        );
    }

    #[test]
    fn default_agent_sits_next_to_the_daemon() {
        let launcher =
            AgentLauncher::from_config(&config(None), Path::new("/etc/importer.toml"), "info", "x")
                .unwrap();
        assert_eq!(launcher.program().file_name().unwrap(), AGENT_BIN);
    }
}
