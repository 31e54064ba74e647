//! Importer configuration, shared by the daemon and the agent.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::TaskId;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/dist-git/importer.toml";

/// Errors loading or validating the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level `importer.toml`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImporterConfig {
    /// Frontend root, e.g. `https://copr.example.org`.
    pub frontend_base_url: String,
    /// Password for the frontend's backend endpoints.
    pub frontend_auth: String,

    /// Identifies this importer in logs and requests. Random when unset.
    #[serde(default)]
    pub importer_id: Option<String>,

    /// Poll interval while the pool has room.
    #[serde(default = "default_sleep_time_secs")]
    pub sleep_time_secs: u64,
    /// Re-check interval while the pool is full.
    #[serde(default = "default_pool_busy_sleep_time_ms")]
    pub pool_busy_sleep_time_ms: u64,
    /// Pool capacity.
    #[serde(default = "default_pool_workers")]
    pub pool_workers: usize,
    /// When false the pool holds a single worker.
    #[serde(default = "default_true")]
    pub multiple_workers: bool,
    /// Per-task timeout. `0` disables it, negative values expire immediately.
    #[serde(default = "default_import_timeout_secs")]
    pub import_timeout_secs: i64,
    /// How long a stopping daemon waits for running imports.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Bound on each frontend request.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Root for per-attempt scratch directories.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// One `<task_id>.log` per task, written by the agent process.
    #[serde(default = "default_per_task_log_dir")]
    pub per_task_log_dir: PathBuf,
    /// Agent executable. Defaults to `importer-agent` next to the daemon.
    #[serde(default)]
    pub agent_program: Option<PathBuf>,

    #[serde(default)]
    pub commands: CommandsConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
}

/// External command templates run by the agent.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandsConfig {
    /// Prints `NAME EPOCH VERSION RELEASE` of `{srpm}`.
    pub query: CommandTemplate,
    /// Prepares the dist-git repository. Best-effort.
    pub before_import: CommandTemplate,
    /// Imports `{srpm}` into `{repo}` on `{branch}`; prints the commit hash
    /// as its last line of output.
    pub git_import: CommandTemplate,
    /// Refreshes the cgit package list. Best-effort.
    pub after_import: CommandTemplate,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            query: CommandTemplate::from([
                "rpm",
                "-qp",
                "--qf",
                "%{NAME} %{EPOCH} %{VERSION} %{RELEASE}",
                "{srpm}",
            ]),
            before_import: CommandTemplate::from(["/usr/share/dist-git/git_package.sh", "{repo}"]),
            git_import: CommandTemplate::from([
                "/usr/share/dist-git/import_srpm.sh",
                "{repo}",
                "{branch}",
                "{srpm}",
            ]),
            after_import: CommandTemplate::from(["/usr/share/dist-git/mkcgitlist"]),
        }
    }
}

/// Programs used to turn SCM/PyPI/RubyGems sources into SRPMs.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub git: String,
    pub svn: String,
    pub tito: String,
    pub rpmbuild: String,
    pub pyp2rpm: String,
    pub gem2rpm: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            git: "git".into(),
            svn: "svn".into(),
            tito: "tito".into(),
            rpmbuild: "rpmbuild".into(),
            pyp2rpm: "pyp2rpm".into(),
            gem2rpm: "gem2rpm".into(),
        }
    }
}

/// Program + args with `{name}` placeholders.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandTemplate(pub Vec<String>);

impl<const N: usize> From<[&str; N]> for CommandTemplate {
    fn from(argv: [&str; N]) -> Self {
        Self(argv.iter().map(|s| s.to_string()).collect())
    }
}

impl CommandTemplate {
    /// True when no program is configured.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Substitutes `{key}` for each variable. Unknown placeholders are kept.
    pub fn render(&self, vars: &BTreeMap<&str, String>) -> Vec<String> {
        self.0
            .iter()
            .map(|arg| {
                vars.iter().fold(arg.clone(), |acc, (key, value)| {
                    acc.replace(&format!("{{{key}}}"), value)
                })
            })
            .collect()
    }
}

impl ImporterConfig {
    /// Reads and validates a TOML file.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg: ImporterConfig = toml::from_str(&s).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Rejects values the importer cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.frontend_base_url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::Invalid(format!(
                "frontend_base_url must be an http(s) URL, got {url:?}"
            )));
        }
        if self.pool_workers == 0 {
            return Err(ConfigError::Invalid("pool_workers must be at least 1".into()));
        }
        if self.commands.query.is_empty() || self.commands.git_import.is_empty() {
            return Err(ConfigError::Invalid(
                "commands.query and commands.git_import must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// Effective pool capacity.
    pub fn worker_capacity(&self) -> usize {
        if self.multiple_workers {
            self.pool_workers.max(1)
        } else {
            1
        }
    }

    pub fn sleep_time(&self) -> Duration {
        Duration::from_secs(self.sleep_time_secs)
    }

    pub fn pool_busy_sleep_time(&self) -> Duration {
        Duration::from_millis(self.pool_busy_sleep_time_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Log file the agent for `task_id` writes to.
    pub fn task_log_path(&self, task_id: TaskId) -> PathBuf {
        self.per_task_log_dir.join(format!("{task_id}.log"))
    }

    /// Marker the agent leaves once its report for `task_id` was delivered.
    pub fn task_reported_path(&self, task_id: TaskId) -> PathBuf {
        self.per_task_log_dir.join(format!("{task_id}.reported"))
    }
}

fn default_sleep_time_secs() -> u64 {
    10
}

fn default_pool_busy_sleep_time_ms() -> u64 {
    500
}

fn default_pool_workers() -> usize {
    10
}

fn default_true() -> bool {
    true
}

fn default_import_timeout_secs() -> i64 {
    3600
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("/var/lib/dist-git/importer")
}

fn default_per_task_log_dir() -> PathBuf {
    PathBuf::from("/var/log/dist-git/tasks")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_substitutes_known_placeholders_only() {
        let template = CommandTemplate::from(["rpm", "--qf", "%{NAME} {srpm}", "{srpm}"]);
        let vars = BTreeMap::from([("srpm", "/tmp/x.src.rpm".to_string())]);
        assert_eq!(
            template.render(&vars),
            vec!["rpm", "--qf", "%{NAME} /tmp/x.src.rpm", "/tmp/x.src.rpm"]
        );
    }

    #[test]
    fn single_worker_mode_caps_capacity() {
        let mut cfg: ImporterConfig = toml::from_str(
            r#"
            frontend_base_url = "http://front"
            frontend_auth = "secret"
            pool_workers = 4
            "#,
        )
        .unwrap();
        assert_eq!(cfg.worker_capacity(), 4);
        cfg.multiple_workers = false;
        assert_eq!(cfg.worker_capacity(), 1);
    }
}
