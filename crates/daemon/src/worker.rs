//! One import task running in its own OS process.
//!
//! The agent may hang inside third-party tooling, so cancellation is never
//! cooperative: [`Worker::terminate`] sends SIGKILL to the agent's whole
//! process group, so the tools it spawned die with it.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use importer_core::model::TaskId;
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Worker lifecycle errors.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker {0} already started")]
    AlreadyStarted(TaskId),
    #[error("worker {0} was never started")]
    NotStarted(TaskId),
    #[error("worker {id}: cannot open log {}: {source}", .path.display())]
    Log {
        id: TaskId,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("worker {id}: failed to spawn {program}: {source}")]
    Spawn {
        id: TaskId,
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("worker {id}: kill failed: {source}")]
    Kill {
        id: TaskId,
        #[source]
        source: std::io::Error,
    },
}

/// How long a worker may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Never times out.
    Unbounded,
    /// Times out once this much time has passed since `start()`.
    After(Duration),
    /// Timed out from construction on, started or not.
    Expired,
}

impl Timeout {
    /// `0` disables the timeout; negative values are already expired.
    pub fn from_secs(secs: i64) -> Self {
        match secs {
            0 => Timeout::Unbounded,
            s if s < 0 => Timeout::Expired,
            s => Timeout::After(Duration::from_secs(s.unsigned_abs())),
        }
    }
}

/// Program the worker runs, plus where its output goes.
#[derive(Debug, Clone)]
pub struct WorkUnit {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// stdout and stderr are appended here; discarded when `None`.
    pub log_path: Option<PathBuf>,
    /// File the agent creates once its own report was delivered.
    pub reported_marker: Option<PathBuf>,
}

impl WorkUnit {
    pub fn new<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            log_path: None,
            reported_marker: None,
        }
    }

    pub fn with_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    pub fn with_reported_marker(mut self, path: impl Into<PathBuf>) -> Self {
        self.reported_marker = Some(path.into());
        self
    }
}

/// Isolated execution of one work unit.
#[derive(Debug)]
pub struct Worker {
    id: TaskId,
    unit: WorkUnit,
    timeout: Timeout,
    started_at: Option<Instant>,
    child: Option<Child>,
    exit: Option<ExitStatus>,
    killed: bool,
}

impl Worker {
    /// Unstarted worker for task `id`.
    pub fn new(id: TaskId, unit: WorkUnit, timeout: Timeout) -> Self {
        Self {
            id,
            unit,
            timeout,
            started_at: None,
            child: None,
            exit: None,
            killed: false,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    /// Exit status, once the process has been reaped.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit
    }

    /// Whether [`Worker::terminate`] has been issued.
    pub fn killed(&self) -> bool {
        self.killed
    }

    /// Whether the agent left its reported marker behind.
    pub fn reported(&self) -> bool {
        self.unit
            .reported_marker
            .as_deref()
            .is_some_and(|marker| marker.exists())
    }

    /// Removes the reported marker, if any.
    pub fn clear_reported(&self) {
        let Some(marker) = &self.unit.reported_marker else {
            return;
        };
        if let Err(e) = std::fs::remove_file(marker) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(task_id = self.id, error = %e, marker = %marker.display(), "cannot remove reported marker");
            }
        }
    }

    /// Spawns the process. The start instant is taken before spawning, and a
    /// worker can only be started once even if the spawn fails.
    pub fn start(&mut self) -> Result<(), WorkerError> {
        if self.started_at.is_some() {
            return Err(WorkerError::AlreadyStarted(self.id));
        }
        self.started_at = Some(Instant::now());
        self.clear_reported();

        let (stdout, stderr) = match &self.unit.log_path {
            Some(path) => {
                let log_err = |source| WorkerError::Log {
                    id: self.id,
                    path: path.clone(),
                    source,
                };
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(log_err)?;
                }
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(log_err)?;
                let dup = file.try_clone().map_err(log_err)?;
                (Stdio::from(file), Stdio::from(dup))
            }
            None => (Stdio::null(), Stdio::null()),
        };

        let mut cmd = Command::new(&self.unit.program);
        cmd.args(&self.unit.args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true);
        // Own process group: a terminal ^C reaches the daemon, not the agents.
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn().map_err(|source| WorkerError::Spawn {
            id: self.id,
            program: self.unit.program.display().to_string(),
            source,
        })?;
        debug!(task_id = self.id, pid = ?child.id(), "worker started");
        self.child = Some(child);
        Ok(())
    }

    /// True from `start()` until the process has exited and been reaped.
    pub fn is_alive(&mut self) -> bool {
        if self.exit.is_some() {
            return false;
        }
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                self.exit = Some(status);
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!(task_id = self.id, error = %e, "cannot poll worker process; treating as dead");
                false
            }
        }
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out_at(Instant::now())
    }

    /// Timeout check against an explicit probe instant.
    pub fn timed_out_at(&self, now: Instant) -> bool {
        match self.timeout {
            Timeout::Unbounded => false,
            Timeout::Expired => true,
            Timeout::After(limit) => self
                .started_at
                .is_some_and(|started| now.saturating_duration_since(started) > limit),
        }
    }

    /// Sends SIGKILL to the worker's process group without waiting for it to
    /// exit. Falls back to killing the agent alone if the group is gone.
    pub fn terminate(&mut self) -> Result<(), WorkerError> {
        let Some(child) = self.child.as_mut() else {
            return Err(WorkerError::NotStarted(self.id));
        };
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                Ok(()) => {
                    self.killed = true;
                    return Ok(());
                }
                Err(errno) => {
                    debug!(task_id = self.id, pid, error = %errno, "killpg failed; killing agent only")
                }
            }
        }
        child
            .start_kill()
            .map_err(|source| WorkerError::Kill {
                id: self.id,
                source,
            })?;
        self.killed = true;
        Ok(())
    }

    /// Waits for the process to exit. `None` if it was never started.
    pub async fn wait(&mut self) -> Option<ExitStatus> {
        if self.exit.is_none() {
            let child = self.child.as_mut()?;
            match child.wait().await {
                Ok(status) => self.exit = Some(status),
                Err(e) => warn!(task_id = self.id, error = %e, "wait on worker failed"),
            }
        }
        self.exit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sleeper(secs: u32) -> WorkUnit {
        WorkUnit::new("sleep", [secs.to_string()])
    }

    #[test]
    fn timeout_from_secs() {
        assert_eq!(Timeout::from_secs(0), Timeout::Unbounded);
        assert_eq!(Timeout::from_secs(-1), Timeout::Expired);
        assert_eq!(Timeout::from_secs(5), Timeout::After(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn timeout_boundary_is_exclusive() {
        let eps = Duration::from_millis(1);
        for secs in [1_i64, 5, 3600] {
            let mut w = Worker::new(1, WorkUnit::new("true", Vec::<String>::new()), Timeout::from_secs(secs));
            w.start().unwrap();
            let t0 = w.started_at().unwrap();
            let limit = Duration::from_secs(secs as u64);

            assert!(!w.timed_out_at(t0 + limit - eps));
            assert!(!w.timed_out_at(t0 + limit));
            assert!(w.timed_out_at(t0 + limit + eps));
            w.wait().await;
        }
    }

    #[test]
    fn negative_timeout_is_expired_before_start() {
        let w = Worker::new(1, sleeper(1000), Timeout::from_secs(-1));
        assert!(w.timed_out());
        assert!(w.started_at().is_none());
    }

    #[test]
    fn unstarted_worker_never_times_out() {
        let w = Worker::new(1, sleeper(1000), Timeout::from_secs(5));
        assert!(!w.timed_out_at(Instant::now() + Duration::from_secs(3600)));
    }

    #[tokio::test]
    async fn unbounded_worker_never_times_out() {
        let mut w = Worker::new(1, WorkUnit::new("true", Vec::<String>::new()), Timeout::Unbounded);
        w.start().unwrap();
        assert!(!w.timed_out_at(Instant::now() + Duration::from_secs(365 * 24 * 3600)));
        w.wait().await;
    }

    #[tokio::test]
    async fn starting_twice_is_an_error() {
        let mut w = Worker::new(9, WorkUnit::new("true", Vec::<String>::new()), Timeout::Unbounded);
        w.start().unwrap();
        assert!(matches!(w.start(), Err(WorkerError::AlreadyStarted(9))));
        w.wait().await;
    }

    #[tokio::test]
    async fn terminate_kills_a_hung_process() {
        let mut w = Worker::new(1, sleeper(1000), Timeout::Unbounded);
        assert!(!w.is_alive());
        assert!(matches!(w.terminate(), Err(WorkerError::NotStarted(1))));

        w.start().unwrap();
        assert!(w.is_alive());

        w.terminate().unwrap();
        assert!(w.killed());
        let status = w.wait().await.unwrap();
        assert!(!status.success());
        assert!(!w.is_alive());
    }

    /// Gone, or a zombie waiting for its new parent to reap it.
    #[cfg(target_os = "linux")]
    fn process_gone(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Err(_) => true,
            Ok(stat) => stat
                .rsplit_once(')')
                .and_then(|(_, rest)| rest.trim_start().chars().next())
                .is_some_and(|state| state == 'Z' || state == 'X'),
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn terminate_kills_the_tools_the_agent_spawned() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("tool.pid");
        let script = format!("sleep 1000 & echo $! > {}; wait", pid_file.display());
        let mut w = Worker::new(2, WorkUnit::new("sh", ["-c", script.as_str()]), Timeout::Unbounded);
        w.start().unwrap();

        let mut tool_pid = None;
        for _ in 0..100 {
            tool_pid = std::fs::read_to_string(&pid_file)
                .ok()
                .and_then(|text| text.trim().parse::<u32>().ok());
            if tool_pid.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let tool_pid = tool_pid.expect("agent never started its tool");
        assert!(!process_gone(tool_pid));

        w.terminate().unwrap();
        w.wait().await;

        let mut gone = false;
        for _ in 0..100 {
            if process_gone(tool_pid) {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(gone, "tool {tool_pid} outlived its agent");
    }

    #[tokio::test]
    async fn reported_marker_is_seen_and_stale_ones_are_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("6.reported");
        std::fs::write(&marker, b"").unwrap();

        let script = format!("touch {}", marker.display());
        let unit = WorkUnit::new("sh", ["-c", script.as_str()]).with_reported_marker(&marker);
        let mut w = Worker::new(6, unit, Timeout::Unbounded);
        assert!(w.reported());

        w.start().unwrap();
        w.wait().await;
        assert!(w.reported());

        w.clear_reported();
        assert!(!w.reported());
        assert!(!Worker::new(7, sleeper(1), Timeout::Unbounded).reported());
    }

    #[tokio::test]
    async fn spawn_failure_leaves_worker_dead() {
        let mut w = Worker::new(
            3,
            WorkUnit::new("/nonexistent/importer-agent", Vec::<String>::new()),
            Timeout::Unbounded,
        );
        assert!(matches!(w.start(), Err(WorkerError::Spawn { id: 3, .. })));
        assert!(!w.is_alive());
        assert!(matches!(w.start(), Err(WorkerError::AlreadyStarted(3))));
    }

    #[tokio::test]
    async fn output_goes_to_the_task_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("tasks").join("5.log");
        let unit = WorkUnit::new("sh", ["-c", "echo out; echo err >&2"]).with_log(&log);

        let mut w = Worker::new(5, unit, Timeout::Unbounded);
        w.start().unwrap();
        assert!(w.wait().await.unwrap().success());

        let text = std::fs::read_to_string(&log).unwrap();
        assert!(text.contains("out"));
        assert!(text.contains("err"));
    }
}
