//! Poll, admit, spawn, supervise.

use std::time::Duration;

use importer_core::api::{ErrorCode, ImportReport};
use importer_core::config::ImporterConfig;
use importer_core::filters::Filters;
use importer_core::frontend::{post_back_safe, Frontend};
use importer_core::model::{ImportTask, TaskDescriptor, TaskId};
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::launcher::Launcher;
use crate::pool::Pool;
use crate::worker::{Timeout, Worker};

/// Where the dispatcher is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Idle,
    Polling,
    Dispatching,
    Sleeping,
    Stopped,
}

/// Timing and capacity knobs of the loop.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub frontend_base_url: String,
    pub sleep_time: Duration,
    pub pool_busy_sleep_time: Duration,
    pub task_timeout: Timeout,
    pub capacity: usize,
    pub shutdown_grace: Duration,
}

impl DispatchSettings {
    pub fn from_config(cfg: &ImporterConfig) -> Self {
        Self {
            frontend_base_url: cfg.frontend_base_url.clone(),
            sleep_time: cfg.sleep_time(),
            pool_busy_sleep_time: cfg.pool_busy_sleep_time(),
            task_timeout: Timeout::from_secs(cfg.import_timeout_secs),
            capacity: cfg.worker_capacity(),
            shutdown_grace: cfg.shutdown_grace(),
        }
    }
}

/// Owns the pool and drives it from the frontend's backlog.
///
/// Everything runs on the caller's task; the only concurrency is the worker
/// processes themselves.
pub struct Dispatcher<F, L> {
    frontend: F,
    launcher: L,
    filters: Filters<TaskDescriptor>,
    pool: Pool<Worker>,
    settings: DispatchSettings,
    state: DispatchState,
    stop: watch::Receiver<bool>,
}

impl<F: Frontend, L: Launcher> Dispatcher<F, L> {
    pub fn new(
        frontend: F,
        launcher: L,
        filters: Filters<TaskDescriptor>,
        settings: DispatchSettings,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            frontend,
            launcher,
            filters,
            pool: Pool::new(settings.capacity),
            settings,
            state: DispatchState::Idle,
            stop,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> DispatchState {
        self.state
    }

    #[cfg(test)]
    pub fn pool(&self) -> &Pool<Worker> {
        &self.pool
    }

    #[cfg(test)]
    pub fn pool_mut(&mut self) -> &mut Pool<Worker> {
        &mut self.pool
    }

    #[cfg(test)]
    pub fn frontend(&self) -> &F {
        &self.frontend
    }

    /// Set once the stop flag is raised or its sender is gone.
    fn is_stopping(&self) -> bool {
        *self.stop.borrow() || self.stop.has_changed().is_err()
    }

    /// Runs cycles until stopped, then drains the pool.
    pub async fn run(&mut self) {
        info!(
            capacity = self.pool.capacity(),
            timeout = ?self.settings.task_timeout,
            "dispatcher starting"
        );
        while !self.is_stopping() {
            let pause = self.cycle().await;
            self.state = DispatchState::Sleeping;
            tokio::select! {
                biased;
                _ = self.stop.wait_for(|stop| *stop) => {}
                _ = sleep(pause) => {}
            }
        }
        info!(running = self.pool.len(), state = ?self.state, "dispatcher stopping");
        self.drain().await;
        self.state = DispatchState::Stopped;
        info!("dispatcher stopped");
    }

    /// One poll/admit/supervise round. Returns how long to sleep afterwards.
    pub async fn cycle(&mut self) -> Duration {
        let mut admitted = false;
        if self.pool.busy() {
            debug!(running = self.pool.len(), "pool busy; not polling");
        } else {
            self.state = DispatchState::Polling;
            if let Some(task) = self.try_to_obtain_new_task().await {
                self.state = DispatchState::Dispatching;
                self.dispatch(task).await;
                admitted = true;
            }
        }

        self.reap().await;

        if admitted || self.pool.busy() {
            self.settings.pool_busy_sleep_time
        } else {
            self.settings.sleep_time
        }
    }

    /// Polls the frontend and picks at most one task. A failed poll, or any
    /// descriptor that cannot be turned into a task, yields nothing.
    pub async fn try_to_obtain_new_task(&mut self) -> Option<ImportTask> {
        let polled = tokio::select! {
            biased;
            _ = self.stop.wait_for(|stop| *stop) => return None,
            polled = self.frontend.importing_tasks() => polled,
        };
        let batch = match polled {
            Ok(batch) => batch,
            Err(e) => {
                warn!(error = %e, "failed to poll frontend for tasks");
                return None;
            }
        };

        let mut tasks = Vec::with_capacity(batch.len());
        for desc in &batch {
            match ImportTask::from_descriptor(desc, &self.settings.frontend_base_url) {
                Ok(task) => tasks.push(task),
                Err(e) => {
                    warn!(task_id = desc.task_id, error = %e, "rejecting poll with bad task");
                    return None;
                }
            }
        }

        let fresh: Vec<TaskDescriptor> = batch
            .into_iter()
            .filter(|desc| !self.pool.contains(desc.task_id))
            .collect();
        let chosen = self.filters.get(&fresh)?.task_id;
        debug!(task_id = chosen, candidates = fresh.len(), "task admitted");
        tasks.into_iter().find(|task| task.task_id == chosen)
    }

    async fn dispatch(&mut self, task: ImportTask) {
        let id = task.task_id;
        let unit = match self.launcher.work_unit(&task) {
            Ok(unit) => unit,
            Err(e) => {
                warn!(task_id = id, error = %e, "cannot prepare worker");
                self.report_spawn_failure(id, format!("{e:#}")).await;
                return;
            }
        };

        let mut worker = Worker::new(id, unit, self.settings.task_timeout);
        match worker.start() {
            Ok(()) => {
                info!(task_id = id, kind = %task.source_kind(), "import started");
                self.pool.append(worker);
            }
            Err(e) => {
                warn!(task_id = id, error = %e, "cannot start worker");
                self.report_spawn_failure(id, e.to_string()).await;
            }
        }
    }

    async fn report_spawn_failure(&self, id: TaskId, message: String) {
        let report = ImportReport::failure(id, ErrorCode::ImportSpawnFailed, Some(message));
        post_back_safe(&self.frontend, &report).await;
    }

    /// Prunes finished workers, then kills and reports timed-out ones.
    ///
    /// An agent that died on its own without reporting, whether by a non-zero
    /// exit, a signal or an unknown status, is reported as
    /// `import_agent_failed`.
    async fn reap(&mut self) {
        let mut reports = Vec::new();
        for worker in self.pool.remove_dead() {
            let id = worker.id();
            let status = worker.exit_status();
            debug!(
                task_id = id,
                status = ?status,
                elapsed = ?worker.started_at().map(|t| t.elapsed()),
                "worker finished"
            );
            let reported = worker.reported();
            worker.clear_reported();
            if worker.killed() || reported || status.is_some_and(|s| s.success()) {
                continue;
            }
            let message = match status {
                Some(status) => format!("agent exited with {status}"),
                None => "agent exit status unknown".to_string(),
            };
            warn!(task_id = id, status = ?status, "agent died without reporting");
            reports.push(ImportReport::failure(
                id,
                ErrorCode::ImportAgentFailed,
                Some(message),
            ));
        }
        self.pool.terminate_timeouted(|report| reports.push(report));
        self.post_all(&reports).await;
    }

    async fn post_all(&self, reports: &[ImportReport]) {
        for report in reports {
            post_back_safe(&self.frontend, report).await;
        }
    }

    async fn drain(&mut self) {
        let deadline = Instant::now() + self.settings.shutdown_grace;
        loop {
            self.reap().await;
            if self.pool.is_empty() {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            sleep(self.settings.pool_busy_sleep_time.min(deadline - now)).await;
        }

        let running: Vec<TaskId> = self.pool.iter().map(|w| w.id()).collect();
        warn!(tasks = ?running, "shutdown grace expired; killing workers");
        let mut reports = Vec::new();
        self.pool.terminate_all(|report| reports.push(report));
        self.pool.join().await;
        for worker in self.pool.remove_dead() {
            worker.clear_reported();
        }
        self.post_all(&reports).await;
    }
}
