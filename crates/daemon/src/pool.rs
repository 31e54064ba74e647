//! Bounded set of running workers.

use importer_core::api::{ErrorCode, ImportReport};
use importer_core::model::TaskId;
use tracing::{info, warn};

use crate::worker::{Worker, WorkerError};

/// What the pool needs from a worker.
pub trait Supervised {
    fn id(&self) -> TaskId;
    fn is_alive(&mut self) -> bool;
    fn timed_out(&self) -> bool;
    /// Whether a kill has already been issued.
    fn terminated(&self) -> bool;
    /// Whether the task's outcome already reached the frontend.
    fn reported(&self) -> bool;
    fn terminate(&mut self) -> Result<(), WorkerError>;
}

impl Supervised for Worker {
    fn id(&self) -> TaskId {
        Worker::id(self)
    }

    fn is_alive(&mut self) -> bool {
        Worker::is_alive(self)
    }

    fn timed_out(&self) -> bool {
        Worker::timed_out(self)
    }

    fn terminated(&self) -> bool {
        self.killed()
    }

    fn reported(&self) -> bool {
        Worker::reported(self)
    }

    fn terminate(&mut self) -> Result<(), WorkerError> {
        Worker::terminate(self)
    }
}

/// Insertion-ordered worker collection with a fixed capacity.
///
/// The pool does not refuse appends past capacity; callers check
/// [`Pool::busy`] before admitting.
#[derive(Debug)]
pub struct Pool<W = Worker> {
    workers: Vec<W>,
    capacity: usize,
}

impl<W: Supervised> Pool<W> {
    pub fn new(capacity: usize) -> Self {
        Self {
            workers: Vec::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Held workers, dead ones included until [`Pool::remove_dead`], are at
    /// least the capacity.
    pub fn busy(&self) -> bool {
        self.workers.len() >= self.capacity
    }

    pub fn append(&mut self, worker: W) {
        self.workers.push(worker);
    }

    pub fn extend(&mut self, workers: impl IntoIterator<Item = W>) {
        self.workers.extend(workers);
    }

    pub fn iter(&self) -> impl Iterator<Item = &W> {
        self.workers.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut W> {
        self.workers.iter_mut()
    }

    /// Whether a worker for `task_id` is held.
    pub fn contains(&self, task_id: TaskId) -> bool {
        self.workers.iter().any(|w| w.id() == task_id)
    }

    /// Drops every worker that is no longer alive and returns them, keeping
    /// the order of the survivors.
    pub fn remove_dead(&mut self) -> Vec<W> {
        let mut dead = Vec::new();
        let mut alive = Vec::with_capacity(self.workers.len());
        for mut worker in self.workers.drain(..) {
            if worker.is_alive() {
                alive.push(worker);
            } else {
                dead.push(worker);
            }
        }
        self.workers = alive;
        dead
    }

    /// Kills every live worker past its timeout and hands one abandonment
    /// report per kill to `report`. Returns the number of kills.
    ///
    /// A worker whose agent already reported is killed without a report.
    /// Workers stay in the pool; they are evicted by a later
    /// [`Pool::remove_dead`] once the kill has taken effect.
    pub fn terminate_timeouted(&mut self, report: impl FnMut(ImportReport)) -> usize {
        self.terminate_where(|w| w.timed_out(), ErrorCode::ImportTimeoutExceeded, report)
    }

    /// Kills every live worker regardless of timeout, reporting each as
    /// interrupted.
    pub fn terminate_all(&mut self, report: impl FnMut(ImportReport)) -> usize {
        self.terminate_where(|_| true, ErrorCode::ImportInterrupted, report)
    }

    fn terminate_where(
        &mut self,
        select: impl Fn(&W) -> bool,
        code: ErrorCode,
        mut report: impl FnMut(ImportReport),
    ) -> usize {
        let mut killed = 0;
        for worker in &mut self.workers {
            if worker.terminated() || !select(worker) || !worker.is_alive() {
                continue;
            }
            let id = worker.id();
            match worker.terminate() {
                Ok(()) if worker.reported() => {
                    info!(task_id = id, "worker terminated after reporting");
                    killed += 1;
                }
                Ok(()) => {
                    info!(task_id = id, error = %code, "worker terminated");
                    report(ImportReport::failure(id, code, None));
                    killed += 1;
                }
                Err(e) => warn!(task_id = id, error = %e, "failed to terminate worker"),
            }
        }
        killed
    }
}

impl Pool<Worker> {
    /// Waits for every held process to exit.
    pub async fn join(&mut self) {
        for worker in &mut self.workers {
            worker.wait().await;
        }
    }
}
