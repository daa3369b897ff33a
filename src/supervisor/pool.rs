//! Active worker set owned by the supervisor

use super::channel::WorkerId;
use chrono::{DateTime, Utc};
use tokio::task::AbortHandle;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Starting,
    Running,
    Exiting,
    Dead,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Starting => write!(f, "starting"),
            WorkerStatus::Running => write!(f, "running"),
            WorkerStatus::Exiting => write!(f, "exiting"),
            WorkerStatus::Dead => write!(f, "dead"),
        }
    }
}

#[derive(Debug)]
pub struct WorkerHandle {
    pub id: WorkerId,
    pub status: WorkerStatus,
    pub spawned_at: DateTime<Utc>,
    abort: AbortHandle,
}

impl WorkerHandle {
    /// Abort the worker task; its timers and in-flight job are abandoned
    fn terminate(&mut self) {
        self.status = WorkerStatus::Exiting;
        self.abort.abort();
    }
}

/// Workers in spawn order; the last entry is the newest
#[derive(Debug, Default)]
pub struct WorkerPool {
    workers: Vec<WorkerHandle>,
    next_id: u64,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> WorkerId {
        self.next_id += 1;
        WorkerId(self.next_id)
    }

    pub fn insert(&mut self, id: WorkerId, abort: AbortHandle) {
        self.workers.push(WorkerHandle {
            id,
            status: WorkerStatus::Starting,
            spawned_at: Utc::now(),
            abort,
        });
    }

    /// Returns false for workers no longer in the pool
    pub fn mark_running(&mut self, id: WorkerId) -> bool {
        match self.workers.iter_mut().find(|w| w.id == id) {
            Some(worker) => {
                worker.status = WorkerStatus::Running;
                true
            }
            None => false,
        }
    }

    /// Drop an exited worker from the active set
    pub fn remove(&mut self, id: WorkerId) -> Option<WorkerHandle> {
        let index = self.workers.iter().position(|w| w.id == id)?;
        let mut handle = self.workers.remove(index);
        handle.status = WorkerStatus::Dead;
        Some(handle)
    }

    /// Abort and remove the most recently spawned worker
    pub fn terminate_newest(&mut self) -> Option<WorkerHandle> {
        let mut handle = self.workers.pop()?;
        handle.terminate();
        debug!("Terminating {}", handle.id);
        Some(handle)
    }

    /// Abort and remove every worker
    pub fn terminate_all(&mut self) -> Vec<WorkerHandle> {
        let mut handles: Vec<_> = self.workers.drain(..).collect();
        for handle in &mut handles {
            handle.terminate();
        }
        handles
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn contains(&self, id: WorkerId) -> bool {
        self.workers.iter().any(|w| w.id == id)
    }

    pub fn get(&self, id: WorkerId) -> Option<&WorkerHandle> {
        self.workers.iter().find(|w| w.id == id)
    }

    pub fn ids(&self) -> Vec<WorkerId> {
        self.workers.iter().map(|w| w.id).collect()
    }

    pub fn running_count(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| w.status == WorkerStatus::Running)
            .count()
    }
}
