//! Job Queue - bounded FIFO with competing consumers
//!
//! Every enqueued job is handed to exactly one consumer. The queue is
//! in-memory only: pending and in-flight jobs do not survive a restart,
//! producers simply enqueue fresh work on their next tick.

use super::job::{Job, JobId, JobOutcome};
use crate::error::{FlashError, Result};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::{debug, warn};

struct QueueInner {
    jobs: Mutex<VecDeque<Job>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
    enqueued_count: AtomicU64,
    dequeued_count: AtomicU64,
    completed_count: AtomicU64,
    failed_count: AtomicU64,
}

/// Shared handle to the job queue; clones refer to the same queue
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<QueueInner>,
}

impl JobQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                jobs: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
                notify: Notify::new(),
                capacity,
                closed: AtomicBool::new(false),
                enqueued_count: AtomicU64::new(0),
                dequeued_count: AtomicU64::new(0),
                completed_count: AtomicU64::new(0),
                failed_count: AtomicU64::new(0),
            }),
        }
    }

    fn jobs(&self) -> MutexGuard<'_, VecDeque<Job>> {
        self.inner.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a job without blocking.
    ///
    /// # Returns
    /// - `Ok(id)` the job is queued
    /// - `Err(QueueFull)` the queue is at capacity
    /// - `Err(QueueClosed)` the queue no longer accepts work
    pub fn enqueue(&self, job: Job) -> Result<JobId> {
        if self.is_closed() {
            return Err(FlashError::QueueClosed);
        }

        let id = job.id;
        {
            let mut jobs = self.jobs();
            if jobs.len() >= self.inner.capacity {
                return Err(FlashError::QueueFull(self.inner.capacity));
            }
            debug!("Enqueuing job {} ({})", id, job.trigger);
            jobs.push_back(job);
        }

        self.inner.enqueued_count.fetch_add(1, Ordering::Relaxed);
        self.inner.notify.notify_one();
        Ok(id)
    }

    /// Take the next job if one is waiting
    pub fn try_dequeue(&self) -> Option<Job> {
        let job = self.jobs().pop_front();
        if job.is_some() {
            self.inner.dequeued_count.fetch_add(1, Ordering::Relaxed);
        }
        job
    }

    /// Wait for the next job.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn dequeue(&self) -> Option<Job> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(job) = self.try_dequeue() {
                // Pass any surplus wakeup on to another waiting consumer
                if !self.is_empty() {
                    self.inner.notify.notify_one();
                }
                return Some(job);
            }
            if self.is_closed() {
                return None;
            }

            notified.await;
        }
    }

    /// Record how a dequeued job ended
    pub fn record_outcome(&self, outcome: &JobOutcome) {
        match outcome {
            JobOutcome::Completed => {
                self.inner.completed_count.fetch_add(1, Ordering::Relaxed);
            }
            JobOutcome::Failed(reason) => {
                self.inner.failed_count.fetch_add(1, Ordering::Relaxed);
                debug!("Job failed: {}", reason);
            }
        }
    }

    /// Process jobs one at a time until the queue is closed and drained
    pub async fn consume<F, Fut>(&self, mut handler: F)
    where
        F: FnMut(Job) -> Fut,
        Fut: Future<Output = JobOutcome>,
    {
        while let Some(job) = self.dequeue().await {
            let outcome = handler(job).await;
            self.record_outcome(&outcome);
        }
    }

    /// Stop accepting jobs and wake every waiting consumer
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            let pending = self.len();
            if pending > 0 {
                warn!("Job queue closed with {} pending jobs", pending);
            }
        }
        self.inner.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.jobs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            current_size: self.len(),
            capacity: self.inner.capacity,
            enqueued_total: self.inner.enqueued_count.load(Ordering::Relaxed),
            dequeued_total: self.inner.dequeued_count.load(Ordering::Relaxed),
            completed_total: self.inner.completed_count.load(Ordering::Relaxed),
            failed_total: self.inner.failed_count.load(Ordering::Relaxed),
        }
    }
}

/// Queue statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub current_size: usize,
    pub capacity: usize,
    pub enqueued_total: u64,
    pub dequeued_total: u64,
    pub completed_total: u64,
    pub failed_total: u64,
}

impl std::fmt::Display for QueueStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Queue[{}/{}, enq={}, deq={}, ok={}, failed={}]",
            self.current_size,
            self.capacity,
            self.enqueued_total,
            self.dequeued_total,
            self.completed_total,
            self.failed_total
        )
    }
}
