//! Pool sizing policy
//!
//! Load above the high watermark grows the pool by one worker, load below the
//! low watermark shrinks it by one. Anything in between holds, which keeps a
//! load hovering around one threshold from flapping the pool.

use crate::config::SupervisorConfig;
use crate::queue::JobQueue;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingAction {
    Spawn,
    Terminate,
    Hold,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalingPolicy {
    pub min_workers: usize,
    pub max_workers: usize,
    pub high_watermark: f64,
    pub low_watermark: f64,
}

impl ScalingPolicy {
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            min_workers: config.min_workers,
            max_workers: config.max_workers,
            high_watermark: config.high_watermark,
            low_watermark: config.low_watermark,
        }
    }

    /// At most one action per tick
    pub fn decide(&self, load: f64, pool_size: usize) -> ScalingAction {
        if load > self.high_watermark && pool_size < self.max_workers {
            ScalingAction::Spawn
        } else if load < self.low_watermark && pool_size > self.min_workers {
            ScalingAction::Terminate
        } else {
            ScalingAction::Hold
        }
    }

    /// Workers missing from the floor
    pub fn deficit(&self, pool_size: usize) -> usize {
        self.min_workers.saturating_sub(pool_size)
    }
}

/// Normalized [0, 1] load metric sampled once per scaling tick
pub trait LoadSignal: Send + Sync {
    fn sample(&self, pool_size: usize) -> f64;
}

/// Load as queue backlog relative to what the pool should be carrying
#[derive(Clone)]
pub struct QueueBacklogLoad {
    queue: JobQueue,
    target_per_worker: usize,
}

impl QueueBacklogLoad {
    pub fn new(queue: JobQueue, target_per_worker: usize) -> Self {
        Self {
            queue,
            target_per_worker: target_per_worker.max(1),
        }
    }

    pub fn load_for(pending: usize, pool_size: usize, target_per_worker: usize) -> f64 {
        let capacity = pool_size.saturating_mul(target_per_worker.max(1));
        if capacity == 0 {
            return if pending > 0 { 1.0 } else { 0.0 };
        }
        (pending as f64 / capacity as f64).min(1.0)
    }
}

impl LoadSignal for QueueBacklogLoad {
    fn sample(&self, pool_size: usize) -> f64 {
        Self::load_for(self.queue.len(), pool_size, self.target_per_worker)
    }
}

/// Externally set load, for operator overrides and tests
#[derive(Debug, Default)]
pub struct ManualLoad {
    bits: AtomicU64,
}

impl ManualLoad {
    pub fn new(load: f64) -> Self {
        let manual = Self::default();
        manual.set(load);
        manual
    }

    pub fn set(&self, load: f64) {
        self.bits
            .store(load.clamp(0.0, 1.0).to_bits(), Ordering::SeqCst);
    }
}

impl LoadSignal for ManualLoad {
    fn sample(&self, _pool_size: usize) -> f64 {
        f64::from_bits(self.bits.load(Ordering::SeqCst))
    }
}
