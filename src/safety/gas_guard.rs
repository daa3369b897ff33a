//! Gas price guard
//!
//! A sampler records the network gas price into a fixed-size ring on a fixed
//! period. Before every attempt the worker asks the guard whether the integer
//! mean of that ring is still within the configured ceiling.

use crate::coordination::ScheduledTask;
use crate::error::{ExecutionError, GasPriceExceeded};
use alloy::providers::{DynProvider, Provider};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Anything that can report the current gas price in wei
#[async_trait]
pub trait GasPriceSource: Send + Sync {
    async fn gas_price(&self) -> Result<u128, ExecutionError>;
}

#[async_trait]
impl GasPriceSource for DynProvider {
    async fn gas_price(&self) -> Result<u128, ExecutionError> {
        self.get_gas_price()
            .await
            .map_err(|e| ExecutionError::Network(format!("gas price request failed: {e}")))
    }
}

/// Ring of the most recent gas price samples; oldest evicted first
#[derive(Debug, Clone)]
pub struct GasPriceWindow {
    samples: VecDeque<u128>,
    capacity: usize,
}

impl GasPriceWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record(&mut self, price_wei: u128) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(price_wei);
    }

    /// Integer mean of the retained samples
    pub fn average(&self) -> Option<u128> {
        if self.samples.is_empty() {
            return None;
        }
        let total = self
            .samples
            .iter()
            .fold(0u128, |acc, price| acc.saturating_add(*price));
        Some(total / self.samples.len() as u128)
    }

    /// Compare the mean against a ceiling; equal passes
    pub fn check_ceiling(&self, ceiling_wei: u128) -> Result<u128, GasPriceExceeded> {
        let average_wei = self.average().unwrap_or(0);
        if average_wei > ceiling_wei {
            return Err(GasPriceExceeded {
                average_wei,
                ceiling_wei,
            });
        }
        Ok(average_wei)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn samples(&self) -> impl Iterator<Item = &u128> {
        self.samples.iter()
    }
}

pub struct GasGuard {
    source: Arc<dyn GasPriceSource>,
    window: Arc<RwLock<GasPriceWindow>>,
    ceiling_wei: u128,
    sampler: Mutex<Option<ScheduledTask>>,
}

impl GasGuard {
    pub fn new(source: Arc<dyn GasPriceSource>, ceiling_wei: u128, window_size: usize) -> Self {
        Self {
            source,
            window: Arc::new(RwLock::new(GasPriceWindow::new(window_size))),
            ceiling_wei,
            sampler: Mutex::new(None),
        }
    }

    pub fn ceiling_wei(&self) -> u128 {
        self.ceiling_wei
    }

    /// Fetch one sample and record it
    pub async fn sample(&self) -> Result<u128, ExecutionError> {
        record_sample(self.source.as_ref(), &self.window).await
    }

    /// Start periodic sampling, replacing any running sampler
    pub fn start_sampling(&self, period: Duration) {
        let source = Arc::clone(&self.source);
        let window = Arc::clone(&self.window);
        let task = ScheduledTask::every("gas-sampler", period, move || {
            let source = Arc::clone(&source);
            let window = Arc::clone(&window);
            async move {
                if let Err(e) = record_sample(source.as_ref(), &window).await {
                    warn!("Gas price sample failed: {}", e);
                }
            }
        });

        info!("Gas sampler started (every {:?})", period);
        let previous = self
            .sampler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    pub fn stop_sampling(&self) {
        let task = self
            .sampler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.cancel();
            info!("Gas sampler stopped");
        }
    }

    pub async fn average(&self) -> Option<u128> {
        self.window.read().await.average()
    }

    pub async fn window(&self) -> GasPriceWindow {
        self.window.read().await.clone()
    }

    /// Check the rolling mean against the ceiling.
    ///
    /// With no samples yet, one is taken on demand so the first job is never
    /// judged against an empty window.
    pub async fn check(&self) -> Result<u128, ExecutionError> {
        if self.window.read().await.is_empty() {
            self.sample().await?;
        }

        let window = self.window.read().await;
        match window.check_ceiling(self.ceiling_wei) {
            Ok(average) => {
                debug!(
                    "Gas check passed: avg {} wei <= {} wei ({} samples)",
                    average,
                    self.ceiling_wei,
                    window.len()
                );
                Ok(average)
            }
            Err(exceeded) => {
                warn!("Gas check failed: {}", exceeded);
                Err(exceeded.into())
            }
        }
    }
}

impl Drop for GasGuard {
    fn drop(&mut self) {
        self.stop_sampling();
    }
}

async fn record_sample(
    source: &dyn GasPriceSource,
    window: &RwLock<GasPriceWindow>,
) -> Result<u128, ExecutionError> {
    let price = source.gas_price().await?;
    window.write().await.record(price);
    debug!("Gas price sample: {} wei", price);
    Ok(price)
}
