use crate::config::AppConfig;
use crate::services::PriceCache;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

pub type JobId = Uuid;

/// What caused a job to be enqueued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobTrigger {
    /// Enqueued once when a worker starts
    Startup,
    /// Enqueued by a worker's periodic producer
    Scheduled,
    /// Enqueued explicitly by an operator or test
    Manual,
}

impl std::fmt::Display for JobTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobTrigger::Startup => write!(f, "startup"),
            JobTrigger::Scheduled => write!(f, "scheduled"),
            JobTrigger::Manual => write!(f, "manual"),
        }
    }
}

/// Parameters for one flash-loan attempt. Never mutated after construction.
#[derive(Debug, Clone)]
pub struct JobPayload {
    /// Loan amount in whole tokens
    pub amount: Decimal,
    pub config: Arc<AppConfig>,
    pub prices: Arc<PriceCache>,
}

impl JobPayload {
    pub fn new(amount: Decimal, config: Arc<AppConfig>, prices: Arc<PriceCache>) -> Self {
        Self {
            amount,
            config,
            prices,
        }
    }
}

/// A queued unit of work
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub payload: JobPayload,
    pub trigger: JobTrigger,
    pub enqueued_at: DateTime<Utc>,
}

impl Job {
    pub fn new(payload: JobPayload, trigger: JobTrigger) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            trigger,
            enqueued_at: Utc::now(),
        }
    }
}

/// Result reported by the financial-operation collaborator
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub success: bool,
    /// Recorded profit in ETH-equivalent units
    pub profit: Option<Decimal>,
}

impl Outcome {
    pub fn succeeded(profit: Decimal) -> Self {
        Self {
            success: true,
            profit: Some(profit),
        }
    }

    pub fn skipped() -> Self {
        Self {
            success: false,
            profit: None,
        }
    }
}

/// Terminal state of a processed job. Failed jobs are never re-enqueued.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed,
    Failed(String),
}

impl JobOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, JobOutcome::Failed(_))
    }
}
