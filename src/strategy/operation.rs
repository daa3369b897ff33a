use crate::error::ExecutionError;
use crate::queue::{JobPayload, Outcome};
use async_trait::async_trait;

/// Collaborator that performs one flash-loan attempt.
///
/// Errors are job-level: the worker reports them and moves on to the next job.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FlashLoanOperation: Send + Sync {
    async fn execute(&self, payload: &JobPayload) -> Result<Outcome, ExecutionError>;
}
