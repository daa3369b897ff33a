//! Job queue feeding flash-loan attempts to competing workers

pub mod job;
pub mod job_queue;

pub use job::{Job, JobId, JobOutcome, JobPayload, JobTrigger, Outcome};
pub use job_queue::{JobQueue, QueueStats};
