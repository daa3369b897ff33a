pub mod adapters;
pub mod cli;
pub mod config;
pub mod coordination;
pub mod error;
pub mod queue;
pub mod safety;
pub mod services;
pub mod strategy;
pub mod supervisor;
pub mod worker;

pub use config::AppConfig;
pub use coordination::{GracefulShutdown, ShutdownPhase, ShutdownSignal};
pub use error::{ExecutionError, FlashError, Result, TransportError};
pub use queue::{Job, JobOutcome, JobPayload, JobQueue, Outcome};
pub use strategy::{FlashLoanOperation, PreflightOperation};
pub use supervisor::{AlertMessage, AlertSink, AlertTransport, ConnectionState, Supervisor};
pub use worker::{Worker, WorkerContext};
