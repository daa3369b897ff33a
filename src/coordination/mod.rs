//! Coordination primitives for the supervisor runtime
//!
//! - Graceful shutdown signalling and phase tracking
//! - Cancellable scheduled tasks for every timer the runtime owns

pub mod scheduled;
pub mod shutdown;

pub use scheduled::ScheduledTask;
pub use shutdown::{
    install_signal_handlers, GracefulShutdown, ShutdownPhase, ShutdownSignal, ShutdownToken,
};
