//! Shutdown coordination
//!
//! Coordinates supervisor teardown: OS signals request shutdown, the
//! supervisor walks the phases below and every long-lived task observes a
//! [`ShutdownToken`].

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Why the supervisor is being asked to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGTERM, SIGINT
    Graceful,
    /// SIGQUIT, or the coordinator went away
    Urgent,
}

impl ShutdownSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownSignal::Graceful => "graceful",
            ShutdownSignal::Urgent => "urgent",
        }
    }
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Teardown progress, in the order the supervisor walks it
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShutdownPhase {
    Running,
    /// Worker tasks aborted; in-flight jobs are abandoned
    StoppingWorkers,
    /// Queue closed, idle consumers woken
    ClosingQueue,
    /// Samplers and the alert forwarder cancelled
    StoppingTimers,
    /// Notification connection released
    StoppingSink,
    Complete,
}

impl ShutdownPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownPhase::Running => "running",
            ShutdownPhase::StoppingWorkers => "stopping_workers",
            ShutdownPhase::ClosingQueue => "closing_queue",
            ShutdownPhase::StoppingTimers => "stopping_timers",
            ShutdownPhase::StoppingSink => "stopping_sink",
            ShutdownPhase::Complete => "complete",
        }
    }
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shutdown coordinator shared by the binary's signal handlers and the supervisor.
///
/// The first request wins; later ones are logged and ignored.
pub struct GracefulShutdown {
    signal_tx: watch::Sender<Option<ShutdownSignal>>,
    phase_tx: watch::Sender<ShutdownPhase>,
}

impl GracefulShutdown {
    pub fn new() -> Self {
        Self {
            signal_tx: watch::Sender::new(None),
            phase_tx: watch::Sender::new(ShutdownPhase::Running),
        }
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.signal_tx.borrow().is_some()
    }

    pub fn current_phase(&self) -> ShutdownPhase {
        *self.phase_tx.borrow()
    }

    pub fn phase_receiver(&self) -> watch::Receiver<ShutdownPhase> {
        self.phase_tx.subscribe()
    }

    pub fn request_shutdown(&self, signal: ShutdownSignal) {
        let accepted = self.signal_tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(signal);
            true
        });

        if accepted {
            info!("Shutdown requested ({})", signal);
        } else {
            warn!("Ignoring {} shutdown request, already shutting down", signal);
        }
    }

    pub fn set_phase(&self, phase: ShutdownPhase) {
        self.phase_tx.send_replace(phase);
        info!("Shutdown phase: {}", phase);
    }

    /// Token observing requests, including ones made before it was created
    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            signal_rx: self.signal_tx.subscribe(),
        }
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct ShutdownToken {
    signal_rx: watch::Receiver<Option<ShutdownSignal>>,
}

impl ShutdownToken {
    pub fn is_shutdown_requested(&self) -> bool {
        self.signal_rx.borrow().is_some()
    }

    pub async fn wait_for_shutdown(&mut self) -> ShutdownSignal {
        match self.signal_rx.wait_for(Option::is_some).await {
            Ok(signal) => (*signal).unwrap_or(ShutdownSignal::Urgent),
            // coordinator dropped without a request
            Err(_) => ShutdownSignal::Urgent,
        }
    }
}

/// Spawn a task that turns the first OS signal into a shutdown request
pub fn install_signal_handlers(shutdown: Arc<GracefulShutdown>) {
    tokio::spawn(async move {
        match next_os_signal().await {
            Ok((name, signal)) => {
                info!("Received {}", name);
                shutdown.request_shutdown(signal);
            }
            Err(e) => error!("Failed to install signal handlers: {}", e),
        }
    });
}

#[cfg(unix)]
async fn next_os_signal() -> std::io::Result<(&'static str, ShutdownSignal)> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut quit = signal(SignalKind::quit())?;

    Ok(tokio::select! {
        _ = terminate.recv() => ("SIGTERM", ShutdownSignal::Graceful),
        _ = interrupt.recv() => ("SIGINT", ShutdownSignal::Graceful),
        _ = quit.recv() => ("SIGQUIT", ShutdownSignal::Urgent),
    })
}

#[cfg(not(unix))]
async fn next_os_signal() -> std::io::Result<(&'static str, ShutdownSignal)> {
    tokio::signal::ctrl_c().await?;
    Ok(("Ctrl+C", ShutdownSignal::Graceful))
}
