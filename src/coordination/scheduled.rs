//! Cancellable scheduled tasks
//!
//! Every timer owned by the runtime (job producers, gas sampling, the sink's
//! poll loop and reconnect backoff) is held as a [`ScheduledTask`]. Dropping
//! the handle or calling [`ScheduledTask::cancel`] aborts the task, so teardown
//! never leaves a timer firing in the background.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

pub struct ScheduledTask {
    name: &'static str,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Spawn a future as an owned, cancellable task
    pub fn spawn<F>(name: &'static str, future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            name,
            handle: tokio::spawn(future),
        }
    }

    /// Run `tick` on a fixed period; the first run happens immediately
    pub fn every<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        Self::spawn(name, async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                tick().await;
            }
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Abort the task; pending timers and in-flight work are abandoned
    pub fn cancel(&self) {
        if !self.handle.is_finished() {
            debug!("Cancelling scheduled task {}", self.name);
        }
        self.handle.abort();
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl std::fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("name", &self.name)
            .field("finished", &self.handle.is_finished())
            .finish()
    }
}
