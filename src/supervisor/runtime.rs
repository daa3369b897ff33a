//! Supervisor runtime
//!
//! Owns the alert sink, the job queue and the worker pool. The main loop
//! reacts to worker lifecycle events (replacing any worker that exits),
//! resizes the pool on a fixed tick, and tears everything down in order once
//! shutdown is requested.

use super::alert_sink::{AlertMessage, AlertSink};
use super::channel::{
    alert_channel, event_channel, AlertReceiver, AlertSender, EventReceiver, EventSender,
    ExitReason, WorkerEvent, WorkerId, WorkerMessage,
};
use super::pool::WorkerPool;
use super::scaling::{LoadSignal, QueueBacklogLoad, ScalingAction, ScalingPolicy};
use crate::config::AppConfig;
use crate::coordination::{GracefulShutdown, ScheduledTask, ShutdownPhase};
use crate::error::Result;
use crate::queue::JobQueue;
use crate::safety::GasGuard;
use crate::services::PriceCache;
use crate::strategy::FlashLoanOperation;
use crate::worker::{Worker, WorkerContext};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Best-effort wait for the shutdown notice before the sink is stopped
const SHUTDOWN_ALERT_TIMEOUT: Duration = Duration::from_secs(5);

/// Point-in-time view of the pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub size: usize,
    pub running: usize,
    pub spawned_total: u64,
    pub restarts: u64,
}

pub struct Supervisor {
    config: Arc<AppConfig>,
    sink: Arc<AlertSink>,
    queue: JobQueue,
    operation: Arc<dyn FlashLoanOperation>,
    prices: Arc<PriceCache>,
    gas_guard: Option<Arc<GasGuard>>,
    policy: ScalingPolicy,
    load: Arc<dyn LoadSignal>,
    pool: WorkerPool,
    alerts_tx: AlertSender,
    alerts_rx: Option<AlertReceiver>,
    events_tx: EventSender,
    events_rx: EventReceiver,
    shutdown: Arc<GracefulShutdown>,
    forwarder: Option<ScheduledTask>,
    snapshot_tx: watch::Sender<PoolSnapshot>,
    spawned_total: u64,
    restarts: u64,
}

impl Supervisor {
    pub fn new(
        config: Arc<AppConfig>,
        sink: Arc<AlertSink>,
        operation: Arc<dyn FlashLoanOperation>,
        shutdown: Arc<GracefulShutdown>,
    ) -> Self {
        let queue = JobQueue::new(config.queue.capacity);
        let load = Arc::new(QueueBacklogLoad::new(
            queue.clone(),
            config.supervisor.target_backlog_per_worker,
        ));
        let (alerts_tx, alerts_rx) = alert_channel(config.alerts.channel_capacity);
        let (events_tx, events_rx) = event_channel(config.supervisor.max_workers * 4 + 16);
        let (snapshot_tx, _) = watch::channel(PoolSnapshot::default());

        Self {
            prices: Arc::new(PriceCache::from_config(&config.price)),
            policy: ScalingPolicy::from_config(&config.supervisor),
            config,
            sink,
            queue,
            operation,
            gas_guard: None,
            load,
            pool: WorkerPool::new(),
            alerts_tx,
            alerts_rx: Some(alerts_rx),
            events_tx,
            events_rx,
            shutdown,
            forwarder: None,
            snapshot_tx,
            spawned_total: 0,
            restarts: 0,
        }
    }

    pub fn with_load_signal(mut self, load: Arc<dyn LoadSignal>) -> Self {
        self.load = load;
        self
    }

    /// Guard whose sampler runs for the supervisor's lifetime
    pub fn with_gas_guard(mut self, guard: Arc<GasGuard>) -> Self {
        self.gas_guard = Some(guard);
        self
    }

    pub fn with_price_cache(mut self, prices: Arc<PriceCache>) -> Self {
        self.prices = prices;
        self
    }

    pub fn queue(&self) -> JobQueue {
        self.queue.clone()
    }

    pub fn alert_sender(&self) -> AlertSender {
        self.alerts_tx.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PoolSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Start the sink, spawn the initial pool and supervise until shutdown.
    ///
    /// Fails only at startup: when the sink does not reach polling in time.
    pub async fn run(mut self) -> Result<()> {
        let startup_timeout = Duration::from_secs(self.config.supervisor.startup_timeout_secs);
        info!(
            "Starting supervisor, waiting up to {:?} for the alert sink",
            startup_timeout
        );
        if let Err(e) = self.sink.start(startup_timeout).await {
            error!("Alert sink failed to start: {}", e);
            self.sink.stop().await;
            return Err(e);
        }

        self.start();
        self.supervise().await;
        self.teardown().await;
        Ok(())
    }

    fn start(&mut self) {
        self.spawn_forwarder();

        if let Some(guard) = &self.gas_guard {
            guard.start_sampling(Duration::from_secs(self.config.gas.sample_interval_secs));
        }

        let initial = self.config.supervisor.initial_workers;
        for _ in 0..initial {
            self.spawn_worker();
        }
        self.publish();

        info!(
            "Supervisor started: {} workers (floor {}, ceiling {})",
            initial, self.policy.min_workers, self.policy.max_workers
        );
        self.raise_alert(format!("Flash loan bot started with {} workers", initial));
    }

    async fn supervise(&mut self) {
        let period = Duration::from_secs(self.config.supervisor.scale_interval_secs);
        let mut scale_tick = tokio::time::interval_at(Instant::now() + period, period);
        scale_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown = self.shutdown.token();

        loop {
            tokio::select! {
                signal = shutdown.wait_for_shutdown() => {
                    info!("Supervisor received {:?} shutdown", signal);
                    break;
                }
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                _ = scale_tick.tick() => self.scaling_tick(),
            }
        }
    }

    fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Ready(id) => {
                if self.pool.mark_running(id) {
                    debug!("{} running", id);
                }
            }
            WorkerEvent::Exited { id, reason } => {
                if self.pool.remove(id).is_none() {
                    // Terminated by scale-down; already removed
                    debug!("{} exited after removal: {}", id, reason);
                    return;
                }

                if reason.is_crash() {
                    error!("{} died: {}", id, reason);
                    self.raise_alert(format!("Worker {} died ({}), restarting", id, reason));
                } else {
                    warn!("{} {}", id, reason);
                }

                if self.shutdown.is_shutdown_requested() {
                    self.publish();
                    return;
                }
                let replacement = self.spawn_worker();
                self.restarts += 1;
                info!("Replaced {} with {}", id, replacement);
                self.publish();
            }
        }
    }

    fn scaling_tick(&mut self) {
        let deficit = self.policy.deficit(self.pool.size());
        if deficit > 0 {
            warn!("Pool below floor, spawning {} workers", deficit);
            for _ in 0..deficit {
                self.spawn_worker();
            }
        }

        let size = self.pool.size();
        let load = self.load.sample(size);
        let action = self.policy.decide(load, size);
        match action {
            ScalingAction::Spawn => {
                let id = self.spawn_worker();
                info!("Load {:.2} above {:.2}, spawned {}", load, self.policy.high_watermark, id);
            }
            ScalingAction::Terminate => {
                if let Some(handle) = self.pool.terminate_newest() {
                    info!(
                        "Load {:.2} below {:.2}, terminated {}",
                        load, self.policy.low_watermark, handle.id
                    );
                }
            }
            ScalingAction::Hold => {
                debug!("Load {:.2}, holding at {} workers", load, size);
            }
        }

        debug!("Scaling tick done: {} | {}", self.pool.size(), self.queue.stats());
        self.publish();
    }

    fn spawn_worker(&mut self) -> WorkerId {
        let id = self.pool.next_id();
        let context = WorkerContext {
            queue: self.queue.clone(),
            operation: Arc::clone(&self.operation),
            alerts: self.alerts_tx.clone(),
            config: Arc::clone(&self.config),
            prices: Arc::clone(&self.prices),
        };
        let worker = Worker::new(id, context, self.events_tx.clone());

        let task = tokio::spawn(worker.run());
        self.pool.insert(id, task.abort_handle());
        self.spawned_total += 1;
        tokio::spawn(monitor_exit(id, task, self.events_tx.clone()));

        debug!("Spawned {}", id);
        id
    }

    /// Forward worker alert requests to the sink
    fn spawn_forwarder(&mut self) {
        let Some(mut alerts_rx) = self.alerts_rx.take() else {
            return;
        };
        let sink = Arc::clone(&self.sink);
        self.forwarder = Some(ScheduledTask::spawn("alert-forwarder", async move {
            while let Some(message) = alerts_rx.recv().await {
                let WorkerMessage::SendTelegramAlert { message } = message;
                if let Err(e) = sink.send(AlertMessage::new(message)).await {
                    debug!("Alert not delivered: {}", e);
                }
            }
        }));
    }

    fn raise_alert(&self, message: String) {
        if let Err(e) = self.alerts_tx.try_alert(message) {
            warn!("Supervisor alert not queued: {}", e);
        }
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(PoolSnapshot {
            size: self.pool.size(),
            running: self.pool.running_count(),
            spawned_total: self.spawned_total,
            restarts: self.restarts,
        });
    }

    async fn teardown(&mut self) {
        self.shutdown.set_phase(ShutdownPhase::StoppingWorkers);
        let terminated = self.pool.terminate_all();
        info!("Terminated {} workers", terminated.len());
        self.publish();

        self.shutdown.set_phase(ShutdownPhase::ClosingQueue);
        self.queue.close();
        info!("Job queue closed: {}", self.queue.stats());

        self.shutdown.set_phase(ShutdownPhase::StoppingTimers);
        if let Some(guard) = &self.gas_guard {
            guard.stop_sampling();
        }
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.cancel();
        }

        self.shutdown.set_phase(ShutdownPhase::StoppingSink);
        let notice = self
            .sink
            .send(AlertMessage::stamped("Flash loan bot shutting down"));
        if tokio::time::timeout(SHUTDOWN_ALERT_TIMEOUT, notice)
            .await
            .is_err()
        {
            debug!("Shutdown notice timed out");
        }
        self.sink.stop().await;

        self.shutdown.set_phase(ShutdownPhase::Complete);
        info!("Supervisor stopped");
    }
}

/// Turn a worker task's end into an `Exited` event
async fn monitor_exit(id: WorkerId, task: JoinHandle<Result<()>>, events: EventSender) {
    let reason = match task.await {
        Ok(Ok(())) => ExitReason::Clean,
        Ok(Err(e)) => ExitReason::Failed(e.to_string()),
        Err(e) if e.is_cancelled() => ExitReason::Terminated,
        Err(e) => ExitReason::Panicked(panic_message(e)),
    };
    // The supervisor may already be gone during teardown
    let _ = events.send(WorkerEvent::Exited { id, reason }).await;
}

fn panic_message(err: JoinError) -> String {
    match err.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string()),
        Err(err) => err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SupervisorConfig;
    use crate::coordination::ShutdownSignal;
    use crate::error::{ExecutionError, FlashError};
    use crate::queue::{JobPayload, Outcome};
    use crate::supervisor::alert_sink::mock::FakeTransport;
    use crate::supervisor::alert_sink::AlertSinkConfig;
    use crate::supervisor::scaling::ManualLoad;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Panics on the first `panics` calls, then reports a profit
    struct CrashingOperation {
        panics: AtomicU32,
        calls: AtomicU32,
    }

    impl CrashingOperation {
        fn new(panics: u32) -> Self {
            Self {
                panics: AtomicU32::new(panics),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl FlashLoanOperation for CrashingOperation {
        async fn execute(&self, _payload: &JobPayload) -> std::result::Result<Outcome, ExecutionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.panics.load(Ordering::SeqCst);
            if remaining > 0 {
                self.panics.store(remaining - 1, Ordering::SeqCst);
                panic!("operation crashed");
            }
            Ok(Outcome::succeeded(dec!(0.05)))
        }
    }

    fn config(min: usize, max: usize) -> Arc<AppConfig> {
        Arc::new(AppConfig {
            supervisor: SupervisorConfig {
                initial_workers: min,
                min_workers: min,
                max_workers: max,
                ..SupervisorConfig::default()
            },
            ..AppConfig::default()
        })
    }

    struct Harness {
        transport: Arc<FakeTransport>,
        shutdown: Arc<GracefulShutdown>,
        snapshots: watch::Receiver<PoolSnapshot>,
        queue: JobQueue,
        handle: JoinHandle<Result<()>>,
    }

    fn launch(
        config: Arc<AppConfig>,
        operation: Arc<dyn FlashLoanOperation>,
        load: Arc<dyn LoadSignal>,
        transport: FakeTransport,
    ) -> Harness {
        let transport = Arc::new(transport);
        let sink = AlertSink::new(transport.clone(), AlertSinkConfig::from(&config.alerts));
        let shutdown = Arc::new(GracefulShutdown::new());
        let supervisor = Supervisor::new(config, sink, operation, shutdown.clone())
            .with_load_signal(load);
        let snapshots = supervisor.subscribe();
        let queue = supervisor.queue();
        Harness {
            transport,
            shutdown,
            snapshots,
            queue,
            handle: tokio::spawn(supervisor.run()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_crashed_workers_are_replaced() {
        let operation = Arc::new(CrashingOperation::new(3));
        let harness = launch(
            config(2, 4),
            operation.clone(),
            Arc::new(ManualLoad::new(0.5)),
            FakeTransport::default(),
        );

        tokio::time::sleep(Duration::from_secs(1)).await;

        let snapshot = *harness.snapshots.borrow();
        assert_eq!(snapshot.size, 2);
        assert_eq!(snapshot.restarts, 3);
        assert_eq!(snapshot.spawned_total, 5);
        // two startup jobs from the survivors succeed after three crashes
        assert_eq!(operation.calls.load(Ordering::SeqCst), 5);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(harness.snapshots.borrow().size >= 2);

        harness.shutdown.request_shutdown(ShutdownSignal::Graceful);
        harness.handle.await.unwrap().unwrap();
        assert!(harness
            .transport
            .sent_messages()
            .iter()
            .any(|m| m.contains("died")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scales_up_then_down_one_per_tick() {
        let load = Arc::new(ManualLoad::new(0.9));
        let harness = launch(
            config(2, 4),
            Arc::new(CrashingOperation::new(0)),
            load.clone(),
            FakeTransport::default(),
        );

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(harness.snapshots.borrow().size, 3);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(harness.snapshots.borrow().size, 4);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(harness.snapshots.borrow().size, 4);

        load.set(0.1);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(harness.snapshots.borrow().size, 3);
        tokio::time::sleep(Duration::from_secs(120)).await;
        let snapshot = *harness.snapshots.borrow();
        assert_eq!(snapshot.size, 2);
        // scale-down terminations are not restarts
        assert_eq!(snapshot.restarts, 0);

        harness.shutdown.request_shutdown(ShutdownSignal::Graceful);
        harness.handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_between_watermarks_never_rescales() {
        let load = Arc::new(ManualLoad::new(0.3));
        let harness = launch(
            config(2, 4),
            Arc::new(CrashingOperation::new(0)),
            load.clone(),
            FakeTransport::default(),
        );

        for tick in 0..10 {
            load.set(if tick % 2 == 0 { 0.7 } else { 0.3 });
            tokio::time::sleep(Duration::from_secs(60)).await;
        }

        let snapshot = *harness.snapshots.borrow();
        assert_eq!(snapshot.size, 2);
        assert_eq!(snapshot.spawned_total, 2);

        harness.shutdown.request_shutdown(ShutdownSignal::Graceful);
        harness.handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_alert_forwarded_verbatim() {
        let harness = launch(
            config(2, 2),
            Arc::new(CrashingOperation::new(0)),
            Arc::new(ManualLoad::new(0.5)),
            FakeTransport::default(),
        );

        tokio::time::sleep(Duration::from_secs(1)).await;
        let sent = harness.transport.sent_messages();
        assert_eq!(sent[0], "Flash loan bot started with 2 workers");
        assert_eq!(
            sent.iter()
                .filter(|m| *m == "Flash Loan successful: 0.05 ETH profit")
                .count(),
            2
        );

        harness.shutdown.request_shutdown(ShutdownSignal::Graceful);
        harness.handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_timeout_is_fatal() {
        let harness = launch(
            config(2, 4),
            Arc::new(CrashingOperation::new(0)),
            Arc::new(ManualLoad::new(0.5)),
            FakeTransport::failing(u32::MAX),
        );

        let err = harness.handle.await.unwrap().unwrap_err();
        assert!(matches!(err, FlashError::StartupTimeout(_)));
        assert!(err.is_startup_fatal());
        assert_eq!(harness.snapshots.borrow().spawned_total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_tears_down_in_order() {
        let harness = launch(
            config(2, 4),
            Arc::new(CrashingOperation::new(0)),
            Arc::new(ManualLoad::new(0.5)),
            FakeTransport::default(),
        );
        let mut phases = harness.shutdown.phase_receiver();

        tokio::time::sleep(Duration::from_secs(1)).await;
        harness.shutdown.request_shutdown(ShutdownSignal::Graceful);
        harness.handle.await.unwrap().unwrap();

        assert_eq!(*phases.borrow_and_update(), ShutdownPhase::Complete);
        assert!(harness.queue.is_closed());
        assert_eq!(harness.snapshots.borrow().size, 0);
        assert_eq!(harness.transport.stops.load(Ordering::SeqCst), 1);
        assert_eq!(
            harness.transport.sent_messages().last().map(String::as_str),
            Some("Flash loan bot shutting down")
        );
    }

    #[test]
    fn test_panic_message_extraction() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let err = runtime.block_on(async {
            tokio::spawn(async { panic!("boom {}", 7) }).await.unwrap_err()
        });
        assert_eq!(panic_message(err), "boom 7");
    }
}
