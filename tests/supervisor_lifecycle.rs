use async_trait::async_trait;
use flashwatch::config::{AlertsConfig, AppConfig, SupervisorConfig};
use flashwatch::coordination::{GracefulShutdown, ShutdownPhase, ShutdownSignal};
use flashwatch::error::{ExecutionError, FlashError, TransportError};
use flashwatch::queue::{Job, JobOutcome, JobPayload, JobQueue, JobTrigger, Outcome};
use flashwatch::safety::{GasGuard, GasPriceSource, GasPriceWindow};
use flashwatch::services::PriceCache;
use flashwatch::strategy::FlashLoanOperation;
use flashwatch::supervisor::{
    AlertSink, AlertSinkConfig, AlertTransport, ConnectionState, Supervisor, WorkerMessage,
};
use rust_decimal_macros::dec;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Records delivered messages; optionally refuses every connection
#[derive(Default)]
struct RecordingTransport {
    refuse: bool,
    starts: AtomicUsize,
    sent: Mutex<Vec<String>>,
}

impl RecordingTransport {
    fn refusing() -> Self {
        Self {
            refuse: true,
            ..Self::default()
        }
    }

    fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl AlertTransport for RecordingTransport {
    fn name(&self) -> &str {
        "recording"
    }

    async fn start(&self) -> Result<(), TransportError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.refuse {
            return Err(TransportError::Http("connection refused".into()));
        }
        Ok(())
    }

    async fn poll(&self) -> Result<(), TransportError> {
        std::future::pending().await
    }

    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn stop(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

struct ProfitableOperation;

#[async_trait]
impl FlashLoanOperation for ProfitableOperation {
    async fn execute(&self, _payload: &JobPayload) -> Result<Outcome, ExecutionError> {
        Ok(Outcome::succeeded(dec!(0.02)))
    }
}

struct FixedGas(u128);

#[async_trait]
impl GasPriceSource for FixedGas {
    async fn gas_price(&self) -> Result<u128, ExecutionError> {
        Ok(self.0)
    }
}

fn two_worker_config() -> Arc<AppConfig> {
    Arc::new(AppConfig {
        supervisor: SupervisorConfig {
            initial_workers: 2,
            min_workers: 2,
            max_workers: 2,
            ..SupervisorConfig::default()
        },
        ..AppConfig::default()
    })
}

fn payload() -> JobPayload {
    JobPayload::new(
        dec!(1),
        Arc::new(AppConfig::default()),
        Arc::new(PriceCache::with_defaults()),
    )
}

#[tokio::test(start_paused = true)]
async fn supervisor_reports_profits_and_announces_shutdown() {
    let config = two_worker_config();
    let transport = Arc::new(RecordingTransport::default());
    let sink = AlertSink::new(transport.clone(), AlertSinkConfig::from(&config.alerts));
    let shutdown = Arc::new(GracefulShutdown::new());
    let supervisor = Supervisor::new(
        config,
        sink.clone(),
        Arc::new(ProfitableOperation),
        shutdown.clone(),
    );
    let snapshots = supervisor.subscribe();
    let handle = tokio::spawn(supervisor.run());

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(snapshots.borrow().size, 2);
    assert_eq!(sink.state(), ConnectionState::Polling);

    shutdown.request_shutdown(ShutdownSignal::Graceful);
    tokio_test::assert_ok!(handle.await.unwrap());

    let sent = transport.sent();
    assert_eq!(
        sent.first().map(String::as_str),
        Some("Flash loan bot started with 2 workers")
    );
    assert_eq!(sent.last().map(String::as_str), Some("Flash loan bot shutting down"));
    let profits = sent
        .iter()
        .filter(|m| m.as_str() == "Flash Loan successful: 0.02 ETH profit")
        .count();
    assert_eq!(profits, 2, "one startup job per worker, got {sent:?}");
    assert_eq!(shutdown.current_phase(), ShutdownPhase::Complete);
    assert_ne!(sink.state(), ConnectionState::Polling);
}

#[tokio::test(start_paused = true)]
async fn supervisor_fails_when_sink_never_connects() {
    let config = Arc::new(AppConfig {
        alerts: AlertsConfig {
            max_reconnect_attempts: 3,
            ..AlertsConfig::default()
        },
        supervisor: SupervisorConfig {
            startup_timeout_secs: 3_600,
            ..SupervisorConfig::default()
        },
        ..AppConfig::default()
    });
    let transport = Arc::new(RecordingTransport::refusing());
    let sink = AlertSink::new(transport.clone(), AlertSinkConfig::from(&config.alerts));
    let shutdown = Arc::new(GracefulShutdown::new());
    let supervisor = Supervisor::new(config, sink.clone(), Arc::new(ProfitableOperation), shutdown);

    let result = supervisor.run().await;

    assert!(matches!(result, Err(FlashError::SinkUnavailable)), "got {result:?}");
    // first connect plus three reconnects
    assert_eq!(transport.starts.load(Ordering::SeqCst), 4);
    assert_eq!(sink.state(), ConnectionState::Dead);
    assert!(transport.sent().is_empty());
}

#[tokio::test]
async fn gas_window_ceiling_is_inclusive() {
    let mut window = GasPriceWindow::new(10);
    for price in [4_000_000_000u128, 6_000_000_000] {
        window.record(price);
    }

    assert_eq!(window.check_ceiling(5_000_000_000).unwrap(), 5_000_000_000);
    assert!(window.check_ceiling(4_999_999_999).is_err());

    let guard = GasGuard::new(Arc::new(FixedGas(5_000_000_001)), 5_000_000_000, 10);
    assert!(matches!(
        guard.check().await,
        Err(ExecutionError::ThresholdExceeded(_))
    ));
}

#[tokio::test]
async fn queued_jobs_go_to_exactly_one_consumer() {
    let queue = JobQueue::new(64);
    let mut expected = HashSet::new();
    for _ in 0..30 {
        expected.insert(queue.enqueue(Job::new(payload(), JobTrigger::Manual)).unwrap());
    }
    queue.close();

    let consumers = (0..3).map(|_| {
        let queue = queue.clone();
        async move {
            let mut seen = Vec::new();
            while let Some(job) = queue.dequeue().await {
                seen.push(job.id);
                queue.record_outcome(&JobOutcome::Completed);
                tokio::task::yield_now().await;
            }
            seen
        }
    });
    let seen: Vec<_> = futures::future::join_all(consumers)
        .await
        .into_iter()
        .flatten()
        .collect();

    assert_eq!(seen.len(), 30);
    assert_eq!(seen.into_iter().collect::<HashSet<_>>(), expected);
    assert_eq!(queue.stats().completed_total, 30);
}

#[test]
fn alert_request_wire_shape() {
    let json = serde_json::to_value(WorkerMessage::alert("Flash Loan error: reverted")).unwrap();
    assert_eq!(
        json,
        serde_json::json!({"type": "sendTelegramAlert", "message": "Flash Loan error: reverted"})
    );
}
