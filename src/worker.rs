//! Flash-loan worker
//!
//! Each worker runs its own job producer (one job at start, then one per
//! monitoring interval) and competes with the other workers for jobs on the
//! shared queue. Job errors are reported to the operator and never end the
//! worker.

use crate::config::AppConfig;
use crate::coordination::ScheduledTask;
use crate::error::{ExecutionError, FlashError, Result};
use crate::queue::{Job, JobOutcome, JobPayload, JobQueue, JobTrigger};
use crate::services::PriceCache;
use crate::strategy::FlashLoanOperation;
use crate::supervisor::{AlertSender, EventSender, WorkerEvent, WorkerId};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Everything a worker shares with its siblings
#[derive(Clone)]
pub struct WorkerContext {
    pub queue: JobQueue,
    pub operation: Arc<dyn FlashLoanOperation>,
    pub alerts: AlertSender,
    pub config: Arc<AppConfig>,
    pub prices: Arc<PriceCache>,
}

pub struct Worker {
    id: WorkerId,
    ctx: WorkerContext,
    events: EventSender,
}

impl Worker {
    pub fn new(id: WorkerId, ctx: WorkerContext, events: EventSender) -> Self {
        Self { id, ctx, events }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Run until the queue is closed and drained.
    ///
    /// Aborting the task drops the producer with it, so a terminated worker
    /// leaves no timer behind.
    pub async fn run(self) -> Result<()> {
        self.events
            .send(WorkerEvent::Ready(self.id))
            .await
            .map_err(|_| FlashError::AlertChannelClosed)?;
        info!("{} started", self.id);

        let producer = self.spawn_producer();
        self.ctx.queue.consume(|job| self.process(job)).await;
        producer.cancel();
        info!("{} stopped: job queue closed", self.id);
        Ok(())
    }

    fn spawn_producer(&self) -> ScheduledTask {
        let queue = self.ctx.queue.clone();
        let payload = JobPayload::new(
            self.ctx.config.flash_loan_amount,
            Arc::clone(&self.ctx.config),
            Arc::clone(&self.ctx.prices),
        );
        let id = self.id;
        let mut trigger = JobTrigger::Startup;

        ScheduledTask::every(
            "job-producer",
            self.ctx.config.monitoring_interval(),
            move || {
                let job = Job::new(payload.clone(), trigger);
                trigger = JobTrigger::Scheduled;
                match queue.enqueue(job) {
                    Ok(job_id) => debug!("{} scheduled job {}", id, job_id),
                    Err(FlashError::QueueFull(capacity)) => {
                        warn!("{}: job queue full ({}), skipping tick", id, capacity)
                    }
                    Err(e) => debug!("{}: producer stopped enqueuing: {}", id, e),
                }
                std::future::ready(())
            },
        )
    }

    /// Execute one job and report its result
    pub async fn process(&self, job: Job) -> JobOutcome {
        debug!(
            "{} processing job {} ({}, amount {})",
            self.id, job.id, job.trigger, job.payload.amount
        );

        match self.ctx.operation.execute(&job.payload).await {
            Ok(outcome) if outcome.success => {
                let profit = outcome.profit.unwrap_or(Decimal::ZERO);
                info!("{} job {} succeeded: {} ETH profit", self.id, job.id, profit);
                self.alert(format!("Flash Loan successful: {} ETH profit", profit));
                JobOutcome::Completed
            }
            Ok(_) => {
                debug!("{} job {}: no profitable opportunity", self.id, job.id);
                JobOutcome::Completed
            }
            Err(e) => {
                match &e {
                    ExecutionError::Network(_) => warn!("{} job {}: {}", self.id, job.id, e),
                    ExecutionError::ThresholdExceeded(_) => {
                        warn!("{} job {} aborted: {}", self.id, job.id, e)
                    }
                    ExecutionError::Unknown(_) => error!("{} job {} failed: {}", self.id, job.id, e),
                }
                self.alert(format!("Flash Loan error: {}", e));
                JobOutcome::Failed(e.to_string())
            }
        }
    }

    /// Hand the alert to the supervisor without waiting for channel capacity
    fn alert(&self, message: String) {
        if let Err(e) = self.ctx.alerts.try_alert(message) {
            warn!("{} could not raise alert: {}", self.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Outcome;
    use crate::safety::{GasGuard, GasPriceSource, RateLimiter};
    use crate::services::price_cache::BNB_SYMBOL;
    use crate::strategy::operation::MockFlashLoanOperation;
    use crate::strategy::PreflightOperation;
    use crate::supervisor::{alert_channel, event_channel, AlertReceiver, WorkerMessage};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    const GWEI: u64 = 1_000_000_000;

    /// Gas price the test can move between jobs
    struct AdjustableGas(AtomicU64);

    #[async_trait]
    impl GasPriceSource for AdjustableGas {
        async fn gas_price(&self) -> std::result::Result<u128, ExecutionError> {
            Ok(self.0.load(Ordering::SeqCst) as u128)
        }
    }

    fn context(operation: MockFlashLoanOperation) -> (WorkerContext, AlertReceiver) {
        let (alerts, alerts_rx) = alert_channel(16);
        let config = AppConfig {
            flash_loan_amount: dec!(10),
            monitoring_interval: 60_000,
            ..AppConfig::default()
        };
        let ctx = WorkerContext {
            queue: JobQueue::new(16),
            operation: Arc::new(operation),
            alerts,
            config: Arc::new(config),
            prices: Arc::new(PriceCache::with_defaults()),
        };
        (ctx, alerts_rx)
    }

    fn job(ctx: &WorkerContext) -> Job {
        let payload = JobPayload::new(
            ctx.config.flash_loan_amount,
            Arc::clone(&ctx.config),
            Arc::clone(&ctx.prices),
        );
        Job::new(payload, JobTrigger::Manual)
    }

    fn alert_text(message: WorkerMessage) -> String {
        let WorkerMessage::SendTelegramAlert { message } = message;
        message
    }

    #[tokio::test]
    async fn test_successful_job_reports_profit() {
        let mut operation = MockFlashLoanOperation::new();
        operation
            .expect_execute()
            .withf(|payload| payload.amount == dec!(10))
            .times(1)
            .returning(|_| Ok(Outcome::succeeded(dec!(0.05))));
        let (ctx, mut alerts) = context(operation);
        let (events, _events_rx) = event_channel(4);
        let worker = Worker::new(WorkerId(1), ctx.clone(), events);

        let outcome = worker.process(job(&ctx)).await;

        assert_eq!(outcome, JobOutcome::Completed);
        let text = alert_text(alerts.try_recv().unwrap());
        assert!(text.contains("0.05"), "alert was {text:?}");
    }

    #[tokio::test]
    async fn test_unprofitable_job_is_silent() {
        let mut operation = MockFlashLoanOperation::new();
        operation
            .expect_execute()
            .returning(|_| Ok(Outcome::skipped()));
        let (ctx, mut alerts) = context(operation);
        let (events, _events_rx) = event_channel(4);
        let worker = Worker::new(WorkerId(1), ctx.clone(), events);

        assert_eq!(worker.process(job(&ctx)).await, JobOutcome::Completed);
        assert!(alerts.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_error_is_reported_and_job_failed() {
        let mut operation = MockFlashLoanOperation::new();
        operation
            .expect_execute()
            .returning(|_| Err(ExecutionError::classify("insufficient liquidity")));
        let (ctx, mut alerts) = context(operation);
        let (events, _events_rx) = event_channel(4);
        let worker = Worker::new(WorkerId(1), ctx.clone(), events);

        let outcome = worker.process(job(&ctx)).await;

        assert_eq!(
            outcome,
            JobOutcome::Failed("insufficient liquidity".to_string())
        );
        assert_eq!(
            alert_text(alerts.try_recv().unwrap()),
            "Flash Loan error: insufficient liquidity"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_trip_keeps_worker_alive() {
        let mut operation = MockFlashLoanOperation::new();
        let mut seq = mockall::Sequence::new();
        operation
            .expect_execute()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                Err(ExecutionError::ThresholdExceeded(
                    "average gas price 6000000000 wei exceeds ceiling 5000000000 wei".into(),
                ))
            });
        operation
            .expect_execute()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Outcome::succeeded(dec!(0.01))));
        let (ctx, mut alerts) = context(operation);
        let (events, mut events_rx) = event_channel(4);
        let worker = Worker::new(WorkerId(1), ctx.clone(), events);
        let queue = ctx.queue.clone();

        let handle = tokio::spawn(worker.run());
        assert_eq!(events_rx.recv().await, Some(WorkerEvent::Ready(WorkerId(1))));

        // startup job trips the guard, the next scheduled job succeeds
        let first = alert_text(alerts.recv().await.unwrap());
        assert!(first.starts_with("Flash Loan error: threshold exceeded"));
        tokio::time::sleep(Duration::from_secs(60)).await;
        let second = alert_text(alerts.recv().await.unwrap());
        assert!(second.contains("0.01"));
        assert!(!handle.is_finished());

        queue.close();
        handle.await.unwrap().unwrap();
        let stats = queue.stats();
        assert_eq!((stats.completed_total, stats.failed_total), (1, 1));
    }

    #[tokio::test]
    async fn test_run_fails_without_supervisor() {
        let (ctx, _alerts) = context(MockFlashLoanOperation::new());
        let (events, events_rx) = event_channel(1);
        drop(events_rx);

        let worker = Worker::new(WorkerId(9), ctx, events);
        assert!(matches!(
            worker.run().await,
            Err(FlashError::AlertChannelClosed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_alert_channel_does_not_stall_jobs() {
        let mut operation = MockFlashLoanOperation::new();
        operation
            .expect_execute()
            .times(5)
            .returning(|_| Ok(Outcome::succeeded(dec!(0.01))));
        let (mut ctx, _unused) = context(operation);
        // never drained: only the first alert fits
        let (alerts, _alerts_rx) = alert_channel(1);
        ctx.alerts = alerts;
        for _ in 0..4 {
            ctx.queue.enqueue(job(&ctx)).unwrap();
        }
        let (events, mut events_rx) = event_channel(4);
        let queue = ctx.queue.clone();

        let handle = tokio::spawn(Worker::new(WorkerId(3), ctx, events).run());
        assert_eq!(events_rx.recv().await, Some(WorkerEvent::Ready(WorkerId(3))));
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker stalled on a full alert channel")
            .unwrap()
            .unwrap();
        assert_eq!(queue.stats().completed_total, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gas_ceiling_trip_with_preflight_operation() {
        let gas = Arc::new(AdjustableGas(AtomicU64::new(6 * GWEI)));
        let guard = Arc::new(GasGuard::new(gas.clone(), 5 * GWEI as u128, 10));
        for _ in 0..10 {
            guard.sample().await.unwrap();
        }
        let provider = PreflightOperation::connect_provider("http://127.0.0.1:1")
            .await
            .unwrap();
        let limiter = Arc::new(RateLimiter::new("rpc", Duration::from_secs(1)));
        let operation = PreflightOperation::new(provider, None, guard.clone(), limiter);

        let prices = Arc::new(PriceCache::new(
            "http://127.0.0.1:1/ticker",
            Duration::from_secs(3_600),
        ));
        prices.insert(BNB_SYMBOL, dec!(600)).await;

        let (alerts, mut alerts_rx) = alert_channel(16);
        let ctx = WorkerContext {
            queue: JobQueue::new(16),
            operation: Arc::new(operation),
            alerts,
            config: Arc::new(AppConfig {
                monitoring_interval: 60_000,
                ..AppConfig::default()
            }),
            prices,
        };
        let queue = ctx.queue.clone();
        let (events, mut events_rx) = event_channel(4);

        let handle = tokio::spawn(Worker::new(WorkerId(4), ctx, events).run());
        assert_eq!(events_rx.recv().await, Some(WorkerEvent::Ready(WorkerId(4))));

        let first = alert_text(alerts_rx.recv().await.unwrap());
        assert!(
            first.starts_with("Flash Loan error: threshold exceeded"),
            "alert was {first:?}"
        );

        // gas falls back under the ceiling before the next scheduled job
        gas.0.store(GWEI, Ordering::SeqCst);
        for _ in 0..10 {
            guard.sample().await.unwrap();
        }
        tokio::time::sleep(Duration::from_secs(61)).await;

        assert!(!handle.is_finished());
        let stats = queue.stats();
        assert_eq!((stats.completed_total, stats.failed_total), (1, 1));
        // the passing preflight reports no profit, so nothing else is raised
        assert!(alerts_rx.try_recv().is_err());

        queue.close();
        handle.await.unwrap().unwrap();
    }
}
