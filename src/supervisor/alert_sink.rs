//! Reconnecting alert sink
//!
//! Owns the single connection to the notification transport. Connection
//! failures (on connect, while polling, or on send) move the sink through an
//! exponential backoff; once the attempt budget is spent the sink is dead and
//! every later `send` fails fast.
//!
//! ```text
//! Disconnected -> Connecting -> Polling <-> Backoff(n) -> Dead
//! ```

use crate::config::AlertsConfig;
use crate::coordination::ScheduledTask;
use crate::error::{FlashError, Result, TransportError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// A push-notification transport.
///
/// `start` opens the connection and confirms it is usable, `poll` blocks
/// until the next inbound batch (an `Err` means the connection dropped).
#[async_trait]
pub trait AlertTransport: Send + Sync {
    fn name(&self) -> &str;
    async fn start(&self) -> std::result::Result<(), TransportError>;
    async fn poll(&self) -> std::result::Result<(), TransportError>;
    async fn send_text(&self, text: &str) -> std::result::Result<(), TransportError>;
    async fn stop(&self) -> std::result::Result<(), TransportError>;
}

/// Operator notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertMessage {
    pub text: String,
    pub sent_at: Option<DateTime<Utc>>,
}

impl AlertMessage {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            sent_at: None,
        }
    }

    pub fn stamped(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            sent_at: Some(Utc::now()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Polling,
    /// Waiting before reconnect attempt `n` (zero based)
    Backoff(u32),
    /// Reconnect attempts exhausted; no further automatic attempts
    Dead,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Polling => write!(f, "polling"),
            ConnectionState::Backoff(n) => write!(f, "backoff({})", n),
            ConnectionState::Dead => write!(f, "dead"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AlertSinkConfig {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub connect_timeout: Duration,
}

impl Default for AlertSinkConfig {
    fn default() -> Self {
        Self::from(&AlertsConfig::default())
    }
}

impl From<&AlertsConfig> for AlertSinkConfig {
    fn from(config: &AlertsConfig) -> Self {
        Self {
            max_attempts: config.max_reconnect_attempts,
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
        }
    }
}

impl AlertSinkConfig {
    /// Delay before reconnect attempt `attempt`: `base * 2^attempt`
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_backoff.saturating_mul(factor)
    }
}

#[derive(Default)]
struct SinkInner {
    /// Reconnect attempts since the last successful connect
    attempts: u32,
    /// A reconnect loop is running
    reconnecting: bool,
    /// The transport was started and has not been stopped since
    connected: bool,
    stopped: bool,
    poll_task: Option<ScheduledTask>,
    reconnect_task: Option<ScheduledTask>,
}

/// Delivery counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkStats {
    pub state: ConnectionState,
    pub attempts: u32,
    pub sent: u64,
    pub dropped: u64,
}

pub struct AlertSink {
    transport: Arc<dyn AlertTransport>,
    config: AlertSinkConfig,
    state_tx: watch::Sender<ConnectionState>,
    inner: Mutex<SinkInner>,
    /// Serializes connect attempts so concurrent callers never open two connections
    connect_lock: tokio::sync::Mutex<()>,
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl AlertSink {
    pub fn new(transport: Arc<dyn AlertTransport>, config: AlertSinkConfig) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            transport,
            config,
            state_tx,
            inner: Mutex::new(SinkInner::default()),
            connect_lock: tokio::sync::Mutex::new(()),
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    fn lock_inner(&self) -> MutexGuard<'_, SinkInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!("Alert sink {}: {} -> {}", self.transport.name(), previous, state);
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.lock_inner().connected
    }

    pub fn stats(&self) -> SinkStats {
        SinkStats {
            state: self.state(),
            attempts: self.lock_inner().attempts,
            sent: self.sent.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Connect and wait until the sink is polling.
    ///
    /// A failed first connect enters the normal backoff path; the caller only
    /// sees an error if polling is not reached within `startup_timeout`. The
    /// first connect attempt counts against that timeout too.
    pub async fn start(self: &Arc<Self>, startup_timeout: Duration) -> Result<()> {
        let mut state_rx = self.subscribe();

        let wait_for_polling = async {
            if let Err(e) = self.connect().await {
                warn!("Initial alert sink connect failed: {}", e);
            }
            loop {
                match *state_rx.borrow_and_update() {
                    ConnectionState::Polling => return Ok(()),
                    ConnectionState::Dead => return Err(FlashError::SinkUnavailable),
                    _ => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(FlashError::SinkUnavailable);
                }
            }
        };

        match tokio::time::timeout(startup_timeout, wait_for_polling).await {
            Ok(result) => result,
            Err(_) => Err(FlashError::StartupTimeout(startup_timeout)),
        }
    }

    /// Connect now; on failure the backoff loop takes over
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        match self.try_connect().await {
            Ok(()) => Ok(()),
            Err(FlashError::SinkUnavailable) => Err(FlashError::SinkUnavailable),
            Err(e) => {
                self.on_failure(&e);
                Err(e)
            }
        }
    }

    /// Deliver one message. A failed delivery is not retried.
    pub async fn send(self: &Arc<Self>, message: AlertMessage) -> Result<()> {
        match self.state() {
            ConnectionState::Dead => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                error!("Alert sink unavailable, dropping alert: {}", message.text);
                return Err(FlashError::SinkUnavailable);
            }
            ConnectionState::Polling => {}
            _ => {
                if let Err(e) = self.connect().await {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!("Alert dropped, sink not connected ({}): {}", e, message.text);
                    return Err(e);
                }
            }
        }

        match self.transport.send_text(&message.text).await {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                match message.sent_at {
                    Some(at) => debug!("Alert delivered (raised {})", at),
                    None => debug!("Alert delivered"),
                }
                Ok(())
            }
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                let err = FlashError::Transport(e);
                warn!("Alert delivery failed, message dropped: {}", err);
                self.on_failure(&err);
                Err(err)
            }
        }
    }

    /// Release the connection and cancel any pending reconnect. Idempotent.
    pub async fn stop(&self) {
        let reconnect_task = {
            let mut inner = self.lock_inner();
            inner.stopped = true;
            inner.reconnecting = false;
            inner.reconnect_task.take()
        };
        if let Some(task) = reconnect_task {
            task.cancel();
        }

        // Wait out a connect already in flight so its connection is released too
        let _connecting = self.connect_lock.lock().await;
        self.release_connection().await;

        let _inner = self.lock_inner();
        if self.state() != ConnectionState::Dead {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    async fn try_connect(self: &Arc<Self>) -> Result<()> {
        let _connecting = self.connect_lock.lock().await;

        if self.lock_inner().stopped {
            return Err(FlashError::SinkUnavailable);
        }
        match self.state() {
            ConnectionState::Polling => return Ok(()),
            ConnectionState::Dead => return Err(FlashError::SinkUnavailable),
            _ => {}
        }

        self.release_connection().await;
        self.set_state(ConnectionState::Connecting);

        let timeout = self.config.connect_timeout;
        match tokio::time::timeout(timeout, self.transport.start()).await {
            Ok(Ok(())) => {
                let mut inner = self.lock_inner();
                inner.connected = true;
                inner.attempts = 0;
                self.set_state(ConnectionState::Polling);
                inner.poll_task = Some(self.spawn_poll_loop());
                info!("Alert sink {} connected", self.transport.name());
                Ok(())
            }
            Ok(Err(e)) => Err(FlashError::Transport(e)),
            Err(_) => Err(FlashError::Transport(TransportError::Timeout(timeout))),
        }
    }

    fn spawn_poll_loop(self: &Arc<Self>) -> ScheduledTask {
        let sink: Weak<Self> = Arc::downgrade(self);
        ScheduledTask::spawn("alert-sink-poll", async move {
            loop {
                let Some(sink) = sink.upgrade() else {
                    return;
                };
                if let Err(e) = sink.transport.poll().await {
                    sink.on_failure(&FlashError::Transport(e));
                    return;
                }
            }
        })
    }

    /// Record a transport failure and make sure a reconnect loop is running
    fn on_failure(self: &Arc<Self>, err: &FlashError) {
        let mut inner = self.lock_inner();
        if inner.stopped || self.state() == ConnectionState::Dead {
            return;
        }

        warn!("Alert sink {} failure: {}", self.transport.name(), err);
        self.set_state(ConnectionState::Disconnected);

        if inner.reconnecting {
            return;
        }
        inner.reconnecting = true;
        let sink = Arc::clone(self);
        inner.reconnect_task = Some(ScheduledTask::spawn(
            "alert-sink-reconnect",
            async move { sink.reconnect_loop().await },
        ));
    }

    async fn reconnect_loop(self: Arc<Self>) {
        loop {
            self.release_connection().await;

            let (attempt, delay) = {
                let mut inner = self.lock_inner();
                if inner.stopped {
                    inner.reconnecting = false;
                    return;
                }
                if inner.attempts >= self.config.max_attempts {
                    inner.reconnecting = false;
                    self.set_state(ConnectionState::Dead);
                    error!(
                        "Alert sink {} gave up after {} reconnect attempts; alerts will be dropped",
                        self.transport.name(),
                        inner.attempts
                    );
                    return;
                }
                let attempt = inner.attempts;
                inner.attempts += 1;
                self.set_state(ConnectionState::Backoff(attempt));
                (attempt, self.config.backoff_delay(attempt))
            };

            info!(
                "Reconnecting alert sink in {:?} (attempt {}/{})",
                delay,
                attempt + 1,
                self.config.max_attempts
            );
            tokio::time::sleep(delay).await;

            match self.try_connect().await {
                Ok(()) => {
                    let mut inner = self.lock_inner();
                    // The new connection may already have dropped again
                    if self.state() == ConnectionState::Polling {
                        inner.reconnecting = false;
                        return;
                    }
                }
                Err(FlashError::SinkUnavailable) => {
                    self.lock_inner().reconnecting = false;
                    return;
                }
                Err(e) => warn!("Alert sink reconnect failed: {}", e),
            }
        }
    }

    /// Cancel polling and stop the transport. The handle is cleared even if
    /// the transport's stop call fails.
    async fn release_connection(&self) {
        let (poll_task, was_connected) = {
            let mut inner = self.lock_inner();
            (
                inner.poll_task.take(),
                std::mem::replace(&mut inner.connected, false),
            )
        };
        if let Some(task) = poll_task {
            task.cancel();
        }
        if was_connected {
            if let Err(e) = self.transport.stop().await {
                warn!("Alert sink {} stop failed: {}", self.transport.name(), e);
            }
        }
    }
}

impl std::fmt::Debug for AlertSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertSink")
            .field("transport", &self.transport.name())
            .field("state", &self.state())
            .finish()
    }
}
