//! Worker -> supervisor message passing
//!
//! Two bounded channels: alert requests (`WorkerMessage`) forwarded to the
//! alert sink, and lifecycle events (`WorkerEvent`) consumed by the
//! supervisor's pool bookkeeping.

use crate::error::{FlashError, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

/// Message a worker sends to the supervisor.
///
/// Serializes as `{"type":"sendTelegramAlert","message":"..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkerMessage {
    SendTelegramAlert { message: String },
}

impl WorkerMessage {
    pub fn alert(message: impl Into<String>) -> Self {
        WorkerMessage::SendTelegramAlert {
            message: message.into(),
        }
    }
}

pub type AlertReceiver = mpsc::Receiver<WorkerMessage>;

/// Worker side of the alert channel
#[derive(Debug, Clone)]
pub struct AlertSender {
    tx: mpsc::Sender<WorkerMessage>,
}

impl AlertSender {
    /// Request an operator alert; waits only for channel capacity
    pub async fn alert(&self, message: impl Into<String>) -> Result<()> {
        self.tx
            .send(WorkerMessage::alert(message))
            .await
            .map_err(|_| FlashError::AlertChannelClosed)
    }

    /// Request an alert without waiting; dropped with a warning when full
    pub fn try_alert(&self, message: impl Into<String>) -> Result<()> {
        match self.tx.try_send(WorkerMessage::alert(message)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(WorkerMessage::SendTelegramAlert { message })) => {
                warn!("Alert channel full, dropping alert: {}", message);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(FlashError::AlertChannelClosed),
        }
    }
}

pub fn alert_channel(capacity: usize) -> (AlertSender, AlertReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (AlertSender { tx }, rx)
}

/// Sequential worker identifier; higher ids were spawned later
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId(pub u64);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Why a worker task ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    Clean,
    Failed(String),
    Panicked(String),
    Terminated,
}

impl ExitReason {
    pub fn is_crash(&self) -> bool {
        matches!(self, ExitReason::Failed(_) | ExitReason::Panicked(_))
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::Clean => write!(f, "exited cleanly"),
            ExitReason::Failed(e) => write!(f, "failed: {}", e),
            ExitReason::Panicked(e) => write!(f, "panicked: {}", e),
            ExitReason::Terminated => write!(f, "terminated"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Ready(WorkerId),
    Exited { id: WorkerId, reason: ExitReason },
}

pub type EventSender = mpsc::Sender<WorkerEvent>;
pub type EventReceiver = mpsc::Receiver<WorkerEvent>;

pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    mpsc::channel(capacity.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_message_wire_shape() {
        let msg = WorkerMessage::alert("Flash Loan error: boom");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "sendTelegramAlert", "message": "Flash Loan error: boom"})
        );

        let parsed: WorkerMessage =
            serde_json::from_str(r#"{"type":"sendTelegramAlert","message":"hi"}"#).unwrap();
        assert_eq!(parsed, WorkerMessage::alert("hi"));
    }

    #[tokio::test]
    async fn test_alerts_arrive_in_order() {
        let (tx, mut rx) = alert_channel(4);
        tx.alert("one").await.unwrap();
        tx.alert("two").await.unwrap();

        assert_eq!(rx.recv().await, Some(WorkerMessage::alert("one")));
        assert_eq!(rx.recv().await, Some(WorkerMessage::alert("two")));
    }

    #[tokio::test]
    async fn test_closed_channel() {
        let (tx, rx) = alert_channel(1);
        drop(rx);
        assert!(matches!(
            tx.alert("x").await,
            Err(FlashError::AlertChannelClosed)
        ));
        assert!(matches!(
            tx.try_alert("x"),
            Err(FlashError::AlertChannelClosed)
        ));
    }

    #[test]
    fn test_try_alert_drops_when_full() {
        let (tx, mut rx) = alert_channel(1);
        tx.try_alert("kept").unwrap();
        tx.try_alert("dropped").unwrap();

        assert_eq!(rx.try_recv().unwrap(), WorkerMessage::alert("kept"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_worker_ids_order_by_spawn() {
        assert!(WorkerId(3) > WorkerId(2));
        assert_eq!(WorkerId(7).to_string(), "worker-7");
        assert!(ExitReason::Panicked("x".into()).is_crash());
        assert!(!ExitReason::Terminated.is_crash());
    }
}
