//! Worker supervision
//!
//! - Alert sink: the single reconnecting connection to the operator's chat
//! - Channels: worker alert requests and lifecycle events
//! - Pool and scaling policy: the active worker set and how it is resized
//! - Runtime: the supervisor loop tying them together

pub mod alert_sink;
pub mod channel;
pub mod pool;
pub mod runtime;
pub mod scaling;

pub use alert_sink::{
    AlertMessage, AlertSink, AlertSinkConfig, AlertTransport, ConnectionState, SinkStats,
};
pub use channel::{
    alert_channel, event_channel, AlertReceiver, AlertSender, EventReceiver, EventSender,
    ExitReason, WorkerEvent, WorkerId, WorkerMessage,
};
pub use pool::{WorkerHandle, WorkerPool, WorkerStatus};
pub use runtime::{PoolSnapshot, Supervisor};
pub use scaling::{LoadSignal, ManualLoad, QueueBacklogLoad, ScalingAction, ScalingPolicy};
