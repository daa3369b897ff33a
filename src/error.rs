use std::time::Duration;
use thiserror::Error;

/// Main error type for the flash-loan supervisor
#[derive(Error, Debug)]
pub enum FlashError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Startup errors (fatal, process exits non-zero)
    #[error("Missing credential: {0} is not defined")]
    MissingCredential(&'static str),

    #[error("Startup timed out after {0:?} waiting for the alert sink")]
    StartupTimeout(Duration),

    // Notification errors
    #[error("Notification transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Alert sink unavailable: reconnect attempts exhausted")]
    SinkUnavailable,

    #[error("Alert channel closed")]
    AlertChannelClosed,

    // Queue errors
    #[error("Job queue full (capacity {0})")]
    QueueFull(usize),

    #[error("Job queue closed")]
    QueueClosed,

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl FlashError {
    /// Errors that must stop the process at startup
    pub fn is_startup_fatal(&self) -> bool {
        matches!(
            self,
            FlashError::Config(_)
                | FlashError::InvalidConfig(_)
                | FlashError::MissingCredential(_)
                | FlashError::StartupTimeout(_)
        )
    }
}

/// Result type alias for FlashError
pub type Result<T> = std::result::Result<T, FlashError>;

/// Errors raised by the notification transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error {code}: {description}")]
    Api { code: i64, description: String },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Malformed response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            TransportError::Decode(err.to_string())
        } else {
            TransportError::Http(err.to_string())
        }
    }
}

/// Job-level errors raised while attempting the financial operation.
///
/// None of these crash a worker: the job is marked failed and the operator
/// is alerted.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("network error: {0}")]
    Network(String),

    #[error("threshold exceeded: {0}")]
    ThresholdExceeded(String),

    #[error("{0}")]
    Unknown(String),
}

impl ExecutionError {
    /// Classify a raw collaborator error message
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if lower.contains("network") {
            ExecutionError::Network(message)
        } else if lower.contains("gas price") {
            ExecutionError::ThresholdExceeded(message)
        } else {
            ExecutionError::Unknown(message)
        }
    }

    /// Recoverable errors are expected to clear on a later attempt
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ExecutionError::Network(_) | ExecutionError::ThresholdExceeded(_)
        )
    }
}

impl From<GasPriceExceeded> for ExecutionError {
    fn from(err: GasPriceExceeded) -> Self {
        ExecutionError::ThresholdExceeded(err.to_string())
    }
}

/// Raised by the gas guard when the rolling mean is above the ceiling
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("average gas price {average_wei} wei exceeds ceiling {ceiling_wei} wei")]
pub struct GasPriceExceeded {
    pub average_wei: u128,
    pub ceiling_wei: u128,
}
