use crate::error::{FlashError, Result};
use config::{Config, ConfigError, Environment, File};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Environment variable naming an already-decrypted secure config file
pub const SECURE_CONFIG_ENV: &str = "SECURE_CONFIG_PATH";

/// String secret that never prints and is wiped on drop
#[derive(Clone, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Main configuration structure.
///
/// Top-level fields map one-to-one onto the flat environment variables the
/// bot has always been deployed with (`RPC_URL`, `TELEGRAM_CHAT_ID`, ...).
/// Tuning sections are overridden with `FLASHWATCH_<SECTION>__<KEY>`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub rpc_url: Option<String>,
    #[serde(default)]
    pub private_key: Option<Secret>,
    #[serde(default)]
    pub flashloan_contract: Option<String>,
    /// Gas price ceiling in gwei
    #[serde(default = "default_max_gas_price")]
    pub max_gas_price: Decimal,
    /// Loan amount in whole tokens (18 decimals on chain)
    #[serde(default = "default_flash_loan_amount")]
    pub flash_loan_amount: Decimal,
    /// Job producer interval in milliseconds
    #[serde(default = "default_monitoring_interval")]
    pub monitoring_interval: u64,
    /// Health endpoint port (served outside this crate)
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub telegram_bot_token: Option<Secret>,
    #[serde(default)]
    pub telegram_chat_id: Option<String>,

    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub gas: GasConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub price: PriceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_max_gas_price() -> Decimal {
    Decimal::from(20)
}

fn default_flash_loan_amount() -> Decimal {
    Decimal::ONE
}

fn default_monitoring_interval() -> u64 {
    60_000
}

fn default_port() -> u16 {
    3000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Workers spawned at startup
    pub initial_workers: usize,
    /// Pool floor; crashes and scale-down never go below it
    pub min_workers: usize,
    /// Pool ceiling for scale-up
    pub max_workers: usize,
    /// Seconds between scaling ticks
    pub scale_interval_secs: u64,
    /// Load above which one worker is added per tick
    pub high_watermark: f64,
    /// Load below which one worker is removed per tick
    pub low_watermark: f64,
    /// Maximum wait for the alert sink to start polling
    pub startup_timeout_secs: u64,
    /// Pending jobs per worker considered full load
    pub target_backlog_per_worker: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        Self {
            initial_workers: 2,
            min_workers: 2,
            max_workers: cpus.max(2),
            scale_interval_secs: 60,
            high_watermark: 0.75,
            low_watermark: 0.25,
            startup_timeout_secs: 30,
            target_backlog_per_worker: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AlertsConfig {
    /// Telegram Bot API base URL
    pub api_url: String,
    /// Reconnect attempts before the sink gives up for good
    pub max_reconnect_attempts: u32,
    /// First backoff delay; doubles per attempt
    pub base_backoff_ms: u64,
    /// Timeout for a single connect attempt
    pub connect_timeout_secs: u64,
    /// Long-poll timeout passed to getUpdates
    pub poll_timeout_secs: u64,
    /// Worker -> supervisor alert channel capacity
    pub channel_capacity: usize,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.telegram.org".to_string(),
            max_reconnect_attempts: 10,
            base_backoff_ms: 1_000,
            connect_timeout_secs: 30,
            poll_timeout_secs: 25,
            channel_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GasConfig {
    pub sample_interval_secs: u64,
    pub window_size: usize,
}

impl Default for GasConfig {
    fn default() -> Self {
        Self {
            sample_interval_secs: 6,
            window_size: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueConfig {
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Minimum spacing between rate-limited RPC calls
    pub min_interval_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PriceConfig {
    pub ttl_secs: u64,
    pub endpoint: String,
}

impl Default for PriceConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 30,
            endpoint: "https://api.binance.com/api/v3/ticker/price".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Daily rolling log files are written here when set
    #[serde(default)]
    pub directory: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            directory: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            rpc_url: None,
            private_key: None,
            flashloan_contract: None,
            max_gas_price: default_max_gas_price(),
            flash_loan_amount: default_flash_loan_amount(),
            monitoring_interval: default_monitoring_interval(),
            port: default_port(),
            telegram_bot_token: None,
            telegram_chat_id: None,
            supervisor: SupervisorConfig::default(),
            alerts: AlertsConfig::default(),
            gas: GasConfig::default(),
            queue: QueueConfig::default(),
            rpc: RpcConfig::default(),
            price: PriceConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Redacted view printed by `check-config`
#[derive(Debug, Serialize)]
pub struct ConfigSummary {
    pub rpc_url: Option<String>,
    pub private_key: &'static str,
    pub flashloan_contract: Option<String>,
    pub max_gas_price_gwei: String,
    pub flash_loan_amount: String,
    pub monitoring_interval_ms: u64,
    pub port: u16,
    pub telegram_bot_token: &'static str,
    pub telegram_chat_id: Option<String>,
    pub supervisor: SupervisorConfig,
    pub alerts: AlertsConfig,
    pub gas: GasConfig,
    pub queue: QueueConfig,
    pub rpc: RpcConfig,
    pub price: PriceConfig,
}

impl AppConfig {
    /// Load configuration from files and the process environment
    pub fn load() -> std::result::Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory and the process environment
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> std::result::Result<Self, ConfigError> {
        Self::load_with_env(config_dir, None)
    }

    /// Load configuration with an explicit environment map.
    ///
    /// `None` reads the process environment.
    pub fn load_with_env<P: AsRef<Path>>(
        config_dir: P,
        env: Option<HashMap<String, String>>,
    ) -> std::result::Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let secure_path = match &env {
            Some(vars) => vars.get(SECURE_CONFIG_ENV).cloned(),
            None => std::env::var(SECURE_CONFIG_ENV).ok(),
        }
        .filter(|p| !p.trim().is_empty());

        let mut builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .add_source(File::from(config_dir.join("default.toml")).required(false));

        if let Some(path) = secure_path {
            builder = builder.add_source(File::from(PathBuf::from(path)).required(true));
        }

        let builder = builder
            // Flat deployment variables (RPC_URL, TELEGRAM_CHAT_ID, ...)
            .add_source(Environment::default().source(env.clone()))
            // Tuning overrides (FLASHWATCH_SUPERVISOR__MAX_WORKERS, ...)
            .add_source(
                Environment::with_prefix("FLASHWATCH")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values.
    ///
    /// Missing notification credentials are reported on their own so the
    /// caller can treat them as a fatal startup error.
    pub fn validate(&self) -> Result<()> {
        if self
            .telegram_bot_token
            .as_ref()
            .map_or(true, Secret::is_empty)
        {
            return Err(FlashError::MissingCredential("TELEGRAM_BOT_TOKEN"));
        }
        if self
            .telegram_chat_id
            .as_deref()
            .map_or(true, |id| id.trim().is_empty())
        {
            return Err(FlashError::MissingCredential("TELEGRAM_CHAT_ID"));
        }

        let mut errors = Vec::new();

        if self.monitoring_interval == 0 {
            errors.push("MONITORING_INTERVAL must be greater than 0".to_string());
        }
        if self.max_gas_price <= Decimal::ZERO {
            errors.push("MAX_GAS_PRICE must be positive".to_string());
        }
        if self.flash_loan_amount <= Decimal::ZERO {
            errors.push("FLASH_LOAN_AMOUNT must be positive".to_string());
        }

        let sup = &self.supervisor;
        if !(0.0..=1.0).contains(&sup.low_watermark)
            || !(0.0..=1.0).contains(&sup.high_watermark)
            || sup.low_watermark >= sup.high_watermark
        {
            errors.push(format!(
                "watermarks must satisfy 0 <= low < high <= 1 (low={}, high={})",
                sup.low_watermark, sup.high_watermark
            ));
        }
        if sup.min_workers == 0 {
            errors.push("supervisor.min_workers must be at least 1".to_string());
        }
        if sup.min_workers > sup.max_workers {
            errors.push(format!(
                "supervisor.min_workers ({}) exceeds max_workers ({})",
                sup.min_workers, sup.max_workers
            ));
        }
        if sup.initial_workers < sup.min_workers || sup.initial_workers > sup.max_workers {
            errors.push(format!(
                "supervisor.initial_workers ({}) must be within [{}, {}]",
                sup.initial_workers, sup.min_workers, sup.max_workers
            ));
        }
        if sup.scale_interval_secs == 0 {
            errors.push("supervisor.scale_interval_secs must be greater than 0".to_string());
        }
        if sup.target_backlog_per_worker == 0 {
            errors.push("supervisor.target_backlog_per_worker must be at least 1".to_string());
        }

        if self.alerts.max_reconnect_attempts == 0 {
            errors.push("alerts.max_reconnect_attempts must be at least 1".to_string());
        }
        if self.alerts.channel_capacity == 0 {
            errors.push("alerts.channel_capacity must be at least 1".to_string());
        }
        if self.gas.window_size == 0 {
            errors.push("gas.window_size must be at least 1".to_string());
        }
        if self.gas.sample_interval_secs == 0 {
            errors.push("gas.sample_interval_secs must be greater than 0".to_string());
        }
        if self.queue.capacity == 0 {
            errors.push("queue.capacity must be at least 1".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(FlashError::InvalidConfig(errors.join("; ")))
        }
    }

    pub fn monitoring_interval(&self) -> Duration {
        Duration::from_millis(self.monitoring_interval)
    }

    /// Gas ceiling converted from gwei to wei
    pub fn max_gas_price_wei(&self) -> Option<u128> {
        (self.max_gas_price * Decimal::from(1_000_000_000u64))
            .trunc()
            .to_u128()
    }

    pub fn summary(&self) -> ConfigSummary {
        fn mask(secret: &Option<Secret>) -> &'static str {
            match secret {
                Some(s) if !s.is_empty() => "***",
                _ => "<unset>",
            }
        }

        ConfigSummary {
            rpc_url: self.rpc_url.clone(),
            private_key: mask(&self.private_key),
            flashloan_contract: self.flashloan_contract.clone(),
            max_gas_price_gwei: self.max_gas_price.to_string(),
            flash_loan_amount: self.flash_loan_amount.to_string(),
            monitoring_interval_ms: self.monitoring_interval,
            port: self.port,
            telegram_bot_token: mask(&self.telegram_bot_token),
            telegram_chat_id: self.telegram_chat_id.clone(),
            supervisor: self.supervisor.clone(),
            alerts: self.alerts.clone(),
            gas: self.gas.clone(),
            queue: self.queue.clone(),
            rpc: self.rpc.clone(),
            price: self.price.clone(),
        }
    }
}
