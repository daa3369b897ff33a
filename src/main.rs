mod main_runtime;

use clap::Parser;
use flashwatch::adapters::TelegramTransport;
use flashwatch::cli::{Cli, Commands};
use flashwatch::config::AppConfig;
use flashwatch::coordination::{install_signal_handlers, GracefulShutdown};
use flashwatch::error::{FlashError, Result};
use flashwatch::safety::{GasGuard, RateLimiter};
use flashwatch::services::PriceCache;
use flashwatch::strategy::PreflightOperation;
use flashwatch::supervisor::{AlertMessage, AlertSink, AlertSinkConfig, Supervisor};
use main_runtime::{init_logging, init_logging_simple};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command.clone().unwrap_or(Commands::Run) {
        Commands::Run => run_supervisor(&cli.config_dir).await,
        Commands::CheckConfig => check_config(&cli.config_dir),
        Commands::Notify { message } => notify(&cli.config_dir, message).await,
    };

    if let Err(e) = result {
        error!("{}", e);
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn load_config(config_dir: &str) -> Result<AppConfig> {
    let config = AppConfig::load_from(config_dir)?;
    config.validate()?;
    Ok(config)
}

async fn run_supervisor(config_dir: &str) -> Result<()> {
    let config = AppConfig::load_from(config_dir)?;
    init_logging(&config.logging);
    config.validate()?;
    let config = Arc::new(config);

    let shutdown = Arc::new(GracefulShutdown::new());
    install_signal_handlers(Arc::clone(&shutdown));

    let transport = Arc::new(TelegramTransport::from_config(&config)?);
    let sink = AlertSink::new(transport, AlertSinkConfig::from(&config.alerts));

    let rpc_url = config
        .rpc_url
        .as_deref()
        .filter(|url| !url.trim().is_empty())
        .ok_or(FlashError::MissingCredential("RPC_URL"))?;
    let provider = PreflightOperation::connect_provider(rpc_url).await?;

    let ceiling_wei = config
        .max_gas_price_wei()
        .ok_or_else(|| FlashError::InvalidConfig("MAX_GAS_PRICE is out of range".into()))?;
    let gas_guard = Arc::new(GasGuard::new(
        Arc::new(provider.clone()),
        ceiling_wei,
        config.gas.window_size,
    ));
    let rpc_limiter = Arc::new(RateLimiter::new(
        "rpc",
        Duration::from_millis(config.rpc.min_interval_ms),
    ));
    let operation = Arc::new(PreflightOperation::from_config(
        &config,
        provider,
        Arc::clone(&gas_guard),
        rpc_limiter,
    )?);
    let prices = Arc::new(PriceCache::from_config(&config.price));

    info!(
        "flashwatch {} starting (interval {:?}, gas ceiling {} gwei)",
        env!("CARGO_PKG_VERSION"),
        config.monitoring_interval(),
        config.max_gas_price
    );

    Supervisor::new(config, sink, operation, shutdown)
        .with_gas_guard(gas_guard)
        .with_price_cache(prices)
        .run()
        .await
}

fn check_config(config_dir: &str) -> Result<()> {
    init_logging_simple();
    let config = load_config(config_dir)?;
    let summary = toml::to_string_pretty(&config.summary())
        .map_err(|e| FlashError::Internal(format!("failed to render config: {e}")))?;

    println!("{}", summary);
    println!("Configuration OK");
    Ok(())
}

async fn notify(config_dir: &str, message: String) -> Result<()> {
    init_logging_simple();
    let config = load_config(config_dir)?;

    let transport = Arc::new(TelegramTransport::from_config(&config)?);
    let sink = AlertSink::new(transport, AlertSinkConfig::from(&config.alerts));
    let startup_timeout = Duration::from_secs(config.supervisor.startup_timeout_secs);

    let result = async {
        sink.start(startup_timeout).await?;
        sink.send(AlertMessage::stamped(message)).await
    }
    .await;
    sink.stop().await;

    result?;
    println!("Message delivered");
    Ok(())
}
