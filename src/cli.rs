use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "flashwatch")]
#[command(version)]
#[command(about = "Flash-loan worker supervisor with Telegram alerting", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Directory containing default.toml
    #[arg(long, global = true, default_value = "config")]
    pub config_dir: String,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Start the supervisor and run until interrupted (default)
    Run,
    /// Load and validate configuration, then print a redacted summary
    CheckConfig,
    /// Deliver one message to the configured chat and exit
    Notify {
        /// Message text
        message: String,
    },
}
