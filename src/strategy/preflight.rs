//! Pre-execution checks for a flash-loan attempt
//!
//! Runs the gas guard, reads the wallet balance over RPC (rate limited) and
//! prices the attempt with the cached BNB quote. No transaction is built or
//! signed, so every attempt reports `success = false`.

use crate::config::AppConfig;
use crate::error::{ExecutionError, FlashError, Result};
use crate::queue::{JobPayload, Outcome};
use crate::safety::{GasGuard, RateLimiter};
use crate::strategy::FlashLoanOperation;
use alloy::primitives::{Address, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

/// Wei per ether
const ETHER_DECIMALS: u32 = 18;

pub struct PreflightOperation {
    provider: DynProvider,
    wallet: Option<Address>,
    gas_guard: Arc<GasGuard>,
    rpc_limiter: Arc<RateLimiter>,
}

impl PreflightOperation {
    pub fn new(
        provider: DynProvider,
        wallet: Option<Address>,
        gas_guard: Arc<GasGuard>,
        rpc_limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            provider,
            wallet,
            gas_guard,
            rpc_limiter,
        }
    }

    /// HTTP provider for `rpc_url`
    pub async fn connect_provider(rpc_url: &str) -> Result<DynProvider> {
        let provider = ProviderBuilder::new()
            .connect(rpc_url)
            .await
            .map_err(|e| FlashError::InvalidConfig(format!("failed to connect to RPC: {e}")))?;
        Ok(provider.erased())
    }

    /// Build from configuration, sharing the provider with the gas guard
    pub fn from_config(
        config: &AppConfig,
        provider: DynProvider,
        gas_guard: Arc<GasGuard>,
        rpc_limiter: Arc<RateLimiter>,
    ) -> Result<Self> {
        let wallet = match &config.private_key {
            Some(key) if !key.is_empty() => Some(wallet_address(key.expose())?),
            _ => {
                debug!("No PRIVATE_KEY configured, skipping wallet balance checks");
                None
            }
        };
        if let Some(contract) = &config.flashloan_contract {
            debug!("Flash-loan contract: {}", contract);
        }

        Ok(Self::new(provider, wallet, gas_guard, rpc_limiter))
    }

    pub fn wallet(&self) -> Option<Address> {
        self.wallet
    }

    async fn wallet_balance(&self, wallet: Address) -> std::result::Result<Decimal, ExecutionError> {
        let wei = self
            .rpc_limiter
            .run(|| async { self.provider.get_balance(wallet).await })
            .await
            .map_err(|e| ExecutionError::Network(format!("balance request failed: {e}")))?;
        Ok(wei_to_ether(wei))
    }
}

#[async_trait]
impl FlashLoanOperation for PreflightOperation {
    async fn execute(&self, payload: &JobPayload) -> std::result::Result<Outcome, ExecutionError> {
        let average_gas = self.gas_guard.check().await?;

        let balance = match self.wallet {
            Some(wallet) => Some(self.wallet_balance(wallet).await?),
            None => None,
        };

        let bnb_price = payload.prices.bnb_price().await;

        info!(
            "Preflight ok: amount={} avg_gas={} wei balance={} BNB/USDT={}",
            payload.amount,
            average_gas,
            balance.map_or_else(|| "n/a".to_string(), |b| b.to_string()),
            bnb_price
        );

        Ok(Outcome::skipped())
    }
}

/// Address of the account behind a hex private key
pub fn wallet_address(private_key: &str) -> Result<Address> {
    let hex = private_key.trim().trim_start_matches("0x");
    let signer = PrivateKeySigner::from_str(hex)
        .map_err(|_| FlashError::InvalidConfig("PRIVATE_KEY is not a valid private key".into()))?;
    Ok(signer.address())
}

/// Convert a wei amount to ether, saturating at `Decimal::MAX`
pub fn wei_to_ether(wei: U256) -> Decimal {
    u128::try_from(wei)
        .ok()
        .and_then(|wei| i128::try_from(wei).ok())
        .and_then(|wei| Decimal::try_from_i128_with_scale(wei, ETHER_DECIMALS).ok())
        .map(|ether| ether.normalize())
        .unwrap_or(Decimal::MAX)
}
