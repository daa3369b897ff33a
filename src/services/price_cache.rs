//! Spot price cache with a fixed TTL
//!
//! Prices come from the Binance ticker endpoint and are reused for the TTL
//! window. A failed fetch is logged and reported as zero so a job can still
//! run its remaining checks.

use crate::config::PriceConfig;
use crate::error::Result;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, error};

pub const BNB_SYMBOL: &str = "BNBUSDT";

#[derive(Debug, Clone, Copy)]
struct CachedPrice {
    price: Decimal,
    fetched_at: Instant,
}

#[derive(Deserialize)]
struct TickerResponse {
    #[serde(with = "rust_decimal::serde::str")]
    price: Decimal,
}

#[derive(Debug)]
pub struct PriceCache {
    client: Client,
    endpoint: String,
    ttl: Duration,
    /// symbol -> last fetched price
    prices: RwLock<HashMap<String, CachedPrice>>,
}

impl PriceCache {
    pub fn new(endpoint: impl Into<String>, ttl: Duration) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
            ttl,
            prices: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &PriceConfig) -> Self {
        Self::new(config.endpoint.clone(), Duration::from_secs(config.ttl_secs))
    }

    pub fn with_defaults() -> Self {
        Self::from_config(&PriceConfig::default())
    }

    /// Cached price if it is still within the TTL
    pub async fn get(&self, symbol: &str) -> Option<Decimal> {
        let prices = self.prices.read().await;
        prices
            .get(symbol)
            .filter(|cached| cached.fetched_at.elapsed() < self.ttl)
            .map(|cached| cached.price)
    }

    /// Store a price, restarting its TTL
    pub async fn insert(&self, symbol: &str, price: Decimal) {
        self.prices.write().await.insert(
            symbol.to_string(),
            CachedPrice {
                price,
                fetched_at: Instant::now(),
            },
        );
    }

    /// Cached or freshly fetched price; zero when the fetch fails
    pub async fn price(&self, symbol: &str) -> Decimal {
        if let Some(price) = self.get(symbol).await {
            return price;
        }

        match self.fetch(symbol).await {
            Ok(price) => {
                debug!("Fetched {} price: {}", symbol, price);
                self.insert(symbol, price).await;
                price
            }
            Err(e) => {
                error!("Failed to fetch {} price: {}", symbol, e);
                Decimal::ZERO
            }
        }
    }

    pub async fn bnb_price(&self) -> Decimal {
        self.price(BNB_SYMBOL).await
    }

    pub async fn clear(&self) {
        self.prices.write().await.clear();
    }

    async fn fetch(&self, symbol: &str) -> Result<Decimal> {
        let ticker: TickerResponse = self
            .client
            .get(&self.endpoint)
            .query(&[("symbol", symbol)])
            .timeout(Duration::from_secs(10))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(ticker.price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let cache = PriceCache::new("http://127.0.0.1:1/ticker", Duration::from_secs(30));
        cache.insert(BNB_SYMBOL, dec!(612.45)).await;

        assert_eq!(cache.get(BNB_SYMBOL).await, Some(dec!(612.45)));

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(cache.bnb_price().await, dec!(612.45));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get(BNB_SYMBOL).await, None);
    }

    #[tokio::test]
    async fn test_fetch_failure_yields_zero() {
        let cache = PriceCache::new("http://127.0.0.1:1/ticker", Duration::from_secs(30));
        assert_eq!(cache.bnb_price().await, Decimal::ZERO);
        assert_eq!(cache.get(BNB_SYMBOL).await, None);
    }

    #[test]
    fn test_ticker_response_parses_string_price() {
        let ticker: TickerResponse =
            serde_json::from_str(r#"{"symbol":"BNBUSDT","price":"598.10000000"}"#).unwrap();
        assert_eq!(ticker.price, dec!(598.1));
    }
}
