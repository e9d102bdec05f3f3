//! Binance REST client
//!
//! Thin reqwest wrapper implementing the [`SnapshotSource`] seam: depth
//! snapshots and the tradable-symbol listing, both behind the client-side
//! rate limiter.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::book::DepthSnapshot;
use crate::error::RestError;
use crate::exchange::SnapshotSource;

use super::rate_limiter::{depth_weight, RestRateLimiter, EXCHANGE_INFO_WEIGHT};
use super::types::{DepthResponse, ExchangeInfo};

const DEFAULT_BASE_URL: &str = "https://api.binance.com";
const USER_AGENT: &str = concat!("depth-mirror/", env!("CARGO_PKG_VERSION"));

/// Public-endpoint REST client with rate limiting and a symbol-list cache.
pub struct BinanceRestClient {
    client: Client,
    base_url: String,
    rate_limiter: RestRateLimiter,
    symbol_cache: tokio::sync::Mutex<Option<Vec<String>>>,
}

impl BinanceRestClient {
    /// Default configuration: 10 s timeout against the public API.
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    /// Point the client at a different endpoint (mirrors, test servers).
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent(USER_AGENT)
            .build()
            .expect("failed to build HTTP client");
        Self {
            client,
            base_url: base_url.into(),
            rate_limiter: RestRateLimiter::new(),
            symbol_cache: tokio::sync::Mutex::new(None),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: String,
        weight: u32,
        cancel: &CancellationToken,
    ) -> Result<T, RestError> {
        self.rate_limiter.acquire(weight).await?;

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RestError::Cancelled),
            sent = self.client.get(&url).send() => sent?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(RestError::Status {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RestError::Cancelled),
            decoded = response.json::<T>() => Ok(decoded?),
        }
    }
}

impl Default for BinanceRestClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SnapshotSource for BinanceRestClient {
    async fn get_orderbook(
        &self,
        symbol: &str,
        limit: u32,
        cancel: &CancellationToken,
    ) -> Result<DepthSnapshot, RestError> {
        let limit = limit.min(5000);
        let url = format!(
            "{}/api/v3/depth?symbol={}&limit={}",
            self.base_url,
            symbol.to_uppercase(),
            limit
        );
        debug!(symbol = %symbol, limit, "Fetching depth snapshot");

        let response: DepthResponse = self.get_json(url, depth_weight(limit), cancel).await?;
        response.into_snapshot(Utc::now())
    }

    async fn list_symbols(
        &self,
        use_cache: bool,
        check_status: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, RestError> {
        if use_cache {
            if let Some(cached) = self.symbol_cache.lock().await.clone() {
                return Ok(cached);
            }
        }

        let url = format!("{}/api/v3/exchangeInfo", self.base_url);
        let info: ExchangeInfo = self.get_json(url, EXCHANGE_INFO_WEIGHT, cancel).await?;

        let symbols: Vec<String> = info
            .symbols
            .into_iter()
            .filter(|s| !check_status || s.is_trading())
            .map(|s| s.symbol)
            .collect();

        debug!(symbols = symbols.len(), check_status, "Listed symbols");
        *self.symbol_cache.lock().await = Some(symbols.clone());
        Ok(symbols)
    }
}
