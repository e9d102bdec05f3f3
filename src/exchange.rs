//! Exchange REST capability seam
//!
//! The collector and the snapshot repairer only see this trait; the concrete
//! Binance client lives in [`crate::binance`].

use crate::book::DepthSnapshot;
use crate::error::RestError;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Authoritative snapshot and symbol-listing endpoints.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Fetch an order book snapshot, `limit` levels per side (up to 5000).
    async fn get_orderbook(
        &self,
        symbol: &str,
        limit: u32,
        cancel: &CancellationToken,
    ) -> Result<DepthSnapshot, RestError>;

    /// List tradable symbols. `use_cache` allows a previously fetched
    /// listing; `check_status` keeps only symbols currently trading.
    async fn list_symbols(
        &self,
        use_cache: bool,
        check_status: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, RestError>;
}
