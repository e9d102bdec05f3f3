//! HTTP snapshot reconciliation for gapped books

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::book::BookMap;
use crate::config::CollectorConfig;
use crate::error::RestError;
use crate::exchange::SnapshotSource;

/// Snapshot depth requested when repairing a gapped book.
const SNAPSHOT_DEPTH_LIMIT: u32 = 5000;

/// Symbols flagged as needing an HTTP resync.
///
/// Shared between the ingestors that flag gaps and the repairer that drains
/// them; the set is the only serialization point between the two.
#[derive(Default)]
pub struct PendingRepairs {
    symbols: Mutex<HashSet<String>>,
}

impl PendingRepairs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flag a symbol. Returns `true` when it was not already flagged.
    pub fn flag(&self, symbol: &str) -> bool {
        self.symbols.lock().insert(symbol.to_string())
    }

    /// Take any one flagged symbol.
    pub fn pop_any(&self) -> Option<String> {
        let mut symbols = self.symbols.lock();
        let symbol = symbols.iter().next().cloned()?;
        symbols.remove(&symbol);
        Some(symbol)
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.symbols.lock().contains(symbol)
    }

    pub fn len(&self) -> usize {
        self.symbols.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.lock().is_empty()
    }
}

/// Fetches authoritative snapshots for flagged symbols and reseeds their
/// books. At most one HTTP fetch in flight per repairer.
pub struct SnapshotRepairer {
    books: Arc<BookMap>,
    pending: Arc<PendingRepairs>,
    source: Arc<dyn SnapshotSource>,
    poll: Duration,
}

impl SnapshotRepairer {
    pub fn new(
        books: Arc<BookMap>,
        pending: Arc<PendingRepairs>,
        source: Arc<dyn SnapshotSource>,
        config: &CollectorConfig,
    ) -> Self {
        Self {
            books,
            pending,
            source,
            poll: config.repair_poll,
        }
    }

    /// Poll the pending set until cancelled, repairing one symbol per cycle.
    ///
    /// The poll sleep doubles as the rate-limit handshake with the HTTP side.
    pub async fn run(self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(self.poll) => {}
            }

            let Some(symbol) = self.pending.pop_any() else {
                continue;
            };

            match self.repair_one(&symbol, &cancel).await {
                Ok(last_update_id) => {
                    info!(symbol = %symbol, update_id = last_update_id, "Book reseeded from snapshot");
                }
                Err(RestError::Cancelled) if cancel.is_cancelled() => {
                    // Shutdown, not a failure; the flag is intentionally lost
                    // with the rest of the in-memory state.
                    break;
                }
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "Snapshot repair failed, re-queueing");
                    self.pending.flag(&symbol);
                }
            }
        }
        debug!("Snapshot repairer stopped");
    }

    async fn repair_one(
        &self,
        symbol: &str,
        cancel: &CancellationToken,
    ) -> Result<u64, RestError> {
        let snapshot = self
            .source
            .get_orderbook(symbol, SNAPSHOT_DEPTH_LIMIT, cancel)
            .await?;

        let book = self.books.get_or_create(symbol);
        let _guard = book.guard();
        book.apply_snapshot(&snapshot, chrono::Utc::now());
        Ok(snapshot.last_update_id)
    }
}
