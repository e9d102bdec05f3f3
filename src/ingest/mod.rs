//! Diff envelope ingestion
//!
//! Drains the bounded diff queue in batches, applies envelopes to their
//! books and flags sequence gaps for snapshot repair. Large batches fan out
//! across workers grouped by symbol so per-book application order is
//! preserved.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::book::{BookMap, DiffEnvelope};
use crate::config::CollectorConfig;
use crate::repair::PendingRepairs;

/// Applies queued diff envelopes to the in-memory books.
pub struct DiffIngestor {
    books: Arc<BookMap>,
    pending: Arc<PendingRepairs>,
    parallel_batch_threshold: usize,
    post_batch_sleep: Duration,
}

impl DiffIngestor {
    pub fn new(
        books: Arc<BookMap>,
        pending: Arc<PendingRepairs>,
        config: &CollectorConfig,
    ) -> Self {
        Self {
            books,
            pending,
            parallel_batch_threshold: config.parallel_batch_threshold,
            post_batch_sleep: config.post_batch_sleep,
        }
    }

    /// Consume the diff queue until it closes or the token cancels.
    ///
    /// Each pass drains whatever the queue currently holds, processes it as
    /// one batch, then pauses briefly to cap CPU share under stream bursts.
    pub async fn run(
        self,
        mut queue: mpsc::Receiver<Arc<DiffEnvelope>>,
        cancel: CancellationToken,
    ) {
        loop {
            let first = tokio::select! {
                _ = cancel.cancelled() => break,
                received = queue.recv() => match received {
                    Some(envelope) => envelope,
                    None => break,
                },
            };

            let mut batch = vec![first];
            while let Ok(envelope) = queue.try_recv() {
                batch.push(envelope);
            }

            self.process_batch(batch).await;

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(self.post_batch_sleep) => {}
            }
        }
        debug!("Diff ingestor stopped");
    }

    /// Apply one drained batch, in parallel when it is large enough to pay
    /// for the fan-out.
    pub async fn process_batch(&self, batch: Vec<Arc<DiffEnvelope>>) {
        let size = batch.len();
        if size == 0 {
            return;
        }

        if size > self.parallel_batch_threshold {
            let mut by_symbol: HashMap<String, Vec<Arc<DiffEnvelope>>> = HashMap::new();
            for envelope in batch {
                by_symbol
                    .entry(envelope.symbol.clone())
                    .or_default()
                    .push(envelope);
            }

            let mut workers = JoinSet::new();
            for (_, group) in by_symbol {
                let books = Arc::clone(&self.books);
                let pending = Arc::clone(&self.pending);
                workers.spawn(async move {
                    for envelope in group {
                        ingest_one(&books, &pending, &envelope);
                    }
                });
            }
            while let Some(joined) = workers.join_next().await {
                if let Err(e) = joined {
                    warn!(error = %e, "Ingest worker failed");
                }
            }
        } else {
            for envelope in &batch {
                ingest_one(&self.books, &self.pending, envelope);
            }
        }

        debug!(batch = size, "Applied diff batch");
    }
}

/// Gap evaluation and application are one compound operation under the
/// book's guard; the diff is applied even when gapped.
fn ingest_one(books: &BookMap, pending: &PendingRepairs, envelope: &DiffEnvelope) {
    let book = books.get_or_create(&envelope.symbol);
    let _guard = book.guard();

    if book.has_gap(envelope) {
        if pending.flag(&envelope.symbol) {
            warn!(
                symbol = %envelope.symbol,
                expected = book.last_update_id() + 1,
                received = envelope.first_update_id,
                "Sequence gap detected, flagged for snapshot repair"
            );
        }
    }

    book.apply_diff(envelope);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn envelope(symbol: &str, first: u64, last: u64) -> Arc<DiffEnvelope> {
        Arc::new(DiffEnvelope {
            symbol: symbol.to_string(),
            first_update_id: first,
            final_update_id: last,
            bids: vec![(dec!(10.0), dec!(1.0))],
            asks: vec![(dec!(11.0), dec!(1.0))],
            event_time: Utc::now(),
        })
    }

    fn ingestor() -> (DiffIngestor, Arc<BookMap>, Arc<PendingRepairs>) {
        let books = Arc::new(BookMap::new(8));
        let pending = Arc::new(PendingRepairs::new());
        let ingestor = DiffIngestor::new(
            Arc::clone(&books),
            Arc::clone(&pending),
            &CollectorConfig::default(),
        );
        (ingestor, books, pending)
    }

    #[tokio::test]
    async fn first_diff_into_empty_book_is_flagged_and_applied() {
        let (ingestor, books, pending) = ingestor();

        ingestor.process_batch(vec![envelope("BTCUSDT", 1, 1)]).await;

        assert!(pending.contains("BTCUSDT"));
        let book = books.get_or_create("BTCUSDT");
        assert_eq!(book.last_update_id(), 1);
        assert!(!book.is_empty());
    }

    #[tokio::test]
    async fn gap_within_batch_is_flagged_immediately() {
        let (ingestor, books, pending) = ingestor();

        // Seed past the empty-book gap, then clear the flag.
        ingestor.process_batch(vec![envelope("BTCUSDT", 1, 50)]).await;
        pending.pop_any();

        ingestor
            .process_batch(vec![envelope("BTCUSDT", 51, 55), envelope("BTCUSDT", 60, 61)])
            .await;

        assert!(pending.contains("BTCUSDT"));
        assert_eq!(books.get_or_create("BTCUSDT").last_update_id(), 61);
    }

    #[tokio::test]
    async fn contiguous_diffs_do_not_flag() {
        let (ingestor, _books, pending) = ingestor();

        ingestor.process_batch(vec![envelope("BTCUSDT", 1, 50)]).await;
        pending.pop_any();

        ingestor
            .process_batch(vec![envelope("BTCUSDT", 51, 55), envelope("BTCUSDT", 56, 58)])
            .await;

        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn large_batches_fan_out_without_losing_order() {
        let (ingestor, books, _pending) = ingestor();

        // 64 contiguous envelopes per symbol, well past the threshold.
        let mut batch = Vec::new();
        for symbol in ["AAAUSDT", "BBBUSDT"] {
            for i in 0..64u64 {
                batch.push(envelope(symbol, i * 2 + 1, i * 2 + 2));
            }
        }
        ingestor.process_batch(batch).await;

        assert_eq!(books.get_or_create("AAAUSDT").last_update_id(), 128);
        assert_eq!(books.get_or_create("BBBUSDT").last_update_id(), 128);
    }

    #[tokio::test]
    async fn run_drains_queue_and_stops_on_cancel() {
        let (ingestor, books, _pending) = ingestor();
        let (tx, rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        tx.send(envelope("BTCUSDT", 1, 1)).await.unwrap();
        tx.send(envelope("BTCUSDT", 2, 2)).await.unwrap();

        let runner = tokio::spawn(ingestor.run(rx, cancel.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        runner.await.unwrap();

        assert_eq!(books.get_or_create("BTCUSDT").last_update_id(), 2);
    }
}
