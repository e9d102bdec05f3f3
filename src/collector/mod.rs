//! Orchestration: symbol selection, pool lifecycle, periodic dispatch
//!
//! [`OrderbookCollector::collect`] is the public operation: it keeps the
//! stream pool aligned with the filtered symbol set, makes sure the ingest
//! and repair loops are running, then hands sorted views of every non-empty
//! book to the registered handlers.

use chrono::Utc;
use futures_util::future::join_all;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::book::{BookEntry, BookMap, DiffEnvelope, SortedView};
use crate::config::CollectorConfig;
use crate::error::CollectorError;
use crate::exchange::SnapshotSource;
use crate::filter::PairFilter;
use crate::ingest::DiffIngestor;
use crate::repair::{PendingRepairs, SnapshotRepairer};
use crate::sched::{JobError, ScheduledJob};
use crate::stream::{DiffSink, StreamFactory, StreamPool};

use async_trait::async_trait;

/// Handlers report failures as boxed errors; dispatch logs them per handler
/// and carries on.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Downstream consumer of raw sorted views.
///
/// Views are borrowed for the duration of the call and must not be retained.
#[async_trait]
pub trait BookHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(
        &self,
        symbol: &str,
        bids: &SortedView,
        asks: &SortedView,
        cancel: &CancellationToken,
    ) -> Result<(), HandlerError>;
}

/// Output of the aggregation step, dispatched to aggregated handlers.
#[derive(Debug, Clone)]
pub struct AggregatedBook {
    pub symbol: String,
    pub bids: Vec<BookEntry>,
    pub asks: Vec<BookEntry>,
    pub timestamp: chrono::DateTime<Utc>,
}

/// Reduces a pair of sorted views into one [`AggregatedBook`].
#[async_trait]
pub trait BookAggregator: Send + Sync {
    async fn aggregate(
        &self,
        symbol: &str,
        bids: &SortedView,
        asks: &SortedView,
        cancel: &CancellationToken,
    ) -> Result<AggregatedBook, HandlerError>;
}

/// Downstream consumer of aggregated books.
#[async_trait]
pub trait AggregatedHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(
        &self,
        book: &AggregatedBook,
        cancel: &CancellationToken,
    ) -> Result<(), HandlerError>;
}

/// Explicit registry of dispatch targets, passed in at construction.
#[derive(Default)]
pub struct HandlerRegistry {
    raw: Vec<Arc<dyn BookHandler>>,
    aggregated: Vec<Arc<dyn AggregatedHandler>>,
    aggregator: Option<Arc<dyn BookAggregator>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_raw(mut self, handler: Arc<dyn BookHandler>) -> Self {
        self.raw.push(handler);
        self
    }

    pub fn with_aggregated(mut self, handler: Arc<dyn AggregatedHandler>) -> Self {
        self.aggregated.push(handler);
        self
    }

    pub fn with_aggregator(mut self, aggregator: Arc<dyn BookAggregator>) -> Self {
        self.aggregator = Some(aggregator);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty() && self.aggregated.is_empty()
    }
}

struct SymbolCache {
    symbols: Vec<String>,
    refreshed_at: Option<Instant>,
}

struct PoolState {
    pool: Option<Arc<StreamPool>>,
    task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Background {
    ingest: Option<JoinHandle<()>>,
    repair: Option<JoinHandle<()>>,
}

/// Owns the books, the stream pool, the pending-repair set and the
/// background loops; dispatches snapshots to the handler registry.
pub struct OrderbookCollector {
    config: CollectorConfig,
    source: Arc<dyn SnapshotSource>,
    factory: Arc<dyn StreamFactory>,
    filter: PairFilter,
    handlers: HandlerRegistry,
    books: Arc<BookMap>,
    pending: Arc<PendingRepairs>,
    diff_tx: DiffSink,
    diff_rx: Mutex<Option<mpsc::Receiver<Arc<DiffEnvelope>>>>,
    setup_gate: Semaphore,
    symbol_cache: tokio::sync::Mutex<SymbolCache>,
    pool_state: tokio::sync::Mutex<PoolState>,
    background: tokio::sync::Mutex<Background>,
}

impl OrderbookCollector {
    pub fn new(
        config: CollectorConfig,
        source: Arc<dyn SnapshotSource>,
        factory: Arc<dyn StreamFactory>,
        filter: PairFilter,
        handlers: HandlerRegistry,
    ) -> Self {
        let (diff_tx, diff_rx) = mpsc::channel(config.diff_queue_capacity);
        let books = Arc::new(BookMap::new(config.price_scale));
        Self {
            config,
            source,
            factory,
            filter,
            handlers,
            books,
            pending: Arc::new(PendingRepairs::new()),
            diff_tx,
            diff_rx: Mutex::new(Some(diff_rx)),
            setup_gate: Semaphore::new(1),
            symbol_cache: tokio::sync::Mutex::new(SymbolCache {
                symbols: Vec::new(),
                refreshed_at: None,
            }),
            pool_state: tokio::sync::Mutex::new(PoolState {
                pool: None,
                task: None,
            }),
            background: tokio::sync::Mutex::new(Background::default()),
        }
    }

    pub fn books(&self) -> &BookMap {
        &self.books
    }

    pub fn pending_repairs(&self) -> &PendingRepairs {
        &self.pending
    }

    /// Sink feeding the ingest queue; the pool hands it to every stream.
    pub fn diff_sink(&self) -> DiffSink {
        self.diff_tx.clone()
    }

    /// One collection cycle: reconcile infrastructure, then dispatch a
    /// sorted snapshot of every non-empty book to the handlers.
    pub async fn collect(&self, cancel: &CancellationToken) -> Result<(), CollectorError> {
        match self.setup(cancel).await {
            Ok(()) => {}
            Err(_) if cancel.is_cancelled() => return Ok(()),
            Err(e) => return Err(e),
        }

        let now = Utc::now();
        let expiry_cutoff = now - chrono::Duration::milliseconds(self.config.entry_expiry.as_millis() as i64);

        for symbol in self.books.symbols() {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let Some(book) = self.books.get(&symbol) else {
                continue;
            };
            if book.is_empty() {
                continue;
            }

            let (mut bids, mut asks) = book.views();
            bids.enforce();
            asks.enforce();

            self.dispatch(&symbol, &bids, &asks, cancel).await;

            let _guard = book.guard();
            book.reset_statistics();
            book.drop_outdated(expiry_cutoff);
        }

        Ok(())
    }

    /// Refresh symbols, reconcile the stream pool and make sure the
    /// background loops run. Serialized by a single-permit gate.
    async fn setup(&self, cancel: &CancellationToken) -> Result<(), CollectorError> {
        let _permit = self
            .setup_gate
            .acquire()
            .await
            .map_err(|_| CollectorError::Cancelled)?;

        let symbols = {
            let mut cache = self.symbol_cache.lock().await;
            let stale = cache
                .refreshed_at
                .map_or(true, |at| at.elapsed() > self.config.symbols_expiry);
            if stale {
                let listed = self.source.list_symbols(false, true, cancel).await?;
                debug!(symbols = listed.len(), "Refreshed symbol listing");
                cache.symbols = listed;
                cache.refreshed_at = Some(Instant::now());
            }
            cache.symbols.clone()
        };

        let tracked: Vec<String> = symbols
            .iter()
            .filter(|symbol| self.filter.matches(symbol))
            .cloned()
            .collect();
        let tracked_hash = crate::stream::pool::symbols_hash(&tracked);

        {
            let mut state = self.pool_state.lock().await;
            let current_hash = state.pool.as_ref().map_or(0, |p| p.symbols_hash());
            let pool_dead = state.task.as_ref().map_or(true, JoinHandle::is_finished);

            if current_hash != tracked_hash || pool_dead {
                if let Some(old) = state.pool.take() {
                    old.dispose().await;
                }
                if let Some(task) = state.task.take() {
                    let _ = task.await;
                }

                if tracked.is_empty() {
                    debug!("Filter selected no symbols, pool left empty");
                } else {
                    info!(symbols = tracked.len(), "Rebuilding stream pool");
                    let pool = Arc::new(
                        StreamPool::build(
                            &tracked,
                            self.factory.as_ref(),
                            self.diff_tx.clone(),
                            &self.config,
                        )
                        .await?,
                    );
                    let run_pool = Arc::clone(&pool);
                    let run_cancel = cancel.clone();
                    state.task =
                        Some(tokio::spawn(async move { run_pool.run(run_cancel).await }));
                    state.pool = Some(pool);
                }
            }
        }

        self.ensure_background(cancel).await;
        Ok(())
    }

    async fn ensure_background(&self, cancel: &CancellationToken) {
        let mut background = self.background.lock().await;

        if background
            .ingest
            .as_ref()
            .map_or(true, JoinHandle::is_finished)
        {
            match self.diff_rx.lock().take() {
                Some(queue) => {
                    let ingestor = DiffIngestor::new(
                        Arc::clone(&self.books),
                        Arc::clone(&self.pending),
                        &self.config,
                    );
                    background.ingest = Some(tokio::spawn(ingestor.run(queue, cancel.clone())));
                }
                None => {
                    if background.ingest.is_some() {
                        // The queue receiver is single-consumer; a finished
                        // ingest loop cannot be restarted.
                        debug!("Ingest loop finished and cannot be restarted");
                    }
                }
            }
        }

        if background
            .repair
            .as_ref()
            .map_or(true, JoinHandle::is_finished)
        {
            let repairer = SnapshotRepairer::new(
                Arc::clone(&self.books),
                Arc::clone(&self.pending),
                Arc::clone(&self.source),
                &self.config,
            );
            background.repair = Some(tokio::spawn(repairer.run(cancel.clone())));
        }
    }

    async fn dispatch(
        &self,
        symbol: &str,
        bids: &SortedView,
        asks: &SortedView,
        cancel: &CancellationToken,
    ) {
        let raw_results = join_all(self.handlers.raw.iter().map(|handler| async move {
            (handler.name(), handler.handle(symbol, bids, asks, cancel).await)
        }))
        .await;
        for (name, result) in raw_results {
            log_handler_outcome(symbol, name, result, cancel);
        }

        if self.handlers.aggregated.is_empty() {
            return;
        }
        let Some(aggregator) = &self.handlers.aggregator else {
            return;
        };
        match aggregator.aggregate(symbol, bids, asks, cancel).await {
            Ok(aggregated) => {
                let aggregated = &aggregated;
                let results =
                    join_all(self.handlers.aggregated.iter().map(|handler| async move {
                        (handler.name(), handler.handle(aggregated, cancel).await)
                    }))
                    .await;
                for (name, result) in results {
                    log_handler_outcome(symbol, name, result, cancel);
                }
            }
            Err(e) => {
                if cancel.is_cancelled() {
                    debug!(symbol = %symbol, error = %e, "Aggregation cancelled");
                } else {
                    warn!(symbol = %symbol, error = %e, "Aggregation failed");
                }
            }
        }
    }

    /// Tear down the pool and background loops, awaiting each once.
    pub async fn shutdown(&self) {
        let mut state = self.pool_state.lock().await;
        if let Some(pool) = state.pool.take() {
            pool.dispose().await;
        }
        if let Some(task) = state.task.take() {
            let _ = task.await;
        }
        drop(state);

        let mut background = self.background.lock().await;
        for task in [background.ingest.take(), background.repair.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
            let _ = task.await;
        }
    }
}

fn log_handler_outcome(
    symbol: &str,
    name: &str,
    result: Result<(), HandlerError>,
    cancel: &CancellationToken,
) {
    if let Err(e) = result {
        if cancel.is_cancelled() {
            debug!(symbol = %symbol, handler = %name, error = %e, "Handler cancelled");
        } else {
            warn!(symbol = %symbol, handler = %name, error = %e, "Handler failed");
        }
    }
}

/// Adapter so the scheduler can drive periodic snapshot dispatch.
pub struct SnapshotDispatchJob {
    collector: Arc<OrderbookCollector>,
}

impl SnapshotDispatchJob {
    pub fn new(collector: Arc<OrderbookCollector>) -> Self {
        Self { collector }
    }
}

#[async_trait]
impl ScheduledJob for SnapshotDispatchJob {
    fn name(&self) -> &str {
        "orderbook-snapshot-dispatch"
    }

    async fn execute(&self, cancel: &CancellationToken) -> Result<(), JobError> {
        self.collector.collect(cancel).await?;
        Ok(())
    }
}
