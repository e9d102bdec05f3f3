//! Pool of streaming connections sharded by symbol

use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CollectorConfig;
use crate::error::PoolError;

use super::{DepthStream, DiffSink, StreamFactory};

/// Liveness check cadence.
const MONITOR_INTERVAL: Duration = Duration::from_secs(10);

/// Streams wanted for a symbol count: `clamp(log2(n) + 1, 1, max)`, with a
/// single stream below ten symbols.
fn target_stream_count(symbol_count: usize, max_streams: usize) -> usize {
    if symbol_count == 0 {
        return 0;
    }
    if symbol_count < 10 {
        return 1;
    }
    (symbol_count.ilog2() as usize + 1).clamp(1, max_streams)
}

/// Stable hash over the symbol list in input order; the orchestrator compares
/// it across setup cycles to decide whether the pool must be rebuilt.
pub fn symbols_hash(symbols: &[String]) -> u64 {
    if symbols.is_empty() {
        return 0;
    }
    let mut hasher = Sha256::new();
    for symbol in symbols {
        hasher.update(symbol.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    u64::from_be_bytes(digest[..8].try_into().expect("SHA-256 digest is 32 bytes"))
}

/// A set of streaming connections covering one symbol list.
///
/// Built once per filter output; `run` drives every receive loop and a
/// liveness monitor, and resolves as soon as any receive loop exits so the
/// orchestrator can rebuild on the next cycle.
pub struct StreamPool {
    streams: RwLock<Vec<Arc<dyn DepthStream>>>,
    assignments: RwLock<HashMap<String, usize>>,
    symbols_hash: AtomicU64,
    idle_global: Duration,
    idle_symbol: Duration,
    warmup: Duration,
    cancel: CancellationToken,
}

impl StreamPool {
    /// Create streams via the factory and shard the symbols across them
    /// round-robin.
    ///
    /// # Errors
    ///
    /// [`PoolError::OverCapacity`] when a symbol is refused by every stream.
    pub async fn build(
        symbols: &[String],
        factory: &dyn StreamFactory,
        sink: DiffSink,
        config: &CollectorConfig,
    ) -> Result<Self, PoolError> {
        let target = target_stream_count(symbols.len(), config.max_streams);

        let mut streams: Vec<Arc<dyn DepthStream>> = Vec::with_capacity(target);
        for _ in 0..target {
            streams.push(factory.create(sink.clone()).await?);
        }

        let mut assignments = HashMap::with_capacity(symbols.len());
        let mut cursor = 0usize;
        for symbol in symbols {
            let mut assigned = None;
            for attempt in 0..streams.len() {
                let idx = (cursor + attempt) % streams.len();
                if streams[idx].try_register(symbol) {
                    assigned = Some(idx);
                    cursor = idx + 1;
                    break;
                }
            }
            match assigned {
                Some(idx) => {
                    assignments.insert(symbol.clone(), idx);
                }
                None => {
                    return Err(PoolError::OverCapacity {
                        symbol: symbol.clone(),
                        streams: streams.len(),
                    });
                }
            }
        }

        info!(
            symbols = symbols.len(),
            streams = streams.len(),
            "Built stream pool"
        );

        Ok(Self {
            streams: RwLock::new(streams),
            assignments: RwLock::new(assignments),
            symbols_hash: AtomicU64::new(symbols_hash(symbols)),
            idle_global: config.stream_idle_global,
            idle_symbol: config.stream_idle_symbol,
            warmup: config.stream_warmup,
            cancel: CancellationToken::new(),
        })
    }

    pub fn symbols_hash(&self) -> u64 {
        self.symbols_hash.load(Ordering::Acquire)
    }

    pub fn stream_count(&self) -> usize {
        self.streams.read().len()
    }

    /// Index of the stream a symbol was sharded to.
    pub fn assignment(&self, symbol: &str) -> Option<usize> {
        self.assignments.read().get(symbol).copied()
    }

    /// Drive every stream's receive loop plus the liveness monitor.
    ///
    /// Resolves when any receive loop exits (or on cancellation); the monitor
    /// is cancelled and all remaining streams are stopped and awaited before
    /// returning.
    pub async fn run(&self, cancel: CancellationToken) {
        let streams: Vec<Arc<dyn DepthStream>> = self.streams.read().clone();
        if streams.is_empty() {
            return;
        }

        let started = Instant::now();
        let mut receivers = JoinSet::new();
        for (idx, stream) in streams.iter().enumerate() {
            let stream = Arc::clone(stream);
            receivers.spawn(async move { (idx, stream.run().await) });
        }

        let monitor = tokio::spawn(monitor_liveness(
            streams.clone(),
            started,
            self.idle_global,
            self.idle_symbol,
            self.warmup,
            self.cancel.clone(),
        ));

        tokio::select! {
            joined = receivers.join_next() => {
                if let Some(Ok((idx, result))) = joined {
                    match result {
                        Ok(()) => info!(stream = idx, "Stream receive loop finished"),
                        Err(e) => warn!(stream = idx, error = %e, "Stream receive loop exited"),
                    }
                }
            }
            _ = cancel.cancelled() => {
                debug!("Pool run cancelled");
            }
            _ = self.cancel.cancelled() => {
                debug!("Pool disposed while running");
            }
        }

        monitor.abort();
        let _ = monitor.await;

        for stream in &streams {
            stream.stop();
        }
        while let Some(joined) = receivers.join_next().await {
            if let Ok((idx, Err(e))) = joined {
                debug!(stream = idx, error = %e, "Stream wound down");
            }
        }
    }

    /// Stop everything, clear bookkeeping, reset the hash to zero.
    pub async fn dispose(&self) {
        self.cancel.cancel();
        let streams: Vec<Arc<dyn DepthStream>> = self.streams.write().drain(..).collect();
        for stream in &streams {
            stream.stop();
        }
        self.assignments.write().clear();
        self.symbols_hash.store(0, Ordering::Release);
    }
}

/// Every 10 s: stop streams whose global last event is older than the idle
/// cutoff; once the pool is past warmup, also stop streams with any tracked
/// symbol idle beyond the per-symbol cutoff.
async fn monitor_liveness(
    streams: Vec<Arc<dyn DepthStream>>,
    started: Instant,
    idle_global: Duration,
    idle_symbol: Duration,
    warmup: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval(MONITOR_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick of `interval` fires immediately; swallow it.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let now = Instant::now();
        for (idx, stream) in streams.iter().enumerate() {
            let last = stream.last_event().unwrap_or(started);
            let idle = now.saturating_duration_since(last);
            if idle > idle_global {
                warn!(
                    stream = idx,
                    idle_ms = idle.as_millis() as u64,
                    "Stream idle past global cutoff, stopping"
                );
                stream.stop();
                continue;
            }

            if now.saturating_duration_since(started) <= warmup {
                continue;
            }
            for symbol in stream.symbols() {
                let last = stream.last_symbol_event(&symbol).unwrap_or(started);
                let idle = now.saturating_duration_since(last);
                if idle > idle_symbol {
                    warn!(
                        stream = idx,
                        symbol = %symbol,
                        idle_ms = idle.as_millis() as u64,
                        "Symbol idle past cutoff, stopping its stream"
                    );
                    stream.stop();
                    break;
                }
            }
        }
    }
}
