//! Collector configuration
//!
//! Hard defaults for every tunable, overridable through `DEPTH_MIRROR_*`
//! environment variables.

use crate::error::ConfigError;
use std::time::Duration;

/// Tunables for the orderbook collection pipeline.
///
/// ## Environment Variables
///
/// - `DEPTH_MIRROR_SYMBOLS_EXPIRY_MS`: symbol-list cache lifetime (default: 300000)
/// - `DEPTH_MIRROR_ENTRY_EXPIRY_MS`: book entry lifetime (default: 864000000)
/// - `DEPTH_MIRROR_DIFF_QUEUE_CAPACITY`: diff queue bound (default: 8192)
/// - `DEPTH_MIRROR_PARALLEL_BATCH_THRESHOLD`: batch size above which ingest fans out (default: 32)
/// - `DEPTH_MIRROR_POST_BATCH_SLEEP_MS`: cooperative pause after each batch (default: 10)
/// - `DEPTH_MIRROR_REPAIR_POLL_MS`: snapshot repair poll interval (default: 5000)
/// - `DEPTH_MIRROR_STREAM_IDLE_GLOBAL_MS`: global stream idle cutoff (default: 20000)
/// - `DEPTH_MIRROR_STREAM_IDLE_SYMBOL_MS`: per-symbol idle cutoff (default: 60000)
/// - `DEPTH_MIRROR_STREAM_WARMUP_MS`: grace before per-symbol checks (default: 120000)
/// - `DEPTH_MIRROR_MAX_TICK_QUEUE`: concurrent scheduler ticks (default: clamp(cpus, 2, 32))
/// - `DEPTH_MIRROR_MAX_STREAMS`: hard cap on pool size (default: 256)
/// - `DEPTH_MIRROR_PRICE_SCALE`: decimal digits kept in price keys (default: 8)
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// How long the cached symbol listing stays valid
    pub symbols_expiry: Duration,

    /// Book entries untouched for longer than this are dropped after dispatch
    pub entry_expiry: Duration,

    /// Bound of the diff envelope queue
    pub diff_queue_capacity: usize,

    /// Ingest batches larger than this are processed on a worker pool
    pub parallel_batch_threshold: usize,

    /// Cooperative pause after each ingest batch
    pub post_batch_sleep: Duration,

    /// Sleep between snapshot repair attempts
    pub repair_poll: Duration,

    /// A stream with no event for this long is stopped
    pub stream_idle_global: Duration,

    /// After warmup, a tracked symbol idle for this long stops its stream
    pub stream_idle_symbol: Duration,

    /// Grace period before per-symbol idle checks kick in
    pub stream_warmup: Duration,

    /// Maximum scheduler ticks in flight
    pub max_tick_queue: usize,

    /// Hard cap on the number of streaming connections
    pub max_streams: usize,

    /// Decimal digits preserved when rounding prices into keys
    pub price_scale: u32,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            symbols_expiry: Duration::from_millis(300_000),
            entry_expiry: Duration::from_millis(864_000_000),
            diff_queue_capacity: 8192,
            parallel_batch_threshold: 32,
            post_batch_sleep: Duration::from_millis(10),
            repair_poll: Duration::from_millis(5000),
            stream_idle_global: Duration::from_millis(20_000),
            stream_idle_symbol: Duration::from_millis(60_000),
            stream_warmup: Duration::from_millis(120_000),
            max_tick_queue: default_max_tick_queue(),
            max_streams: 256,
            price_scale: 8,
        }
    }
}

/// Scheduler tick concurrency defaults to the CPU count, clamped to [2, 32].
pub fn default_max_tick_queue() -> usize {
    num_cpus::get().clamp(2, 32)
}

impl CollectorConfig {
    /// Load configuration from environment variables, falling back to defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when a set variable fails to parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        Ok(Self {
            symbols_expiry: env_duration_ms(
                "DEPTH_MIRROR_SYMBOLS_EXPIRY_MS",
                defaults.symbols_expiry,
            )?,
            entry_expiry: env_duration_ms("DEPTH_MIRROR_ENTRY_EXPIRY_MS", defaults.entry_expiry)?,
            diff_queue_capacity: env_parse(
                "DEPTH_MIRROR_DIFF_QUEUE_CAPACITY",
                defaults.diff_queue_capacity,
            )?,
            parallel_batch_threshold: env_parse(
                "DEPTH_MIRROR_PARALLEL_BATCH_THRESHOLD",
                defaults.parallel_batch_threshold,
            )?,
            post_batch_sleep: env_duration_ms(
                "DEPTH_MIRROR_POST_BATCH_SLEEP_MS",
                defaults.post_batch_sleep,
            )?,
            repair_poll: env_duration_ms("DEPTH_MIRROR_REPAIR_POLL_MS", defaults.repair_poll)?,
            stream_idle_global: env_duration_ms(
                "DEPTH_MIRROR_STREAM_IDLE_GLOBAL_MS",
                defaults.stream_idle_global,
            )?,
            stream_idle_symbol: env_duration_ms(
                "DEPTH_MIRROR_STREAM_IDLE_SYMBOL_MS",
                defaults.stream_idle_symbol,
            )?,
            stream_warmup: env_duration_ms(
                "DEPTH_MIRROR_STREAM_WARMUP_MS",
                defaults.stream_warmup,
            )?,
            max_tick_queue: env_parse("DEPTH_MIRROR_MAX_TICK_QUEUE", defaults.max_tick_queue)?,
            max_streams: env_parse("DEPTH_MIRROR_MAX_STREAMS", defaults.max_streams)?,
            price_scale: env_parse("DEPTH_MIRROR_PRICE_SCALE", defaults.price_scale)?,
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw,
            reason: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn env_duration_ms(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    Ok(Duration::from_millis(env_parse(
        key,
        default.as_millis() as u64,
    )?))
}
