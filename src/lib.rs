//! depth-mirror: live level-2 order book mirroring
//!
//! Continuously mirrors exchange order books into memory and dispatches
//! periodic snapshots to downstream handlers:
//!
//! - [`filter::PairFilter`] decides which symbols are tracked
//! - [`stream::StreamPool`] shards symbols across streaming connections and
//!   watches their liveness
//! - [`ingest::DiffIngestor`] applies queued diff envelopes and flags
//!   sequence gaps
//! - [`repair::SnapshotRepairer`] reconciles gapped books against HTTP
//!   snapshots
//! - [`sched::TaskScheduler`] drives recurring work under backpressure
//! - [`collector::OrderbookCollector`] orchestrates the above and hands
//!   sorted views to registered handlers
//!
//! Exchange transports sit behind the [`stream::DepthStream`] and
//! [`exchange::SnapshotSource`] seams; [`binance`] ships the concrete
//! implementations.

pub mod binance;
pub mod book;
pub mod collector;
pub mod config;
pub mod error;
pub mod exchange;
pub mod filter;
pub mod ingest;
pub mod repair;
pub mod sched;
pub mod stream;

pub use book::{BookEntry, BookMap, DepthSnapshot, DiffEnvelope, InMemoryOrderbook, SortedView};
pub use collector::{
    AggregatedBook, AggregatedHandler, BookAggregator, BookHandler, HandlerRegistry,
    OrderbookCollector, SnapshotDispatchJob,
};
pub use config::CollectorConfig;
pub use error::{CollectorError, PoolError, RestError, StreamError, ViewError};
pub use exchange::SnapshotSource;
pub use filter::PairFilter;
pub use sched::{ScheduledJob, TaskScheduler};
pub use stream::{DepthStream, StreamFactory, StreamPool};
