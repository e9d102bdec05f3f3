//! Streaming connections and the symbol-sharded pool
//!
//! Wire transports stay behind the [`DepthStream`] seam: the pool only
//! shards symbols, drives receive loops and watches liveness. The concrete
//! exchange websocket lives in [`crate::binance`].

pub mod pool;

use crate::book::DiffEnvelope;
use crate::error::StreamError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;

pub use pool::StreamPool;

/// Where decoded diff envelopes are delivered. Bounded, FIFO, at-most-once.
pub type DiffSink = mpsc::Sender<Arc<DiffEnvelope>>;

/// One streaming connection multiplexing depth updates for a set of symbols.
///
/// Registration happens before `run`; a stream refuses symbols past its
/// capacity and the pool moves on to the next one.
#[async_trait]
pub trait DepthStream: Send + Sync {
    /// Try to add a symbol to this connection. `false` means at capacity.
    fn try_register(&self, symbol: &str) -> bool;

    /// Symbols currently registered on this connection.
    fn symbols(&self) -> Vec<String>;

    /// Receive loop. Resolves when the connection closes, errors out or
    /// [`DepthStream::stop`] is called.
    async fn run(&self) -> Result<(), StreamError>;

    /// Ask the receive loop to wind down.
    fn stop(&self);

    /// When any event last arrived on this connection.
    fn last_event(&self) -> Option<Instant>;

    /// When an event for this symbol last arrived.
    fn last_symbol_event(&self, symbol: &str) -> Option<Instant>;
}

/// Creates streaming connections for the pool.
#[async_trait]
pub trait StreamFactory: Send + Sync {
    async fn create(&self, sink: DiffSink) -> Result<Arc<dyn DepthStream>, StreamError>;
}
