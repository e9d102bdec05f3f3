//! Binance collaborators
//!
//! Concrete implementations of the exchange-facing seams: the REST client
//! behind [`crate::exchange::SnapshotSource`] and the websocket depth stream
//! behind [`crate::stream::DepthStream`], plus the client-side rate limiter
//! guarding REST traffic.

pub mod client;
pub mod rate_limiter;
pub mod types;
pub mod websocket;

pub use client::BinanceRestClient;
pub use rate_limiter::RestRateLimiter;
pub use websocket::{BinanceDepthStream, BinanceStreamFactory};
