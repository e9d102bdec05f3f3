//! Binance websocket depth stream
//!
//! One connection multiplexes `<symbol>@depth@100ms` streams through the
//! combined-stream endpoint. The receive loop decodes frames into diff
//! envelopes, forwards them into the ingest queue and tracks per-symbol
//! liveness for the pool monitor. A closed connection surfaces as a stream
//! error; reconnection is the orchestrator's job, via pool rebuild.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::StreamError;
use crate::stream::{DepthStream, DiffSink, StreamFactory};

use super::types::CombinedStreamEvent;

const DEFAULT_WS_URL: &str = "wss://stream.binance.com:9443";

/// Symbols one connection will accept; past this the pool spills to the
/// next stream.
const MAX_SYMBOLS_PER_CONNECTION: usize = 256;

#[derive(Default)]
struct Liveness {
    global: Option<Instant>,
    per_symbol: HashMap<String, Instant>,
}

/// One websocket connection carrying depth diffs for its registered symbols.
pub struct BinanceDepthStream {
    base_url: String,
    capacity: usize,
    sink: DiffSink,
    symbols: Mutex<Vec<String>>,
    liveness: Mutex<Liveness>,
    stop: CancellationToken,
}

impl BinanceDepthStream {
    fn new(base_url: String, capacity: usize, sink: DiffSink) -> Self {
        Self {
            base_url,
            capacity,
            sink,
            symbols: Mutex::new(Vec::new()),
            liveness: Mutex::new(Liveness::default()),
            stop: CancellationToken::new(),
        }
    }

    fn stream_url(&self) -> String {
        let names: Vec<String> = self
            .symbols
            .lock()
            .iter()
            .map(|symbol| format!("{}@depth@100ms", symbol.to_lowercase()))
            .collect();
        format!("{}/stream?streams={}", self.base_url, names.join("/"))
    }

    fn record_event(&self, symbol: &str) {
        let now = Instant::now();
        let mut liveness = self.liveness.lock();
        liveness.global = Some(now);
        liveness.per_symbol.insert(symbol.to_string(), now);
    }
}

#[async_trait]
impl DepthStream for BinanceDepthStream {
    fn try_register(&self, symbol: &str) -> bool {
        let mut symbols = self.symbols.lock();
        if symbols.len() >= self.capacity {
            return false;
        }
        symbols.push(symbol.to_uppercase());
        true
    }

    fn symbols(&self) -> Vec<String> {
        self.symbols.lock().clone()
    }

    async fn run(&self) -> Result<(), StreamError> {
        if self.symbols.lock().is_empty() {
            self.stop.cancelled().await;
            return Ok(());
        }

        let url = self.stream_url();
        info!(url = %url, "Connecting depth stream");
        let (ws, _) = tokio::select! {
            _ = self.stop.cancelled() => return Ok(()),
            connected = connect_async(&url) => {
                connected.map_err(|e| StreamError::Connect(e.to_string()))?
            }
        };
        info!(symbols = self.symbols.lock().len(), "Depth stream connected");

        let (mut write, mut read) = ws.split();

        loop {
            let message = tokio::select! {
                _ = self.stop.cancelled() => {
                    debug!("Depth stream stopped");
                    return Ok(());
                }
                next = read.next() => match next {
                    Some(message) => message,
                    None => return Err(StreamError::Closed("connection ended".to_string())),
                },
            };

            match message {
                Ok(Message::Text(text)) => {
                    match serde_json::from_str::<CombinedStreamEvent>(text.as_str()) {
                        Ok(event) => {
                            self.record_event(&event.data.symbol);
                            let envelope = match event.data.into_envelope() {
                                Ok(envelope) => envelope,
                                Err(e) => {
                                    warn!(error = %e, "Dropping undecodable depth update");
                                    continue;
                                }
                            };
                            if self.sink.send(Arc::new(envelope)).await.is_err() {
                                info!("Diff queue closed, ending depth stream");
                                return Ok(());
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to parse stream frame");
                        }
                    }
                }
                Ok(Message::Ping(payload)) => {
                    if write.send(Message::Pong(payload)).await.is_err() {
                        return Err(StreamError::Closed("pong send failed".to_string()));
                    }
                }
                Ok(Message::Pong(_)) => {}
                Ok(Message::Close(frame)) => {
                    debug!(frame = ?frame, "Close frame received");
                    return Err(StreamError::Closed("close frame".to_string()));
                }
                Ok(_) => {}
                Err(e) => {
                    return Err(StreamError::Closed(e.to_string()));
                }
            }
        }
    }

    fn stop(&self) {
        self.stop.cancel();
    }

    fn last_event(&self) -> Option<Instant> {
        self.liveness.lock().global
    }

    fn last_symbol_event(&self, symbol: &str) -> Option<Instant> {
        self.liveness.lock().per_symbol.get(symbol).copied()
    }
}

/// Creates depth stream connections for the pool.
pub struct BinanceStreamFactory {
    base_url: String,
    capacity: usize,
}

impl BinanceStreamFactory {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_WS_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            capacity: MAX_SYMBOLS_PER_CONNECTION,
        }
    }
}

impl Default for BinanceStreamFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamFactory for BinanceStreamFactory {
    async fn create(&self, sink: DiffSink) -> Result<Arc<dyn DepthStream>, StreamError> {
        Ok(Arc::new(BinanceDepthStream::new(
            self.base_url.clone(),
            self.capacity,
            sink,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn stream(capacity: usize) -> BinanceDepthStream {
        let (sink, _rx) = mpsc::channel(8);
        BinanceDepthStream::new(DEFAULT_WS_URL.to_string(), capacity, sink)
    }

    #[test]
    fn registration_respects_capacity() {
        let stream = stream(2);
        assert!(stream.try_register("btcusdt"));
        assert!(stream.try_register("ETHUSDT"));
        assert!(!stream.try_register("XRPUSDT"));
        assert_eq!(stream.symbols(), vec!["BTCUSDT", "ETHUSDT"]);
    }

    #[test]
    fn combined_stream_url_lists_every_symbol() {
        let stream = stream(8);
        stream.try_register("BTCUSDT");
        stream.try_register("ETHUSDT");
        assert_eq!(
            stream.stream_url(),
            format!(
                "{}/stream?streams=btcusdt@depth@100ms/ethusdt@depth@100ms",
                DEFAULT_WS_URL
            )
        );
    }

    #[test]
    fn liveness_starts_empty_and_tracks_events() {
        let stream = stream(8);
        assert!(stream.last_event().is_none());
        stream.record_event("BTCUSDT");
        assert!(stream.last_event().is_some());
        assert!(stream.last_symbol_event("BTCUSDT").is_some());
        assert!(stream.last_symbol_event("ETHUSDT").is_none());
    }
}
