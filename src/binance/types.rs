//! Binance wire types
//!
//! Typed shapes for the REST and websocket payloads the mirror consumes,
//! with conversions into the exchange-neutral domain types.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;

use crate::book::{DepthSnapshot, DiffEnvelope};
use crate::error::{RestError, StreamError};

/// Response from `GET /api/v3/depth`.
///
/// Price/quantity pairs arrive as strings to preserve precision.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepthResponse {
    pub last_update_id: u64,
    pub bids: Vec<[String; 2]>,
    pub asks: Vec<[String; 2]>,
}

impl DepthResponse {
    /// Decode string levels into an authoritative snapshot.
    pub fn into_snapshot(self, now: DateTime<Utc>) -> Result<DepthSnapshot, RestError> {
        Ok(DepthSnapshot {
            last_update_id: self.last_update_id,
            bids: parse_levels(&self.bids, "bid")?,
            asks: parse_levels(&self.asks, "ask")?,
            timestamp: now,
        })
    }
}

fn parse_levels(
    levels: &[[String; 2]],
    side: &str,
) -> Result<Vec<(Decimal, Decimal)>, RestError> {
    levels
        .iter()
        .map(|[price, qty]| {
            let price = Decimal::from_str(price)
                .map_err(|e| RestError::Parse(format!("invalid {side} price {price:?}: {e}")))?;
            let qty = Decimal::from_str(qty)
                .map_err(|e| RestError::Parse(format!("invalid {side} qty {qty:?}: {e}")))?;
            Ok((price, qty))
        })
        .collect()
}

/// Subset of `GET /api/v3/exchangeInfo` the mirror cares about.
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeInfo {
    pub symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    pub status: String,
}

impl SymbolInfo {
    pub fn is_trading(&self) -> bool {
        self.status == "TRADING"
    }
}

/// Depth update event from a `<symbol>@depth@100ms` stream.
#[derive(Debug, Clone, Deserialize)]
pub struct DepthUpdateEvent {
    #[serde(rename = "e")]
    pub event_type: String,

    #[serde(rename = "E")]
    pub event_time: i64,

    #[serde(rename = "s")]
    pub symbol: String,

    #[serde(rename = "U")]
    pub first_update_id: u64,

    #[serde(rename = "u")]
    pub final_update_id: u64,

    #[serde(rename = "b")]
    pub bids: Vec<[String; 2]>,

    #[serde(rename = "a")]
    pub asks: Vec<[String; 2]>,
}

impl DepthUpdateEvent {
    /// Decode into a domain diff envelope.
    pub fn into_envelope(self) -> Result<DiffEnvelope, StreamError> {
        let decode = |levels: &[[String; 2]], side: &str| {
            parse_levels(levels, side).map_err(|e| StreamError::Protocol(e.to_string()))
        };
        Ok(DiffEnvelope {
            bids: decode(&self.bids, "bid")?,
            asks: decode(&self.asks, "ask")?,
            symbol: self.symbol,
            first_update_id: self.first_update_id,
            final_update_id: self.final_update_id,
            event_time: Utc
                .timestamp_millis_opt(self.event_time)
                .single()
                .unwrap_or_else(Utc::now),
        })
    }
}

/// Envelope used by the combined-stream endpoint
/// (`/stream?streams=a@depth@100ms/b@depth@100ms`).
#[derive(Debug, Clone, Deserialize)]
pub struct CombinedStreamEvent {
    pub stream: String,
    pub data: DepthUpdateEvent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn depth_update_deserializes_from_wire_shape() {
        let json = r#"{
            "e": "depthUpdate",
            "E": 1699999999123,
            "s": "BTCUSDT",
            "U": 1000,
            "u": 1005,
            "b": [["67650.00", "1.23400"], ["67649.50", "0"]],
            "a": [["67651.00", "0.98700"]]
        }"#;

        let event: DepthUpdateEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.event_type, "depthUpdate");
        assert_eq!(event.symbol, "BTCUSDT");
        assert_eq!(event.first_update_id, 1000);
        assert_eq!(event.final_update_id, 1005);

        let envelope = event.into_envelope().unwrap();
        assert_eq!(envelope.bids[0], (dec!(67650.00), dec!(1.234)));
        assert_eq!(envelope.bids[1].1, Decimal::ZERO);
        assert_eq!(envelope.asks.len(), 1);
        assert_eq!(envelope.event_time.timestamp_millis(), 1699999999123);
    }

    #[test]
    fn combined_event_carries_stream_name() {
        let json = r#"{
            "stream": "btcusdt@depth@100ms",
            "data": {
                "e": "depthUpdate", "E": 1, "s": "BTCUSDT",
                "U": 5, "u": 6, "b": [], "a": []
            }
        }"#;
        let event: CombinedStreamEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.stream, "btcusdt@depth@100ms");
        assert_eq!(event.data.first_update_id, 5);
    }

    #[test]
    fn depth_response_converts_to_snapshot() {
        let json = r#"{
            "lastUpdateId": 160,
            "bids": [["10.00", "1.5"]],
            "asks": [["11.00", "2.5"]]
        }"#;
        let response: DepthResponse = serde_json::from_str(json).unwrap();
        let snapshot = response.into_snapshot(Utc::now()).unwrap();
        assert_eq!(snapshot.last_update_id, 160);
        assert_eq!(snapshot.bids, vec![(dec!(10.00), dec!(1.5))]);
        assert_eq!(snapshot.asks, vec![(dec!(11.00), dec!(2.5))]);
    }

    #[test]
    fn malformed_price_is_a_parse_error() {
        let json = r#"{
            "lastUpdateId": 1,
            "bids": [["not-a-price", "1.5"]],
            "asks": []
        }"#;
        let response: DepthResponse = serde_json::from_str(json).unwrap();
        assert!(matches!(
            response.into_snapshot(Utc::now()),
            Err(RestError::Parse(_))
        ));
    }

    #[test]
    fn trading_status_filter() {
        let info = SymbolInfo {
            symbol: "BTCUSDT".to_string(),
            status: "TRADING".to_string(),
        };
        assert!(info.is_trading());
        let halted = SymbolInfo {
            symbol: "OLDUSDT".to_string(),
            status: "BREAK".to_string(),
        };
        assert!(!halted.is_trading());
    }
}
