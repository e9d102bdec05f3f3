//! Book entries and the envelopes that mutate them

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use super::key::PriceKey;

/// One price level of one side of a book.
///
/// `update_count` is a running statistic (updates since the last reset);
/// `last_update_id` is the sequence number of the diff or snapshot that last
/// touched this level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookEntry {
    pub price: Decimal,
    pub quantity: Decimal,
    pub time: DateTime<Utc>,
    pub update_count: u64,
    pub last_update_id: u64,
}

impl BookEntry {
    /// Placeholder for a level that vanished between view materialization and
    /// iteration. Consumers treat zero quantity as "level gone mid-view".
    pub(crate) fn vanished(key: PriceKey, now: DateTime<Utc>) -> Self {
        Self {
            price: key.to_decimal(),
            quantity: Decimal::ZERO,
            time: now,
            update_count: 0,
            last_update_id: 0,
        }
    }
}

/// Incremental depth update for one symbol.
///
/// Bid/ask changes are absolute-quantity replacements at each level; a zero
/// quantity deletes the level. Envelopes travel through the ingest queue as
/// `Arc<DiffEnvelope>` so concurrent readers share one immutable payload.
#[derive(Debug, Clone)]
pub struct DiffEnvelope {
    pub symbol: String,
    pub first_update_id: u64,
    pub final_update_id: u64,
    pub bids: Vec<(Decimal, Decimal)>,
    pub asks: Vec<(Decimal, Decimal)>,
    pub event_time: DateTime<Utc>,
}

/// Authoritative order book snapshot fetched over HTTP.
#[derive(Debug, Clone)]
pub struct DepthSnapshot {
    pub last_update_id: u64,
    pub bids: Vec<(Decimal, Decimal)>,
    pub asks: Vec<(Decimal, Decimal)>,
    pub timestamp: DateTime<Utc>,
}
