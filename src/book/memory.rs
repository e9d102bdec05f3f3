//! Per-symbol order book state

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::key::PriceKey;
use super::types::{BookEntry, DepthSnapshot, DiffEnvelope};
use super::view::SortedView;

/// Which side of the book a view or entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Bid,
    Ask,
}

/// One side of a book: a lock-free price-level map plus a version counter
/// that strictly increases on every mutation of the side.
pub(crate) struct BookSide {
    levels: DashMap<PriceKey, BookEntry>,
    version: AtomicU64,
}

impl BookSide {
    fn new() -> Self {
        Self {
            levels: DashMap::new(),
            version: AtomicU64::new(0),
        }
    }

    pub(crate) fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    fn bump_version(&self) {
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn len(&self) -> usize {
        self.levels.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub(crate) fn get(&self, key: &PriceKey) -> Option<BookEntry> {
        self.levels.get(key).map(|e| e.clone())
    }

    pub(crate) fn collect_keys(&self) -> Vec<PriceKey> {
        self.levels
            .iter()
            .filter(|e| !e.quantity.is_zero())
            .map(|e| *e.key())
            .collect()
    }

    /// Apply one absolute-quantity change. Returns true when the side mutated.
    fn apply_level(
        &self,
        key: PriceKey,
        quantity: Decimal,
        time: DateTime<Utc>,
        update_id: u64,
    ) -> bool {
        if quantity.is_zero() {
            return self.levels.remove(&key).is_some();
        }
        match self.levels.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.quantity = quantity;
                entry.time = time;
                entry.update_count += 1;
                entry.last_update_id = update_id;
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(BookEntry {
                    price: key.to_decimal(),
                    quantity,
                    time,
                    update_count: 1,
                    last_update_id: update_id,
                });
            }
        }
        true
    }

    /// Reseed this side from an authoritative snapshot.
    ///
    /// Levels that predate the snapshot and are absent from it are dropped;
    /// levels touched by in-flight newer diffs survive.
    fn reseed(
        &self,
        levels: &[(Decimal, Decimal)],
        snapshot_id: u64,
        now: DateTime<Utc>,
        scale: u32,
    ) {
        let snapshot_keys: HashSet<PriceKey> = levels
            .iter()
            .map(|(price, _)| PriceKey::from_price(*price, scale))
            .collect();

        self.levels
            .retain(|key, entry| entry.last_update_id >= snapshot_id || snapshot_keys.contains(key));

        for (price, quantity) in levels {
            if quantity.is_zero() {
                continue;
            }
            self.apply_level(PriceKey::from_price(*price, scale), *quantity, now, snapshot_id);
        }

        self.bump_version();
    }

    fn drop_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.levels.len();
        self.levels.retain(|_, entry| entry.time >= cutoff);
        let removed = before - self.levels.len();
        if removed > 0 {
            self.bump_version();
        }
        removed
    }

    fn reset_statistics(&self) {
        for mut entry in self.levels.iter_mut() {
            entry.update_count = 0;
        }
    }
}

/// In-memory mirror of one symbol's level-2 book.
///
/// Point reads go straight to the lock-free maps; compound operations
/// (diff/snapshot application, view materialization, maintenance) serialize
/// on [`InMemoryOrderbook::guard`]. The guard is never held across await
/// points.
pub struct InMemoryOrderbook {
    symbol: String,
    price_scale: u32,
    bids: BookSide,
    asks: BookSide,
    last_update_id: AtomicU64,
    op_lock: Mutex<()>,
}

impl InMemoryOrderbook {
    pub fn new(symbol: impl Into<String>, price_scale: u32) -> Self {
        Self {
            symbol: symbol.into(),
            price_scale,
            bids: BookSide::new(),
            asks: BookSide::new(),
            last_update_id: AtomicU64::new(0),
            op_lock: Mutex::new(()),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn price_scale(&self) -> u32 {
        self.price_scale
    }

    /// Highest sequence number ever applied (or the latest snapshot's id).
    pub fn last_update_id(&self) -> u64 {
        self.last_update_id.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    pub fn bid_version(&self) -> u64 {
        self.bids.version()
    }

    pub fn ask_version(&self) -> u64 {
        self.asks.version()
    }

    pub fn depth(&self) -> (usize, usize) {
        (self.bids.len(), self.asks.len())
    }

    /// Serialize a compound operation against this book.
    pub fn guard(&self) -> MutexGuard<'_, ()> {
        self.op_lock.lock()
    }

    /// Sequence-continuity check for a diff about to be applied.
    ///
    /// Call with the guard held so the answer stays valid through the apply.
    pub fn has_gap(&self, diff: &DiffEnvelope) -> bool {
        diff.first_update_id > self.last_update_id() + 1 || self.is_empty()
    }

    /// Apply an incremental diff. Call with the guard held.
    ///
    /// The book never rejects a gapped diff; gap handling belongs to the
    /// ingest layer.
    pub fn apply_diff(&self, diff: &DiffEnvelope) {
        let mut bids_mutated = false;
        for (price, quantity) in &diff.bids {
            bids_mutated |= self.bids.apply_level(
                PriceKey::from_price(*price, self.price_scale),
                *quantity,
                diff.event_time,
                diff.final_update_id,
            );
        }
        if bids_mutated {
            self.bids.bump_version();
        }

        let mut asks_mutated = false;
        for (price, quantity) in &diff.asks {
            asks_mutated |= self.asks.apply_level(
                PriceKey::from_price(*price, self.price_scale),
                *quantity,
                diff.event_time,
                diff.final_update_id,
            );
        }
        if asks_mutated {
            self.asks.bump_version();
        }

        self.last_update_id
            .fetch_max(diff.final_update_id, Ordering::AcqRel);
    }

    /// Reseed the book from an authoritative HTTP snapshot. Call with the
    /// guard held.
    ///
    /// The snapshot wins against strictly-older state: levels it does not
    /// list and that no newer diff has touched are dropped, and the book's
    /// sequence counter is reset to the snapshot's id even when that moves it
    /// backwards.
    pub fn apply_snapshot(&self, snapshot: &DepthSnapshot, now: DateTime<Utc>) {
        self.bids
            .reseed(&snapshot.bids, snapshot.last_update_id, now, self.price_scale);
        self.asks
            .reseed(&snapshot.asks, snapshot.last_update_id, now, self.price_scale);
        self.last_update_id
            .store(snapshot.last_update_id, Ordering::Release);
    }

    /// Remove entries older than the cutoff. Call with the guard held.
    pub fn drop_outdated(&self, cutoff: DateTime<Utc>) -> usize {
        self.bids.drop_older_than(cutoff) + self.asks.drop_older_than(cutoff)
    }

    /// Zero per-entry update counters without touching quantities or
    /// versions. Call with the guard held.
    pub fn reset_statistics(&self) {
        self.bids.reset_statistics();
        self.asks.reset_statistics();
    }

    pub(crate) fn side(&self, side: Side) -> &BookSide {
        match side {
            Side::Bid => &self.bids,
            Side::Ask => &self.asks,
        }
    }

    /// Lazy sorted projection of the bid side (descending by price).
    pub fn bid_view(self: &Arc<Self>) -> SortedView {
        SortedView::new(Arc::clone(self), Side::Bid)
    }

    /// Lazy sorted projection of the ask side (ascending by price).
    pub fn ask_view(self: &Arc<Self>) -> SortedView {
        SortedView::new(Arc::clone(self), Side::Ask)
    }

    /// Both sides as fresh, not-yet-materialized views.
    pub fn views(self: &Arc<Self>) -> (SortedView, SortedView) {
        (self.bid_view(), self.ask_view())
    }
}

/// All books, keyed by symbol. Books are created on first touch and share
/// one price scale.
pub struct BookMap {
    books: DashMap<String, Arc<InMemoryOrderbook>>,
    price_scale: u32,
}

impl BookMap {
    pub fn new(price_scale: u32) -> Self {
        Self {
            books: DashMap::new(),
            price_scale,
        }
    }

    pub fn get(&self, symbol: &str) -> Option<Arc<InMemoryOrderbook>> {
        self.books.get(symbol).map(|b| Arc::clone(&b))
    }

    pub fn get_or_create(&self, symbol: &str) -> Arc<InMemoryOrderbook> {
        self.books
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(InMemoryOrderbook::new(symbol, self.price_scale)))
            .clone()
    }

    /// Symbols that currently have a book, in no particular order.
    pub fn symbols(&self) -> Vec<String> {
        self.books.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.books.len()
    }

    pub fn is_empty(&self) -> bool {
        self.books.is_empty()
    }
}

impl std::fmt::Debug for InMemoryOrderbook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryOrderbook")
            .field("symbol", &self.symbol)
            .field("bids", &self.bids.len())
            .field("asks", &self.asks.len())
            .field("last_update_id", &self.last_update_id())
            .finish()
    }
}
