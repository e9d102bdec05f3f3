//! Snapshot-consistent sorted views over one side of a book

use chrono::Utc;
use std::sync::Arc;

use crate::error::ViewError;

use super::key::PriceKey;
use super::memory::{InMemoryOrderbook, Side};
use super::types::BookEntry;

/// Retries before `enforce` falls back to sorting under the book lock.
const MAX_ENFORCE_RETRIES: usize = 8;

/// Lazy, ordered projection of one side of one book.
///
/// Materialization copies the key set under the book lock and sorts outside
/// it; the captured side version tells whether the sorted key list still
/// reflects the live map. Asks iterate ascending, bids descending.
pub struct SortedView {
    book: Arc<InMemoryOrderbook>,
    side: Side,
    captured_version: Option<u64>,
    keys: Option<Vec<PriceKey>>,
}

impl SortedView {
    pub(crate) fn new(book: Arc<InMemoryOrderbook>, side: Side) -> Self {
        Self {
            book,
            side,
            captured_version: None,
            keys: None,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn symbol(&self) -> &str {
        self.book.symbol()
    }

    /// The side version recorded at materialization time, if any.
    pub fn captured_version(&self) -> Option<u64> {
        self.captured_version
    }

    fn current_version(&self) -> u64 {
        self.book.side(self.side).version()
    }

    fn sort(&self, keys: &mut [PriceKey]) {
        match self.side {
            Side::Ask => keys.sort_unstable(),
            Side::Bid => keys.sort_unstable_by(|a, b| b.cmp(a)),
        }
    }

    /// Copy the live key set under the book lock, then sort without it.
    pub fn materialize(&mut self) {
        let (mut keys, version) = {
            let _guard = self.book.guard();
            let side = self.book.side(self.side);
            (side.collect_keys(), side.version())
        };
        self.sort(&mut keys);
        self.keys = Some(keys);
        self.captured_version = Some(version);
    }

    /// Materialize until the captured version holds after the sort, so the
    /// view is a consistent snapshot even against concurrent writers.
    ///
    /// Bounded: after [`MAX_ENFORCE_RETRIES`] attempts the final
    /// materialization sorts while holding the book lock.
    pub fn enforce(&mut self) {
        for _ in 0..MAX_ENFORCE_RETRIES {
            self.materialize();
            if self.captured_version == Some(self.current_version()) {
                return;
            }
        }

        let _guard = self.book.guard();
        let side = self.book.side(self.side);
        let mut keys = side.collect_keys();
        self.sort(&mut keys);
        self.keys = Some(keys);
        self.captured_version = Some(side.version());
    }

    /// Error when the side has mutated since this view was materialized.
    pub fn check_concurrent_modification(&self) -> Result<(), ViewError> {
        let captured = self.captured_version.ok_or(ViewError::NotMaterialized)?;
        let current = self.current_version();
        if captured != current {
            return Err(ViewError::ConcurrentModification { captured, current });
        }
        Ok(())
    }

    /// Number of levels captured at materialization.
    pub fn len(&self) -> usize {
        self.keys.as_ref().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate entries in the captured order.
    ///
    /// A key removed since materialization yields a zero-quantity placeholder
    /// so consumers see "level vanished mid-view" instead of a hole.
    pub fn entries(&self) -> impl Iterator<Item = BookEntry> + '_ {
        let side = self.book.side(self.side);
        self.keys
            .as_deref()
            .unwrap_or(&[])
            .iter()
            .map(move |key| match side.get(key) {
                Some(entry) => entry,
                None => BookEntry::vanished(*key, Utc::now()),
            })
    }

    /// Best level of this side (highest bid or lowest ask).
    pub fn best(&self) -> Option<BookEntry> {
        self.entries().next()
    }
}

impl std::fmt::Debug for SortedView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SortedView")
            .field("symbol", &self.symbol())
            .field("side", &self.side)
            .field("levels", &self.len())
            .field("captured_version", &self.captured_version)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::types::DiffEnvelope;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn seeded_book() -> Arc<InMemoryOrderbook> {
        let book = Arc::new(InMemoryOrderbook::new("ETHUSDT", 8));
        book.apply_diff(&DiffEnvelope {
            symbol: "ETHUSDT".to_string(),
            first_update_id: 1,
            final_update_id: 1,
            bids: vec![
                (dec!(99.5), dec!(1.0)),
                (dec!(100.0), dec!(2.0)),
                (dec!(98.0), dec!(3.0)),
            ],
            asks: vec![
                (dec!(101.0), dec!(1.5)),
                (dec!(100.5), dec!(0.5)),
                (dec!(103.0), dec!(2.5)),
            ],
            event_time: Utc::now(),
        });
        book
    }

    #[test]
    fn asks_ascend_and_bids_descend() {
        let book = seeded_book();

        let mut asks = book.ask_view();
        asks.enforce();
        let ask_prices: Vec<Decimal> = asks.entries().map(|e| e.price).collect();
        assert_eq!(ask_prices, vec![dec!(100.5), dec!(101.0), dec!(103.0)]);

        let mut bids = book.bid_view();
        bids.enforce();
        let bid_prices: Vec<Decimal> = bids.entries().map(|e| e.price).collect();
        assert_eq!(bid_prices, vec![dec!(100.0), dec!(99.5), dec!(98.0)]);
    }

    #[test]
    fn unmaterialized_view_is_empty() {
        let book = seeded_book();
        let view = book.ask_view();
        assert!(view.is_empty());
        assert_eq!(view.entries().count(), 0);
        assert!(view.check_concurrent_modification().is_err());
    }

    #[test]
    fn stale_view_reports_concurrent_modification() {
        let book = seeded_book();
        let mut view = book.bid_view();
        view.enforce();
        assert!(view.check_concurrent_modification().is_ok());

        book.apply_diff(&DiffEnvelope {
            symbol: "ETHUSDT".to_string(),
            first_update_id: 2,
            final_update_id: 2,
            bids: vec![(dec!(97.0), dec!(1.0))],
            asks: vec![],
            event_time: Utc::now(),
        });

        assert!(matches!(
            view.check_concurrent_modification(),
            Err(ViewError::ConcurrentModification { .. })
        ));

        // Re-enforcing catches the view back up.
        view.enforce();
        assert!(view.check_concurrent_modification().is_ok());
        assert_eq!(view.len(), 4);
    }

    #[test]
    fn vanished_key_yields_zero_quantity_placeholder() {
        let book = seeded_book();
        let mut view = book.ask_view();
        view.enforce();

        // Level removed after materialization.
        book.apply_diff(&DiffEnvelope {
            symbol: "ETHUSDT".to_string(),
            first_update_id: 2,
            final_update_id: 2,
            bids: vec![],
            asks: vec![(dec!(100.5), dec!(0))],
            event_time: Utc::now(),
        });

        let entries: Vec<BookEntry> = view.entries().collect();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].price, dec!(100.5));
        assert!(entries[0].quantity.is_zero());
        assert_eq!(entries[1].quantity, dec!(1.5));
    }

    #[test]
    fn enforce_terminates_against_a_concurrent_writer() {
        let book = seeded_book();
        let writer_book = Arc::clone(&book);
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let writer_stop = Arc::clone(&stop);

        let writer = std::thread::spawn(move || {
            let mut id = 10u64;
            while !writer_stop.load(std::sync::atomic::Ordering::Relaxed) {
                writer_book.apply_diff(&DiffEnvelope {
                    symbol: "ETHUSDT".to_string(),
                    first_update_id: id,
                    final_update_id: id,
                    bids: vec![(dec!(95.0) + Decimal::from(id % 7), dec!(1.0))],
                    asks: vec![],
                    event_time: Utc::now(),
                });
                id += 1;
            }
        });

        for _ in 0..50 {
            let mut view = book.bid_view();
            view.enforce();
            assert!(view.captured_version().is_some());
        }

        stop.store(true, std::sync::atomic::Ordering::Relaxed);
        writer.join().unwrap();
    }
}
