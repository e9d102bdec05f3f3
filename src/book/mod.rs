//! In-memory level-2 order book state
//!
//! One [`InMemoryOrderbook`] per tracked symbol: lock-free price-level maps
//! per side, monotonic side versions, and lazily sorted views that stay
//! snapshot-consistent against concurrent writers.

pub mod key;
pub mod memory;
pub mod types;
pub mod view;

pub use key::PriceKey;
pub use memory::{BookMap, InMemoryOrderbook, Side};
pub use types::{BookEntry, DepthSnapshot, DiffEnvelope};
pub use view::SortedView;
