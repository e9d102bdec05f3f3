//! Integer-encoded price levels

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// A price level rounded to a fixed number of decimal digits and encoded as
/// an integer, so it is totally orderable and cheap to hash.
///
/// Ordering compares the integer form first; two keys built with the same
/// scale are equal exactly when they display the same price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PriceKey {
    raw: i64,
    scale: u32,
}

impl PriceKey {
    /// Encode a price at the given scale (`raw = round(price * 10^scale)`).
    ///
    /// Prices beyond the representable range saturate rather than wrap.
    pub fn from_price(price: Decimal, scale: u32) -> Self {
        debug_assert!(scale <= 18, "price scale out of range");
        let factor = Decimal::from(10_i64.saturating_pow(scale.min(18)));
        let raw = (price * factor)
            .round()
            .to_i64()
            .unwrap_or(if price.is_sign_negative() {
                i64::MIN
            } else {
                i64::MAX
            });
        Self { raw, scale }
    }

    /// The rounded price this key encodes.
    pub fn to_decimal(self) -> Decimal {
        Decimal::new(self.raw, self.scale)
    }

    pub fn raw(self) -> i64 {
        self.raw
    }
}
