//! Monetary amounts are persisted as whole cents in `BIGINT` columns and handed to
//! callers as [`Decimal`]. Integer storage keeps balances exact on every backend,
//! including SQLite where `DECIMAL` columns degrade to floating point.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// Fractional digits of one cent
pub const CENT_SCALE: u32 = 2;

/// Converts `amount` to cents. `None` when it has sub-cent precision or does not fit.
pub fn to_cents(amount: Decimal) -> Option<i64> {
    if amount.normalize().scale() > CENT_SCALE {
        return None;
    }
    amount.checked_mul(Decimal::ONE_HUNDRED)?.to_i64()
}

pub fn from_cents(cents: i64) -> Decimal {
    Decimal::new(cents, CENT_SCALE)
}
