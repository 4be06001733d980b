//! Fixed-point helpers shared by settlement, valuation and the stock catalog.
//!
//! Stored prices and average buy prices keep [`PRICE_SCALE`] fractional digits.
//! Anything shown to a user is rounded half-up to [`DISPLAY_SCALE`].

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;

/// Fractional digits kept for stored prices and average buy prices.
pub const PRICE_SCALE: u32 = 4;

/// Fractional digits used for amounts shown to a user.
pub const DISPLAY_SCALE: u32 = 2;

/// Round half-up (away from zero on a tie) to `dp` places.
pub fn round_half_up(value: Decimal, dp: u32) -> Decimal {
    value.round_dp_with_strategy(dp, RoundingStrategy::MidpointAwayFromZero)
}

/// Round an amount for display, always carrying exactly two places.
pub fn display(value: Decimal) -> Decimal {
    let mut rounded = round_half_up(value, DISPLAY_SCALE);
    rounded.rescale(DISPLAY_SCALE);
    rounded
}

/// Normalize a price to storage precision.
pub fn normalize_price(price: Decimal) -> Decimal {
    round_half_up(price, PRICE_SCALE)
}

/// Exact `price × quantity`. No rounding is applied.
/// `None` when the product does not fit in a `Decimal`.
pub fn notional(price: Decimal, quantity: i64) -> Option<Decimal> {
    price.checked_mul(Decimal::from(quantity))
}

/// New average buy price after adding `quantity` shares at `price` to a
/// position of `shares` shares at `average`. `None` on overflow.
pub fn weighted_average(
    average: Decimal,
    shares: i64,
    price: Decimal,
    quantity: i64,
) -> Option<Decimal> {
    let total_shares = shares.checked_add(quantity)?;
    if total_shares <= 0 {
        return Some(normalize_price(price));
    }
    let total_cost = notional(average, shares)?.checked_add(notional(price, quantity)?)?;
    Some(normalize_price(total_cost.checked_div(Decimal::from(total_shares))?))
}

/// `part / whole × 100`, with the ratio taken to 4 places first.
/// Returns zero when `whole` is zero and saturates at the `Decimal` bounds.
pub fn percent_of(part: Decimal, whole: Decimal) -> Decimal {
    if whole.is_zero() {
        return Decimal::ZERO;
    }
    let bound = if part.is_sign_negative() == whole.is_sign_negative() {
        Decimal::MAX
    } else {
        Decimal::MIN
    };
    part.checked_div(whole)
        .and_then(|ratio| round_half_up(ratio, PRICE_SCALE).checked_mul(dec!(100)))
        .unwrap_or(bound)
}

/// Whether a price can be traded at.
pub fn is_tradable(price: Decimal) -> bool {
    price > Decimal::ZERO
}
