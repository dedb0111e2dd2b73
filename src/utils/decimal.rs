//! Decimal arithmetic utilities for ledger calculations.

use rust_decimal::Decimal;

/// Decimal places kept on order quantities.
pub const QUANTITY_DP: u32 = 6;

/// Decimal places kept on prices and signal readings.
pub const PRICE_DP: u32 = 2;

/// Round a decimal to a specific number of decimal places.
pub fn round_to_precision(value: Decimal, decimals: u32) -> Decimal {
    value.round_dp(decimals)
}

/// Round an order quantity to ledger precision.
pub fn round_quantity(value: Decimal) -> Decimal {
    round_to_precision(value, QUANTITY_DP)
}

/// Round a price to ledger precision.
pub fn round_price(value: Decimal) -> Decimal {
    round_to_precision(value, PRICE_DP)
}

/// Quote-currency value of `quantity` units at `price`.
///
/// `None` when the product does not fit in a `Decimal`.
pub fn notional(price: Decimal, quantity: Decimal) -> Option<Decimal> {
    price.checked_mul(quantity)
}

/// Convert an `f64` sample into a decimal at the given precision.
///
/// Non-finite inputs collapse to zero.
pub fn from_f64_rounded(value: f64, decimals: u32) -> Decimal {
    Decimal::from_f64_retain(value)
        .map(|d| d.round_dp(decimals))
        .unwrap_or_default()
}

/// Check whether two decimals agree within `epsilon`.
pub fn approx_eq(a: Decimal, b: Decimal, epsilon: Decimal) -> bool {
    (a - b).abs() <= epsilon
}
