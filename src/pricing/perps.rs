//! Perpetual-futures math: unrealized P&L, liquidation price, funding.

use crate::models::PerpSide;

/// Unrealized P&L of an open position at the given mark price.
///
/// `size` is notional in cash units, so the position holds `size / entry`
/// contracts and each unit of favorable price movement earns that many
/// cash units.
pub fn unrealized_pnl(entry: f64, mark: f64, side: PerpSide, size: f64) -> f64 {
    let move_ = match side {
        PerpSide::Long => mark - entry,
        PerpSide::Short => entry - mark,
    };
    move_ * size / entry
}

/// Price at which the position's margin is exhausted down to the
/// maintenance fraction `m`.
pub fn liquidation_price(entry: f64, side: PerpSide, leverage: f64, m: f64) -> f64 {
    match side {
        PerpSide::Long => entry * (1.0 - 1.0 / leverage + m),
        PerpSide::Short => entry * (1.0 + 1.0 / leverage - m),
    }
}

/// A position is liquidatable when the mark has crossed its liquidation
/// price in the adverse direction. Crossing exactly at the liquidation
/// price closes at zero margin, not negative.
pub fn is_liquidatable(mark: f64, liq_price: f64, side: PerpSide) -> bool {
    match side {
        PerpSide::Long => mark <= liq_price,
        PerpSide::Short => mark >= liq_price,
    }
}

/// Signed funding payment for one funding interval.
///
/// Positive `funding_rate` means longs pay shorts: the returned value is
/// the cash delta applied to the position holder (negative for the payer).
pub fn funding_payment(funding_rate: f64, side: PerpSide, size: f64) -> f64 {
    match side {
        PerpSide::Long => -funding_rate * size,
        PerpSide::Short => funding_rate * size,
    }
}
