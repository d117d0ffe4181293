//! Spot price for pool-backed tickers, driven by net open holdings.

use crate::models::PerpSide;

const FUNDING_EPSILON: f64 = 1e-9;

/// Holdings-weighted spot price.
///
/// `net_signed_size` is `sum(+size for LONG, -size for SHORT)` over all
/// open positions on the ticker; the synthetic supply `s` fixes how much
/// net flow moves the quote. The result is clamped to
/// `[max(0.01, p0 * 0.01), p0 * 100]`.
pub fn spot_price(p0: f64, synthetic_supply: f64, net_signed_size: f64) -> f64 {
    let raw = (p0 * synthetic_supply + net_signed_size) / synthetic_supply;
    clamp_price(raw, p0)
}

pub fn clamp_price(price: f64, p0: f64) -> f64 {
    let floor = (p0 * 0.01).max(0.01);
    let ceil = p0 * 100.0;
    price.clamp(floor, ceil)
}

pub fn signed_size(side: PerpSide, size: f64) -> f64 {
    match side {
        PerpSide::Long => size,
        PerpSide::Short => -size,
    }
}

/// Funding rate from open-interest skew:
/// `k * (oi_long - oi_short) / (oi_long + oi_short + eps)`.
pub fn funding_rate_from_skew(k: f64, oi_long: f64, oi_short: f64) -> f64 {
    k * (oi_long - oi_short) / (oi_long + oi_short + FUNDING_EPSILON)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn balanced_book_quotes_initial_price() {
        assert!((spot_price(50.0, 10_000.0, 0.0) - 50.0).abs() < 1e-12);
    }

    #[test]
    fn net_longs_push_price_up() {
        let up = spot_price(50.0, 10_000.0, 5_000.0);
        let down = spot_price(50.0, 10_000.0, -5_000.0);
        assert!(up > 50.0);
        assert!(down < 50.0);
    }

    #[test]
    fn clamp_bounds_hold() {
        assert!((spot_price(50.0, 10.0, -1e9) - 0.5).abs() < 1e-12); // floor 50*0.01
        assert!((spot_price(50.0, 10.0, 1e9) - 5000.0).abs() < 1e-12); // ceil 50*100
        // Low-priced tickers floor at the absolute 0.01.
        assert!((spot_price(0.5, 10.0, -1e9) - 0.01).abs() < 1e-12);
    }

    #[test]
    fn funding_rate_sign_follows_skew() {
        assert!(funding_rate_from_skew(0.0001, 1000.0, 0.0) > 0.0);
        assert!(funding_rate_from_skew(0.0001, 0.0, 1000.0) < 0.0);
        assert_eq!(funding_rate_from_skew(0.0001, 0.0, 0.0), 0.0);
    }

    proptest! {
        #[test]
        fn price_always_within_clamp(
            p0 in 0.02..10_000.0f64,
            supply in 1.0..1_000_000.0f64,
            net in -1e9..1e9f64,
        ) {
            let p = spot_price(p0, supply, net);
            prop_assert!(p >= (p0 * 0.01).max(0.01) - 1e-12);
            prop_assert!(p <= p0 * 100.0 + 1e-9);
        }

        #[test]
        fn funding_rate_bounded_by_k(
            k in 0.00001..0.01f64,
            oi_long in 0.0..1e9f64,
            oi_short in 0.0..1e9f64,
        ) {
            let rate = funding_rate_from_skew(k, oi_long, oi_short);
            prop_assert!(rate.abs() <= k + 1e-12);
        }
    }
}
