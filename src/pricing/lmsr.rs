//! LMSR market maker math for binary prediction markets.
//!
//! Cost function `C(q) = b * ln(e^{q_yes/b} + e^{q_no/b})`. The price of a
//! YES share is the partial derivative of C with respect to q_yes, which
//! keeps `price_yes + price_no == 1` by construction. Buying `d` YES
//! shares costs `C(q_yes + d, q_no) - C(q_yes, q_no)`.

use crate::error::{EngineError, EngineResult};
use crate::models::PredictionSide;

/// Bisection tolerance for inverting the cost function.
const CASH_TOLERANCE: f64 = 1e-9;
/// Maximum bisection iterations; the cost function is strictly monotone in
/// the share delta, so 64 halvings are ample for f64 precision.
const MAX_ITERATIONS: usize = 64;

/// LMSR cost function, computed in log-sum-exp form so large share
/// quantities do not overflow the exponentials.
pub fn cost(q_yes: f64, q_no: f64, b: f64) -> f64 {
    let m = q_yes.max(q_no);
    m + b * (((q_yes - m) / b).exp() + ((q_no - m) / b).exp()).ln()
}

/// Instantaneous YES price in (0, 1).
pub fn price_yes(q_yes: f64, q_no: f64, b: f64) -> f64 {
    // Equivalent to e^{qy/b} / (e^{qy/b} + e^{qn/b}), shifted for stability.
    let m = q_yes.max(q_no);
    let ey = ((q_yes - m) / b).exp();
    let en = ((q_no - m) / b).exp();
    ey / (ey + en)
}

/// Result of quoting a trade against the market maker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LmsrQuote {
    pub shares: f64,
    pub cash: f64,
    pub new_q_yes: f64,
    pub new_q_no: f64,
}

fn apply_delta(q_yes: f64, q_no: f64, side: PredictionSide, delta: f64) -> (f64, f64) {
    match side {
        PredictionSide::Yes => (q_yes + delta, q_no),
        PredictionSide::No => (q_yes, q_no + delta),
    }
}

/// Quote a buy of `shares` shares on `side`. A zero-share buy is a no-op
/// quote (zero cash, unchanged state); a positive-share buy always quotes
/// strictly positive cash.
pub fn quote_buy_shares(
    q_yes: f64,
    q_no: f64,
    b: f64,
    side: PredictionSide,
    shares: f64,
) -> EngineResult<LmsrQuote> {
    validate_state(q_yes, q_no, b)?;
    if !shares.is_finite() || shares < 0.0 {
        return Err(EngineError::InvariantViolation(format!(
            "lmsr buy with invalid share count {shares}"
        )));
    }
    if shares == 0.0 {
        return Ok(LmsrQuote {
            shares: 0.0,
            cash: 0.0,
            new_q_yes: q_yes,
            new_q_no: q_no,
        });
    }

    let (nq_yes, nq_no) = apply_delta(q_yes, q_no, side, shares);
    let cash = cost(nq_yes, nq_no, b) - cost(q_yes, q_no, b);
    if cash <= 0.0 {
        return Err(EngineError::InvariantViolation(format!(
            "lmsr buy quoted non-positive cash {cash} for {shares} shares"
        )));
    }

    Ok(LmsrQuote {
        shares,
        cash,
        new_q_yes: nq_yes,
        new_q_no: nq_no,
    })
}

/// Quote a buy that spends (approximately) `cash` on `side`, inverting the
/// cost function by bisection on the monotone share delta.
pub fn quote_buy_cash(
    q_yes: f64,
    q_no: f64,
    b: f64,
    side: PredictionSide,
    cash: f64,
) -> EngineResult<LmsrQuote> {
    validate_state(q_yes, q_no, b)?;
    if !cash.is_finite() || cash < 0.0 {
        return Err(EngineError::InvariantViolation(format!(
            "lmsr buy with invalid cash {cash}"
        )));
    }
    if cash == 0.0 {
        return Ok(LmsrQuote {
            shares: 0.0,
            cash: 0.0,
            new_q_yes: q_yes,
            new_q_no: q_no,
        });
    }

    let base_cost = cost(q_yes, q_no, b);
    let cost_of = |delta: f64| {
        let (ny, nn) = apply_delta(q_yes, q_no, side, delta);
        cost(ny, nn, b) - base_cost
    };

    // Grow the bracket until it covers the target. Spending `cash` buys at
    // most `cash / price_floor` shares, and cost(delta) >= delta * p_min,
    // so doubling terminates quickly.
    let mut hi = cash.max(1.0);
    let mut grow = 0;
    while cost_of(hi) < cash {
        hi *= 2.0;
        grow += 1;
        if grow > 128 {
            return Err(EngineError::InvariantViolation(
                "lmsr cash inversion failed to bracket".to_string(),
            ));
        }
    }

    let mut lo = 0.0_f64;
    let mut mid = 0.0_f64;
    for _ in 0..MAX_ITERATIONS {
        mid = 0.5 * (lo + hi);
        let c = cost_of(mid);
        if (c - cash).abs() <= CASH_TOLERANCE {
            break;
        }
        if c < cash {
            lo = mid;
        } else {
            hi = mid;
        }
    }

    let shares = mid;
    let (nq_yes, nq_no) = apply_delta(q_yes, q_no, side, shares);
    let actual_cash = cost(nq_yes, nq_no, b) - base_cost;

    Ok(LmsrQuote {
        shares,
        cash: actual_cash,
        new_q_yes: nq_yes,
        new_q_no: nq_no,
    })
}

/// Quote a sale of `shares` previously bought shares on `side`. Proceeds
/// are the cost-function difference, always strictly positive for a
/// positive share count.
pub fn quote_sell_shares(
    q_yes: f64,
    q_no: f64,
    b: f64,
    side: PredictionSide,
    shares: f64,
) -> EngineResult<LmsrQuote> {
    validate_state(q_yes, q_no, b)?;
    if !shares.is_finite() || shares < 0.0 {
        return Err(EngineError::InvariantViolation(format!(
            "lmsr sell with invalid share count {shares}"
        )));
    }
    if shares == 0.0 {
        return Ok(LmsrQuote {
            shares: 0.0,
            cash: 0.0,
            new_q_yes: q_yes,
            new_q_no: q_no,
        });
    }

    let (nq_yes, nq_no) = apply_delta(q_yes, q_no, side, -shares);
    let proceeds = cost(q_yes, q_no, b) - cost(nq_yes, nq_no, b);
    if proceeds <= 0.0 {
        return Err(EngineError::InvariantViolation(format!(
            "lmsr sell quoted non-positive proceeds {proceeds}"
        )));
    }

    Ok(LmsrQuote {
        shares,
        cash: proceeds,
        new_q_yes: nq_yes,
        new_q_no: nq_no,
    })
}

fn validate_state(q_yes: f64, q_no: f64, b: f64) -> EngineResult<()> {
    if !(b.is_finite() && b > 0.0) {
        return Err(EngineError::InvariantViolation(format!(
            "lmsr liquidity parameter b={b} must be positive"
        )));
    }
    if !q_yes.is_finite() || !q_no.is_finite() {
        return Err(EngineError::InvariantViolation(format!(
            "lmsr shares outstanding not finite: q_yes={q_yes} q_no={q_no}"
        )));
    }
    Ok(())
}
