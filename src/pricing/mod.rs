//! Pure pricing kernel. No I/O, no suspension points.

pub mod lmsr;
pub mod perps;
pub mod spot;

pub use lmsr::{cost, price_yes, quote_buy_cash, quote_buy_shares, quote_sell_shares, LmsrQuote};
pub use perps::{funding_payment, is_liquidatable, liquidation_price, unrealized_pnl};
pub use spot::{clamp_price, funding_rate_from_skew, spot_price};
