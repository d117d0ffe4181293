//! Trade executor.
//!
//! Validates intents against fresh market state and commits each one
//! atomically: ledger entry, position row, and market mutation land in a
//! single sqlite transaction. Intents are executed serially in
//! `(instrument, actor)` order so a replay against identical state
//! produces identical post-tick state. A failed intent is reported and
//! skipped; it never aborts the batch.

use rusqlite::Connection;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::db::Db;
use crate::error::{EngineError, EngineResult};
use crate::ledger::apply_tx;
use crate::models::{
    BalanceTxKind, Instrument, PerpSide, PredictionSide, TradeImpact,
};
use crate::pricing;
use crate::store::{markets, orgs, perps, pools};

/// Who a trade is for. NPC actors trade out of their pool's cash; users
/// trade out of their ledgered balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    User(i64),
    Npc { user_id: i64, pool_id: i64 },
}

impl Actor {
    pub fn user_id(&self) -> i64 {
        match self {
            Actor::User(id) => *id,
            Actor::Npc { user_id, .. } => *user_id,
        }
    }

    fn pool_id(&self) -> Option<i64> {
        match self {
            Actor::User(_) => None,
            Actor::Npc { pool_id, .. } => Some(*pool_id),
        }
    }
}

#[derive(Debug, Clone)]
pub enum TradeIntent {
    BuyPredictionShares {
        market_id: i64,
        side: PredictionSide,
        cash: f64,
        /// Price seen when the decision was made; used for staleness
        /// protection when present.
        expected_price: Option<f64>,
    },
    SellPredictionShares {
        market_id: i64,
        side: PredictionSide,
        shares: f64,
    },
    OpenPerp {
        ticker: String,
        side: PerpSide,
        size: f64,
        leverage: f64,
        expected_price: Option<f64>,
    },
    ClosePerp {
        ticker: String,
    },
    /// Forced close by the liquidation sweep.
    LiquidatePerp {
        position_id: i64,
    },
}

impl TradeIntent {
    pub fn instrument(&self) -> Instrument {
        match self {
            TradeIntent::BuyPredictionShares { market_id, .. }
            | TradeIntent::SellPredictionShares { market_id, .. } => {
                Instrument::Prediction(*market_id)
            }
            TradeIntent::OpenPerp { ticker, .. } | TradeIntent::ClosePerp { ticker } => {
                Instrument::Perp(ticker.clone())
            }
            TradeIntent::LiquidatePerp { position_id } => {
                Instrument::Perp(format!("liq:{position_id}"))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct IntentRecord {
    pub intent_id: String,
    pub actor: Actor,
    pub intent: TradeIntent,
}

#[derive(Debug, Clone)]
pub struct ExecutedTrade {
    pub intent_id: String,
    pub actor: Actor,
    pub impact: TradeImpact,
    pub position_id: i64,
    /// Realized P&L for closes and liquidations, zero on opens.
    pub realized_pnl: f64,
}

#[derive(Debug)]
pub struct FailedIntent {
    pub intent_id: String,
    pub error: EngineError,
}

#[derive(Debug, Default)]
pub struct ExecutionReport {
    pub successes: Vec<ExecutedTrade>,
    pub failures: Vec<FailedIntent>,
}

#[derive(Clone)]
pub struct TradeExecutor {
    db: Db,
    maintenance_margin: f64,
    price_tolerance: f64,
}

impl TradeExecutor {
    pub fn new(db: Db, cfg: &EngineConfig) -> Self {
        Self {
            db,
            maintenance_margin: cfg.maintenance_margin,
            price_tolerance: cfg.price_tolerance,
        }
    }

    /// Execute a batch. Intents are ordered `(instrument, actor)` before
    /// execution; each runs in its own transaction.
    pub async fn execute(&self, mut intents: Vec<IntentRecord>) -> ExecutionReport {
        intents.sort_by(|a, b| {
            (a.intent.instrument().sort_key(), a.actor.user_id())
                .cmp(&(b.intent.instrument().sort_key(), b.actor.user_id()))
        });

        let mut report = ExecutionReport::default();
        for record in intents {
            match self.execute_with_retry(&record).await {
                Ok(trade) => report.successes.push(trade),
                Err(error) => {
                    warn!(
                        intent_id = %record.intent_id,
                        error = %error,
                        "intent failed"
                    );
                    report.failures.push(FailedIntent {
                        intent_id: record.intent_id,
                        error,
                    });
                }
            }
        }
        report
    }

    /// Conflicts (lost write races) retry up to 3 times with exponential
    /// backoff; every other failure is returned to the caller untouched.
    async fn execute_with_retry(&self, record: &IntentRecord) -> EngineResult<ExecutedTrade> {
        let mut attempt = 0u32;
        loop {
            match self.execute_one(record).await {
                Err(e) if e.is_retryable() && attempt < 3 => {
                    attempt += 1;
                    let backoff = std::time::Duration::from_millis(10u64 << attempt);
                    debug!(intent_id = %record.intent_id, attempt, "retrying after conflict");
                    tokio::time::sleep(backoff).await;
                }
                other => return other,
            }
        }
    }

    pub async fn execute_one(&self, record: &IntentRecord) -> EngineResult<ExecutedTrade> {
        let conn = self.db.lock().await;
        let tx = conn.unchecked_transaction()?;
        let trade = match &record.intent {
            TradeIntent::BuyPredictionShares {
                market_id,
                side,
                cash,
                expected_price,
            } => self.buy_prediction(&tx, record, *market_id, *side, *cash, *expected_price),
            TradeIntent::SellPredictionShares {
                market_id,
                side,
                shares,
            } => self.sell_prediction(&tx, record, *market_id, *side, *shares),
            TradeIntent::OpenPerp {
                ticker,
                side,
                size,
                leverage,
                expected_price,
            } => self.open_perp(&tx, record, ticker, *side, *size, *leverage, *expected_price),
            TradeIntent::ClosePerp { ticker } => self.close_perp(&tx, record, ticker),
            TradeIntent::LiquidatePerp { position_id } => {
                self.liquidate_perp(&tx, record, *position_id)
            }
        }?;
        tx.commit()?;
        debug!(intent_id = %trade.intent_id, "intent executed");
        Ok(trade)
    }

    fn check_price_protection(
        &self,
        instrument: &str,
        expected: Option<f64>,
        actual: f64,
    ) -> EngineResult<()> {
        if let Some(expected) = expected {
            if (actual - expected).abs() > self.price_tolerance * expected.max(1e-9) {
                return Err(EngineError::StalePrice {
                    instrument: instrument.to_string(),
                    expected,
                    actual,
                });
            }
        }
        Ok(())
    }

    /// Debit the acting account. Users hit the ledger; NPC pools spend
    /// their available balance.
    fn debit_actor(
        &self,
        conn: &Connection,
        actor: &Actor,
        amount: f64,
        kind: BalanceTxKind,
        related: &str,
    ) -> EngineResult<()> {
        match actor.pool_id() {
            None => {
                apply_tx(conn, actor.user_id(), kind, -amount, Some(related))?;
            }
            Some(pool_id) => {
                pools::adjust_pool(conn, pool_id, -amount, 0.0, 0.0)?;
            }
        }
        Ok(())
    }

    /// Credit proceeds back, recording realized P&L against the pool when
    /// the actor is an NPC. A positive-P&L pool close skims the
    /// performance fee to the operator's ledger.
    fn credit_actor_close(
        &self,
        conn: &Connection,
        actor: &Actor,
        proceeds: f64,
        realized_pnl: f64,
        kind: BalanceTxKind,
        related: &str,
    ) -> EngineResult<()> {
        match actor.pool_id() {
            None => {
                if proceeds > 0.0 {
                    apply_tx(conn, actor.user_id(), kind, proceeds, Some(related))?;
                } else if kind == BalanceTxKind::PerpLiquidation {
                    // Margin fully consumed: record the zero-remainder
                    // liquidation entry.
                    apply_tx(conn, actor.user_id(), kind, 0.0, Some(related))?;
                }
            }
            Some(pool_id) => {
                pools::adjust_pool(conn, pool_id, proceeds, realized_pnl, realized_pnl)?;
                if realized_pnl > 0.0 {
                    let pool = pools::get_pool_by_npc(conn, actor.user_id())?;
                    let fee = realized_pnl * pool.performance_fee_rate;
                    if fee > 0.0 {
                        pools::adjust_pool(conn, pool_id, -fee, -fee, 0.0)?;
                        apply_tx(
                            conn,
                            actor.user_id(),
                            BalanceTxKind::PoolPerformanceFee,
                            fee,
                            Some(related),
                        )?;
                    }
                }
            }
        }
        Ok(())
    }

    fn buy_prediction(
        &self,
        conn: &Connection,
        record: &IntentRecord,
        market_id: i64,
        side: PredictionSide,
        cash: f64,
        expected_price: Option<f64>,
    ) -> EngineResult<ExecutedTrade> {
        if !(cash.is_finite() && cash > 0.0) {
            return Err(EngineError::InvariantViolation(format!(
                "prediction buy with non-positive cash {cash}"
            )));
        }

        let market = markets::get_market(conn, market_id)?;
        if market.resolved || market.resolution_time <= crate::models::now_ts() {
            return Err(EngineError::MarketClosed(market_id));
        }

        let quote = pricing::quote_buy_cash(market.q_yes, market.q_no, market.b, side, cash)?;
        let effective_price = quote.cash / quote.shares;
        self.check_price_protection(&format!("market:{market_id}"), expected_price, {
            match side {
                PredictionSide::Yes => pricing::price_yes(market.q_yes, market.q_no, market.b),
                PredictionSide::No => {
                    1.0 - pricing::price_yes(market.q_yes, market.q_no, market.b)
                }
            }
        })?;

        let related = format!("market:{market_id}:{}", record.intent_id);
        self.debit_actor(conn, &record.actor, quote.cash, BalanceTxKind::TradeOpen, &related)?;
        let position_id = markets::upsert_position(
            conn,
            record.actor.user_id(),
            market_id,
            side,
            quote.shares,
            effective_price,
        )?;
        if let Some(pool_id) = record.actor.pool_id() {
            pools::link_position(conn, pool_id, "prediction", position_id)?;
        }
        markets::apply_trade(conn, market_id, quote.new_q_yes, quote.new_q_no, quote.cash)?;

        Ok(ExecutedTrade {
            intent_id: record.intent_id.clone(),
            actor: record.actor,
            impact: TradeImpact {
                instrument: Instrument::Prediction(market_id),
                cash_delta: quote.cash,
                share_delta: quote.shares,
            },
            position_id,
            realized_pnl: 0.0,
        })
    }

    fn sell_prediction(
        &self,
        conn: &Connection,
        record: &IntentRecord,
        market_id: i64,
        side: PredictionSide,
        shares: f64,
    ) -> EngineResult<ExecutedTrade> {
        if !(shares.is_finite() && shares > 0.0) {
            return Err(EngineError::InvariantViolation(format!(
                "prediction sell with non-positive shares {shares}"
            )));
        }

        let market = markets::get_market(conn, market_id)?;
        if market.resolved {
            return Err(EngineError::MarketClosed(market_id));
        }

        // Look up the position first so an oversell fails before any
        // state is touched.
        let held = conn
            .query_row(
                "SELECT shares, avg_price FROM prediction_positions \
                 WHERE user_id = ?1 AND market_id = ?2 AND side = ?3 AND closed_at IS NULL",
                rusqlite::params![record.actor.user_id(), market_id, side.as_str()],
                |row| Ok((row.get::<_, f64>(0)?, row.get::<_, f64>(1)?)),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => EngineError::PositionNotFound(format!(
                    "no open {} position on market {market_id}",
                    side.as_str()
                )),
                other => other.into(),
            })?;
        let (held_shares, avg_price) = held;
        if held_shares + 1e-9 < shares {
            return Err(EngineError::PositionNotFound(format!(
                "position holds {held_shares} shares, cannot sell {shares}"
            )));
        }

        let quote = pricing::quote_sell_shares(market.q_yes, market.q_no, market.b, side, shares)?;
        let realized_pnl = quote.cash - avg_price * shares;

        let related = format!("market:{market_id}:{}", record.intent_id);
        let position_id = markets::upsert_position(
            conn,
            record.actor.user_id(),
            market_id,
            side,
            -shares,
            quote.cash / shares,
        )?;
        markets::apply_trade(conn, market_id, quote.new_q_yes, quote.new_q_no, -quote.cash)?;
        self.credit_actor_close(
            conn,
            &record.actor,
            quote.cash,
            realized_pnl,
            BalanceTxKind::TradeClose,
            &related,
        )?;

        Ok(ExecutedTrade {
            intent_id: record.intent_id.clone(),
            actor: record.actor,
            impact: TradeImpact {
                instrument: Instrument::Prediction(market_id),
                cash_delta: -quote.cash,
                share_delta: -shares,
            },
            position_id,
            realized_pnl,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn open_perp(
        &self,
        conn: &Connection,
        record: &IntentRecord,
        ticker: &str,
        side: PerpSide,
        size: f64,
        leverage: f64,
        expected_price: Option<f64>,
    ) -> EngineResult<ExecutedTrade> {
        if !(size.is_finite() && size > 0.0) {
            return Err(EngineError::InvariantViolation(format!(
                "perp open with non-positive size {size}"
            )));
        }
        if !(1.0..=100.0).contains(&leverage) {
            return Err(EngineError::LeverageOutOfRange(leverage));
        }

        let org = orgs::get_by_ticker(conn, ticker)?;
        self.check_price_protection(ticker, expected_price, org.current_price)?;

        let entry = org.current_price;
        let margin = size / leverage;
        let liq_price = pricing::liquidation_price(entry, side, leverage, self.maintenance_margin);

        let related = format!("perp:{ticker}:{}", record.intent_id);
        self.debit_actor(conn, &record.actor, margin, BalanceTxKind::TradeOpen, &related)?;
        let position_id = perps::insert_position(
            conn,
            record.actor.user_id(),
            ticker,
            side,
            size,
            leverage,
            entry,
            liq_price,
        )?;
        if let Some(pool_id) = record.actor.pool_id() {
            pools::link_position(conn, pool_id, "perp", position_id)?;
        }

        Ok(ExecutedTrade {
            intent_id: record.intent_id.clone(),
            actor: record.actor,
            impact: TradeImpact {
                instrument: Instrument::Perp(ticker.to_string()),
                cash_delta: margin,
                share_delta: pricing::spot::signed_size(side, size),
            },
            position_id,
            realized_pnl: 0.0,
        })
    }

    fn close_perp(
        &self,
        conn: &Connection,
        record: &IntentRecord,
        ticker: &str,
    ) -> EngineResult<ExecutedTrade> {
        let position = perps::open_position_for_user_ticker(conn, record.actor.user_id(), ticker)?
            .ok_or_else(|| {
                EngineError::PositionNotFound(format!(
                    "no open perp position on {ticker} for user {}",
                    record.actor.user_id()
                ))
            })?;

        let org = orgs::get_by_ticker(conn, ticker)?;
        let mark = org.current_price;
        let pnl = pricing::unrealized_pnl(position.entry_price, mark, position.side, position.size);
        let margin = position.margin();
        let remainder = margin + pnl;

        let related = format!("perp:{ticker}:{}", record.intent_id);
        perps::mark_closed(conn, position.id)?;
        if remainder > 0.0 {
            self.credit_actor_close(
                conn,
                &record.actor,
                remainder,
                pnl,
                BalanceTxKind::TradeClose,
                &related,
            )?;
        } else {
            // Losses past the margin only happen when the liquidation
            // sweep lagged the move; settle like a liquidation.
            self.credit_actor_close(
                conn,
                &record.actor,
                0.0,
                -margin,
                BalanceTxKind::PerpLiquidation,
                &related,
            )?;
        }

        Ok(ExecutedTrade {
            intent_id: record.intent_id.clone(),
            actor: record.actor,
            impact: TradeImpact {
                instrument: Instrument::Perp(ticker.to_string()),
                cash_delta: -remainder.max(0.0),
                share_delta: -pricing::spot::signed_size(position.side, position.size),
            },
            position_id: position.id,
            realized_pnl: pnl,
        })
    }

    fn liquidate_perp(
        &self,
        conn: &Connection,
        record: &IntentRecord,
        position_id: i64,
    ) -> EngineResult<ExecutedTrade> {
        let position = perps::get_position(conn, position_id)?;
        if !position.is_open() {
            return Err(EngineError::PositionNotFound(format!(
                "perp position {position_id} already closed"
            )));
        }

        let org = orgs::get_by_ticker(conn, &position.ticker)?;
        let mark = org.current_price;
        if !pricing::is_liquidatable(mark, position.liquidation_price, position.side) {
            return Err(EngineError::StalePrice {
                instrument: position.ticker.clone(),
                expected: position.liquidation_price,
                actual: mark,
            });
        }

        let pnl =
            pricing::unrealized_pnl(position.entry_price, mark, position.side, position.size);
        let margin = position.margin();
        // At exactly the liquidation price the remainder is the
        // maintenance sliver; beyond it, zero. Never negative.
        let remainder = (margin + pnl).max(0.0);

        let related = format!("liq:{position_id}");
        perps::mark_closed(conn, position_id)?;
        self.credit_actor_close(
            conn,
            &record.actor,
            remainder,
            remainder - margin,
            BalanceTxKind::PerpLiquidation,
            &related,
        )?;

        Ok(ExecutedTrade {
            intent_id: record.intent_id.clone(),
            actor: record.actor,
            impact: TradeImpact {
                instrument: Instrument::Perp(position.ticker.clone()),
                cash_delta: -remainder,
                share_delta: -pricing::spot::signed_size(position.side, position.size),
            },
            position_id,
            realized_pnl: remainder - margin,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Ledger;
    use crate::models::now_ts;
    use crate::store::{OrganizationStore, PoolStore, PredictionMarketStore, UserStore};

    struct Fixture {
        db: Db,
        executor: TradeExecutor,
        ledger: Ledger,
        user: i64,
    }

    async fn fixture() -> Fixture {
        let db = Db::open_in_memory().unwrap();
        let cfg = EngineConfig::default();
        let users = UserStore::new(db.clone());
        let user = users.create_human("trader").await.unwrap();
        let ledger = Ledger::new(db.clone());
        ledger
            .credit(user, 1000.0, BalanceTxKind::Deposit, None)
            .await
            .unwrap();
        Fixture {
            executor: TradeExecutor::new(db.clone(), &cfg),
            db,
            ledger,
            user,
        }
    }

    fn rec(actor: Actor, id: &str, intent: TradeIntent) -> IntentRecord {
        IntentRecord {
            intent_id: id.to_string(),
            actor,
            intent,
        }
    }

    #[tokio::test]
    async fn perp_open_close_profit_flow() {
        let f = fixture().await;
        let orgs = OrganizationStore::new(f.db.clone());
        orgs.create("ACME", "Acme", 50.0).await.unwrap();

        // Open LONG size 500 at 5x: margin 100 debited, liq ~40.25.
        let report = f
            .executor
            .execute(vec![rec(
                Actor::User(f.user),
                "i1",
                TradeIntent::OpenPerp {
                    ticker: "ACME".to_string(),
                    side: PerpSide::Long,
                    size: 500.0,
                    leverage: 5.0,
                    expected_price: None,
                },
            )])
            .await;
        assert_eq!(report.successes.len(), 1);
        assert!((f.ledger.balance(f.user).await.unwrap() - 900.0).abs() < 1e-9);

        {
            let conn = f.db.lock().await;
            let liq: f64 = conn
                .query_row(
                    "SELECT liquidation_price FROM perp_positions WHERE user_id = ?1",
                    [f.user],
                    |r| r.get(0),
                )
                .unwrap();
            assert!((liq - 40.25).abs() < 1e-9);
        }

        // Mark to 60 and close: credit margin + pnl = 200.
        orgs.set_current_price("ACME", 60.0).await.unwrap();
        let report = f
            .executor
            .execute(vec![rec(
                Actor::User(f.user),
                "i2",
                TradeIntent::ClosePerp {
                    ticker: "ACME".to_string(),
                },
            )])
            .await;
        assert_eq!(report.successes.len(), 1);
        assert!((report.successes[0].realized_pnl - 100.0).abs() < 1e-9);
        assert!((f.ledger.balance(f.user).await.unwrap() - 1100.0).abs() < 1e-9);
        f.ledger.verify_user(f.user).await.unwrap();
    }

    #[tokio::test]
    async fn leverage_out_of_range_rejected() {
        let f = fixture().await;
        let orgs = OrganizationStore::new(f.db.clone());
        orgs.create("ACME", "Acme", 50.0).await.unwrap();

        let report = f
            .executor
            .execute(vec![rec(
                Actor::User(f.user),
                "i1",
                TradeIntent::OpenPerp {
                    ticker: "ACME".to_string(),
                    side: PerpSide::Long,
                    size: 100.0,
                    leverage: 150.0,
                    expected_price: None,
                },
            )])
            .await;
        assert!(report.successes.is_empty());
        assert_eq!(report.failures[0].error.kind_code(), "leverage_out_of_range");
        // Nothing debited.
        assert!((f.ledger.balance(f.user).await.unwrap() - 1000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn prediction_buy_debits_exact_quote() {
        let f = fixture().await;
        let markets = PredictionMarketStore::new(f.db.clone());
        let m = markets
            .create("Will X happen?", "general", now_ts() + 3600, 100.0)
            .await
            .unwrap();

        let report = f
            .executor
            .execute(vec![rec(
                Actor::User(f.user),
                "i1",
                TradeIntent::BuyPredictionShares {
                    market_id: m.id,
                    side: PredictionSide::Yes,
                    cash: 10.0,
                    expected_price: Some(0.5),
                },
            )])
            .await;
        assert_eq!(report.successes.len(), 1);
        let trade = &report.successes[0];
        assert!((trade.impact.cash_delta - 10.0).abs() < 1e-6);

        // Exact LMSR inverse at b=100 from a fresh market.
        let expected_shares = 100.0 * (2.0 * (10.0_f64 / 100.0).exp() - 1.0).ln();
        assert!((trade.impact.share_delta - expected_shares).abs() < 1e-6);
        assert!((f.ledger.balance(f.user).await.unwrap() - 990.0).abs() < 1e-6);

        let m = markets.get(m.id).await.unwrap();
        let p = pricing::price_yes(m.q_yes, m.q_no, m.b);
        assert!(p > 0.5);
        assert!((p + (1.0 - p) - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn stale_price_protection_drops_intent() {
        let f = fixture().await;
        let markets = PredictionMarketStore::new(f.db.clone());
        let m = markets
            .create("stale?", "general", now_ts() + 3600, 100.0)
            .await
            .unwrap();

        let report = f
            .executor
            .execute(vec![rec(
                Actor::User(f.user),
                "i1",
                TradeIntent::BuyPredictionShares {
                    market_id: m.id,
                    side: PredictionSide::Yes,
                    // Market quotes 0.5; decision believed 0.9.
                    cash: 10.0,
                    expected_price: Some(0.9),
                },
            )])
            .await;
        assert!(report.successes.is_empty());
        assert_eq!(report.failures[0].error.kind_code(), "stale_price");
    }

    #[tokio::test]
    async fn open_then_close_round_trips_to_realized_pnl() {
        let f = fixture().await;
        let markets = PredictionMarketStore::new(f.db.clone());
        let m = markets
            .create("round trip", "general", now_ts() + 3600, 100.0)
            .await
            .unwrap();

        let buy = f
            .executor
            .execute(vec![rec(
                Actor::User(f.user),
                "buy",
                TradeIntent::BuyPredictionShares {
                    market_id: m.id,
                    side: PredictionSide::Yes,
                    cash: 25.0,
                    expected_price: None,
                },
            )])
            .await;
        let shares = buy.successes[0].impact.share_delta;

        let sell = f
            .executor
            .execute(vec![rec(
                Actor::User(f.user),
                "sell",
                TradeIntent::SellPredictionShares {
                    market_id: m.id,
                    side: PredictionSide::Yes,
                    shares,
                },
            )])
            .await;
        assert_eq!(sell.successes.len(), 1);

        // Buying and selling the same shares against an unchanged book
        // returns the cost exactly; ledger delta equals realized pnl (0).
        let balance = f.ledger.balance(f.user).await.unwrap();
        assert!((balance - 1000.0).abs() < 1e-6);
        assert!(sell.successes[0].realized_pnl.abs() < 1e-6);

        // No open position remains.
        let open = markets.open_positions_for_user(f.user).await.unwrap();
        assert!(open.is_empty());
        f.ledger.verify_user(f.user).await.unwrap();
    }

    #[tokio::test]
    async fn liquidation_consumes_margin_exactly() {
        let f = fixture().await;
        let orgs = OrganizationStore::new(f.db.clone());
        orgs.create("ACME", "Acme", 100.0).await.unwrap();

        // SHORT size 1000 at 10x: margin 100, liq 109.5.
        f.executor
            .execute(vec![rec(
                Actor::User(f.user),
                "open",
                TradeIntent::OpenPerp {
                    ticker: "ACME".to_string(),
                    side: PerpSide::Short,
                    size: 1000.0,
                    leverage: 10.0,
                    expected_price: None,
                },
            )])
            .await;
        let pre_mark_balance = f.ledger.balance(f.user).await.unwrap();
        assert!((pre_mark_balance - 900.0).abs() < 1e-9);

        orgs.set_current_price("ACME", 110.0).await.unwrap();
        let position_id = {
            let conn = f.db.lock().await;
            conn.query_row(
                "SELECT id FROM perp_positions WHERE user_id = ?1 AND closed_at IS NULL",
                [f.user],
                |r| r.get::<_, i64>(0),
            )
            .unwrap()
        };

        let report = f
            .executor
            .execute(vec![rec(
                Actor::User(f.user),
                "liq",
                TradeIntent::LiquidatePerp { position_id },
            )])
            .await;
        assert_eq!(report.successes.len(), 1);

        // Margin fully consumed: balance unchanged from pre-mark, and a
        // zero-amount perp_liquidation entry records the event.
        assert!((f.ledger.balance(f.user).await.unwrap() - 900.0).abs() < 1e-9);
        let history = f.ledger.history(f.user, 5).await.unwrap();
        assert_eq!(history[0].kind, BalanceTxKind::PerpLiquidation);
        assert_eq!(history[0].amount, 0.0);
        f.ledger.verify_user(f.user).await.unwrap();
    }

    #[tokio::test]
    async fn liquidation_refused_when_price_not_crossed() {
        let f = fixture().await;
        let orgs = OrganizationStore::new(f.db.clone());
        orgs.create("ACME", "Acme", 100.0).await.unwrap();
        f.executor
            .execute(vec![rec(
                Actor::User(f.user),
                "open",
                TradeIntent::OpenPerp {
                    ticker: "ACME".to_string(),
                    side: PerpSide::Short,
                    size: 1000.0,
                    leverage: 10.0,
                    expected_price: None,
                },
            )])
            .await;
        let position_id = {
            let conn = f.db.lock().await;
            conn.query_row(
                "SELECT id FROM perp_positions WHERE user_id = ?1",
                [f.user],
                |r| r.get::<_, i64>(0),
            )
            .unwrap()
        };
        orgs.set_current_price("ACME", 105.0).await.unwrap();
        let report = f
            .executor
            .execute(vec![rec(
                Actor::User(f.user),
                "liq",
                TradeIntent::LiquidatePerp { position_id },
            )])
            .await;
        assert!(report.successes.is_empty());
        assert_eq!(report.failures[0].error.kind_code(), "stale_price");
    }

    #[tokio::test]
    async fn npc_pool_trades_link_positions_and_keep_pool_identity() {
        let f = fixture().await;
        let users = UserStore::new(f.db.clone());
        let pools = PoolStore::new(f.db.clone());
        let markets = PredictionMarketStore::new(f.db.clone());

        let npc = users.create_npc_actor("mm-x", "test actor").await.unwrap();
        let pool = pools.create(npc, "mm-x pool", 500.0, 0.1).await.unwrap();
        let market = markets
            .create("pool trades?", "general", now_ts() + 3600, 100.0)
            .await
            .unwrap();
        let orgs = OrganizationStore::new(f.db.clone());
        orgs.create("ACME", "Acme", 50.0).await.unwrap();

        let actor = Actor::Npc {
            user_id: npc,
            pool_id: pool.id,
        };
        let report = f
            .executor
            .execute(vec![
                rec(
                    actor,
                    "buy",
                    TradeIntent::BuyPredictionShares {
                        market_id: market.id,
                        side: PredictionSide::Yes,
                        cash: 25.0,
                        expected_price: None,
                    },
                ),
                rec(
                    actor,
                    "open",
                    TradeIntent::OpenPerp {
                        ticker: "ACME".to_string(),
                        side: PerpSide::Long,
                        size: 100.0,
                        leverage: 2.0,
                        expected_price: None,
                    },
                ),
            ])
            .await;
        assert_eq!(report.successes.len(), 2, "{:?}", report.failures);

        // Both instrument families appear through the pool linkage.
        let held = pools.list_open_positions(pool.id).await.unwrap();
        assert_eq!(held.perps.len(), 1);
        assert_eq!(held.predictions.len(), 1);
        // margin 100/2 + prediction cost 25
        assert!((held.deployed() - 75.0).abs() < 1e-6);
        pools.verify_pool(pool.id).await.unwrap();

        // Selling everything closes the prediction side and the identity
        // still holds.
        let shares = held.predictions[0].shares;
        let report = f
            .executor
            .execute(vec![rec(
                actor,
                "sell",
                TradeIntent::SellPredictionShares {
                    market_id: market.id,
                    side: PredictionSide::Yes,
                    shares,
                },
            )])
            .await;
        assert_eq!(report.successes.len(), 1, "{:?}", report.failures);

        let held = pools.list_open_positions(pool.id).await.unwrap();
        assert!(held.predictions.is_empty());
        assert_eq!(held.perps.len(), 1);
        pools.verify_pool(pool.id).await.unwrap();
    }

    #[tokio::test]
    async fn insufficient_funds_fails_single_intent_not_batch() {
        let f = fixture().await;
        let orgs = OrganizationStore::new(f.db.clone());
        orgs.create("ACME", "Acme", 50.0).await.unwrap();

        let report = f
            .executor
            .execute(vec![
                rec(
                    Actor::User(f.user),
                    "too-big",
                    TradeIntent::OpenPerp {
                        ticker: "ACME".to_string(),
                        side: PerpSide::Long,
                        size: 50_000.0,
                        leverage: 2.0,
                        expected_price: None,
                    },
                ),
                rec(
                    Actor::User(f.user),
                    "fine",
                    TradeIntent::OpenPerp {
                        ticker: "ACME".to_string(),
                        side: PerpSide::Long,
                        size: 100.0,
                        leverage: 2.0,
                        expected_price: None,
                    },
                ),
            ])
            .await;
        assert_eq!(report.successes.len(), 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].error.kind_code(), "insufficient_funds");
    }
}
