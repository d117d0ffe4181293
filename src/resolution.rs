//! Resolution sweep: settle matured prediction markets against the oracle.
//!
//! Payouts are idempotent: each ledger credit is keyed on
//! `(market_id, position_id)` in `resolution_payouts`, and the whole
//! payout for one market commits in a single transaction. Retrying after
//! a crash produces identical final balances.

use std::sync::Arc;
use std::time::Duration;

use rusqlite::params;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::db::Db;
use crate::error::{EngineError, EngineResult};
use crate::ledger::apply_tx;
use crate::models::{now_ts, BalanceTxKind, Outcome, PredictionMarket};
use crate::oracle::OracleClient;
use crate::store::{markets, pools, PredictionMarketStore};

#[derive(Clone)]
pub struct ResolutionSweep {
    db: Db,
    market_store: PredictionMarketStore,
    oracle: Arc<dyn OracleClient>,
    oracle_timeout: Duration,
}

impl ResolutionSweep {
    pub fn new(db: Db, oracle: Arc<dyn OracleClient>, cfg: &EngineConfig) -> Self {
        Self {
            market_store: PredictionMarketStore::new(db.clone()),
            db,
            oracle,
            oracle_timeout: Duration::from_millis(cfg.oracle_timeout_ms),
        }
    }

    /// One sweep over matured unresolved markets. Returns how many were
    /// fully resolved. Oracle failures skip the market; the next tick
    /// retries.
    pub async fn sweep(&self, now: i64) -> EngineResult<u32> {
        let matured = self.market_store.list_matured(now).await?;
        let mut resolved = 0u32;

        for market in matured {
            match self.resolve_market(&market).await {
                Ok(true) => resolved += 1,
                Ok(false) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(market_id = market.id, error = %e, "resolution deferred");
                }
            }
        }
        Ok(resolved)
    }

    /// Administrator-supplied outcome: reveal through the oracle, then pay
    /// out immediately.
    pub async fn resolve_with_outcome(
        &self,
        market_id: i64,
        outcome: Outcome,
    ) -> EngineResult<()> {
        if outcome == Outcome::Unresolved {
            return Err(EngineError::InvariantViolation(
                "cannot resolve a market to unresolved".to_string(),
            ));
        }
        let market = self.market_store.get(market_id).await?;
        if market.resolved {
            return Ok(());
        }

        let session_id = self.ensure_session(&market).await?;
        tokio::time::timeout(
            self.oracle_timeout,
            self.oracle.reveal(&session_id, outcome),
        )
        .await
        .map_err(|_| EngineError::Timeout(self.oracle_timeout.as_millis() as u64))??;

        self.mark_session_revealed(&session_id, outcome).await?;
        self.pay_out(&market, outcome).await
    }

    async fn resolve_market(&self, market: &PredictionMarket) -> EngineResult<bool> {
        let session_id = self.ensure_session(market).await?;

        let state = tokio::time::timeout(
            self.oracle_timeout,
            self.oracle.get_outcome(&session_id),
        )
        .await
        .map_err(|_| EngineError::Timeout(self.oracle_timeout.as_millis() as u64))??;

        if !state.revealed || state.outcome == Outcome::Unresolved {
            return Ok(false);
        }

        self.mark_session_revealed(&session_id, state.outcome).await?;
        self.pay_out(market, state.outcome).await?;
        Ok(true)
    }

    /// Commit the market to the oracle once; the stored session carries
    /// the exactly-once key.
    async fn ensure_session(&self, market: &PredictionMarket) -> EngineResult<String> {
        {
            let conn = self.db.lock().await;
            let existing: Option<String> = conn
                .query_row(
                    "SELECT session_id FROM oracle_sessions WHERE market_id = ?1",
                    params![market.id],
                    |row| row.get(0),
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(EngineError::from(other)),
                })?;
            if let Some(session_id) = existing {
                return Ok(session_id);
            }
        }

        let receipt = tokio::time::timeout(
            self.oracle_timeout,
            self.oracle.commit(market.id, &market.prompt, &market.category),
        )
        .await
        .map_err(|_| EngineError::Timeout(self.oracle_timeout.as_millis() as u64))??;

        let conn = self.db.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO oracle_sessions \
             (market_id, session_id, tx_hash, committed_at) VALUES (?1, ?2, ?3, ?4)",
            params![market.id, receipt.session_id, receipt.tx_hash, now_ts()],
        )?;
        // A concurrent writer may have won the insert; read back the
        // stored session so every caller uses the same one.
        let session_id: String = conn.query_row(
            "SELECT session_id FROM oracle_sessions WHERE market_id = ?1",
            params![market.id],
            |row| row.get(0),
        )?;
        Ok(session_id)
    }

    async fn mark_session_revealed(
        &self,
        session_id: &str,
        outcome: Outcome,
    ) -> EngineResult<()> {
        let conn = self.db.lock().await;
        conn.execute(
            "UPDATE oracle_sessions SET revealed = 1, outcome = ?1 WHERE session_id = ?2",
            params![outcome.as_str(), session_id],
        )?;
        Ok(())
    }

    /// Settle every open position on the market and mark it resolved, all
    /// in one transaction. Winners receive `shares * 1` from the market
    /// escrow; losers receive nothing. Both are closed.
    async fn pay_out(&self, market: &PredictionMarket, outcome: Outcome) -> EngineResult<()> {
        let conn = self.db.lock().await;
        let tx = conn.unchecked_transaction()?;

        let fresh = markets::get_market(&tx, market.id)?;
        if fresh.resolved {
            return Ok(());
        }

        let positions = markets::open_positions_for_market(&tx, market.id)?;
        let mut total_paid = 0.0_f64;
        let now = now_ts();

        for position in &positions {
            let payout = if position.side.wins(outcome) {
                position.shares
            } else {
                0.0
            };

            // Idempotence key: one payout per (market, position), ever.
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO resolution_payouts \
                 (market_id, position_id, amount, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![market.id, position.id, payout, now],
            )?;
            if inserted == 0 {
                continue;
            }

            if payout > 0.0 {
                total_paid += payout;
                let related = format!("resolution:{}:{}", market.id, position.id);
                match pools::get_pool_by_npc(&tx, position.user_id) {
                    Ok(pool) => {
                        let cost_basis = position.shares * position.avg_price;
                        pools::adjust_pool(
                            &tx,
                            pool.id,
                            payout,
                            payout - cost_basis,
                            payout - cost_basis,
                        )?;
                    }
                    Err(EngineError::NotFound(_)) => {
                        apply_tx(
                            &tx,
                            position.user_id,
                            BalanceTxKind::ResolutionPayout,
                            payout,
                            Some(&related),
                        )?;
                    }
                    Err(e) => return Err(e),
                }
            } else if let Ok(pool) = pools::get_pool_by_npc(&tx, position.user_id) {
                // Losing pool position: write the deployed cost off.
                let cost_basis = position.shares * position.avg_price;
                pools::adjust_pool(&tx, pool.id, 0.0, -cost_basis, -cost_basis)?;
            }

            tx.execute(
                "UPDATE prediction_positions SET closed_at = ?1 WHERE id = ?2",
                params![now, position.id],
            )?;
        }

        if total_paid > fresh.escrow + 1e-6 {
            return Err(EngineError::InvariantViolation(format!(
                "market {}: payouts {total_paid} exceed escrow {}",
                market.id, fresh.escrow
            )));
        }

        tx.execute(
            "UPDATE prediction_markets \
             SET resolved = 1, outcome = ?1, escrow = escrow - ?2 WHERE id = ?3",
            params![outcome.as_str(), total_paid, market.id],
        )?;
        tx.commit()?;

        info!(
            market_id = market.id,
            outcome = outcome.as_str(),
            positions = positions.len(),
            total_paid,
            "market resolved"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{Actor, IntentRecord, TradeExecutor, TradeIntent};
    use crate::ledger::Ledger;
    use crate::models::PredictionSide;
    use crate::oracle::LocalOracle;
    use crate::store::UserStore;

    struct Fixture {
        db: Db,
        sweep: ResolutionSweep,
        ledger: Ledger,
        markets: PredictionMarketStore,
        user: i64,
        market_id: i64,
    }

    async fn fixture() -> Fixture {
        let db = Db::open_in_memory().unwrap();
        let cfg = EngineConfig::default();
        let users = UserStore::new(db.clone());
        let user = users.create_human("holder").await.unwrap();
        let ledger = Ledger::new(db.clone());
        ledger
            .credit(user, 1000.0, BalanceTxKind::Deposit, None)
            .await
            .unwrap();

        let markets = PredictionMarketStore::new(db.clone());
        let market = markets
            .create("resolves?", "general", now_ts() + 60, 100.0)
            .await
            .unwrap();

        let sweep = ResolutionSweep::new(db.clone(), Arc::new(LocalOracle::new()), &cfg);
        Fixture {
            db,
            sweep,
            ledger,
            markets,
            user,
            market_id: market.id,
        }
    }

    async fn buy(f: &Fixture, side: PredictionSide, cash: f64) {
        let executor = TradeExecutor::new(f.db.clone(), &EngineConfig::default());
        let report = executor
            .execute(vec![IntentRecord {
                intent_id: format!("buy-{}", side.as_str()),
                actor: Actor::User(f.user),
                intent: TradeIntent::BuyPredictionShares {
                    market_id: f.market_id,
                    side,
                    cash,
                    expected_price: None,
                },
            }])
            .await;
        assert_eq!(report.successes.len(), 1, "{:?}", report.failures);
    }

    async fn mature(f: &Fixture) {
        let conn = f.db.lock().await;
        conn.execute(
            "UPDATE prediction_markets SET resolution_time = ?1 WHERE id = ?2",
            params![now_ts() - 10, f.market_id],
        )
        .unwrap();
    }

    #[tokio::test]
    async fn payout_credits_winners_and_closes_everyone() {
        let f = fixture().await;
        buy(&f, PredictionSide::Yes, 30.0).await;
        buy(&f, PredictionSide::No, 20.0).await;
        mature(&f).await;

        let balance_before = f.ledger.balance(f.user).await.unwrap();
        let yes_shares = {
            let conn = f.db.lock().await;
            conn.query_row(
                "SELECT shares FROM prediction_positions WHERE side = 'yes'",
                [],
                |r| r.get::<_, f64>(0),
            )
            .unwrap()
        };

        f.sweep
            .resolve_with_outcome(f.market_id, Outcome::Yes)
            .await
            .unwrap();

        let balance_after = f.ledger.balance(f.user).await.unwrap();
        assert!((balance_after - balance_before - yes_shares).abs() < 1e-6);

        let market = f.markets.get(f.market_id).await.unwrap();
        assert!(market.resolved);
        assert_eq!(market.outcome, Outcome::Yes);
        assert!(market.escrow >= -1e-9);

        let open = f.markets.open_positions(f.market_id).await.unwrap();
        assert!(open.is_empty());
        f.ledger.verify_user(f.user).await.unwrap();
    }

    #[tokio::test]
    async fn rerunning_resolution_is_idempotent() {
        let f = fixture().await;
        buy(&f, PredictionSide::Yes, 30.0).await;
        mature(&f).await;

        f.sweep
            .resolve_with_outcome(f.market_id, Outcome::Yes)
            .await
            .unwrap();
        let balance_once = f.ledger.balance(f.user).await.unwrap();

        // Second resolve and second sweep both change nothing.
        f.sweep
            .resolve_with_outcome(f.market_id, Outcome::Yes)
            .await
            .unwrap();
        let resolved = f.sweep.sweep(now_ts()).await.unwrap();
        assert_eq!(resolved, 0);
        assert_eq!(f.ledger.balance(f.user).await.unwrap(), balance_once);
    }

    #[tokio::test]
    async fn unrevealed_sessions_defer_resolution() {
        let f = fixture().await;
        buy(&f, PredictionSide::Yes, 10.0).await;
        mature(&f).await;

        // Sweep commits a session but the oracle has not revealed yet.
        let resolved = f.sweep.sweep(now_ts()).await.unwrap();
        assert_eq!(resolved, 0);

        let session_count: i64 = {
            let conn = f.db.lock().await;
            conn.query_row("SELECT COUNT(*) FROM oracle_sessions", [], |r| r.get(0))
                .unwrap()
        };
        assert_eq!(session_count, 1);

        // A second sweep reuses the committed session.
        f.sweep.sweep(now_ts()).await.unwrap();
        let session_count_again: i64 = {
            let conn = f.db.lock().await;
            conn.query_row("SELECT COUNT(*) FROM oracle_sessions", [], |r| r.get(0))
                .unwrap()
        };
        assert_eq!(session_count_again, 1);
    }
}
