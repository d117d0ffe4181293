//! Price updater: consumes trade impacts, recomputes quotes and funding.

use std::collections::BTreeSet;

use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::db::Db;
use crate::error::{EngineError, EngineResult};
use crate::ledger::apply_tx;
use crate::models::{BalanceTxKind, Instrument, TradeImpact};
use crate::pricing;
use crate::store::{history, orgs, perps, pools};

#[derive(Clone)]
pub struct PriceUpdater {
    db: Db,
    synthetic_supply: f64,
    funding_rate_k: f64,
    funding_interval_sec: i64,
}

impl PriceUpdater {
    pub fn new(db: Db, cfg: &EngineConfig) -> Self {
        Self {
            db,
            synthetic_supply: cfg.synthetic_supply,
            funding_rate_k: cfg.funding_rate_k,
            funding_interval_sec: cfg.funding_interval_sec,
        }
    }

    /// Recompute the quoted price for every ticker touched by the batch.
    /// Price history is sampled at most once per tick per ticker (the
    /// insert is keyed on `(ticker, tick_no)`).
    pub async fn apply_impacts(
        &self,
        impacts: &[TradeImpact],
        tick_no: i64,
    ) -> EngineResult<Vec<(String, f64)>> {
        let tickers: BTreeSet<String> = impacts
            .iter()
            .filter_map(|impact| match &impact.instrument {
                Instrument::Perp(t) if !t.starts_with("liq:") => Some(t.clone()),
                _ => None,
            })
            .collect();

        let mut updated = Vec::new();
        let conn = self.db.lock().await;
        let tx = conn.unchecked_transaction()?;
        for ticker in tickers {
            let org = orgs::get_by_ticker(&tx, &ticker)?;
            let net = perps::net_signed_size(&tx, &ticker)?;
            let price = pricing::spot_price(org.initial_price, self.synthetic_supply, net);
            orgs::set_price(&tx, &ticker, price)?;
            history::insert_sample(&tx, &ticker, price, tick_no)?;

            let (oi_long, oi_short) = perps::open_interest(&tx, &ticker)?;
            let rate = pricing::funding_rate_from_skew(self.funding_rate_k, oi_long, oi_short);
            tx.execute(
                "UPDATE organizations SET funding_rate = ?1 WHERE ticker = ?2",
                rusqlite::params![rate, ticker],
            )?;

            debug!(ticker = %ticker, price, funding_rate = rate, "price updated");
            updated.push((ticker, price));
        }
        tx.commit()?;
        Ok(updated)
    }

    /// Apply funding payments for every ticker whose interval elapsed.
    /// Positive rates move cash from longs to shorts; each position's
    /// `funding_paid` accumulates its signed total.
    pub async fn apply_funding_if_due(&self, now: i64) -> EngineResult<u32> {
        let conn = self.db.lock().await;
        let due: Vec<(String, f64)> = {
            let mut stmt = conn.prepare_cached(
                "SELECT ticker, funding_rate FROM organizations WHERE last_funding_at <= ?1",
            )?;
            let rows = stmt.query_map([now - self.funding_interval_sec], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
            })?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r.map_err(EngineError::from)?);
            }
            out
        };

        let mut applied = 0u32;
        for (ticker, rate) in due {
            let tx = conn.unchecked_transaction()?;
            let positions = {
                let mut stmt = tx.prepare_cached(
                    "SELECT id, user_id, side, size FROM perp_positions \
                     WHERE ticker = ?1 AND closed_at IS NULL ORDER BY id ASC",
                )?;
                let rows = stmt.query_map([&ticker], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, f64>(3)?,
                    ))
                })?;
                let mut out = Vec::new();
                for r in rows {
                    out.push(r.map_err(EngineError::from)?);
                }
                out
            };

            for (position_id, user_id, side_str, size) in positions {
                let side = crate::models::PerpSide::parse(&side_str)
                    .ok_or_else(|| EngineError::Storage(format!("bad side {side_str}")))?;
                let payment = pricing::funding_payment(rate, side, size);
                if payment == 0.0 {
                    continue;
                }

                tx.execute(
                    "UPDATE perp_positions SET funding_paid = funding_paid + ?1 WHERE id = ?2",
                    rusqlite::params![payment, position_id],
                )?;

                let related = format!("funding:{ticker}:{position_id}");
                match pools::get_pool_by_npc(&tx, user_id) {
                    Ok(pool) => {
                        pools::adjust_pool(&tx, pool.id, payment, payment, payment)?;
                    }
                    Err(EngineError::NotFound(_)) => {
                        match apply_tx(&tx, user_id, BalanceTxKind::Funding, payment, Some(&related))
                        {
                            Ok(_) => {}
                            Err(EngineError::InsufficientFunds { .. }) => {
                                // Underfunded payer: skip rather than drive
                                // the balance negative. The position will
                                // be liquidated on the next adverse move.
                                warn!(user_id, ticker = %ticker, "funding debit skipped");
                            }
                            Err(e) => return Err(e),
                        }
                    }
                    Err(e) => return Err(e),
                }
                applied += 1;
            }

            tx.execute(
                "UPDATE organizations SET last_funding_at = ?1 WHERE ticker = ?2",
                rusqlite::params![now, ticker],
            )?;
            tx.commit()?;
        }
        Ok(applied)
    }
}
