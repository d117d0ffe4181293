//! Prediction markets and their positions.

use rusqlite::{params, Connection, Row};

use crate::db::Db;
use crate::error::{EngineError, EngineResult};
use crate::models::{now_ts, Outcome, PredictionMarket, PredictionPosition, PredictionSide};

fn row_to_market(row: &Row<'_>) -> rusqlite::Result<PredictionMarket> {
    let outcome_str: String = row.get(5)?;
    Ok(PredictionMarket {
        id: row.get(0)?,
        prompt: row.get(1)?,
        category: row.get(2)?,
        resolution_time: row.get(3)?,
        resolved: row.get::<_, i64>(4)? != 0,
        outcome: Outcome::parse(&outcome_str).unwrap_or(Outcome::Unresolved),
        b: row.get(6)?,
        q_yes: row.get(7)?,
        q_no: row.get(8)?,
        escrow: row.get(9)?,
        created_at: row.get(10)?,
    })
}

pub(crate) fn row_to_position(row: &Row<'_>) -> rusqlite::Result<PredictionPosition> {
    let side_str: String = row.get(3)?;
    Ok(PredictionPosition {
        id: row.get(0)?,
        user_id: row.get(1)?,
        market_id: row.get(2)?,
        side: PredictionSide::parse(&side_str).unwrap_or(PredictionSide::Yes),
        shares: row.get(4)?,
        avg_price: row.get(5)?,
        opened_at: row.get(6)?,
        closed_at: row.get(7)?,
    })
}

const MARKET_COLUMNS: &str =
    "id, prompt, category, resolution_time, resolved, outcome, b, q_yes, q_no, escrow, created_at";
pub(crate) const POSITION_COLUMNS: &str =
    "id, user_id, market_id, side, shares, avg_price, opened_at, closed_at";

pub(crate) fn get_market(conn: &Connection, market_id: i64) -> EngineResult<PredictionMarket> {
    conn.query_row(
        &format!("SELECT {MARKET_COLUMNS} FROM prediction_markets WHERE id = ?1"),
        params![market_id],
        row_to_market,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => {
            EngineError::NotFound(format!("market {market_id}"))
        }
        other => other.into(),
    })
}

/// Update shares outstanding and escrow after a trade. Escrow accumulates
/// trade cash in and pays sell proceeds out, on top of the creation
/// subsidy, so it always covers the winning side at resolution.
pub(crate) fn apply_trade(
    conn: &Connection,
    market_id: i64,
    new_q_yes: f64,
    new_q_no: f64,
    escrow_delta: f64,
) -> EngineResult<()> {
    let n = conn.execute(
        "UPDATE prediction_markets \
         SET q_yes = ?1, q_no = ?2, escrow = escrow + ?3 \
         WHERE id = ?4 AND resolved = 0",
        params![new_q_yes, new_q_no, escrow_delta, market_id],
    )?;
    if n == 0 {
        return Err(EngineError::MarketClosed(market_id));
    }
    Ok(())
}

/// Upsert the `(user, market, side)` position with a weighted average
/// entry price. Returns the position id.
pub(crate) fn upsert_position(
    conn: &Connection,
    user_id: i64,
    market_id: i64,
    side: PredictionSide,
    shares_delta: f64,
    trade_price: f64,
) -> EngineResult<i64> {
    let existing: Option<(i64, f64, f64)> = conn
        .query_row(
            "SELECT id, shares, avg_price FROM prediction_positions \
             WHERE user_id = ?1 AND market_id = ?2 AND side = ?3 AND closed_at IS NULL",
            params![user_id, market_id, side.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(EngineError::from(other)),
        })?;

    match existing {
        Some((id, shares, avg_price)) => {
            let new_shares = shares + shares_delta;
            if new_shares < -1e-9 {
                return Err(EngineError::PositionNotFound(format!(
                    "position {id}: cannot sell {} of {shares} shares",
                    -shares_delta
                )));
            }
            let new_shares = new_shares.max(0.0);
            // Buys move the weighted average; sells realize at it.
            let new_avg = if shares_delta > 0.0 && new_shares > 0.0 {
                (shares * avg_price + shares_delta * trade_price) / new_shares
            } else {
                avg_price
            };
            if new_shares <= 1e-9 {
                conn.execute(
                    "UPDATE prediction_positions \
                     SET shares = 0, closed_at = ?1 WHERE id = ?2",
                    params![now_ts(), id],
                )?;
            } else {
                conn.execute(
                    "UPDATE prediction_positions SET shares = ?1, avg_price = ?2 WHERE id = ?3",
                    params![new_shares, new_avg, id],
                )?;
            }
            Ok(id)
        }
        None => {
            if shares_delta <= 0.0 {
                return Err(EngineError::PositionNotFound(format!(
                    "no open {} position for user {user_id} on market {market_id}",
                    side.as_str()
                )));
            }
            conn.execute(
                "INSERT INTO prediction_positions \
                 (user_id, market_id, side, shares, avg_price, opened_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    user_id,
                    market_id,
                    side.as_str(),
                    shares_delta,
                    trade_price,
                    now_ts()
                ],
            )?;
            Ok(conn.last_insert_rowid())
        }
    }
}

pub(crate) fn open_positions_for_market(
    conn: &Connection,
    market_id: i64,
) -> EngineResult<Vec<PredictionPosition>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {POSITION_COLUMNS} FROM prediction_positions \
         WHERE market_id = ?1 AND closed_at IS NULL ORDER BY id ASC"
    ))?;
    let rows = stmt.query_map(params![market_id], row_to_position)?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r.map_err(EngineError::from)?);
    }
    Ok(out)
}

#[derive(Clone)]
pub struct PredictionMarketStore {
    db: Db,
}

impl PredictionMarketStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Create a market. The escrow is seeded with the LMSR subsidy
    /// `b * ln(2)`, the maximum the market maker can lose.
    pub async fn create(
        &self,
        prompt: &str,
        category: &str,
        resolution_time: i64,
        b: f64,
    ) -> EngineResult<PredictionMarket> {
        if !(b.is_finite() && b > 0.0) {
            return Err(EngineError::InvariantViolation(format!(
                "liquidity parameter must be positive, got {b}"
            )));
        }
        let escrow = b * std::f64::consts::LN_2;
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO prediction_markets \
             (prompt, category, resolution_time, b, escrow, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![prompt, category, resolution_time, b, escrow, now_ts()],
        )?;
        let id = conn.last_insert_rowid();
        get_market(&conn, id)
    }

    pub async fn get(&self, market_id: i64) -> EngineResult<PredictionMarket> {
        let conn = self.db.lock().await;
        get_market(&conn, market_id)
    }

    pub async fn list_open(&self, now: i64) -> EngineResult<Vec<PredictionMarket>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {MARKET_COLUMNS} FROM prediction_markets \
             WHERE resolved = 0 AND resolution_time > ?1 ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map(params![now], row_to_market)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r.map_err(EngineError::from)?);
        }
        Ok(out)
    }

    /// Markets past their resolution time and not yet resolved.
    pub async fn list_matured(&self, now: i64) -> EngineResult<Vec<PredictionMarket>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {MARKET_COLUMNS} FROM prediction_markets \
             WHERE resolved = 0 AND resolution_time <= ?1 ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map(params![now], row_to_market)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r.map_err(EngineError::from)?);
        }
        Ok(out)
    }

    pub async fn open_positions(&self, market_id: i64) -> EngineResult<Vec<PredictionPosition>> {
        let conn = self.db.lock().await;
        open_positions_for_market(&conn, market_id)
    }

    pub async fn open_positions_for_user(
        &self,
        user_id: i64,
    ) -> EngineResult<Vec<PredictionPosition>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {POSITION_COLUMNS} FROM prediction_positions \
             WHERE user_id = ?1 AND closed_at IS NULL ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map(params![user_id], row_to_position)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r.map_err(EngineError::from)?);
        }
        Ok(out)
    }
}
