//! Perpetual positions.

use std::collections::HashMap;

use rusqlite::{params, Connection, Row};

use crate::db::Db;
use crate::error::{EngineError, EngineResult};
use crate::models::{now_ts, PerpPosition, PerpSide};
use crate::pricing;

pub(crate) fn row_to_position(row: &Row<'_>) -> rusqlite::Result<PerpPosition> {
    let side_str: String = row.get(3)?;
    Ok(PerpPosition {
        id: row.get(0)?,
        user_id: row.get(1)?,
        ticker: row.get(2)?,
        side: PerpSide::parse(&side_str).unwrap_or(PerpSide::Long),
        size: row.get(4)?,
        leverage: row.get(5)?,
        entry_price: row.get(6)?,
        liquidation_price: row.get(7)?,
        funding_paid: row.get(8)?,
        opened_at: row.get(9)?,
        closed_at: row.get(10)?,
    })
}

pub(crate) const POSITION_COLUMNS: &str = "id, user_id, ticker, side, size, leverage, entry_price, \
     liquidation_price, funding_paid, opened_at, closed_at";

pub(crate) fn get_position(conn: &Connection, position_id: i64) -> EngineResult<PerpPosition> {
    conn.query_row(
        &format!("SELECT {POSITION_COLUMNS} FROM perp_positions WHERE id = ?1"),
        params![position_id],
        row_to_position,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => {
            EngineError::PositionNotFound(format!("perp position {position_id}"))
        }
        other => other.into(),
    })
}

pub(crate) fn insert_position(
    conn: &Connection,
    user_id: i64,
    ticker: &str,
    side: PerpSide,
    size: f64,
    leverage: f64,
    entry_price: f64,
    liquidation_price: f64,
) -> EngineResult<i64> {
    conn.execute(
        "INSERT INTO perp_positions \
         (user_id, ticker, side, size, leverage, entry_price, liquidation_price, opened_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            user_id,
            ticker,
            side.as_str(),
            size,
            leverage,
            entry_price,
            liquidation_price,
            now_ts()
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn mark_closed(conn: &Connection, position_id: i64) -> EngineResult<()> {
    let n = conn.execute(
        "UPDATE perp_positions SET closed_at = ?1 WHERE id = ?2 AND closed_at IS NULL",
        params![now_ts(), position_id],
    )?;
    if n == 0 {
        return Err(EngineError::PositionNotFound(format!(
            "perp position {position_id} already closed"
        )));
    }
    Ok(())
}

pub(crate) fn open_position_for_user_ticker(
    conn: &Connection,
    user_id: i64,
    ticker: &str,
) -> EngineResult<Option<PerpPosition>> {
    conn.query_row(
        &format!(
            "SELECT {POSITION_COLUMNS} FROM perp_positions \
             WHERE user_id = ?1 AND ticker = ?2 AND closed_at IS NULL \
             ORDER BY id ASC LIMIT 1"
        ),
        params![user_id, ticker],
        row_to_position,
    )
    .map(Some)
    .or_else(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => Ok(None),
        other => Err(EngineError::from(other)),
    })
}

/// Net signed open interest for a ticker: `+size` long, `-size` short.
pub(crate) fn net_signed_size(conn: &Connection, ticker: &str) -> EngineResult<f64> {
    let net: f64 = conn.query_row(
        "SELECT COALESCE(SUM(CASE side WHEN 'long' THEN size ELSE -size END), 0) \
         FROM perp_positions WHERE ticker = ?1 AND closed_at IS NULL",
        params![ticker],
        |row| row.get(0),
    )?;
    Ok(net)
}

/// `(oi_long, oi_short)` for a ticker.
pub(crate) fn open_interest(conn: &Connection, ticker: &str) -> EngineResult<(f64, f64)> {
    conn.query_row(
        "SELECT \
            COALESCE(SUM(CASE side WHEN 'long' THEN size ELSE 0 END), 0), \
            COALESCE(SUM(CASE side WHEN 'short' THEN size ELSE 0 END), 0) \
         FROM perp_positions WHERE ticker = ?1 AND closed_at IS NULL",
        params![ticker],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .map_err(EngineError::from)
}

#[derive(Clone)]
pub struct PerpPositionStore {
    db: Db,
}

impl PerpPositionStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn get(&self, position_id: i64) -> EngineResult<PerpPosition> {
        let conn = self.db.lock().await;
        get_position(&conn, position_id)
    }

    pub async fn list_open_for_user(&self, user_id: i64) -> EngineResult<Vec<PerpPosition>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {POSITION_COLUMNS} FROM perp_positions \
             WHERE user_id = ?1 AND closed_at IS NULL ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map(params![user_id], row_to_position)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r.map_err(EngineError::from)?);
        }
        Ok(out)
    }

    pub async fn list_open_by_ticker(&self, ticker: &str) -> EngineResult<Vec<PerpPosition>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {POSITION_COLUMNS} FROM perp_positions \
             WHERE ticker = ?1 AND closed_at IS NULL ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map(params![ticker], row_to_position)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r.map_err(EngineError::from)?);
        }
        Ok(out)
    }

    pub async fn list_all_open(&self) -> EngineResult<Vec<PerpPosition>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {POSITION_COLUMNS} FROM perp_positions \
             WHERE closed_at IS NULL ORDER BY ticker ASC, id ASC"
        ))?;
        let rows = stmt.query_map([], row_to_position)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r.map_err(EngineError::from)?);
        }
        Ok(out)
    }

    /// Open positions whose liquidation price has been crossed under the
    /// given mark-price map.
    pub async fn list_liquidatable(
        &self,
        prices: &HashMap<String, f64>,
    ) -> EngineResult<Vec<PerpPosition>> {
        let open = self.list_all_open().await?;
        Ok(open
            .into_iter()
            .filter(|p| {
                prices
                    .get(&p.ticker)
                    .map(|mark| pricing::is_liquidatable(*mark, p.liquidation_price, p.side))
                    .unwrap_or(false)
            })
            .collect())
    }

    pub async fn accrue_funding(&self, position_id: i64, payment: f64) -> EngineResult<()> {
        let conn = self.db.lock().await;
        let n = conn.execute(
            "UPDATE perp_positions SET funding_paid = funding_paid + ?1 \
             WHERE id = ?2 AND closed_at IS NULL",
            params![payment, position_id],
        )?;
        if n == 0 {
            return Err(EngineError::PositionNotFound(format!(
                "perp position {position_id}"
            )));
        }
        Ok(())
    }
}
