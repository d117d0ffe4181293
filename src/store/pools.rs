//! NPC-operated liquidity pools.
//!
//! A pool holds positions exactly like a user (positions carry the NPC's
//! user id) plus its own cash accounting. At rest
//! `available_balance + sum(open position margins/cost) == total_value`.

use rusqlite::{params, Connection, Row};

use crate::db::Db;
use crate::error::{EngineError, EngineResult};
use crate::models::{now_ts, PerpPosition, Pool, PredictionPosition};
use crate::store::markets::{
    row_to_position as prediction_position_row, POSITION_COLUMNS as PREDICTION_POSITION_COLUMNS,
};
use crate::store::perps::{
    row_to_position as perp_position_row, POSITION_COLUMNS as PERP_POSITION_COLUMNS,
};

fn row_to_pool(row: &Row<'_>) -> rusqlite::Result<Pool> {
    Ok(Pool {
        id: row.get(0)?,
        npc_user_id: row.get(1)?,
        name: row.get(2)?,
        total_value: row.get(3)?,
        available_balance: row.get(4)?,
        lifetime_pnl: row.get(5)?,
        performance_fee_rate: row.get(6)?,
        created_at: row.get(7)?,
    })
}

const POOL_COLUMNS: &str = "id, npc_user_id, name, total_value, available_balance, \
     lifetime_pnl, performance_fee_rate, created_at";

pub(crate) fn get_pool_by_npc(conn: &Connection, npc_user_id: i64) -> EngineResult<Pool> {
    conn.query_row(
        &format!("SELECT {POOL_COLUMNS} FROM pools WHERE npc_user_id = ?1"),
        params![npc_user_id],
        row_to_pool,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => {
            EngineError::NotFound(format!("pool for npc {npc_user_id}"))
        }
        other => other.into(),
    })
}

/// Move cash between the pool's available balance and deployed positions.
/// `available_delta` < 0 deploys cash into a position; a matching
/// `total_delta` records realized gains or losses.
pub(crate) fn adjust_pool(
    conn: &Connection,
    pool_id: i64,
    available_delta: f64,
    total_delta: f64,
    pnl_delta: f64,
) -> EngineResult<()> {
    let n = conn.execute(
        "UPDATE pools SET \
            available_balance = available_balance + ?1, \
            total_value = total_value + ?2, \
            lifetime_pnl = lifetime_pnl + ?3 \
         WHERE id = ?4 AND available_balance + ?1 >= -1e-9",
        params![available_delta, total_delta, pnl_delta, pool_id],
    )?;
    if n == 0 {
        let available: f64 = conn
            .query_row(
                "SELECT available_balance FROM pools WHERE id = ?1",
                params![pool_id],
                |row| row.get(0),
            )
            .map_err(|_| EngineError::NotFound(format!("pool {pool_id}")))?;
        return Err(EngineError::InsufficientFunds {
            needed: -available_delta,
            available,
        });
    }
    Ok(())
}

pub(crate) fn link_position(
    conn: &Connection,
    pool_id: i64,
    position_kind: &str,
    position_id: i64,
) -> EngineResult<()> {
    conn.execute(
        "INSERT OR IGNORE INTO pool_positions (pool_id, position_kind, position_id) \
         VALUES (?1, ?2, ?3)",
        params![pool_id, position_kind, position_id],
    )?;
    Ok(())
}

/// Open positions held by a pool, split by instrument family.
#[derive(Debug, Clone, Default)]
pub struct PoolPositions {
    pub perps: Vec<PerpPosition>,
    pub predictions: Vec<PredictionPosition>,
}

impl PoolPositions {
    /// Cash deployed out of the pool's available balance: perp margin
    /// plus prediction cost basis. At rest
    /// `available_balance + deployed() == total_value`.
    pub fn deployed(&self) -> f64 {
        let margins: f64 = self.perps.iter().map(|p| p.margin()).sum();
        let cost_basis: f64 = self
            .predictions
            .iter()
            .map(|p| p.shares * p.avg_price)
            .sum();
        margins + cost_basis
    }

    pub fn is_empty(&self) -> bool {
        self.perps.is_empty() && self.predictions.is_empty()
    }
}

#[derive(Clone)]
pub struct PoolStore {
    db: Db,
}

impl PoolStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn create(
        &self,
        npc_user_id: i64,
        name: &str,
        starting_balance: f64,
        performance_fee_rate: f64,
    ) -> EngineResult<Pool> {
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO pools \
             (npc_user_id, name, total_value, available_balance, performance_fee_rate, created_at) \
             VALUES (?1, ?2, ?3, ?3, ?4, ?5)",
            params![
                npc_user_id,
                name,
                starting_balance,
                performance_fee_rate,
                now_ts()
            ],
        )?;
        get_pool_by_npc(&conn, npc_user_id)
    }

    pub async fn get_by_npc(&self, npc_user_id: i64) -> EngineResult<Pool> {
        let conn = self.db.lock().await;
        get_pool_by_npc(&conn, npc_user_id)
    }

    pub async fn get(&self, pool_id: i64) -> EngineResult<Pool> {
        let conn = self.db.lock().await;
        conn.query_row(
            &format!("SELECT {POOL_COLUMNS} FROM pools WHERE id = ?1"),
            params![pool_id],
            row_to_pool,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                EngineError::NotFound(format!("pool {pool_id}"))
            }
            other => other.into(),
        })
    }

    pub async fn list(&self) -> EngineResult<Vec<Pool>> {
        let conn = self.db.lock().await;
        let mut stmt =
            conn.prepare_cached(&format!("SELECT {POOL_COLUMNS} FROM pools ORDER BY id ASC"))?;
        let rows = stmt.query_map([], row_to_pool)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r.map_err(EngineError::from)?);
        }
        Ok(out)
    }

    /// All open positions the pool holds, via the `pool_positions`
    /// linkage. Rows whose underlying position has since closed are
    /// filtered out by the join.
    pub async fn list_open_positions(&self, pool_id: i64) -> EngineResult<PoolPositions> {
        let conn = self.db.lock().await;

        let mut positions = PoolPositions::default();
        {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {PERP_POSITION_COLUMNS} FROM perp_positions \
                 JOIN pool_positions ON pool_positions.position_kind = 'perp' \
                    AND pool_positions.position_id = perp_positions.id \
                 WHERE pool_positions.pool_id = ?1 AND closed_at IS NULL \
                 ORDER BY perp_positions.id ASC"
            ))?;
            let rows = stmt.query_map(params![pool_id], perp_position_row)?;
            for r in rows {
                positions.perps.push(r.map_err(EngineError::from)?);
            }
        }
        {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {PREDICTION_POSITION_COLUMNS} FROM prediction_positions \
                 JOIN pool_positions ON pool_positions.position_kind = 'prediction' \
                    AND pool_positions.position_id = prediction_positions.id \
                 WHERE pool_positions.pool_id = ?1 AND closed_at IS NULL \
                 ORDER BY prediction_positions.id ASC"
            ))?;
            let rows = stmt.query_map(params![pool_id], prediction_position_row)?;
            for r in rows {
                positions.predictions.push(r.map_err(EngineError::from)?);
            }
        }

        Ok(positions)
    }

    /// Audit the pool accounting identity:
    /// `available_balance + deployed == total_value`. A mismatch means a
    /// write path skipped one side of the pool update and is fatal.
    pub async fn verify_pool(&self, pool_id: i64) -> EngineResult<()> {
        let pool = self.get(pool_id).await?;
        let deployed = self.list_open_positions(pool_id).await?.deployed();
        let drift = (pool.available_balance + deployed - pool.total_value).abs();
        if drift > 1e-6 {
            return Err(EngineError::InvariantViolation(format!(
                "pool {pool_id}: available {} + deployed {deployed} != total {}",
                pool.available_balance, pool.total_value
            )));
        }
        Ok(())
    }
}
