//! Price history and tick summaries.

use rusqlite::{params, Connection, Row};

use crate::db::Db;
use crate::error::{EngineError, EngineResult};
use crate::models::{now_ts, TickSummary};

#[derive(Debug, Clone)]
pub struct PriceSample {
    pub ticker: String,
    pub price: f64,
    pub tick_no: i64,
    pub created_at: i64,
}

fn row_to_summary(row: &Row<'_>) -> rusqlite::Result<TickSummary> {
    Ok(TickSummary {
        tick_no: row.get(0)?,
        started_at: row.get(1)?,
        finished_at: row.get(2)?,
        npcs_decided: row.get::<_, i64>(3)? as u32,
        trades_attempted: row.get::<_, i64>(4)? as u32,
        trades_succeeded: row.get::<_, i64>(5)? as u32,
        markets_resolved: row.get::<_, i64>(6)? as u32,
    })
}

/// At most one sample per ticker per tick; replays are no-ops.
pub(crate) fn insert_sample(
    conn: &Connection,
    ticker: &str,
    price: f64,
    tick_no: i64,
) -> EngineResult<()> {
    conn.execute(
        "INSERT OR IGNORE INTO price_history (ticker, price, tick_no, created_at) \
         VALUES (?1, ?2, ?3, ?4)",
        params![ticker, price, tick_no, now_ts()],
    )?;
    Ok(())
}

#[derive(Clone)]
pub struct HistoryStore {
    db: Db,
}

impl HistoryStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn recent_prices(
        &self,
        ticker: &str,
        limit: usize,
    ) -> EngineResult<Vec<PriceSample>> {
        let limit = limit.clamp(1, 10_000) as i64;
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT ticker, price, tick_no, created_at FROM price_history \
             WHERE ticker = ?1 ORDER BY tick_no DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![ticker, limit], |row| {
            Ok(PriceSample {
                ticker: row.get(0)?,
                price: row.get(1)?,
                tick_no: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r.map_err(EngineError::from)?);
        }
        Ok(out)
    }

    pub async fn insert_tick_summary(&self, summary: &TickSummary) -> EngineResult<()> {
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO tick_summaries \
             (tick_no, started_at, finished_at, npcs_decided, trades_attempted, \
              trades_succeeded, markets_resolved) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                summary.tick_no,
                summary.started_at,
                summary.finished_at,
                summary.npcs_decided as i64,
                summary.trades_attempted as i64,
                summary.trades_succeeded as i64,
                summary.markets_resolved as i64,
            ],
        )?;
        Ok(())
    }

    pub async fn latest_tick_summary(&self) -> EngineResult<Option<TickSummary>> {
        let conn = self.db.lock().await;
        conn.query_row(
            "SELECT tick_no, started_at, finished_at, npcs_decided, trades_attempted, \
                    trades_succeeded, markets_resolved \
             FROM tick_summaries ORDER BY tick_no DESC LIMIT 1",
            [],
            row_to_summary,
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(EngineError::from(other)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn one_sample_per_ticker_per_tick() {
        let db = Db::open_in_memory().unwrap();
        let store = HistoryStore::new(db.clone());
        {
            let conn = db.lock().await;
            insert_sample(&conn, "ACME", 50.0, 1).unwrap();
            insert_sample(&conn, "ACME", 51.0, 1).unwrap(); // ignored
            insert_sample(&conn, "ACME", 52.0, 2).unwrap();
        }
        let samples = store.recent_prices("ACME", 10).await.unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].tick_no, 2);
        assert_eq!(samples[1].price, 50.0);
    }

    #[tokio::test]
    async fn tick_summary_round_trip() {
        let db = Db::open_in_memory().unwrap();
        let store = HistoryStore::new(db);
        assert!(store.latest_tick_summary().await.unwrap().is_none());
        store
            .insert_tick_summary(&TickSummary {
                tick_no: 3,
                started_at: 100,
                finished_at: 105,
                npcs_decided: 4,
                trades_attempted: 9,
                trades_succeeded: 7,
                markets_resolved: 1,
            })
            .await
            .unwrap();
        let latest = store.latest_tick_summary().await.unwrap().unwrap();
        assert_eq!(latest.tick_no, 3);
        assert_eq!(latest.trades_succeeded, 7);
    }
}
