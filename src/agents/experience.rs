//! Durable agent memory: recorded experiences with importance-weighted
//! retrieval for planning context.

use rusqlite::{params, Row};

use crate::db::Db;
use crate::error::{EngineError, EngineResult};
use crate::models::{now_ts, Experience};

fn row_to_experience(row: &Row<'_>) -> rusqlite::Result<Experience> {
    Ok(Experience {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        kind: row.get(2)?,
        content: row.get(3)?,
        importance: row.get(4)?,
        created_at: row.get(5)?,
    })
}

#[derive(Clone)]
pub struct ExperienceStore {
    db: Db,
}

impl ExperienceStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn record(
        &self,
        agent_id: i64,
        kind: &str,
        content: &str,
        importance: f64,
    ) -> EngineResult<i64> {
        let importance = importance.clamp(0.0, 1.0);
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO experiences (agent_id, kind, content, importance, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![agent_id, kind, content, importance, now_ts()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Most relevant memories: importance first, recency as tiebreaker.
    pub async fn retrieve(&self, agent_id: i64, limit: usize) -> EngineResult<Vec<Experience>> {
        let limit = limit.clamp(1, 100) as i64;
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, agent_id, kind, content, importance, created_at FROM experiences \
             WHERE agent_id = ?1 ORDER BY importance DESC, created_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![agent_id, limit], row_to_experience)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r.map_err(EngineError::from)?);
        }
        Ok(out)
    }
}
