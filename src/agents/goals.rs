//! Per-agent goals with bounded progress.

use rusqlite::{params, Row};

use crate::db::Db;
use crate::error::{EngineError, EngineResult};
use crate::models::{now_ts, Goal, GoalStatus, GoalTarget};

fn row_to_goal(row: &Row<'_>) -> rusqlite::Result<Goal> {
    let target_json: String = row.get(3)?;
    let status_str: String = row.get(5)?;
    Ok(Goal {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        name: row.get(2)?,
        target: serde_json::from_str(&target_json).unwrap_or(GoalTarget {
            metric: crate::models::GoalMetric::Pnl,
            value: 0.0,
            unit: String::new(),
        }),
        priority: row.get::<_, i64>(4)? as u8,
        status: GoalStatus::parse(&status_str).unwrap_or(GoalStatus::Active),
        progress: row.get(6)?,
        created_at: row.get(7)?,
        completed_at: row.get(8)?,
    })
}

const GOAL_COLUMNS: &str =
    "id, agent_id, name, target, priority, status, progress, created_at, completed_at";

#[derive(Clone)]
pub struct GoalStore {
    db: Db,
}

impl GoalStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn create(
        &self,
        agent_id: i64,
        name: &str,
        target: &GoalTarget,
        priority: u8,
    ) -> EngineResult<Goal> {
        let priority = priority.clamp(1, 10);
        let target_json =
            serde_json::to_string(target).map_err(|e| EngineError::Storage(e.to_string()))?;
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO goals (agent_id, name, target, priority, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![agent_id, name, target_json, priority as i64, now_ts()],
        )?;
        let id = conn.last_insert_rowid();
        conn.query_row(
            &format!("SELECT {GOAL_COLUMNS} FROM goals WHERE id = ?1"),
            params![id],
            row_to_goal,
        )
        .map_err(EngineError::from)
    }

    pub async fn get(&self, goal_id: i64) -> EngineResult<Goal> {
        let conn = self.db.lock().await;
        conn.query_row(
            &format!("SELECT {GOAL_COLUMNS} FROM goals WHERE id = ?1"),
            params![goal_id],
            row_to_goal,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                EngineError::NotFound(format!("goal {goal_id}"))
            }
            other => other.into(),
        })
    }

    pub async fn list_active(&self, agent_id: i64) -> EngineResult<Vec<Goal>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {GOAL_COLUMNS} FROM goals \
             WHERE agent_id = ?1 AND status = 'active' \
             ORDER BY priority DESC, id ASC"
        ))?;
        let rows = stmt.query_map(params![agent_id], row_to_goal)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r.map_err(EngineError::from)?);
        }
        Ok(out)
    }

    /// Add `delta` to progress, clamped to [0, 1]. Reaching 1.0 completes
    /// the goal and stamps the completion time. Returns the updated goal.
    pub async fn advance_progress(&self, goal_id: i64, delta: f64) -> EngineResult<Goal> {
        if !delta.is_finite() {
            return Err(EngineError::InvariantViolation(
                "non-finite goal progress delta".to_string(),
            ));
        }
        let conn = self.db.lock().await;
        let goal = conn
            .query_row(
                &format!("SELECT {GOAL_COLUMNS} FROM goals WHERE id = ?1"),
                params![goal_id],
                row_to_goal,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    EngineError::NotFound(format!("goal {goal_id}"))
                }
                other => other.into(),
            })?;
        if goal.status != GoalStatus::Active {
            return Ok(goal);
        }

        let progress = (goal.progress + delta).clamp(0.0, 1.0);
        if progress >= 1.0 {
            conn.execute(
                "UPDATE goals SET progress = 1.0, status = 'completed', completed_at = ?1 \
                 WHERE id = ?2",
                params![now_ts(), goal_id],
            )?;
        } else {
            conn.execute(
                "UPDATE goals SET progress = ?1 WHERE id = ?2",
                params![progress, goal_id],
            )?;
        }
        conn.query_row(
            &format!("SELECT {GOAL_COLUMNS} FROM goals WHERE id = ?1"),
            params![goal_id],
            row_to_goal,
        )
        .map_err(EngineError::from)
    }

    pub async fn abandon(&self, goal_id: i64) -> EngineResult<()> {
        let conn = self.db.lock().await;
        let n = conn.execute(
            "UPDATE goals SET status = 'abandoned' WHERE id = ?1 AND status = 'active'",
            params![goal_id],
        )?;
        if n == 0 {
            return Err(EngineError::NotFound(format!("active goal {goal_id}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::GoalMetric;

    fn pnl_target(value: f64) -> GoalTarget {
        GoalTarget {
            metric: GoalMetric::Pnl,
            value,
            unit: "cash".to_string(),
        }
    }

    #[tokio::test]
    async fn progress_clamps_and_completes() {
        let db = Db::open_in_memory().unwrap();
        let store = GoalStore::new(db);
        let goal = store
            .create(1, "earn 1000", &pnl_target(1000.0), 7)
            .await
            .unwrap();
        assert_eq!(goal.status, GoalStatus::Active);

        let g = store.advance_progress(goal.id, 0.6).await.unwrap();
        assert!((g.progress - 0.6).abs() < 1e-9);
        assert_eq!(g.status, GoalStatus::Active);
        assert!(g.completed_at.is_none());

        let g = store.advance_progress(goal.id, 0.7).await.unwrap();
        assert_eq!(g.progress, 1.0);
        assert_eq!(g.status, GoalStatus::Completed);
        assert!(g.completed_at.is_some());

        // Completed goals no longer move.
        let g = store.advance_progress(goal.id, -0.5).await.unwrap();
        assert_eq!(g.progress, 1.0);
        assert_eq!(g.status, GoalStatus::Completed);
    }

    #[tokio::test]
    async fn active_list_is_priority_ordered() {
        let db = Db::open_in_memory().unwrap();
        let store = GoalStore::new(db);
        store.create(1, "low", &pnl_target(1.0), 2).await.unwrap();
        let high = store.create(1, "high", &pnl_target(1.0), 9).await.unwrap();
        store.create(2, "other agent", &pnl_target(1.0), 10).await.unwrap();

        let active = store.list_active(1).await.unwrap();
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].id, high.id);

        store.abandon(high.id).await.unwrap();
        assert_eq!(store.list_active(1).await.unwrap().len(), 1);
    }
}
