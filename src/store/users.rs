//! User rows: humans, autonomous agents, NPC actors.

use rusqlite::{params, Connection, Row};

use crate::db::Db;
use crate::error::{EngineError, EngineResult};
use crate::models::{
    now_ts, AgentCapability, ModelTier, PlanningHorizon, RiskTolerance, UserRecord,
};

fn row_to_user(row: &Row<'_>) -> rusqlite::Result<UserRecord> {
    let caps_json: String = row.get(13)?;
    let capabilities: Vec<String> = serde_json::from_str(&caps_json).unwrap_or_default();
    let risk: String = row.get(15)?;
    let horizon: String = row.get(16)?;
    let tier: String = row.get(17)?;
    Ok(UserRecord {
        id: row.get(0)?,
        handle: row.get(1)?,
        is_agent: row.get::<_, i64>(2)? != 0,
        is_npc_actor: row.get::<_, i64>(3)? != 0,
        is_admin: row.get::<_, i64>(4)? != 0,
        is_banned: row.get::<_, i64>(5)? != 0,
        is_active: row.get::<_, i64>(6)? != 0,
        virtual_balance: row.get(7)?,
        earned_points: row.get(8)?,
        invite_points: row.get(9)?,
        bonus_points: row.get(10)?,
        agent_points: row.get(11)?,
        manager_id: row.get(12)?,
        system_prompt: row.get(14)?,
        capabilities: capabilities
            .iter()
            .filter_map(|s| AgentCapability::parse(s))
            .collect(),
        max_actions_per_tick: row.get::<_, i64>(18)? as u32,
        risk_tolerance: RiskTolerance::parse(&risk).unwrap_or(RiskTolerance::Medium),
        planning_horizon: PlanningHorizon::parse(&horizon).unwrap_or(PlanningHorizon::Medium),
        model_tier: ModelTier::parse(&tier).unwrap_or(ModelTier::Free),
        created_at: row.get(19)?,
    })
}

const USER_COLUMNS: &str = "id, handle, is_agent, is_npc_actor, is_admin, is_banned, is_active, \
     virtual_balance, earned_points, invite_points, bonus_points, agent_points, \
     manager_id, capabilities, system_prompt, risk_tolerance, planning_horizon, model_tier, \
     max_actions_per_tick, created_at";

pub(crate) fn get_user(conn: &Connection, user_id: i64) -> EngineResult<UserRecord> {
    conn.query_row(
        &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
        params![user_id],
        row_to_user,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => EngineError::NotFound(format!("user {user_id}")),
        other => other.into(),
    })
}

/// Parameters for creating an autonomous agent.
#[derive(Debug, Clone)]
pub struct NewAgent {
    pub handle: String,
    pub manager_id: i64,
    pub system_prompt: String,
    pub capabilities: Vec<AgentCapability>,
    pub max_actions_per_tick: u32,
    pub risk_tolerance: RiskTolerance,
    pub planning_horizon: PlanningHorizon,
    pub model_tier: ModelTier,
    pub starting_points: i64,
}

#[derive(Clone)]
pub struct UserStore {
    db: Db,
}

impl UserStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn create_human(&self, handle: &str) -> EngineResult<i64> {
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO users (handle, created_at) VALUES (?1, ?2)",
            params![handle, now_ts()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn create_agent(&self, agent: &NewAgent) -> EngineResult<i64> {
        let caps: Vec<&str> = agent.capabilities.iter().map(|c| c.as_str()).collect();
        let caps_json = serde_json::to_string(&caps)
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO users \
             (handle, is_agent, manager_id, system_prompt, capabilities, \
              max_actions_per_tick, risk_tolerance, planning_horizon, model_tier, \
              agent_points, created_at) \
             VALUES (?1, 1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                agent.handle,
                agent.manager_id,
                agent.system_prompt,
                caps_json,
                agent.max_actions_per_tick as i64,
                agent.risk_tolerance.as_str(),
                agent.planning_horizon.as_str(),
                agent.model_tier.as_str(),
                agent.starting_points,
                now_ts(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn create_npc_actor(&self, handle: &str, system_prompt: &str) -> EngineResult<i64> {
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO users (handle, is_npc_actor, system_prompt, created_at) \
             VALUES (?1, 1, ?2, ?3)",
            params![handle, system_prompt, now_ts()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn get(&self, user_id: i64) -> EngineResult<UserRecord> {
        let conn = self.db.lock().await;
        get_user(&conn, user_id)
    }

    pub async fn get_by_handle(&self, handle: &str) -> EngineResult<UserRecord> {
        let conn = self.db.lock().await;
        conn.query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE handle = ?1"),
            params![handle],
            row_to_user,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                EngineError::NotFound(format!("user @{handle}"))
            }
            other => other.into(),
        })
    }

    pub async fn set_banned(&self, user_id: i64, banned: bool) -> EngineResult<()> {
        let conn = self.db.lock().await;
        let n = conn.execute(
            "UPDATE users SET is_banned = ?1 WHERE id = ?2",
            params![banned as i64, user_id],
        )?;
        if n == 0 {
            return Err(EngineError::NotFound(format!("user {user_id}")));
        }
        Ok(())
    }

    pub async fn set_active(&self, user_id: i64, active: bool) -> EngineResult<()> {
        let conn = self.db.lock().await;
        let n = conn.execute(
            "UPDATE users SET is_active = ?1 WHERE id = ?2",
            params![active as i64, user_id],
        )?;
        if n == 0 {
            return Err(EngineError::NotFound(format!("user {user_id}")));
        }
        Ok(())
    }

    /// Agents eligible for the autonomous sweep: active, not banned.
    pub async fn list_active_agents(&self) -> EngineResult<Vec<UserRecord>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {USER_COLUMNS} FROM users \
             WHERE is_agent = 1 AND is_active = 1 AND is_banned = 0 ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map([], row_to_user)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r.map_err(EngineError::from)?);
        }
        Ok(out)
    }

    pub async fn list_npc_actors(&self) -> EngineResult<Vec<UserRecord>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {USER_COLUMNS} FROM users \
             WHERE is_npc_actor = 1 AND is_banned = 0 ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map([], row_to_user)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r.map_err(EngineError::from)?);
        }
        Ok(out)
    }

    /// All user ids, for invariant audits.
    pub async fn list_ids(&self) -> EngineResult<Vec<i64>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare_cached("SELECT id FROM users ORDER BY id ASC")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r.map_err(EngineError::from)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_and_fetch_agent() {
        let db = Db::open_in_memory().unwrap();
        let store = UserStore::new(db);
        let manager = store.create_human("manager").await.unwrap();
        let id = store
            .create_agent(&NewAgent {
                handle: "trader-01".to_string(),
                manager_id: manager,
                system_prompt: "You are a cautious value trader.".to_string(),
                capabilities: vec![AgentCapability::Trading, AgentCapability::Posting],
                max_actions_per_tick: 4,
                risk_tolerance: RiskTolerance::Low,
                planning_horizon: PlanningHorizon::Long,
                model_tier: ModelTier::Pro,
                starting_points: 100,
            })
            .await
            .unwrap();

        let agent = store.get(id).await.unwrap();
        assert!(agent.is_agent);
        assert_eq!(agent.manager_id, Some(manager));
        assert!(agent.has_capability(AgentCapability::Trading));
        assert!(!agent.has_capability(AgentCapability::Dm));
        assert_eq!(agent.model_tier, ModelTier::Pro);
        assert_eq!(agent.agent_points, 100);
    }

    #[tokio::test]
    async fn banned_users_filtered_from_sweeps() {
        let db = Db::open_in_memory().unwrap();
        let store = UserStore::new(db);
        let manager = store.create_human("m").await.unwrap();
        let a = store
            .create_agent(&NewAgent {
                handle: "a".to_string(),
                manager_id: manager,
                system_prompt: String::new(),
                capabilities: vec![AgentCapability::Trading],
                max_actions_per_tick: 2,
                risk_tolerance: RiskTolerance::Medium,
                planning_horizon: PlanningHorizon::Medium,
                model_tier: ModelTier::Free,
                starting_points: 10,
            })
            .await
            .unwrap();
        assert_eq!(store.list_active_agents().await.unwrap().len(), 1);
        store.set_banned(a, true).await.unwrap();
        assert!(store.list_active_agents().await.unwrap().is_empty());
    }
}
