//! Structured capture of agent episodes.
//!
//! An episode accumulates in memory while the agent ticks and persists as
//! one row when it ends: a JSON step sequence plus denormalized scalars
//! for indexed querying. Every LLM call is also mirrored into
//! `llm_call_log` immediately, so analytics see calls from episodes that
//! never completed.

use std::collections::HashMap;

use parking_lot::Mutex;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::Db;
use crate::error::{EngineError, EngineResult};
use crate::models::now_ts;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmCallRecord {
    pub model: String,
    pub system_prompt: String,
    pub user_prompt: String,
    pub response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    pub temperature: f64,
    pub max_tokens: u32,
    pub latency_ms: u64,
    pub purpose: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderAccess {
    pub provider_name: String,
    pub data: String,
    pub purpose: String,
}

/// One decision step: observation in, at most one chosen action out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrajectoryStep {
    pub env_state: serde_json::Value,
    pub llm_calls: Vec<LlmCallRecord>,
    pub provider_accesses: Vec<ProviderAccess>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<serde_json::Value>,
    pub reward: f64,
}

struct Draft {
    agent_id: i64,
    scenario_id: Option<String>,
    window_id: i64,
    metadata: Option<serde_json::Value>,
    steps: Vec<TrajectoryStep>,
    current: Option<TrajectoryStep>,
    started_at: i64,
}

#[derive(Clone)]
pub struct TrajectoryRecorder {
    db: Db,
    active: std::sync::Arc<Mutex<HashMap<String, Draft>>>,
}

impl TrajectoryRecorder {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            active: std::sync::Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn start_trajectory(
        &self,
        agent_id: i64,
        scenario_id: Option<&str>,
        window_id: i64,
        metadata: Option<serde_json::Value>,
    ) -> String {
        let trajectory_id = Uuid::new_v4().to_string();
        self.active.lock().insert(
            trajectory_id.clone(),
            Draft {
                agent_id,
                scenario_id: scenario_id.map(|s| s.to_string()),
                window_id,
                metadata,
                steps: Vec::new(),
                current: None,
                started_at: now_ts(),
            },
        );
        trajectory_id
    }

    pub fn start_step(
        &self,
        trajectory_id: &str,
        env_state: serde_json::Value,
    ) -> EngineResult<()> {
        let mut active = self.active.lock();
        let draft = active
            .get_mut(trajectory_id)
            .ok_or_else(|| EngineError::NotFound(format!("trajectory {trajectory_id}")))?;
        if draft.current.is_some() {
            return Err(EngineError::Conflict(format!(
                "trajectory {trajectory_id} already has an open step"
            )));
        }
        draft.current = Some(TrajectoryStep {
            env_state,
            llm_calls: Vec::new(),
            provider_accesses: Vec::new(),
            action: None,
            reward: 0.0,
        });
        Ok(())
    }

    pub fn log_provider_access(
        &self,
        trajectory_id: &str,
        provider_name: &str,
        data: &str,
        purpose: &str,
    ) -> EngineResult<()> {
        let mut active = self.active.lock();
        let draft = active
            .get_mut(trajectory_id)
            .ok_or_else(|| EngineError::NotFound(format!("trajectory {trajectory_id}")))?;
        let step = draft.current.as_mut().ok_or_else(|| {
            EngineError::Conflict(format!("trajectory {trajectory_id} has no open step"))
        })?;
        step.provider_accesses.push(ProviderAccess {
            provider_name: provider_name.to_string(),
            data: data.to_string(),
            purpose: purpose.to_string(),
        });
        Ok(())
    }

    pub async fn log_llm_call(
        &self,
        trajectory_id: &str,
        call: LlmCallRecord,
    ) -> EngineResult<()> {
        let agent_id = {
            let mut active = self.active.lock();
            let draft = active
                .get_mut(trajectory_id)
                .ok_or_else(|| EngineError::NotFound(format!("trajectory {trajectory_id}")))?;
            let step = draft.current.as_mut().ok_or_else(|| {
                EngineError::Conflict(format!("trajectory {trajectory_id} has no open step"))
            })?;
            step.llm_calls.push(call.clone());
            draft.agent_id
        };

        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO llm_call_log \
             (trajectory_id, agent_id, model, system_prompt, user_prompt, response, reasoning, \
              temperature, max_tokens, latency_ms, purpose, action_type, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                trajectory_id,
                agent_id,
                call.model,
                call.system_prompt,
                call.user_prompt,
                call.response,
                call.reasoning,
                call.temperature,
                call.max_tokens as i64,
                call.latency_ms as i64,
                call.purpose,
                call.action_type,
                now_ts(),
            ],
        )?;
        Ok(())
    }

    pub fn complete_step(
        &self,
        trajectory_id: &str,
        action: serde_json::Value,
        reward: f64,
    ) -> EngineResult<()> {
        let mut active = self.active.lock();
        let draft = active
            .get_mut(trajectory_id)
            .ok_or_else(|| EngineError::NotFound(format!("trajectory {trajectory_id}")))?;
        let mut step = draft.current.take().ok_or_else(|| {
            EngineError::Conflict(format!("trajectory {trajectory_id} has no open step"))
        })?;
        step.action = Some(action);
        step.reward = reward;
        draft.steps.push(step);
        Ok(())
    }

    /// Close the episode and persist it. An open step is completed as a
    /// no-action observation so nothing recorded is lost.
    pub async fn end_trajectory(
        &self,
        trajectory_id: &str,
        final_status: &str,
    ) -> EngineResult<()> {
        let draft = {
            let mut active = self.active.lock();
            let mut draft = active
                .remove(trajectory_id)
                .ok_or_else(|| EngineError::NotFound(format!("trajectory {trajectory_id}")))?;
            if let Some(step) = draft.current.take() {
                draft.steps.push(step);
            }
            draft
        };

        let steps_json = serde_json::to_string(&draft.steps)
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        let total_reward: f64 = draft.steps.iter().map(|s| s.reward).sum();
        let metadata_json = draft
            .metadata
            .as_ref()
            .map(|m| m.to_string());

        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO trajectories \
             (id, agent_id, scenario_id, window_id, steps, metadata, episode_length, \
              total_reward, final_status, started_at, ended_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                trajectory_id,
                draft.agent_id,
                draft.scenario_id,
                draft.window_id,
                steps_json,
                metadata_json,
                draft.steps.len() as i64,
                total_reward,
                final_status,
                draft.started_at,
                now_ts(),
            ],
        )?;
        Ok(())
    }

    /// Abort an in-memory episode without persisting (e.g. gate denied
    /// after start).
    pub fn discard(&self, trajectory_id: &str) {
        self.active.lock().remove(trajectory_id);
    }

    pub async fn load_steps(&self, trajectory_id: &str) -> EngineResult<Vec<TrajectoryStep>> {
        let conn = self.db.lock().await;
        let steps_json: String = conn
            .query_row(
                "SELECT steps FROM trajectories WHERE id = ?1",
                params![trajectory_id],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    EngineError::NotFound(format!("trajectory {trajectory_id}"))
                }
                other => other.into(),
            })?;
        serde_json::from_str(&steps_json).map_err(|e| EngineError::Storage(e.to_string()))
    }
}
