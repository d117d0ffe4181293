//! Export stored trajectories into a training-ready stream.
//!
//! Each trajectory becomes one JSONL line: the serialized conversation
//! (system / user / assistant messages reconstructed from the step LLM
//! calls), the episode reward, and metadata. Ordering is by trajectory id
//! so exporting the same window twice produces byte-identical output;
//! `resume_after` restarts a partial export without duplicates.

use rusqlite::params;
use serde::Serialize;

use crate::db::Db;
use crate::error::{EngineError, EngineResult};
use crate::trajectory::recorder::TrajectoryStep;

#[derive(Debug, Serialize)]
pub struct ExportMessage {
    pub role: &'static str,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct ExportRecord {
    pub trajectory_id: String,
    pub messages: Vec<ExportMessage>,
    pub reward: f64,
    pub metadata: ExportMetadata,
}

#[derive(Debug, Serialize)]
pub struct ExportMetadata {
    pub agent_id: i64,
    pub window_id: i64,
    pub episode_length: i64,
    pub final_status: String,
    pub training_ready: bool,
}

#[derive(Clone)]
pub struct TrajectoryExporter {
    db: Db,
}

impl TrajectoryExporter {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Export one window as JSONL lines. Pass the last exported
    /// trajectory id as `resume_after` to continue a partial run.
    pub async fn export_window(
        &self,
        window_id: i64,
        resume_after: Option<&str>,
    ) -> EngineResult<Vec<String>> {
        let rows: Vec<(String, String, i64, f64, String, i64, bool)> = {
            let conn = self.db.lock().await;
            let mut stmt = conn.prepare_cached(
                "SELECT id, steps, agent_id, total_reward, final_status, episode_length, \
                        training_ready \
                 FROM trajectories \
                 WHERE window_id = ?1 AND id > ?2 \
                 ORDER BY id ASC",
            )?;
            let after = resume_after.unwrap_or("");
            let mapped = stmt.query_map(params![window_id, after], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get::<_, i64>(6)? != 0,
                ))
            })?;
            let mut out = Vec::new();
            for r in mapped {
                out.push(r.map_err(EngineError::from)?);
            }
            out
        };

        let mut lines = Vec::with_capacity(rows.len());
        for (id, steps_json, agent_id, reward, final_status, episode_length, training_ready) in
            rows
        {
            let steps: Vec<TrajectoryStep> = serde_json::from_str(&steps_json)
                .map_err(|e| EngineError::Storage(e.to_string()))?;
            let record = ExportRecord {
                messages: conversation_from_steps(&steps),
                trajectory_id: id,
                reward,
                metadata: ExportMetadata {
                    agent_id,
                    window_id,
                    episode_length,
                    final_status,
                    training_ready,
                },
            };
            lines.push(
                serde_json::to_string(&record).map_err(|e| EngineError::Storage(e.to_string()))?,
            );
        }
        Ok(lines)
    }
}

/// Rebuild the conversation: the first LLM call contributes the system
/// prompt; each call contributes its user prompt and assistant response
/// in step order.
fn conversation_from_steps(steps: &[TrajectoryStep]) -> Vec<ExportMessage> {
    let mut messages = Vec::new();
    let mut system_emitted = false;
    for step in steps {
        for call in &step.llm_calls {
            if !system_emitted && !call.system_prompt.is_empty() {
                messages.push(ExportMessage {
                    role: "system",
                    content: call.system_prompt.clone(),
                });
                system_emitted = true;
            }
            messages.push(ExportMessage {
                role: "user",
                content: call.user_prompt.clone(),
            });
            messages.push(ExportMessage {
                role: "assistant",
                content: call.response.clone(),
            });
        }
    }
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trajectory::recorder::{LlmCallRecord, TrajectoryRecorder};
    use serde_json::json;

    async fn seed_trajectory(db: &Db, agent_id: i64, window_id: i64) -> String {
        let recorder = TrajectoryRecorder::new(db.clone());
        let id = recorder.start_trajectory(agent_id, Some("test"), window_id, None);
        recorder.start_step(&id, json!({})).unwrap();
        recorder
            .log_llm_call(
                &id,
                LlmCallRecord {
                    model: "m".to_string(),
                    system_prompt: "you are a trader".to_string(),
                    user_prompt: "market state".to_string(),
                    response: "[]".to_string(),
                    reasoning: None,
                    temperature: 0.2,
                    max_tokens: 256,
                    latency_ms: 5,
                    purpose: "plan".to_string(),
                    action_type: None,
                },
            )
            .await
            .unwrap();
        recorder.complete_step(&id, json!({"type": "hold"}), 0.0).unwrap();
        recorder.end_trajectory(&id, "completed").await.unwrap();
        id
    }

    #[tokio::test]
    async fn export_twice_is_byte_identical() {
        let db = Db::open_in_memory().unwrap();
        seed_trajectory(&db, 1, 4).await;
        seed_trajectory(&db, 2, 4).await;
        seed_trajectory(&db, 3, 5).await; // other window

        let exporter = TrajectoryExporter::new(db);
        let first = exporter.export_window(4, None).await.unwrap();
        let second = exporter.export_window(4, None).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first, second);

        let record: serde_json::Value = serde_json::from_str(&first[0]).unwrap();
        let messages = record["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["role"], "user");
        assert_eq!(messages[2]["role"], "assistant");
    }

    #[tokio::test]
    async fn resume_skips_exported_prefix() {
        let db = Db::open_in_memory().unwrap();
        seed_trajectory(&db, 1, 4).await;
        seed_trajectory(&db, 2, 4).await;

        let exporter = TrajectoryExporter::new(db);
        let all = exporter.export_window(4, None).await.unwrap();
        assert_eq!(all.len(), 2);

        let first_id = serde_json::from_str::<serde_json::Value>(&all[0]).unwrap()
            ["trajectory_id"]
            .as_str()
            .unwrap()
            .to_string();
        let resumed = exporter.export_window(4, Some(&first_id)).await.unwrap();
        assert_eq!(resumed.len(), 1);
        assert_eq!(resumed[0], all[1]);
    }
}
