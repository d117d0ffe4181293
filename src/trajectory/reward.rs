//! Heuristic reward scoring for recorded trajectories.
//!
//! The scalar combines realized trading P&L, goal progress over the
//! episode, correctness of prediction buys that have since resolved, and
//! a small social-engagement term. Scores are written back onto the
//! trajectory row; windows with enough distinct agents are marked
//! training-ready.

use rusqlite::params;
use tracing::info;

use crate::config::EngineConfig;
use crate::db::Db;
use crate::error::{EngineError, EngineResult};
use crate::models::Outcome;
use crate::store::SocialStore;
use crate::trajectory::recorder::TrajectoryStep;

const PNL_WEIGHT: f64 = 1.0;
const GOAL_WEIGHT: f64 = 0.5;
const PREDICTION_WEIGHT: f64 = 0.3;
const ENGAGEMENT_WEIGHT: f64 = 0.05;
/// P&L is squashed so one lucky trade cannot dominate the dataset.
const PNL_SCALE: f64 = 100.0;

#[derive(Clone)]
pub struct RewardScorer {
    db: Db,
    social: SocialStore,
    min_agents_per_window: usize,
}

impl RewardScorer {
    pub fn new(db: Db, cfg: &EngineConfig) -> Self {
        Self {
            social: SocialStore::new(db.clone()),
            db,
            min_agents_per_window: cfg.trajectory_min_agents_per_window,
        }
    }

    /// Score one stored trajectory and write the result back. Returns the
    /// score.
    pub async fn score_trajectory(&self, trajectory_id: &str) -> EngineResult<f64> {
        let (agent_id, steps_json, started_at): (i64, String, i64) = {
            let conn = self.db.lock().await;
            conn.query_row(
                "SELECT agent_id, steps, started_at FROM trajectories WHERE id = ?1",
                params![trajectory_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    EngineError::NotFound(format!("trajectory {trajectory_id}"))
                }
                other => other.into(),
            })?
        };
        let steps: Vec<TrajectoryStep> =
            serde_json::from_str(&steps_json).map_err(|e| EngineError::Storage(e.to_string()))?;

        let pnl: f64 = steps.iter().map(step_realized_pnl).sum();
        let goal_delta = self.goal_progress_delta(&steps);
        let prediction = self.prediction_correctness(agent_id, &steps).await?;
        let engagement = self
            .social
            .engagement_count(agent_id, started_at)
            .await?
            .min(10) as f64
            / 10.0;

        let score = PNL_WEIGHT * (pnl / PNL_SCALE).tanh()
            + GOAL_WEIGHT * goal_delta
            + PREDICTION_WEIGHT * prediction
            + ENGAGEMENT_WEIGHT * engagement;

        {
            let conn = self.db.lock().await;
            conn.execute(
                "UPDATE trajectories SET total_reward = ?1 WHERE id = ?2",
                params![score, trajectory_id],
            )?;
        }
        Ok(score)
    }

    /// Sum of goal-impact annotations on executed actions, bounded like
    /// goal progress itself.
    fn goal_progress_delta(&self, steps: &[TrajectoryStep]) -> f64 {
        steps
            .iter()
            .filter_map(|s| s.action.as_ref())
            .filter_map(|a| a.get("goal_impact").and_then(|v| v.as_f64()))
            .sum::<f64>()
            .clamp(0.0, 1.0)
    }

    /// Fraction of the episode's prediction buys that landed on the
    /// resolved outcome. Unresolved markets are skipped; no buys yields a
    /// neutral zero.
    async fn prediction_correctness(
        &self,
        _agent_id: i64,
        steps: &[TrajectoryStep],
    ) -> EngineResult<f64> {
        let mut correct = 0usize;
        let mut graded = 0usize;

        let conn = self.db.lock().await;
        for step in steps {
            let Some(action) = step.action.as_ref() else {
                continue;
            };
            if action.get("type").and_then(|v| v.as_str()) != Some("buy_shares") {
                continue;
            }
            let (Some(market_id), Some(side)) = (
                action.get("market_id").and_then(|v| v.as_i64()),
                action.get("side").and_then(|v| v.as_str()),
            ) else {
                continue;
            };

            let row: Option<(bool, String)> = conn
                .query_row(
                    "SELECT resolved, outcome FROM prediction_markets WHERE id = ?1",
                    params![market_id],
                    |r| Ok((r.get::<_, i64>(0)? != 0, r.get(1)?)),
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(EngineError::from(other)),
                })?;
            let Some((resolved, outcome_str)) = row else {
                continue;
            };
            if !resolved {
                continue;
            }
            graded += 1;
            let outcome = Outcome::parse(&outcome_str).unwrap_or(Outcome::Unresolved);
            let won = match outcome {
                Outcome::Yes => side == "yes",
                Outcome::No => side == "no",
                Outcome::Unresolved => false,
            };
            if won {
                correct += 1;
            }
        }

        Ok(if graded == 0 {
            0.0
        } else {
            correct as f64 / graded as f64
        })
    }

    /// Score every trajectory in the window and mark the window
    /// training-ready when it holds enough distinct agents.
    pub async fn score_window(&self, window_id: i64) -> EngineResult<(usize, bool)> {
        let ids: Vec<String> = {
            let conn = self.db.lock().await;
            let mut stmt = conn.prepare_cached(
                "SELECT id FROM trajectories WHERE window_id = ?1 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(params![window_id], |row| row.get(0))?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r.map_err(EngineError::from)?);
            }
            out
        };

        for id in &ids {
            self.score_trajectory(id).await?;
        }

        let distinct_agents: usize = {
            let conn = self.db.lock().await;
            conn.query_row(
                "SELECT COUNT(DISTINCT agent_id) FROM trajectories WHERE window_id = ?1",
                params![window_id],
                |row| row.get::<_, i64>(0),
            )? as usize
        };

        let ready = distinct_agents >= self.min_agents_per_window;
        if ready {
            let conn = self.db.lock().await;
            conn.execute(
                "UPDATE trajectories SET training_ready = 1 WHERE window_id = ?1",
                params![window_id],
            )?;
            info!(window_id, trajectories = ids.len(), "window training-ready");
        }
        Ok((ids.len(), ready))
    }
}

fn step_realized_pnl(step: &TrajectoryStep) -> f64 {
    step.action
        .as_ref()
        .and_then(|a| a.get("realized_pnl"))
        .and_then(|v| v.as_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trajectory::recorder::TrajectoryRecorder;
    use serde_json::json;

    async fn store_episode(
        db: &Db,
        agent_id: i64,
        window_id: i64,
        actions: Vec<serde_json::Value>,
    ) -> String {
        let recorder = TrajectoryRecorder::new(db.clone());
        let id = recorder.start_trajectory(agent_id, Some("test"), window_id, None);
        for action in actions {
            recorder.start_step(&id, json!({})).unwrap();
            recorder.complete_step(&id, action, 0.0).unwrap();
        }
        recorder.end_trajectory(&id, "completed").await.unwrap();
        id
    }

    #[tokio::test]
    async fn pnl_drives_score() {
        let db = Db::open_in_memory().unwrap();
        let cfg = EngineConfig::default();
        let scorer = RewardScorer::new(db.clone(), &cfg);

        let winner = store_episode(
            &db,
            1,
            0,
            vec![json!({"type": "close_perp", "realized_pnl": 80.0})],
        )
        .await;
        let loser = store_episode(
            &db,
            2,
            0,
            vec![json!({"type": "close_perp", "realized_pnl": -80.0})],
        )
        .await;

        let w = scorer.score_trajectory(&winner).await.unwrap();
        let l = scorer.score_trajectory(&loser).await.unwrap();
        assert!(w > 0.0);
        assert!(l < 0.0);
        assert!((w + l).abs() < 1e-9);
    }

    #[tokio::test]
    async fn prediction_correctness_uses_resolved_outcome() {
        let db = Db::open_in_memory().unwrap();
        {
            let conn = db.lock().await;
            conn.execute(
                "INSERT INTO prediction_markets \
                 (id, prompt, category, resolution_time, resolved, outcome, b, created_at) \
                 VALUES (5, 'q', 'general', 0, 1, 'yes', 100.0, 0)",
                [],
            )
            .unwrap();
        }
        let cfg = EngineConfig::default();
        let scorer = RewardScorer::new(db.clone(), &cfg);

        let right = store_episode(
            &db,
            1,
            0,
            vec![json!({"type": "buy_shares", "market_id": 5, "side": "yes"})],
        )
        .await;
        let wrong = store_episode(
            &db,
            2,
            0,
            vec![json!({"type": "buy_shares", "market_id": 5, "side": "no"})],
        )
        .await;

        assert!(
            scorer.score_trajectory(&right).await.unwrap()
                > scorer.score_trajectory(&wrong).await.unwrap()
        );
    }

    #[tokio::test]
    async fn window_marks_training_ready_at_threshold() {
        let db = Db::open_in_memory().unwrap();
        let cfg = EngineConfig::default(); // min 3 agents
        let scorer = RewardScorer::new(db.clone(), &cfg);

        store_episode(&db, 1, 9, vec![]).await;
        store_episode(&db, 2, 9, vec![]).await;
        let (count, ready) = scorer.score_window(9).await.unwrap();
        assert_eq!(count, 2);
        assert!(!ready);

        store_episode(&db, 3, 9, vec![]).await;
        let (_, ready) = scorer.score_window(9).await.unwrap();
        assert!(ready);

        let flagged: i64 = {
            let conn = db.lock().await;
            conn.query_row(
                "SELECT COUNT(*) FROM trajectories WHERE window_id = 9 AND training_ready = 1",
                [],
                |r| r.get(0),
            )
            .unwrap()
        };
        assert_eq!(flagged, 3);
    }
}
