//! Autonomous coordinator: the per-agent tick.
//!
//! Gate, bill once, gather provider context (each provider individually
//! timed out), plan with a single LLM call, execute in priority order,
//! advance goals, and record a trajectory step per action. Agents tick
//! independently; the shared LLM semaphore is the only coupling, and a
//! saturated semaphore defers the agent to the next cycle instead of
//! queueing.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde_json::json;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::agents::actions::{parse_plan, ActionExecutor, AgentAction, PlannedAction};
use crate::agents::goals::GoalStore;
use crate::agents::runtime::RuntimeManager;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::ledger::{Ledger, PointsAccount};
use crate::llm::{LlmProvider, LlmRequest};
use crate::models::{ModelTier, UserRecord};
use crate::store::{HistoryStore, UserStore};
use crate::trajectory::recorder::{LlmCallRecord, TrajectoryRecorder};

const DEFAULT_AGENT_SYSTEM_PROMPT: &str = "You are an autonomous participant in a simulated \
economy. You can trade prediction markets and perpetual futures, post to the feed, comment, \
and message other participants. Plan your next actions from the context you are given. \
Reply with JSON only.";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActionCounts {
    pub trades: u32,
    pub posts: u32,
    pub comments: u32,
    pub messages: u32,
    pub group_messages: u32,
    pub engagements: u32,
}

impl ActionCounts {
    fn record(&mut self, action: &AgentAction) {
        match action {
            AgentAction::BuyShares { .. }
            | AgentAction::SellShares { .. }
            | AgentAction::OpenPerp { .. }
            | AgentAction::ClosePerp { .. } => self.trades += 1,
            AgentAction::Post { .. } => self.posts += 1,
            AgentAction::Comment { .. } => self.comments += 1,
            AgentAction::Message { .. } => self.messages += 1,
            AgentAction::GroupMessage { .. } => self.group_messages += 1,
            AgentAction::UpdateGoal { .. } => self.engagements += 1,
        }
    }

    pub fn total(&self) -> u32 {
        self.trades + self.posts + self.comments + self.messages + self.group_messages
            + self.engagements
    }
}

#[derive(Debug, Clone)]
pub struct TickResult {
    pub success: bool,
    pub method: &'static str,
    pub actions_executed: ActionCounts,
    pub duration_ms: u64,
}

pub struct AutonomousCoordinator {
    users: UserStore,
    ledger: Ledger,
    history: HistoryStore,
    runtimes: Arc<RuntimeManager>,
    actions: ActionExecutor,
    goals: GoalStore,
    recorder: TrajectoryRecorder,
    llm: Arc<dyn LlmProvider>,
    llm_semaphore: Arc<Semaphore>,
    cfg: EngineConfig,
}

impl AutonomousCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        users: UserStore,
        ledger: Ledger,
        history: HistoryStore,
        runtimes: Arc<RuntimeManager>,
        actions: ActionExecutor,
        goals: GoalStore,
        recorder: TrajectoryRecorder,
        llm: Arc<dyn LlmProvider>,
        llm_semaphore: Arc<Semaphore>,
        cfg: EngineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            users,
            ledger,
            history,
            runtimes,
            actions,
            goals,
            recorder,
            llm,
            llm_semaphore,
            cfg,
        })
    }

    fn tick_cost(&self, tier: ModelTier) -> i64 {
        match tier {
            ModelTier::Free => self.cfg.agent_tick_cost_free,
            ModelTier::Pro => self.cfg.agent_tick_cost_pro,
        }
    }

    /// Tick one agent. Gate failures are typed errors; a deferred tick
    /// (LLM semaphore saturated) is a non-success result, not an error.
    pub async fn execute_autonomous_tick(&self, agent_id: i64) -> EngineResult<TickResult> {
        let started = Instant::now();
        let agent = self.users.get(agent_id).await?;

        // Gate.
        if !agent.is_agent {
            return Err(EngineError::Unauthorized(format!(
                "user {agent_id} is not an agent"
            )));
        }
        if agent.is_banned {
            return Err(EngineError::UserBanned(agent_id));
        }
        if !agent.is_active {
            return Err(EngineError::Unauthorized(format!(
                "agent {agent_id} is inactive"
            )));
        }
        let cost = self.tick_cost(agent.model_tier);
        if agent.agent_points < cost {
            return Err(EngineError::InsufficientFunds {
                needed: cost as f64,
                available: agent.agent_points as f64,
            });
        }

        // Backpressure: defer rather than queue when the fleet has the
        // LLM budget saturated.
        let Ok(permit) = self.llm_semaphore.clone().try_acquire_owned() else {
            debug!(agent_id, "llm semaphore saturated, deferring agent tick");
            return Ok(TickResult {
                success: false,
                method: "deferred",
                actions_executed: ActionCounts::default(),
                duration_ms: started.elapsed().as_millis() as u64,
            });
        };

        // Bill once, up front. Failures below do not refund and do not
        // bill again.
        self.ledger
            .award_points(agent_id, PointsAccount::Agent, -cost)
            .await?;

        let window_id = self
            .history
            .latest_tick_summary()
            .await?
            .map(|s| s.tick_no)
            .unwrap_or(0);
        let trajectory_id = self.recorder.start_trajectory(
            agent_id,
            Some("autonomous"),
            window_id,
            Some(json!({ "model_tier": agent.model_tier.as_str() })),
        );

        let balance = self.ledger.balance(agent_id).await.unwrap_or(0.0);
        self.recorder.start_step(
            &trajectory_id,
            json!({
                "balance": balance,
                "agent_points": agent.agent_points - cost,
                "window_id": window_id,
            }),
        )?;

        // Context gather: every provider gets its own timeout; a failed
        // provider contributes an empty section.
        let provider_timeout = Duration::from_millis(self.cfg.provider_timeout_ms);
        let runtime = self.runtimes.get_or_create(agent_id);
        let mut context_sections = Vec::new();
        for provider in &runtime.providers {
            let content =
                match tokio::time::timeout(provider_timeout, provider.provide(agent_id)).await {
                    Ok(Ok(content)) => content,
                    Ok(Err(e)) => {
                        warn!(agent_id, provider = provider.name(), error = %e, "provider failed");
                        String::new()
                    }
                    Err(_) => {
                        warn!(agent_id, provider = provider.name(), "provider timed out");
                        String::new()
                    }
                };
            self.recorder.log_provider_access(
                &trajectory_id,
                provider.name(),
                &content,
                "planning context",
            )?;
            if !content.is_empty() {
                context_sections.push(format!("## {}\n{}", provider.name(), content));
            }
        }

        // Plan.
        let goals = self.goals.list_active(agent_id).await?;
        let plan_request = LlmRequest {
            system_prompt: agent
                .system_prompt
                .clone()
                .filter(|p| !p.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_AGENT_SYSTEM_PROMPT.to_string()),
            user_prompt: render_plan_prompt(&agent, &goals, &context_sections),
            model: self.cfg.llm_model.clone(),
            temperature: self.cfg.llm_temperature,
            max_tokens: self.cfg.llm_max_tokens,
            timeout: Duration::from_millis(self.cfg.llm_timeout_ms),
        };

        let plan_result = tokio::time::timeout(
            Duration::from_millis(self.cfg.llm_timeout_ms),
            self.llm.generate_json(&plan_request),
        )
        .await;
        drop(permit);

        let planned: Vec<PlannedAction> = match plan_result {
            Ok(Ok(resp)) => {
                self.recorder
                    .log_llm_call(
                        &trajectory_id,
                        LlmCallRecord {
                            model: resp.model.clone(),
                            system_prompt: plan_request.system_prompt.clone(),
                            user_prompt: plan_request.user_prompt.clone(),
                            response: resp.raw_content.clone(),
                            reasoning: None,
                            temperature: plan_request.temperature,
                            max_tokens: plan_request.max_tokens,
                            latency_ms: resp.latency_ms,
                            purpose: "plan".to_string(),
                            action_type: None,
                        },
                    )
                    .await?;
                parse_plan(&resp.value, &agent)
            }
            Ok(Err(e)) => {
                warn!(agent_id, error = %e, "plan call failed");
                self.recorder
                    .complete_step(&trajectory_id, json!({"type": "hold"}), 0.0)?;
                self.recorder
                    .end_trajectory(&trajectory_id, "plan_failed")
                    .await?;
                return Ok(TickResult {
                    success: false,
                    method: "plan_failed",
                    actions_executed: ActionCounts::default(),
                    duration_ms: started.elapsed().as_millis() as u64,
                });
            }
            Err(_) => {
                warn!(agent_id, "plan call timed out");
                self.recorder
                    .complete_step(&trajectory_id, json!({"type": "hold"}), 0.0)?;
                self.recorder
                    .end_trajectory(&trajectory_id, "plan_timeout")
                    .await?;
                return Ok(TickResult {
                    success: false,
                    method: "plan_timeout",
                    actions_executed: ActionCounts::default(),
                    duration_ms: started.elapsed().as_millis() as u64,
                });
            }
        };

        // Execute in priority order; failures are recorded and the rest
        // of the plan continues.
        let mut counts = ActionCounts::default();
        for (i, planned_action) in planned.iter().enumerate() {
            if i > 0 {
                self.recorder
                    .start_step(&trajectory_id, json!({"action_index": i}))?;
            }

            let intent_id = format!("agent:{agent_id}:{trajectory_id}:{i}");
            let outcome = self
                .actions
                .perform(agent_id, &planned_action.action, &intent_id)
                .await?;

            if outcome.success {
                counts.record(&planned_action.action);
                if let Some(goal_id) = planned_action.goal_id {
                    if planned_action.goal_impact > 0.0 {
                        match self
                            .goals
                            .advance_progress(goal_id, planned_action.goal_impact)
                            .await
                        {
                            Ok(goal) => {
                                if goal.status == crate::models::GoalStatus::Completed {
                                    info!(agent_id, goal_id, "goal completed");
                                }
                            }
                            Err(EngineError::NotFound(_)) => {}
                            Err(e) => return Err(e),
                        }
                    }
                }
            }

            self.recorder.complete_step(
                &trajectory_id,
                action_step_json(planned_action, &outcome),
                outcome.realized_pnl,
            )?;
        }

        self.recorder
            .end_trajectory(&trajectory_id, "completed")
            .await?;

        let result = TickResult {
            success: true,
            method: "llm_plan",
            actions_executed: counts,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        debug!(
            agent_id,
            actions = result.actions_executed.total(),
            duration_ms = result.duration_ms,
            "agent tick complete"
        );
        Ok(result)
    }

    /// Tick every eligible agent concurrently. Gate denials and per-agent
    /// failures are logged, never propagated.
    pub async fn run_all(&self) -> EngineResult<Vec<(i64, TickResult)>> {
        let agents = self.users.list_active_agents().await?;
        let futures = agents.iter().map(|agent| async move {
            match self.execute_autonomous_tick(agent.id).await {
                Ok(result) => Some((agent.id, result)),
                Err(e) => {
                    debug!(agent_id = agent.id, error = %e, "agent tick skipped");
                    None
                }
            }
        });
        Ok(join_all(futures).await.into_iter().flatten().collect())
    }
}

fn render_plan_prompt(
    agent: &UserRecord,
    goals: &[crate::models::Goal],
    context_sections: &[String],
) -> String {
    let mut out = String::new();
    for section in context_sections {
        out.push_str(section);
        out.push_str("\n\n");
    }

    if !goals.is_empty() {
        out.push_str("## Active goals\n");
        for g in goals {
            out.push_str(&format!(
                "- goal {} (priority {}): {} — target {} {:.2}, progress {:.0}%\n",
                g.id,
                g.priority,
                g.name,
                g.target.metric.as_str(),
                g.target.value,
                g.progress * 100.0
            ));
        }
        out.push('\n');
    }

    let capabilities: Vec<&str> = agent.capabilities.iter().map(|c| c.as_str()).collect();
    out.push_str(agent.planning_horizon.guidance());
    out.push('\n');
    out.push_str(&format!(
        "Plan up to {} actions. Your enabled capabilities: [{}].\n\
         Reply with a JSON array; each entry has \"type\" (one of buy_shares, sell_shares, \
         open_perp, close_perp, post, comment, message, group_message, update_goal), its \
         parameters, optional \"goal_id\" and \"goal_impact\" (0-1) for the goal it serves, \
         and \"priority\" (1-10). Reply with [] to do nothing.\n",
        agent.max_actions_per_tick,
        capabilities.join(", ")
    ));
    out
}

fn action_step_json(
    planned: &PlannedAction,
    outcome: &crate::agents::actions::ActionOutcome,
) -> serde_json::Value {
    let mut value = match &planned.action {
        AgentAction::BuyShares {
            market_id,
            side,
            cash,
        } => json!({"type": "buy_shares", "market_id": market_id, "side": side.as_str(), "cash": cash}),
        AgentAction::SellShares {
            market_id,
            side,
            shares,
        } => json!({"type": "sell_shares", "market_id": market_id, "side": side.as_str(), "shares": shares}),
        AgentAction::OpenPerp {
            ticker,
            side,
            size,
            leverage,
        } => json!({"type": "open_perp", "ticker": ticker, "side": side.as_str(), "size": size, "leverage": leverage}),
        AgentAction::ClosePerp { ticker } => json!({"type": "close_perp", "ticker": ticker}),
        AgentAction::Post { body } => json!({"type": "post", "body": body}),
        AgentAction::Comment { post_id, body } => {
            json!({"type": "comment", "post_id": post_id, "body": body})
        }
        AgentAction::Message {
            recipient_id,
            body,
        } => json!({"type": "message", "recipient_id": recipient_id, "body": body}),
        AgentAction::GroupMessage { body } => json!({"type": "group_message", "body": body}),
        AgentAction::UpdateGoal { goal_id, progress } => {
            json!({"type": "update_goal", "goal_id": goal_id, "progress": progress})
        }
    };
    if let Some(obj) = value.as_object_mut() {
        obj.insert("success".to_string(), json!(outcome.success));
        obj.insert("detail".to_string(), json!(outcome.detail));
        obj.insert("realized_pnl".to_string(), json!(outcome.realized_pnl));
        if let Some(goal_id) = planned.goal_id {
            obj.insert("goal_id".to_string(), json!(goal_id));
            obj.insert("goal_impact".to_string(), json!(planned.goal_impact));
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::providers::{HeadlinesProvider, WalletProvider};
    use crate::db::Db;
    use crate::executor::TradeExecutor;
    use crate::llm::mock::MockLlm;
    use crate::models::{AgentCapability, BalanceTxKind, GoalMetric, GoalTarget, RiskTolerance};
    use crate::store::{
        PerpPositionStore, PredictionMarketStore, SocialStore, UserStore,
    };
    use crate::store::users::NewAgent;

    struct Fixture {
        db: Db,
        coordinator: Arc<AutonomousCoordinator>,
        llm: Arc<MockLlm>,
        users: UserStore,
        ledger: Ledger,
        goals: GoalStore,
        agent: i64,
    }

    async fn fixture() -> Fixture {
        let db = Db::open_in_memory().unwrap();
        let cfg = EngineConfig::default();
        let users = UserStore::new(db.clone());
        let ledger = Ledger::new(db.clone());
        let social = SocialStore::new(db.clone());
        let goals = GoalStore::new(db.clone());

        let manager = users.create_human("manager").await.unwrap();
        let agent = users
            .create_agent(&NewAgent {
                handle: "auto-1".to_string(),
                manager_id: manager,
                system_prompt: "You are a test agent.".to_string(),
                capabilities: vec![
                    AgentCapability::Trading,
                    AgentCapability::Posting,
                    AgentCapability::GroupChat,
                ],
                max_actions_per_tick: 4,
                risk_tolerance: RiskTolerance::Medium,
                planning_horizon: crate::models::PlanningHorizon::Medium,
                model_tier: crate::models::ModelTier::Free,
                starting_points: 10,
            })
            .await
            .unwrap();
        ledger
            .credit(agent, 500.0, BalanceTxKind::Deposit, None)
            .await
            .unwrap();

        let runtimes = RuntimeManager::new(
            vec![
                Arc::new(WalletProvider {
                    ledger: ledger.clone(),
                    perps: PerpPositionStore::new(db.clone()),
                    markets: PredictionMarketStore::new(db.clone()),
                }),
                Arc::new(HeadlinesProvider {
                    social: social.clone(),
                }),
            ],
            cfg.runtime_cache_cap,
        );

        let llm = Arc::new(MockLlm::new());
        let actions = ActionExecutor::new(
            TradeExecutor::new(db.clone(), &cfg),
            social,
            goals.clone(),
        );
        let coordinator = AutonomousCoordinator::new(
            users.clone(),
            ledger.clone(),
            HistoryStore::new(db.clone()),
            runtimes,
            actions,
            goals.clone(),
            TrajectoryRecorder::new(db.clone()),
            llm.clone(),
            Arc::new(Semaphore::new(cfg.max_concurrent_llm)),
            cfg,
        );

        Fixture {
            db,
            coordinator,
            llm,
            users,
            ledger,
            goals,
            agent,
        }
    }

    #[tokio::test]
    async fn successful_tick_bills_posts_and_records() {
        let f = fixture().await;
        f.llm.push_value(serde_json::json!([
            {"type": "post", "body": "markets are interesting", "priority": 8},
            {"type": "group_message", "body": "anyone long ACME?", "priority": 3},
        ]));

        let result = f
            .coordinator
            .execute_autonomous_tick(f.agent)
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.method, "llm_plan");
        assert_eq!(result.actions_executed.posts, 1);
        assert_eq!(result.actions_executed.group_messages, 1);

        // Billed exactly once at the free-tier cost.
        let agent = f.users.get(f.agent).await.unwrap();
        assert_eq!(agent.agent_points, 9);

        // One persisted trajectory with two steps.
        let (count, steps): (i64, i64) = {
            let conn = f.db.lock().await;
            conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(episode_length), 0) FROM trajectories",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap()
        };
        assert_eq!(count, 1);
        assert_eq!(steps, 2);
    }

    #[tokio::test]
    async fn gate_denies_without_points() {
        let f = fixture().await;
        f.ledger
            .award_points(f.agent, PointsAccount::Agent, -10)
            .await
            .unwrap();
        let err = f
            .coordinator
            .execute_autonomous_tick(f.agent)
            .await
            .unwrap_err();
        assert_eq!(err.kind_code(), "insufficient_funds");
    }

    #[tokio::test]
    async fn gate_denies_banned_agent() {
        let f = fixture().await;
        f.users.set_banned(f.agent, true).await.unwrap();
        let err = f
            .coordinator
            .execute_autonomous_tick(f.agent)
            .await
            .unwrap_err();
        assert_eq!(err.kind_code(), "user_banned");
    }

    #[tokio::test]
    async fn failed_action_does_not_stop_the_plan() {
        let f = fixture().await;
        f.llm.push_value(serde_json::json!([
            // Fails: no such market.
            {"type": "buy_shares", "market_id": 999, "side": "yes", "cash": 10.0, "priority": 9},
            {"type": "post", "body": "still standing", "priority": 1},
        ]));

        let result = f
            .coordinator
            .execute_autonomous_tick(f.agent)
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.actions_executed.trades, 0);
        assert_eq!(result.actions_executed.posts, 1);
    }

    #[tokio::test]
    async fn goal_progress_advances_on_success() {
        let f = fixture().await;
        let goal = f
            .goals
            .create(
                f.agent,
                "build presence",
                &GoalTarget {
                    metric: GoalMetric::PostCount,
                    value: 10.0,
                    unit: "posts".to_string(),
                },
                6,
            )
            .await
            .unwrap();

        f.llm.push_value(serde_json::json!([
            {"type": "post", "body": "gm", "goal_id": goal.id, "goal_impact": 0.4},
        ]));
        f.coordinator
            .execute_autonomous_tick(f.agent)
            .await
            .unwrap();

        let g = f.goals.get(goal.id).await.unwrap();
        assert!((g.progress - 0.4).abs() < 1e-9);

        f.llm.push_value(serde_json::json!([
            {"type": "post", "body": "gm again", "goal_id": goal.id, "goal_impact": 0.7},
        ]));
        f.coordinator
            .execute_autonomous_tick(f.agent)
            .await
            .unwrap();

        let g = f.goals.get(goal.id).await.unwrap();
        assert_eq!(g.status, crate::models::GoalStatus::Completed);
        assert_eq!(g.progress, 1.0);
        assert!(g.completed_at.is_some());
    }

    #[tokio::test]
    async fn plan_failure_still_persists_trajectory_without_refund() {
        let f = fixture().await;
        f.llm
            .push(crate::llm::mock::MockReply::Error("down".to_string()));

        let result = f
            .coordinator
            .execute_autonomous_tick(f.agent)
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.method, "plan_failed");

        let agent = f.users.get(f.agent).await.unwrap();
        assert_eq!(agent.agent_points, 9); // billed, not refunded

        let status: String = {
            let conn = f.db.lock().await;
            conn.query_row("SELECT final_status FROM trajectories", [], |r| r.get(0))
                .unwrap()
        };
        assert_eq!(status, "plan_failed");
    }
}
