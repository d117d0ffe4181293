//! Agent action registry and dispatch.
//!
//! The planner emits actions by name; `ACTION_REGISTRY` declares the
//! closed set (name, required capability) used to validate plans, and
//! `ActionExecutor::perform` is the single dispatch point for effects.
//! No reflection: unknown names are dropped at parse time.

use serde_json::Value;

use crate::agents::goals::GoalStore;
use crate::error::{EngineError, EngineResult};
use crate::executor::{Actor, IntentRecord, TradeExecutor, TradeIntent};
use crate::models::{AgentCapability, PerpSide, PredictionSide, RiskTolerance, UserRecord};
use crate::store::SocialStore;

#[derive(Debug, Clone)]
pub enum AgentAction {
    BuyShares {
        market_id: i64,
        side: PredictionSide,
        cash: f64,
    },
    SellShares {
        market_id: i64,
        side: PredictionSide,
        shares: f64,
    },
    OpenPerp {
        ticker: String,
        side: PerpSide,
        size: f64,
        leverage: f64,
    },
    ClosePerp {
        ticker: String,
    },
    Post {
        body: String,
    },
    Comment {
        post_id: i64,
        body: String,
    },
    Message {
        recipient_id: i64,
        body: String,
    },
    GroupMessage {
        body: String,
    },
    UpdateGoal {
        goal_id: i64,
        progress: f64,
    },
}

/// The closed action set: `(name, required capability)`.
pub const ACTION_REGISTRY: &[(&str, Option<AgentCapability>)] = &[
    ("buy_shares", Some(AgentCapability::Trading)),
    ("sell_shares", Some(AgentCapability::Trading)),
    ("open_perp", Some(AgentCapability::Trading)),
    ("close_perp", Some(AgentCapability::Trading)),
    ("post", Some(AgentCapability::Posting)),
    ("comment", Some(AgentCapability::Commenting)),
    ("message", Some(AgentCapability::Dm)),
    ("group_message", Some(AgentCapability::GroupChat)),
    ("update_goal", None),
];

impl AgentAction {
    pub fn kind(&self) -> &'static str {
        match self {
            AgentAction::BuyShares { .. } => "buy_shares",
            AgentAction::SellShares { .. } => "sell_shares",
            AgentAction::OpenPerp { .. } => "open_perp",
            AgentAction::ClosePerp { .. } => "close_perp",
            AgentAction::Post { .. } => "post",
            AgentAction::Comment { .. } => "comment",
            AgentAction::Message { .. } => "message",
            AgentAction::GroupMessage { .. } => "group_message",
            AgentAction::UpdateGoal { .. } => "update_goal",
        }
    }

    pub fn required_capability(&self) -> Option<AgentCapability> {
        ACTION_REGISTRY
            .iter()
            .find(|(name, _)| *name == self.kind())
            .and_then(|(_, cap)| *cap)
    }

    fn parse(obj: &serde_json::Map<String, Value>) -> Option<Self> {
        let action_type = obj.get("type")?.as_str()?;
        match action_type {
            "buy_shares" => Some(AgentAction::BuyShares {
                market_id: obj.get("market_id")?.as_i64()?,
                side: PredictionSide::parse(obj.get("side")?.as_str()?)?,
                cash: positive_f64(obj.get("cash")?)?,
            }),
            "sell_shares" => Some(AgentAction::SellShares {
                market_id: obj.get("market_id")?.as_i64()?,
                side: PredictionSide::parse(obj.get("side")?.as_str()?)?,
                shares: positive_f64(obj.get("shares")?)?,
            }),
            "open_perp" => Some(AgentAction::OpenPerp {
                ticker: obj.get("ticker")?.as_str()?.trim().to_uppercase(),
                side: PerpSide::parse(obj.get("side")?.as_str()?)?,
                size: positive_f64(obj.get("size")?)?,
                leverage: obj
                    .get("leverage")
                    .and_then(|v| v.as_f64())
                    .filter(|l| l.is_finite() && *l >= 1.0)
                    .unwrap_or(1.0),
            }),
            "close_perp" => Some(AgentAction::ClosePerp {
                ticker: obj.get("ticker")?.as_str()?.trim().to_uppercase(),
            }),
            "post" => Some(AgentAction::Post {
                body: non_empty(obj.get("body")?)?,
            }),
            "comment" => Some(AgentAction::Comment {
                post_id: obj.get("post_id")?.as_i64()?,
                body: non_empty(obj.get("body")?)?,
            }),
            "message" => Some(AgentAction::Message {
                recipient_id: obj.get("recipient_id")?.as_i64()?,
                body: non_empty(obj.get("body")?)?,
            }),
            "group_message" => Some(AgentAction::GroupMessage {
                body: non_empty(obj.get("body")?)?,
            }),
            "update_goal" => Some(AgentAction::UpdateGoal {
                goal_id: obj.get("goal_id")?.as_i64()?,
                progress: obj
                    .get("progress")?
                    .as_f64()
                    .filter(|p| p.is_finite())?
                    .clamp(-1.0, 1.0),
            }),
            _ => None,
        }
    }
}

fn positive_f64(value: &Value) -> Option<f64> {
    value.as_f64().filter(|v| v.is_finite() && *v > 0.0)
}

fn non_empty(value: &Value) -> Option<String> {
    let s = value.as_str()?.trim();
    (!s.is_empty()).then(|| s.chars().take(2000).collect())
}

/// One entry of a validated plan.
#[derive(Debug, Clone)]
pub struct PlannedAction {
    pub action: AgentAction,
    pub goal_id: Option<i64>,
    /// Expected contribution to the referenced goal's progress.
    pub goal_impact: f64,
    pub priority: u8,
}

/// Validate a raw plan against the agent's capability set, risk
/// tolerance, and action ceiling. Order: priority descending, plan order
/// as tiebreaker.
pub fn parse_plan(value: &Value, agent: &UserRecord) -> Vec<PlannedAction> {
    let Some(entries) = value.as_array() else {
        return Vec::new();
    };

    let mut plan = Vec::new();
    for entry in entries {
        let Some(obj) = entry.as_object() else {
            continue;
        };
        let Some(mut action) = AgentAction::parse(obj) else {
            continue;
        };
        if let Some(cap) = action.required_capability() {
            if !agent.has_capability(cap) {
                continue;
            }
        }
        apply_risk_tolerance(&mut action, agent.risk_tolerance);

        let goal_id = obj.get("goal_id").and_then(|v| v.as_i64());
        let goal_impact = obj
            .get("goal_impact")
            .and_then(|v| v.as_f64())
            .filter(|v| v.is_finite())
            .map(|v| v.clamp(0.0, 1.0))
            .unwrap_or(0.0);
        let priority = obj
            .get("priority")
            .and_then(|v| v.as_i64())
            .map(|p| p.clamp(1, 10) as u8)
            .unwrap_or(5);

        plan.push(PlannedAction {
            action,
            goal_id,
            goal_impact,
            priority,
        });
    }

    plan.sort_by(|a, b| b.priority.cmp(&a.priority));
    plan.truncate(agent.max_actions_per_tick as usize);
    plan
}

/// Downgrade rather than drop: a plan exceeding the agent's risk
/// tolerance is clamped to the permitted leverage.
fn apply_risk_tolerance(action: &mut AgentAction, tolerance: RiskTolerance) {
    if let AgentAction::OpenPerp { leverage, .. } = action {
        let cap = tolerance.max_leverage();
        if *leverage > cap {
            *leverage = cap;
        }
    }
}

#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub success: bool,
    pub detail: String,
    pub realized_pnl: f64,
}

#[derive(Clone)]
pub struct ActionExecutor {
    trade_executor: TradeExecutor,
    social: SocialStore,
    goals: GoalStore,
}

impl ActionExecutor {
    pub fn new(trade_executor: TradeExecutor, social: SocialStore, goals: GoalStore) -> Self {
        Self {
            trade_executor,
            social,
            goals,
        }
    }

    /// Perform one action for the agent. Errors become failed outcomes at
    /// the coordinator; only storage-level faults propagate.
    pub async fn perform(
        &self,
        agent_id: i64,
        action: &AgentAction,
        intent_id: &str,
    ) -> EngineResult<ActionOutcome> {
        match action {
            AgentAction::BuyShares {
                market_id,
                side,
                cash,
            } => {
                self.trade(
                    agent_id,
                    intent_id,
                    TradeIntent::BuyPredictionShares {
                        market_id: *market_id,
                        side: *side,
                        cash: *cash,
                        expected_price: None,
                    },
                )
                .await
            }
            AgentAction::SellShares {
                market_id,
                side,
                shares,
            } => {
                self.trade(
                    agent_id,
                    intent_id,
                    TradeIntent::SellPredictionShares {
                        market_id: *market_id,
                        side: *side,
                        shares: *shares,
                    },
                )
                .await
            }
            AgentAction::OpenPerp {
                ticker,
                side,
                size,
                leverage,
            } => {
                self.trade(
                    agent_id,
                    intent_id,
                    TradeIntent::OpenPerp {
                        ticker: ticker.clone(),
                        side: *side,
                        size: *size,
                        leverage: *leverage,
                        expected_price: None,
                    },
                )
                .await
            }
            AgentAction::ClosePerp { ticker } => {
                self.trade(
                    agent_id,
                    intent_id,
                    TradeIntent::ClosePerp {
                        ticker: ticker.clone(),
                    },
                )
                .await
            }
            AgentAction::Post { body } => {
                let id = self.social.create_post(agent_id, body).await?;
                Ok(ActionOutcome {
                    success: true,
                    detail: format!("post {id}"),
                    realized_pnl: 0.0,
                })
            }
            AgentAction::Comment { post_id, body } => {
                match self.social.create_comment(agent_id, *post_id, body).await {
                    Ok(id) => Ok(ActionOutcome {
                        success: true,
                        detail: format!("comment {id}"),
                        realized_pnl: 0.0,
                    }),
                    Err(EngineError::NotFound(msg)) => Ok(ActionOutcome {
                        success: false,
                        detail: msg,
                        realized_pnl: 0.0,
                    }),
                    Err(e) => Err(e),
                }
            }
            AgentAction::Message {
                recipient_id,
                body,
            } => {
                let id = self
                    .social
                    .send_message(agent_id, Some(*recipient_id), body)
                    .await?;
                Ok(ActionOutcome {
                    success: true,
                    detail: format!("message {id}"),
                    realized_pnl: 0.0,
                })
            }
            AgentAction::GroupMessage { body } => {
                let id = self.social.send_message(agent_id, None, body).await?;
                Ok(ActionOutcome {
                    success: true,
                    detail: format!("group message {id}"),
                    realized_pnl: 0.0,
                })
            }
            AgentAction::UpdateGoal { goal_id, progress } => {
                match self.goals.advance_progress(*goal_id, *progress).await {
                    Ok(goal) => Ok(ActionOutcome {
                        success: true,
                        detail: format!(
                            "goal {} progress {:.2} ({})",
                            goal.id,
                            goal.progress,
                            goal.status.as_str()
                        ),
                        realized_pnl: 0.0,
                    }),
                    Err(EngineError::NotFound(msg)) => Ok(ActionOutcome {
                        success: false,
                        detail: msg,
                        realized_pnl: 0.0,
                    }),
                    Err(e) => Err(e),
                }
            }
        }
    }

    async fn trade(
        &self,
        agent_id: i64,
        intent_id: &str,
        intent: TradeIntent,
    ) -> EngineResult<ActionOutcome> {
        match self
            .trade_executor
            .execute_one(&IntentRecord {
                intent_id: intent_id.to_string(),
                actor: Actor::User(agent_id),
                intent,
            })
            .await
        {
            Ok(trade) => Ok(ActionOutcome {
                success: true,
                detail: format!("position {}", trade.position_id),
                realized_pnl: trade.realized_pnl,
            }),
            // User-level trade failures are recorded, not propagated.
            Err(e) if !e.is_fatal() => Ok(ActionOutcome {
                success: false,
                detail: e.to_string(),
                realized_pnl: 0.0,
            }),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ModelTier;
    use serde_json::json;

    fn agent_with(caps: Vec<AgentCapability>, tolerance: RiskTolerance) -> UserRecord {
        UserRecord {
            id: 1,
            handle: Some("a".to_string()),
            is_agent: true,
            is_npc_actor: false,
            is_admin: false,
            is_banned: false,
            is_active: true,
            virtual_balance: 100.0,
            earned_points: 0,
            invite_points: 0,
            bonus_points: 0,
            agent_points: 10,
            manager_id: None,
            system_prompt: None,
            capabilities: caps,
            max_actions_per_tick: 3,
            risk_tolerance: tolerance,
            planning_horizon: crate::models::PlanningHorizon::Medium,
            model_tier: ModelTier::Free,
            created_at: 0,
        }
    }

    #[test]
    fn capability_filter_drops_unauthorized_actions() {
        let agent = agent_with(vec![AgentCapability::Posting], RiskTolerance::Medium);
        let plan = parse_plan(
            &json!([
                {"type": "post", "body": "hello"},
                {"type": "open_perp", "ticker": "ACME", "side": "long", "size": 10.0},
                {"type": "message", "recipient_id": 2, "body": "hi"},
            ]),
            &agent,
        );
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].action.kind(), "post");
    }

    #[test]
    fn low_risk_tolerance_downgrades_leverage() {
        let agent = agent_with(vec![AgentCapability::Trading], RiskTolerance::Low);
        let plan = parse_plan(
            &json!([
                {"type": "open_perp", "ticker": "ACME", "side": "long",
                 "size": 10.0, "leverage": 50.0},
            ]),
            &agent,
        );
        assert_eq!(plan.len(), 1);
        match &plan[0].action {
            AgentAction::OpenPerp { leverage, .. } => assert_eq!(*leverage, 5.0),
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn plan_is_priority_ordered_and_truncated() {
        let agent = agent_with(
            vec![AgentCapability::Posting, AgentCapability::GroupChat],
            RiskTolerance::Medium,
        );
        let plan = parse_plan(
            &json!([
                {"type": "post", "body": "a", "priority": 2},
                {"type": "post", "body": "b", "priority": 9},
                {"type": "group_message", "body": "c", "priority": 5},
                {"type": "post", "body": "d", "priority": 8},
                {"type": "post", "body": "e", "priority": 7},
            ]),
            &agent,
        );
        assert_eq!(plan.len(), 3);
        assert_eq!(plan[0].priority, 9);
        assert_eq!(plan[1].priority, 8);
        assert_eq!(plan[2].priority, 7);
    }

    #[test]
    fn unknown_action_names_dropped() {
        let agent = agent_with(
            AgentCapability::all().to_vec(),
            RiskTolerance::High,
        );
        let plan = parse_plan(
            &json!([
                {"type": "transfer_admin", "target": 1},
                {"type": "update_goal", "goal_id": 4, "progress": 0.5},
            ]),
            &agent,
        );
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].action.kind(), "update_goal");
    }
}
