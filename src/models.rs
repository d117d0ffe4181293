//! Shared domain types for the simulation engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of a binary prediction market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Yes,
    No,
    Unresolved,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Yes => "yes",
            Outcome::No => "no",
            Outcome::Unresolved => "unresolved",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "yes" => Some(Outcome::Yes),
            "no" => Some(Outcome::No),
            "unresolved" => Some(Outcome::Unresolved),
            _ => None,
        }
    }
}

/// Side of a prediction position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionSide {
    Yes,
    No,
}

impl PredictionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PredictionSide::Yes => "yes",
            PredictionSide::No => "no",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "yes" => Some(PredictionSide::Yes),
            "no" => Some(PredictionSide::No),
            _ => None,
        }
    }

    /// Whether this side pays out under the given resolved outcome.
    pub fn wins(&self, outcome: Outcome) -> bool {
        matches!(
            (self, outcome),
            (PredictionSide::Yes, Outcome::Yes) | (PredictionSide::No, Outcome::No)
        )
    }
}

/// Side of a perpetual position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerpSide {
    Long,
    Short,
}

impl PerpSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PerpSide::Long => "long",
            PerpSide::Short => "short",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "long" => Some(PerpSide::Long),
            "short" => Some(PerpSide::Short),
            _ => None,
        }
    }
}

/// Ways a user's balance can change. Every ledger row carries one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceTxKind {
    TradeOpen,
    TradeClose,
    PerpLiquidation,
    Deposit,
    Withdrawal,
    ReferralBonus,
    PointsAward,
    ResolutionPayout,
    Funding,
    AgentTickFee,
    PoolPerformanceFee,
}

impl BalanceTxKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BalanceTxKind::TradeOpen => "trade_open",
            BalanceTxKind::TradeClose => "trade_close",
            BalanceTxKind::PerpLiquidation => "perp_liquidation",
            BalanceTxKind::Deposit => "deposit",
            BalanceTxKind::Withdrawal => "withdrawal",
            BalanceTxKind::ReferralBonus => "referral_bonus",
            BalanceTxKind::PointsAward => "points_award",
            BalanceTxKind::ResolutionPayout => "resolution_payout",
            BalanceTxKind::Funding => "funding",
            BalanceTxKind::AgentTickFee => "agent_tick_fee",
            BalanceTxKind::PoolPerformanceFee => "pool_performance_fee",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "trade_open" => Some(Self::TradeOpen),
            "trade_close" => Some(Self::TradeClose),
            "perp_liquidation" => Some(Self::PerpLiquidation),
            "deposit" => Some(Self::Deposit),
            "withdrawal" => Some(Self::Withdrawal),
            "referral_bonus" => Some(Self::ReferralBonus),
            "points_award" => Some(Self::PointsAward),
            "resolution_payout" => Some(Self::ResolutionPayout),
            "funding" => Some(Self::Funding),
            "agent_tick_fee" => Some(Self::AgentTickFee),
            "pool_performance_fee" => Some(Self::PoolPerformanceFee),
            _ => None,
        }
    }
}

/// Append-only ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceTransaction {
    pub id: i64,
    pub user_id: i64,
    pub kind: BalanceTxKind,
    pub amount: f64,
    pub balance_before: f64,
    pub balance_after: f64,
    pub related_id: Option<String>,
    pub created_at: i64,
}

/// Action capabilities an agent may be granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentCapability {
    Trading,
    Posting,
    Commenting,
    Dm,
    GroupChat,
}

impl AgentCapability {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentCapability::Trading => "trading",
            AgentCapability::Posting => "posting",
            AgentCapability::Commenting => "commenting",
            AgentCapability::Dm => "dm",
            AgentCapability::GroupChat => "group_chat",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trading" => Some(Self::Trading),
            "posting" => Some(Self::Posting),
            "commenting" => Some(Self::Commenting),
            "dm" => Some(Self::Dm),
            "group_chat" => Some(Self::GroupChat),
            _ => None,
        }
    }

    pub fn all() -> [AgentCapability; 5] {
        [
            Self::Trading,
            Self::Posting,
            Self::Commenting,
            Self::Dm,
            Self::GroupChat,
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTolerance {
    Low,
    Medium,
    High,
}

impl RiskTolerance {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskTolerance::Low => "low",
            RiskTolerance::Medium => "medium",
            RiskTolerance::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" | "med" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }

    /// Maximum leverage this tolerance permits; riskier plans are
    /// downgraded to this, not rejected.
    pub fn max_leverage(&self) -> f64 {
        match self {
            RiskTolerance::Low => 5.0,
            RiskTolerance::Medium => 20.0,
            RiskTolerance::High => 100.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanningHorizon {
    Short,
    Medium,
    Long,
}

impl PlanningHorizon {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanningHorizon::Short => "short",
            PlanningHorizon::Medium => "medium",
            PlanningHorizon::Long => "long",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "short" => Some(Self::Short),
            "medium" | "med" => Some(Self::Medium),
            "long" => Some(Self::Long),
            _ => None,
        }
    }

    /// Guidance folded into the planning prompt.
    pub fn guidance(&self) -> &'static str {
        match self {
            PlanningHorizon::Short => "Favor positions you can close within a few ticks.",
            PlanningHorizon::Medium => "Balance quick trades against multi-day positions.",
            PlanningHorizon::Long => "Favor positions held to resolution over quick flips.",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    Free,
    Pro,
}

impl ModelTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTier::Free => "free",
            ModelTier::Pro => "pro",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Some(Self::Free),
            "pro" => Some(Self::Pro),
            _ => None,
        }
    }
}

/// A user row. Humans, autonomous agents, and NPC actors share the table;
/// flags distinguish them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: i64,
    pub handle: Option<String>,
    pub is_agent: bool,
    pub is_npc_actor: bool,
    pub is_admin: bool,
    pub is_banned: bool,
    pub is_active: bool,
    pub virtual_balance: f64,
    pub earned_points: i64,
    pub invite_points: i64,
    pub bonus_points: i64,
    pub agent_points: i64,
    pub manager_id: Option<i64>,
    pub system_prompt: Option<String>,
    pub capabilities: Vec<AgentCapability>,
    pub max_actions_per_tick: u32,
    pub risk_tolerance: RiskTolerance,
    pub planning_horizon: PlanningHorizon,
    pub model_tier: ModelTier,
    pub created_at: i64,
}

impl UserRecord {
    pub fn has_capability(&self, cap: AgentCapability) -> bool {
        self.capabilities.contains(&cap)
    }
}

/// A binary prediction market with an LMSR market maker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionMarket {
    pub id: i64,
    pub prompt: String,
    pub category: String,
    pub resolution_time: i64,
    pub resolved: bool,
    pub outcome: Outcome,
    pub b: f64,
    pub q_yes: f64,
    pub q_no: f64,
    /// Cash set aside at creation to fund resolution payouts.
    pub escrow: f64,
    pub created_at: i64,
}

impl PredictionMarket {
    pub fn is_open(&self, now: i64) -> bool {
        !self.resolved && self.resolution_time > now
    }

    pub fn is_matured(&self, now: i64) -> bool {
        !self.resolved && self.resolution_time <= now
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionPosition {
    pub id: i64,
    pub user_id: i64,
    pub market_id: i64,
    pub side: PredictionSide,
    pub shares: f64,
    pub avg_price: f64,
    pub opened_at: i64,
    pub closed_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerpPosition {
    pub id: i64,
    pub user_id: i64,
    pub ticker: String,
    pub side: PerpSide,
    /// Notional in cash units.
    pub size: f64,
    pub leverage: f64,
    pub entry_price: f64,
    pub liquidation_price: f64,
    pub funding_paid: f64,
    pub opened_at: i64,
    pub closed_at: Option<i64>,
}

impl PerpPosition {
    pub fn margin(&self) -> f64 {
        self.size / self.leverage
    }

    pub fn is_open(&self) -> bool {
        self.closed_at.is_none()
    }
}

/// A tradable organization backing a perpetual ticker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub id: i64,
    pub ticker: String,
    pub name: String,
    pub initial_price: f64,
    pub current_price: f64,
    pub funding_rate: f64,
    pub last_funding_at: i64,
}

/// A managed portfolio owned by one NPC actor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pool {
    pub id: i64,
    pub npc_user_id: i64,
    pub name: String,
    pub total_value: f64,
    pub available_balance: f64,
    pub lifetime_pnl: f64,
    pub performance_fee_rate: f64,
    pub created_at: i64,
}

/// Summary of one completed game tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickSummary {
    pub tick_no: i64,
    pub started_at: i64,
    pub finished_at: i64,
    pub npcs_decided: u32,
    pub trades_attempted: u32,
    pub trades_succeeded: u32,
    pub markets_resolved: u32,
}

/// Net effect of one executed trade, consumed by the price updater.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeImpact {
    pub instrument: Instrument,
    pub cash_delta: f64,
    pub share_delta: f64,
}

/// The two instrument families the executor trades.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum Instrument {
    Perp(String),
    Prediction(i64),
}

impl Instrument {
    /// Lexicographic ordering key; within a tick, intents are executed in
    /// `(instrument, actor)` order so replay on identical state is
    /// deterministic.
    pub fn sort_key(&self) -> String {
        match self {
            Instrument::Perp(t) => format!("perp:{t}"),
            Instrument::Prediction(id) => format!("pred:{id:020}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalMetric {
    Pnl,
    Balance,
    TradeCount,
    PostCount,
    EngagementScore,
}

impl GoalMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            GoalMetric::Pnl => "pnl",
            GoalMetric::Balance => "balance",
            GoalMetric::TradeCount => "trade_count",
            GoalMetric::PostCount => "post_count",
            GoalMetric::EngagementScore => "engagement_score",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pnl" => Some(Self::Pnl),
            "balance" => Some(Self::Balance),
            "trade_count" => Some(Self::TradeCount),
            "post_count" => Some(Self::PostCount),
            "engagement_score" => Some(Self::EngagementScore),
            _ => None,
        }
    }
}

/// Target of a goal, persisted as schema-validated JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoalTarget {
    pub metric: GoalMetric,
    pub value: f64,
    pub unit: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    Active,
    Completed,
    Abandoned,
}

impl GoalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GoalStatus::Active => "active",
            GoalStatus::Completed => "completed",
            GoalStatus::Abandoned => "abandoned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "abandoned" => Some(Self::Abandoned),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    pub id: i64,
    pub agent_id: i64,
    pub name: String,
    pub target: GoalTarget,
    pub priority: u8,
    pub status: GoalStatus,
    pub progress: f64,
    pub created_at: i64,
    pub completed_at: Option<i64>,
}

/// A durable memory the agent can retrieve during planning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experience {
    pub id: i64,
    pub agent_id: i64,
    pub kind: String,
    pub content: String,
    pub importance: f64,
    pub created_at: i64,
}

/// A social-feed post. Minimal surface: agents post and read; ranking is
/// out of scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: i64,
    pub author_id: i64,
    pub body: String,
    pub reply_to: Option<i64>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: i64,
    pub sender_id: i64,
    /// None for the shared group channel, Some(user) for a DM.
    pub recipient_id: Option<i64>,
    pub body: String,
    pub created_at: i64,
}

pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn to_rfc3339(ts: i64) -> String {
    DateTime::<Utc>::from_timestamp(ts, 0)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}
