//! Bounded-concurrency NPC decision generation.
//!
//! One LLM call per NPC, all NPCs in flight concurrently but gated by the
//! shared semaphore; a slow or failed call degrades that NPC to hold.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::llm::{LlmProvider, LlmRequest};
use crate::npc::context::MarketContext;
use crate::npc::decision::{parse_decisions, NpcDecision};

const NPC_SYSTEM_PROMPT: &str = "You are an automated market participant in a trading \
simulation. You receive a snapshot of markets and reply with a JSON array of trade \
decisions. Reply with JSON only.";

pub struct NpcDecisionEngine {
    llm: Arc<dyn LlmProvider>,
    semaphore: Arc<Semaphore>,
    model: String,
    temperature: f64,
    max_tokens: u32,
    timeout: Duration,
    n_trades_per_npc: usize,
    risk_fraction: f64,
}

impl NpcDecisionEngine {
    pub fn new(llm: Arc<dyn LlmProvider>, semaphore: Arc<Semaphore>, cfg: &EngineConfig) -> Self {
        Self {
            llm,
            semaphore,
            model: cfg.llm_model.clone(),
            temperature: cfg.llm_temperature,
            max_tokens: cfg.llm_max_tokens,
            timeout: Duration::from_millis(cfg.llm_timeout_ms),
            n_trades_per_npc: cfg.n_trades_per_npc,
            risk_fraction: cfg.npc_risk_fraction,
        }
    }

    /// Decide for every NPC context. Output order matches input order; an
    /// NPC whose call failed or timed out contributes an empty list.
    pub async fn decide_all(&self, contexts: &[MarketContext]) -> Vec<(i64, Vec<NpcDecision>)> {
        let futures = contexts.iter().map(|ctx| self.decide_one(ctx));
        join_all(futures).await
    }

    async fn decide_one(&self, ctx: &MarketContext) -> (i64, Vec<NpcDecision>) {
        let permit = match self.semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => return (ctx.npc_id, Vec::new()),
        };

        let req = LlmRequest {
            system_prompt: NPC_SYSTEM_PROMPT.to_string(),
            user_prompt: ctx.render_prompt(self.n_trades_per_npc),
            model: self.model.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            timeout: self.timeout,
        };

        let result = tokio::time::timeout(self.timeout, self.llm.generate_json(&req)).await;
        drop(permit);

        let decisions = match result {
            Ok(Ok(resp)) => {
                let decisions = parse_decisions(
                    &resp.value,
                    ctx.available_balance,
                    self.risk_fraction,
                    self.n_trades_per_npc,
                );
                debug!(
                    npc_id = ctx.npc_id,
                    decisions = decisions.len(),
                    latency_ms = resp.latency_ms,
                    "npc decided"
                );
                decisions
            }
            Ok(Err(e)) => {
                warn!(npc_id = ctx.npc_id, error = %e, "npc decision call failed, holding");
                Vec::new()
            }
            Err(_) => {
                warn!(
                    npc_id = ctx.npc_id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "npc decision call timed out, holding"
                );
                Vec::new()
            }
        };

        (ctx.npc_id, decisions)
    }
}
