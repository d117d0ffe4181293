//! Per-NPC market context assembly.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::EngineResult;
use crate::models::{now_ts, Pool, UserRecord};
use crate::pricing;
use crate::store::{
    OrganizationStore, PoolStore, PredictionMarketStore, SocialStore,
};

const TOP_K_POSTS: usize = 10;
const TOP_K_MESSAGES: usize = 10;

/// Everything one NPC sees when deciding its trades for the tick.
#[derive(Debug, Clone, Serialize)]
pub struct MarketContext {
    pub npc_id: i64,
    pub npc_name: String,
    pub available_balance: f64,
    pub recent_posts: Vec<String>,
    pub group_chat_messages: Vec<String>,
    /// ticker -> current price
    pub perp_markets: BTreeMap<String, f64>,
    /// market id -> (prompt, yes price)
    pub prediction_markets: BTreeMap<i64, (String, f64)>,
    pub current_positions: Vec<PositionSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PositionSummary {
    pub instrument: String,
    pub side: String,
    pub size: f64,
    pub entry_price: f64,
}

#[derive(Clone)]
pub struct ContextBuilder {
    orgs: OrganizationStore,
    markets: PredictionMarketStore,
    pools: PoolStore,
    social: SocialStore,
}

impl ContextBuilder {
    pub fn new(
        orgs: OrganizationStore,
        markets: PredictionMarketStore,
        pools: PoolStore,
        social: SocialStore,
    ) -> Self {
        Self {
            orgs,
            markets,
            pools,
            social,
        }
    }

    pub async fn build(&self, npc: &UserRecord, pool: &Pool) -> EngineResult<MarketContext> {
        let now = now_ts();

        let mut perp_markets = BTreeMap::new();
        for org in self.orgs.list().await? {
            perp_markets.insert(org.ticker, org.current_price);
        }

        let mut prediction_markets = BTreeMap::new();
        for m in self.markets.list_open(now).await? {
            let yes = pricing::price_yes(m.q_yes, m.q_no, m.b);
            prediction_markets.insert(m.id, (m.prompt, yes));
        }

        let recent_posts = self
            .social
            .recent_posts(TOP_K_POSTS)
            .await?
            .into_iter()
            .map(|p| p.body)
            .collect();
        let group_chat_messages = self
            .social
            .recent_group_messages(TOP_K_MESSAGES)
            .await?
            .into_iter()
            .map(|m| m.body)
            .collect();

        let held = self.pools.list_open_positions(pool.id).await?;
        let mut current_positions = Vec::new();
        for p in held.perps {
            current_positions.push(PositionSummary {
                instrument: p.ticker,
                side: p.side.as_str().to_string(),
                size: p.size,
                entry_price: p.entry_price,
            });
        }
        for p in held.predictions {
            current_positions.push(PositionSummary {
                instrument: format!("market:{}", p.market_id),
                side: p.side.as_str().to_string(),
                size: p.shares,
                entry_price: p.avg_price,
            });
        }

        Ok(MarketContext {
            npc_id: npc.id,
            npc_name: npc.handle.clone().unwrap_or_else(|| format!("npc-{}", npc.id)),
            available_balance: pool.available_balance,
            recent_posts,
            group_chat_messages,
            perp_markets,
            prediction_markets,
            current_positions,
        })
    }
}

impl MarketContext {
    /// Render for the decision prompt. Kept deterministic (BTreeMap
    /// iteration order) so recorded trajectories replay identically.
    pub fn render_prompt(&self, max_trades: usize) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "You are {}, an automated trader with {:.2} cash available.\n\n",
            self.npc_name, self.available_balance
        ));

        out.push_str("Perpetual markets (ticker: price):\n");
        for (ticker, price) in &self.perp_markets {
            out.push_str(&format!("  {ticker}: {price:.4}\n"));
        }

        out.push_str("\nPrediction markets (id: question @ yes price):\n");
        for (id, (prompt, yes)) in &self.prediction_markets {
            out.push_str(&format!("  {id}: {prompt} @ {yes:.4}\n"));
        }

        if !self.current_positions.is_empty() {
            out.push_str("\nYour open positions:\n");
            for p in &self.current_positions {
                out.push_str(&format!(
                    "  {} {} size {:.2} @ {:.4}\n",
                    p.instrument, p.side, p.size, p.entry_price
                ));
            }
        }

        if !self.recent_posts.is_empty() {
            out.push_str("\nRecent posts:\n");
            for p in &self.recent_posts {
                out.push_str(&format!("  - {p}\n"));
            }
        }
        if !self.group_chat_messages.is_empty() {
            out.push_str("\nGroup chat:\n");
            for m in &self.group_chat_messages {
                out.push_str(&format!("  - {m}\n"));
            }
        }

        out.push_str(&format!(
            "\nReply with a JSON array of at most {max_trades} decisions. Each entry:\n\
             {{\"action\": one of hold|open_long|open_short|close|buy_yes|buy_no,\n \
             \"ticker\": \"...\" (perp actions) OR \"market_id\": N (prediction actions),\n \
             \"amount\": cash to commit, \"confidence\": 0.0-1.0, \"reason\": \"...\"}}\n\
             Reply with [] to hold everything.\n"
        ));
        out
    }
}
