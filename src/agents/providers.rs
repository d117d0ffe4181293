//! Context providers: read-only sources an agent consults before
//! planning. Providers never mutate state; a failed or slow provider
//! yields an empty context string, never a failed tick.

use async_trait::async_trait;

use crate::agents::experience::ExperienceStore;
use crate::error::EngineResult;
use crate::ledger::Ledger;
use crate::models::now_ts;
use crate::pricing;
use crate::store::{
    OrganizationStore, PerpPositionStore, PredictionMarketStore, SocialStore, UserStore,
};

#[async_trait]
pub trait ContextProvider: Send + Sync {
    fn name(&self) -> &'static str;
    async fn provide(&self, agent_id: i64) -> EngineResult<String>;
}

/// Balance and open positions.
pub struct WalletProvider {
    pub ledger: Ledger,
    pub perps: PerpPositionStore,
    pub markets: PredictionMarketStore,
}

#[async_trait]
impl ContextProvider for WalletProvider {
    fn name(&self) -> &'static str {
        "wallet"
    }

    async fn provide(&self, agent_id: i64) -> EngineResult<String> {
        let balance = self.ledger.balance(agent_id).await?;
        let mut out = format!("Cash balance: {balance:.2}\n");
        for p in self.perps.list_open_for_user(agent_id).await? {
            out.push_str(&format!(
                "Perp {} {} size {:.2} entry {:.4} liq {:.4}\n",
                p.ticker,
                p.side.as_str(),
                p.size,
                p.entry_price,
                p.liquidation_price
            ));
        }
        for p in self.markets.open_positions_for_user(agent_id).await? {
            out.push_str(&format!(
                "Prediction market {} {} shares {:.2} avg {:.4}\n",
                p.market_id,
                p.side.as_str(),
                p.shares,
                p.avg_price
            ));
        }
        Ok(out)
    }
}

/// Recent feed posts.
pub struct HeadlinesProvider {
    pub social: SocialStore,
}

#[async_trait]
impl ContextProvider for HeadlinesProvider {
    fn name(&self) -> &'static str {
        "headlines"
    }

    async fn provide(&self, _agent_id: i64) -> EngineResult<String> {
        let posts = self.social.recent_posts(10).await?;
        Ok(posts
            .iter()
            .map(|p| format!("- {}", p.body))
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

/// Tickers ranked by move from their initial price.
pub struct MarketMoversProvider {
    pub orgs: OrganizationStore,
}

#[async_trait]
impl ContextProvider for MarketMoversProvider {
    fn name(&self) -> &'static str {
        "market_movers"
    }

    async fn provide(&self, _agent_id: i64) -> EngineResult<String> {
        let mut orgs = self.orgs.list().await?;
        orgs.sort_by(|a, b| {
            let ma = (a.current_price / a.initial_price - 1.0).abs();
            let mb = (b.current_price / b.initial_price - 1.0).abs();
            mb.partial_cmp(&ma).unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(orgs
            .iter()
            .take(5)
            .map(|o| {
                format!(
                    "{}: {:.4} ({:+.1}% from {:.4})",
                    o.ticker,
                    o.current_price,
                    (o.current_price / o.initial_price - 1.0) * 100.0,
                    o.initial_price
                )
            })
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

/// Posts mentioning the agent's handle.
pub struct EntityMentionsProvider {
    pub social: SocialStore,
    pub users: UserStore,
}

#[async_trait]
impl ContextProvider for EntityMentionsProvider {
    fn name(&self) -> &'static str {
        "entity_mentions"
    }

    async fn provide(&self, agent_id: i64) -> EngineResult<String> {
        let user = self.users.get(agent_id).await?;
        let Some(handle) = user.handle else {
            return Ok(String::new());
        };
        let needle = format!("@{handle}");
        let posts = self.social.recent_posts(100).await?;
        Ok(posts
            .iter()
            .filter(|p| p.body.contains(&needle))
            .take(5)
            .map(|p| format!("- {}", p.body))
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

/// Open prediction markets closest to resolution.
pub struct TrendingProvider {
    pub markets: PredictionMarketStore,
}

#[async_trait]
impl ContextProvider for TrendingProvider {
    fn name(&self) -> &'static str {
        "trending"
    }

    async fn provide(&self, _agent_id: i64) -> EngineResult<String> {
        let mut markets = self.markets.list_open(now_ts()).await?;
        markets.sort_by_key(|m| m.resolution_time);
        Ok(markets
            .iter()
            .take(5)
            .map(|m| {
                let yes = pricing::price_yes(m.q_yes, m.q_no, m.b);
                format!("market {}: {} (yes {:.3})", m.id, m.prompt, yes)
            })
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

/// Important prior experiences.
pub struct ExperienceProvider {
    pub experiences: ExperienceStore,
}

#[async_trait]
impl ContextProvider for ExperienceProvider {
    fn name(&self) -> &'static str {
        "experience"
    }

    async fn provide(&self, agent_id: i64) -> EngineResult<String> {
        let memories = self.experiences.retrieve(agent_id, 5).await?;
        Ok(memories
            .iter()
            .map(|e| format!("[{}] {}", e.kind, e.content))
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;

    #[tokio::test]
    async fn wallet_provider_reports_balance_and_positions() {
        let db = Db::open_in_memory().unwrap();
        let users = UserStore::new(db.clone());
        let agent = users.create_human("a").await.unwrap();
        let ledger = Ledger::new(db.clone());
        ledger
            .credit(agent, 250.0, crate::models::BalanceTxKind::Deposit, None)
            .await
            .unwrap();

        let provider = WalletProvider {
            ledger,
            perps: PerpPositionStore::new(db.clone()),
            markets: PredictionMarketStore::new(db.clone()),
        };
        let out = provider.provide(agent).await.unwrap();
        assert!(out.contains("250.00"));
    }

    #[tokio::test]
    async fn mentions_provider_filters_by_handle() {
        let db = Db::open_in_memory().unwrap();
        let users = UserStore::new(db.clone());
        let agent = users.create_human("oracle-fan").await.unwrap();
        let social = SocialStore::new(db.clone());
        social.create_post(99, "hey @oracle-fan nice call").await.unwrap();
        social.create_post(99, "unrelated chatter").await.unwrap();

        let provider = EntityMentionsProvider { social, users };
        let out = provider.provide(agent).await.unwrap();
        assert!(out.contains("nice call"));
        assert!(!out.contains("unrelated"));
    }
}
