//! Engine assembly: wire every component onto one database handle.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::info;

use crate::a2a::{A2aGateway, A2aServerState, CallerRateLimiter, JwtAuthenticator};
use crate::agents::providers::{
    EntityMentionsProvider, ExperienceProvider, HeadlinesProvider, MarketMoversProvider,
    TrendingProvider, WalletProvider,
};
use crate::agents::{
    ActionExecutor, AutonomousCoordinator, ExperienceStore, GoalStore, RuntimeManager,
};
use crate::config::EngineConfig;
use crate::db::Db;
use crate::error::EngineResult;
use crate::executor::TradeExecutor;
use crate::ledger::Ledger;
use crate::llm::{HttpLlmClient, LlmProvider, NullLlm};
use crate::npc::{ContextBuilder, NpcDecisionEngine};
use crate::oracle::{HttpOracleClient, LocalOracle, OracleClient};
use crate::price_updater::PriceUpdater;
use crate::resolution::ResolutionSweep;
use crate::store::{
    HistoryStore, OrganizationStore, PerpPositionStore, PoolStore, PredictionMarketStore,
    SocialStore, UserStore,
};
use crate::tick::TickScheduler;
use crate::trajectory::{RewardScorer, TrajectoryExporter, TrajectoryRecorder};

pub struct Engine {
    pub cfg: EngineConfig,
    pub db: Db,
    pub users: UserStore,
    pub ledger: Ledger,
    pub markets: PredictionMarketStore,
    pub orgs: OrganizationStore,
    pub perps: PerpPositionStore,
    pub pools: PoolStore,
    pub social: SocialStore,
    pub history: HistoryStore,
    pub goals: GoalStore,
    pub experiences: ExperienceStore,
    pub executor: TradeExecutor,
    pub resolution: ResolutionSweep,
    pub scheduler: Arc<TickScheduler>,
    pub coordinator: Arc<AutonomousCoordinator>,
    pub recorder: TrajectoryRecorder,
    pub scorer: RewardScorer,
    pub exporter: TrajectoryExporter,
    pub a2a: A2aServerState,
}

impl Engine {
    /// Wire the engine with explicit LLM and oracle collaborators. Tests
    /// inject mocks here; `build_from_env` picks the real ones.
    pub fn build(
        cfg: EngineConfig,
        db: Db,
        llm: Arc<dyn LlmProvider>,
        oracle: Arc<dyn OracleClient>,
    ) -> Engine {
        let users = UserStore::new(db.clone());
        let ledger = Ledger::new(db.clone());
        let markets = PredictionMarketStore::new(db.clone());
        let orgs = OrganizationStore::new(db.clone());
        let perps = PerpPositionStore::new(db.clone());
        let pools = PoolStore::new(db.clone());
        let social = SocialStore::new(db.clone());
        let history = HistoryStore::new(db.clone());
        let goals = GoalStore::new(db.clone());
        let experiences = ExperienceStore::new(db.clone());

        let llm_semaphore = Arc::new(Semaphore::new(cfg.max_concurrent_llm));
        let executor = TradeExecutor::new(db.clone(), &cfg);
        let price_updater = PriceUpdater::new(db.clone(), &cfg);
        let resolution = ResolutionSweep::new(db.clone(), oracle, &cfg);
        let recorder = TrajectoryRecorder::new(db.clone());
        let scorer = RewardScorer::new(db.clone(), &cfg);
        let exporter = TrajectoryExporter::new(db.clone());

        let context_builder = ContextBuilder::new(
            orgs.clone(),
            markets.clone(),
            pools.clone(),
            social.clone(),
        );
        let npc_engine = NpcDecisionEngine::new(llm.clone(), llm_semaphore.clone(), &cfg);
        let scheduler = TickScheduler::new(
            db.clone(),
            &cfg,
            context_builder,
            npc_engine,
            executor.clone(),
            price_updater,
            resolution.clone(),
        );

        let runtimes = RuntimeManager::new(
            vec![
                Arc::new(WalletProvider {
                    ledger: ledger.clone(),
                    perps: perps.clone(),
                    markets: markets.clone(),
                }),
                Arc::new(HeadlinesProvider {
                    social: social.clone(),
                }),
                Arc::new(MarketMoversProvider { orgs: orgs.clone() }),
                Arc::new(EntityMentionsProvider {
                    social: social.clone(),
                    users: users.clone(),
                }),
                Arc::new(TrendingProvider {
                    markets: markets.clone(),
                }),
                Arc::new(ExperienceProvider {
                    experiences: experiences.clone(),
                }),
            ],
            cfg.runtime_cache_cap,
        );
        let action_executor =
            ActionExecutor::new(executor.clone(), social.clone(), goals.clone());
        let coordinator = AutonomousCoordinator::new(
            users.clone(),
            ledger.clone(),
            history.clone(),
            runtimes,
            action_executor,
            goals.clone(),
            recorder.clone(),
            llm,
            llm_semaphore,
            cfg.clone(),
        );

        let gateway = Arc::new(A2aGateway::new(db.clone(), executor.clone()));
        let a2a = A2aServerState {
            gateway,
            auth: Arc::new(JwtAuthenticator::new(cfg.a2a_jwt_secret.clone())),
            limiter: Arc::new(CallerRateLimiter::new(
                cfg.rate_limit_rpm,
                cfg.rate_limit_burst,
            )),
        };

        Engine {
            cfg,
            db,
            users,
            ledger,
            markets,
            orgs,
            perps,
            pools,
            social,
            history,
            goals,
            experiences,
            executor,
            resolution,
            scheduler,
            coordinator,
            recorder,
            scorer,
            exporter,
            a2a,
        }
    }

    /// Production wiring from the environment: HTTP LLM when a key is
    /// configured (otherwise every participant holds), HTTP oracle when a
    /// URL is configured (otherwise the in-process oracle).
    pub fn build_from_env(cfg: EngineConfig) -> EngineResult<Engine> {
        let db = Db::open(&cfg.database_path)
            .map_err(|e| crate::error::EngineError::Storage(e.to_string()))?;

        let llm: Arc<dyn LlmProvider> = if cfg.llm_api_key.is_some() {
            Arc::new(HttpLlmClient::from_config(&cfg)?)
        } else {
            info!("LLM_API_KEY not set: NPCs and agents will hold");
            Arc::new(NullLlm)
        };

        let oracle: Arc<dyn OracleClient> = match &cfg.oracle_url {
            Some(url) => Arc::new(HttpOracleClient::new(
                reqwest::Client::new(),
                url.clone(),
                Duration::from_millis(cfg.oracle_timeout_ms),
            )),
            None => {
                info!("ORACLE_URL not set: using in-process oracle");
                Arc::new(LocalOracle::new())
            }
        };

        Ok(Self::build(cfg, db, llm, oracle))
    }

    /// Audit the ledger invariant for every user. Returns the first
    /// violation as a fatal error.
    pub async fn verify_ledger_invariants(&self) -> EngineResult<()> {
        for user_id in self.users.list_ids().await? {
            self.ledger.verify_user(user_id).await?;
        }
        Ok(())
    }

    /// Audit every pool's accounting identity
    /// (`available_balance + deployed == total_value`).
    pub async fn verify_pool_invariants(&self) -> EngineResult<()> {
        for pool in self.pools.list().await? {
            self.pools.verify_pool(pool.id).await?;
        }
        Ok(())
    }
}
