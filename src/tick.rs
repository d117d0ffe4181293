//! Game tick scheduler.
//!
//! Single writer across the whole engine: at most one tick is in any
//! non-idle phase at a time, enforced by an in-process lock plus a
//! persisted `tick_in_progress` flag with a monotonically increasing
//! fencing token. A stale flag from a crashed process is reclaimed once
//! it is older than the hard timeout; the token makes sure the crashed
//! writer's late cleanup cannot clobber the new owner.
//!
//! Phases run linearly and commit independently:
//! `IDLE -> BUILDING_CONTEXT -> DECIDING -> EXECUTING -> PRICING ->
//! RESOLVING -> PERSISTING -> IDLE`. On the hard deadline the in-flight
//! phase is abandoned; committed phases stay committed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rusqlite::params;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::db::Db;
use crate::error::{EngineError, EngineResult};
use crate::executor::{Actor, IntentRecord, TradeExecutor, TradeIntent};
use crate::models::{now_ts, Instrument, PerpSide, PredictionSide, TickSummary, TradeImpact};
use crate::npc::{ContextBuilder, MarketContext, NpcAction, NpcDecision, NpcDecisionEngine};
use crate::price_updater::PriceUpdater;
use crate::resolution::ResolutionSweep;
use crate::store::{HistoryStore, PerpPositionStore, PoolStore, UserStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickPhase {
    Idle,
    BuildingContext,
    Deciding,
    Executing,
    Pricing,
    Resolving,
    Persisting,
}

impl TickPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TickPhase::Idle => "idle",
            TickPhase::BuildingContext => "building_context",
            TickPhase::Deciding => "deciding",
            TickPhase::Executing => "executing",
            TickPhase::Pricing => "pricing",
            TickPhase::Resolving => "resolving",
            TickPhase::Persisting => "persisting",
        }
    }
}

#[derive(Debug)]
pub enum TickOutcome {
    Completed(TickSummary),
    Busy,
}

#[derive(Debug, Clone)]
pub struct TickStatus {
    pub phase: &'static str,
    pub halted: bool,
    pub halted_reason: Option<String>,
    pub last_summary: Option<TickSummary>,
}

pub struct TickScheduler {
    db: Db,
    users: UserStore,
    pools: PoolStore,
    perps: PerpPositionStore,
    history: HistoryStore,
    context_builder: ContextBuilder,
    npc_engine: NpcDecisionEngine,
    executor: TradeExecutor,
    price_updater: PriceUpdater,
    resolution: ResolutionSweep,
    hard_timeout: Duration,
    in_flight: AsyncMutex<()>,
    phase: RwLock<TickPhase>,
}

impl TickScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Db,
        cfg: &EngineConfig,
        context_builder: ContextBuilder,
        npc_engine: NpcDecisionEngine,
        executor: TradeExecutor,
        price_updater: PriceUpdater,
        resolution: ResolutionSweep,
    ) -> Arc<Self> {
        Arc::new(Self {
            users: UserStore::new(db.clone()),
            pools: PoolStore::new(db.clone()),
            perps: PerpPositionStore::new(db.clone()),
            history: HistoryStore::new(db.clone()),
            db,
            context_builder,
            npc_engine,
            executor,
            price_updater,
            resolution,
            hard_timeout: Duration::from_millis(cfg.tick_hard_timeout_ms),
            in_flight: AsyncMutex::new(()),
            phase: RwLock::new(TickPhase::Idle),
        })
    }

    pub fn phase(&self) -> TickPhase {
        *self.phase.read()
    }

    pub async fn status(&self) -> EngineResult<TickStatus> {
        let (halted, halted_reason) = {
            let conn = self.db.lock().await;
            conn.query_row(
                "SELECT halted, halted_reason FROM engine_state WHERE id = 1",
                [],
                |row| Ok((row.get::<_, i64>(0)? != 0, row.get::<_, Option<String>>(1)?)),
            )?
        };
        Ok(TickStatus {
            phase: self.phase().as_str(),
            halted,
            halted_reason,
            last_summary: self.history.latest_tick_summary().await?,
        })
    }

    /// Run one tick. Returns `Busy` immediately (well under 50ms, no state
    /// touched) when another tick is in flight.
    pub async fn run_once(&self) -> EngineResult<TickOutcome> {
        let _guard = match self.in_flight.try_lock() {
            Ok(g) => g,
            Err(_) => return Ok(TickOutcome::Busy),
        };

        let Some((token, tick_no)) = self.acquire_persisted_flag().await? else {
            return Ok(TickOutcome::Busy);
        };

        let started_at = now_ts();
        let result = tokio::time::timeout(self.hard_timeout, self.run_phases(tick_no, started_at))
            .await;

        *self.phase.write() = TickPhase::Idle;
        self.release_persisted_flag(token).await?;

        match result {
            Ok(Ok(summary)) => {
                info!(
                    tick_no,
                    npcs = summary.npcs_decided,
                    attempted = summary.trades_attempted,
                    succeeded = summary.trades_succeeded,
                    resolved = summary.markets_resolved,
                    duration_s = summary.finished_at - summary.started_at,
                    "tick complete"
                );
                Ok(TickOutcome::Completed(summary))
            }
            Ok(Err(e)) if e.is_fatal() => {
                self.halt(&e.to_string()).await?;
                Err(e)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(tick_no, "tick exceeded hard deadline, phase abandoned");
                Err(EngineError::Timeout(self.hard_timeout.as_millis() as u64))
            }
        }
    }

    /// Claim the persisted single-writer flag. Returns `(fencing_token,
    /// tick_no)` when claimed, `None` when a live tick holds it.
    async fn acquire_persisted_flag(&self) -> EngineResult<Option<(i64, i64)>> {
        let hard_timeout_sec = self.hard_timeout.as_secs() as i64;
        let conn = self.db.lock().await;
        let tx = conn.unchecked_transaction()?;

        let (in_progress, started_at, halted): (bool, i64, bool) = tx.query_row(
            "SELECT tick_in_progress, tick_started_at, halted FROM engine_state WHERE id = 1",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)? != 0,
                    row.get(1)?,
                    row.get::<_, i64>(2)? != 0,
                ))
            },
        )?;

        if halted {
            return Err(EngineError::InvariantViolation(
                "engine is halted; refusing tick".to_string(),
            ));
        }

        let now = now_ts();
        if in_progress && now - started_at <= hard_timeout_sec {
            return Ok(None);
        }
        if in_progress {
            warn!(
                stale_started_at = started_at,
                "reclaiming tick flag from crashed writer"
            );
        }

        tx.execute(
            "UPDATE engine_state SET \
                tick_in_progress = 1, \
                fencing_token = fencing_token + 1, \
                tick_started_at = ?1, \
                tick_no = tick_no + 1 \
             WHERE id = 1",
            params![now],
        )?;
        let (token, tick_no): (i64, i64) = tx.query_row(
            "SELECT fencing_token, tick_no FROM engine_state WHERE id = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        tx.commit()?;
        Ok(Some((token, tick_no)))
    }

    /// Clear the flag, but only if we still own it. A reclaimed token
    /// means a newer writer took over; the stale release is a no-op.
    async fn release_persisted_flag(&self, token: i64) -> EngineResult<()> {
        let conn = self.db.lock().await;
        let cleared = conn.execute(
            "UPDATE engine_state SET tick_in_progress = 0 \
             WHERE id = 1 AND fencing_token = ?1",
            params![token],
        )?;
        if cleared == 0 {
            warn!(token, "stale tick writer fenced off during release");
        }
        Ok(())
    }

    async fn halt(&self, reason: &str) -> EngineResult<()> {
        error!(reason, "invariant violation: halting engine");
        let conn = self.db.lock().await;
        conn.execute(
            "UPDATE engine_state SET halted = 1, halted_reason = ?1 WHERE id = 1",
            params![reason],
        )?;
        conn.execute(
            "INSERT INTO incidents (kind, detail, created_at) VALUES ('invariant_violation', ?1, ?2)",
            params![reason, now_ts()],
        )?;
        Ok(())
    }

    async fn run_phases(&self, tick_no: i64, started_at: i64) -> EngineResult<TickSummary> {
        // BUILDING_CONTEXT
        *self.phase.write() = TickPhase::BuildingContext;
        let mut npc_pools = HashMap::new();
        let mut contexts: Vec<MarketContext> = Vec::new();
        for npc in self.users.list_npc_actors().await? {
            let pool = match self.pools.get_by_npc(npc.id).await {
                Ok(p) => p,
                Err(EngineError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            contexts.push(self.context_builder.build(&npc, &pool).await?);
            npc_pools.insert(npc.id, pool.id);
        }

        // DECIDING
        *self.phase.write() = TickPhase::Deciding;
        let decided = self.npc_engine.decide_all(&contexts).await;
        let npcs_decided = decided.iter().filter(|(_, d)| !d.is_empty()).count() as u32;

        // EXECUTING
        *self.phase.write() = TickPhase::Executing;
        let mut intents = Vec::new();
        for (npc_id, decisions) in &decided {
            let Some(pool_id) = npc_pools.get(npc_id) else {
                continue;
            };
            let actor = Actor::Npc {
                user_id: *npc_id,
                pool_id: *pool_id,
            };
            let ctx = contexts.iter().find(|c| c.npc_id == *npc_id);
            for (i, decision) in decisions.iter().enumerate() {
                if let Some(intent) = decision_to_intent(decision, ctx) {
                    intents.push(IntentRecord {
                        intent_id: format!("t{tick_no}:n{npc_id}:{i}"),
                        actor,
                        intent,
                    });
                }
            }
        }
        let trades_attempted = intents.len() as u32;
        let report = self.executor.execute(intents).await;
        let trades_succeeded = report.successes.len() as u32;
        let mut impacts: Vec<TradeImpact> =
            report.successes.iter().map(|t| t.impact.clone()).collect();

        // PRICING
        *self.phase.write() = TickPhase::Pricing;
        let updated = self.price_updater.apply_impacts(&impacts, tick_no).await?;
        self.price_updater.apply_funding_if_due(now_ts()).await?;

        // Liquidation pass at the fresh marks.
        let price_map: HashMap<String, f64> = updated.into_iter().collect();
        if !price_map.is_empty() {
            let liquidatable = self.perps.list_liquidatable(&price_map).await?;
            let mut liq_intents = Vec::new();
            for position in liquidatable {
                let actor = match self.pools.get_by_npc(position.user_id).await {
                    Ok(pool) => Actor::Npc {
                        user_id: position.user_id,
                        pool_id: pool.id,
                    },
                    Err(EngineError::NotFound(_)) => Actor::User(position.user_id),
                    Err(e) => return Err(e),
                };
                liq_intents.push(IntentRecord {
                    intent_id: format!("t{tick_no}:liq:{}", position.id),
                    actor,
                    intent: TradeIntent::LiquidatePerp {
                        position_id: position.id,
                    },
                });
            }
            if !liq_intents.is_empty() {
                let liq_report = self.executor.execute(liq_intents).await;
                impacts.extend(liq_report.successes.iter().map(|t| t.impact.clone()));
                self.price_updater.apply_impacts(&impacts, tick_no).await?;
            }
        }

        // RESOLVING
        *self.phase.write() = TickPhase::Resolving;
        let markets_resolved = self.resolution.sweep(now_ts()).await?;

        // PERSISTING
        *self.phase.write() = TickPhase::Persisting;
        let summary = TickSummary {
            tick_no,
            started_at,
            finished_at: now_ts(),
            npcs_decided,
            trades_attempted,
            trades_succeeded,
            markets_resolved,
        };
        self.history.insert_tick_summary(&summary).await?;

        Ok(summary)
    }

    /// Periodic loop used by `serve`: one tick per interval, never
    /// overlapping (a long tick just delays the next).
    pub async fn run_loop(self: Arc<Self>, interval_ms: u64) {
        let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            match self.run_once().await {
                Ok(TickOutcome::Completed(_)) => {}
                Ok(TickOutcome::Busy) => {
                    warn!("tick skipped: previous tick still in flight");
                }
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "tick loop stopping: engine halted");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "tick failed");
                }
            }
        }
    }
}

/// Translate one sanitized NPC decision into an executor intent. The
/// expected price recorded at decision time arms stale-price protection.
fn decision_to_intent(
    decision: &NpcDecision,
    ctx: Option<&MarketContext>,
) -> Option<TradeIntent> {
    match (&decision.action, &decision.instrument) {
        (NpcAction::OpenLong, Instrument::Perp(ticker)) => Some(TradeIntent::OpenPerp {
            ticker: ticker.clone(),
            side: PerpSide::Long,
            size: decision.amount,
            leverage: 1.0,
            expected_price: ctx.and_then(|c| c.perp_markets.get(ticker).copied()),
        }),
        (NpcAction::OpenShort, Instrument::Perp(ticker)) => Some(TradeIntent::OpenPerp {
            ticker: ticker.clone(),
            side: PerpSide::Short,
            size: decision.amount,
            leverage: 1.0,
            expected_price: ctx.and_then(|c| c.perp_markets.get(ticker).copied()),
        }),
        (NpcAction::Close, Instrument::Perp(ticker)) => Some(TradeIntent::ClosePerp {
            ticker: ticker.clone(),
        }),
        (NpcAction::BuyYes, Instrument::Prediction(market_id)) => {
            Some(TradeIntent::BuyPredictionShares {
                market_id: *market_id,
                side: PredictionSide::Yes,
                cash: decision.amount,
                expected_price: ctx
                    .and_then(|c| c.prediction_markets.get(market_id).map(|(_, p)| *p)),
            })
        }
        (NpcAction::BuyNo, Instrument::Prediction(market_id)) => {
            Some(TradeIntent::BuyPredictionShares {
                market_id: *market_id,
                side: PredictionSide::No,
                cash: decision.amount,
                expected_price: ctx
                    .and_then(|c| c.prediction_markets.get(market_id).map(|(_, p)| 1.0 - *p)),
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::mock::MockLlm;
    use crate::oracle::LocalOracle;
    use crate::store::{
        OrganizationStore, PredictionMarketStore, SocialStore,
    };
    use serde_json::json;
    use tokio::sync::Semaphore;

    async fn build_scheduler(db: Db, llm: Arc<MockLlm>) -> Arc<TickScheduler> {
        // Funding off so pool balances stay round numbers.
        let cfg = EngineConfig {
            funding_rate_k: 0.0,
            ..EngineConfig::default()
        };
        let semaphore = Arc::new(Semaphore::new(cfg.max_concurrent_llm));
        let context_builder = ContextBuilder::new(
            OrganizationStore::new(db.clone()),
            PredictionMarketStore::new(db.clone()),
            PoolStore::new(db.clone()),
            SocialStore::new(db.clone()),
        );
        let npc_engine = NpcDecisionEngine::new(llm, semaphore, &cfg);
        let executor = TradeExecutor::new(db.clone(), &cfg);
        let price_updater = PriceUpdater::new(db.clone(), &cfg);
        let resolution = ResolutionSweep::new(db.clone(), Arc::new(LocalOracle::new()), &cfg);
        TickScheduler::new(
            db,
            &cfg,
            context_builder,
            npc_engine,
            executor,
            price_updater,
            resolution,
        )
    }

    async fn seed_npc(db: &Db) -> i64 {
        let users = UserStore::new(db.clone());
        let pools = PoolStore::new(db.clone());
        let npc = users.create_npc_actor("mm-01", "momentum trader").await.unwrap();
        pools.create(npc, "mm-01 pool", 1000.0, 0.1).await.unwrap();
        npc
    }

    #[tokio::test]
    async fn empty_world_tick_completes() {
        let db = Db::open_in_memory().unwrap();
        let scheduler = build_scheduler(db, Arc::new(MockLlm::new())).await;
        match scheduler.run_once().await.unwrap() {
            TickOutcome::Completed(summary) => {
                assert_eq!(summary.tick_no, 1);
                assert_eq!(summary.trades_attempted, 0);
            }
            TickOutcome::Busy => panic!("should not be busy"),
        }
        // Tick numbers advance.
        match scheduler.run_once().await.unwrap() {
            TickOutcome::Completed(summary) => assert_eq!(summary.tick_no, 2),
            TickOutcome::Busy => panic!("should not be busy"),
        }
    }

    #[tokio::test]
    async fn npc_decisions_flow_through_to_trades() {
        let db = Db::open_in_memory().unwrap();
        seed_npc(&db).await;
        OrganizationStore::new(db.clone())
            .create("ACME", "Acme", 50.0)
            .await
            .unwrap();

        let llm = Arc::new(MockLlm::new());
        llm.push_value(json!([
            {"action": "open_long", "ticker": "ACME", "amount": 100.0,
             "confidence": 0.8, "reason": "chart goes up"}
        ]));

        let scheduler = build_scheduler(db.clone(), llm).await;
        let summary = match scheduler.run_once().await.unwrap() {
            TickOutcome::Completed(s) => s,
            TickOutcome::Busy => panic!("busy"),
        };
        assert_eq!(summary.npcs_decided, 1);
        assert_eq!(summary.trades_attempted, 1);
        assert_eq!(summary.trades_succeeded, 1);

        // Pool cash deployed into the position's margin.
        let pools = PoolStore::new(db.clone());
        let pool = pools.list().await.unwrap().pop().unwrap();
        assert!((pool.available_balance - 900.0).abs() < 1e-9);

        // Net long flow moved the spot price up and sampled history.
        let org = OrganizationStore::new(db.clone()).get("ACME").await.unwrap();
        assert!(org.current_price > 50.0);
    }

    #[tokio::test]
    async fn busy_while_tick_in_flight() {
        let db = Db::open_in_memory().unwrap();
        seed_npc(&db).await;
        let llm = Arc::new(MockLlm::new());
        llm.push(crate::llm::mock::MockReply::TimeoutAfter(
            Duration::from_millis(400),
        ));
        let scheduler = build_scheduler(db, llm).await;

        let first = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.run_once().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        match scheduler.run_once().await.unwrap() {
            TickOutcome::Busy => {}
            TickOutcome::Completed(_) => panic!("expected busy"),
        }
        assert!(started.elapsed() < Duration::from_millis(50));

        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn halted_engine_refuses_ticks() {
        let db = Db::open_in_memory().unwrap();
        let scheduler = build_scheduler(db.clone(), Arc::new(MockLlm::new())).await;
        scheduler.halt("test incident").await.unwrap();
        let err = scheduler.run_once().await.unwrap_err();
        assert!(err.is_fatal());

        let status = scheduler.status().await.unwrap();
        assert!(status.halted);
        assert_eq!(status.halted_reason.as_deref(), Some("test incident"));
    }
}
