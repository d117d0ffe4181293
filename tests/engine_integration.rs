//! End-to-end engine tests: full ticks, resolution, autonomous agents,
//! and the A2A gateway wired together against a real database.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use serde_json::json;
use tower::ServiceExt;

use agora_backend::a2a::a2a_router;
use agora_backend::config::EngineConfig;
use agora_backend::db::Db;
use agora_backend::executor::{Actor, IntentRecord, TradeIntent};
use agora_backend::llm::mock::MockLlm;
use agora_backend::models::{
    now_ts, AgentCapability, BalanceTxKind, ModelTier, Outcome, PlanningHorizon, PredictionSide,
    RiskTolerance,
};
use agora_backend::oracle::LocalOracle;
use agora_backend::store::users::NewAgent;
use agora_backend::tick::TickOutcome;
use agora_backend::Engine;

fn test_engine(db: Db, llm: Arc<MockLlm>) -> Engine {
    // Small synthetic supply so a single trade visibly moves the quote.
    let cfg = EngineConfig {
        synthetic_supply: 100.0,
        ..EngineConfig::default()
    };
    Engine::build(cfg, db, llm, Arc::new(LocalOracle::new()))
}

async fn seed_npc_with_pool(engine: &Engine, handle: &str, balance: f64) -> i64 {
    let npc = engine
        .users
        .create_npc_actor(handle, "test actor")
        .await
        .unwrap();
    engine
        .pools
        .create(npc, &format!("{handle} pool"), balance, 0.1)
        .await
        .unwrap();
    npc
}

#[tokio::test]
async fn game_tick_trades_prices_and_persists() {
    let llm = Arc::new(MockLlm::new());
    let engine = test_engine(Db::open_in_memory().unwrap(), llm.clone());

    seed_npc_with_pool(&engine, "mm-1", 10_000.0).await;
    engine.orgs.create("ACME", "Acme", 50.0).await.unwrap();
    let market = engine
        .markets
        .create("Will it resolve yes?", "general", now_ts() + 3600, 100.0)
        .await
        .unwrap();

    llm.push_value(json!([
        {"action": "open_long", "ticker": "ACME", "amount": 400.0,
         "confidence": 0.9, "reason": "flow"},
        {"action": "buy_yes", "market_id": market.id, "amount": 50.0,
         "confidence": 0.6, "reason": "cheap"},
    ]));

    let summary = match engine.scheduler.run_once().await.unwrap() {
        TickOutcome::Completed(s) => s,
        TickOutcome::Busy => panic!("unexpected busy"),
    };
    assert_eq!(summary.tick_no, 1);
    assert_eq!(summary.npcs_decided, 1);
    assert_eq!(summary.trades_attempted, 2);
    assert_eq!(summary.trades_succeeded, 2);

    // Net long flow of 400 over synthetic supply 100 lifts the quote.
    let org = engine.orgs.get("ACME").await.unwrap();
    assert!((org.current_price - 54.0).abs() < 1e-9);
    assert_eq!(
        engine.history.recent_prices("ACME", 10).await.unwrap().len(),
        1
    );

    // The prediction buy moved the YES price and funded the escrow.
    let m = engine.markets.get(market.id).await.unwrap();
    assert!(m.q_yes > 0.0);
    assert!(m.escrow > 100.0 * std::f64::consts::LN_2);

    // Pool cash went into margin and shares, and the first funding
    // interval charged the lone long 0.0001 * 400 = 0.04.
    let pool = engine.pools.list().await.unwrap().pop().unwrap();
    assert!((pool.available_balance - (10_000.0 - 400.0 - 50.0 - 0.04)).abs() < 1e-3);
    assert!((pool.total_value - (10_000.0 - 0.04)).abs() < 1e-3);
    assert!((pool.lifetime_pnl + 0.04).abs() < 1e-3);

    // Both positions are enumerable through the pool, and the pool
    // accounting identity holds.
    let held = engine.pools.list_open_positions(pool.id).await.unwrap();
    assert_eq!(held.perps.len(), 1);
    assert_eq!(held.predictions.len(), 1);
    assert!((held.deployed() - 450.0).abs() < 1e-6);
    engine.verify_pool_invariants().await.unwrap();

    // Summary persisted and visible to status.
    let status = engine.scheduler.status().await.unwrap();
    assert_eq!(status.phase, "idle");
    assert_eq!(status.last_summary.unwrap().tick_no, 1);

    engine.verify_ledger_invariants().await.unwrap();
}

#[tokio::test]
async fn resolution_pays_winners_once_and_conserves_escrow() {
    let engine = test_engine(Db::open_in_memory().unwrap(), Arc::new(MockLlm::new()));

    let winner = engine.users.create_human("winner").await.unwrap();
    let loser = engine.users.create_human("loser").await.unwrap();
    for user in [winner, loser] {
        engine
            .ledger
            .credit(user, 500.0, BalanceTxKind::Deposit, None)
            .await
            .unwrap();
    }

    let market = engine
        .markets
        .create("settles yes", "general", now_ts() + 60, 100.0)
        .await
        .unwrap();

    for (user, side, cash) in [
        (winner, PredictionSide::Yes, 50.0),
        (loser, PredictionSide::No, 30.0),
    ] {
        let report = engine
            .executor
            .execute(vec![IntentRecord {
                intent_id: format!("seed-{user}"),
                actor: Actor::User(user),
                intent: TradeIntent::BuyPredictionShares {
                    market_id: market.id,
                    side,
                    cash,
                    expected_price: None,
                },
            }])
            .await;
        assert_eq!(report.successes.len(), 1);
    }

    // Mature the market, then resolve YES.
    {
        let conn = engine.db.lock().await;
        conn.execute(
            "UPDATE prediction_markets SET resolution_time = ?1 WHERE id = ?2",
            rusqlite::params![now_ts() - 5, market.id],
        )
        .unwrap();
    }
    engine
        .resolution
        .resolve_with_outcome(market.id, Outcome::Yes)
        .await
        .unwrap();

    let winner_balance = engine.ledger.balance(winner).await.unwrap();
    let loser_balance = engine.ledger.balance(loser).await.unwrap();
    let yes_shares: f64 = {
        let conn = engine.db.lock().await;
        conn.query_row(
            "SELECT shares FROM prediction_positions WHERE user_id = ?1",
            [winner],
            |r| r.get(0),
        )
        .unwrap()
    };
    assert!((winner_balance - (450.0 + yes_shares)).abs() < 1e-6);
    assert!((loser_balance - 470.0).abs() < 1e-6);

    // Escrow covered every payout and never went negative.
    let resolved = engine.markets.get(market.id).await.unwrap();
    assert!(resolved.resolved);
    assert!(resolved.escrow >= -1e-9);

    // Re-running the sweep changes nothing.
    engine
        .resolution
        .resolve_with_outcome(market.id, Outcome::Yes)
        .await
        .unwrap();
    assert_eq!(engine.resolution.sweep(now_ts()).await.unwrap(), 0);
    assert_eq!(engine.ledger.balance(winner).await.unwrap(), winner_balance);
    assert_eq!(engine.ledger.balance(loser).await.unwrap(), loser_balance);

    engine.verify_ledger_invariants().await.unwrap();
}

#[tokio::test]
async fn autonomous_agent_tick_produces_exportable_trajectories() {
    let llm = Arc::new(MockLlm::new());
    let engine = test_engine(Db::open_in_memory().unwrap(), llm.clone());

    let manager = engine.users.create_human("manager").await.unwrap();
    let mut agents = Vec::new();
    for i in 0..3 {
        let agent = engine
            .users
            .create_agent(&NewAgent {
                handle: format!("agent-{i}"),
                manager_id: manager,
                system_prompt: "Test agent.".to_string(),
                capabilities: vec![AgentCapability::Trading, AgentCapability::Posting],
                max_actions_per_tick: 3,
                risk_tolerance: RiskTolerance::Low,
                planning_horizon: PlanningHorizon::Short,
                model_tier: ModelTier::Free,
                starting_points: 5,
            })
            .await
            .unwrap();
        engine
            .ledger
            .credit(agent, 200.0, BalanceTxKind::Deposit, None)
            .await
            .unwrap();
        agents.push(agent);
    }

    for _ in 0..3 {
        llm.push_value(json!([
            {"type": "post", "body": "thinking about markets", "priority": 5},
        ]));
    }

    let results = engine.coordinator.run_all().await.unwrap();
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|(_, r)| r.success));

    // Window 0 (no ticks yet) now has 3 distinct agents: training-ready.
    let (count, ready) = engine.scorer.score_window(0).await.unwrap();
    assert_eq!(count, 3);
    assert!(ready);

    // Byte-identical double export.
    let first = engine.exporter.export_window(0, None).await.unwrap();
    let second = engine.exporter.export_window(0, None).await.unwrap();
    assert_eq!(first.len(), 3);
    assert_eq!(first, second);

    // Each line is a training tuple with a reconstructed conversation.
    let record: serde_json::Value = serde_json::from_str(&first[0]).unwrap();
    assert!(record["messages"].as_array().unwrap().len() >= 3);
    assert!(record["metadata"]["training_ready"].as_bool().unwrap());

    // Points billed once per agent.
    for agent in agents {
        assert_eq!(engine.users.get(agent).await.unwrap().agent_points, 4);
    }
}

#[tokio::test]
async fn a2a_http_gateway_authenticates_and_rate_limits() {
    let engine = test_engine(Db::open_in_memory().unwrap(), Arc::new(MockLlm::new()));
    let caller = engine.users.create_human("api-caller").await.unwrap();
    engine
        .ledger
        .credit(caller, 100.0, BalanceTxKind::Deposit, None)
        .await
        .unwrap();
    let token = engine.a2a.auth.issue_token(caller, Some("api-caller")).unwrap();
    let app = a2a_router(engine.a2a.clone());

    let request_body = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "a2a.getPredictions",
        "params": {},
    })
    .to_string();

    // Unauthenticated request rejected.
    let resp = app
        .clone()
        .oneshot(
            Request::post("/a2a")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(request_body.clone()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    // 60 rpm + 10 burst: 70 requests pass, the 71st gets 429 with a
    // retry hint.
    for i in 0..70 {
        let resp = app
            .clone()
            .oneshot(
                Request::post("/a2a")
                    .header(header::CONTENT_TYPE, "application/json")
                    .header(header::AUTHORIZATION, format!("Bearer {token}"))
                    .body(Body::from(request_body.clone()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK, "request {i} should pass");
    }

    let resp = app
        .clone()
        .oneshot(
            Request::post("/a2a")
                .header(header::CONTENT_TYPE, "application/json")
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::from(request_body.clone()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(resp.headers().contains_key(header::RETRY_AFTER));

    let body = axum::body::to_bytes(resp.into_body(), 1 << 16).await.unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["error"]["data"]["code"], "rate_limited");
}

#[tokio::test]
async fn a2a_trading_matches_internal_semantics() {
    let engine = test_engine(Db::open_in_memory().unwrap(), Arc::new(MockLlm::new()));
    let caller = engine.users.create_human("external-agent").await.unwrap();
    engine
        .ledger
        .credit(caller, 1000.0, BalanceTxKind::Deposit, None)
        .await
        .unwrap();
    engine.orgs.create("ACME", "Acme", 50.0).await.unwrap();
    let token = engine.a2a.auth.issue_token(caller, None).unwrap();
    let app = a2a_router(engine.a2a.clone());

    let call = |method: &str, params: serde_json::Value| {
        json!({"jsonrpc": "2.0", "id": 1, "method": method, "params": params}).to_string()
    };

    // Open, then close after a price move; the ledger ends at the same
    // balances the internal executor produces.
    let resp = app
        .clone()
        .oneshot(
            Request::post("/a2a")
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::from(call(
                    "a2a.openPerp",
                    json!({"ticker": "ACME", "side": "long", "size": 500.0, "leverage": 5.0}),
                )))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!((engine.ledger.balance(caller).await.unwrap() - 900.0).abs() < 1e-9);

    engine.orgs.set_current_price("ACME", 60.0).await.unwrap();
    let resp = app
        .clone()
        .oneshot(
            Request::post("/a2a")
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::from(call("a2a.closePerp", json!({"ticker": "ACME"}))))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = axum::body::to_bytes(resp.into_body(), 1 << 16).await.unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert!((parsed["result"]["realized_pnl"].as_f64().unwrap() - 100.0).abs() < 1e-9);
    assert!((engine.ledger.balance(caller).await.unwrap() - 1100.0).abs() < 1e-9);

    engine.verify_ledger_invariants().await.unwrap();
}

#[tokio::test]
async fn corrupted_balance_is_a_fatal_invariant_violation() {
    let engine = test_engine(Db::open_in_memory().unwrap(), Arc::new(MockLlm::new()));
    let user = engine.users.create_human("victim").await.unwrap();
    engine
        .ledger
        .credit(user, 100.0, BalanceTxKind::Deposit, None)
        .await
        .unwrap();

    {
        let conn = engine.db.lock().await;
        conn.execute(
            "UPDATE users SET virtual_balance = 999.0 WHERE id = ?1",
            [user],
        )
        .unwrap();
    }

    let err = engine.verify_ledger_invariants().await.unwrap_err();
    assert!(err.is_fatal());
}

#[tokio::test]
async fn file_backed_database_survives_reopen() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("agora.db");
    let path_str = path.to_str().unwrap();

    {
        let engine = test_engine(Db::open(path_str).unwrap(), Arc::new(MockLlm::new()));
        let user = engine.users.create_human("durable").await.unwrap();
        engine
            .ledger
            .credit(user, 42.0, BalanceTxKind::Deposit, None)
            .await
            .unwrap();
    }

    let engine = test_engine(Db::open(path_str).unwrap(), Arc::new(MockLlm::new()));
    let user = engine.users.get_by_handle("durable").await.unwrap();
    assert!((user.virtual_balance - 42.0).abs() < 1e-9);
    engine.verify_ledger_invariants().await.unwrap();
}
