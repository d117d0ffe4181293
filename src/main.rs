//! Agora engine binary: the serve loop and the operator CLI.

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use agora_backend::a2a::server::run_limiter_cleanup;
use agora_backend::config::EngineConfig;
use agora_backend::models::{
    now_ts, AgentCapability, GoalMetric, GoalTarget, ModelTier, Outcome, PlanningHorizon,
    RiskTolerance,
};
use agora_backend::store::users::NewAgent;
use agora_backend::tick::TickOutcome;
use agora_backend::Engine;
use agora_backend::EngineError;

const EXIT_BUSY: u8 = 2;
const EXIT_INVARIANT: u8 = 3;

#[derive(Parser)]
#[command(name = "agora", about = "Multi-agent market simulation engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the engine: game tick loop, agent sweep, and A2A gateway.
    Serve,
    /// Game tick operations.
    Tick {
        #[command(subcommand)]
        command: TickCommand,
    },
    /// Autonomous agent operations.
    Agents {
        #[command(subcommand)]
        command: AgentsCommand,
    },
    /// Trajectory export for offline training.
    Trajectories {
        #[command(subcommand)]
        command: TrajectoriesCommand,
    },
    /// Market resolution operations.
    Resolve {
        #[command(subcommand)]
        command: ResolveCommand,
    },
    /// Populate a demo world (organizations, NPC pools, markets, agents).
    Seed,
    /// Issue an A2A bearer token for a user.
    Token {
        #[arg(long)]
        user: i64,
    },
}

#[derive(Subcommand)]
enum TickCommand {
    /// Run exactly one tick.
    RunOnce,
    /// Show scheduler phase and the latest tick summary.
    Status,
}

#[derive(Subcommand)]
enum AgentsCommand {
    /// Tick every eligible agent once.
    RunAll,
}

#[derive(Subcommand)]
enum TrajectoriesCommand {
    /// Export one window as JSONL on stdout.
    Export {
        #[arg(long)]
        window: i64,
        /// Resume after this trajectory id (skip the exported prefix).
        #[arg(long)]
        resume_after: Option<String>,
        /// Score the window (and mark training-ready) before exporting.
        #[arg(long, default_value_t = false)]
        score: bool,
    },
}

#[derive(Subcommand)]
enum ResolveCommand {
    /// Sweep matured markets against the oracle.
    Sweep,
    /// Supply an outcome for one market and pay it out.
    SetOutcome {
        #[arg(long)]
        market: i64,
        #[arg(long)]
        outcome: String,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn exit_code_for(e: &anyhow::Error) -> u8 {
    match e.downcast_ref::<EngineError>() {
        Some(err) if err.is_fatal() => EXIT_INVARIANT,
        _ => 1,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "command failed");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let cfg = EngineConfig::from_env();
    let engine = Engine::build_from_env(cfg).context("build engine")?;

    match cli.command {
        Command::Serve => serve(engine).await,
        Command::Tick { command } => match command {
            TickCommand::RunOnce => tick_run_once(&engine).await,
            TickCommand::Status => tick_status(&engine).await,
        },
        Command::Agents {
            command: AgentsCommand::RunAll,
        } => agents_run_all(&engine).await,
        Command::Trajectories {
            command:
                TrajectoriesCommand::Export {
                    window,
                    resume_after,
                    score,
                },
        } => trajectories_export(&engine, window, resume_after.as_deref(), score).await,
        Command::Resolve { command } => match command {
            ResolveCommand::Sweep => resolve_sweep(&engine).await,
            ResolveCommand::SetOutcome { market, outcome } => {
                resolve_set_outcome(&engine, market, &outcome).await
            }
        },
        Command::Seed => seed(&engine).await,
        Command::Token { user } => {
            let record = engine.users.get(user).await?;
            let token = engine
                .a2a
                .auth
                .issue_token(record.id, record.handle.as_deref())?;
            println!("{token}");
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn serve(engine: Engine) -> Result<ExitCode> {
    let port = engine.cfg.port;
    let tick_interval = engine.cfg.tick_interval_ms;

    tokio::spawn(engine.scheduler.clone().run_loop(tick_interval));

    // Agent sweep on the same cadence, offset half an interval so the
    // game tick and the agent fleet do not pile onto the LLM budget at
    // the same instant.
    let coordinator = engine.coordinator.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(tick_interval / 2)).await;
        let mut interval =
            tokio::time::interval(std::time::Duration::from_millis(tick_interval));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            match coordinator.run_all().await {
                Ok(results) => {
                    let succeeded = results.iter().filter(|(_, r)| r.success).count();
                    info!(agents = results.len(), succeeded, "agent sweep complete");
                }
                Err(e) => error!(error = %e, "agent sweep failed"),
            }
        }
    });

    tokio::spawn(run_limiter_cleanup(engine.a2a.limiter.clone()));

    let app = agora_backend::a2a::a2a_router(engine.a2a.clone())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "a2a gateway listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind a2a listener")?;
    axum::serve(listener, app).await.context("serve a2a")?;
    Ok(ExitCode::SUCCESS)
}

async fn tick_run_once(engine: &Engine) -> Result<ExitCode> {
    match engine.scheduler.run_once().await? {
        TickOutcome::Completed(summary) => {
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(ExitCode::SUCCESS)
        }
        TickOutcome::Busy => {
            println!("busy");
            Ok(ExitCode::from(EXIT_BUSY))
        }
    }
}

async fn tick_status(engine: &Engine) -> Result<ExitCode> {
    let status = engine.scheduler.status().await?;
    println!("phase: {}", status.phase);
    if status.halted {
        println!(
            "halted: {}",
            status.halted_reason.as_deref().unwrap_or("unknown")
        );
        return Ok(ExitCode::from(EXIT_INVARIANT));
    }
    match status.last_summary {
        Some(summary) => println!("{}", serde_json::to_string_pretty(&summary)?),
        None => println!("no ticks recorded"),
    }
    Ok(ExitCode::SUCCESS)
}

async fn agents_run_all(engine: &Engine) -> Result<ExitCode> {
    let results = engine.coordinator.run_all().await?;
    for (agent_id, result) in &results {
        println!(
            "agent {agent_id}: {} ({} actions, {}ms)",
            result.method,
            result.actions_executed.total(),
            result.duration_ms
        );
    }
    println!("{} agents ticked", results.len());
    Ok(ExitCode::SUCCESS)
}

async fn trajectories_export(
    engine: &Engine,
    window: i64,
    resume_after: Option<&str>,
    score: bool,
) -> Result<ExitCode> {
    if score {
        let (count, ready) = engine.scorer.score_window(window).await?;
        info!(window, trajectories = count, training_ready = ready, "window scored");
    }
    let lines = engine.exporter.export_window(window, resume_after).await?;
    for line in lines {
        println!("{line}");
    }
    Ok(ExitCode::SUCCESS)
}

async fn resolve_sweep(engine: &Engine) -> Result<ExitCode> {
    let resolved = engine.resolution.sweep(now_ts()).await?;
    engine.verify_ledger_invariants().await?;
    engine.verify_pool_invariants().await?;
    println!("{resolved} markets resolved");
    Ok(ExitCode::SUCCESS)
}

async fn resolve_set_outcome(engine: &Engine, market: i64, outcome: &str) -> Result<ExitCode> {
    let outcome = Outcome::parse(outcome)
        .filter(|o| *o != Outcome::Unresolved)
        .context("outcome must be yes or no")?;
    engine.resolution.resolve_with_outcome(market, outcome).await?;
    engine.verify_ledger_invariants().await?;
    engine.verify_pool_invariants().await?;
    println!("market {market} resolved {}", outcome.as_str());
    Ok(ExitCode::SUCCESS)
}

async fn seed(engine: &Engine) -> Result<ExitCode> {
    use agora_backend::models::BalanceTxKind;

    let orgs = [
        ("ACME", "Acme Corporation", 50.0),
        ("GLOB", "Globex Industries", 120.0),
        ("INIT", "Initech Systems", 18.0),
    ];
    for (ticker, name, price) in orgs {
        engine.orgs.create(ticker, name, price).await?;
    }

    let npcs = [
        ("mm-momentum", "You chase momentum and cut losers fast."),
        ("mm-contrarian", "You fade crowded trades and buy fear."),
        ("mm-macro", "You trade slowly on fundamentals and funding."),
    ];
    for (handle, prompt) in npcs {
        let npc = engine.users.create_npc_actor(handle, prompt).await?;
        engine
            .pools
            .create(npc, &format!("{handle} pool"), 10_000.0, 0.1)
            .await?;
    }

    let now = now_ts();
    engine
        .markets
        .create(
            "Will ACME close above its initial price this week?",
            "markets",
            now + 7 * 86_400,
            100.0,
        )
        .await?;
    engine
        .markets
        .create(
            "Will any pool be liquidated within 30 days?",
            "meta",
            now + 30 * 86_400,
            150.0,
        )
        .await?;

    let manager = engine.users.create_human("operator").await?;
    engine
        .ledger
        .credit(manager, 10_000.0, BalanceTxKind::Deposit, None)
        .await?;

    let agent = engine
        .users
        .create_agent(&NewAgent {
            handle: "agent-alpha".to_string(),
            manager_id: manager,
            system_prompt: "You are a careful trader building a reputation.".to_string(),
            capabilities: AgentCapability::all().to_vec(),
            max_actions_per_tick: 5,
            risk_tolerance: RiskTolerance::Medium,
            planning_horizon: PlanningHorizon::Medium,
            model_tier: ModelTier::Free,
            starting_points: 100,
        })
        .await?;
    engine
        .ledger
        .credit(agent, 1_000.0, BalanceTxKind::Deposit, None)
        .await?;
    engine
        .goals
        .create(
            agent,
            "grow the book",
            &GoalTarget {
                metric: GoalMetric::Pnl,
                value: 1_000.0,
                unit: "cash".to_string(),
            },
            7,
        )
        .await?;

    println!("seeded: 3 organizations, 3 NPC pools, 2 markets, 1 agent (id {agent})");
    Ok(ExitCode::SUCCESS)
}
