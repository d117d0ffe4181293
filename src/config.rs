//! Engine configuration.
//!
//! All knobs are environment-driven with documented defaults. Missing or
//! unparseable values fall back to the default rather than failing startup.

use std::env;

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_path: String,
    pub port: u16,

    // Game tick
    pub tick_interval_ms: u64,
    pub tick_hard_timeout_ms: u64,
    pub n_trades_per_npc: usize,
    pub npc_risk_fraction: f64,

    // LLM
    pub max_concurrent_llm: usize,
    pub llm_timeout_ms: u64,
    pub llm_model: String,
    pub llm_api_key: Option<String>,
    pub llm_base_url: String,
    pub llm_temperature: f64,
    pub llm_max_tokens: u32,

    // Markets
    pub default_liquidity_b: f64,
    pub maintenance_margin: f64,
    pub synthetic_supply: f64,
    pub funding_rate_k: f64,
    pub funding_interval_sec: i64,
    pub price_tolerance: f64,

    // Autonomous agents
    pub agent_tick_cost_free: i64,
    pub agent_tick_cost_pro: i64,
    pub provider_timeout_ms: u64,
    pub runtime_cache_cap: usize,

    // Oracle
    pub oracle_url: Option<String>,
    pub oracle_timeout_ms: u64,

    // A2A gateway
    pub rate_limit_rpm: u32,
    pub rate_limit_burst: u32,
    pub a2a_jwt_secret: String,

    // Trajectories
    pub trajectory_min_agents_per_window: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: "./agora.db".to_string(),
            port: 8080,

            tick_interval_ms: 60_000,
            tick_hard_timeout_ms: 180_000,
            n_trades_per_npc: 3,
            npc_risk_fraction: 0.25,

            max_concurrent_llm: 8,
            llm_timeout_ms: 10_000,
            llm_model: "anthropic/claude-sonnet".to_string(),
            llm_api_key: None,
            llm_base_url: "https://openrouter.ai/api/v1".to_string(),
            llm_temperature: 0.2,
            llm_max_tokens: 1024,

            default_liquidity_b: 100.0,
            maintenance_margin: 0.005,
            synthetic_supply: 10_000.0,
            funding_rate_k: 0.0001,
            funding_interval_sec: 3600,
            price_tolerance: 0.05,

            agent_tick_cost_free: 1,
            agent_tick_cost_pro: 5,
            provider_timeout_ms: 2_000,
            runtime_cache_cap: 256,

            oracle_url: None,
            oracle_timeout_ms: 15_000,

            rate_limit_rpm: 60,
            rate_limit_burst: 10,
            a2a_jwt_secret: "dev-secret-change-me".to_string(),

            trajectory_min_agents_per_window: 3,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        let d = Self::default();

        Self {
            database_path: env_string("DATABASE_PATH", &d.database_path),
            port: env_u32("PORT", d.port as u32) as u16,

            tick_interval_ms: env_u64("TICK_INTERVAL_MS", d.tick_interval_ms),
            tick_hard_timeout_ms: env_u64(
                "TICK_HARD_TIMEOUT_MS",
                env_u64("TICK_INTERVAL_MS", d.tick_interval_ms) * 3,
            ),
            n_trades_per_npc: env_usize("N_TRADES_PER_NPC", d.n_trades_per_npc),
            npc_risk_fraction: env_f64("NPC_RISK_FRACTION", d.npc_risk_fraction),

            max_concurrent_llm: env_usize("MAX_CONCURRENT_LLM", d.max_concurrent_llm).max(1),
            llm_timeout_ms: env_u64("LLM_TIMEOUT_MS", d.llm_timeout_ms),
            llm_model: env_string("LLM_MODEL", &d.llm_model),
            llm_api_key: env::var("LLM_API_KEY").ok().filter(|s| !s.trim().is_empty()),
            llm_base_url: env_string("LLM_BASE_URL", &d.llm_base_url),
            llm_temperature: env_f64("LLM_TEMPERATURE", d.llm_temperature),
            llm_max_tokens: env_u32("LLM_MAX_TOKENS", d.llm_max_tokens),

            default_liquidity_b: env_f64("DEFAULT_LIQUIDITY_B", d.default_liquidity_b),
            maintenance_margin: env_f64("MAINTENANCE_MARGIN", d.maintenance_margin),
            synthetic_supply: env_f64("SYNTHETIC_SUPPLY", d.synthetic_supply),
            funding_rate_k: env_f64("FUNDING_RATE_K", d.funding_rate_k),
            funding_interval_sec: env_u64("FUNDING_INTERVAL_SEC", d.funding_interval_sec as u64)
                as i64,
            price_tolerance: env_f64("PRICE_TOLERANCE", d.price_tolerance),

            agent_tick_cost_free: env_u64("AGENT_TICK_COST_FREE", d.agent_tick_cost_free as u64)
                as i64,
            agent_tick_cost_pro: env_u64("AGENT_TICK_COST_PRO", d.agent_tick_cost_pro as u64)
                as i64,
            provider_timeout_ms: env_u64("PROVIDER_TIMEOUT_MS", d.provider_timeout_ms),
            runtime_cache_cap: env_usize("RUNTIME_CACHE_CAP", d.runtime_cache_cap).max(1),

            oracle_url: env::var("ORACLE_URL").ok().filter(|s| !s.trim().is_empty()),
            oracle_timeout_ms: env_u64("ORACLE_TIMEOUT_MS", d.oracle_timeout_ms),

            rate_limit_rpm: env_u32("RATE_LIMIT_RPM", d.rate_limit_rpm),
            rate_limit_burst: env_u32("RATE_LIMIT_BURST", d.rate_limit_burst),
            a2a_jwt_secret: env_string("A2A_JWT_SECRET", &d.a2a_jwt_secret),

            trajectory_min_agents_per_window: env_usize(
                "TRAJECTORY_MIN_AGENTS_PER_WINDOW",
                d.trajectory_min_agents_per_window,
            ),
        }
    }
}
