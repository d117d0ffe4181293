//! Database handle and schema.
//!
//! One sqlite connection behind an async mutex. Components hold a cloned
//! `Db` and serialize their writes through the lock; multi-row atomicity
//! uses `unchecked_transaction` under a single lock hold, which is what
//! gives the ledger/position coupling its all-or-nothing guarantee.

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open engine db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory db")?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            handle TEXT,
            is_agent INTEGER NOT NULL DEFAULT 0,
            is_npc_actor INTEGER NOT NULL DEFAULT 0,
            is_admin INTEGER NOT NULL DEFAULT 0,
            is_banned INTEGER NOT NULL DEFAULT 0,
            is_active INTEGER NOT NULL DEFAULT 1,
            virtual_balance REAL NOT NULL DEFAULT 0,
            earned_points INTEGER NOT NULL DEFAULT 0,
            invite_points INTEGER NOT NULL DEFAULT 0,
            bonus_points INTEGER NOT NULL DEFAULT 0,
            agent_points INTEGER NOT NULL DEFAULT 0,
            manager_id INTEGER,
            system_prompt TEXT,
            capabilities TEXT NOT NULL DEFAULT '[]',
            max_actions_per_tick INTEGER NOT NULL DEFAULT 5,
            risk_tolerance TEXT NOT NULL DEFAULT 'medium',
            planning_horizon TEXT NOT NULL DEFAULT 'medium',
            model_tier TEXT NOT NULL DEFAULT 'free',
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS balance_transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            kind TEXT NOT NULL,
            amount REAL NOT NULL,
            balance_before REAL NOT NULL,
            balance_after REAL NOT NULL,
            related_id TEXT,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_balance_tx_user_kind
            ON balance_transactions(user_id, kind);
        CREATE INDEX IF NOT EXISTS idx_balance_tx_user_ts
            ON balance_transactions(user_id, created_at DESC);

        CREATE TABLE IF NOT EXISTS prediction_markets (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            prompt TEXT NOT NULL,
            category TEXT NOT NULL DEFAULT 'general',
            resolution_time INTEGER NOT NULL,
            resolved INTEGER NOT NULL DEFAULT 0,
            outcome TEXT NOT NULL DEFAULT 'unresolved',
            b REAL NOT NULL,
            q_yes REAL NOT NULL DEFAULT 0,
            q_no REAL NOT NULL DEFAULT 0,
            escrow REAL NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_prediction_markets_resolved
            ON prediction_markets(resolved, resolution_time);

        CREATE TABLE IF NOT EXISTS prediction_positions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            market_id INTEGER NOT NULL,
            side TEXT NOT NULL,
            shares REAL NOT NULL DEFAULT 0,
            avg_price REAL NOT NULL DEFAULT 0,
            opened_at INTEGER NOT NULL,
            closed_at INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_prediction_positions_market
            ON prediction_positions(market_id, closed_at);
        CREATE INDEX IF NOT EXISTS idx_prediction_positions_user
            ON prediction_positions(user_id, closed_at);

        CREATE TABLE IF NOT EXISTS perp_positions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            ticker TEXT NOT NULL,
            side TEXT NOT NULL,
            size REAL NOT NULL,
            leverage REAL NOT NULL,
            entry_price REAL NOT NULL,
            liquidation_price REAL NOT NULL,
            funding_paid REAL NOT NULL DEFAULT 0,
            opened_at INTEGER NOT NULL,
            closed_at INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_perp_positions_ticker_open
            ON perp_positions(ticker, closed_at);
        CREATE INDEX IF NOT EXISTS idx_perp_positions_user_open
            ON perp_positions(user_id, closed_at);

        CREATE TABLE IF NOT EXISTS organizations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ticker TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            initial_price REAL NOT NULL,
            current_price REAL NOT NULL,
            funding_rate REAL NOT NULL DEFAULT 0,
            last_funding_at INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS pools (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            npc_user_id INTEGER NOT NULL UNIQUE,
            name TEXT NOT NULL,
            total_value REAL NOT NULL DEFAULT 0,
            available_balance REAL NOT NULL DEFAULT 0,
            lifetime_pnl REAL NOT NULL DEFAULT 0,
            performance_fee_rate REAL NOT NULL DEFAULT 0.1,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS pool_positions (
            pool_id INTEGER NOT NULL,
            position_kind TEXT NOT NULL,
            position_id INTEGER NOT NULL,
            PRIMARY KEY (pool_id, position_kind, position_id)
        );

        CREATE TABLE IF NOT EXISTS price_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ticker TEXT NOT NULL,
            price REAL NOT NULL,
            tick_no INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_price_history_ticker_ts
            ON price_history(ticker, created_at DESC);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_price_history_ticker_tick
            ON price_history(ticker, tick_no);

        CREATE TABLE IF NOT EXISTS tick_summaries (
            tick_no INTEGER PRIMARY KEY,
            started_at INTEGER NOT NULL,
            finished_at INTEGER NOT NULL,
            npcs_decided INTEGER NOT NULL,
            trades_attempted INTEGER NOT NULL,
            trades_succeeded INTEGER NOT NULL,
            markets_resolved INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS engine_state (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            tick_in_progress INTEGER NOT NULL DEFAULT 0,
            fencing_token INTEGER NOT NULL DEFAULT 0,
            tick_started_at INTEGER NOT NULL DEFAULT 0,
            tick_no INTEGER NOT NULL DEFAULT 0,
            halted INTEGER NOT NULL DEFAULT 0,
            halted_reason TEXT
        );
        INSERT OR IGNORE INTO engine_state (id) VALUES (1);

        CREATE TABLE IF NOT EXISTS oracle_sessions (
            market_id INTEGER PRIMARY KEY,
            session_id TEXT NOT NULL,
            tx_hash TEXT,
            committed_at INTEGER NOT NULL,
            revealed INTEGER NOT NULL DEFAULT 0,
            outcome TEXT
        );

        CREATE TABLE IF NOT EXISTS resolution_payouts (
            market_id INTEGER NOT NULL,
            position_id INTEGER NOT NULL,
            amount REAL NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (market_id, position_id)
        );

        CREATE TABLE IF NOT EXISTS goals (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            agent_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            target TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 5,
            status TEXT NOT NULL DEFAULT 'active',
            progress REAL NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            completed_at INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_goals_agent_status
            ON goals(agent_id, status);

        CREATE TABLE IF NOT EXISTS experiences (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            agent_id INTEGER NOT NULL,
            kind TEXT NOT NULL,
            content TEXT NOT NULL,
            importance REAL NOT NULL DEFAULT 0.5,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_experiences_agent_ts
            ON experiences(agent_id, created_at DESC);

        CREATE TABLE IF NOT EXISTS trajectories (
            id TEXT PRIMARY KEY,
            agent_id INTEGER NOT NULL,
            scenario_id TEXT,
            window_id INTEGER NOT NULL,
            steps TEXT NOT NULL DEFAULT '[]',
            metadata TEXT,
            episode_length INTEGER NOT NULL DEFAULT 0,
            total_reward REAL NOT NULL DEFAULT 0,
            final_status TEXT NOT NULL DEFAULT 'open',
            training_ready INTEGER NOT NULL DEFAULT 0,
            started_at INTEGER NOT NULL,
            ended_at INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_trajectories_agent_ts
            ON trajectories(agent_id, started_at DESC);
        CREATE INDEX IF NOT EXISTS idx_trajectories_window
            ON trajectories(window_id);

        CREATE TABLE IF NOT EXISTS llm_call_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            trajectory_id TEXT,
            agent_id INTEGER,
            model TEXT NOT NULL,
            system_prompt TEXT NOT NULL,
            user_prompt TEXT NOT NULL,
            response TEXT NOT NULL,
            reasoning TEXT,
            temperature REAL,
            max_tokens INTEGER,
            latency_ms INTEGER NOT NULL,
            purpose TEXT NOT NULL,
            action_type TEXT,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_llm_call_log_trajectory
            ON llm_call_log(trajectory_id);

        CREATE TABLE IF NOT EXISTS posts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            author_id INTEGER NOT NULL,
            body TEXT NOT NULL,
            reply_to INTEGER,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_posts_ts ON posts(created_at DESC);
        CREATE INDEX IF NOT EXISTS idx_posts_author ON posts(author_id, created_at DESC);

        CREATE TABLE IF NOT EXISTS chat_messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            sender_id INTEGER NOT NULL,
            recipient_id INTEGER,
            body TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_chat_messages_ts
            ON chat_messages(recipient_id, created_at DESC);

        CREATE TABLE IF NOT EXISTS moderation_actions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            actor_id INTEGER NOT NULL,
            kind TEXT NOT NULL,
            target_user_id INTEGER,
            target_post_id INTEGER,
            reason TEXT,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_moderation_actor
            ON moderation_actions(actor_id, kind);

        CREATE TABLE IF NOT EXISTS incidents (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            detail TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );
        ",
    )
    .context("init schema")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_initializes_and_is_idempotent() {
        let db = Db::open_in_memory().unwrap();
        {
            let conn = db.lock().await;
            init_schema(&conn).unwrap();
            let n: i64 = conn
                .query_row("SELECT COUNT(*) FROM engine_state", [], |r| r.get(0))
                .unwrap();
            assert_eq!(n, 1);
        }
    }
}
