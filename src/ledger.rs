//! Ledgered balance store.
//!
//! Every balance mutation writes the new `users.virtual_balance` and an
//! append-only `balance_transactions` row in the same sqlite transaction.
//! The running sum of a user's transactions always equals the stored
//! balance; `verify_user` replays the log to check.

use rusqlite::{params, Connection};
use tracing::debug;

use crate::db::Db;
use crate::error::{EngineError, EngineResult};
use crate::models::{now_ts, BalanceTransaction, BalanceTxKind};

/// Low-level ledger application. Runs against the caller's connection so
/// it composes into larger transactions (trade open/close, payouts).
///
/// Rules:
/// - `amount` is signed and never zero, except `perp_liquidation` which may
///   record zero (margin fully consumed).
/// - No mutation leaves the balance negative. Non-liquidation debits that
///   would go negative fail with `InsufficientFunds`; a liquidation debit
///   is clamped so it drives the balance to exactly zero.
/// - Banned users cannot transact.
pub(crate) fn apply_tx(
    conn: &Connection,
    user_id: i64,
    kind: BalanceTxKind,
    amount: f64,
    related_id: Option<&str>,
) -> EngineResult<BalanceTransaction> {
    if !amount.is_finite() {
        return Err(EngineError::InvariantViolation(format!(
            "ledger amount not finite for user {user_id}"
        )));
    }
    if amount == 0.0 && kind != BalanceTxKind::PerpLiquidation {
        return Err(EngineError::InvariantViolation(format!(
            "zero-amount ledger entry of kind {} for user {user_id}",
            kind.as_str()
        )));
    }

    let (balance_before, is_banned): (f64, bool) = conn
        .query_row(
            "SELECT virtual_balance, is_banned FROM users WHERE id = ?1",
            params![user_id],
            |row| Ok((row.get(0)?, row.get::<_, i64>(1)? != 0)),
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                EngineError::NotFound(format!("user {user_id}"))
            }
            other => other.into(),
        })?;

    if is_banned {
        return Err(EngineError::UserBanned(user_id));
    }

    let mut amount = amount;
    let mut balance_after = balance_before + amount;
    if balance_after < 0.0 {
        if kind == BalanceTxKind::PerpLiquidation {
            // Liquidation may consume everything, but never more.
            amount = -balance_before;
            balance_after = 0.0;
        } else {
            return Err(EngineError::InsufficientFunds {
                needed: -amount,
                available: balance_before,
            });
        }
    }

    let created_at = now_ts();
    conn.execute(
        "INSERT INTO balance_transactions \
         (user_id, kind, amount, balance_before, balance_after, related_id, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            user_id,
            kind.as_str(),
            amount,
            balance_before,
            balance_after,
            related_id,
            created_at,
        ],
    )?;
    let tx_id = conn.last_insert_rowid();

    conn.execute(
        "UPDATE users SET virtual_balance = ?1 WHERE id = ?2",
        params![balance_after, user_id],
    )?;

    debug!(
        user_id,
        kind = kind.as_str(),
        amount,
        balance_after,
        "ledger entry"
    );

    Ok(BalanceTransaction {
        id: tx_id,
        user_id,
        kind,
        amount,
        balance_before,
        balance_after,
        related_id: related_id.map(|s| s.to_string()),
        created_at,
    })
}

fn row_to_tx(row: &rusqlite::Row<'_>) -> rusqlite::Result<BalanceTransaction> {
    let kind_str: String = row.get(2)?;
    Ok(BalanceTransaction {
        id: row.get(0)?,
        user_id: row.get(1)?,
        kind: BalanceTxKind::parse(&kind_str).unwrap_or(BalanceTxKind::PointsAward),
        amount: row.get(3)?,
        balance_before: row.get(4)?,
        balance_after: row.get(5)?,
        related_id: row.get(6)?,
        created_at: row.get(7)?,
    })
}

#[derive(Clone)]
pub struct Ledger {
    db: Db,
}

impl Ledger {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Credit `amount` (> 0) to the user.
    pub async fn credit(
        &self,
        user_id: i64,
        amount: f64,
        kind: BalanceTxKind,
        related_id: Option<&str>,
    ) -> EngineResult<BalanceTransaction> {
        if amount <= 0.0 {
            return Err(EngineError::InvariantViolation(format!(
                "credit amount must be positive, got {amount}"
            )));
        }
        let conn = self.db.lock().await;
        let tx = conn.unchecked_transaction()?;
        let entry = apply_tx(&tx, user_id, kind, amount, related_id)?;
        tx.commit()?;
        Ok(entry)
    }

    /// Debit `amount` (> 0) from the user.
    pub async fn debit(
        &self,
        user_id: i64,
        amount: f64,
        kind: BalanceTxKind,
        related_id: Option<&str>,
    ) -> EngineResult<BalanceTransaction> {
        if amount <= 0.0 {
            return Err(EngineError::InvariantViolation(format!(
                "debit amount must be positive, got {amount}"
            )));
        }
        let conn = self.db.lock().await;
        let tx = conn.unchecked_transaction()?;
        let entry = apply_tx(&tx, user_id, kind, -amount, related_id)?;
        tx.commit()?;
        Ok(entry)
    }

    pub async fn balance(&self, user_id: i64) -> EngineResult<f64> {
        let conn = self.db.lock().await;
        conn.query_row(
            "SELECT virtual_balance FROM users WHERE id = ?1",
            params![user_id],
            |row| row.get(0),
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                EngineError::NotFound(format!("user {user_id}"))
            }
            other => other.into(),
        })
    }

    /// Most recent transactions, newest first.
    pub async fn history(
        &self,
        user_id: i64,
        limit: usize,
    ) -> EngineResult<Vec<BalanceTransaction>> {
        let limit = limit.clamp(1, 10_000) as i64;
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, user_id, kind, amount, balance_before, balance_after, related_id, created_at \
             FROM balance_transactions WHERE user_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![user_id, limit], row_to_tx)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r.map_err(EngineError::from)?);
        }
        Ok(out)
    }

    /// Replay the transaction log and compare against the stored balance.
    /// A mismatch is an `InvariantViolation` and halts the engine.
    pub async fn verify_user(&self, user_id: i64) -> EngineResult<()> {
        let conn = self.db.lock().await;
        let stored: f64 = conn
            .query_row(
                "SELECT virtual_balance FROM users WHERE id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    EngineError::NotFound(format!("user {user_id}"))
                }
                other => other.into(),
            })?;
        let summed: f64 = conn.query_row(
            "SELECT COALESCE(SUM(amount), 0) FROM balance_transactions WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;

        if (stored - summed).abs() > 1e-6 {
            return Err(EngineError::InvariantViolation(format!(
                "user {user_id}: stored balance {stored} != ledger sum {summed}"
            )));
        }
        Ok(())
    }

    /// Award to a named points sub-account. Point awards do not touch the
    /// cash balance; agent points are what autonomous ticks bill against.
    pub async fn award_points(
        &self,
        user_id: i64,
        sub_account: PointsAccount,
        delta: i64,
    ) -> EngineResult<i64> {
        if delta == 0 {
            return Err(EngineError::InvariantViolation(
                "zero-delta points award".to_string(),
            ));
        }
        let column = sub_account.column();
        let conn = self.db.lock().await;
        let updated = conn.execute(
            &format!(
                "UPDATE users SET {column} = {column} + ?1 \
                 WHERE id = ?2 AND {column} + ?1 >= 0 AND is_banned = 0"
            ),
            params![delta, user_id],
        )?;
        if updated == 0 {
            let exists: bool = conn
                .query_row(
                    "SELECT is_banned FROM users WHERE id = ?1",
                    params![user_id],
                    |row| row.get::<_, i64>(0),
                )
                .map(|b| b == 0)
                .unwrap_or(false);
            return Err(if exists {
                EngineError::InsufficientFunds {
                    needed: -delta as f64,
                    available: 0.0,
                }
            } else {
                EngineError::NotFound(format!("user {user_id}"))
            });
        }
        let new_value: i64 = conn.query_row(
            &format!("SELECT {column} FROM users WHERE id = ?1"),
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(new_value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointsAccount {
    Earned,
    Invite,
    Bonus,
    Agent,
}

impl PointsAccount {
    fn column(&self) -> &'static str {
        match self {
            PointsAccount::Earned => "earned_points",
            PointsAccount::Invite => "invite_points",
            PointsAccount::Bonus => "bonus_points",
            PointsAccount::Agent => "agent_points",
        }
    }
}
