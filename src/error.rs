//! Engine error taxonomy.
//!
//! Every error that crosses a component boundary carries a `kind` that
//! callers can match on. Kinds are never wrapped away: storage helpers and
//! service layers return `EngineError` verbatim, and the A2A gateway maps
//! `kind_code()` into `error.data.code` on the wire.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// A stored fact contradicts an engine invariant. Fatal: the engine
    /// halts, writes an incident, and refuses further ticks.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// A concurrent write lost a race. Retryable up to 3 times with
    /// exponential backoff.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("insufficient funds: need {needed:.2}, have {available:.2}")]
    InsufficientFunds { needed: f64, available: f64 },

    #[error("market {0} is closed")]
    MarketClosed(i64),

    #[error("position not found: {0}")]
    PositionNotFound(String),

    #[error("leverage {0} out of range [1, 100]")]
    LeverageOutOfRange(f64),

    /// Quoted price moved beyond the protection tolerance since the
    /// decision was made. Stale intents are dropped, never retried.
    #[error("stale price on {instrument}: expected {expected:.4}, got {actual:.4}")]
    StalePrice {
        instrument: String,
        expected: f64,
        actual: f64,
    },

    /// An external dependency (LLM, oracle, provider) did not answer in
    /// time. Recovered locally with the component's documented default.
    #[error("timeout after {0}ms")]
    Timeout(u64),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("user {0} is banned")]
    UserBanned(i64),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("llm provider error: {0}")]
    Llm(String),

    #[error("oracle error: {0}")]
    Oracle(String),
}

impl EngineError {
    /// Stable machine-readable code, surfaced in A2A `error.data.code`.
    pub fn kind_code(&self) -> &'static str {
        match self {
            EngineError::InvariantViolation(_) => "invariant_violation",
            EngineError::Conflict(_) => "conflict",
            EngineError::InsufficientFunds { .. } => "insufficient_funds",
            EngineError::MarketClosed(_) => "market_closed",
            EngineError::PositionNotFound(_) => "position_not_found",
            EngineError::LeverageOutOfRange(_) => "leverage_out_of_range",
            EngineError::StalePrice { .. } => "stale_price",
            EngineError::Timeout(_) => "timeout",
            EngineError::NotFound(_) => "not_found",
            EngineError::UserBanned(_) => "user_banned",
            EngineError::Unauthorized(_) => "unauthorized",
            EngineError::RateLimited { .. } => "rate_limited",
            EngineError::Storage(_) => "storage",
            EngineError::Llm(_) => "llm",
            EngineError::Oracle(_) => "oracle",
        }
    }

    /// Fatal errors halt the engine instead of being reported per intent.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::InvariantViolation(_))
    }

    /// Retryable errors get up to 3 attempts with exponential backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Conflict(_))
    }

    /// JSON-RPC error code for the A2A surface.
    pub fn jsonrpc_code(&self) -> i64 {
        match self {
            EngineError::NotFound(_) => -32004,
            EngineError::Unauthorized(_) => -32001,
            EngineError::RateLimited { .. } => -32005,
            EngineError::InvariantViolation(_) | EngineError::Storage(_) => -32603,
            _ => -32000,
        }
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::QueryReturnedNoRows => {
                EngineError::NotFound("row not found".to_string())
            }
            rusqlite::Error::SqliteFailure(code, msg)
                if code.code == rusqlite::ErrorCode::DatabaseBusy
                    || code.code == rusqlite::ErrorCode::DatabaseLocked =>
            {
                EngineError::Conflict(msg.unwrap_or_else(|| "database busy".to_string()))
            }
            other => EngineError::Storage(other.to_string()),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_codes_are_stable() {
        assert_eq!(
            EngineError::InsufficientFunds {
                needed: 10.0,
                available: 5.0
            }
            .kind_code(),
            "insufficient_funds"
        );
        assert_eq!(EngineError::MarketClosed(7).kind_code(), "market_closed");
        assert_eq!(
            EngineError::RateLimited {
                retry_after_secs: 30
            }
            .jsonrpc_code(),
            -32005
        );
    }

    #[test]
    fn only_invariant_violation_is_fatal() {
        assert!(EngineError::InvariantViolation("balance drift".into()).is_fatal());
        assert!(!EngineError::Timeout(10_000).is_fatal());
        assert!(EngineError::Conflict("row version".into()).is_retryable());
    }
}
