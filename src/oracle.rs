//! Outcome oracle client.
//!
//! Resolution commits a market's question to the oracle, later reveals the
//! outcome, and polls until the oracle reports it revealed. The engine
//! only ever consults the oracle for commit/reveal; trades never touch it.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{EngineError, EngineResult};
use crate::models::Outcome;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitReceipt {
    pub session_id: String,
    pub tx_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleOutcome {
    pub revealed: bool,
    pub outcome: Outcome,
}

#[async_trait]
pub trait OracleClient: Send + Sync {
    async fn commit(
        &self,
        question_id: i64,
        question_text: &str,
        scenario_tag: &str,
    ) -> EngineResult<CommitReceipt>;

    async fn reveal(&self, session_id: &str, outcome: Outcome) -> EngineResult<()>;

    async fn get_outcome(&self, session_id: &str) -> EngineResult<OracleOutcome>;
}

/// HTTP oracle client.
#[derive(Clone)]
pub struct HttpOracleClient {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpOracleClient {
    pub fn new(http: reqwest::Client, base_url: String, timeout: Duration) -> Self {
        Self {
            http,
            base_url,
            timeout,
        }
    }
}

#[derive(Serialize)]
struct CommitRequest<'a> {
    question_id: i64,
    question_text: &'a str,
    scenario_tag: &'a str,
}

#[derive(Serialize)]
struct RevealRequest<'a> {
    session_id: &'a str,
    outcome: &'a str,
}

#[derive(Deserialize)]
struct OutcomeResponse {
    revealed: bool,
    outcome: Option<String>,
}

#[async_trait]
impl OracleClient for HttpOracleClient {
    async fn commit(
        &self,
        question_id: i64,
        question_text: &str,
        scenario_tag: &str,
    ) -> EngineResult<CommitReceipt> {
        let url = format!("{}/commit", self.base_url.trim_end_matches('/'));
        let resp = self
            .http
            .post(&url)
            .timeout(self.timeout)
            .json(&CommitRequest {
                question_id,
                question_text,
                scenario_tag,
            })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EngineError::Timeout(self.timeout.as_millis() as u64)
                } else {
                    EngineError::Oracle(e.to_string())
                }
            })?;
        if !resp.status().is_success() {
            return Err(EngineError::Oracle(format!("commit: {}", resp.status())));
        }
        resp.json::<CommitReceipt>()
            .await
            .map_err(|e| EngineError::Oracle(e.to_string()))
    }

    async fn reveal(&self, session_id: &str, outcome: Outcome) -> EngineResult<()> {
        let url = format!("{}/reveal", self.base_url.trim_end_matches('/'));
        let resp = self
            .http
            .post(&url)
            .timeout(self.timeout)
            .json(&RevealRequest {
                session_id,
                outcome: outcome.as_str(),
            })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EngineError::Timeout(self.timeout.as_millis() as u64)
                } else {
                    EngineError::Oracle(e.to_string())
                }
            })?;
        if !resp.status().is_success() {
            return Err(EngineError::Oracle(format!("reveal: {}", resp.status())));
        }
        Ok(())
    }

    async fn get_outcome(&self, session_id: &str) -> EngineResult<OracleOutcome> {
        let url = format!(
            "{}/outcome/{session_id}",
            self.base_url.trim_end_matches('/')
        );
        let resp = self
            .http
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EngineError::Timeout(self.timeout.as_millis() as u64)
                } else {
                    EngineError::Oracle(e.to_string())
                }
            })?;
        if !resp.status().is_success() {
            return Err(EngineError::Oracle(format!("outcome: {}", resp.status())));
        }
        let body: OutcomeResponse = resp
            .json()
            .await
            .map_err(|e| EngineError::Oracle(e.to_string()))?;
        Ok(OracleOutcome {
            revealed: body.revealed,
            outcome: body
                .outcome
                .as_deref()
                .and_then(Outcome::parse)
                .unwrap_or(Outcome::Unresolved),
        })
    }
}

/// In-process oracle for local runs and tests. Sessions are committed
/// unrevealed and flip to revealed when `reveal` is called.
#[derive(Default)]
pub struct LocalOracle {
    sessions: Mutex<HashMap<String, OracleOutcome>>,
    next_id: Mutex<u64>,
}

impl LocalOracle {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OracleClient for LocalOracle {
    async fn commit(
        &self,
        question_id: i64,
        _question_text: &str,
        scenario_tag: &str,
    ) -> EngineResult<CommitReceipt> {
        let mut next = self.next_id.lock();
        *next += 1;
        let session_id = format!("local-{scenario_tag}-{question_id}-{}", *next);
        self.sessions.lock().insert(
            session_id.clone(),
            OracleOutcome {
                revealed: false,
                outcome: Outcome::Unresolved,
            },
        );
        Ok(CommitReceipt {
            session_id,
            tx_hash: None,
        })
    }

    async fn reveal(&self, session_id: &str, outcome: Outcome) -> EngineResult<()> {
        let mut sessions = self.sessions.lock();
        let entry = sessions
            .get_mut(session_id)
            .ok_or_else(|| EngineError::NotFound(format!("oracle session {session_id}")))?;
        entry.revealed = true;
        entry.outcome = outcome;
        Ok(())
    }

    async fn get_outcome(&self, session_id: &str) -> EngineResult<OracleOutcome> {
        self.sessions
            .lock()
            .get(session_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("oracle session {session_id}")))
    }
}
