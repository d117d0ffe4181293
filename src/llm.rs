//! LLM provider client.
//!
//! One capability: `generate_json(request) -> value`. The caller supplies
//! the expectations in the prompt and validates the parsed value; the
//! client's job is transport, timing, and digging the JSON out of the
//! completion text. Provider failures and timeouts surface as typed
//! errors that callers recover from with their documented default
//! (hold / empty context) — a flaky provider never aborts a tick.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct LlmJsonResponse {
    pub value: serde_json::Value,
    pub raw_content: String,
    pub model: String,
    pub latency_ms: u64,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn generate_json(&self, req: &LlmRequest) -> EngineResult<LlmJsonResponse>;
}

/// Extract the first JSON value embedded in completion text. Models often
/// wrap output in code fences or prose; scan for the first balanced
/// object or array.
pub fn extract_json(content: &str) -> Option<serde_json::Value> {
    let trimmed = content.trim();
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(trimmed) {
        return Some(v);
    }

    let start = trimmed.find(|c| c == '{' || c == '[')?;
    let opener = trimmed.as_bytes()[start] as char;
    let closer = if opener == '{' { '}' } else { ']' };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in trimmed[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            c if c == opener => depth += 1,
            c if c == closer => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &trimmed[start..start + i + c.len_utf8()];
                    return serde_json::from_str(candidate).ok();
                }
            }
            _ => {}
        }
    }
    None
}

/// OpenRouter-compatible chat-completions client.
#[derive(Clone)]
pub struct HttpLlmClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpLlmClient {
    pub fn new(http: reqwest::Client, base_url: String, api_key: String) -> Self {
        Self {
            http,
            base_url,
            api_key,
        }
    }

    pub fn from_config(cfg: &crate::config::EngineConfig) -> EngineResult<Self> {
        let api_key = cfg
            .llm_api_key
            .clone()
            .ok_or_else(|| EngineError::Llm("LLM_API_KEY missing".to_string()))?;
        Ok(Self::new(
            reqwest::Client::new(),
            cfg.llm_base_url.clone(),
            api_key,
        ))
    }
}

#[async_trait]
impl LlmProvider for HttpLlmClient {
    async fn generate_json(&self, req: &LlmRequest) -> EngineResult<LlmJsonResponse> {
        let start = Instant::now();

        let body = ChatCompletionRequest {
            model: req.model.clone(),
            messages: vec![
                ChatWireMessage {
                    role: "system".to_string(),
                    content: req.system_prompt.clone(),
                },
                ChatWireMessage {
                    role: "user".to_string(),
                    content: req.user_prompt.clone(),
                },
            ],
            temperature: Some(req.temperature),
            max_tokens: Some(req.max_tokens),
        };

        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let send = self
            .http
            .post(&url)
            .timeout(req.timeout)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send();

        let resp = match send.await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return Err(EngineError::Timeout(req.timeout.as_millis() as u64))
            }
            Err(e) => return Err(EngineError::Llm(e.to_string())),
        };

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            let snippet: String = text.chars().take(500).collect();
            return Err(EngineError::Llm(format!("{}: {}", status.as_u16(), snippet)));
        }

        let parsed: ChatCompletionResponse =
            serde_json::from_str(&text).map_err(|e| EngineError::Llm(e.to_string()))?;
        let content = parsed
            .choices
            .first()
            .and_then(|c| c.message.as_ref())
            .map(|m| m.content.clone())
            .unwrap_or_default();

        let value = extract_json(&content)
            .ok_or_else(|| EngineError::Llm("no JSON in completion".to_string()))?;

        Ok(LlmJsonResponse {
            value,
            raw_content: content,
            model: req.model.clone(),
            latency_ms: start.elapsed().as_millis() as u64,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatWireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
struct ChatWireMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatChoice {
    message: Option<ChatMessageOut>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatMessageOut {
    content: String,
}

/// Provider used when no API key is configured: every call returns an
/// empty plan, so NPCs hold and agents do nothing.
pub struct NullLlm;

#[async_trait]
impl LlmProvider for NullLlm {
    async fn generate_json(&self, req: &LlmRequest) -> EngineResult<LlmJsonResponse> {
        Ok(LlmJsonResponse {
            value: serde_json::json!([]),
            raw_content: "[]".to_string(),
            model: req.model.clone(),
            latency_ms: 0,
        })
    }
}

/// Deterministic provider for tests: pops canned values in order, or
/// fails/hangs on demand.
pub mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    pub enum MockReply {
        Value(serde_json::Value),
        Error(String),
        TimeoutAfter(Duration),
    }

    #[derive(Default)]
    pub struct MockLlm {
        replies: Mutex<VecDeque<MockReply>>,
        pub calls: Mutex<Vec<LlmRequest>>,
    }

    impl MockLlm {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push(&self, reply: MockReply) {
            self.replies.lock().push_back(reply);
        }

        pub fn push_value(&self, value: serde_json::Value) {
            self.push(MockReply::Value(value));
        }
    }

    #[async_trait]
    impl LlmProvider for MockLlm {
        async fn generate_json(&self, req: &LlmRequest) -> EngineResult<LlmJsonResponse> {
            self.calls.lock().push(req.clone());
            let reply = self.replies.lock().pop_front();
            match reply {
                Some(MockReply::Value(value)) => Ok(LlmJsonResponse {
                    raw_content: value.to_string(),
                    value,
                    model: req.model.clone(),
                    latency_ms: 1,
                }),
                Some(MockReply::Error(msg)) => Err(EngineError::Llm(msg)),
                Some(MockReply::TimeoutAfter(d)) => {
                    tokio::time::sleep(d).await;
                    Err(EngineError::Timeout(d.as_millis() as u64))
                }
                None => Ok(LlmJsonResponse {
                    value: serde_json::json!([]),
                    raw_content: "[]".to_string(),
                    model: req.model.clone(),
                    latency_ms: 1,
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_bare_json() {
        let v = extract_json(r#"{"action": "hold"}"#).unwrap();
        assert_eq!(v["action"], "hold");
    }

    #[test]
    fn extracts_fenced_json_array() {
        let content = "Here are my trades:\n```json\n[{\"action\":\"buy_yes\",\"amount\":5}]\n```\nGood luck!";
        let v = extract_json(content).unwrap();
        assert!(v.is_array());
        assert_eq!(v[0]["amount"], 5);
    }

    #[test]
    fn handles_braces_inside_strings() {
        let content = r#"noise {"reason": "prices {rose} sharply", "amount": 1} trailing"#;
        let v = extract_json(content).unwrap();
        assert_eq!(v["amount"], 1);
    }

    #[test]
    fn no_json_returns_none() {
        assert!(extract_json("I would rather not trade today.").is_none());
    }
}
