//! Parsing and sanitizing structured NPC decisions.
//!
//! The model returns a JSON array of decision objects. Anything malformed
//! is dropped, not repaired: a bad entry costs one trade slot, never a
//! failed tick.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::Instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NpcAction {
    Hold,
    OpenLong,
    OpenShort,
    Close,
    BuyYes,
    BuyNo,
}

impl NpcAction {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hold" => Some(Self::Hold),
            "open_long" => Some(Self::OpenLong),
            "open_short" => Some(Self::OpenShort),
            "close" => Some(Self::Close),
            "buy_yes" => Some(Self::BuyYes),
            "buy_no" => Some(Self::BuyNo),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hold => "hold",
            Self::OpenLong => "open_long",
            Self::OpenShort => "open_short",
            Self::Close => "close",
            Self::BuyYes => "buy_yes",
            Self::BuyNo => "buy_no",
        }
    }

    fn wants_ticker(&self) -> bool {
        matches!(self, Self::OpenLong | Self::OpenShort | Self::Close)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NpcDecision {
    pub action: NpcAction,
    pub instrument: Instrument,
    pub amount: f64,
    pub confidence: f64,
    pub reason: String,
}

/// Parse a model reply into an ordered, bounded decision list.
///
/// Pipeline: reject malformed entries; drop entries risking more than
/// `available * risk_fraction`; dedupe by `(instrument, action)` keeping
/// the first; stable-sort by confidence descending; truncate to capacity.
pub fn parse_decisions(
    value: &serde_json::Value,
    available_balance: f64,
    risk_fraction: f64,
    capacity: usize,
) -> Vec<NpcDecision> {
    let Some(entries) = value.as_array() else {
        debug!("decision payload is not an array, holding");
        return Vec::new();
    };

    let max_amount = available_balance * risk_fraction;
    let mut parsed: Vec<NpcDecision> = Vec::new();
    let mut dropped = 0usize;

    for entry in entries {
        let Some(decision) = parse_entry(entry) else {
            dropped += 1;
            continue;
        };
        if decision.action == NpcAction::Hold {
            continue;
        }
        // Closes release capital; the risk cap applies to new exposure.
        if decision.action != NpcAction::Close && decision.amount > max_amount {
            dropped += 1;
            continue;
        }
        parsed.push(decision);
    }

    let mut seen: HashSet<(String, NpcAction)> = HashSet::new();
    parsed.retain(|d| seen.insert((d.instrument.sort_key(), d.action)));

    // Stable sort preserves model ordering among equal confidences.
    parsed.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    parsed.truncate(capacity);

    if dropped > 0 {
        debug!(dropped, kept = parsed.len(), "sanitized npc decisions");
    }
    parsed
}

fn parse_entry(entry: &serde_json::Value) -> Option<NpcDecision> {
    let obj = entry.as_object()?;
    let action = NpcAction::parse(obj.get("action")?.as_str()?)?;

    let instrument = if action.wants_ticker() {
        let ticker = obj.get("ticker")?.as_str()?.trim().to_uppercase();
        if ticker.is_empty() {
            return None;
        }
        Instrument::Perp(ticker)
    } else if action == NpcAction::Hold {
        Instrument::Prediction(0)
    } else {
        let id = obj.get("market_id")?.as_i64()?;
        if id <= 0 {
            return None;
        }
        Instrument::Prediction(id)
    };

    let amount = if action == NpcAction::Hold || action == NpcAction::Close {
        obj.get("amount").and_then(|v| v.as_f64()).unwrap_or(0.0)
    } else {
        let a = obj.get("amount")?.as_f64()?;
        if !(a.is_finite() && a > 0.0) {
            return None;
        }
        a
    };

    let confidence = obj
        .get("confidence")
        .and_then(|v| v.as_f64())
        .filter(|c| c.is_finite())
        .map(|c| c.clamp(0.0, 1.0))
        .unwrap_or(0.0);

    let reason = obj
        .get("reason")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .chars()
        .take(280)
        .collect();

    Some(NpcDecision {
        action,
        instrument,
        amount,
        confidence,
        reason,
    })
}
