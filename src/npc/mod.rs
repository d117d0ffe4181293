//! NPC actor decision pipeline: build context, ask the model, parse and
//! sanitize decisions, hand ordered intents to the executor.

pub mod context;
pub mod decision;
pub mod engine;

pub use context::{ContextBuilder, MarketContext};
pub use decision::{parse_decisions, NpcAction, NpcDecision};
pub use engine::NpcDecisionEngine;
