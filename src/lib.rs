//! Agora engine library.
//!
//! A multi-agent market-simulation engine: a periodic game tick drives
//! NPC trading and market resolution; autonomous agents plan and act on
//! their own cadence; every decision is captured as a replayable
//! trajectory; an A2A gateway exposes the same capabilities to external
//! agents.

pub mod a2a;
pub mod agents;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod executor;
pub mod ledger;
pub mod llm;
pub mod models;
pub mod npc;
pub mod oracle;
pub mod price_updater;
pub mod pricing;
pub mod resolution;
pub mod store;
pub mod tick;
pub mod trajectory;

pub use engine::Engine;
pub use error::{EngineError, EngineResult};
