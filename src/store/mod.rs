//! Typed persistence over the engine database.
//!
//! Each store owns the queries for one entity family. Writes that must be
//! atomic with a ledger entry expose `pub(crate)` connection-level helpers
//! so the executor and resolution sweep can compose them into one
//! transaction.

pub mod history;
pub mod markets;
pub mod orgs;
pub mod perps;
pub mod pools;
pub mod social;
pub mod users;

pub use history::HistoryStore;
pub use markets::PredictionMarketStore;
pub use orgs::OrganizationStore;
pub use perps::PerpPositionStore;
pub use pools::{PoolPositions, PoolStore};
pub use social::SocialStore;
pub use users::UserStore;
