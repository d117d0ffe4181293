//! Autonomous agent runtime: per-agent providers and actions, goal and
//! experience memory, and the per-agent tick coordinator.

pub mod actions;
pub mod coordinator;
pub mod experience;
pub mod goals;
pub mod providers;
pub mod runtime;

pub use actions::{ActionExecutor, ActionOutcome, AgentAction};
pub use coordinator::{ActionCounts, AutonomousCoordinator, TickResult};
pub use experience::ExperienceStore;
pub use goals::GoalStore;
pub use runtime::{AgentRuntime, RuntimeManager};
