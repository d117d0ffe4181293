//! Trajectory capture and the offline training pipeline.

pub mod export;
pub mod recorder;
pub mod reward;

pub use export::TrajectoryExporter;
pub use recorder::{LlmCallRecord, TrajectoryRecorder, TrajectoryStep};
pub use reward::RewardScorer;
