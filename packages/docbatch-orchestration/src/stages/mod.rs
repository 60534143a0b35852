// Stage runner implementations
pub mod simulated;

// Re-exports
pub use simulated::{FailureRule, SimulatedStageRunner, StageCall};
