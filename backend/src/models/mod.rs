//! Domain models for the Monte Carlo pipeline

pub mod messages;
pub mod model;

// Re-exports
pub use messages::{ModelRecord, ResultMessage, Scenario};
pub use model::{ModelFile, VariableSpec};
