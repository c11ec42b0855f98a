//! Simulated-time runs of a complete tree.

/// Tick loop driving timers and queued calls.
pub mod engine;
pub mod kpi;
/// Node construction and wiring.
pub mod tree;

pub use engine::{Engine, SimResult, run};
pub use kpi::RunSummary;
pub use tree::{NodeSnapshot, Tree};
