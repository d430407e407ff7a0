//! Error types for the simulation harness.

use goalsync_core::GoalError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    /// Engine error surfaced by a peer's client
    #[error("Engine error: {0}")]
    Engine(#[from] GoalError),

    /// Unknown peer id
    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    /// Async runtime could not be built
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// A scenario workload has no entity to write to
    #[error("Empty workload: {0}")]
    EmptyWorkload(String),

    /// Export file could not be written
    #[error("Export error: {0}")]
    Export(#[from] std::io::Error),
}
