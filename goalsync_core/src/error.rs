//! Error types for the GoalSync engine.

use thiserror::Error;
use uuid::Uuid;

/// Errors raised by goals, goal groups and the replicated backing.
///
/// Setup errors (`InvalidBacking`, `DuplicateGoal`, `DuplicateEntity`) are
/// returned before any mutation happens and are fatal for the caller: they
/// indicate a programming mistake, never a runtime condition.
#[derive(Debug, Error)]
pub enum GoalError {
    /// A goal or group was built over a map of the wrong shape
    #[error("Invalid backing map: {0}")]
    InvalidBacking(String),

    /// A second goal resolved to an abbreviation already in use
    #[error("Duplicate goal '{name}' (wire key '{key}')")]
    DuplicateGoal { name: String, key: String },

    /// An entity root with this id already exists in the replica
    #[error("Duplicate entity {0}")]
    DuplicateEntity(Uuid),

    /// A user field name uses the `@` prefix reserved for metadata
    #[error("Reserved field name '{0}'")]
    ReservedField(String),

    /// Two clients of one session run different abbreviation tables
    #[error("Abbreviation table mismatch (local {local:#x}, remote {remote:#x})")]
    TableMismatch { local: u64, remote: u64 },

    /// A strict lookup found no value for the key
    #[error("Missing key '{0}'")]
    MissingKey(String),

    /// An equality predicate was handed values it cannot compare
    #[error("Incompatible shape for equality: {0}")]
    IncompatibleShape(String),

    /// A goals description was not a nested JSON object of the expected form
    #[error("Invalid description: {0}")]
    InvalidDescription(String),

    /// Wire encoding/decoding failed
    #[error("Codec error: {0}")]
    Codec(String),

    /// Durable op log failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration could not be read or parsed
    #[error("Configuration error: {0}")]
    Config(String),
}

impl GoalError {
    /// Creates an incompatible-shape error.
    pub fn shape(msg: impl Into<String>) -> Self {
        Self::IncompatibleShape(msg.into())
    }

    /// Creates an invalid-backing error.
    pub fn backing(msg: impl Into<String>) -> Self {
        Self::InvalidBacking(msg.into())
    }
}

impl From<serde_json::Error> for GoalError {
    fn from(e: serde_json::Error) -> Self {
        GoalError::Codec(e.to_string())
    }
}

impl From<sled::Error> for GoalError {
    fn from(e: sled::Error) -> Self {
        GoalError::Storage(e.to_string())
    }
}
