//! Common types for the GoalSync environment abstraction.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a GoalSync peer.
///
/// Uses UUID v4 for global uniqueness without coordination. Ordering is the
/// UUID's byte order, which replicas use to break stamp ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub Uuid);

impl NodeId {
    /// Creates a new random NodeId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a NodeId from a UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Creates a deterministic NodeId from a seed (for simulation).
    pub fn from_seed(seed: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&seed.to_be_bytes());
        bytes[8..16].copy_from_slice(&seed.wrapping_mul(0x517cc1b727220a95).to_le_bytes());
        Self(Uuid::from_bytes(bytes))
    }

    /// Returns the inner UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Show first 8 chars for readability
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Which replication channel a mutation travels on.
///
/// - `Durable`: persisted by the relay and replayed to future peers.
/// - `Ephemeral`: forwarded to currently-connected peers only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelKind {
    Durable,
    Ephemeral,
}

impl ChannelKind {
    /// Returns the channel name used in logs and exports.
    pub fn name(&self) -> &'static str {
        match self {
            ChannelKind::Durable => "durable",
            ChannelKind::Ephemeral => "ephemeral",
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Envelope for mutation batches transmitted between peers.
///
/// This is a transport-layer wrapper - the payload is an encoded op batch
/// that the receiving engine decodes and applies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationEnvelope {
    /// The encoded op batch
    pub payload: Vec<u8>,

    /// Timestamp when the envelope was created (sender's wall clock, ms)
    pub timestamp_ms: u64,

    /// Replication channel
    pub channel: ChannelKind,

    /// Number of relay hops taken so far
    pub hop_count: u8,
}

impl MutationEnvelope {
    /// Creates a new envelope from payload bytes.
    pub fn new(payload: Vec<u8>, timestamp_ms: u64, channel: ChannelKind) -> Self {
        Self {
            payload,
            timestamp_ms,
            channel,
            hop_count: 0,
        }
    }

    /// Returns the payload size in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}
