//! Network transport abstraction for GoalSync clients.

use async_trait::async_trait;
use crate::error::EnvError;
use crate::types::{MutationEnvelope, NodeId};

/// Abstraction for network I/O between GoalSync peers.
///
/// The transport owns convergence: every peer that receives the same
/// mutation stream must end up with identical map contents. GoalSync only
/// relies on each envelope carrying one atomic transaction.
///
/// # Implementations
///
/// - **Production**: a relay connection (WebSocket, WebRTC data channel, ...)
/// - **Simulation**: channel-based with configurable latency/loss
///
/// # Envelope Flow
///
/// ```text
/// Client A                   Relay                     Client B
///   |                           |                          |
///   |-- broadcast(envelope) --->|                          |
///   |                           |-- [latency/jitter] ----->|
///   |                           |                          |-- recv() -> envelope
/// ```
#[async_trait]
pub trait NetworkTransport: Send + Sync + 'static {
    /// Sends an envelope to a single peer.
    ///
    /// # Returns
    /// * `Ok(())` - Envelope queued for delivery
    /// * `Err(EnvError::NetworkError)` - Immediate send failure (e.g., buffer full)
    ///
    /// # Note
    /// Success does not guarantee delivery.
    async fn send(&self, target: NodeId, envelope: MutationEnvelope) -> Result<(), EnvError>;

    /// Receives the next envelope addressed to this node.
    ///
    /// # Returns
    /// * `Some((sender, envelope))` - An envelope was received
    /// * `None` - The channel was closed (shutdown)
    async fn recv(&self) -> Option<(NodeId, MutationEnvelope)>;

    /// Broadcasts an envelope to every connected peer.
    ///
    /// # Returns
    /// Number of peers the envelope was queued for.
    async fn broadcast(&self, envelope: MutationEnvelope) -> usize;

    /// Returns this node's ID.
    fn local_id(&self) -> NodeId;
}

/// Fault injection for relays in simulation.
pub trait NetworkController: Send + Sync {
    /// Creates a network partition between two node sets.
    fn partition(&self, group_a: &[NodeId], group_b: &[NodeId]);

    /// Heals all partitions.
    fn heal_all(&self);

    /// Sets latency for a specific link.
    fn set_link_latency(&self, from: NodeId, to: NodeId, latency_ms: u64);

    /// Sets packet loss probability for a link (0.0 - 1.0).
    fn set_link_loss(&self, from: NodeId, to: NodeId, loss_rate: f64);
}
