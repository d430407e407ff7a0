//! Simulated network transport with fault injection.

use async_trait::async_trait;
use goalsync_env::{EnvError, MutationEnvelope, NetworkController, NetworkTransport, NodeId};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;

/// Simulated network interface of one peer.
///
/// Outgoing envelopes go to the relay's router queue; the relay decides
/// when (and whether) they land in each peer's inbox.
pub struct SimNetwork {
    /// This node's ID
    local_id: NodeId,

    /// Sender to central router
    tx: mpsc::UnboundedSender<NetworkMessage>,

    /// Receiver for envelopes the relay has delivered
    rx: Mutex<mpsc::UnboundedReceiver<(NodeId, MutationEnvelope)>>,
}

/// Internal message to the relay router.
#[derive(Debug)]
pub struct NetworkMessage {
    pub from: NodeId,

    /// `None` for a broadcast to every connected peer
    pub to: Option<NodeId>,

    pub envelope: MutationEnvelope,
}

impl SimNetwork {
    /// Creates a new simulated network interface.
    pub fn new(
        local_id: NodeId,
        tx: mpsc::UnboundedSender<NetworkMessage>,
        rx: mpsc::UnboundedReceiver<(NodeId, MutationEnvelope)>,
    ) -> Self {
        Self {
            local_id,
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Takes the next delivered envelope without waiting.
    pub fn try_recv(&self) -> Option<(NodeId, MutationEnvelope)> {
        self.rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_recv()
            .ok()
    }

    /// Takes every envelope delivered so far, in delivery order.
    pub fn drain(&self) -> Vec<(NodeId, MutationEnvelope)> {
        let mut rx = self.rx.lock().unwrap_or_else(PoisonError::into_inner);
        let mut delivered = Vec::new();
        while let Ok(item) = rx.try_recv() {
            delivered.push(item);
        }
        delivered
    }

    fn submit(&self, to: Option<NodeId>, envelope: MutationEnvelope) -> Result<(), EnvError> {
        let msg = NetworkMessage {
            from: self.local_id,
            to,
            envelope,
        };
        self.tx.send(msg).map_err(|_| EnvError::network("Relay closed"))
    }
}

#[async_trait]
impl NetworkTransport for SimNetwork {
    async fn send(&self, target: NodeId, envelope: MutationEnvelope) -> Result<(), EnvError> {
        self.submit(Some(target), envelope)
    }

    /// Never waits: in simulation `None` means nothing has been delivered
    /// yet, and the caller retries on the next tick.
    async fn recv(&self) -> Option<(NodeId, MutationEnvelope)> {
        self.try_recv()
    }

    async fn broadcast(&self, envelope: MutationEnvelope) -> usize {
        // Fan-out happens in the relay
        match self.submit(None, envelope) {
            Ok(()) => 1,
            Err(_) => 0,
        }
    }

    fn local_id(&self) -> NodeId {
        self.local_id
    }
}

/// Network controller for fault injection.
///
/// Link settings override the relay's defaults for one direction only.
pub struct SimNetworkController {
    /// Per-link latency in milliseconds
    link_latency: Mutex<HashMap<(NodeId, NodeId), u64>>,

    /// Per-link packet loss rate (0.0 - 1.0)
    link_loss: Mutex<HashMap<(NodeId, NodeId), f64>>,

    /// Active partitions (nodes that cannot communicate)
    partitions: Mutex<Vec<(Vec<NodeId>, Vec<NodeId>)>>,
}

impl SimNetworkController {
    /// Creates a new network controller.
    pub fn new() -> Self {
        Self {
            link_latency: Mutex::new(HashMap::new()),
            link_loss: Mutex::new(HashMap::new()),
            partitions: Mutex::new(Vec::new()),
        }
    }

    /// Checks if two nodes can communicate (not partitioned).
    pub fn can_communicate(&self, from: NodeId, to: NodeId) -> bool {
        let partitions = self.partitions.lock().unwrap_or_else(PoisonError::into_inner);

        for (group_a, group_b) in partitions.iter() {
            let from_in_a = group_a.contains(&from);
            let from_in_b = group_b.contains(&from);
            let to_in_a = group_a.contains(&to);
            let to_in_b = group_b.contains(&to);

            // Partitioned if one is in A and other in B (or vice versa)
            if (from_in_a && to_in_b) || (from_in_b && to_in_a) {
                return false;
            }
        }

        true
    }

    /// Returns true while any partition is active.
    pub fn is_partitioned(&self) -> bool {
        !self.partitions.lock().unwrap_or_else(PoisonError::into_inner).is_empty()
    }

    /// Latency override for a link, if one is set.
    pub fn latency(&self, from: NodeId, to: NodeId) -> Option<u64> {
        let latencies = self.link_latency.lock().unwrap_or_else(PoisonError::into_inner);
        latencies.get(&(from, to)).copied()
    }

    /// Loss override for a link, if one is set.
    pub fn loss(&self, from: NodeId, to: NodeId) -> Option<f64> {
        let losses = self.link_loss.lock().unwrap_or_else(PoisonError::into_inner);
        losses.get(&(from, to)).copied()
    }
}

impl Default for SimNetworkController {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkController for SimNetworkController {
    fn partition(&self, group_a: &[NodeId], group_b: &[NodeId]) {
        let mut partitions = self.partitions.lock().unwrap_or_else(PoisonError::into_inner);
        partitions.push((group_a.to_vec(), group_b.to_vec()));
    }

    fn heal_all(&self) {
        let mut partitions = self.partitions.lock().unwrap_or_else(PoisonError::into_inner);
        partitions.clear();
    }

    fn set_link_latency(&self, from: NodeId, to: NodeId, latency_ms: u64) {
        let mut latencies = self.link_latency.lock().unwrap_or_else(PoisonError::into_inner);
        latencies.insert((from, to), latency_ms);
    }

    fn set_link_loss(&self, from: NodeId, to: NodeId, loss_rate: f64) {
        let mut losses = self.link_loss.lock().unwrap_or_else(PoisonError::into_inner);
        losses.insert((from, to), loss_rate.clamp(0.0, 1.0));
    }
}
