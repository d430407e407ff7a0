//! Simulated relay - the server every peer's envelopes pass through.
//!
//! Models the two replication channels:
//! - **Durable**: reliable, persisted in the relay's log, replayed to every
//!   peer that connects later. Held (not dropped) across partitions.
//! - **Ephemeral**: forwarded to currently-connected peers only. Subject to
//!   loss, dropped across partitions, never replayed.
//!
//! Each delivery is scheduled at `now + latency + jitter`, so envelopes from
//! one sender can overtake each other.

use crate::context::SimContext;
use crate::network::{NetworkMessage, SimNetwork, SimNetworkController};

use goalsync_env::{ChannelKind, MutationEnvelope, NodeId};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BinaryHeap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Relay fault model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// One-way latency in milliseconds (default: 30)
    pub base_latency_ms: u64,

    /// Standard deviation of latency jitter in milliseconds (default: 10)
    pub jitter_std_ms: f64,

    /// Ephemeral loss probability, 0.0 - 1.0 (default: 0.0)
    pub ephemeral_loss: f64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            base_latency_ms: 30,
            jitter_std_ms: 10.0,
            ephemeral_loss: 0.0,
        }
    }
}

/// Counters collected by the relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStats {
    /// Envelopes submitted by peers
    pub sent: u64,

    /// Envelopes placed in a peer's inbox
    pub delivered: u64,

    /// Ephemeral envelopes lost on a link
    pub dropped_loss: u64,

    /// Ephemeral envelopes dropped across a partition
    pub dropped_partition: u64,

    /// Envelopes whose sender or target was gone
    pub dropped_disconnected: u64,

    /// Durable envelopes held back by a partition
    pub held: u64,

    /// Durable envelopes replayed to (re)joining peers
    pub replayed: u64,

    pub max_latency_ms: u64,
}

/// One scheduled delivery.
#[derive(Debug)]
struct InFlight {
    deliver_at_ms: u64,
    seq: u64,
    sent_at_ms: u64,
    from: NodeId,
    to: NodeId,
    envelope: MutationEnvelope,
}

impl PartialEq for InFlight {
    fn eq(&self, other: &Self) -> bool {
        self.deliver_at_ms == other.deliver_at_ms && self.seq == other.seq
    }
}

impl Eq for InFlight {}

impl Ord for InFlight {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deliver_at_ms
            .cmp(&other.deliver_at_ms)
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for InFlight {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The relay: router queue, per-peer inboxes, durable log, delivery heap.
pub struct Relay {
    config: RelayConfig,

    /// Shared virtual clock
    context: Arc<SimContext>,

    /// Fault injection
    controller: Arc<SimNetworkController>,

    jitter: Option<Normal<f64>>,

    rng: ChaCha8Rng,

    /// Router queue every SimNetwork submits to
    router_tx: mpsc::UnboundedSender<NetworkMessage>,
    router_rx: mpsc::UnboundedReceiver<NetworkMessage>,

    /// Inbox senders of connected peers
    inboxes: BTreeMap<NodeId, mpsc::UnboundedSender<(NodeId, MutationEnvelope)>>,

    /// Deliveries ordered by due time, then submission order
    in_flight: BinaryHeap<Reverse<InFlight>>,

    /// Durable deliveries waiting for a partition to heal
    held: Vec<InFlight>,

    /// Every durable envelope ever accepted, in acceptance order
    durable_log: Vec<(NodeId, MutationEnvelope)>,

    next_seq: u64,

    stats: RelayStats,
}

impl Relay {
    /// Creates a relay with no peers.
    pub fn new(
        config: RelayConfig,
        context: Arc<SimContext>,
        controller: Arc<SimNetworkController>,
        rng: ChaCha8Rng,
    ) -> Self {
        let jitter = if config.jitter_std_ms > 0.0 {
            Normal::new(0.0, config.jitter_std_ms).ok()
        } else {
            None
        };
        let (router_tx, router_rx) = mpsc::unbounded_channel();

        Self {
            config,
            context,
            controller,
            jitter,
            rng,
            router_tx,
            router_rx,
            inboxes: BTreeMap::new(),
            in_flight: BinaryHeap::new(),
            held: Vec::new(),
            durable_log: Vec::new(),
            next_seq: 0,
            stats: RelayStats::default(),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn stats(&self) -> RelayStats {
        self.stats
    }

    pub fn controller(&self) -> &Arc<SimNetworkController> {
        &self.controller
    }

    /// Number of durable envelopes in the log.
    pub fn log_len(&self) -> usize {
        self.durable_log.len()
    }

    /// Connected peers, in id order.
    pub fn connected(&self) -> Vec<NodeId> {
        self.inboxes.keys().copied().collect()
    }

    pub fn is_connected(&self, node: NodeId) -> bool {
        self.inboxes.contains_key(&node)
    }

    /// Deliveries not yet made (scheduled or held).
    pub fn pending(&self) -> usize {
        self.in_flight.len() + self.held.len()
    }

    /// Connects a peer and queues the durable log for it.
    ///
    /// The replay keeps log order and arrives after one base latency.
    pub fn connect(&mut self, node: NodeId) -> SimNetwork {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        self.inboxes.insert(node, inbox_tx);

        let now = self.context.elapsed_ms();
        let deliver_at_ms = now + self.config.base_latency_ms;
        let replay: Vec<(NodeId, MutationEnvelope)> = self.durable_log.clone();
        for (origin, envelope) in replay {
            let seq = self.next_seq();
            self.in_flight.push(Reverse(InFlight {
                deliver_at_ms,
                seq,
                sent_at_ms: now,
                from: origin,
                to: node,
                envelope,
            }));
            self.stats.replayed += 1;
        }

        debug!(peer = %node, replay = self.durable_log.len(), "peer connected to relay");
        SimNetwork::new(node, self.router_tx.clone(), inbox_rx)
    }

    /// Disconnects a peer.
    ///
    /// Its already-submitted durable envelopes are kept (the relay accepted
    /// them); its ephemeral envelopes and everything addressed to it are
    /// dropped. Returns false if the peer was not connected.
    pub fn disconnect(&mut self, node: NodeId) -> bool {
        self.route();
        if self.inboxes.remove(&node).is_none() {
            return false;
        }

        let before = self.in_flight.len() + self.held.len();
        let in_flight = std::mem::take(&mut self.in_flight);
        self.in_flight = in_flight
            .into_iter()
            .filter(|Reverse(f)| !dropped_on_disconnect(f, node))
            .collect();
        self.held.retain(|f| !dropped_on_disconnect(f, node));
        let after = self.in_flight.len() + self.held.len();
        self.stats.dropped_disconnected += (before - after) as u64;

        debug!(peer = %node, dropped = before - after, "peer disconnected from relay");
        true
    }

    /// Moves submitted envelopes from the router queue into the schedule.
    pub fn route(&mut self) {
        while let Ok(msg) = self.router_rx.try_recv() {
            self.stats.sent += 1;
            if !self.inboxes.contains_key(&msg.from) {
                self.stats.dropped_disconnected += 1;
                continue;
            }

            if msg.envelope.channel == ChannelKind::Durable {
                self.durable_log.push((msg.from, msg.envelope.clone()));
            }

            let targets: Vec<NodeId> = match msg.to {
                Some(target) => vec![target],
                None => self
                    .inboxes
                    .keys()
                    .copied()
                    .filter(|peer| *peer != msg.from)
                    .collect(),
            };
            for target in targets {
                self.schedule(msg.from, target, msg.envelope.clone());
            }
        }
    }

    /// Delivers everything due by now. Returns the number delivered.
    pub fn deliver(&mut self) -> usize {
        self.release_held();

        let now = self.context.elapsed_ms();
        let mut delivered = 0;
        while let Some(Reverse(next)) = self.in_flight.peek() {
            if next.deliver_at_ms > now {
                break;
            }
            let Some(Reverse(flight)) = self.in_flight.pop() else {
                break;
            };
            let sent = match self.inboxes.get(&flight.to) {
                Some(inbox) => inbox.send((flight.from, flight.envelope)).is_ok(),
                None => false,
            };
            if sent {
                delivered += 1;
                self.stats.delivered += 1;
                self.stats.max_latency_ms = self.stats.max_latency_ms.max(now - flight.sent_at_ms);
            } else {
                self.stats.dropped_disconnected += 1;
            }
        }
        delivered
    }

    fn schedule(&mut self, from: NodeId, to: NodeId, mut envelope: MutationEnvelope) {
        let now = self.context.elapsed_ms();
        let durable = envelope.channel == ChannelKind::Durable;
        envelope.hop_count = envelope.hop_count.saturating_add(1);

        if !self.controller.can_communicate(from, to) {
            if durable {
                let seq = self.next_seq();
                self.held.push(InFlight {
                    deliver_at_ms: 0,
                    seq,
                    sent_at_ms: now,
                    from,
                    to,
                    envelope,
                });
                self.stats.held += 1;
            } else {
                self.stats.dropped_partition += 1;
            }
            return;
        }

        if !durable {
            let loss = self
                .controller
                .loss(from, to)
                .unwrap_or(self.config.ephemeral_loss);
            if loss > 0.0 && self.rng.gen::<f64>() < loss {
                self.stats.dropped_loss += 1;
                return;
            }
        }

        let latency = self.sample_latency(from, to);
        let seq = self.next_seq();
        self.in_flight.push(Reverse(InFlight {
            deliver_at_ms: now + latency,
            seq,
            sent_at_ms: now,
            from,
            to,
            envelope,
        }));
    }

    fn sample_latency(&mut self, from: NodeId, to: NodeId) -> u64 {
        if let Some(fixed) = self.controller.latency(from, to) {
            return fixed;
        }
        let jitter = match &self.jitter {
            Some(normal) => normal.sample(&mut self.rng),
            None => 0.0,
        };
        (self.config.base_latency_ms as f64 + jitter).max(0.0).round() as u64
    }

    /// Reschedules held durable envelopes whose link is open again.
    fn release_held(&mut self) {
        if self.held.is_empty() {
            return;
        }
        let held = std::mem::take(&mut self.held);
        let (open, blocked): (Vec<InFlight>, Vec<InFlight>) = held
            .into_iter()
            .partition(|f| self.controller.can_communicate(f.from, f.to));
        self.held = blocked;
        for flight in open {
            let latency = self.sample_latency(flight.from, flight.to);
            self.in_flight.push(Reverse(InFlight {
                deliver_at_ms: self.context.elapsed_ms() + latency,
                ..flight
            }));
        }
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

fn dropped_on_disconnect(flight: &InFlight, node: NodeId) -> bool {
    flight.to == node || (flight.from == node && flight.envelope.channel == ChannelKind::Ephemeral)
}

#[cfg(test)]
mod tests {
    use super::*;
    use goalsync_env::NetworkController;
    use std::time::Duration;

    fn relay(config: RelayConfig) -> (Relay, Arc<SimContext>) {
        let context = SimContext::shared(42);
        let rng = context.derive_rng(1);
        let relay = Relay::new(
            config,
            Arc::clone(&context),
            Arc::new(SimNetworkController::new()),
            rng,
        );
        (relay, context)
    }

    fn envelope(channel: ChannelKind, tag: u8) -> MutationEnvelope {
        MutationEnvelope::new(vec![tag], 0, channel)
    }

    fn no_jitter() -> RelayConfig {
        RelayConfig {
            base_latency_ms: 20,
            jitter_std_ms: 0.0,
            ephemeral_loss: 0.0,
        }
    }

    #[tokio::test]
    async fn test_broadcast_delivered_after_latency() {
        use goalsync_env::NetworkTransport;

        let (mut relay, ctx) = relay(no_jitter());
        let a = relay.connect(NodeId::from_seed(1));
        let b = relay.connect(NodeId::from_seed(2));
        let c = relay.connect(NodeId::from_seed(3));

        a.broadcast(envelope(ChannelKind::Ephemeral, 7)).await;
        relay.route();
        assert_eq!(relay.deliver(), 0);

        ctx.advance_time(Duration::from_millis(20));
        assert_eq!(relay.deliver(), 2);

        let (from, received) = b.try_recv().unwrap();
        assert_eq!(from, NodeId::from_seed(1));
        assert_eq!(received.hop_count, 1);
        assert!(c.try_recv().is_some());
        assert!(a.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_durable_log_replayed_to_late_joiner() {
        use goalsync_env::NetworkTransport;

        let (mut relay, ctx) = relay(no_jitter());
        let a = relay.connect(NodeId::from_seed(1));
        a.broadcast(envelope(ChannelKind::Durable, 1)).await;
        a.broadcast(envelope(ChannelKind::Ephemeral, 2)).await;
        a.broadcast(envelope(ChannelKind::Durable, 3)).await;
        relay.route();
        assert_eq!(relay.log_len(), 2);

        let late = relay.connect(NodeId::from_seed(9));
        ctx.advance_time(Duration::from_millis(20));
        relay.deliver();

        let tags: Vec<u8> = late.drain().into_iter().map(|(_, e)| e.payload[0]).collect();
        assert_eq!(tags, vec![1, 3]);
        assert_eq!(relay.stats().replayed, 2);
    }

    #[tokio::test]
    async fn test_partition_holds_durable_and_drops_ephemeral() {
        use goalsync_env::NetworkTransport;

        let (mut relay, ctx) = relay(no_jitter());
        let a_id = NodeId::from_seed(1);
        let b_id = NodeId::from_seed(2);
        let a = relay.connect(a_id);
        let b = relay.connect(b_id);

        relay.controller().partition(&[a_id], &[b_id]);
        a.broadcast(envelope(ChannelKind::Durable, 1)).await;
        a.broadcast(envelope(ChannelKind::Ephemeral, 2)).await;
        relay.route();
        ctx.advance_time(Duration::from_millis(100));
        relay.deliver();
        assert!(b.try_recv().is_none());
        assert_eq!(relay.stats().held, 1);
        assert_eq!(relay.stats().dropped_partition, 1);

        relay.controller().heal_all();
        relay.deliver();
        ctx.advance_time(Duration::from_millis(20));
        relay.deliver();
        assert_eq!(b.try_recv().unwrap().1.payload, vec![1]);
        assert_eq!(relay.pending(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_drops_ephemeral_in_flight() {
        use goalsync_env::NetworkTransport;

        let (mut relay, ctx) = relay(no_jitter());
        let a_id = NodeId::from_seed(1);
        let a = relay.connect(a_id);
        let b = relay.connect(NodeId::from_seed(2));

        a.broadcast(envelope(ChannelKind::Ephemeral, 1)).await;
        a.broadcast(envelope(ChannelKind::Durable, 2)).await;
        assert!(relay.disconnect(a_id));
        assert!(!relay.disconnect(a_id));

        ctx.advance_time(Duration::from_millis(20));
        relay.deliver();
        let tags: Vec<u8> = b.drain().into_iter().map(|(_, e)| e.payload[0]).collect();
        assert_eq!(tags, vec![2]);
    }

    #[tokio::test]
    async fn test_full_loss_drops_every_ephemeral() {
        use goalsync_env::NetworkTransport;

        let (mut relay, ctx) = relay(RelayConfig {
            ephemeral_loss: 1.0,
            ..no_jitter()
        });
        let a = relay.connect(NodeId::from_seed(1));
        let b = relay.connect(NodeId::from_seed(2));

        for tag in 0..10 {
            a.broadcast(envelope(ChannelKind::Ephemeral, tag)).await;
        }
        a.broadcast(envelope(ChannelKind::Durable, 99)).await;
        relay.route();
        ctx.advance_time(Duration::from_millis(20));
        relay.deliver();

        assert_eq!(relay.stats().dropped_loss, 10);
        assert_eq!(b.drain().len(), 1);
    }

    #[tokio::test]
    async fn test_jitter_reorders_deterministically() {
        use goalsync_env::NetworkTransport;

        let order = |seed: u64| async move {
            let context = SimContext::shared(seed);
            let mut relay = Relay::new(
                RelayConfig {
                    base_latency_ms: 50,
                    jitter_std_ms: 40.0,
                    ephemeral_loss: 0.0,
                },
                Arc::clone(&context),
                Arc::new(SimNetworkController::new()),
                context.derive_rng(1),
            );
            let a = relay.connect(NodeId::from_seed(1));
            let b = relay.connect(NodeId::from_seed(2));
            for tag in 0..32 {
                a.broadcast(envelope(ChannelKind::Ephemeral, tag)).await;
            }
            relay.route();
            context.advance_time(Duration::from_secs(1));
            relay.deliver();
            b.drain().into_iter().map(|(_, e)| e.payload[0]).collect::<Vec<u8>>()
        };

        let first = order(7).await;
        assert_eq!(first.len(), 32);
        assert_eq!(first, order(7).await);
        assert_ne!(first, (0..32).collect::<Vec<u8>>());
    }

    proptest::proptest! {
        #[test]
        fn test_durable_delivered_exactly_once(
            seed in proptest::prelude::any::<u64>(),
            jitter in 0.0f64..80.0,
            loss in 0.0f64..1.0,
            count in 1u8..40,
        ) {
            use goalsync_env::NetworkTransport;

            let context = SimContext::shared(seed);
            let mut relay = Relay::new(
                RelayConfig {
                    base_latency_ms: 30,
                    jitter_std_ms: jitter,
                    ephemeral_loss: loss,
                },
                Arc::clone(&context),
                Arc::new(SimNetworkController::new()),
                context.derive_rng(1),
            );
            let a = relay.connect(NodeId::from_seed(1));
            let b = relay.connect(NodeId::from_seed(2));

            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async {
                for tag in 0..count {
                    a.broadcast(envelope(ChannelKind::Durable, tag)).await;
                }
            });
            relay.route();
            context.advance_time(Duration::from_secs(10));
            relay.deliver();

            let mut tags: Vec<u8> = b.drain().into_iter().map(|(_, e)| e.payload[0]).collect();
            tags.sort_unstable();
            proptest::prop_assert_eq!(tags, (0..count).collect::<Vec<u8>>());
            proptest::prop_assert_eq!(relay.stats().dropped_loss, 0);
        }
    }
}
