//! SimWorld - The simulation harness container.
//!
//! One tick is:
//! 1. advance the shared virtual clock
//! 2. relay delivers everything now due
//! 3. every peer applies its inbox, then runs a frame
//! 4. every peer pumps its outbox, and the relay routes it

use crate::context::SimContext;
use crate::error::SimError;
use crate::network::SimNetworkController;
use crate::oracle::Oracle;
use crate::peer::SimPeer;
use crate::relay::{Relay, RelayConfig, RelayStats};

use goalsync_core::{ClientConfig, Fields, FrameStats, OpLog};
use goalsync_env::{ChannelKind, NodeId, SyncContext};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, info};
use uuid::Uuid;

/// RNG stream of the relay's fault model.
const RELAY_STREAM: u64 = 1;

/// RNG stream of scenario workloads.
const WORKLOAD_STREAM: u64 = 2;

/// Configuration for a simulation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Master seed for determinism
    pub seed: u64,

    /// Number of peers to spawn
    pub num_peers: usize,

    /// Tick rate in Hz
    pub tick_rate_hz: u32,

    /// Maximum simulation duration in seconds (0 = unlimited)
    pub max_duration_secs: f64,

    /// Relay fault model
    pub relay: RelayConfig,

    /// Configuration shared by every peer's client
    pub client: ClientConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            num_peers: 4,
            tick_rate_hz: 60,
            max_duration_secs: 10.0,
            relay: RelayConfig::default(),
            client: ClientConfig::default(),
        }
    }
}

impl SimConfig {
    pub fn target_ticks(&self) -> u64 {
        (self.max_duration_secs * self.tick_rate_hz as f64) as u64
    }
}

/// Aggregated per-tick counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub delivered: u64,
    pub applied: u64,
    pub rejected: u64,
    pub sent: u64,
    pub frame: FrameStats,
}

/// The SimWorld - container for the entire simulation.
pub struct SimWorld {
    /// Configuration
    pub config: SimConfig,

    /// Shared simulation context (virtual clock)
    context: Arc<SimContext>,

    /// Ground truth oracle
    pub oracle: Oracle,

    relay: Relay,

    peers: BTreeMap<NodeId, SimPeer>,

    /// Workload randomness (entity ids, written values)
    rng: ChaCha8Rng,

    /// Drives each client's async pump
    runtime: Runtime,

    /// Totals over every tick so far
    totals: TickReport,

    /// Current tick count
    tick_count: u64,

    next_peer_seed: u64,
}

impl SimWorld {
    /// Creates a new SimWorld with the given configuration and no peers.
    pub fn new(config: SimConfig) -> Result<Self, SimError> {
        let context = SimContext::shared(config.seed);
        let relay = Relay::new(
            config.relay.clone(),
            Arc::clone(&context),
            Arc::new(SimNetworkController::new()),
            context.derive_rng(RELAY_STREAM),
        );
        let rng = context.derive_rng(WORKLOAD_STREAM);
        let runtime = Builder::new_current_thread()
            .build()
            .map_err(|e| SimError::Runtime(e.to_string()))?;

        Ok(Self {
            config,
            context,
            oracle: Oracle::new(),
            relay,
            peers: BTreeMap::new(),
            rng,
            runtime,
            totals: TickReport::default(),
            tick_count: 0,
            next_peer_seed: 1,
        })
    }

    /// Spawns `config.num_peers` peers and returns their IDs.
    pub fn spawn_peers(&mut self) -> Result<Vec<NodeId>, SimError> {
        (0..self.config.num_peers).map(|_| self.add_peer()).collect()
    }

    /// Adds a peer with an accurate clock and no op log.
    pub fn add_peer(&mut self) -> Result<NodeId, SimError> {
        self.add_peer_with(0, None)
    }

    /// Adds a peer whose wall clock is skewed by `clock_offset_ms`,
    /// optionally persisting durable history to `oplog`.
    pub fn add_peer_with(
        &mut self,
        clock_offset_ms: i64,
        oplog: Option<Box<dyn OpLog>>,
    ) -> Result<NodeId, SimError> {
        let id = NodeId::from_seed(self.next_peer_seed);
        self.next_peer_seed += 1;
        self.join(id, clock_offset_ms, oplog)?;
        Ok(id)
    }

    /// Disconnects a peer and tells everyone else it left.
    ///
    /// The leaving peer flushes its outbox first, so its last durable writes
    /// reach the relay. Returns the peer so a scenario can restart it.
    pub fn disconnect_peer(&mut self, id: NodeId) -> Result<SimPeer, SimError> {
        let peer = self
            .peers
            .remove(&id)
            .ok_or_else(|| SimError::UnknownPeer(id.to_string()))?;
        peer.pump(&self.runtime)?;
        self.relay.disconnect(id);
        for other in self.peers.values_mut() {
            other.client_mut().peer_disconnected(id);
        }
        let gone = self.oracle.owner_left(id);
        info!(peer = %id, ephemeral_gone = gone.len(), "peer disconnected");
        Ok(peer)
    }

    /// Brings a previously disconnected peer back under the same id.
    pub fn rejoin_peer(
        &mut self,
        id: NodeId,
        oplog: Option<Box<dyn OpLog>>,
    ) -> Result<(), SimError> {
        self.join(id, 0, oplog)
    }

    fn join(
        &mut self,
        id: NodeId,
        clock_offset_ms: i64,
        oplog: Option<Box<dyn OpLog>>,
    ) -> Result<(), SimError> {
        let context = Arc::new(self.context.with_offset_ms(clock_offset_ms));
        let network = self.relay.connect(id);
        let mut peer = SimPeer::new(id, context, self.config.client.clone(), network, oplog)?;

        // Presence state is not in the relay log; take it from a live peer
        if let Some(existing) = self.peers.values().next() {
            let remote = existing.client().table_fingerprint();
            if let Err(e) = peer.client().check_table(remote) {
                self.relay.disconnect(id);
                return Err(e.into());
            }
            let snapshot = existing.client().snapshot()?;
            peer.client_mut().bootstrap(existing.id(), &snapshot)?;
        }

        info!(peer = %id, clock_offset_ms, peers = self.peers.len() + 1, "peer joined");
        self.peers.insert(id, peer);
        Ok(())
    }

    /// Spawns an entity owned by `owner`.
    pub fn spawn_entity(
        &mut self,
        owner: NodeId,
        kind: &str,
        channel: ChannelKind,
    ) -> Result<Uuid, SimError> {
        let id = uuid::Builder::from_random_bytes(self.rng.gen()).into_uuid();
        self.peer_mut(owner)?
            .client_mut()
            .spawn_entity(id, kind, channel)?;
        self.oracle.spawn(id, kind, channel, owner);
        Ok(id)
    }

    /// Removes an entity through its owner.
    pub fn remove_entity(&mut self, owner: NodeId, id: Uuid) -> Result<bool, SimError> {
        let removed = self.peer_mut(owner)?.client_mut().remove_entity(id);
        if removed {
            self.oracle.remove(id);
        }
        Ok(removed)
    }

    /// Writes a goal through `writer` with the client's default lead.
    pub fn update(
        &mut self,
        writer: NodeId,
        id: Uuid,
        goal: &str,
        partial: Fields,
    ) -> Result<(), SimError> {
        self.peer(writer)?.client().update_goal(id, goal, partial.clone())?;
        self.oracle.record_write(id, goal, &partial);
        Ok(())
    }

    /// Writes a goal through `writer` with an explicit due timestamp.
    pub fn update_at(
        &mut self,
        writer: NodeId,
        id: Uuid,
        goal: &str,
        partial: Fields,
        due: u64,
    ) -> Result<(), SimError> {
        self.peer(writer)?
            .client()
            .update_goal_at(id, goal, partial.clone(), due)?;
        self.oracle.record_write(id, goal, &partial);
        Ok(())
    }

    /// Advances simulation by one tick.
    pub fn tick(&mut self) -> Result<TickReport, SimError> {
        let dt = 1.0 / self.config.tick_rate_hz as f64;
        self.context.advance_time(Duration::from_secs_f64(dt));

        let mut report = TickReport {
            delivered: self.relay.deliver() as u64,
            ..TickReport::default()
        };

        for peer in self.peers.values_mut() {
            let inbox = peer.receive_all();
            report.applied += inbox.applied;
            report.rejected += inbox.rejected;
            report.frame += peer.frame();
        }

        for peer in self.peers.values() {
            report.sent += peer.pump(&self.runtime)? as u64;
        }
        self.relay.route();

        self.tick_count += 1;
        self.totals.delivered += report.delivered;
        self.totals.applied += report.applied;
        self.totals.rejected += report.rejected;
        self.totals.sent += report.sent;
        self.totals.frame += report.frame;
        Ok(report)
    }

    /// Runs `ticks` ticks.
    pub fn run_ticks(&mut self, ticks: u64) -> Result<(), SimError> {
        for _ in 0..ticks {
            self.tick()?;
        }
        Ok(())
    }

    /// Ticks until the session is quiescent: nothing in flight, nothing
    /// unsent, and every peer's frame idle. Returns the ticks it took, or
    /// `None` if `max_ticks` ran out first.
    pub fn settle(&mut self, max_ticks: u64) -> Result<Option<u64>, SimError> {
        for taken in 1..=max_ticks {
            let report = self.tick()?;
            if report.frame.active() == 0 && report.sent == 0 && self.relay.pending() == 0 {
                debug!(ticks = taken, "settled");
                return Ok(Some(taken));
            }
        }
        Ok(None)
    }

    /// Checks every connected peer against the oracle. With a tolerance,
    /// rendered values are checked too.
    pub fn verify(&self, rendered_tolerance: Option<f64>) -> Result<(), String> {
        for peer in self.peers.values() {
            self.oracle.verify_authoritative(peer.client())?;
            if let Some(tolerance) = rendered_tolerance {
                self.oracle.verify_rendered(peer.client(), tolerance)?;
            }
        }
        Ok(())
    }

    /// Checks that every peer holds byte-identical replicated state.
    pub fn verify_replicas_identical(&self) -> Result<(), String> {
        let mut peers = self.peers.values();
        let Some(first) = peers.next() else {
            return Ok(());
        };
        let reference = first.client().state_json();
        for peer in peers {
            if peer.client().state_json() != reference {
                return Err(format!(
                    "peer {} diverges from peer {}",
                    peer.id(),
                    first.id()
                ));
            }
        }
        Ok(())
    }

    pub fn peer(&self, id: NodeId) -> Result<&SimPeer, SimError> {
        self.peers
            .get(&id)
            .ok_or_else(|| SimError::UnknownPeer(id.to_string()))
    }

    pub fn peer_mut(&mut self, id: NodeId) -> Result<&mut SimPeer, SimError> {
        self.peers
            .get_mut(&id)
            .ok_or_else(|| SimError::UnknownPeer(id.to_string()))
    }

    pub fn peers(&self) -> impl Iterator<Item = &SimPeer> {
        self.peers.values()
    }

    pub fn peer_ids(&self) -> Vec<NodeId> {
        self.peers.keys().copied().collect()
    }

    pub fn controller(&self) -> &Arc<SimNetworkController> {
        self.relay.controller()
    }

    pub fn relay_stats(&self) -> RelayStats {
        self.relay.stats()
    }

    pub fn context(&self) -> &Arc<SimContext> {
        &self.context
    }

    /// Workload randomness, for scenarios.
    pub fn rng(&mut self) -> &mut ChaCha8Rng {
        &mut self.rng
    }

    pub fn totals(&self) -> TickReport {
        self.totals
    }

    /// Returns the current simulation time in seconds.
    pub fn time(&self) -> f64 {
        self.context.now().as_secs_f64()
    }

    /// Shared wall clock in ms (unskewed).
    pub fn now_ms(&self) -> u64 {
        self.context.now_ms()
    }

    /// Returns the current tick count.
    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Returns the number of connected peers.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}
