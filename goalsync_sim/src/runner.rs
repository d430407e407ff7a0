//! Scenario runner - executes convergence scenarios.
//!
//! Every scenario follows the same shape: build peers, run a workload under
//! some fault, then let the session settle and check it against the oracle.
//! Writes only ever go through an entity's owner.

use crate::error::SimError;
use crate::exporter::{SimEvent, SimExport};
use crate::relay::RelayConfig;
use crate::scenarios::ScenarioId;
use crate::world::{SimConfig, SimWorld};

use goalsync_core::{ClientConfig, Fields, FrameStats, OpLog, SledOpLog};
use goalsync_env::{ChannelKind, NetworkController, NodeId};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

/// Goals of the standard non-cursor entity.
const DECORATION_GOALS: [&str; 5] = ["position", "scale", "opacity", "label", "locked"];

/// How long a session may take to settle after the workload stops.
const SETTLE_SECS: f64 = 30.0;

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Total ticks executed
    pub total_ticks: u64,

    /// Final simulation time in seconds
    pub final_time_secs: f64,

    /// Number of live entities at end
    pub final_entity_count: usize,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScenarioMetrics {
    /// Envelopes submitted to the relay
    pub envelopes_sent: u64,

    pub envelopes_delivered: u64,

    /// Lost, partitioned away, or addressed to a departed peer
    pub envelopes_dropped: u64,

    /// Durable envelopes replayed to joining peers
    pub envelopes_replayed: u64,

    /// Durable envelopes held back by a partition
    pub envelopes_held: u64,

    /// Maximum observed delivery latency (ms)
    pub max_latency_ms: u64,

    /// Envelopes a client refused to apply
    pub rejected: u64,

    /// Authoritative writes issued
    pub writes: u64,

    /// Frame work summed over every peer and tick
    pub frames: FrameStats,

    /// Ticks the session needed to settle after the workload
    pub settle_ticks: Option<u64>,
}

impl ScenarioMetrics {
    fn collect(world: &SimWorld, settle_ticks: Option<u64>) -> Self {
        let relay = world.relay_stats();
        let totals = world.totals();
        Self {
            envelopes_sent: relay.sent,
            envelopes_delivered: relay.delivered,
            envelopes_dropped: relay.dropped_loss + relay.dropped_partition + relay.dropped_disconnected,
            envelopes_replayed: relay.replayed,
            envelopes_held: relay.held,
            max_latency_ms: relay.max_latency_ms,
            rejected: totals.rejected,
            writes: world.oracle.writes(),
            frames: totals.frame,
            settle_ticks,
        }
    }
}

/// Pass, or the reason it failed.
type Verdict = Result<(), String>;

/// Ticks the world and feeds the optional export.
struct Recorder<'a> {
    export: Option<&'a mut SimExport>,
    every: u64,
    events: Vec<SimEvent>,
    settle_ticks: Option<u64>,
}

impl<'a> Recorder<'a> {
    fn event(&mut self, message: String) {
        info!("  {}", message);
        self.events.push(SimEvent::info(message));
    }

    fn sample(&mut self, world: &SimWorld) {
        if let Some(export) = self.export.as_deref_mut() {
            export.capture(world, "position", std::mem::take(&mut self.events));
        }
    }

    fn tick(&mut self, world: &mut SimWorld) -> Result<(), SimError> {
        world.tick()?;
        if world.tick_count() % self.every == 0 {
            self.sample(world);
        }
        Ok(())
    }
}

/// Runs convergence scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Number of peers
    num_peers: usize,

    /// Tick rate in Hz
    tick_rate_hz: u32,

    /// Workload duration in seconds
    max_duration_secs: f64,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64, num_peers: usize) -> Self {
        Self {
            seed,
            num_peers,
            tick_rate_hz: 60,
            max_duration_secs: 5.0,
        }
    }

    /// Sets the tick rate.
    pub fn with_tick_rate(mut self, hz: u32) -> Self {
        self.tick_rate_hz = hz.max(1);
        self
    }

    /// Sets the workload duration.
    pub fn with_duration(mut self, secs: f64) -> Self {
        self.max_duration_secs = secs;
        self
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        self.run_with_export(scenario, None)
    }

    /// Runs a scenario, sampling the world into `export` as it goes.
    pub fn run_with_export(
        &self,
        scenario: ScenarioId,
        export: Option<&mut SimExport>,
    ) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        let mut recorder = Recorder {
            export,
            every: (self.tick_rate_hz as u64 / 10).max(1),
            events: Vec::new(),
            settle_ticks: None,
        };

        let outcome = SimWorld::new(self.config(scenario)).and_then(|mut world| {
            let verdict = match scenario {
                ScenarioId::LateJoin => self.run_late_join(&mut world, &mut recorder),
                ScenarioId::BurstyUpdates => self.run_bursty_updates(&mut world, &mut recorder),
                ScenarioId::ReorderedDelivery => self.run_reordered_delivery(&mut world, &mut recorder),
                ScenarioId::StaleSnap => self.run_stale_snap(&mut world, &mut recorder),
                ScenarioId::EphemeralDisconnect => self.run_ephemeral_disconnect(&mut world, &mut recorder),
                ScenarioId::IdleScene => self.run_idle_scene(&mut world, &mut recorder),
                ScenarioId::ClockSkew => self.run_clock_skew(&mut world, &mut recorder),
                ScenarioId::DurableRestart => self.run_durable_restart(&mut world, &mut recorder),
                ScenarioId::Partition => self.run_partition(&mut world, &mut recorder),
            }?;
            Ok((world, verdict))
        });

        let result = match outcome {
            Ok((world, verdict)) => {
                recorder.sample(&world);
                ScenarioResult {
                    scenario,
                    seed: self.seed,
                    passed: verdict.is_ok(),
                    total_ticks: world.tick_count(),
                    final_time_secs: world.time(),
                    final_entity_count: world.oracle.live_count(),
                    failure_reason: verdict.err(),
                    metrics: ScenarioMetrics::collect(&world, recorder.settle_ticks),
                }
            }
            Err(e) => ScenarioResult {
                scenario,
                seed: self.seed,
                passed: false,
                total_ticks: 0,
                final_time_secs: 0.0,
                final_entity_count: 0,
                failure_reason: Some(format!("simulation error: {}", e)),
                metrics: ScenarioMetrics::default(),
            },
        };

        if let Some(export) = recorder.export.as_deref_mut() {
            export.finalize(result.passed, result.metrics.frames, result.failure_reason.clone());
        }
        result
    }

    fn config(&self, scenario: ScenarioId) -> SimConfig {
        let mut config = SimConfig {
            seed: self.seed,
            num_peers: self.num_peers.max(2),
            tick_rate_hz: self.tick_rate_hz,
            max_duration_secs: self.max_duration_secs,
            relay: RelayConfig::default(),
            client: ClientConfig::default(),
        };
        config.client.tick_rate_hz = self.tick_rate_hz;

        match scenario {
            ScenarioId::ReorderedDelivery => config.relay.jitter_std_ms = 40.0,
            ScenarioId::StaleSnap => {
                config.relay.base_latency_ms = 500;
                config.relay.jitter_std_ms = 0.0;
            }
            ScenarioId::EphemeralDisconnect => config.num_peers = config.num_peers.max(3),
            _ => {}
        }
        config
    }

    /// GS-001: LateJoin - peer joins after history exists.
    ///
    /// Labels and opacities are written before the join; the joiner's own
    /// defaults for those goals must lose.
    fn run_late_join(&self, world: &mut SimWorld, rec: &mut Recorder) -> Result<Verdict, SimError> {
        info!("GS-001: LateJoin - defaults of a late joiner");

        let mut owned = Vec::new();
        for _ in 1..world.config.num_peers {
            let peer = world.add_peer()?;
            for _ in 0..2 {
                owned.push((peer, world.spawn_entity(peer, "decoration", ChannelKind::Durable)?));
            }
        }
        for (owner, id) in owned.clone() {
            world.update(owner, id, "label", text_fields(format!("placed-by-{}", owner)))?;
            world.update(owner, id, "opacity", scalar_fields(0.5))?;
        }

        let ticks = world.config.target_ticks();
        for tick in 0..ticks {
            if tick == ticks / 2 {
                let late = world.add_peer()?;
                rec.event(format!("peer {} joined at t={:.2}s", late, world.time()));
            }
            if tick % 6 == 0 {
                let (owner, id) = pick(world.rng(), &owned)?;
                write_random(world, owner, id, "position")?;
            }
            rec.tick(world)?;
        }

        self.converge(world, rec)
    }

    /// GS-002: BurstyUpdates - several writes to one goal within a tick.
    fn run_bursty_updates(&self, world: &mut SimWorld, rec: &mut Recorder) -> Result<Verdict, SimError> {
        info!("GS-002: BurstyUpdates - write bursts");

        world.spawn_peers()?;
        let owned = spawn_owned(world, "decoration", ChannelKind::Durable, 3)?;
        let ticks = world.config.target_ticks();
        let mut bursts = 0;
        for _ in 0..ticks {
            if world.rng().gen_bool(0.3) {
                let (owner, id) = pick(world.rng(), &owned)?;
                let goal = DECORATION_GOALS[world.rng().gen_range(0..DECORATION_GOALS.len())];
                let length = world.rng().gen_range(1..=5);
                for _ in 0..length {
                    write_random(world, owner, id, goal)?;
                }
                bursts += 1;
            }
            rec.tick(world)?;
        }
        debug!(bursts, "bursts issued");

        self.converge(world, rec)
    }

    /// GS-003: ReorderedDelivery - jitter larger than latency, plus loss.
    ///
    /// Ephemeral loss is switched on only after the cursors exist, and off
    /// again before a final write, since lost presence state is never
    /// resent.
    fn run_reordered_delivery(&self, world: &mut SimWorld, rec: &mut Recorder) -> Result<Verdict, SimError> {
        info!("GS-003: ReorderedDelivery - 40ms jitter on 30ms latency");

        let peers = world.spawn_peers()?;
        let decorations = spawn_owned(world, "decoration", ChannelKind::Durable, 1)?;
        let cursors = spawn_owned(world, "cursor", ChannelKind::Ephemeral, 1)?;
        if world.settle(settle_budget(world))?.is_none() {
            return Ok(Err("entities never reached every peer".into()));
        }

        set_loss(world, &peers, 0.1);
        rec.event("10% ephemeral loss on every link".into());

        let ticks = world.config.target_ticks();
        for tick in 0..ticks {
            for (owner, id) in &cursors {
                write_random(world, *owner, *id, "pointer")?;
            }
            if tick % 2 == 0 {
                let (owner, id) = pick(world.rng(), &decorations)?;
                let goal = DECORATION_GOALS[world.rng().gen_range(0..DECORATION_GOALS.len())];
                write_random(world, owner, id, goal)?;
            }
            rec.tick(world)?;
        }

        set_loss(world, &peers, 0.0);
        for (owner, id) in &cursors {
            write_random(world, *owner, *id, "pointer")?;
        }

        let verdict = self.converge(world, rec)?;
        if verdict.is_ok() && world.relay_stats().dropped_loss == 0 {
            return Ok(Err("no ephemeral envelope was lost".into()));
        }
        Ok(verdict)
    }

    /// GS-004: StaleSnap - every remote update arrives past due.
    ///
    /// Observers must snap to the exact value instead of animating from a
    /// stale rendered state.
    fn run_stale_snap(&self, world: &mut SimWorld, rec: &mut Recorder) -> Result<Verdict, SimError> {
        info!("GS-004: StaleSnap - 500ms latency, 100ms due lead");

        let peers = world.spawn_peers()?;
        let writer = peers[0];
        let mut owned = Vec::new();
        for _ in 0..4 {
            owned.push((writer, world.spawn_entity(writer, "decoration", ChannelKind::Durable)?));
        }

        let ticks = world.config.target_ticks();
        for tick in 0..ticks {
            if tick % 30 == 0 {
                for (owner, id) in owned.clone() {
                    write_random(world, owner, id, "position")?;
                }
            }
            rec.tick(world)?;
        }

        let verdict = self.converge(world, rec)?;
        if verdict.is_err() {
            return Ok(verdict);
        }
        if world.totals().frame.snapped == 0 {
            return Ok(Err("no stale goal was snapped".into()));
        }
        for peer in world.peers().filter(|p| p.id() != writer) {
            if let Err(reason) = world.oracle.verify_rendered(peer.client(), 0.0) {
                return Ok(Err(format!("stale goal not snapped exactly: {}", reason)));
            }
        }
        Ok(Ok(()))
    }

    /// GS-005: EphemeralDisconnect - owners leave mid-session.
    fn run_ephemeral_disconnect(&self, world: &mut SimWorld, rec: &mut Recorder) -> Result<Verdict, SimError> {
        info!("GS-005: EphemeralDisconnect - cursor owners leave");

        let peers = world.spawn_peers()?;
        let mut cursors = spawn_owned(world, "cursor", ChannelKind::Ephemeral, 1)?;
        let mut decorations = spawn_owned(world, "decoration", ChannelKind::Durable, 1)?;
        let leavers: Vec<NodeId> = peers[..(peers.len() / 2).max(1)].to_vec();

        let ticks = world.config.target_ticks();
        for tick in 0..ticks {
            if tick == ticks / 2 {
                for leaver in &leavers {
                    world.disconnect_peer(*leaver)?;
                    rec.event(format!("peer {} left at t={:.2}s", leaver, world.time()));
                }
                cursors.retain(|(owner, _)| !leavers.contains(owner));
                decorations.retain(|(owner, _)| !leavers.contains(owner));
            }
            if tick % 3 == 0 {
                for (owner, id) in cursors.clone() {
                    write_random(world, owner, id, "pointer")?;
                }
            }
            if tick % 10 == 0 {
                let (owner, id) = pick(world.rng(), &decorations)?;
                write_random(world, owner, id, "position")?;
            }
            rec.tick(world)?;
        }

        let verdict = self.converge(world, rec)?;
        if verdict.is_err() {
            return Ok(verdict);
        }
        for peer in world.peers() {
            let visible = peer.client().ephemeral_scene().len();
            if visible != cursors.len() {
                return Ok(Err(format!(
                    "peer {} sees {} cursors, expected {}",
                    peer.id(),
                    visible,
                    cursors.len()
                )));
            }
        }
        Ok(Ok(()))
    }

    /// GS-006: IdleScene - settled entities cost one check per frame.
    fn run_idle_scene(&self, world: &mut SimWorld, rec: &mut Recorder) -> Result<Verdict, SimError> {
        info!("GS-006: IdleScene - 200 settled entities");

        let peers = world.spawn_peers()?;
        let per_peer = 200 / peers.len();
        let owned = spawn_owned(world, "decoration", ChannelKind::Durable, per_peer)?;
        for (owner, id) in owned.clone() {
            write_random(world, owner, id, "position")?;
        }

        let verdict = self.converge(world, rec)?;
        if verdict.is_err() {
            return Ok(verdict);
        }

        let mut idle = FrameStats::default();
        for _ in 0..self.tick_rate_hz {
            idle += world.tick()?.frame;
        }
        rec.event(format!("{} component checks in one idle second", idle.checked));
        if idle.active() > 0 {
            return Ok(Err(format!("{} components did work in a settled scene", idle.active())));
        }
        if idle.idle != idle.checked {
            return Ok(Err(format!("{} of {} components were not idle", idle.checked - idle.idle, idle.checked)));
        }
        Ok(Ok(()))
    }

    /// GS-007: ClockSkew - peers disagree about wall-clock time.
    ///
    /// Due timestamps are compared across skewed clocks, so some peers snap
    /// and some interpolate; the replicated state must converge anyway.
    fn run_clock_skew(&self, world: &mut SimWorld, rec: &mut Recorder) -> Result<Verdict, SimError> {
        info!("GS-007: ClockSkew - up to 400ms of skew");

        const OFFSETS_MS: [i64; 6] = [0, 400, -400, 150, -150, 250];
        for i in 0..world.config.num_peers {
            let offset = OFFSETS_MS[i % OFFSETS_MS.len()];
            let peer = world.add_peer_with(offset, None)?;
            rec.event(format!("peer {} clock offset {}ms", peer, offset));
        }
        let decorations = spawn_owned(world, "decoration", ChannelKind::Durable, 2)?;
        let cursors = spawn_owned(world, "cursor", ChannelKind::Ephemeral, 1)?;

        let ticks = world.config.target_ticks();
        for tick in 0..ticks {
            if tick % 5 == 0 {
                let (owner, id) = pick(world.rng(), &decorations)?;
                write_random(world, owner, id, "position")?;
                let (owner, id) = pick(world.rng(), &cursors)?;
                write_random(world, owner, id, "pointer")?;
            }
            rec.tick(world)?;
        }

        self.converge(world, rec)
    }

    /// GS-008: DurableRestart - a peer restarts from its op log.
    fn run_durable_restart(&self, world: &mut SimWorld, rec: &mut Recorder) -> Result<Verdict, SimError> {
        info!("GS-008: DurableRestart - restore from op log");

        let log: Box<dyn OpLog> = Box::new(SledOpLog::open_temp()?);
        let restarting = world.add_peer_with(0, Some(log))?;
        for _ in 1..world.config.num_peers {
            world.add_peer()?;
        }
        let owned = spawn_owned(world, "decoration", ChannelKind::Durable, 2)?;

        let ticks = world.config.target_ticks();
        let mut stopped: Option<Option<Box<dyn OpLog>>> = None;
        for tick in 0..ticks {
            if tick == ticks / 3 {
                let peer = world.disconnect_peer(restarting)?;
                stopped = Some(peer.shutdown());
                rec.event(format!("peer {} stopped at t={:.2}s", restarting, world.time()));
            }
            if tick == 2 * ticks / 3 {
                if let Some(log) = stopped.take() {
                    world.rejoin_peer(restarting, log)?;
                    rec.event(format!("peer {} restarted at t={:.2}s", restarting, world.time()));
                }
            }
            if tick % 4 == 0 {
                let (owner, id) = pick(world.rng(), &owned)?;
                if world.peer(owner).is_ok() {
                    let goal = DECORATION_GOALS[world.rng().gen_range(0..DECORATION_GOALS.len())];
                    write_random(world, owner, id, goal)?;
                }
            }
            rec.tick(world)?;
        }
        if let Some(log) = stopped.take() {
            world.rejoin_peer(restarting, log)?;
        }

        self.converge(world, rec)
    }

    /// GS-009: Partition - durable writes on both sides, then heal.
    fn run_partition(&self, world: &mut SimWorld, rec: &mut Recorder) -> Result<Verdict, SimError> {
        info!("GS-009: Partition - hold and heal");

        let peers = world.spawn_peers()?;
        let (side_a, side_b) = peers.split_at(peers.len() / 2);
        let mut owned = spawn_owned(world, "decoration", ChannelKind::Durable, 2)?;

        let ticks = world.config.target_ticks();
        for tick in 0..ticks {
            if tick == ticks / 3 {
                world.controller().partition(side_a, side_b);
                rec.event(format!("partition at t={:.2}s", world.time()));
            }
            if tick == ticks / 3 + 1 {
                let owner = side_a[0];
                owned.push((owner, world.spawn_entity(owner, "decoration", ChannelKind::Durable)?));
            }
            if tick == 2 * ticks / 3 {
                world.controller().heal_all();
                rec.event(format!("healed at t={:.2}s", world.time()));
            }
            if tick % 4 == 0 {
                let (owner, id) = pick(world.rng(), &owned)?;
                let goal = DECORATION_GOALS[world.rng().gen_range(0..DECORATION_GOALS.len())];
                write_random(world, owner, id, goal)?;
            }
            rec.tick(world)?;
        }
        world.controller().heal_all();

        let verdict = self.converge(world, rec)?;
        if verdict.is_ok() && world.relay_stats().held == 0 {
            return Ok(Err("partition held no durable envelope".into()));
        }
        Ok(verdict)
    }

    /// Lets the session settle, then checks authoritative state, rendered
    /// state and replica equality.
    fn converge(&self, world: &mut SimWorld, rec: &mut Recorder) -> Result<Verdict, SimError> {
        let Some(ticks) = world.settle(settle_budget(world))? else {
            return Ok(Err(format!("did not settle within {:.0}s", SETTLE_SECS)));
        };
        rec.settle_ticks = Some(ticks);
        rec.event(format!("settled after {} ticks", ticks));

        let tolerance = world.config.client.position_threshold;
        Ok(world
            .verify(Some(tolerance))
            .and_then(|_| world.verify_replicas_identical()))
    }
}

fn settle_budget(world: &SimWorld) -> u64 {
    (SETTLE_SECS * world.config.tick_rate_hz as f64) as u64
}

/// Every peer spawns `count` entities of `kind`.
fn spawn_owned(
    world: &mut SimWorld,
    kind: &str,
    channel: ChannelKind,
    count: usize,
) -> Result<Vec<(NodeId, Uuid)>, SimError> {
    let mut owned = Vec::new();
    for peer in world.peer_ids() {
        for _ in 0..count {
            owned.push((peer, world.spawn_entity(peer, kind, channel)?));
        }
    }
    Ok(owned)
}

fn pick(rng: &mut ChaCha8Rng, owned: &[(NodeId, Uuid)]) -> Result<(NodeId, Uuid), SimError> {
    if owned.is_empty() {
        return Err(SimError::EmptyWorkload("no owned entities to write to".into()));
    }
    Ok(owned[rng.gen_range(0..owned.len())])
}

fn set_loss(world: &SimWorld, peers: &[NodeId], loss: f64) {
    for from in peers {
        for to in peers.iter().filter(|to| *to != from) {
            world.controller().set_link_loss(*from, *to, loss);
        }
    }
}

fn write_random(world: &mut SimWorld, owner: NodeId, id: Uuid, goal: &str) -> Result<(), SimError> {
    let fields = random_fields(world.rng(), goal);
    world.update(owner, id, goal, fields)
}

/// A plausible value for one of the standard goals.
fn random_fields(rng: &mut ChaCha8Rng, goal: &str) -> Fields {
    match goal {
        "scale" => vec3_fields(
            quantize(rng.gen_range(0.5..3.0)),
            quantize(rng.gen_range(0.5..3.0)),
            quantize(rng.gen_range(0.5..3.0)),
        ),
        "opacity" => scalar_fields(quantize(rng.gen_range(0.0..1.0))),
        "label" => text_fields(format!("label-{}", rng.gen::<u16>())),
        "locked" => Fields::from([("value".to_string(), json!(rng.gen_bool(0.5)))]),
        _ => vec3_fields(
            quantize(rng.gen_range(-20.0..20.0)),
            quantize(rng.gen_range(-20.0..20.0)),
            quantize(rng.gen_range(0.0..5.0)),
        ),
    }
}

/// Eighths survive any JSON round trip exactly.
fn quantize(value: f64) -> f64 {
    (value * 8.0).round() / 8.0
}

fn vec3_fields(x: f64, y: f64, z: f64) -> Fields {
    Fields::from([
        ("x".to_string(), json!(x)),
        ("y".to_string(), json!(y)),
        ("z".to_string(), json!(z)),
    ])
}

fn scalar_fields(value: f64) -> Fields {
    Fields::from([("value".to_string(), json!(value))])
}

fn text_fields(text: String) -> Fields {
    Fields::from([("text".to_string(), json!(text))])
}
