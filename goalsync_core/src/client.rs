//! The "CLIENT" Runtime - one peer of a GoalSync session.
//!
//! A `SyncClient` owns both replicas (durable and ephemeral), one scene per
//! realization, and the op log of durable history. It is driven from the
//! outside:
//!
//! ```ignore
//! let mut client = SyncClient::new(node, ctx, ClientConfig::default());
//! client.spawn_entity(id, "decoration", ChannelKind::Durable)?;
//!
//! // each frame
//! client.frame();
//! client.pump(&net).await?;
//!
//! // on every envelope from the transport
//! client.receive(sender, &envelope)?;
//! ```
//!
//! Generic over the context so the same client runs against the wall clock
//! in production and a virtual clock in simulation.

use goalsync_env::{ChannelKind, MutationEnvelope, NetworkTransport, NodeId, SyncContext};
use nalgebra::Vector3;
use serde_json::{json, Value};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::abbrev::AbbreviationTable;
use crate::backing::{
    fields_from_json, ApplyOutcome, Backing, Durable, Ephemeral, Fields, OpBatch, Replica,
};
use crate::config::ClientConfig;
use crate::equality::{Delta, Distance};
use crate::error::GoalError;
use crate::goal_group::{goals_desc_to_map, GoalGroup};
use crate::interpolation::{DiscreteApplier, FrameClock, ScalarAnimator, Vec3Animator};
use crate::oplog::OpLog;
use crate::scene::{Entity, FrameStats, NullSceneGraph, Scene, SceneGraph};
use crate::wire;

// ============================================================================
// COMPONENT FACTORY
// ============================================================================

/// Registers the goals and components of an entity, keyed on its kind.
///
/// Runs for locally spawned entities and for entities first seen through
/// remote ops. Goal defaults never overwrite values already replicated.
pub trait ComponentFactory<B: Backing> {
    fn build(&self, entity: &mut Entity<B>, config: &ClientConfig) -> Result<(), GoalError>;
}

impl<B, F> ComponentFactory<B> for F
where
    B: Backing,
    F: Fn(&mut Entity<B>, &ClientConfig) -> Result<(), GoalError>,
{
    fn build(&self, entity: &mut Entity<B>, config: &ClientConfig) -> Result<(), GoalError> {
        self(entity, config)
    }
}

/// The built-in entity kinds.
///
/// - `cursor`: a `pointer` vector
/// - anything else: `position`, `scale`, `opacity`, `label`, `locked`
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardComponents;

impl<B: Backing> ComponentFactory<B> for StandardComponents {
    fn build(&self, entity: &mut Entity<B>, config: &ClientConfig) -> Result<(), GoalError> {
        if entity.kind() == "cursor" {
            return add_vec3(entity, "pointer", Vector3::zeros(), config);
        }

        add_vec3(entity, "position", Vector3::zeros(), config)?;
        add_vec3(entity, "scale", Vector3::new(1.0, 1.0, 1.0), config)?;
        add_scalar(entity, "opacity", 1.0, config)?;
        add_discrete(entity, "label", json!({"text": ""}))?;
        add_discrete(entity, "locked", json!({"value": false}))
    }
}

/// Registers a vector goal with a `Distance` predicate and its animator.
///
/// The animator starts at the goal's current value, so an entity that
/// arrives mid-animation does not sweep in from the origin.
pub fn add_vec3<B: Backing>(
    entity: &mut Entity<B>,
    name: &str,
    default: Vector3<f64>,
    config: &ClientConfig,
) -> Result<(), GoalError> {
    let defaults = fields_from_json(json!({"x": default.x, "y": default.y, "z": default.z}))?;
    let goal = entity.group_mut().add(
        name,
        defaults,
        Some(Box::new(Distance::new(config.position_threshold))),
    )?;
    let initial = goal.get_vec3(["x", "y", "z"]).unwrap_or(default);
    entity.attach(name, Box::new(Vec3Animator::new(initial, config.blend)))
}

/// Registers a single-number goal (`value`) with a `Delta` predicate.
pub fn add_scalar<B: Backing>(
    entity: &mut Entity<B>,
    name: &str,
    default: f64,
    config: &ClientConfig,
) -> Result<(), GoalError> {
    let goal = entity.group_mut().add(
        name,
        Fields::from([("value".to_string(), Value::from(default))]),
        Some(Box::new(Delta::new("value", config.scalar_threshold))),
    )?;
    let initial = goal.get_f64("value").unwrap_or(default);
    entity.attach(name, Box::new(ScalarAnimator::new("value", initial, config.blend)))
}

/// Registers a goal whose fields are applied verbatim.
pub fn add_discrete<B: Backing>(
    entity: &mut Entity<B>,
    name: &str,
    defaults: Value,
) -> Result<(), GoalError> {
    entity.group_mut().add(name, fields_from_json(defaults)?, None)?;
    entity.attach(name, Box::new(DiscreteApplier::all()))
}

// ============================================================================
// SYNC CLIENT
// ============================================================================

/// One peer: replicas, scenes, op log and the frame loop.
pub struct SyncClient<Ctx: SyncContext> {
    /// Node identifier
    node: NodeId,

    /// Environment context (clock)
    context: Arc<Ctx>,

    /// Configuration
    config: ClientConfig,

    table: Rc<AbbreviationTable>,

    durable: Replica<Durable>,
    ephemeral: Replica<Ephemeral>,
    durable_scene: Scene<Durable>,
    ephemeral_scene: Scene<Ephemeral>,
    durable_factory: Box<dyn ComponentFactory<Durable>>,
    ephemeral_factory: Box<dyn ComponentFactory<Ephemeral>>,

    /// Rendering collaborator
    graph: Box<dyn SceneGraph>,

    /// Persisted durable history (local and remote)
    oplog: Option<Box<dyn OpLog>>,

    /// Monotonic time of the previous frame
    last_frame: Option<Duration>,

    /// Frames run so far
    frame_count: u64,
}

impl<Ctx: SyncContext> SyncClient<Ctx> {
    /// Creates a client with the standard components and a null scene graph.
    pub fn new(node: NodeId, context: Arc<Ctx>, config: ClientConfig) -> Self {
        Self {
            node,
            context,
            config,
            table: Rc::new(AbbreviationTable::default()),
            durable: Replica::new(node),
            ephemeral: Replica::new(node),
            durable_scene: Scene::new(),
            ephemeral_scene: Scene::new(),
            durable_factory: Box::new(StandardComponents),
            ephemeral_factory: Box::new(StandardComponents),
            graph: Box::new(NullSceneGraph),
            oplog: None,
            last_frame: None,
            frame_count: 0,
        }
    }

    pub fn with_scene_graph(mut self, graph: Box<dyn SceneGraph>) -> Self {
        self.graph = graph;
        self
    }

    pub fn with_oplog(mut self, oplog: Box<dyn OpLog>) -> Self {
        self.oplog = Some(oplog);
        self
    }

    /// Replaces the standard abbreviation table. Every client of a session
    /// must use the same one.
    pub fn with_table(mut self, table: AbbreviationTable) -> Self {
        self.table = Rc::new(table);
        self
    }

    pub fn with_durable_factory(mut self, factory: Box<dyn ComponentFactory<Durable>>) -> Self {
        self.durable_factory = factory;
        self
    }

    pub fn with_ephemeral_factory(mut self, factory: Box<dyn ComponentFactory<Ephemeral>>) -> Self {
        self.ephemeral_factory = factory;
        self
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn table_fingerprint(&self) -> u64 {
        self.table.fingerprint()
    }

    /// Fails unless a peer reporting `remote` fingerprint encodes goal names
    /// the same way this client does.
    pub fn check_table(&self, remote: u64) -> Result<(), GoalError> {
        let local = self.table_fingerprint();
        if local != remote {
            return Err(GoalError::TableMismatch { local, remote });
        }
        Ok(())
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<Ctx> {
        &self.context
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn durable(&self) -> &Replica<Durable> {
        &self.durable
    }

    pub fn ephemeral(&self) -> &Replica<Ephemeral> {
        &self.ephemeral
    }

    pub fn durable_scene(&self) -> &Scene<Durable> {
        &self.durable_scene
    }

    pub fn ephemeral_scene(&self) -> &Scene<Ephemeral> {
        &self.ephemeral_scene
    }

    /// Number of entities known on both channels.
    pub fn entity_count(&self) -> usize {
        self.durable_scene.len() + self.ephemeral_scene.len()
    }

    // ------------------------------------------------------------------------
    // Entities
    // ------------------------------------------------------------------------

    /// Spawns a new entity on `channel` and builds its components.
    pub fn spawn_entity(&mut self, id: Uuid, kind: &str, channel: ChannelKind) -> Result<(), GoalError> {
        let spawned = match channel {
            ChannelKind::Durable => spawn(
                &self.durable,
                &mut self.durable_scene,
                self.durable_factory.as_ref(),
                &self.table,
                &self.config,
                id,
                kind,
            ),
            ChannelKind::Ephemeral => spawn(
                &self.ephemeral,
                &mut self.ephemeral_scene,
                self.ephemeral_factory.as_ref(),
                &self.table,
                &self.config,
                id,
                kind,
            ),
        };
        spawned?;
        info!(node = %self.node, entity = %id, kind, %channel, "entity spawned");
        Ok(())
    }

    /// Spawns an entity whose initial state comes from a JSON description.
    pub fn spawn_from_description(
        &mut self,
        id: Uuid,
        kind: &str,
        channel: ChannelKind,
        description: &Value,
    ) -> Result<(), GoalError> {
        match channel {
            ChannelKind::Durable => {
                goals_desc_to_map(&self.durable, &self.table, kind, id, description)?;
                attach(
                    &self.durable,
                    &mut self.durable_scene,
                    self.durable_factory.as_ref(),
                    &self.table,
                    &self.config,
                    id,
                )?;
            }
            ChannelKind::Ephemeral => {
                goals_desc_to_map(&self.ephemeral, &self.table, kind, id, description)?;
                attach(
                    &self.ephemeral,
                    &mut self.ephemeral_scene,
                    self.ephemeral_factory.as_ref(),
                    &self.table,
                    &self.config,
                    id,
                )?;
            }
        }
        Ok(())
    }

    /// Removes an entity locally and queues its removal for peers.
    pub fn remove_entity(&mut self, id: Uuid) -> bool {
        let removed = if self.durable_scene.remove(id).is_some() {
            self.durable.remove_root(id)
        } else if self.ephemeral_scene.remove(id).is_some() {
            self.ephemeral.remove_root(id)
        } else {
            false
        };
        if removed {
            self.graph.remove_entity(id);
        }
        removed
    }

    /// Durable entity by id.
    pub fn durable_entity(&self, id: Uuid) -> Option<&Entity<Durable>> {
        self.durable_scene.get(id)
    }

    /// Ephemeral entity by id.
    pub fn ephemeral_entity(&self, id: Uuid) -> Option<&Entity<Ephemeral>> {
        self.ephemeral_scene.get(id)
    }

    /// Rendered value of one goal of one entity, on either channel.
    pub fn rendered(&self, id: Uuid, goal: &str) -> Option<Fields> {
        match self.durable_scene.get(id) {
            Some(entity) => entity.rendered(goal),
            None => self.ephemeral_scene.get(id)?.rendered(goal),
        }
    }

    /// Authoritative (replicated) value of one goal, rendered as JSON.
    pub fn goal_json(&self, id: Uuid, goal: &str) -> Option<Value> {
        match self.durable_scene.get(id) {
            Some(entity) => entity.group().get(goal).map(|g| g.to_json()),
            None => self
                .ephemeral_scene
                .get(id)?
                .group()
                .get(goal)
                .map(|g| g.to_json()),
        }
    }

    /// Updates a goal with `due` = now + `due_lead_ms`.
    pub fn update_goal(&self, id: Uuid, goal: &str, partial: Fields) -> Result<(), GoalError> {
        let due = self.context.now_ms().saturating_add(self.config.due_lead_ms);
        self.update_goal_at(id, goal, partial, due)
    }

    /// Updates a goal with an explicit due timestamp.
    pub fn update_goal_at(
        &self,
        id: Uuid,
        goal: &str,
        partial: Fields,
        due: u64,
    ) -> Result<(), GoalError> {
        if let Some(entity) = self.durable_scene.get(id) {
            let target = entity
                .group()
                .get(goal)
                .ok_or_else(|| GoalError::MissingKey(format!("{}/{}", id, goal)))?;
            return target.update(partial, due);
        }
        let target = self
            .ephemeral_scene
            .get(id)
            .and_then(|entity| entity.group().get(goal))
            .ok_or_else(|| GoalError::MissingKey(format!("{}/{}", id, goal)))?;
        target.update(partial, due)
    }

    // ------------------------------------------------------------------------
    // Frame loop
    // ------------------------------------------------------------------------

    /// Runs one frame over both scenes.
    pub fn frame(&mut self) -> FrameStats {
        let now = self.context.now();
        let dt_secs = match self.last_frame {
            Some(last) => now.saturating_sub(last).as_secs_f64(),
            None => self.config.frame_secs(),
        };
        self.last_frame = Some(now);
        self.frame_count += 1;

        let clock = FrameClock::new(self.context.now_ms(), dt_secs);
        let mut stats = self.durable_scene.frame(&clock, self.graph.as_mut());
        stats += self.ephemeral_scene.frame(&clock, self.graph.as_mut());
        stats
    }

    // ------------------------------------------------------------------------
    // Replication
    // ------------------------------------------------------------------------

    /// Drains both outboxes into envelopes, logging durable batches.
    pub fn outgoing(&self) -> Result<Vec<MutationEnvelope>, GoalError> {
        let now = self.context.now_ms();
        let durable = self.durable.drain_outbox();
        let ephemeral = self.ephemeral.drain_outbox();

        let mut envelopes = Vec::with_capacity(durable.len() + ephemeral.len());
        for batch in &durable {
            self.log(batch)?;
            envelopes.push(wire::encode(batch, now)?);
        }
        for batch in &ephemeral {
            envelopes.push(wire::encode(batch, now)?);
        }
        Ok(envelopes)
    }

    /// Applies one envelope received from `sender`.
    ///
    /// Entities first seen here are attached as soon as their root carries
    /// `@id`/`@type`, even if field ops arrived before the creating batch.
    pub fn receive(
        &mut self,
        sender: NodeId,
        envelope: &MutationEnvelope,
    ) -> Result<ApplyOutcome, GoalError> {
        let batch = wire::decode(envelope).map_err(|e| {
            warn!(node = %self.node, from = %sender, error = %e, "rejected envelope");
            e
        })?;

        let outcome = match batch.channel {
            ChannelKind::Durable => {
                let outcome = self.durable.apply(&batch)?;
                // Batches for tombstoned entities would be ignored on replay too
                if !matches!(outcome, ApplyOutcome::Ignored(_)) {
                    self.log(&batch)?;
                }
                after_apply(
                    &self.durable,
                    &mut self.durable_scene,
                    self.durable_factory.as_ref(),
                    &self.table,
                    &self.config,
                    self.graph.as_mut(),
                    outcome,
                )?;
                outcome
            }
            ChannelKind::Ephemeral => {
                let outcome = self.ephemeral.apply(&batch)?;
                after_apply(
                    &self.ephemeral,
                    &mut self.ephemeral_scene,
                    self.ephemeral_factory.as_ref(),
                    &self.table,
                    &self.config,
                    self.graph.as_mut(),
                    outcome,
                )?;
                outcome
            }
        };

        debug!(node = %self.node, from = %sender, ?outcome, "applied remote batch");
        Ok(outcome)
    }

    /// Applies a late joiner's catch-up stream. Returns the number of
    /// envelopes applied.
    pub fn bootstrap(&mut self, sender: NodeId, envelopes: &[MutationEnvelope]) -> Result<usize, GoalError> {
        for envelope in envelopes {
            self.receive(sender, envelope)?;
        }
        info!(node = %self.node, count = envelopes.len(), entities = self.entity_count(), "bootstrapped");
        Ok(envelopes.len())
    }

    /// Rebuilds durable state from the op log (after a restart).
    pub fn restore_from_log(&mut self) -> Result<usize, GoalError> {
        let batches = match &self.oplog {
            Some(log) => log.replay()?,
            None => return Ok(0),
        };
        for batch in &batches {
            let outcome = self.durable.apply(batch)?;
            after_apply(
                &self.durable,
                &mut self.durable_scene,
                self.durable_factory.as_ref(),
                &self.table,
                &self.config,
                self.graph.as_mut(),
                outcome,
            )?;
        }
        info!(node = %self.node, batches = batches.len(), "restored durable state from op log");
        Ok(batches.len())
    }

    /// Replicated state of every live entity, keyed by channel then id.
    pub fn state_json(&self) -> Value {
        json!({
            "durable": replica_json(&self.durable),
            "ephemeral": replica_json(&self.ephemeral),
        })
    }

    /// Full state of both replicas as envelopes, for a newly joined peer.
    pub fn snapshot(&self) -> Result<Vec<MutationEnvelope>, GoalError> {
        let now = self.context.now_ms();
        self.durable
            .snapshot()
            .iter()
            .chain(self.ephemeral.snapshot().iter())
            .map(|batch| wire::encode(batch, now))
            .collect()
    }

    /// Handles a peer leaving: its ephemeral entities disappear.
    pub fn peer_disconnected(&mut self, peer: NodeId) -> Vec<Uuid> {
        let gone = self.ephemeral.peer_disconnected(peer);
        for id in &gone {
            self.ephemeral_scene.remove(*id);
            self.graph.remove_entity(*id);
        }
        if !gone.is_empty() {
            info!(node = %self.node, %peer, count = gone.len(), "peer left; ephemeral entities discarded");
        }
        gone
    }

    /// Broadcasts every pending envelope. Returns the number sent.
    pub async fn pump<N: NetworkTransport + ?Sized>(&self, net: &N) -> Result<usize, GoalError> {
        let envelopes = self.outgoing()?;
        let count = envelopes.len();
        for envelope in envelopes {
            net.broadcast(envelope).await;
        }
        Ok(count)
    }

    /// Stops the client. Returns the op log, which outlives the process.
    pub fn shutdown(self) -> Option<Box<dyn OpLog>> {
        info!(node = %self.node, frames = self.frame_count, "client shut down");
        self.oplog
    }

    fn log(&self, batch: &OpBatch) -> Result<(), GoalError> {
        match &self.oplog {
            Some(log) => log.append(batch),
            None => Ok(()),
        }
    }
}

fn replica_json<B: Backing>(replica: &Replica<B>) -> Value {
    let roots: serde_json::Map<String, Value> = replica
        .entity_ids()
        .into_iter()
        .filter_map(|id| Some((id.to_string(), replica.root(id)?.to_json())))
        .collect();
    Value::Object(roots)
}

fn spawn<B: Backing>(
    replica: &Replica<B>,
    scene: &mut Scene<B>,
    factory: &dyn ComponentFactory<B>,
    table: &Rc<AbbreviationTable>,
    config: &ClientConfig,
    id: Uuid,
    kind: &str,
) -> Result<(), GoalError> {
    let group = GoalGroup::with_table(replica, id, kind, Rc::clone(table))?;
    let mut entity = Entity::new(group);
    factory.build(&mut entity, config)?;
    scene.insert(entity)
}

/// Wraps an existing root into a scene entity. Returns false while the root
/// still lacks its identity metadata.
fn attach<B: Backing>(
    replica: &Replica<B>,
    scene: &mut Scene<B>,
    factory: &dyn ComponentFactory<B>,
    table: &Rc<AbbreviationTable>,
    config: &ClientConfig,
    id: Uuid,
) -> Result<bool, GoalError> {
    if scene.contains(id) {
        return Ok(true);
    }
    let root = match replica.root(id) {
        Some(root) => root,
        None => return Ok(false),
    };
    let group = match GoalGroup::from_map_with_table(root, Rc::clone(table)) {
        Ok(group) => group,
        Err(GoalError::InvalidBacking(_)) => return Ok(false),
        Err(e) => return Err(e),
    };
    let mut entity = Entity::new(group);
    factory.build(&mut entity, config)?;
    scene.insert(entity)?;
    Ok(true)
}

fn after_apply<B: Backing>(
    replica: &Replica<B>,
    scene: &mut Scene<B>,
    factory: &dyn ComponentFactory<B>,
    table: &Rc<AbbreviationTable>,
    config: &ClientConfig,
    graph: &mut dyn SceneGraph,
    outcome: ApplyOutcome,
) -> Result<(), GoalError> {
    match outcome {
        ApplyOutcome::Created(id) | ApplyOutcome::Updated { entity: id, .. } => {
            attach(replica, scene, factory, table, config, id)?;
        }
        ApplyOutcome::Removed(id) => {
            if scene.remove(id).is_some() {
                graph.remove_entity(id);
            }
        }
        ApplyOutcome::Ignored(_) => {}
    }
    Ok(())
}
