//! The "BACKING" Layer - Replicated Map Realizations (Durable / Ephemeral)
//!
//! Supplies the replicated key-value tree that goals and goal groups sit on:
//! - One `ReplicatedMap<B>` type, generic over a static `Backing` realization
//! - Children are always the same realization as their parent (type-checked)
//! - Multi-key writes are committed as one atomic transaction, producing one
//!   observer notification per touched map and one outgoing `OpBatch`
//!
//! Convergence belongs to the transport. The in-process merge rule used here
//! is a last-writer-wins register per slot, ordered by `Stamp` (Lamport clock,
//! ties broken towards the smaller origin id, as in the Highlander min-UUID
//! rule). Seed writes carry clock 0 so defaults never beat a real write.

use goalsync_env::{ChannelKind, NodeId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::marker::PhantomData;
use std::rc::Rc;
use tracing::debug;
use uuid::Uuid;

use crate::error::GoalError;

/// Plain user data of one map: field name -> JSON value.
pub type Fields = BTreeMap<String, Value>;

/// Marker prefix of metadata keys in the rendered wire shape.
pub const META_PREFIX: char = '@';

/// Fails if `name` could be mistaken for metadata in the rendered shape.
pub fn check_field_name(name: &str) -> Result<(), GoalError> {
    if name.starts_with(META_PREFIX) {
        return Err(GoalError::ReservedField(name.to_string()));
    }
    Ok(())
}

/// Fails on the first field name reserved for metadata.
pub fn check_field_names(fields: &Fields) -> Result<(), GoalError> {
    fields.keys().try_for_each(|name| check_field_name(name))
}

/// Converts a JSON object into `Fields`.
pub fn fields_from_json(value: Value) -> Result<Fields, GoalError> {
    match value {
        Value::Object(map) => Ok(map.into_iter().collect()),
        other => Err(GoalError::shape(format!("expected an object, got {}", other))),
    }
}

// ============================================================================
// BACKING REALIZATIONS
// ============================================================================

/// A replication realization, chosen once per replica and never discovered
/// at runtime.
pub trait Backing: Copy + Default + std::fmt::Debug + 'static {
    /// Channel the realization's mutations travel on.
    const CHANNEL: ChannelKind;

    /// Whether state survives the owner's disconnect.
    const PERSISTENT: bool;
}

/// Persisted state, replayed to all current and future peers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Durable;

/// Presence-scoped state, forwarded to connected peers and discarded when the
/// owning peer disconnects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ephemeral;

impl Backing for Durable {
    const CHANNEL: ChannelKind = ChannelKind::Durable;
    const PERSISTENT: bool = true;
}

impl Backing for Ephemeral {
    const CHANNEL: ChannelKind = ChannelKind::Ephemeral;
    const PERSISTENT: bool = false;
}

// ============================================================================
// SLOTS & STAMPS
// ============================================================================

/// Metadata carried next to user fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetaKey {
    /// Entity id (`@id`)
    Id,
    /// Entity kind tag (`@type`)
    Type,
    /// Due timestamp in wall-clock ms (`@due`)
    Due,
}

impl MetaKey {
    /// Key used for this metadata in the rendered wire shape.
    pub fn wire_key(&self) -> &'static str {
        match self {
            MetaKey::Id => "@id",
            MetaKey::Type => "@type",
            MetaKey::Due => "@due",
        }
    }

    /// Parses a rendered metadata key.
    pub fn from_wire(key: &str) -> Option<Self> {
        match key {
            "@id" => Some(MetaKey::Id),
            "@type" => Some(MetaKey::Type),
            "@due" => Some(MetaKey::Due),
            _ => None,
        }
    }
}

/// Address of one register inside a map.
///
/// Metadata and user fields live in separate namespaces, so a user field can
/// never shadow `due`, `id` or `type`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Slot {
    Meta(MetaKey),
    Field(String),
}

impl Slot {
    /// User field slot.
    pub fn field(name: impl Into<String>) -> Self {
        Slot::Field(name.into())
    }

    /// The due-timestamp slot.
    pub fn due() -> Self {
        Slot::Meta(MetaKey::Due)
    }

    pub fn is_meta(&self) -> bool {
        matches!(self, Slot::Meta(_))
    }

    /// Key used for this slot in the rendered wire shape.
    pub fn wire_key(&self) -> Cow<'_, str> {
        match self {
            Slot::Meta(meta) => Cow::Borrowed(meta.wire_key()),
            Slot::Field(name) => Cow::Borrowed(name.as_str()),
        }
    }
}

/// Replication order of a register write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stamp {
    /// Lamport clock of the writing replica (0 = seed)
    pub clock: u64,
    /// Writing replica
    pub origin: NodeId,
}

impl Stamp {
    /// Stamp of a first-writer-wins default.
    pub fn seed(origin: NodeId) -> Self {
        Self { clock: 0, origin }
    }

    pub fn is_seed(&self) -> bool {
        self.clock == 0
    }
}

impl Ord for Stamp {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher clock wins; on a tie the smaller origin wins
        self.clock
            .cmp(&other.clock)
            .then_with(|| other.origin.cmp(&self.origin))
    }
}

impl PartialOrd for Stamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone)]
struct Register {
    value: Value,
    stamp: Stamp,
}

// ============================================================================
// OPS & CHANGES
// ============================================================================

/// One register write, addressed from the entity root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapOp {
    /// Child keys from the root to the written map (empty = root)
    pub path: Vec<String>,
    pub slot: Slot,
    pub value: Value,
    pub stamp: Stamp,
}

/// Payload of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchBody {
    /// One atomic transaction's register writes
    Ops(Vec<MapOp>),
    /// The entity was removed; its subtree is discarded everywhere
    Remove,
}

/// All writes of one transaction against one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpBatch {
    pub entity: Uuid,
    pub channel: ChannelKind,
    /// Peer that created the entity (presence owner for ephemeral state)
    pub owner: NodeId,
    pub body: BatchBody,
}

impl OpBatch {
    /// Number of register writes carried.
    pub fn op_count(&self) -> usize {
        match &self.body {
            BatchBody::Ops(ops) => ops.len(),
            BatchBody::Remove => 0,
        }
    }
}

/// Where a change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Remote,
}

/// Notification delivered to map observers.
#[derive(Debug, Clone)]
pub struct MapChange {
    pub origin: ChangeOrigin,
    /// Slots of the observed map written by the transaction/batch
    pub slots: Vec<Slot>,
}

type Observer = Box<dyn FnMut(&MapChange)>;

// ============================================================================
// REPLICA LINK (shared by every map of one replica)
// ============================================================================

struct ReplicaLink {
    node: NodeId,
    clock: Cell<u64>,
    outbox: RefCell<Vec<OpBatch>>,
}

impl ReplicaLink {
    fn next_stamp(&self) -> Stamp {
        let clock = self.clock.get() + 1;
        self.clock.set(clock);
        Stamp {
            clock,
            origin: self.node,
        }
    }

    fn witness(&self, stamp: Stamp) {
        if stamp.clock > self.clock.get() {
            self.clock.set(stamp.clock);
        }
    }
}

// ============================================================================
// REPLICATED MAP
// ============================================================================

struct MapNode<B: Backing> {
    registers: BTreeMap<Slot, Register>,
    children: BTreeMap<String, ReplicatedMap<B>>,
    observers: Vec<Observer>,
}

impl<B: Backing> MapNode<B> {
    fn new() -> Self {
        Self {
            registers: BTreeMap::new(),
            children: BTreeMap::new(),
            observers: Vec::new(),
        }
    }
}

/// Handle to one map of a replicated tree.
///
/// Clones are handles to the same map.
pub struct ReplicatedMap<B: Backing> {
    node: Rc<RefCell<MapNode<B>>>,
    entity: Uuid,
    path: Vec<String>,
    owner: NodeId,
    link: Rc<ReplicaLink>,
}

impl<B: Backing> Clone for ReplicatedMap<B> {
    fn clone(&self) -> Self {
        Self {
            node: Rc::clone(&self.node),
            entity: self.entity,
            path: self.path.clone(),
            owner: self.owner,
            link: Rc::clone(&self.link),
        }
    }
}

impl<B: Backing> std::fmt::Debug for ReplicatedMap<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatedMap")
            .field("channel", &B::CHANNEL)
            .field("entity", &self.entity)
            .field("path", &self.path)
            .finish()
    }
}

impl<B: Backing> ReplicatedMap<B> {
    fn new_root(entity: Uuid, owner: NodeId, link: Rc<ReplicaLink>) -> Self {
        Self {
            node: Rc::new(RefCell::new(MapNode::new())),
            entity,
            path: Vec::new(),
            owner,
            link,
        }
    }

    /// Entity this map belongs to.
    pub fn entity(&self) -> Uuid {
        self.entity
    }

    /// Child keys from the entity root to this map.
    pub fn path(&self) -> &[String] {
        &self.path
    }

    /// Peer that created the entity.
    pub fn owner(&self) -> NodeId {
        self.owner
    }

    pub fn is_root(&self) -> bool {
        self.path.is_empty()
    }

    /// Returns true when both handles point at the same map.
    pub fn same_map(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.node, &other.node)
    }

    pub fn get(&self, slot: &Slot) -> Option<Value> {
        self.node.borrow().registers.get(slot).map(|r| r.value.clone())
    }

    /// Shorthand for `get(&Slot::field(key))`.
    pub fn get_field(&self, key: &str) -> Option<Value> {
        self.get(&Slot::field(key))
    }

    pub fn has(&self, slot: &Slot) -> bool {
        self.node.borrow().registers.contains_key(slot)
    }

    /// Writes one slot as its own transaction.
    pub fn set(&self, slot: Slot, value: impl Into<Value>) {
        self.transact(|tx| tx.set(slot, value));
    }

    /// Registers a callback fired after every transaction or remote batch
    /// that writes at least one slot of this map.
    pub fn observe(&self, callback: impl FnMut(&MapChange) + 'static) {
        self.node.borrow_mut().observers.push(Box::new(callback));
    }

    /// User fields of this map (metadata excluded).
    pub fn fields(&self) -> Fields {
        self.node
            .borrow()
            .registers
            .iter()
            .filter_map(|(slot, reg)| match slot {
                Slot::Field(name) => Some((name.clone(), reg.value.clone())),
                Slot::Meta(_) => None,
            })
            .collect()
    }

    /// Existing child map.
    pub fn child(&self, key: &str) -> Option<ReplicatedMap<B>> {
        self.node.borrow().children.get(key).cloned()
    }

    /// Existing child map, or a new empty one of the same realization.
    pub fn child_or_create(&self, key: &str) -> ReplicatedMap<B> {
        if let Some(child) = self.child(key) {
            return child;
        }

        let mut path = self.path.clone();
        path.push(key.to_string());
        let child = ReplicatedMap {
            node: Rc::new(RefCell::new(MapNode::new())),
            entity: self.entity,
            path,
            owner: self.owner,
            link: Rc::clone(&self.link),
        };
        self.node
            .borrow_mut()
            .children
            .insert(key.to_string(), child.clone());
        child
    }

    /// Keys of the existing child maps, in order.
    pub fn child_keys(&self) -> Vec<String> {
        self.node.borrow().children.keys().cloned().collect()
    }

    /// Renders the map and its subtree to plain JSON.
    ///
    /// Metadata slots are rendered under their `@`-prefixed keys. Object keys
    /// are sorted, so equal trees serialize byte-identically.
    pub fn to_json(&self) -> Value {
        let node = self.node.borrow();
        let mut out = serde_json::Map::new();
        for (slot, reg) in &node.registers {
            out.insert(slot.wire_key().into_owned(), reg.value.clone());
        }
        for (key, child) in &node.children {
            out.insert(key.clone(), child.to_json());
        }
        Value::Object(out)
    }

    /// Runs `f` against a transaction and commits every write atomically.
    ///
    /// Observers only run after all writes have landed, and the writes leave
    /// the replica as a single `OpBatch`.
    pub fn transact<R>(&self, f: impl FnOnce(&mut Transaction) -> R) -> R {
        let mut tx = Transaction::default();
        let result = f(&mut tx);
        self.commit(tx);
        result
    }

    fn descend(&self, rel: &[String]) -> ReplicatedMap<B> {
        let mut map = self.clone();
        for key in rel {
            map = map.child_or_create(key);
        }
        map
    }

    fn commit(&self, tx: Transaction) {
        if tx.writes.is_empty() {
            return;
        }

        let mut ops = Vec::with_capacity(tx.writes.len());
        let mut touched: Vec<(ReplicatedMap<B>, Vec<Slot>)> = Vec::new();

        for write in tx.writes {
            let target = self.descend(&write.path);
            {
                let mut node = target.node.borrow_mut();
                if write.seed && node.registers.contains_key(&write.slot) {
                    continue;
                }
                let stamp = if write.seed {
                    Stamp::seed(self.link.node)
                } else {
                    self.link.next_stamp()
                };
                node.registers.insert(
                    write.slot.clone(),
                    Register {
                        value: write.value.clone(),
                        stamp,
                    },
                );
                ops.push(MapOp {
                    path: target.path.clone(),
                    slot: write.slot.clone(),
                    value: write.value,
                    stamp,
                });
            }
            record_touch(&mut touched, &target, write.slot);
        }

        if ops.is_empty() {
            return;
        }

        self.link.outbox.borrow_mut().push(OpBatch {
            entity: self.entity,
            channel: B::CHANNEL,
            owner: self.owner,
            body: BatchBody::Ops(ops),
        });

        for (map, slots) in touched {
            map.notify(&MapChange {
                origin: ChangeOrigin::Local,
                slots,
            });
        }
    }

    /// Merges remote ops into this root. Returns the number of writes that
    /// won against local state.
    fn apply_remote(&self, ops: &[MapOp]) -> usize {
        let mut touched: Vec<(ReplicatedMap<B>, Vec<Slot>)> = Vec::new();
        let mut applied = 0;

        for op in ops {
            self.link.witness(op.stamp);
            let target = self.descend(&op.path);
            let won = {
                let mut node = target.node.borrow_mut();
                let newer = match node.registers.get(&op.slot) {
                    Some(existing) => op.stamp > existing.stamp,
                    None => true,
                };
                if newer {
                    node.registers.insert(
                        op.slot.clone(),
                        Register {
                            value: op.value.clone(),
                            stamp: op.stamp,
                        },
                    );
                }
                newer
            };
            if won {
                applied += 1;
                record_touch(&mut touched, &target, op.slot.clone());
            }
        }

        for (map, slots) in touched {
            map.notify(&MapChange {
                origin: ChangeOrigin::Remote,
                slots,
            });
        }

        applied
    }

    fn notify(&self, change: &MapChange) {
        // Observers run without a borrow held so they may read the map
        let mut observers = std::mem::take(&mut self.node.borrow_mut().observers);
        for observer in observers.iter_mut() {
            observer(change);
        }
        let mut node = self.node.borrow_mut();
        observers.append(&mut node.observers);
        node.observers = observers;
    }

    fn collect_ops(&self, out: &mut Vec<MapOp>) {
        let node = self.node.borrow();
        for (slot, reg) in &node.registers {
            out.push(MapOp {
                path: self.path.clone(),
                slot: slot.clone(),
                value: reg.value.clone(),
                stamp: reg.stamp,
            });
        }
        for child in node.children.values() {
            child.collect_ops(out);
        }
    }
}

fn record_touch<B: Backing>(
    touched: &mut Vec<(ReplicatedMap<B>, Vec<Slot>)>,
    map: &ReplicatedMap<B>,
    slot: Slot,
) {
    match touched.iter_mut().find(|(m, _)| m.same_map(map)) {
        Some((_, slots)) => {
            if !slots.contains(&slot) {
                slots.push(slot);
            }
        }
        None => touched.push((map.clone(), vec![slot])),
    }
}

// ============================================================================
// TRANSACTION
// ============================================================================

struct PendingWrite {
    path: Vec<String>,
    slot: Slot,
    value: Value,
    seed: bool,
}

/// Writes collected for one atomic commit.
///
/// Paths are relative to the map the transaction was opened on.
#[derive(Default)]
pub struct Transaction {
    writes: Vec<PendingWrite>,
}

impl Transaction {
    pub fn set(&mut self, slot: Slot, value: impl Into<Value>) {
        self.set_at(&[], slot, value);
    }

    /// Writes a slot of a (possibly new) descendant map.
    pub fn set_at(&mut self, path: &[&str], slot: Slot, value: impl Into<Value>) {
        self.writes.push(PendingWrite {
            path: path.iter().map(|k| k.to_string()).collect(),
            slot,
            value: value.into(),
            seed: false,
        });
    }

    /// Writes a slot only if it has no value yet, with a seed stamp that
    /// loses against every real write.
    pub fn seed(&mut self, slot: Slot, value: impl Into<Value>) {
        self.seed_at(&[], slot, value);
    }

    pub fn seed_at(&mut self, path: &[&str], slot: Slot, value: impl Into<Value>) {
        self.writes.push(PendingWrite {
            path: path.iter().map(|k| k.to_string()).collect(),
            slot,
            value: value.into(),
            seed: true,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }
}

// ============================================================================
// REPLICA
// ============================================================================

/// Result of applying one remote batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The batch created a previously unknown entity
    Created(Uuid),
    /// The batch touched a known entity (`applied` writes won)
    Updated { entity: Uuid, applied: usize },
    /// The entity was removed
    Removed(Uuid),
    /// The entity is tombstoned; the batch was dropped
    Ignored(Uuid),
}

/// One peer's replica of one realization: the factory for entity roots, the
/// owner of the Lamport clock and the outbox, and the applier of remote
/// batches.
pub struct Replica<B: Backing> {
    link: Rc<ReplicaLink>,
    roots: RefCell<BTreeMap<Uuid, ReplicatedMap<B>>>,
    // Never compacted: a late batch for a removed id must stay ignored for
    // the whole session, so this grows by one id per removal.
    tombstones: RefCell<BTreeSet<Uuid>>,
    _backing: PhantomData<B>,
}

impl<B: Backing> Replica<B> {
    /// Creates an empty replica for `node`.
    pub fn new(node: NodeId) -> Self {
        Self {
            link: Rc::new(ReplicaLink {
                node,
                clock: Cell::new(0),
                outbox: RefCell::new(Vec::new()),
            }),
            roots: RefCell::new(BTreeMap::new()),
            tombstones: RefCell::new(BTreeSet::new()),
            _backing: PhantomData,
        }
    }

    pub fn node(&self) -> NodeId {
        self.link.node
    }

    pub fn channel(&self) -> ChannelKind {
        B::CHANNEL
    }

    /// Current Lamport clock.
    pub fn clock(&self) -> u64 {
        self.link.clock.get()
    }

    /// Creates a new entity root carrying `Id` and `Type`.
    pub fn create_root(&self, entity: Uuid, kind: &str) -> Result<ReplicatedMap<B>, GoalError> {
        let root = self.new_root(entity)?;
        root.transact(|tx| {
            tx.set(Slot::Meta(MetaKey::Id), entity.to_string());
            tx.set(Slot::Meta(MetaKey::Type), kind);
        });
        Ok(root)
    }

    /// Creates a bare, empty entity root. Callers fill it in one transaction.
    pub(crate) fn new_root(&self, entity: Uuid) -> Result<ReplicatedMap<B>, GoalError> {
        if self.roots.borrow().contains_key(&entity) || self.tombstones.borrow().contains(&entity) {
            return Err(GoalError::DuplicateEntity(entity));
        }
        let root = ReplicatedMap::new_root(entity, self.link.node, Rc::clone(&self.link));
        self.roots.borrow_mut().insert(entity, root.clone());
        Ok(root)
    }

    pub fn root(&self, entity: Uuid) -> Option<ReplicatedMap<B>> {
        self.roots.borrow().get(&entity).cloned()
    }

    pub fn entity_ids(&self) -> Vec<Uuid> {
        self.roots.borrow().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.roots.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.borrow().is_empty()
    }

    pub fn is_tombstoned(&self, entity: Uuid) -> bool {
        self.tombstones.borrow().contains(&entity)
    }

    /// Removes an entity locally and queues the removal for peers.
    pub fn remove_root(&self, entity: Uuid) -> bool {
        let removed = self.roots.borrow_mut().remove(&entity);
        match removed {
            Some(root) => {
                self.tombstones.borrow_mut().insert(entity);
                self.link.outbox.borrow_mut().push(OpBatch {
                    entity,
                    channel: B::CHANNEL,
                    owner: root.owner(),
                    body: BatchBody::Remove,
                });
                true
            }
            None => false,
        }
    }

    /// Applies a batch received from a peer.
    pub fn apply(&self, batch: &OpBatch) -> Result<ApplyOutcome, GoalError> {
        if batch.channel != B::CHANNEL {
            return Err(GoalError::backing(format!(
                "{} batch offered to {} replica",
                batch.channel,
                B::CHANNEL
            )));
        }

        if self.is_tombstoned(batch.entity) {
            return Ok(ApplyOutcome::Ignored(batch.entity));
        }

        if let BatchBody::Ops(ops) = &batch.body {
            for op in ops {
                if let Slot::Field(name) = &op.slot {
                    check_field_name(name)?;
                }
            }
        }

        match &batch.body {
            BatchBody::Remove => {
                self.roots.borrow_mut().remove(&batch.entity);
                self.tombstones.borrow_mut().insert(batch.entity);
                debug!(entity = %batch.entity, channel = %B::CHANNEL, "entity removed by peer");
                Ok(ApplyOutcome::Removed(batch.entity))
            }
            BatchBody::Ops(ops) => {
                let existing = self.root(batch.entity);
                let created = existing.is_none();
                let root = match existing {
                    Some(root) => root,
                    None => {
                        let root =
                            ReplicatedMap::new_root(batch.entity, batch.owner, Rc::clone(&self.link));
                        self.roots.borrow_mut().insert(batch.entity, root.clone());
                        root
                    }
                };
                let applied = root.apply_remote(ops);
                if created {
                    debug!(entity = %batch.entity, channel = %B::CHANNEL, "entity created by peer");
                    Ok(ApplyOutcome::Created(batch.entity))
                } else {
                    Ok(ApplyOutcome::Updated {
                        entity: batch.entity,
                        applied,
                    })
                }
            }
        }
    }

    /// Drains every batch committed locally since the last drain.
    pub fn drain_outbox(&self) -> Vec<OpBatch> {
        std::mem::take(&mut *self.link.outbox.borrow_mut())
    }

    pub fn outbox_len(&self) -> usize {
        self.link.outbox.borrow().len()
    }

    /// Full state as batches (live entities plus removals), for late joiners.
    pub fn snapshot(&self) -> Vec<OpBatch> {
        let mut batches: Vec<OpBatch> = self
            .roots
            .borrow()
            .values()
            .map(|root| {
                let mut ops = Vec::new();
                root.collect_ops(&mut ops);
                OpBatch {
                    entity: root.entity(),
                    channel: B::CHANNEL,
                    owner: root.owner(),
                    body: BatchBody::Ops(ops),
                }
            })
            .collect();

        for entity in self.tombstones.borrow().iter() {
            batches.push(OpBatch {
                entity: *entity,
                channel: B::CHANNEL,
                owner: self.link.node,
                body: BatchBody::Remove,
            });
        }

        batches
    }

    /// Handles a peer leaving the session.
    ///
    /// Ephemeral entities owned by that peer are discarded and tombstoned, so
    /// batches still in flight cannot resurrect them; durable state is kept.
    /// Returns the discarded entity ids.
    pub fn peer_disconnected(&self, node: NodeId) -> Vec<Uuid> {
        if B::PERSISTENT {
            return Vec::new();
        }

        let mut roots = self.roots.borrow_mut();
        let gone: Vec<Uuid> = roots
            .values()
            .filter(|root| root.owner() == node)
            .map(|root| root.entity())
            .collect();
        let mut tombstones = self.tombstones.borrow_mut();
        for entity in &gone {
            roots.remove(entity);
            tombstones.insert(*entity);
        }
        if !gone.is_empty() {
            debug!(peer = %node, count = gone.len(), "discarded ephemeral entities of departed peer");
        }
        gone
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entity() -> Uuid {
        Uuid::parse_str("00dad9fd-ae24-4b8f-a159-78b9b53c2a60").unwrap()
    }

    #[test]
    fn test_create_root_renders_metadata() {
        let replica = Replica::<Durable>::new(NodeId::from_seed(1));
        let root = replica.create_root(entity(), "test").unwrap();

        assert_eq!(
            root.to_json(),
            json!({"@id": "00dad9fd-ae24-4b8f-a159-78b9b53c2a60", "@type": "test"})
        );
        assert_eq!(replica.drain_outbox().len(), 1);
    }

    #[test]
    fn test_duplicate_root_rejected() {
        let replica = Replica::<Ephemeral>::new(NodeId::from_seed(1));
        replica.create_root(entity(), "test").unwrap();
        assert!(matches!(
            replica.create_root(entity(), "test"),
            Err(GoalError::DuplicateEntity(_))
        ));
    }

    #[test]
    fn test_transaction_is_one_batch_one_notification() {
        let replica = Replica::<Durable>::new(NodeId::from_seed(1));
        let root = replica.create_root(entity(), "test").unwrap();
        let child = root.child_or_create("p");
        replica.drain_outbox();

        let notified = Rc::new(Cell::new(0));
        let counter = Rc::clone(&notified);
        child.observe(move |change| {
            assert_eq!(change.slots.len(), 3);
            counter.set(counter.get() + 1);
        });

        child.transact(|tx| {
            tx.set(Slot::due(), 100);
            tx.set(Slot::field("x"), 1.0);
            tx.set(Slot::field("y"), 2.0);
        });

        assert_eq!(notified.get(), 1);
        let batches = replica.drain_outbox();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].op_count(), 3);
    }

    #[test]
    fn test_seed_does_not_overwrite() {
        let replica = Replica::<Durable>::new(NodeId::from_seed(1));
        let root = replica.create_root(entity(), "test").unwrap();
        root.set(Slot::field("x"), 5);
        root.transact(|tx| tx.seed(Slot::field("x"), 0));
        assert_eq!(root.get_field("x"), Some(json!(5)));
    }

    #[test]
    fn test_remote_seed_loses_against_real_write() {
        let a = Replica::<Durable>::new(NodeId::from_seed(1));
        let b = Replica::<Durable>::new(NodeId::from_seed(2));

        let root_a = a.create_root(entity(), "test").unwrap();
        root_a.child_or_create("p").set(Slot::field("x"), 9);

        // b joins late and seeds a default before hearing from a
        let root_b = b.new_root(entity()).unwrap();
        root_b.child_or_create("p").transact(|tx| tx.seed(Slot::field("x"), 0));

        for batch in a.drain_outbox() {
            b.apply(&batch).unwrap();
        }
        for batch in b.drain_outbox() {
            a.apply(&batch).unwrap();
        }

        assert_eq!(root_a.to_json(), root_b.to_json());
        assert_eq!(root_b.child("p").unwrap().get_field("x"), Some(json!(9)));
    }

    #[test]
    fn test_reordered_delivery_converges() {
        let a = Replica::<Ephemeral>::new(NodeId::from_seed(1));
        let b = Replica::<Ephemeral>::new(NodeId::from_seed(2));

        let root = a.create_root(entity(), "cursor").unwrap();
        root.set(Slot::field("x"), 1);
        root.set(Slot::field("x"), 2);
        root.set(Slot::field("x"), 3);

        let mut batches = a.drain_outbox();
        batches.reverse();
        for batch in &batches {
            b.apply(batch).unwrap();
        }

        let mirrored = b.root(entity()).unwrap();
        assert_eq!(mirrored.get_field("x"), Some(json!(3)));
        assert_eq!(mirrored.to_json(), root.to_json());
    }

    #[test]
    fn test_concurrent_writes_tie_break_to_smaller_origin() {
        let a = Replica::<Durable>::new(NodeId::from_seed(1));
        let b = Replica::<Durable>::new(NodeId::from_seed(2));

        let root_a = a.create_root(entity(), "test").unwrap();
        for batch in a.drain_outbox() {
            b.apply(&batch).unwrap();
        }
        let root_b = b.root(entity()).unwrap();

        // Both write at the same Lamport clock
        root_a.set(Slot::field("label"), "from-a");
        root_b.set(Slot::field("label"), "from-b");

        let from_a = a.drain_outbox();
        let from_b = b.drain_outbox();
        for batch in &from_b {
            a.apply(batch).unwrap();
        }
        for batch in &from_a {
            b.apply(batch).unwrap();
        }

        assert_eq!(root_a.get_field("label"), Some(json!("from-a")));
        assert_eq!(root_b.get_field("label"), Some(json!("from-a")));
    }

    #[test]
    fn test_channel_mismatch_rejected() {
        let durable = Replica::<Durable>::new(NodeId::from_seed(1));
        let ephemeral = Replica::<Ephemeral>::new(NodeId::from_seed(2));
        ephemeral.create_root(entity(), "cursor").unwrap();

        let batch = ephemeral.drain_outbox().remove(0);
        assert!(matches!(durable.apply(&batch), Err(GoalError::InvalidBacking(_))));
        assert!(durable.is_empty());
    }

    #[test]
    fn test_remote_reserved_field_rejected() {
        let a = Replica::<Durable>::new(NodeId::from_seed(1));
        let b = Replica::<Durable>::new(NodeId::from_seed(2));
        let root = a.create_root(entity(), "test").unwrap();
        root.child_or_create("p").set(Slot::field("x"), 1);

        let mut batches = a.drain_outbox();
        let mut last = batches.pop().unwrap();
        for batch in &batches {
            b.apply(batch).unwrap();
        }
        if let BatchBody::Ops(ops) = &mut last.body {
            for op in ops.iter_mut() {
                op.slot = Slot::field("@due");
            }
        }
        assert!(matches!(b.apply(&last), Err(GoalError::ReservedField(_))));
        let applied = b
            .root(entity())
            .and_then(|r| r.child("p"))
            .and_then(|p| p.get(&Slot::field("@due")));
        assert_eq!(applied, None);
    }

    #[test]
    fn test_removal_tombstones_entity() {
        let a = Replica::<Durable>::new(NodeId::from_seed(1));
        let b = Replica::<Durable>::new(NodeId::from_seed(2));
        let root = a.create_root(entity(), "test").unwrap();
        let create = a.drain_outbox();
        root.set(Slot::field("x"), 1);
        let late_update = a.drain_outbox();
        a.remove_root(entity());
        let removal = a.drain_outbox();

        b.apply(&create[0]).unwrap();
        assert_eq!(b.apply(&removal[0]).unwrap(), ApplyOutcome::Removed(entity()));
        assert_eq!(b.apply(&late_update[0]).unwrap(), ApplyOutcome::Ignored(entity()));
        assert!(b.root(entity()).is_none());
    }

    #[test]
    fn test_ephemeral_discarded_on_disconnect() {
        let owner = NodeId::from_seed(1);
        let a = Replica::<Ephemeral>::new(owner);
        let b = Replica::<Ephemeral>::new(NodeId::from_seed(2));
        a.create_root(entity(), "cursor").unwrap();
        for batch in a.drain_outbox() {
            b.apply(&batch).unwrap();
        }

        assert_eq!(b.peer_disconnected(owner), vec![entity()]);
        assert!(b.is_empty());

        // A straggler from the departed owner is ignored
        a.root(entity()).unwrap().child_or_create("pt").set(Slot::field("x"), 1);
        let late = a.drain_outbox().remove(0);
        assert_eq!(b.apply(&late).unwrap(), ApplyOutcome::Ignored(entity()));
        assert!(b.is_empty());
    }

    #[test]
    fn test_durable_survives_disconnect() {
        let owner = NodeId::from_seed(1);
        let a = Replica::<Durable>::new(owner);
        let b = Replica::<Durable>::new(NodeId::from_seed(2));
        a.create_root(entity(), "decoration").unwrap();
        for batch in a.drain_outbox() {
            b.apply(&batch).unwrap();
        }

        assert!(b.peer_disconnected(owner).is_empty());
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn test_snapshot_bootstraps_late_joiner() {
        let a = Replica::<Durable>::new(NodeId::from_seed(1));
        let root = a.create_root(entity(), "test").unwrap();
        root.child_or_create("p").transact(|tx| {
            tx.set(Slot::due(), 10);
            tx.set(Slot::field("x"), 4);
        });

        let late = Replica::<Durable>::new(NodeId::from_seed(3));
        for batch in a.snapshot() {
            late.apply(&batch).unwrap();
        }
        assert_eq!(late.root(entity()).unwrap().to_json(), root.to_json());
        assert!(late.clock() >= a.clock());
    }

    #[test]
    fn test_observer_may_read_map() {
        let replica = Replica::<Durable>::new(NodeId::from_seed(1));
        let root = replica.create_root(entity(), "test").unwrap();
        let reader = root.clone();
        let seen = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&seen);
        root.observe(move |_| {
            *sink.borrow_mut() = reader.get_field("x");
        });

        root.set(Slot::field("x"), 7);
        assert_eq!(*seen.borrow(), Some(json!(7)));
    }
}
