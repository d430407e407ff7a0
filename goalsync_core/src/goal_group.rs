//! The "GOAL GROUP" - all goals of one entity, indexed by wire key.
//!
//! A group owns the entity root map (`@id`, `@type`) and one child map per
//! goal. The root is never handed out mutably: every write goes through
//! `add` or `Goal::update`.

use serde_json::Value;
use std::collections::BTreeMap;
use std::rc::Rc;
use tracing::debug;
use uuid::Uuid;

use crate::abbrev::AbbreviationTable;
use crate::backing::{Backing, Fields, MetaKey, Replica, ReplicatedMap, Slot, META_PREFIX};
use crate::equality::EqualityPredicate;
use crate::error::GoalError;
use crate::goal::Goal;

/// The goals of one entity.
pub struct GoalGroup<B: Backing> {
    root: ReplicatedMap<B>,
    goals: BTreeMap<String, Goal<B>>,
    table: Rc<AbbreviationTable>,
}

impl<B: Backing> GoalGroup<B> {
    /// Creates a new entity root in `replica` and wraps it.
    pub fn new(replica: &Replica<B>, uuid: Uuid, kind: &str) -> Result<Self, GoalError> {
        Self::with_table(replica, uuid, kind, Rc::new(AbbreviationTable::default()))
    }

    /// Like `new`, with a caller-supplied abbreviation table.
    pub fn with_table(
        replica: &Replica<B>,
        uuid: Uuid,
        kind: &str,
        table: Rc<AbbreviationTable>,
    ) -> Result<Self, GoalError> {
        let root = replica.create_root(uuid, kind)?;
        Ok(Self {
            root,
            goals: BTreeMap::new(),
            table,
        })
    }

    /// Wraps an existing entity root, e.g. one created by remote ops.
    ///
    /// # Errors
    /// `InvalidBacking` if `map` is not a root or lacks `@id`/`@type`.
    pub fn from_map(map: ReplicatedMap<B>) -> Result<Self, GoalError> {
        Self::from_map_with_table(map, Rc::new(AbbreviationTable::default()))
    }

    pub fn from_map_with_table(
        map: ReplicatedMap<B>,
        table: Rc<AbbreviationTable>,
    ) -> Result<Self, GoalError> {
        if !map.is_root() {
            return Err(GoalError::backing(format!(
                "map at path {:?} is not an entity root",
                map.path()
            )));
        }
        for meta in [MetaKey::Id, MetaKey::Type] {
            if !map.has(&Slot::Meta(meta)) {
                return Err(GoalError::backing(format!(
                    "entity root {} has no {}",
                    map.entity(),
                    meta.wire_key()
                )));
            }
        }
        Ok(Self {
            root: map,
            goals: BTreeMap::new(),
            table,
        })
    }

    /// Registers a goal under the abbreviation of `name`.
    ///
    /// Reuses the child map if remote ops already created it, so defaults
    /// never clobber state written by an earlier peer.
    ///
    /// # Errors
    /// `DuplicateGoal` if the wire key is already indexed. Nothing is written
    /// in that case.
    pub fn add(
        &mut self,
        name: &str,
        defaults: Fields,
        equality: Option<Box<dyn EqualityPredicate>>,
    ) -> Result<&Goal<B>, GoalError> {
        let key = self.table.lookup(name).to_string();
        if self.goals.contains_key(&key) {
            return Err(GoalError::DuplicateGoal {
                name: name.to_string(),
                key,
            });
        }

        let map = self.root.child_or_create(&key);
        let goal = Goal::new(name, key.clone(), map, defaults, equality)?;
        debug!(entity = %self.root.entity(), goal = name, key = %key, "goal registered");

        Ok(self.goals.entry(key).or_insert(goal))
    }

    /// Looks a goal up by full name or by wire key.
    pub fn get(&self, name_or_key: &str) -> Option<&Goal<B>> {
        self.goals
            .get(name_or_key)
            .or_else(|| self.goals.get(self.table.lookup(name_or_key)))
    }

    /// Entity id, as stored under `@id`.
    pub fn uuid(&self) -> Uuid {
        self.root
            .get(&Slot::Meta(MetaKey::Id))
            .and_then(|v| v.as_str().and_then(|s| Uuid::parse_str(s).ok()))
            .unwrap_or_else(|| self.root.entity())
    }

    /// Entity kind tag, as stored under `@type`.
    pub fn kind(&self) -> String {
        self.root
            .get(&Slot::Meta(MetaKey::Type))
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default()
    }

    /// Registered goals, ordered by wire key.
    pub fn goals(&self) -> impl Iterator<Item = (&str, &Goal<B>)> {
        self.goals.iter().map(|(k, g)| (k.as_str(), g))
    }

    pub fn len(&self) -> usize {
        self.goals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.goals.is_empty()
    }

    /// Number of goals currently marked achieved.
    pub fn achieved_count(&self) -> usize {
        self.goals.values().filter(|g| g.achieved()).count()
    }

    pub fn table(&self) -> &AbbreviationTable {
        &self.table
    }

    /// Recursively renders the entity subtree.
    pub fn to_json(&self) -> Value {
        self.root.to_json()
    }
}

impl<B: Backing> std::fmt::Debug for GoalGroup<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoalGroup")
            .field("uuid", &self.root.entity())
            .field("goals", &self.goals.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ============================================================================
// DESCRIPTIONS
// ============================================================================

struct GoalDesc {
    key: String,
    due: u64,
    fields: Fields,
}

/// Builds a whole entity subtree from a plain JSON description, in one
/// transaction.
///
/// The description maps goal names (or wire keys) to field objects. A goal
/// object may carry `@due`; the root may repeat `@id`/`@type` as long as
/// they match the arguments. The description is fully validated before the
/// replica is touched.
pub fn goals_desc_to_map<B: Backing>(
    replica: &Replica<B>,
    table: &AbbreviationTable,
    kind: &str,
    uuid: Uuid,
    description: &Value,
) -> Result<ReplicatedMap<B>, GoalError> {
    let goals = parse_description(table, kind, uuid, description)?;

    let root = replica.new_root(uuid)?;
    root.transact(|tx| {
        tx.set(Slot::Meta(MetaKey::Id), uuid.to_string());
        tx.set(Slot::Meta(MetaKey::Type), kind);
        for goal in goals {
            let path = [goal.key.as_str()];
            tx.set_at(&path, Slot::due(), goal.due);
            for (field, value) in goal.fields {
                tx.set_at(&path, Slot::Field(field), value);
            }
        }
    });
    Ok(root)
}

fn parse_description(
    table: &AbbreviationTable,
    kind: &str,
    uuid: Uuid,
    description: &Value,
) -> Result<Vec<GoalDesc>, GoalError> {
    let object = description
        .as_object()
        .ok_or_else(|| GoalError::InvalidDescription("root is not an object".into()))?;

    let mut goals: BTreeMap<String, GoalDesc> = BTreeMap::new();
    for (name, body) in object {
        if name.starts_with(META_PREFIX) {
            let expected = match MetaKey::from_wire(name) {
                Some(MetaKey::Id) => uuid.to_string(),
                Some(MetaKey::Type) => kind.to_string(),
                _ => {
                    return Err(GoalError::InvalidDescription(format!(
                        "unexpected metadata '{}' on entity root",
                        name
                    )))
                }
            };
            if body.as_str() != Some(expected.as_str()) {
                return Err(GoalError::InvalidDescription(format!(
                    "'{}' is {} but the entity is {}",
                    name, body, expected
                )));
            }
            continue;
        }

        let key = table.lookup(name).to_string();
        if goals.contains_key(&key) {
            return Err(GoalError::InvalidDescription(format!(
                "goal '{}' collides with wire key '{}'",
                name, key
            )));
        }
        goals.insert(key.clone(), parse_goal(key, body)?);
    }
    Ok(goals.into_values().collect())
}

fn parse_goal(key: String, body: &Value) -> Result<GoalDesc, GoalError> {
    let object = body.as_object().ok_or_else(|| {
        GoalError::InvalidDescription(format!("goal '{}' is not an object", key))
    })?;

    let mut due = 0;
    let mut fields = Fields::new();
    for (field, value) in object {
        if !field.starts_with(META_PREFIX) {
            fields.insert(field.clone(), value.clone());
            continue;
        }
        match MetaKey::from_wire(field) {
            Some(MetaKey::Due) => {
                due = value.as_u64().ok_or_else(|| {
                    GoalError::InvalidDescription(format!(
                        "'@due' of goal '{}' is not a timestamp: {}",
                        key, value
                    ))
                })?;
            }
            _ => {
                return Err(GoalError::InvalidDescription(format!(
                    "unexpected metadata '{}' in goal '{}'",
                    field, key
                )))
            }
        }
    }
    Ok(GoalDesc { key, due, fields })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::{fields_from_json, Durable, Ephemeral};
    use goalsync_env::NodeId;
    use serde_json::json;

    const UUID: &str = "00dad9fd-ae24-4b8f-a159-78b9b53c2a60";

    fn uuid() -> Uuid {
        Uuid::parse_str(UUID).unwrap()
    }

    fn fields(value: Value) -> Fields {
        fields_from_json(value).unwrap()
    }

    #[test]
    fn test_position_group_wire_shape() {
        let replica = Replica::<Durable>::new(NodeId::from_seed(1));
        let mut group = GoalGroup::new(&replica, uuid(), "test").unwrap();
        group
            .add("position", fields(json!({"x": 1, "y": 2, "z": 3})), None)
            .unwrap();

        assert_eq!(
            group.to_json(),
            json!({
                "@id": UUID,
                "@type": "test",
                "p": {"x": 1, "y": 2, "z": 3, "@due": 0}
            })
        );
        assert_eq!(group.uuid(), uuid());
        assert_eq!(group.kind(), "test");
    }

    fn defaults_round_trip<B: Backing>() {
        let replica = Replica::<B>::new(NodeId::from_seed(1));
        let mut group = GoalGroup::new(&replica, Uuid::new_v4(), "test").unwrap();
        let defaults = json!({"r": 0.5, "g": 0.25, "b": 1.0});
        group.add("color", fields(defaults), None).unwrap();

        assert_eq!(
            group.get("color").unwrap().to_json(),
            json!({"r": 0.5, "g": 0.25, "b": 1.0, "@due": 0})
        );
    }

    #[test]
    fn test_defaults_round_trip_durable() {
        defaults_round_trip::<Durable>();
    }

    #[test]
    fn test_defaults_round_trip_ephemeral() {
        defaults_round_trip::<Ephemeral>();
    }

    #[test]
    fn test_duplicate_add_fails_before_mutation() {
        let replica = Replica::<Durable>::new(NodeId::from_seed(1));
        let mut group = GoalGroup::new(&replica, uuid(), "test").unwrap();
        group.add("position", fields(json!({"x": 0})), None).unwrap();
        replica.drain_outbox();
        let before = group.to_json();

        let err = group.add("position", fields(json!({"y": 9})), None).unwrap_err();
        assert!(matches!(err, GoalError::DuplicateGoal { ref key, .. } if key == "p"));

        // The abbreviation itself collides too
        assert!(group.add("p", fields(json!({"y": 9})), None).is_err());

        assert_eq!(group.to_json(), before);
        assert_eq!(replica.outbox_len(), 0);
        assert_eq!(group.len(), 1);
    }

    #[test]
    fn test_untabulated_name_is_its_own_key() {
        let replica = Replica::<Ephemeral>::new(NodeId::from_seed(1));
        let mut group = GoalGroup::new(&replica, uuid(), "test").unwrap();
        group.add("sparkle", fields(json!({"level": 3})), None).unwrap();

        assert!(group.get("sparkle").is_some());
        assert_eq!(group.to_json()["sparkle"], json!({"level": 3, "@due": 0}));
    }

    #[test]
    fn test_get_by_name_or_key() {
        let replica = Replica::<Durable>::new(NodeId::from_seed(1));
        let mut group = GoalGroup::new(&replica, uuid(), "test").unwrap();
        group.add("opacity", fields(json!({"value": 1.0})), None).unwrap();

        assert_eq!(group.get("opacity").unwrap().key(), "o");
        assert_eq!(group.get("o").unwrap().name(), "opacity");
        assert!(group.get("scale").is_none());
    }

    #[test]
    fn test_from_map_rejects_child() {
        let replica = Replica::<Durable>::new(NodeId::from_seed(1));
        let root = replica.create_root(uuid(), "test").unwrap();
        let child = root.child_or_create("p");
        assert!(matches!(GoalGroup::from_map(child), Err(GoalError::InvalidBacking(_))));
    }

    #[test]
    fn test_from_map_rejects_root_without_metadata() {
        let replica = Replica::<Durable>::new(NodeId::from_seed(1));
        let bare = replica.new_root(uuid()).unwrap();
        assert!(matches!(GoalGroup::from_map(bare), Err(GoalError::InvalidBacking(_))));
    }

    #[test]
    fn test_from_remote_map_keeps_peer_values() {
        let a = Replica::<Durable>::new(NodeId::from_seed(1));
        let b = Replica::<Durable>::new(NodeId::from_seed(2));

        let mut group_a = GoalGroup::new(&a, uuid(), "test").unwrap();
        let pos = group_a.add("position", fields(json!({"x": 0})), None).unwrap();
        pos.update(fields(json!({"x": 42})), 10).unwrap();
        for batch in a.drain_outbox() {
            b.apply(&batch).unwrap();
        }

        let mut group_b = GoalGroup::from_map(b.root(uuid()).unwrap()).unwrap();
        group_b.add("position", fields(json!({"x": 0})), None).unwrap();
        assert_eq!(group_b.get("position").unwrap().get("x"), Some(json!(42)));
        assert_eq!(group_b.get("position").unwrap().due(), 10);
    }

    #[test]
    fn test_achieved_count() {
        let replica = Replica::<Durable>::new(NodeId::from_seed(1));
        let mut group = GoalGroup::new(&replica, uuid(), "test").unwrap();
        group.add("position", fields(json!({"x": 0})), None).unwrap();
        group.add("label", fields(json!({"text": ""})), None).unwrap();

        assert_eq!(group.achieved_count(), 0);
        group.get("label").unwrap().mark_achieved();
        assert_eq!(group.achieved_count(), 1);
    }

    #[test]
    fn test_description_maps_are_byte_identical() {
        let description = json!({
            "position": {"x": 1.5, "y": 0, "z": -2, "@due": 250},
            "label": {"text": "hello"},
            "sparkle": {"level": 2}
        });

        let a = Replica::<Durable>::new(NodeId::from_seed(1));
        let b = Replica::<Durable>::new(NodeId::from_seed(2));
        let map_a = goals_desc_to_map(&a, AbbreviationTable::standard(), "test", uuid(), &description).unwrap();
        let map_b = goals_desc_to_map(&b, AbbreviationTable::standard(), "test", uuid(), &description).unwrap();

        let bytes_a = serde_json::to_vec(&map_a.to_json()).unwrap();
        let bytes_b = serde_json::to_vec(&map_b.to_json()).unwrap();
        assert_eq!(bytes_a, bytes_b);
        assert_eq!(map_a.to_json()["p"]["@due"], json!(250));
        assert_eq!(map_a.to_json()["l"]["@due"], json!(0));
        assert_eq!(a.drain_outbox().len(), 1);
    }

    #[test]
    fn test_description_round_trips_through_to_json() {
        let replica = Replica::<Ephemeral>::new(NodeId::from_seed(1));
        let description = json!({"pointer": {"x": 1, "y": 2, "z": 3, "@due": 9}});
        let map = goals_desc_to_map(&replica, AbbreviationTable::standard(), "cursor", uuid(), &description).unwrap();

        let other = Replica::<Ephemeral>::new(NodeId::from_seed(2));
        let again = goals_desc_to_map(&other, AbbreviationTable::standard(), "cursor", uuid(), &map.to_json()).unwrap();
        assert_eq!(again.to_json(), map.to_json());
    }

    #[test]
    fn test_description_uses_the_given_table() {
        let table = AbbreviationTable::new([("position", "pos"), ("label", "lbl")]).unwrap();
        let replica = Replica::<Durable>::new(NodeId::from_seed(1));
        let description = json!({"position": {"x": 1, "y": 2, "z": 3}});
        let map = goals_desc_to_map(&replica, &table, "test", uuid(), &description).unwrap();

        assert!(map.to_json().get("pos").is_some());
        assert!(map.to_json().get("p").is_none());

        let mut group = GoalGroup::from_map_with_table(map, Rc::new(table)).unwrap();
        let goal = group
            .add("position", fields(json!({"x": 0, "y": 0, "z": 0})), None)
            .unwrap();
        assert_eq!(goal.key(), "pos");
        assert_eq!(goal.get_f64("y"), Some(2.0));
    }

    #[test]
    fn test_invalid_descriptions_leave_replica_untouched() {
        let replica = Replica::<Durable>::new(NodeId::from_seed(1));
        let bad = [
            json!([1, 2, 3]),
            json!({"position": 5}),
            json!({"position": {"@owner": "me"}}),
            json!({"position": {"@due": "soon"}}),
            json!({"position": {"x": 1}, "p": {"x": 2}}),
            json!({"@type": "other"}),
        ];
        for description in &bad {
            assert!(matches!(
                goals_desc_to_map(&replica, AbbreviationTable::standard(), "test", uuid(), description),
                Err(GoalError::InvalidDescription(_))
            ));
        }
        assert!(replica.is_empty());
        assert_eq!(replica.outbox_len(), 0);
    }
}
