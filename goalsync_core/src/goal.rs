//! The "GOAL" - one networked, animatable property bag with convergence
//! tracking.
//!
//! A goal is the target a local animator moves its rendered value toward.
//! Its map holds the target fields plus a due timestamp; any write to that
//! map, local or remote, clears `achieved` so the next frame picks it up.

use goalsync_env::SyncContext;
use nalgebra::Vector3;
use serde_json::Value;
use std::cell::Cell;
use std::collections::BTreeSet;
use std::rc::Rc;

use crate::backing::{check_field_names, Backing, Fields, ReplicatedMap, Slot};
use crate::equality::{EqualityPredicate, ShallowMapEquality};
use crate::error::GoalError;

/// One synchronized property bag.
pub struct Goal<B: Backing> {
    /// Full goal name (e.g. "position")
    name: String,

    /// Wire key the goal is stored under (e.g. "p")
    key: String,

    /// Backing map: target fields + due slot
    map: ReplicatedMap<B>,

    /// "Close enough" test between rendered state and target
    equality: Box<dyn EqualityPredicate>,

    /// Cleared by the map observer on every write
    achieved: Rc<Cell<bool>>,

    /// Keys seeded at construction
    defaults: BTreeSet<String>,
}

impl<B: Backing> Goal<B> {
    /// Creates a goal over `map`, seeding every default that is not already
    /// present.
    ///
    /// Values already in the map (written by an earlier peer) are kept:
    /// defaults are first-writer-wins and also lose against any real write
    /// that arrives later.
    ///
    /// # Errors
    /// `InvalidBacking` if `map` is an entity root rather than a goal map,
    /// `ReservedField` if a default is named like metadata.
    pub fn new(
        name: impl Into<String>,
        key: impl Into<String>,
        map: ReplicatedMap<B>,
        defaults: Fields,
        equality: Option<Box<dyn EqualityPredicate>>,
    ) -> Result<Self, GoalError> {
        let name = name.into();
        if map.is_root() {
            return Err(GoalError::backing(format!(
                "goal '{}' cannot live on an entity root map",
                name
            )));
        }
        check_field_names(&defaults)?;

        map.transact(|tx| {
            tx.seed(Slot::due(), 0u64);
            for (field, value) in &defaults {
                tx.seed(Slot::field(field.as_str()), value.clone());
            }
        });

        let achieved = Rc::new(Cell::new(false));
        let flag = Rc::clone(&achieved);
        map.observe(move |_| flag.set(false));

        Ok(Self {
            name,
            key: key.into(),
            map,
            equality: equality.unwrap_or_else(|| Box::new(ShallowMapEquality)),
            achieved,
            defaults: defaults.into_keys().collect(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wire key of this goal inside its entity map.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current value of a field, or `None` when the field is unknown here.
    ///
    /// Absence is not an error: peers on newer builds may write fields this
    /// client has never heard of, and older peers may lack fields it expects.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.map.get_field(key)
    }

    /// Current value of a field, failing when it is absent.
    pub fn require(&self, key: &str) -> Result<Value, GoalError> {
        self.get(key)
            .ok_or_else(|| GoalError::MissingKey(key.to_string()))
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|v| v.as_f64())
    }

    /// Reads three numeric fields as a vector.
    pub fn get_vec3(&self, keys: [&str; 3]) -> Option<Vector3<f64>> {
        Some(Vector3::new(
            self.get_f64(keys[0])?,
            self.get_f64(keys[1])?,
            self.get_f64(keys[2])?,
        ))
    }

    /// All target fields.
    pub fn fields(&self) -> Fields {
        self.map.fields()
    }

    /// Whether `key` was declared in this goal's defaults.
    pub fn has_default(&self, key: &str) -> bool {
        self.defaults.contains(key)
    }

    /// Due timestamp (wall-clock ms); 0 until first updated.
    pub fn due(&self) -> u64 {
        self.map
            .get(&Slot::due())
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
    }

    /// Writes `due` and every field of `partial` as one atomic transaction.
    ///
    /// No observer, local or remote, can see the new due timestamp without
    /// the values it describes. Nothing is written if a field name is
    /// reserved (`@`-prefixed).
    pub fn update(&self, partial: Fields, due: u64) -> Result<(), GoalError> {
        check_field_names(&partial)?;
        self.map.transact(|tx| {
            tx.set(Slot::due(), due);
            for (field, value) in partial {
                tx.set(Slot::Field(field), value);
            }
        });
        Ok(())
    }

    /// `update` with `due` = the context's current wall clock.
    pub fn update_now<C: SyncContext + ?Sized>(&self, partial: Fields, ctx: &C) -> Result<(), GoalError> {
        self.update(partial, ctx.now_ms())
    }

    /// True once `now` is strictly after the due timestamp.
    pub fn is_past_due(&self, now: u64) -> bool {
        self.due() < now
    }

    /// Compares a rendered value against the target with this goal's
    /// predicate.
    pub fn equals(&self, value: &Fields) -> Result<bool, GoalError> {
        self.equality.equals(value, &self.map.fields())
    }

    pub fn achieved(&self) -> bool {
        self.achieved.get()
    }

    pub fn mark_achieved(&self) {
        self.achieved.set(true);
    }

    /// Sets `achieved` to the result of `equals(value)`.
    ///
    /// On a predicate error `achieved` is left untouched and the error is
    /// returned.
    pub fn mark_achieved_if_equal(&self, value: &Fields) -> Result<bool, GoalError> {
        let equal = self.equals(value)?;
        self.achieved.set(equal);
        Ok(equal)
    }

    /// Snapshot of all fields plus `@due`.
    pub fn to_json(&self) -> Value {
        self.map.to_json()
    }
}

impl<B: Backing> std::fmt::Debug for Goal<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Goal")
            .field("name", &self.name)
            .field("key", &self.key)
            .field("due", &self.due())
            .field("achieved", &self.achieved())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::{fields_from_json, Durable, Ephemeral, Replica};
    use crate::equality::Distance;
    use goalsync_env::NodeId;
    use serde_json::json;
    use uuid::Uuid;

    fn fields(value: Value) -> Fields {
        fields_from_json(value).unwrap()
    }

    fn goal_on<B: Backing>(
        replica: &Replica<B>,
        defaults: Value,
        equality: Option<Box<dyn EqualityPredicate>>,
    ) -> Goal<B> {
        let root = replica.create_root(Uuid::new_v4(), "test").unwrap();
        let map = root.child_or_create("p");
        Goal::new("position", "p", map, fields(defaults), equality).unwrap()
    }

    #[test]
    fn test_defaults_seeded_with_zero_due() {
        let replica = Replica::<Ephemeral>::new(NodeId::from_seed(1));
        let goal = goal_on(&replica, json!({"x": 1, "y": 2, "z": 3}), None);

        assert_eq!(goal.to_json(), json!({"x": 1, "y": 2, "z": 3, "@due": 0}));
        assert_eq!(goal.due(), 0);
        assert!(goal.has_default("x"));
        assert!(!goal.achieved());
    }

    #[test]
    fn test_defaults_do_not_clobber_existing_values() {
        let replica = Replica::<Durable>::new(NodeId::from_seed(1));
        let root = replica.create_root(Uuid::new_v4(), "test").unwrap();
        let map = root.child_or_create("p");
        map.transact(|tx| {
            tx.set(Slot::due(), 50u64);
            tx.set(Slot::field("x"), 9);
        });

        let goal = Goal::new("position", "p", map, fields(json!({"x": 0, "y": 0})), None).unwrap();
        assert_eq!(goal.get("x"), Some(json!(9)));
        assert_eq!(goal.get("y"), Some(json!(0)));
        assert_eq!(goal.due(), 50);
    }

    #[test]
    fn test_root_map_is_invalid_backing() {
        let replica = Replica::<Durable>::new(NodeId::from_seed(1));
        let root = replica.create_root(Uuid::new_v4(), "test").unwrap();
        let result = Goal::new("position", "p", root, Fields::new(), None);
        assert!(matches!(result, Err(GoalError::InvalidBacking(_))));
    }

    #[test]
    fn test_get_absent_key_is_none() {
        let replica = Replica::<Durable>::new(NodeId::from_seed(1));
        let goal = goal_on(&replica, json!({"x": 0}), None);

        assert_eq!(goal.get("shininess"), None);
        assert!(matches!(goal.require("shininess"), Err(GoalError::MissingKey(_))));
        assert_eq!(goal.require("x").unwrap(), json!(0));
    }

    #[test]
    fn test_mark_achieved_idempotent() {
        let replica = Replica::<Durable>::new(NodeId::from_seed(1));
        let goal = goal_on(&replica, json!({"x": 0}), None);
        let before = goal.to_json();

        goal.mark_achieved();
        goal.mark_achieved();

        assert!(goal.achieved());
        assert_eq!(goal.to_json(), before);
    }

    #[test]
    fn test_update_clears_achieved() {
        let replica = Replica::<Durable>::new(NodeId::from_seed(1));
        let goal = goal_on(&replica, json!({"x": 0}), None);
        goal.mark_achieved();

        goal.update(fields(json!({"x": 5})), 100).unwrap();
        assert!(!goal.achieved());
    }

    #[test]
    fn test_update_twice_equals_target() {
        let replica = Replica::<Durable>::new(NodeId::from_seed(1));
        let goal = goal_on(&replica, json!({"x": 0}), None);

        goal.update(fields(json!({"x": 5})), 10).unwrap();
        goal.update(fields(json!({"x": 5})), 20).unwrap();
        assert!(goal.equals(&fields(json!({"x": 5}))).unwrap());
    }

    #[test]
    fn test_fresh_goal_is_past_due() {
        let replica = Replica::<Ephemeral>::new(NodeId::from_seed(1));
        let goal = goal_on(&replica, json!({"x": 0}), None);
        assert!(goal.is_past_due(1));
        assert!(!goal.is_past_due(0));
    }

    #[test]
    fn test_distance_goal_equality() {
        let replica = Replica::<Durable>::new(NodeId::from_seed(1));
        let goal = goal_on(
            &replica,
            json!({"x": 0, "y": 0, "z": 0}),
            Some(Box::new(Distance::new(0.01))),
        );

        goal.update(fields(json!({"x": 0.001, "y": 0, "z": 0})), 0).unwrap();
        assert!(goal.equals(&fields(json!({"x": 0, "y": 0, "z": 0}))).unwrap());
        assert!(!goal.equals(&fields(json!({"x": 1, "y": 0, "z": 0}))).unwrap());
    }

    #[test]
    fn test_due_reflects_latest_write() {
        let replica = Replica::<Durable>::new(NodeId::from_seed(1));
        let goal = goal_on(&replica, json!({"x": 0}), None);

        let (t1, t2) = (1_000, 2_000);
        goal.update(fields(json!({"x": 10})), t1).unwrap();
        goal.update(fields(json!({"x": 20})), t2).unwrap();

        for now in [t1 + 1, 1_500, t2 - 1] {
            assert!(!goal.is_past_due(now));
        }
        assert!(goal.is_past_due(t2 + 1));
    }

    #[test]
    fn test_mark_achieved_if_equal() {
        let replica = Replica::<Durable>::new(NodeId::from_seed(1));
        let goal = goal_on(&replica, json!({"label": "a"}), None);

        assert!(!goal.mark_achieved_if_equal(&fields(json!({"label": "b"}))).unwrap());
        assert!(!goal.achieved());
        assert!(goal.mark_achieved_if_equal(&fields(json!({"label": "a"}))).unwrap());
        assert!(goal.achieved());
    }

    #[test]
    fn test_predicate_error_propagates_and_keeps_flag() {
        let replica = Replica::<Durable>::new(NodeId::from_seed(1));
        let goal = goal_on(&replica, json!({"x": 0, "y": 0, "z": 0}), Some(Box::new(Distance::new(0.1))));
        goal.mark_achieved();

        let result = goal.mark_achieved_if_equal(&fields(json!({"x": "nope"})));
        assert!(result.is_err());
        assert!(goal.achieved());
    }

    #[test]
    fn test_remote_update_clears_achieved() {
        let a = Replica::<Ephemeral>::new(NodeId::from_seed(1));
        let b = Replica::<Ephemeral>::new(NodeId::from_seed(2));
        let entity = Uuid::new_v4();

        let root_a = a.create_root(entity, "cursor").unwrap();
        let goal_a = Goal::new("pointer", "pt", root_a.child_or_create("pt"), fields(json!({"x": 0})), None).unwrap();
        for batch in a.drain_outbox() {
            b.apply(&batch).unwrap();
        }

        let root_b = b.root(entity).unwrap();
        let goal_b = Goal::new("pointer", "pt", root_b.child_or_create("pt"), fields(json!({"x": 0})), None).unwrap();
        goal_b.mark_achieved();

        goal_a.update(fields(json!({"x": 3})), 77).unwrap();
        for batch in a.drain_outbox() {
            b.apply(&batch).unwrap();
        }

        assert!(!goal_b.achieved());
        assert_eq!(goal_b.get("x"), Some(json!(3)));
        assert_eq!(goal_b.due(), 77);
    }

    #[test]
    fn test_reserved_field_name_rejected() {
        let replica = Replica::<Durable>::new(NodeId::from_seed(1));
        let goal = goal_on(&replica, json!({"x": 0}), None);
        goal.update(fields(json!({"x": 1})), 100).unwrap();
        replica.drain_outbox();

        assert!(matches!(
            goal.update(fields(json!({"@due": 5, "x": 2})), 200),
            Err(GoalError::ReservedField(_))
        ));
        assert_eq!(goal.due(), 100);
        assert_eq!(goal.get_f64("x"), Some(1.0));
        assert_eq!(goal.to_json()["@due"], json!(100));
        assert_eq!(replica.outbox_len(), 0);

        let root = replica.create_root(Uuid::new_v4(), "test").unwrap();
        let seeded = Goal::new(
            "label",
            "l",
            root.child_or_create("l"),
            fields(json!({"@owner": "me"})),
            None,
        );
        assert!(matches!(seeded, Err(GoalError::ReservedField(_))));
    }

    #[test]
    fn test_update_now_uses_context_clock() {
        let replica = Replica::<Ephemeral>::new(NodeId::from_seed(1));
        let goal = goal_on(&replica, json!({"x": 0}), None);
        let ctx = goalsync_env::TokioContext::new();

        let before = ctx.now_ms();
        goal.update_now(fields(json!({"x": 4})), &ctx).unwrap();
        assert!(goal.due() >= before);
        assert!(goal.due() <= ctx.now_ms());
        assert_eq!(goal.get_f64("x"), Some(4.0));
    }

    #[test]
    fn test_update_is_single_atomic_batch() {
        let replica = Replica::<Durable>::new(NodeId::from_seed(1));
        let goal = goal_on(&replica, json!({"x": 0, "y": 0}), None);
        replica.drain_outbox();

        goal.update(fields(json!({"x": 1, "y": 2})), 500).unwrap();
        let batches = replica.drain_outbox();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].op_count(), 3);
    }
}
