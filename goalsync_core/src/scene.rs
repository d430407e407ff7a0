//! The "SCENE" Dispatch - entities, their animator components, and the one
//! per-frame loop that drives them.
//!
//! An `Entity` pairs a `GoalGroup` with the components animating its goals.
//! Each frame the scene checks every component's goal: an achieved goal
//! costs one boolean check, anything else runs the component and publishes
//! the rendered value to the `SceneGraph`.

use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::ops::AddAssign;
use std::rc::Rc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backing::{Backing, Fields};
use crate::error::GoalError;
use crate::goal::Goal;
use crate::goal_group::GoalGroup;
use crate::interpolation::{DiscreteApplier, FrameClock, FrameOutcome, GoalConsumer};

// ============================================================================
// COLLABORATORS
// ============================================================================

/// The rendering layer, as seen by the engine: a per-frame property setter.
pub trait SceneGraph {
    /// Publishes the rendered value of one goal of one entity.
    fn set_property(&mut self, entity: Uuid, goal: &str, value: &Fields);

    /// The entity left the scene.
    fn remove_entity(&mut self, _entity: Uuid) {}
}

/// Scene graph that drops everything (headless peers).
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSceneGraph;

impl SceneGraph for NullSceneGraph {
    fn set_property(&mut self, _entity: Uuid, _goal: &str, _value: &Fields) {}
}

/// Scene graph that keeps the latest published value of every property.
#[derive(Debug, Default, Clone)]
pub struct RecordingSceneGraph {
    properties: BTreeMap<(Uuid, String), Fields>,
    /// Total `set_property` calls
    pub writes: u64,
    /// Entities removed, in order
    pub removed: Vec<Uuid>,
}

impl RecordingSceneGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest published value of one property.
    pub fn property(&self, entity: Uuid, goal: &str) -> Option<&Fields> {
        self.properties.get(&(entity, goal.to_string()))
    }
}

impl SceneGraph for RecordingSceneGraph {
    fn set_property(&mut self, entity: Uuid, goal: &str, value: &Fields) {
        self.writes += 1;
        self.properties
            .insert((entity, goal.to_string()), value.clone());
    }

    fn remove_entity(&mut self, entity: Uuid) {
        self.properties.retain(|(id, _), _| *id != entity);
        self.removed.push(entity);
    }
}

/// Completion callback of an asset load.
pub type AssetCallback = Box<dyn FnOnce(Result<(), String>)>;

/// Asset loading service (meshes, textures, clips).
pub trait AssetLoader {
    /// Starts loading `url`; `on_complete` runs when the load finishes.
    fn load(&self, url: &str, on_complete: AssetCallback);
}

/// Loader that completes every request immediately and remembers the URLs.
#[derive(Debug, Default)]
pub struct ImmediateAssetLoader {
    requested: RefCell<Vec<String>>,
}

impl ImmediateAssetLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requested(&self) -> Vec<String> {
        self.requested.borrow().clone()
    }
}

impl AssetLoader for ImmediateAssetLoader {
    fn load(&self, url: &str, on_complete: AssetCallback) {
        self.requested.borrow_mut().push(url.to_string());
        on_complete(Ok(()));
    }
}

/// Applies an asset goal: snaps the fields and starts a load whenever the
/// URL changes. The rendered value only reports the URL once it has loaded.
pub struct AssetApplier {
    url_key: String,
    applier: DiscreteApplier,
    loader: Rc<dyn AssetLoader>,
    requested: Option<String>,
    loaded: Rc<RefCell<Option<String>>>,
}

impl AssetApplier {
    pub fn new(url_key: impl Into<String>, loader: Rc<dyn AssetLoader>) -> Self {
        Self {
            url_key: url_key.into(),
            applier: DiscreteApplier::all(),
            loader,
            requested: None,
            loaded: Rc::new(RefCell::new(None)),
        }
    }

    /// URL of the last asset that finished loading.
    pub fn loaded(&self) -> Option<String> {
        self.loaded.borrow().clone()
    }

    fn request<B: Backing>(&mut self, goal: &Goal<B>) {
        let url = match goal.get(&self.url_key).and_then(|v| v.as_str().map(str::to_string)) {
            Some(url) if !url.is_empty() => url,
            _ => return,
        };
        if self.requested.as_deref() == Some(url.as_str()) {
            return;
        }

        let slot = Rc::clone(&self.loaded);
        let target = url.clone();
        self.loader.load(
            &url,
            Box::new(move |result| match result {
                Ok(()) => *slot.borrow_mut() = Some(target),
                Err(e) => warn!(url = %target, error = %e, "asset load failed"),
            }),
        );
        self.requested = Some(url);
    }
}

impl<B: Backing> GoalConsumer<B> for AssetApplier {
    fn snap(&mut self, goal: &Goal<B>) {
        GoalConsumer::<B>::snap(&mut self.applier, goal);
        self.request(goal);
    }

    fn blend(&mut self, goal: &Goal<B>, _clock: &FrameClock) {
        GoalConsumer::<B>::snap(self, goal);
    }

    fn rendered(&self) -> Fields {
        let mut fields = GoalConsumer::<B>::rendered(&self.applier);
        match self.loaded() {
            Some(url) => fields.insert(self.url_key.clone(), url.into()),
            None => fields.remove(&self.url_key),
        };
        fields
    }

    fn frame(&mut self, goal: &Goal<B>, _clock: &FrameClock) -> Result<FrameOutcome, GoalError> {
        if goal.achieved() {
            return Ok(FrameOutcome::Idle);
        }
        GoalConsumer::<B>::snap(self, goal);
        goal.mark_achieved();
        Ok(FrameOutcome::Snapped)
    }
}

// ============================================================================
// ENTITY
// ============================================================================

/// One animated entity: its goals and the components consuming them.
pub struct Entity<B: Backing> {
    group: GoalGroup<B>,
    components: Vec<(String, Box<dyn GoalConsumer<B>>)>,
}

impl<B: Backing> Entity<B> {
    pub fn new(group: GoalGroup<B>) -> Self {
        Self {
            group,
            components: Vec::new(),
        }
    }

    /// Attaches a component to a registered goal.
    ///
    /// # Errors
    /// `MissingKey` if the group has no goal of that name.
    pub fn attach(
        &mut self,
        goal: &str,
        consumer: Box<dyn GoalConsumer<B>>,
    ) -> Result<(), GoalError> {
        let key = self
            .group
            .get(goal)
            .map(|g| g.key().to_string())
            .ok_or_else(|| GoalError::MissingKey(goal.to_string()))?;
        self.components.push((key, consumer));
        Ok(())
    }

    pub fn uuid(&self) -> Uuid {
        self.group.uuid()
    }

    pub fn kind(&self) -> String {
        self.group.kind()
    }

    pub fn group(&self) -> &GoalGroup<B> {
        &self.group
    }

    pub fn group_mut(&mut self) -> &mut GoalGroup<B> {
        &mut self.group
    }

    pub fn component_count(&self) -> usize {
        self.components.len()
    }

    /// Current rendered value of the component attached to `goal`.
    pub fn rendered(&self, goal: &str) -> Option<Fields> {
        let key = self.group.get(goal)?.key();
        self.components
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, c)| c.rendered())
    }
}

// ============================================================================
// SCENE
// ============================================================================

/// Per-frame counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameStats {
    /// Components inspected
    pub checked: u64,
    /// Components skipped because their goal was achieved
    pub idle: u64,
    pub snapped: u64,
    pub interpolated: u64,
    pub converged: u64,
    /// Equality errors (entity skipped for the frame)
    pub errors: u64,
}

impl FrameStats {
    /// Components that did real work.
    pub fn active(&self) -> u64 {
        self.snapped + self.interpolated + self.converged
    }
}

impl AddAssign for FrameStats {
    fn add_assign(&mut self, rhs: Self) {
        self.checked += rhs.checked;
        self.idle += rhs.idle;
        self.snapped += rhs.snapped;
        self.interpolated += rhs.interpolated;
        self.converged += rhs.converged;
        self.errors += rhs.errors;
    }
}

/// All entities of one realization.
pub struct Scene<B: Backing> {
    entities: BTreeMap<Uuid, Entity<B>>,
}

impl<B: Backing> Default for Scene<B> {
    fn default() -> Self {
        Self {
            entities: BTreeMap::new(),
        }
    }
}

impl<B: Backing> Scene<B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entity: Entity<B>) -> Result<(), GoalError> {
        let id = entity.uuid();
        if self.entities.contains_key(&id) {
            return Err(GoalError::DuplicateEntity(id));
        }
        debug!(entity = %id, kind = %entity.kind(), "entity added to scene");
        self.entities.insert(id, entity);
        Ok(())
    }

    pub fn remove(&mut self, id: Uuid) -> Option<Entity<B>> {
        self.entities.remove(&id)
    }

    pub fn get(&self, id: Uuid) -> Option<&Entity<B>> {
        self.entities.get(&id)
    }

    pub fn get_mut(&mut self, id: Uuid) -> Option<&mut Entity<B>> {
        self.entities.get_mut(&id)
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.entities.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.entities.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Runs one frame over every component of every entity.
    pub fn frame(&mut self, clock: &FrameClock, graph: &mut dyn SceneGraph) -> FrameStats {
        let mut stats = FrameStats::default();

        for (id, entity) in self.entities.iter_mut() {
            for (key, consumer) in entity.components.iter_mut() {
                stats.checked += 1;
                let goal = match entity.group.get(key) {
                    Some(goal) => goal,
                    None => continue,
                };
                if goal.achieved() {
                    stats.idle += 1;
                    continue;
                }

                match consumer.frame(goal, clock) {
                    Ok(outcome) => {
                        match outcome {
                            FrameOutcome::Idle => stats.idle += 1,
                            FrameOutcome::Snapped => stats.snapped += 1,
                            FrameOutcome::Interpolating => stats.interpolated += 1,
                            FrameOutcome::Converged => stats.converged += 1,
                        }
                        if outcome.rendered_changed() {
                            graph.set_property(*id, key, &consumer.rendered());
                        }
                    }
                    Err(e) => {
                        warn!(entity = %id, goal = %key, error = %e, "equality check failed; skipping entity this frame");
                        stats.errors += 1;
                        break;
                    }
                }
            }
        }

        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::{fields_from_json, Durable, Ephemeral, Replica};
    use crate::equality::Distance;
    use crate::interpolation::{BlendMode, Vec3Animator};
    use goalsync_env::NodeId;
    use nalgebra::Vector3;
    use serde_json::{json, Value};

    fn fields(value: Value) -> Fields {
        fields_from_json(value).unwrap()
    }

    fn moving_entity<B: Backing>(replica: &Replica<B>, id: Uuid) -> Entity<B> {
        let mut group = GoalGroup::new(replica, id, "test").unwrap();
        group
            .add(
                "position",
                fields(json!({"x": 0.0, "y": 0.0, "z": 0.0})),
                Some(Box::new(Distance::new(0.01))),
            )
            .unwrap();
        group.add("label", fields(json!({"text": ""})), None).unwrap();

        let mut entity = Entity::new(group);
        entity
            .attach(
                "position",
                Box::new(Vec3Animator::new(Vector3::zeros(), BlendMode::FixedRate { rate: 0.5 })),
            )
            .unwrap();
        entity.attach("label", Box::new(DiscreteApplier::all())).unwrap();
        entity
    }

    #[test]
    fn test_attach_unknown_goal_fails() {
        let replica = Replica::<Durable>::new(NodeId::from_seed(1));
        let group = GoalGroup::new(&replica, Uuid::new_v4(), "test").unwrap();
        let mut entity = Entity::new(group);
        let result = entity.attach("position", Box::new(DiscreteApplier::all()));
        assert!(matches!(result, Err(GoalError::MissingKey(_))));
    }

    #[test]
    fn test_idle_scene_only_checks_flags() {
        let replica = Replica::<Ephemeral>::new(NodeId::from_seed(1));
        let mut scene = Scene::new();
        for _ in 0..200 {
            scene.insert(moving_entity(&replica, Uuid::new_v4())).unwrap();
        }
        let mut graph = RecordingSceneGraph::new();

        // First frame applies seeded state
        let first = scene.frame(&FrameClock::new(1, 0.016), &mut graph);
        assert_eq!(first.snapped, 400);

        let writes = graph.writes;
        let idle = scene.frame(&FrameClock::new(2, 0.016), &mut graph);
        assert_eq!(idle.checked, 400);
        assert_eq!(idle.idle, 400);
        assert_eq!(idle.active(), 0);
        assert_eq!(graph.writes, writes);
    }

    #[test]
    fn test_update_publishes_until_converged() {
        let replica = Replica::<Durable>::new(NodeId::from_seed(1));
        let id = Uuid::new_v4();
        let mut scene = Scene::new();
        scene.insert(moving_entity(&replica, id)).unwrap();
        let mut graph = RecordingSceneGraph::new();
        scene.frame(&FrameClock::new(1, 0.016), &mut graph);

        scene
            .get(id)
            .unwrap()
            .group()
            .get("position")
            .unwrap()
            .update(fields(json!({"x": 1.0, "y": 0.0, "z": 0.0})), 10_000).unwrap();

        let mut converged = false;
        for _ in 0..20 {
            let stats = scene.frame(&FrameClock::new(100, 0.016), &mut graph);
            assert_eq!(stats.errors, 0);
            if stats.converged == 1 {
                converged = true;
                break;
            }
        }
        assert!(converged);
        let x = graph.property(id, "p").unwrap()["x"].as_f64().unwrap();
        assert!((x - 1.0).abs() <= 0.01);
    }

    #[test]
    fn test_equality_error_skips_entity() {
        let replica = Replica::<Durable>::new(NodeId::from_seed(1));
        let id = Uuid::new_v4();
        let mut scene = Scene::new();
        scene.insert(moving_entity(&replica, id)).unwrap();
        let mut graph = NullSceneGraph;
        scene.frame(&FrameClock::new(1, 0.016), &mut graph);

        let group = scene.get(id).unwrap().group();
        group
            .get("position")
            .unwrap()
            .update(fields(json!({"x": "left", "y": 0.0, "z": 0.0})), 10_000).unwrap();
        group.get("label").unwrap().update(fields(json!({"text": "hi"})), 10_000).unwrap();

        let stats = scene.frame(&FrameClock::new(100, 0.016), &mut graph);
        assert_eq!(stats.errors, 1);
        // The label component comes after position and waits a frame
        assert!(!scene.get(id).unwrap().group().get("label").unwrap().achieved());
    }

    #[test]
    fn test_duplicate_entity_rejected() {
        let replica = Replica::<Durable>::new(NodeId::from_seed(1));
        let other = Replica::<Durable>::new(NodeId::from_seed(2));
        let id = Uuid::new_v4();
        let mut scene = Scene::new();
        scene.insert(moving_entity(&replica, id)).unwrap();
        assert!(matches!(
            scene.insert(moving_entity(&other, id)),
            Err(GoalError::DuplicateEntity(_))
        ));
    }

    #[test]
    fn test_asset_applier_loads_on_change() {
        let replica = Replica::<Durable>::new(NodeId::from_seed(1));
        let loader = Rc::new(ImmediateAssetLoader::new());
        let mut group = GoalGroup::new(&replica, Uuid::new_v4(), "model").unwrap();
        group.add("asset", fields(json!({"url": ""})), None).unwrap();
        let goal = group.get("asset").unwrap();

        let mut applier = AssetApplier::new("url", loader.clone());
        let clock = FrameClock::new(1, 0.016);
        GoalConsumer::<Durable>::frame(&mut applier, goal, &clock).unwrap();
        assert!(loader.requested().is_empty());

        goal.update(fields(json!({"url": "https://cdn/chair.glb"})), 0).unwrap();
        GoalConsumer::<Durable>::frame(&mut applier, goal, &clock).unwrap();
        goal.update(fields(json!({"url": "https://cdn/chair.glb"})), 0).unwrap();
        GoalConsumer::<Durable>::frame(&mut applier, goal, &clock).unwrap();

        assert_eq!(loader.requested(), vec!["https://cdn/chair.glb".to_string()]);
        assert_eq!(applier.loaded().as_deref(), Some("https://cdn/chair.glb"));
        assert_eq!(
            GoalConsumer::<Durable>::rendered(&applier)["url"],
            json!("https://cdn/chair.glb")
        );
    }

    #[test]
    fn test_recording_graph_forgets_removed_entity() {
        let mut graph = RecordingSceneGraph::new();
        let id = Uuid::new_v4();
        graph.set_property(id, "p", &fields(json!({"x": 1})));
        graph.remove_entity(id);
        assert!(graph.property(id, "p").is_none());
        assert_eq!(graph.removed, vec![id]);
    }
}
