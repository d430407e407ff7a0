//! The "INTERPOLATION" Contract - how animators consume goals each frame.
//!
//! Every animator keeps its own rendered value and follows the same rule:
//! - achieved goal: no work at all
//! - past due: snap the rendered value to the target and mark achieved
//! - otherwise: blend toward the target, then `mark_achieved_if_equal`
//!
//! Snapping favours correctness over smoothness. A stale or bursty update
//! therefore ends in at most one visible jump instead of rubber-banding.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backing::{Backing, Fields};
use crate::error::GoalError;
use crate::goal::Goal;

/// How far toward its target a rendered value moves in one frame.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum BlendMode {
    /// A fixed fraction of the remaining distance per frame
    FixedRate { rate: f64 },
    /// A fixed speed in units per second; never overshoots
    DistanceProportional { speed: f64 },
}

impl BlendMode {
    /// Blend factor in `[0, 1]` for a value `distance` away from its target.
    pub fn factor(&self, distance: f64, dt_secs: f64) -> f64 {
        match *self {
            BlendMode::FixedRate { rate } => rate.clamp(0.0, 1.0),
            BlendMode::DistanceProportional { speed } => {
                if distance <= f64::EPSILON {
                    1.0
                } else {
                    (speed.max(0.0) * dt_secs.max(0.0) / distance).min(1.0)
                }
            }
        }
    }
}

impl Default for BlendMode {
    fn default() -> Self {
        BlendMode::FixedRate { rate: 0.2 }
    }
}

/// Time inputs of one frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameClock {
    /// Wall clock (ms), compared against goal due timestamps
    pub now_ms: u64,
    /// Seconds since the previous frame
    pub dt_secs: f64,
}

impl FrameClock {
    pub fn new(now_ms: u64, dt_secs: f64) -> Self {
        Self { now_ms, dt_secs }
    }
}

/// What one consumer did during one frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Goal already achieved; nothing done
    Idle,
    /// Past due; rendered value set to the target
    Snapped,
    /// Blended, still short of the target
    Interpolating,
    /// Blended and now equal to the target
    Converged,
}

impl FrameOutcome {
    /// Whether the rendered value changed this frame.
    pub fn rendered_changed(&self) -> bool {
        !matches!(self, FrameOutcome::Idle)
    }
}

/// A per-property animator driven by one goal.
pub trait GoalConsumer<B: Backing> {
    /// Sets the rendered value to the goal's value for every relevant key.
    fn snap(&mut self, goal: &Goal<B>);

    /// Moves the rendered value toward the goal.
    fn blend(&mut self, goal: &Goal<B>, clock: &FrameClock);

    /// Current rendered value, in the goal's field shape.
    fn rendered(&self) -> Fields;

    /// Runs the per-frame contract.
    ///
    /// # Errors
    /// Equality errors from `mark_achieved_if_equal`. The rendered value has
    /// already moved when one is returned; `achieved` is left as it was.
    fn frame(&mut self, goal: &Goal<B>, clock: &FrameClock) -> Result<FrameOutcome, GoalError> {
        if goal.achieved() {
            return Ok(FrameOutcome::Idle);
        }

        if goal.is_past_due(clock.now_ms) {
            self.snap(goal);
            goal.mark_achieved();
            return Ok(FrameOutcome::Snapped);
        }

        self.blend(goal, clock);
        if goal.mark_achieved_if_equal(&self.rendered())? {
            Ok(FrameOutcome::Converged)
        } else {
            Ok(FrameOutcome::Interpolating)
        }
    }
}

// ============================================================================
// VECTOR ANIMATOR (position, scale, pointer)
// ============================================================================

/// Animates three numeric fields as one vector.
#[derive(Clone, Debug)]
pub struct Vec3Animator {
    keys: [String; 3],
    value: Vector3<f64>,
    mode: BlendMode,
}

impl Vec3Animator {
    /// Animator over `x`, `y`, `z`.
    pub fn new(initial: Vector3<f64>, mode: BlendMode) -> Self {
        Self::with_keys(["x", "y", "z"], initial, mode)
    }

    pub fn with_keys(keys: [&str; 3], initial: Vector3<f64>, mode: BlendMode) -> Self {
        Self {
            keys: keys.map(str::to_string),
            value: initial,
            mode,
        }
    }

    pub fn value(&self) -> Vector3<f64> {
        self.value
    }

    fn target<B: Backing>(&self, goal: &Goal<B>) -> Option<Vector3<f64>> {
        goal.get_vec3([
            self.keys[0].as_str(),
            self.keys[1].as_str(),
            self.keys[2].as_str(),
        ])
    }
}

impl<B: Backing> GoalConsumer<B> for Vec3Animator {
    fn snap(&mut self, goal: &Goal<B>) {
        if let Some(target) = self.target(goal) {
            self.value = target;
        }
    }

    fn blend(&mut self, goal: &Goal<B>, clock: &FrameClock) {
        if let Some(target) = self.target(goal) {
            let delta = target - self.value;
            self.value += delta * self.mode.factor(delta.norm(), clock.dt_secs);
        }
    }

    fn rendered(&self) -> Fields {
        self.keys
            .iter()
            .zip(self.value.iter())
            .map(|(k, v)| (k.clone(), Value::from(*v)))
            .collect()
    }
}

// ============================================================================
// SCALAR ANIMATOR (opacity, single numbers)
// ============================================================================

/// Animates one numeric field.
#[derive(Clone, Debug)]
pub struct ScalarAnimator {
    key: String,
    value: f64,
    mode: BlendMode,
}

impl ScalarAnimator {
    pub fn new(key: impl Into<String>, initial: f64, mode: BlendMode) -> Self {
        Self {
            key: key.into(),
            value: initial,
            mode,
        }
    }

    pub fn value(&self) -> f64 {
        self.value
    }
}

impl<B: Backing> GoalConsumer<B> for ScalarAnimator {
    fn snap(&mut self, goal: &Goal<B>) {
        if let Some(target) = goal.get_f64(&self.key) {
            self.value = target;
        }
    }

    fn blend(&mut self, goal: &Goal<B>, clock: &FrameClock) {
        if let Some(target) = goal.get_f64(&self.key) {
            let delta = target - self.value;
            self.value += delta * self.mode.factor(delta.abs(), clock.dt_secs);
        }
    }

    fn rendered(&self) -> Fields {
        Fields::from([(self.key.clone(), Value::from(self.value))])
    }
}

// ============================================================================
// DISCRETE APPLIER (labels, assets, lock flags)
// ============================================================================

/// Applies non-numeric values as soon as they change. Never blends.
#[derive(Clone, Debug, Default)]
pub struct DiscreteApplier {
    /// Keys to copy; `None` copies every field
    keys: Option<Vec<String>>,
    value: Fields,
}

impl DiscreteApplier {
    /// Applier copying every field of the goal.
    pub fn all() -> Self {
        Self::default()
    }

    /// Applier copying only `keys`.
    pub fn keys<'a>(keys: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            keys: Some(keys.into_iter().map(str::to_string).collect()),
            value: Fields::new(),
        }
    }

    pub fn value(&self) -> &Fields {
        &self.value
    }
}

impl<B: Backing> GoalConsumer<B> for DiscreteApplier {
    fn snap(&mut self, goal: &Goal<B>) {
        match &self.keys {
            None => self.value = goal.fields(),
            Some(keys) => {
                for key in keys {
                    match goal.get(key) {
                        Some(v) => self.value.insert(key.clone(), v),
                        None => self.value.remove(key),
                    };
                }
            }
        }
    }

    fn blend(&mut self, goal: &Goal<B>, _clock: &FrameClock) {
        <Self as GoalConsumer<B>>::snap(self, goal);
    }

    fn rendered(&self) -> Fields {
        self.value.clone()
    }

    fn frame(&mut self, goal: &Goal<B>, _clock: &FrameClock) -> Result<FrameOutcome, GoalError> {
        if goal.achieved() {
            return Ok(FrameOutcome::Idle);
        }
        <Self as GoalConsumer<B>>::snap(self, goal);
        goal.mark_achieved();
        Ok(FrameOutcome::Snapped)
    }
}
