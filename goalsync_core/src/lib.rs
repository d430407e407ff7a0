//! GoalSync Core - Goal Synchronization & Interpolation Engine
//!
//! Reconciles remotely-set target values of shared, animated entities with a
//! locally-rendered, smoothly-animated view:
//! 1. **Rubber-banding**: stale or bursty updates snap once (`due` timestamps)
//!    instead of dragging the rendered value back and forth
//! 2. **Idle cost**: an achieved goal costs one boolean check per frame
//! 3. **Two backings, one algorithm**: durable and ephemeral replicated maps
//!    share the same Goal / GoalGroup code through a static `Backing` trait
//!
//! # Layout
//!
//! ```text
//! Entity ──► GoalGroup ──► Goal ──► ReplicatedMap<B> ──► Replica<B> ──► OpBatch ──► wire
//!   │                        ▲
//!   └── GoalConsumer ────────┘  (snap / blend / mark_achieved each frame)
//! ```

pub mod abbrev;
pub mod backing;
pub mod client;
pub mod config;
pub mod equality;
pub mod error;
pub mod goal;
pub mod goal_group;
pub mod interpolation;
pub mod oplog;
pub mod scene;
pub mod wire;

// Re-export key types for convenience
pub use abbrev::AbbreviationTable;
pub use backing::{
    fields_from_json, ApplyOutcome, Backing, BatchBody, ChangeOrigin, Durable, Ephemeral, Fields,
    MapChange, MapOp, MetaKey, OpBatch, Replica, ReplicatedMap, Slot, Stamp, Transaction,
};
pub use client::{ComponentFactory, StandardComponents, SyncClient};
pub use config::ClientConfig;
pub use equality::{Delta, Distance, EqualityPredicate, ShallowMapEquality};
pub use error::GoalError;
pub use goal::Goal;
pub use goal_group::{goals_desc_to_map, GoalGroup};
pub use interpolation::{
    BlendMode, DiscreteApplier, FrameClock, FrameOutcome, GoalConsumer, ScalarAnimator,
    Vec3Animator,
};
pub use oplog::{MemoryOpLog, OpLog, SledOpLog};
pub use scene::{
    AssetApplier, AssetLoader, Entity, FrameStats, ImmediateAssetLoader, NullSceneGraph,
    RecordingSceneGraph, Scene, SceneGraph,
};
