//! JSON exporter for offline inspection of a run.
//!
//! Records, per sampled tick, every peer's rendered and authoritative value
//! of one goal per entity, plus the relay counters.

use crate::relay::RelayStats;
use crate::world::SimWorld;

use goalsync_core::FrameStats;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::File;
use std::io::Write;

/// A single frame of simulation data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimFrame {
    /// Simulation time in seconds
    pub time_sec: f64,

    /// Per-peer view
    pub peers: Vec<PeerFrame>,

    /// Relay counters at this tick
    pub relay: RelayStats,

    /// Events (joins, partitions, disconnects)
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<SimEvent>,
}

/// One peer's view of the tracked goals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerFrame {
    pub peer: String,
    pub entities: Vec<EntityView>,
}

/// Authoritative and rendered value of one goal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityView {
    pub entity: String,
    pub goal: String,
    pub authoritative: Option<Value>,
    pub rendered: Option<Value>,
}

/// Simulation event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimEvent {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

impl SimEvent {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level: None,
        }
    }
}

/// Complete simulation export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimExport {
    /// Scenario name
    pub scenario: String,

    /// Seed used
    pub seed: u64,

    /// Duration in seconds
    pub duration_sec: f64,

    /// All frames
    pub frames: Vec<SimFrame>,

    /// Final results
    pub passed: bool,

    /// Frame work summed over the run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_totals: Option<FrameStats>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl SimExport {
    /// Creates a new export container.
    pub fn new(scenario: &str, seed: u64) -> Self {
        Self {
            scenario: scenario.to_string(),
            seed,
            duration_sec: 0.0,
            frames: Vec::new(),
            passed: false,
            frame_totals: None,
            failure_reason: None,
        }
    }

    /// Adds a frame.
    pub fn add_frame(&mut self, frame: SimFrame) {
        self.duration_sec = frame.time_sec;
        self.frames.push(frame);
    }

    /// Samples the world: `goal` of every live entity, on every peer.
    pub fn capture(&mut self, world: &SimWorld, goal: &str, events: Vec<SimEvent>) {
        let entities = world.oracle.entity_ids();
        let peers = world
            .peers()
            .map(|peer| PeerFrame {
                peer: peer.id().to_string(),
                entities: entities
                    .iter()
                    .map(|id| EntityView {
                        entity: id.to_string(),
                        goal: goal.to_string(),
                        authoritative: peer.client().goal_json(*id, goal),
                        rendered: peer
                            .client()
                            .rendered(*id, goal)
                            .map(|fields| Value::Object(fields.into_iter().collect())),
                    })
                    .collect(),
            })
            .collect();

        self.add_frame(SimFrame {
            time_sec: world.time(),
            peers,
            relay: world.relay_stats(),
            events,
        });
    }

    /// Finalizes the export.
    pub fn finalize(&mut self, passed: bool, frame_totals: FrameStats, failure_reason: Option<String>) {
        self.passed = passed;
        self.frame_totals = Some(frame_totals);
        self.failure_reason = failure_reason;
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: &str) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}
