//! Convergence scenarios for deterministic simulation.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScenarioId {
    /// GS-001: durable entities built up before a peer joins
    LateJoin,

    /// GS-002: owners write many updates per tick in bursts
    BurstyUpdates,

    /// GS-003: heavy jitter reorders every sender's envelopes
    ReorderedDelivery,

    /// GS-004: latency far beyond the due lead
    StaleSnap,

    /// GS-005: cursor owners leave mid-session
    EphemeralDisconnect,

    /// GS-006: many entities, no writes after spawn
    IdleScene,

    /// GS-007: peers disagree about wall-clock time
    ClockSkew,

    /// GS-008: a peer restarts from its op log
    DurableRestart,

    /// GS-009: partition, diverging writes, heal
    Partition,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::LateJoin,
            ScenarioId::BurstyUpdates,
            ScenarioId::ReorderedDelivery,
            ScenarioId::StaleSnap,
            ScenarioId::EphemeralDisconnect,
            ScenarioId::IdleScene,
            ScenarioId::ClockSkew,
            ScenarioId::DurableRestart,
            ScenarioId::Partition,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::LateJoin => "late_join",
            ScenarioId::BurstyUpdates => "bursty_updates",
            ScenarioId::ReorderedDelivery => "reordered_delivery",
            ScenarioId::StaleSnap => "stale_snap",
            ScenarioId::EphemeralDisconnect => "ephemeral_disconnect",
            ScenarioId::IdleScene => "idle_scene",
            ScenarioId::ClockSkew => "clock_skew",
            ScenarioId::DurableRestart => "durable_restart",
            ScenarioId::Partition => "partition",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::LateJoin => "Peer joins after history exists; its defaults must not clobber",
            ScenarioId::BurstyUpdates => "Bursts of writes per tick; rendered values still converge",
            ScenarioId::ReorderedDelivery => "40ms jitter on 30ms latency; replicas stay identical",
            ScenarioId::StaleSnap => "500ms latency vs 100ms lead; stale goals snap exactly",
            ScenarioId::EphemeralDisconnect => "Owners leave; their cursors vanish, durable state stays",
            ScenarioId::IdleScene => "200 settled entities cost no interpolation work",
            ScenarioId::ClockSkew => "Peers skewed by up to 400ms; authoritative state converges",
            ScenarioId::DurableRestart => "Peer restarts from its op log and catches up",
            ScenarioId::Partition => "Durable writes held across a partition converge on heal",
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "late_join" | "latejoin" | "gs-001" => Ok(ScenarioId::LateJoin),
            "bursty_updates" | "burstyupdates" | "gs-002" => Ok(ScenarioId::BurstyUpdates),
            "reordered_delivery" | "reordereddelivery" | "gs-003" => Ok(ScenarioId::ReorderedDelivery),
            "stale_snap" | "stalesnap" | "gs-004" => Ok(ScenarioId::StaleSnap),
            "ephemeral_disconnect" | "ephemeraldisconnect" | "gs-005" => {
                Ok(ScenarioId::EphemeralDisconnect)
            }
            "idle_scene" | "idlescene" | "gs-006" => Ok(ScenarioId::IdleScene),
            "clock_skew" | "clockskew" | "gs-007" => Ok(ScenarioId::ClockSkew),
            "durable_restart" | "durablerestart" | "gs-008" => Ok(ScenarioId::DurableRestart),
            "partition" | "gs-009" => Ok(ScenarioId::Partition),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}
