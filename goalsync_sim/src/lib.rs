//! GoalSync Deterministic Simulation Harness
//!
//! Runs a whole multi-peer GoalSync session inside one thread, with every
//! source of non-determinism under control:
//! - **Time**: one virtual clock, advanced a tick at a time; peers may see it
//!   through a fixed wall-clock skew
//! - **Network**: a relay with latency, jitter, loss, partitions and a
//!   durable log replayed to joining peers
//! - **Randomness**: all entropy derived from a single 64-bit seed
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        SimWorld                          │
//! │   SimContext (virtual clock)      Oracle (last writes)   │
//! │                                                          │
//! │  ┌─────────┐   SimNetwork   ┌───────┐   SimNetwork  ┌─────────┐
//! │  │ SimPeer │ ─────────────► │ Relay │ ────────────► │ SimPeer │
//! │  │ client  │ ◄───────────── │  log  │ ◄──────────── │ client  │
//! │  └─────────┘                └───────┘               └─────────┘
//! │                  SimNetworkController (faults)           │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use goalsync_sim::{ScenarioRunner, ScenarioId};
//!
//! let result = ScenarioRunner::new(42, 4).run(ScenarioId::Partition);
//! assert!(result.passed);
//! ```

mod context;
mod error;
mod exporter;
mod network;
mod oracle;
mod peer;
mod relay;
mod runner;
pub mod scenarios;
mod world;

pub use context::SimContext;
pub use error::SimError;
pub use exporter::{EntityView, PeerFrame, SimEvent, SimExport, SimFrame};
pub use network::{NetworkMessage, SimNetwork, SimNetworkController};
pub use oracle::{ExpectedEntity, Oracle};
pub use peer::{InboxReport, SimPeer};
pub use relay::{Relay, RelayConfig, RelayStats};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use scenarios::ScenarioId;
pub use world::{SimConfig, SimWorld, TickReport};
