//! GoalSync Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" seam that lets the GoalSync engine run
//! in both **Production** (tokio, wall clock) and **Simulation** (virtual
//! clock, in-process relay) environments.
//!
//! # What is intercepted
//!
//! - Time (`now()`, `now_ms()`, `sleep()`): due timestamps and frame pacing
//! - Network (`send()`, `recv()`, `broadcast()`): mutation envelopes
//!
//! The engine itself never touches a socket or the system clock directly, so
//! every convergence bug found in simulation is reproducible from its seed.
//!
//! # Example
//!
//! ```ignore
//! use goalsync_env::{SyncContext, NetworkTransport};
//!
//! async fn client_loop<Ctx: SyncContext, Net: NetworkTransport>(
//!     ctx: &Ctx,
//!     net: &Net,
//! ) {
//!     loop {
//!         tokio::select! {
//!             packet = net.recv() => handle_envelope(packet),
//!             _ = ctx.sleep(Duration::from_millis(16)) => frame(),
//!         }
//!     }
//! }
//! ```

mod context;
mod network;
mod types;
mod error;
mod tokio_impl;

pub use context::SyncContext;
pub use network::{NetworkTransport, NetworkController};
pub use types::{ChannelKind, MutationEnvelope, NodeId};
pub use error::EnvError;
pub use tokio_impl::TokioContext;
