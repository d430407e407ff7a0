//! A simulated peer: one GoalSync client wired to the relay.

use crate::context::SimContext;
use crate::error::SimError;
use crate::network::SimNetwork;

use goalsync_core::{ClientConfig, FrameStats, OpLog, SyncClient};
use goalsync_env::NodeId;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tracing::warn;

/// Outcome of draining a peer's inbox once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InboxReport {
    pub applied: u64,
    pub rejected: u64,
}

/// One peer of the simulated session.
pub struct SimPeer {
    id: NodeId,
    client: SyncClient<SimContext>,
    network: SimNetwork,
}

impl SimPeer {
    /// Creates a peer. If an op log is given, durable state is restored
    /// from it before the peer talks to anyone.
    pub fn new(
        id: NodeId,
        context: Arc<SimContext>,
        config: ClientConfig,
        network: SimNetwork,
        oplog: Option<Box<dyn OpLog>>,
    ) -> Result<Self, SimError> {
        let mut client = SyncClient::new(id, context, config);
        if let Some(log) = oplog {
            client = client.with_oplog(log);
            client.restore_from_log()?;
        }
        Ok(Self {
            id,
            client,
            network,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn client(&self) -> &SyncClient<SimContext> {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut SyncClient<SimContext> {
        &mut self.client
    }

    pub fn network(&self) -> &SimNetwork {
        &self.network
    }

    /// Applies every envelope the relay has delivered so far.
    ///
    /// A rejected envelope is logged and skipped; the rest still apply.
    pub fn receive_all(&mut self) -> InboxReport {
        let mut report = InboxReport::default();
        for (sender, envelope) in self.network.drain() {
            match self.client.receive(sender, &envelope) {
                Ok(_) => report.applied += 1,
                Err(e) => {
                    warn!(peer = %self.id, from = %sender, error = %e, "envelope rejected");
                    report.rejected += 1;
                }
            }
        }
        report
    }

    /// Runs one frame.
    pub fn frame(&mut self) -> FrameStats {
        self.client.frame()
    }

    /// Broadcasts pending mutations through the relay.
    pub fn pump(&self, runtime: &Runtime) -> Result<usize, SimError> {
        Ok(runtime.block_on(self.client.pump(&self.network))?)
    }

    /// Stops the peer, handing back its op log (what would survive on disk).
    pub fn shutdown(self) -> Option<Box<dyn OpLog>> {
        self.client.shutdown()
    }
}
