use tokio::sync::oneshot;
use tracing::{debug, info};

use tessera_core::state::{NeededInput, ProvidedInput};
use tessera_core::types::NodeId;

/// Pending human-input requests of one run, with the channels that resume
/// the asking nodes.
///
/// Owned by the run's scheduler task; every mutation happens there.
#[derive(Default)]
pub struct InputBroker {
    pending: Vec<(NeededInput, oneshot::Sender<serde_json::Value>)>,
}

impl InputBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request. The node resumes when `reply` receives a value.
    pub fn request(&mut self, needed: NeededInput, reply: oneshot::Sender<serde_json::Value>) {
        info!(node_id = %needed.node_id, name = %needed.name, "Input needed");
        self.pending.push((needed, reply));
    }

    /// Resolve the requests matching the provided inputs by `(name, node_id)`.
    ///
    /// Returns the ids of the nodes whose requests were resolved, in order.
    /// Inputs without a matching request are ignored.
    pub fn provide(&mut self, inputs: Vec<ProvidedInput>) -> Vec<NodeId> {
        let mut resolved = Vec::new();
        for input in inputs {
            let Some(index) = self.pending.iter().position(|(needed, _)| needed.matches(&input))
            else {
                debug!(node_id = %input.node_id, name = %input.name, "No pending request for input");
                continue;
            };
            let (needed, reply) = self.pending.remove(index);
            info!(node_id = %needed.node_id, name = %needed.name, "Input provided");
            // The node may already be gone; nothing to resume then.
            let _ = reply.send(input.value);
            if !resolved.contains(&needed.node_id) {
                resolved.push(needed.node_id);
            }
        }
        resolved
    }

    /// The open requests, oldest first.
    pub fn pending(&self) -> Vec<NeededInput> {
        self.pending.iter().map(|(needed, _)| needed.clone()).collect()
    }

    pub fn has_pending_for(&self, node_id: &str) -> bool {
        self.pending.iter().any(|(needed, _)| needed.node_id == node_id)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop every request. Waiting nodes observe a closed channel.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
