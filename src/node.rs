// Node Module
//
// INTENTION: Define what a node is to the rest of the system. Application code
// implements `NodeMain`; the runtime drives one node through its lifecycle and
// the executor runs any number of nodes side by side.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::routing::GraphName;

pub mod connected;
pub mod context;
pub mod executor;
pub mod runtime;

pub use connected::ConnectedNode;
pub use context::{NodeContext, NodeResource};
pub use executor::NodeMainExecutor;
pub use runtime::NodeRuntime;

/// Lifecycle state of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Constructed, nothing allocated yet
    Created,
    /// Transport bound, `on_start` running
    Starting,
    /// `on_start` returned successfully
    Running,
    /// Loops cancelled, endpoints being torn down
    Stopping,
    /// Everything released; also the state after a failed start
    Stopped,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            NodeState::Created => "created",
            NodeState::Starting => "starting",
            NodeState::Running => "running",
            NodeState::Stopping => "stopping",
            NodeState::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

/// Application code of a node
#[async_trait]
pub trait NodeMain: Send + Sync + 'static {
    /// Name used when the configuration does not set one
    fn default_node_name(&self) -> GraphName;

    /// Called exactly once when the node is connected. Create publishers,
    /// subscribers, services and work loops here. An error stops the node and
    /// is reported to whoever executed it.
    async fn on_start(&self, node: ConnectedNode) -> anyhow::Result<()>;

    /// Called once when the node begins shutting down, before its loops and
    /// endpoints are torn down
    async fn on_shutdown(&self, _node: &ConnectedNode) {}
}
