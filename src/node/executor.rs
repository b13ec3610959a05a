// Node Main Executor
//
// INTENTION: Run any number of nodes in one process. Each node gets its own
// runtime; a node that fails to start is reported to the caller and recorded
// as stopped, and never affects its siblings. Shutting the executor down stops
// nodes in reverse start order.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::RwLock;

use crate::config::NodeConfiguration;
use crate::node::runtime::NodeRuntime;
use crate::node::{NodeMain, NodeState};
use crate::routing::GraphName;
use crate::util::logging::{Component, Logger};

/// Runs and stops nodes
pub struct NodeMainExecutor {
    runtimes: RwLock<Vec<Arc<NodeRuntime>>>,
    logger: Logger,
}

impl Default for NodeMainExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeMainExecutor {
    pub fn new() -> Self {
        Self {
            runtimes: RwLock::new(Vec::new()),
            logger: Logger::new_root(Component::Executor, "executor"),
        }
    }

    /// Start `node` with `config` and wait for its `on_start` to finish.
    /// Returns the name the node runs under.
    pub async fn execute<N: NodeMain>(&self, node: N, config: NodeConfiguration) -> Result<GraphName> {
        self.execute_shared(Arc::new(node), config).await
    }

    /// Like `execute`, for a node the caller keeps a handle to
    pub async fn execute_shared(&self, node: Arc<dyn NodeMain>, config: NodeConfiguration) -> Result<GraphName> {
        let runtime = Arc::new(NodeRuntime::new(node, config)?);
        let name = runtime.name().clone();

        {
            let mut runtimes = self.runtimes.write().await;
            for existing in runtimes.iter() {
                if existing.name() == &name && existing.state().await != NodeState::Stopped {
                    return Err(anyhow!("a node named {} is already running", name));
                }
            }
            runtimes.push(runtime.clone());
        }

        self.logger.info(format!("Executing node {}", name));
        runtime.start().await?;
        Ok(name)
    }

    async fn find(&self, name: &GraphName) -> Option<Arc<NodeRuntime>> {
        self.runtimes
            .read()
            .await
            .iter()
            .rev()
            .find(|runtime| runtime.name() == name)
            .cloned()
    }

    /// Runtime of the most recent node executed under `name`
    pub async fn runtime(&self, name: &GraphName) -> Option<Arc<NodeRuntime>> {
        self.find(name).await
    }

    /// Stop one node; `false` when no such node was executed
    pub async fn shutdown_node_main(&self, name: &GraphName) -> bool {
        match self.find(name).await {
            Some(runtime) => {
                runtime.shutdown().await;
                true
            }
            None => false,
        }
    }

    pub async fn state_of(&self, name: &GraphName) -> Option<NodeState> {
        match self.find(name).await {
            Some(runtime) => Some(runtime.state().await),
            None => None,
        }
    }

    /// Names of the nodes currently running, in start order
    pub async fn running_nodes(&self) -> Vec<GraphName> {
        let runtimes = self.runtimes.read().await;
        let mut running = Vec::new();
        for runtime in runtimes.iter() {
            if runtime.state().await == NodeState::Running {
                running.push(runtime.name().clone());
            }
        }
        running
    }

    /// Stop every node, most recently started first
    pub async fn shutdown(&self) {
        let runtimes: Vec<Arc<NodeRuntime>> = self.runtimes.write().await.drain(..).collect();
        self.logger.info(format!("Shutting down {} nodes", runtimes.len()));
        for runtime in runtimes.into_iter().rev() {
            runtime.shutdown().await;
        }
    }
}
