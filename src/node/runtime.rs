// Node Runtime
//
// INTENTION: Drive one node through Created -> Starting -> Running ->
// Stopping -> Stopped. Starting binds the node's transport endpoint, waits
// for the registry and runs `on_start`; stopping cancels the node's loops,
// tears down its endpoints and removes whatever it left in the registry. A
// failed start unwinds the same way, so nothing stays registered. A stop
// requested while the node is still starting is remembered and carried out as
// soon as `on_start` returns.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::sync::{Mutex, Notify, RwLock};

use crate::config::{NodeConfiguration, RetryPolicy};
use crate::error::{GraphError, GraphResult};
use crate::network::{Endpoint, TransportEndpoint};
use crate::node::connected::ConnectedNode;
use crate::node::context::NodeContext;
use crate::node::{NodeMain, NodeState};
use crate::registry::RegistryClient;
use crate::routing::GraphName;
use crate::util::logging::{Component, Logger};

/// One node and its lifecycle
pub struct NodeRuntime {
    name: GraphName,
    node: Arc<dyn NodeMain>,
    config: NodeConfiguration,
    state: Arc<RwLock<NodeState>>,
    connected: Mutex<Option<ConnectedNode>>,
    stop_requested: AtomicBool,
    stopped: Notify,
    logger: Logger,
}

impl NodeRuntime {
    /// Validate `config` and resolve the node's name; nothing touches the
    /// network yet
    pub fn new(node: Arc<dyn NodeMain>, config: NodeConfiguration) -> GraphResult<Self> {
        config.validate()?;
        let name = config
            .node_name
            .clone()
            .unwrap_or_else(|| node.default_node_name())
            .to_global();
        if name.is_root() {
            return Err(GraphError::Configuration("node name must not be the root".to_string()));
        }

        let logger = Logger::new_root(Component::Node, name.as_str());
        Ok(Self {
            name,
            node,
            config,
            state: Arc::new(RwLock::new(NodeState::Created)),
            connected: Mutex::new(None),
            stop_requested: AtomicBool::new(false),
            stopped: Notify::new(),
            logger,
        })
    }

    pub fn name(&self) -> &GraphName {
        &self.name
    }

    pub async fn state(&self) -> NodeState {
        *self.state.read().await
    }

    /// Transport endpoint of a started node
    pub async fn endpoint(&self) -> Option<Endpoint> {
        self.connected.lock().await.as_ref().map(|node| node.endpoint().clone())
    }

    /// Handle of a started node
    pub async fn connected_node(&self) -> Option<ConnectedNode> {
        self.connected.lock().await.clone()
    }

    async fn set_state(&self, state: NodeState) {
        *self.state.write().await = state;
        self.logger.debug(format!("Node {} is {}", self.name, state));
    }

    /// Bring the node up and run its `on_start` hook
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != NodeState::Created {
                return Err(anyhow!("node {} cannot start from state {}", self.name, *state));
            }
            *state = NodeState::Starting;
        }
        self.logger.info(format!("Starting node {}", self.name));

        let result = match self.bring_up().await {
            Ok(()) => {
                let stop_requested = {
                    let mut state = self.state.write().await;
                    if self.stop_requested.load(Ordering::SeqCst) {
                        *state = NodeState::Stopping;
                        true
                    } else {
                        *state = NodeState::Running;
                        false
                    }
                };
                if !stop_requested {
                    self.logger.info(format!("Node {} running", self.name));
                    return Ok(());
                }
                self.logger.info(format!("Node {} was stopped while starting", self.name));
                self.stop_connected().await;
                Err(anyhow!("node {} was stopped while starting", self.name))
            }
            Err(e) => {
                self.logger.error(format!("Node {} failed to start: {:#}", self.name, e));
                Err(e)
            }
        };
        self.set_state(NodeState::Stopped).await;
        self.stopped.notify_waiters();
        result
    }

    async fn bring_up(&self) -> Result<()> {
        let master_uri = self.config.validate()?.clone();
        let transport = TransportEndpoint::bind(&self.config.host, &self.logger).await?;
        let registry = RegistryClient::new(master_uri, &self.logger);

        if let Err(e) = wait_for_registry(&registry, self.config.registry_retry).await {
            transport.shutdown().await;
            return Err(e).context(format!("registry unreachable for node {}", self.name));
        }

        let ctx = NodeContext::new(self.name.clone(), transport, Arc::new(registry), self.logger.clone())
            .with_registry_retry(self.config.registry_retry)
            .with_call_timeout(self.config.call_timeout);
        let connected = ConnectedNode::new(ctx, self.config.log_sink.clone());
        *self.connected.lock().await = Some(connected.clone());

        if let Err(e) = self.node.on_start(connected.clone()).await {
            self.unwind(&connected).await;
            *self.connected.lock().await = None;
            return Err(e.context(format!("on_start of node {} failed", self.name)));
        }
        Ok(())
    }

    /// Release everything `connected` owns
    async fn unwind(&self, connected: &ConnectedNode) {
        connected.teardown(self.config.shutdown_grace).await;

        // anything a resource failed to deregister on its own
        match connected.context().registry().deregister_node(&self.name).await {
            Ok(0) => {}
            Ok(n) => self.logger.warn(format!("Removed {} leftover registrations of {}", n, self.name)),
            Err(e) => self.logger.warn(format!("Could not clear registrations of {}: {}", self.name, e)),
        }
        connected.context().transport().shutdown().await;
    }

    async fn stop_connected(&self) {
        let connected = self.connected.lock().await.take();
        if let Some(connected) = connected {
            self.node.on_shutdown(&connected).await;
            self.unwind(&connected).await;
        }
    }

    /// Stop the node; returns once everything is released. A node that is
    /// still starting is stopped once `on_start` returns, waiting at most the
    /// configured shutdown grace for that. Stopping a node that is stopping or
    /// stopped is a no-op.
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.write().await;
            let current = *state;
            match current {
                NodeState::Running => *state = NodeState::Stopping,
                NodeState::Created => {
                    *state = NodeState::Stopped;
                    return;
                }
                NodeState::Starting => {
                    self.stop_requested.store(true, Ordering::SeqCst);
                    let stopped = self.stopped.notified();
                    drop(state);
                    self.logger.info(format!("Node {} is starting; stopping it once started", self.name));
                    if tokio::time::timeout(self.config.shutdown_grace, stopped).await.is_err() {
                        self.logger.warn(format!(
                            "Node {} still starting after {:?}; it stops when on_start returns",
                            self.name, self.config.shutdown_grace
                        ));
                    }
                    return;
                }
                NodeState::Stopping | NodeState::Stopped => return,
            }
        }
        self.logger.info(format!("Shutting down node {}", self.name));

        self.stop_connected().await;

        self.set_state(NodeState::Stopped).await;
        self.logger.info(format!("Node {} stopped", self.name));
    }
}

/// Ping the registry until it answers, backing off while it is not ready
async fn wait_for_registry(registry: &RegistryClient, policy: RetryPolicy) -> GraphResult<()> {
    let attempts = policy.attempts.max(1);
    let mut last = None;
    for attempt in 0..attempts {
        let wait = policy.backoff_for(attempt);
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        match registry.ping().await {
            Ok(()) => return Ok(()),
            Err(GraphError::NotReady(reason)) => last = Some(reason),
            Err(e) => return Err(e),
        }
    }
    Err(GraphError::NotReady(last.unwrap_or_else(|| registry.master_uri().to_string())))
}
