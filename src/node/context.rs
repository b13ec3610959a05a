// Node Context
//
// INTENTION: Everything a topic or service endpoint needs from its owning node:
// the node's name, its transport endpoint, the registry and a logger. Endpoints
// never reach back into the runtime itself.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::RetryPolicy;
use crate::error::GraphResult;
use crate::network::{Endpoint, TransportEndpoint};
use crate::registry::RegistryApi;
use crate::routing::GraphName;
use crate::util::logging::{Component, Logger};

/// Shared handles of one running node
#[derive(Clone)]
pub struct NodeContext {
    name: GraphName,
    transport: Arc<TransportEndpoint>,
    registry: Arc<dyn RegistryApi>,
    logger: Logger,
    retry: RetryPolicy,
    call_timeout: Duration,
    token: CancellationToken,
}

impl NodeContext {
    pub fn new(
        name: GraphName,
        transport: Arc<TransportEndpoint>,
        registry: Arc<dyn RegistryApi>,
        logger: Logger,
    ) -> Self {
        Self {
            name,
            transport,
            registry,
            logger,
            retry: RetryPolicy::default(),
            call_timeout: Duration::from_secs(5),
            token: CancellationToken::new(),
        }
    }

    pub fn with_registry_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn name(&self) -> &GraphName {
        &self.name
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.transport.endpoint()
    }

    pub fn transport(&self) -> &Arc<TransportEndpoint> {
        &self.transport
    }

    pub fn registry(&self) -> &Arc<dyn RegistryApi> {
        &self.registry
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    /// Logger for one of the node's components
    pub fn component_logger(&self, component: Component) -> Logger {
        self.logger.with_component(component)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Token cancelled when the node begins shutting down
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    /// Resolve a topic or service name. Global names are used as given,
    /// relative names live in the node's namespace.
    pub fn resolve_name(&self, name: &str) -> GraphResult<GraphName> {
        let name = GraphName::new(name)?;
        if name.is_global() {
            return Ok(name);
        }
        let namespace = self.name.parent().unwrap_or_else(GraphName::root);
        Ok(namespace.join(&name))
    }
}

/// Something a node creates and must tear down when it stops
#[async_trait]
pub trait NodeResource: Send + Sync {
    /// Short description for logs, e.g. `publisher /chatter`
    fn describe(&self) -> String;

    /// Deregister from the registry and release sockets; idempotent
    async fn shutdown(&self);
}
