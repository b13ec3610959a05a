// Connected Node
//
// INTENTION: The handle a node's `on_start` hook receives. It creates the
// node's publishers, subscribers, service endpoints and work loops, and
// remembers every one of them so the runtime can tear them all down when the
// node stops.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::error::{GraphError, GraphResult};
use crate::msgs::{Message, ServiceDefinition};
use crate::network::Endpoint;
use crate::node::context::{NodeContext, NodeResource};
use crate::routing::GraphName;
use crate::service::{ServiceClient, ServiceServer};
use crate::topic::{Publisher, Subscriber};
use crate::util::cancellable_loop::{CancellableLoop, LoopExit, LoopHandle};
use crate::util::logging::{Component, LogSink, Logger};

struct ConnectedInner {
    ctx: NodeContext,
    log: Arc<dyn LogSink>,
    resources: StdMutex<Vec<Arc<dyn NodeResource>>>,
    loops: StdMutex<Vec<LoopHandle>>,
    loop_seq: AtomicUsize,
}

/// A running node as seen from its own code
#[derive(Clone)]
pub struct ConnectedNode {
    inner: Arc<ConnectedInner>,
}

impl ConnectedNode {
    pub(crate) fn new(ctx: NodeContext, log_sink: Option<Arc<dyn LogSink>>) -> Self {
        let log = log_sink.unwrap_or_else(|| Arc::new(ctx.logger().clone()) as Arc<dyn LogSink>);
        Self {
            inner: Arc::new(ConnectedInner {
                ctx,
                log,
                resources: StdMutex::new(Vec::new()),
                loops: StdMutex::new(Vec::new()),
                loop_seq: AtomicUsize::new(0),
            }),
        }
    }

    pub fn name(&self) -> &GraphName {
        self.inner.ctx.name()
    }

    /// Where this node's transport endpoint listens
    pub fn endpoint(&self) -> &Endpoint {
        self.inner.ctx.endpoint()
    }

    /// The node's logging sink
    pub fn log(&self) -> Arc<dyn LogSink> {
        self.inner.log.clone()
    }

    pub fn logger(&self) -> &Logger {
        self.inner.ctx.logger()
    }

    pub fn context(&self) -> &NodeContext {
        &self.inner.ctx
    }

    /// Cancelled as soon as the node starts shutting down
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.ctx.cancellation_token().clone()
    }

    fn ensure_running(&self) -> GraphResult<()> {
        if self.inner.ctx.cancellation_token().is_cancelled() {
            return Err(GraphError::Shutdown(format!("node {}", self.name())));
        }
        Ok(())
    }

    fn track(&self, resource: Arc<dyn NodeResource>) {
        if let Ok(mut resources) = self.inner.resources.lock() {
            resources.push(resource);
        }
    }

    pub async fn new_publisher<T: Message>(&self, topic: &str) -> GraphResult<Publisher<T>> {
        self.ensure_running()?;
        let topic = self.inner.ctx.resolve_name(topic)?;
        let publisher = Publisher::<T>::create(&self.inner.ctx, topic).await?;
        self.track(publisher.resource());
        Ok(publisher)
    }

    pub async fn new_subscriber<T: Message>(&self, topic: &str) -> GraphResult<Subscriber<T>> {
        self.ensure_running()?;
        let topic = self.inner.ctx.resolve_name(topic)?;
        let subscriber = Subscriber::<T>::create(&self.inner.ctx, topic).await?;
        self.track(subscriber.resource());
        Ok(subscriber)
    }

    pub async fn new_service_server<S, F>(&self, service: &str, handler: F) -> GraphResult<ServiceServer<S>>
    where
        S: ServiceDefinition,
        F: Fn(S::Request) -> anyhow::Result<S::Response> + Send + Sync + 'static,
    {
        self.ensure_running()?;
        let service = self.inner.ctx.resolve_name(service)?;
        let server = ServiceServer::<S>::create(&self.inner.ctx, service, handler).await?;
        self.track(server.resource());
        Ok(server)
    }

    /// Client for `service`. The provider does not have to exist yet; calls
    /// made before it registers fail with `ServiceNotFound`.
    pub fn new_service_client<S: ServiceDefinition>(&self, service: &str) -> GraphResult<ServiceClient<S>> {
        self.ensure_running()?;
        let service = self.inner.ctx.resolve_name(service)?;
        let client = ServiceClient::<S>::create(&self.inner.ctx, service);
        self.track(client.resource());
        Ok(client)
    }

    /// Run `step` repeatedly, waiting `throttle` between steps, until the node
    /// shuts down
    pub fn execute_cancellable_loop<F, Fut>(&self, throttle: Duration, step: F) -> GraphResult<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.ensure_running()?;
        let seq = self.inner.loop_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = CancellableLoop::new(
            format!("{}#{}", self.name(), seq),
            throttle,
            self.inner.ctx.cancellation_token().child_token(),
            self.inner.ctx.component_logger(Component::Loop),
        )
        .spawn(step);

        self.inner
            .loops
            .lock()
            .map_err(|_| GraphError::Shutdown(format!("node {}", self.name())))?
            .push(handle);
        Ok(())
    }

    /// Number of work loops still running
    pub fn active_loops(&self) -> usize {
        self.inner
            .loops
            .lock()
            .map(|loops| loops.iter().filter(|l| !l.is_finished()).count())
            .unwrap_or(0)
    }

    /// Cancel every loop and tear down every endpoint, newest first
    pub(crate) async fn teardown(&self, grace: Duration) {
        self.inner.ctx.cancellation_token().cancel();

        let loops: Vec<LoopHandle> = match self.inner.loops.lock() {
            Ok(mut loops) => loops.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        let exits = join_all(loops.into_iter().map(|handle| handle.join(grace))).await;
        let forced = exits.iter().filter(|exit| **exit == LoopExit::ForceTerminated).count();
        if forced > 0 {
            self.logger()
                .error(format!("{} work loops of {} had to be force-terminated", forced, self.name()));
        }

        let resources: Vec<Arc<dyn NodeResource>> = match self.inner.resources.lock() {
            Ok(mut resources) => resources.drain(..).rev().collect(),
            Err(_) => Vec::new(),
        };
        for resource in resources {
            self.logger().debug(format!("Shutting down {}", resource.describe()));
            resource.shutdown().await;
        }
    }
}
