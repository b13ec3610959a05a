// Service Server
//
// INTENTION: Bind one request handler to a service name. Clients connect
// through the node's transport endpoint and keep their connection open; every
// call on it is decoded, handed to the handler on the blocking pool and
// answered with exactly one reply. A failing or panicking handler produces a
// failure reply and never takes the server down.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{GraphError, GraphResult};
use crate::msgs::{Message, ServiceDefinition};
use crate::network::protocol::{Handshake, HandshakeReply, ServiceCall, ServiceReply};
use crate::network::transport::{ConnectionAcceptor, RouteKey};
use crate::network::wire::FramedConnection;
use crate::network::Endpoint;
use crate::node::context::{NodeContext, NodeResource};
use crate::registry::{RecordType, RegistrationRecord};
use crate::routing::GraphName;
use crate::util::logging::{Component, Logger};

type Handler<S> = Arc<
    dyn Fn(<S as ServiceDefinition>::Request) -> anyhow::Result<<S as ServiceDefinition>::Response> + Send + Sync,
>;

struct ServerCore<S: ServiceDefinition> {
    name: GraphName,
    record: RegistrationRecord,
    ctx: NodeContext,
    handler: Handler<S>,
    token: CancellationToken,
    calls: AtomicU64,
    shut_down: AtomicBool,
    logger: Logger,
}

impl<S: ServiceDefinition> ServerCore<S> {
    async fn handle_call(&self, call: ServiceCall) -> ServiceReply {
        let call_id = call.call_id;
        let request = match S::Request::from_bytes(&call.payload) {
            Ok(request) => request,
            Err(e) => {
                return ServiceReply::Failure {
                    call_id,
                    message: format!("malformed request: {}", e),
                }
            }
        };

        let handler = self.handler.clone();
        let outcome = tokio::task::spawn_blocking(move || handler(request)).await;
        self.calls.fetch_add(1, Ordering::SeqCst);

        let response = match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                self.logger.warn(format!("Handler for {} failed: {:#}", self.name, e));
                return ServiceReply::Failure {
                    call_id,
                    message: format!("{:#}", e),
                };
            }
            Err(e) => {
                self.logger.error(format!("Handler for {} panicked: {}", self.name, e));
                return ServiceReply::Failure {
                    call_id,
                    message: format!("handler for {} panicked", self.name),
                };
            }
        };

        match response.to_bytes() {
            Ok(payload) => ServiceReply::Success { call_id, payload },
            Err(e) => ServiceReply::Failure {
                call_id,
                message: format!("response could not be encoded: {}", e),
            },
        }
    }

    async fn serve(&self, mut conn: FramedConnection, client: GraphName) -> GraphResult<()> {
        loop {
            let next = tokio::select! {
                _ = self.token.cancelled() => return Ok(()),
                next = conn.recv::<ServiceCall>() => next?,
            };
            let Some(call) = next else {
                self.logger.debug(format!("Client {} closed its connection to {}", client, self.name));
                return Ok(());
            };
            let reply = self.handle_call(call).await;
            conn.send(&reply).await?;
        }
    }

    async fn close(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.token.cancel();
        self.ctx.transport().remove_route(&RouteKey::Service(self.name.clone())).await;
        if let Err(e) = self
            .ctx
            .registry()
            .deregister(&self.name, RecordType::Service, self.ctx.name())
            .await
        {
            self.logger.warn(format!("Failed to deregister service {}: {}", self.name, e));
        }
        self.logger.info(format!(
            "Service {} shut down after {} calls",
            self.name,
            self.calls.load(Ordering::SeqCst)
        ));
    }
}

#[async_trait]
impl<S: ServiceDefinition> ConnectionAcceptor for ServerCore<S> {
    async fn accept(&self, handshake: Handshake, mut conn: FramedConnection) -> GraphResult<()> {
        let Handshake::ConnectService {
            service_type, client, ..
        } = handshake
        else {
            let reason = format!("service {} only accepts service connections", self.name);
            conn.send(&HandshakeReply::Rejected { reason: reason.clone() }).await?;
            return Err(GraphError::Configuration(reason));
        };

        if service_type != S::TYPE {
            let err = GraphError::TypeMismatch {
                expected: S::TYPE.to_string(),
                actual: service_type,
            };
            self.logger.warn(format!("Rejecting client {} of {}: {}", client, self.name, err));
            conn.send(&HandshakeReply::Rejected { reason: err.to_string() }).await?;
            return Err(err);
        }

        conn.send(&HandshakeReply::Accepted {
            type_name: S::TYPE.to_string(),
        })
        .await?;
        self.logger.debug(format!("Client {} connected to {}", client, self.name));
        self.serve(conn, client).await
    }
}

#[async_trait]
impl<S: ServiceDefinition> NodeResource for ServerCore<S> {
    fn describe(&self) -> String {
        format!("service server {}", self.name)
    }

    async fn shutdown(&self) {
        self.close().await;
    }
}

/// Handle for a bound service
pub struct ServiceServer<S: ServiceDefinition> {
    core: Arc<ServerCore<S>>,
    _service: PhantomData<fn(S)>,
}

impl<S: ServiceDefinition> ServiceServer<S> {
    /// Bind `handler` to `name` and advertise it in the registry. A service
    /// already bound by another node is taken over.
    pub async fn create<F>(ctx: &NodeContext, name: GraphName, handler: F) -> GraphResult<Self>
    where
        F: Fn(S::Request) -> anyhow::Result<S::Response> + Send + Sync + 'static,
    {
        let route = RouteKey::Service(name.clone());
        if ctx.transport().has_route(&route).await {
            return Err(GraphError::Configuration(format!(
                "node {} already serves {}",
                ctx.name(),
                name
            )));
        }

        let record = RegistrationRecord::new(
            name.clone(),
            RecordType::Service,
            ctx.name().clone(),
            ctx.endpoint().clone(),
            S::TYPE,
        );
        let core = Arc::new(ServerCore::<S> {
            name: name.clone(),
            record: record.clone(),
            ctx: ctx.clone(),
            handler: Arc::new(handler),
            token: ctx.cancellation_token().child_token(),
            calls: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
            logger: ctx.component_logger(Component::Service),
        });

        ctx.transport().add_route(route.clone(), core.clone()).await;
        if let Err(e) = ctx.registry().register_with_retry(record, ctx.retry_policy()).await {
            core.token.cancel();
            ctx.transport().remove_route(&route).await;
            return Err(e);
        }

        core.logger.info(format!("Serving {} [{}]", name, S::TYPE));
        Ok(Self {
            core,
            _service: PhantomData,
        })
    }

    pub fn name(&self) -> &GraphName {
        &self.core.name
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.core.record.endpoint
    }

    pub fn record(&self) -> &RegistrationRecord {
        &self.core.record
    }

    /// Calls answered so far, successful or not
    pub fn calls_served(&self) -> u64 {
        self.core.calls.load(Ordering::SeqCst)
    }

    /// Deregister and stop answering calls
    pub async fn shutdown(&self) {
        self.core.close().await;
    }

    pub(crate) fn resource(&self) -> Arc<dyn NodeResource> {
        self.core.clone()
    }
}
