// Service Client
//
// INTENTION: Issue calls to a named service, one at a time. The provider is
// resolved through the registry on first use and the connection is kept for
// later calls; a broken connection is dropped and the name re-resolved once
// before the call is reported as failed. Every call ends in exactly one
// outcome, either a response or an error.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::error::{GraphError, GraphResult};
use crate::msgs::{Message, ServiceDefinition};
use crate::network::protocol::{Handshake, HandshakeReply, ServiceCall, ServiceReply};
use crate::network::wire::FramedConnection;
use crate::node::context::{NodeContext, NodeResource};
use crate::routing::GraphName;
use crate::util::logging::{Component, Logger};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// An open call connection and who is on the other end
struct ServiceLink {
    provider: GraphName,
    conn: FramedConnection,
}

struct ClientCore<S: ServiceDefinition> {
    service: GraphName,
    ctx: NodeContext,
    // holding this lock is what keeps calls one-at-a-time
    link: Mutex<Option<ServiceLink>>,
    connected: AtomicBool,
    next_call_id: AtomicU64,
    shut_down: AtomicBool,
    logger: Logger,
    _service: PhantomData<fn(S)>,
}

impl<S: ServiceDefinition> ClientCore<S> {
    async fn open(&self) -> GraphResult<ServiceLink> {
        let record = self.ctx.registry().lookup_service(&self.service).await?;
        let mut conn = FramedConnection::connect(&record.endpoint, CONNECT_TIMEOUT).await?;
        let handshake = Handshake::ConnectService {
            service: self.service.clone(),
            service_type: S::TYPE.to_string(),
            client: self.ctx.name().clone(),
        };
        let reply: HandshakeReply = conn.round_trip(&handshake).await?;
        match reply {
            HandshakeReply::Accepted { type_name } if type_name == S::TYPE => {}
            HandshakeReply::Accepted { type_name } => {
                return Err(GraphError::TypeMismatch {
                    expected: S::TYPE.to_string(),
                    actual: type_name,
                })
            }
            HandshakeReply::Rejected { reason } => return Err(GraphError::Remote(reason)),
        }

        self.logger.info(format!(
            "Connected to service {} on {} at {}",
            self.service, record.node, record.endpoint
        ));
        Ok(ServiceLink {
            provider: record.node,
            conn,
        })
    }

    async fn exchange(link: &mut ServiceLink, call: &ServiceCall) -> GraphResult<ServiceReply> {
        let reply: ServiceReply = link.conn.round_trip(call).await?;
        if reply.call_id() != call.call_id {
            return Err(GraphError::Codec(format!(
                "reply for call {} arrived while waiting for call {}",
                reply.call_id(),
                call.call_id
            )));
        }
        Ok(reply)
    }

    async fn call(&self, request: &S::Request) -> GraphResult<S::Response> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(GraphError::Shutdown(format!("service client {}", self.service)));
        }
        let call = ServiceCall {
            call_id: self.next_call_id.fetch_add(1, Ordering::SeqCst) + 1,
            payload: request.to_bytes()?,
        };

        let mut slot = self.link.lock().await;
        let reply = match slot.as_mut() {
            Some(link) => match Self::exchange(link, &call).await {
                Ok(reply) => Some(reply),
                Err(e) => {
                    self.logger.debug(format!(
                        "Cached connection to {} on {} failed ({}); re-resolving",
                        self.service, link.provider, e
                    ));
                    None
                }
            },
            None => None,
        };

        let reply = match reply {
            Some(reply) => reply,
            None => {
                *slot = None;
                self.connected.store(false, Ordering::SeqCst);
                let mut link = self.open().await?;
                let reply = Self::exchange(&mut link, &call).await?;
                *slot = Some(link);
                self.connected.store(true, Ordering::SeqCst);
                reply
            }
        };

        match reply {
            ServiceReply::Success { payload, .. } => S::Response::from_bytes(&payload),
            ServiceReply::Failure { message, .. } => Err(GraphError::Remote(message)),
        }
    }

    async fn close(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(link) = self.link.lock().await.take() {
            let (_, writer) = link.conn.into_split();
            writer.close().await;
        }
        self.connected.store(false, Ordering::SeqCst);
        self.logger.debug(format!("Service client for {} closed", self.service));
    }
}

#[async_trait]
impl<S: ServiceDefinition> NodeResource for ClientCore<S> {
    fn describe(&self) -> String {
        format!("service client {}", self.service)
    }

    async fn shutdown(&self) {
        self.close().await;
    }
}

/// Handle for calling one service
pub struct ServiceClient<S: ServiceDefinition> {
    core: Arc<ClientCore<S>>,
    call_timeout: Duration,
}

impl<S: ServiceDefinition> Clone for ServiceClient<S> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            call_timeout: self.call_timeout,
        }
    }
}

impl<S: ServiceDefinition> ServiceClient<S> {
    /// Client for `service`; the provider is resolved on the first call
    pub fn create(ctx: &NodeContext, service: GraphName) -> Self {
        Self {
            core: Arc::new(ClientCore {
                service,
                ctx: ctx.clone(),
                link: Mutex::new(None),
                connected: AtomicBool::new(false),
                next_call_id: AtomicU64::new(0),
                shut_down: AtomicBool::new(false),
                logger: ctx.component_logger(Component::Service),
                _service: PhantomData,
            }),
            call_timeout: ctx.call_timeout(),
        }
    }

    /// Same client with a different per-call deadline
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn service(&self) -> &GraphName {
        &self.core.service
    }

    /// Whether a connection to the provider is currently open
    pub fn is_connected(&self) -> bool {
        self.core.connected.load(Ordering::SeqCst)
    }

    /// Resolve and connect now instead of on the first call
    pub async fn connect(&self) -> GraphResult<()> {
        let mut slot = self.core.link.lock().await;
        if slot.is_none() {
            *slot = Some(self.core.open().await?);
            self.core.connected.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Call the service and wait for its answer
    pub async fn call_async(&self, request: S::Request) -> GraphResult<S::Response> {
        match tokio::time::timeout(self.call_timeout, self.core.call(&request)).await {
            Ok(result) => result,
            Err(_) => {
                // the connection may still carry a late reply; never reuse it
                if let Ok(mut slot) = self.core.link.try_lock() {
                    *slot = None;
                }
                self.core.connected.store(false, Ordering::SeqCst);
                Err(GraphError::Timeout(self.call_timeout))
            }
        }
    }

    /// Call the service in the background; exactly one of the callbacks runs
    pub fn call<OnSuccess, OnFailure>(
        &self,
        request: S::Request,
        on_success: OnSuccess,
        on_failure: OnFailure,
    ) -> JoinHandle<()>
    where
        OnSuccess: FnOnce(S::Response) + Send + 'static,
        OnFailure: FnOnce(GraphError) + Send + 'static,
    {
        let client = self.clone();
        tokio::spawn(async move {
            match client.call_async(request).await {
                Ok(response) => on_success(response),
                Err(e) => on_failure(e),
            }
        })
    }

    /// Close the connection; later calls fail with `Shutdown`
    pub async fn shutdown(&self) {
        self.core.close().await;
    }

    pub(crate) fn resource(&self) -> Arc<dyn NodeResource> {
        self.core.clone()
    }
}
