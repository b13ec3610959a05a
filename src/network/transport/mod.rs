// Transport Endpoint
//
// INTENTION: The one listening socket a node owns. Publishers, subscribers and
// service servers register a route on it; every inbound connection is read for
// its handshake and handed to the matching route. The endpoint itself never
// interprets topic or service traffic.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{GraphError, GraphResult};
use crate::network::protocol::{Handshake, HandshakeReply};
use crate::network::wire::FramedConnection;
use crate::network::Endpoint;
use crate::routing::GraphName;
use crate::util::logging::{Component, Logger};

/// How long a fresh connection may take to send its handshake
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Which local component an inbound handshake is addressed to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RouteKey {
    Publisher(GraphName),
    Subscriber(GraphName),
    Service(GraphName),
}

impl RouteKey {
    pub fn for_handshake(handshake: &Handshake) -> Self {
        match handshake {
            Handshake::SubscribeTopic { topic, .. } => RouteKey::Publisher(topic.clone()),
            Handshake::PublisherUpdate { topic, .. } => RouteKey::Subscriber(topic.clone()),
            Handshake::ConnectService { service, .. } => RouteKey::Service(service.clone()),
        }
    }
}

/// A component that takes ownership of inbound connections for its route.
///
/// The acceptor is responsible for answering the handshake.
#[async_trait]
pub trait ConnectionAcceptor: Send + Sync {
    async fn accept(&self, handshake: Handshake, conn: FramedConnection) -> GraphResult<()>;
}

type RouteTable = Arc<RwLock<HashMap<RouteKey, Arc<dyn ConnectionAcceptor>>>>;

/// Per-node listening socket
pub struct TransportEndpoint {
    endpoint: Endpoint,
    local_addr: SocketAddr,
    routes: RouteTable,
    token: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    logger: Logger,
}

impl TransportEndpoint {
    /// Bind an ephemeral port on `host` and start accepting
    pub async fn bind(host: &str, logger: &Logger) -> GraphResult<Arc<Self>> {
        let logger = logger.with_component(Component::Network);
        let listener = TcpListener::bind((host, 0)).await.map_err(|e| GraphError::Bind {
            addr: format!("{}:0", host),
            source: e,
        })?;
        let local_addr = listener.local_addr().map_err(|e| GraphError::Bind {
            addr: format!("{}:0", host),
            source: e,
        })?;
        let endpoint = Endpoint::from_bound(host, local_addr);
        logger.info(format!("Transport endpoint listening on {}", endpoint));

        let transport = Arc::new(Self {
            endpoint,
            local_addr,
            routes: Arc::new(RwLock::new(HashMap::new())),
            token: CancellationToken::new(),
            accept_task: Mutex::new(None),
            logger,
        });

        let task = tokio::spawn(Self::accept_loop(
            listener,
            transport.routes.clone(),
            transport.token.clone(),
            transport.logger.clone(),
        ));
        *transport.accept_task.lock().await = Some(task);
        Ok(transport)
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Install the acceptor for `key`; replaces any previous one
    pub async fn add_route(&self, key: RouteKey, acceptor: Arc<dyn ConnectionAcceptor>) {
        self.logger.debug(format!("Adding route {:?}", key));
        self.routes.write().await.insert(key, acceptor);
    }

    pub async fn remove_route(&self, key: &RouteKey) {
        self.routes.write().await.remove(key);
    }

    pub async fn has_route(&self, key: &RouteKey) -> bool {
        self.routes.read().await.contains_key(key)
    }

    pub fn is_shut_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Stop accepting and release the listening socket
    pub async fn shutdown(&self) {
        self.token.cancel();
        if let Some(task) = self.accept_task.lock().await.take() {
            let _ = task.await;
        }
        self.routes.write().await.clear();
        self.logger.info(format!("Transport endpoint {} closed", self.endpoint));
    }

    async fn accept_loop(listener: TcpListener, routes: RouteTable, token: CancellationToken, logger: Logger) {
        loop {
            let accepted = tokio::select! {
                _ = token.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, remote)) => {
                    logger.debug(format!("Inbound connection from {}", remote));
                    let routes = routes.clone();
                    let logger = logger.clone();
                    tokio::spawn(async move {
                        if let Err(e) = Self::dispatch(FramedConnection::new(stream), routes, &logger).await {
                            logger.debug(format!("Inbound connection from {} ended: {}", remote, e));
                        }
                    });
                }
                Err(e) => {
                    logger.warn(format!("Accept failed: {}", e));
                }
            }
        }
    }

    async fn dispatch(mut conn: FramedConnection, routes: RouteTable, logger: &Logger) -> GraphResult<()> {
        let handshake: Handshake = tokio::time::timeout(HANDSHAKE_TIMEOUT, conn.expect())
            .await
            .map_err(|_| GraphError::Timeout(HANDSHAKE_TIMEOUT))??;

        let key = RouteKey::for_handshake(&handshake);
        let acceptor = routes.read().await.get(&key).cloned();
        match acceptor {
            Some(acceptor) => {
                logger.debug(format!("Routing {}", handshake.describe()));
                acceptor.accept(handshake, conn).await
            }
            None => {
                let reason = format!("no local route for {:?}", key);
                conn.send(&HandshakeReply::Rejected { reason: reason.clone() }).await?;
                Err(GraphError::Configuration(reason))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingAcceptor {
        accepted: AtomicUsize,
    }

    #[async_trait]
    impl ConnectionAcceptor for CountingAcceptor {
        async fn accept(&self, _handshake: Handshake, mut conn: FramedConnection) -> GraphResult<()> {
            self.accepted.fetch_add(1, Ordering::SeqCst);
            conn.send(&HandshakeReply::Accepted {
                type_name: "test/Type".to_string(),
            })
            .await
        }
    }

    fn subscribe(topic: &str) -> Handshake {
        Handshake::SubscribeTopic {
            topic: GraphName::new(topic).unwrap(),
            message_type: "test/Type".to_string(),
            subscriber: GraphName::new("/sub").unwrap(),
        }
    }

    #[tokio::test]
    async fn test_handshake_routed_to_acceptor() {
        let logger = Logger::new_root(Component::Node, "/transport_test");
        let transport = TransportEndpoint::bind("127.0.0.1", &logger).await.unwrap();
        let acceptor = Arc::new(CountingAcceptor {
            accepted: AtomicUsize::new(0),
        });
        transport
            .add_route(RouteKey::Publisher(GraphName::new("/chatter").unwrap()), acceptor.clone())
            .await;

        let mut conn = FramedConnection::connect(transport.endpoint(), Duration::from_secs(1))
            .await
            .unwrap();
        let reply: HandshakeReply = conn.round_trip(&subscribe("/chatter")).await.unwrap();
        assert!(matches!(reply, HandshakeReply::Accepted { .. }));
        assert_eq!(acceptor.accepted.load(Ordering::SeqCst), 1);

        transport.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_route_is_rejected() {
        let logger = Logger::new_root(Component::Node, "/transport_test");
        let transport = TransportEndpoint::bind("127.0.0.1", &logger).await.unwrap();

        let mut conn = FramedConnection::connect(transport.endpoint(), Duration::from_secs(1))
            .await
            .unwrap();
        let reply: HandshakeReply = conn.round_trip(&subscribe("/nobody")).await.unwrap();
        assert!(matches!(reply, HandshakeReply::Rejected { .. }));

        transport.shutdown().await;
        assert!(transport.is_shut_down());
        assert!(FramedConnection::connect(transport.endpoint(), Duration::from_millis(200))
            .await
            .is_err());
    }
}
