// Topic Subscriber
//
// INTENTION: The reading end of a topic. The subscriber advertises itself in the
// registry, connects to every publisher the registry knows about and hands
// each received message to its listeners. The publisher set is kept current
// two ways: the master pushes an update whenever publishers come and go, and a
// lost publisher connection triggers one re-query of the registry.
//
// A pushed update is only a hint. Pushes travel on separate connections and can
// arrive out of order, so the connection set is always rebuilt from a fresh
// registry lookup, never from the pushed snapshot. All changes to the
// connection set go through one reconcile step guarded by a lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{GraphError, GraphResult};
use crate::msgs::Message;
use crate::network::protocol::{Handshake, HandshakeReply, TopicFrame};
use crate::network::transport::{ConnectionAcceptor, RouteKey};
use crate::network::wire::FramedConnection;
use crate::network::Endpoint;
use crate::node::context::{NodeContext, NodeResource};
use crate::registry::{RecordType, RegistrationRecord};
use crate::routing::GraphName;
use crate::util::logging::{Component, Logger};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

type Listener<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Why the publisher set needs reconciling
enum Reconcile {
    /// A publisher connection was lost; re-query the registry
    ConnectionLost,
    /// The master reported a change in the publisher set
    PublishersChanged { reported: usize },
}

/// Live connection to one publisher
struct PublisherLink {
    endpoint: Endpoint,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl PublisherLink {
    fn is_alive(&self) -> bool {
        !self.task.is_finished()
    }
}

struct SubscriberCore<T: Message> {
    topic: GraphName,
    record: RegistrationRecord,
    ctx: NodeContext,
    listeners: StdRwLock<Vec<Listener<T>>>,
    links: Mutex<HashMap<GraphName, PublisherLink>>,
    reconcile_tx: mpsc::UnboundedSender<Reconcile>,
    token: CancellationToken,
    closed: AtomicBool,
    received: AtomicU64,
    logger: Logger,
}

impl<T: Message> SubscriberCore<T> {
    fn deliver(&self, message: T) {
        self.received.fetch_add(1, Ordering::SeqCst);
        let listeners: Vec<Listener<T>> = match self.listeners.read() {
            Ok(listeners) => listeners.clone(),
            Err(_) => return,
        };
        for listener in listeners {
            listener(message.clone());
        }
    }

    /// Bring the connection set in line with `publishers`
    async fn apply_publishers(self: &Arc<Self>, publishers: Vec<RegistrationRecord>) -> usize {
        if self.token.is_cancelled() {
            return 0;
        }
        let mut links = self.links.lock().await;

        // drop finished links and publishers that went away
        links.retain(|node, link| {
            let keep = link.is_alive() && publishers.iter().any(|p| &p.node == node && p.endpoint == link.endpoint);
            if !keep {
                link.token.cancel();
            }
            keep
        });

        for publisher in publishers {
            if links.contains_key(&publisher.node) {
                continue;
            }
            match self.connect(&publisher).await {
                Ok(link) => {
                    links.insert(publisher.node.clone(), link);
                }
                Err(e) => self.logger.warn(format!(
                    "Could not connect {} to publisher {} at {}: {}",
                    self.topic, publisher.node, publisher.endpoint, e
                )),
            }
        }
        links.len()
    }

    async fn connect(self: &Arc<Self>, publisher: &RegistrationRecord) -> GraphResult<PublisherLink> {
        let mut conn = FramedConnection::connect(&publisher.endpoint, CONNECT_TIMEOUT).await?;
        let handshake = Handshake::SubscribeTopic {
            topic: self.topic.clone(),
            message_type: T::TYPE.to_string(),
            subscriber: self.ctx.name().clone(),
        };
        let reply: HandshakeReply = tokio::time::timeout(CONNECT_TIMEOUT, conn.round_trip(&handshake))
            .await
            .map_err(|_| GraphError::Timeout(CONNECT_TIMEOUT))??;

        match reply {
            HandshakeReply::Accepted { type_name } if type_name == T::TYPE => {}
            HandshakeReply::Accepted { type_name } => {
                return Err(GraphError::TypeMismatch {
                    expected: T::TYPE.to_string(),
                    actual: type_name,
                })
            }
            HandshakeReply::Rejected { reason } => return Err(GraphError::Remote(reason)),
        }

        self.logger.info(format!(
            "Connected {} to publisher {} at {}",
            self.topic, publisher.node, publisher.endpoint
        ));
        let token = self.token.child_token();
        let task = tokio::spawn(self.clone().read_frames(conn, token.clone(), publisher.node.clone()));
        Ok(PublisherLink {
            endpoint: publisher.endpoint.clone(),
            token,
            task,
        })
    }

    async fn read_frames(self: Arc<Self>, mut conn: FramedConnection, token: CancellationToken, publisher: GraphName) {
        let mut last_seq = 0u64;
        let lost = loop {
            let next = tokio::select! {
                _ = token.cancelled() => break false,
                next = conn.recv::<TopicFrame>() => next,
            };
            match next {
                Ok(Some(frame)) => {
                    if frame.seq <= last_seq {
                        self.logger.warn(format!(
                            "Out of order frame {} after {} from {}",
                            frame.seq, last_seq, publisher
                        ));
                    }
                    last_seq = frame.seq;
                    match T::from_bytes(&frame.payload) {
                        Ok(message) => self.deliver(message),
                        Err(e) => self.logger.warn(format!("Dropping undecodable message on {}: {}", self.topic, e)),
                    }
                }
                Ok(None) => break true,
                Err(e) => {
                    self.logger.debug(format!("Publisher {} connection failed: {}", publisher, e));
                    break true;
                }
            }
        };

        if lost && !self.token.is_cancelled() {
            self.logger.info(format!("Lost publisher {} on {}", publisher, self.topic));
            let _ = self.reconcile_tx.send(Reconcile::ConnectionLost);
        }
    }

    async fn refresh(self: &Arc<Self>) -> GraphResult<usize> {
        let publishers = self
            .ctx
            .registry()
            .lookup(&self.topic, RecordType::TopicPublisher)
            .await?;
        Ok(self.apply_publishers(publishers).await)
    }

    /// Serializes pushed updates and connection-loss refreshes
    async fn reconcile_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Reconcile>) {
        loop {
            let next = tokio::select! {
                _ = self.token.cancelled() => break,
                next = rx.recv() => next,
            };
            match next {
                Some(Reconcile::PublishersChanged { reported }) => {
                    self.logger.debug(format!(
                        "Master reports {} publishers on {}; re-querying",
                        reported, self.topic
                    ));
                }
                Some(Reconcile::ConnectionLost) => {}
                None => break,
            }
            // a failed lookup leaves the current links alone
            if let Err(e) = self.refresh().await {
                self.logger.warn(format!("Refreshing publishers of {} failed: {}", self.topic, e));
            }
        }
    }

    async fn publisher_count(&self) -> usize {
        self.links.lock().await.values().filter(|link| link.is_alive()).count()
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.token.cancel();
        self.ctx.transport().remove_route(&RouteKey::Subscriber(self.topic.clone())).await;
        if let Err(e) = self
            .ctx
            .registry()
            .deregister(&self.topic, RecordType::TopicSubscriber, self.ctx.name())
            .await
        {
            self.logger.warn(format!("Failed to deregister subscriber {}: {}", self.topic, e));
        }

        let links: Vec<PublisherLink> = self.links.lock().await.drain().map(|(_, link)| link).collect();
        for link in links {
            let _ = link.task.await;
        }
        self.logger.info(format!("Subscriber {} shut down", self.topic));
    }
}

#[async_trait]
impl<T: Message> ConnectionAcceptor for SubscriberCore<T> {
    async fn accept(&self, handshake: Handshake, mut conn: FramedConnection) -> GraphResult<()> {
        match handshake {
            Handshake::PublisherUpdate { publishers, .. } => {
                conn.send(&HandshakeReply::Accepted {
                    type_name: T::TYPE.to_string(),
                })
                .await?;
                self.reconcile_tx
                    .send(Reconcile::PublishersChanged {
                        reported: publishers.len(),
                    })
                    .map_err(|_| GraphError::Shutdown(format!("subscriber {}", self.topic)))
            }
            other => {
                let reason = format!("subscriber {} cannot serve {}", self.topic, other.describe());
                conn.send(&HandshakeReply::Rejected { reason: reason.clone() }).await?;
                Err(GraphError::Configuration(reason))
            }
        }
    }
}

#[async_trait]
impl<T: Message> NodeResource for SubscriberCore<T> {
    fn describe(&self) -> String {
        format!("subscriber {}", self.topic)
    }

    async fn shutdown(&self) {
        self.close().await;
    }
}

/// Handle receiving `T` messages from one topic
pub struct Subscriber<T: Message> {
    core: Arc<SubscriberCore<T>>,
}

impl<T: Message> Clone for Subscriber<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<T: Message> Subscriber<T> {
    /// Advertise interest in `topic` and connect to its current publishers
    pub async fn create(ctx: &NodeContext, topic: GraphName) -> GraphResult<Self> {
        let route = RouteKey::Subscriber(topic.clone());
        if ctx.transport().has_route(&route).await {
            return Err(GraphError::Configuration(format!(
                "node {} already subscribes to {}",
                ctx.name(),
                topic
            )));
        }

        let record = RegistrationRecord::new(
            topic.clone(),
            RecordType::TopicSubscriber,
            ctx.name().clone(),
            ctx.endpoint().clone(),
            T::TYPE,
        );
        let (reconcile_tx, reconcile_rx) = mpsc::unbounded_channel();
        let core = Arc::new(SubscriberCore {
            topic: topic.clone(),
            record: record.clone(),
            ctx: ctx.clone(),
            listeners: StdRwLock::new(Vec::new()),
            links: Mutex::new(HashMap::new()),
            reconcile_tx,
            token: ctx.cancellation_token().child_token(),
            closed: AtomicBool::new(false),
            received: AtomicU64::new(0),
            logger: ctx.component_logger(Component::Topic),
        });
        tokio::spawn(core.clone().reconcile_loop(reconcile_rx));

        ctx.transport().add_route(route.clone(), core.clone()).await;
        if let Err(e) = ctx.registry().register_with_retry(record, ctx.retry_policy()).await {
            core.closed.store(true, Ordering::SeqCst);
            core.token.cancel();
            ctx.transport().remove_route(&route).await;
            return Err(e);
        }

        let subscriber = Self { core };
        match subscriber.refresh().await {
            Ok(count) => subscriber
                .core
                .logger
                .info(format!("Subscribed to {} [{}], {} publishers", topic, T::TYPE, count)),
            Err(e) => subscriber
                .core
                .logger
                .warn(format!("Subscribed to {} but publisher lookup failed: {}", topic, e)),
        }
        Ok(subscriber)
    }

    /// Call `listener` with every message received from now on
    pub fn add_message_listener<F>(&self, listener: F)
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        if let Ok(mut listeners) = self.core.listeners.write() {
            listeners.push(Arc::new(listener));
        }
    }

    pub fn topic(&self) -> &GraphName {
        &self.core.topic
    }

    pub fn record(&self) -> &RegistrationRecord {
        &self.core.record
    }

    /// Publishers currently connected
    pub async fn publisher_count(&self) -> usize {
        self.core.publisher_count().await
    }

    /// Messages received so far
    pub fn received(&self) -> u64 {
        self.core.received.load(Ordering::SeqCst)
    }

    /// Re-query the registry and connect to any publisher not yet connected;
    /// returns how many publishers are connected afterwards
    pub async fn refresh(&self) -> GraphResult<usize> {
        self.core.refresh().await
    }

    pub fn is_shut_down(&self) -> bool {
        self.core.closed.load(Ordering::SeqCst) || self.core.token.is_cancelled()
    }

    /// Deregister and disconnect from every publisher
    pub async fn shutdown(&self) {
        self.core.close().await;
    }

    pub(crate) fn resource(&self) -> Arc<dyn NodeResource> {
        self.core.clone()
    }
}
