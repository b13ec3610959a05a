// Topic Publisher
//
// INTENTION: The writing end of a topic. The publisher advertises itself in the
// registry, accepts subscriber connections through the node's transport
// endpoint and fans every published message out to them. Publishing never
// waits on a subscriber: each connection has its own queue drained by its own
// writer task, which keeps per-connection delivery FIFO.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{GraphError, GraphResult};
use crate::msgs::Message;
use crate::network::protocol::{Handshake, HandshakeReply, TopicFrame};
use crate::network::transport::{ConnectionAcceptor, RouteKey};
use crate::network::wire::{encode_frame, FrameReader, FrameWriter, FramedConnection};
use crate::node::context::{NodeContext, NodeResource};
use crate::registry::{RecordType, RegistrationRecord};
use crate::routing::GraphName;
use crate::util::logging::{Component, Logger};

/// One connected subscriber
struct SubscriberLink {
    id: Uuid,
    subscriber: GraphName,
    frames: mpsc::UnboundedSender<Arc<Vec<u8>>>,
}

pub(crate) struct PublisherCore {
    topic: GraphName,
    message_type: &'static str,
    record: RegistrationRecord,
    ctx: NodeContext,
    links: StdMutex<Vec<SubscriberLink>>,
    seq: AtomicU64,
    shut_down: AtomicBool,
    logger: Logger,
}

impl PublisherCore {
    fn publish_bytes(&self, payload: Vec<u8>) -> GraphResult<usize> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(GraphError::Shutdown(format!("publisher {}", self.topic)));
        }
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let frame = Arc::new(encode_frame(&TopicFrame { seq, payload })?);

        let mut links = self
            .links
            .lock()
            .map_err(|_| GraphError::Shutdown(format!("publisher {}", self.topic)))?;
        // a closed queue means its connection broke; drop it silently
        links.retain(|link| link.frames.send(frame.clone()).is_ok());
        Ok(links.len())
    }

    fn subscriber_count(&self) -> usize {
        match self.links.lock() {
            Ok(mut links) => {
                links.retain(|link| !link.frames.is_closed());
                links.len()
            }
            Err(_) => 0,
        }
    }

    fn attach(&self, subscriber: GraphName, conn: FramedConnection) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        let (reader, writer) = conn.into_split();
        tokio::spawn(Self::drain(rx, reader, writer));

        if let Ok(mut links) = self.links.lock() {
            links.push(SubscriberLink {
                id,
                subscriber: subscriber.clone(),
                frames: tx,
            });
        }
        self.logger.info(format!("Subscriber {} connected to {} ({})", subscriber, self.topic, id));
    }

    /// Write queued frames until the queue closes or the subscriber goes away
    async fn drain(mut frames: mpsc::UnboundedReceiver<Arc<Vec<u8>>>, mut reader: FrameReader, mut writer: FrameWriter) {
        loop {
            tokio::select! {
                next = frames.recv() => match next {
                    Some(frame) => {
                        if writer.send_raw(&frame).await.is_err() {
                            return;
                        }
                    }
                    None => break,
                },
                // subscribers never write after the handshake, so any read
                // result means the connection is gone
                _ = reader.recv::<TopicFrame>() => return,
            }
        }
        writer.close().await;
    }

    async fn close(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.ctx.transport().remove_route(&RouteKey::Publisher(self.topic.clone())).await;
        if let Err(e) = self
            .ctx
            .registry()
            .deregister(&self.topic, RecordType::TopicPublisher, self.ctx.name())
            .await
        {
            self.logger.warn(format!("Failed to deregister publisher {}: {}", self.topic, e));
        }
        let dropped = match self.links.lock() {
            Ok(mut links) => links.drain(..).count(),
            Err(_) => 0,
        };
        self.logger.info(format!(
            "Publisher {} shut down ({} subscribers disconnected)",
            self.topic, dropped
        ));
    }
}

#[async_trait]
impl ConnectionAcceptor for PublisherCore {
    async fn accept(&self, handshake: Handshake, mut conn: FramedConnection) -> GraphResult<()> {
        let Handshake::SubscribeTopic {
            message_type,
            subscriber,
            ..
        } = handshake
        else {
            let reason = format!("publisher {} only accepts subscriptions", self.topic);
            conn.send(&HandshakeReply::Rejected { reason: reason.clone() }).await?;
            return Err(GraphError::Configuration(reason));
        };

        if self.shut_down.load(Ordering::SeqCst) {
            let reason = format!("publisher {} is shut down", self.topic);
            conn.send(&HandshakeReply::Rejected { reason }).await?;
            return Err(GraphError::Shutdown(format!("publisher {}", self.topic)));
        }

        if message_type != self.message_type {
            let err = GraphError::TypeMismatch {
                expected: self.message_type.to_string(),
                actual: message_type,
            };
            self.logger.warn(format!("Rejecting subscriber {} on {}: {}", subscriber, self.topic, err));
            conn.send(&HandshakeReply::Rejected { reason: err.to_string() }).await?;
            return Err(err);
        }

        conn.send(&HandshakeReply::Accepted {
            type_name: self.message_type.to_string(),
        })
        .await?;
        self.attach(subscriber, conn);
        Ok(())
    }
}

/// Handle for publishing `T` messages on one topic
pub struct Publisher<T: Message> {
    core: Arc<PublisherCore>,
    _message: PhantomData<fn(T)>,
}

impl<T: Message> Clone for Publisher<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            _message: PhantomData,
        }
    }
}

impl<T: Message> Publisher<T> {
    /// Open `topic` for writes and advertise it in the registry
    pub async fn create(ctx: &NodeContext, topic: GraphName) -> GraphResult<Self> {
        let route = RouteKey::Publisher(topic.clone());
        if ctx.transport().has_route(&route).await {
            return Err(GraphError::Configuration(format!(
                "node {} already publishes {}",
                ctx.name(),
                topic
            )));
        }

        let record = RegistrationRecord::new(
            topic.clone(),
            RecordType::TopicPublisher,
            ctx.name().clone(),
            ctx.endpoint().clone(),
            T::TYPE,
        );
        let core = Arc::new(PublisherCore {
            topic: topic.clone(),
            message_type: T::TYPE,
            record: record.clone(),
            ctx: ctx.clone(),
            links: StdMutex::new(Vec::new()),
            seq: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
            logger: ctx.component_logger(Component::Topic),
        });

        // route first, so subscribers told about us can connect right away
        ctx.transport().add_route(route.clone(), core.clone()).await;
        if let Err(e) = ctx.registry().register_with_retry(record, ctx.retry_policy()).await {
            ctx.transport().remove_route(&route).await;
            return Err(e);
        }

        core.logger.info(format!("Publishing {} [{}]", topic, T::TYPE));
        Ok(Self {
            core,
            _message: PhantomData,
        })
    }

    /// Queue `message` for every connected subscriber and return immediately
    pub fn publish(&self, message: &T) -> GraphResult<()> {
        self.core.publish_bytes(message.to_bytes()?).map(|_| ())
    }

    pub fn topic(&self) -> &GraphName {
        &self.core.topic
    }

    pub fn message_type(&self) -> &'static str {
        self.core.message_type
    }

    pub fn record(&self) -> &RegistrationRecord {
        &self.core.record
    }

    /// Subscribers currently connected
    pub fn subscriber_count(&self) -> usize {
        self.core.subscriber_count()
    }

    /// Names of the connected subscriber nodes
    pub fn subscribers(&self) -> Vec<GraphName> {
        match self.core.links.lock() {
            Ok(links) => links
                .iter()
                .filter(|link| !link.frames.is_closed())
                .map(|link| link.subscriber.clone())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Number of messages published so far
    pub fn published(&self) -> u64 {
        self.core.seq.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.core.shut_down.load(Ordering::SeqCst)
    }

    /// Deregister and disconnect every subscriber. Messages already queued
    /// are still flushed.
    pub async fn shutdown(&self) {
        self.core.close().await;
    }

    pub(crate) fn resource(&self) -> Arc<dyn NodeResource> {
        self.core.clone()
    }
}

#[async_trait]
impl NodeResource for PublisherCore {
    fn describe(&self) -> String {
        format!("publisher {}", self.topic)
    }

    async fn shutdown(&self) {
        self.close().await;
    }
}
