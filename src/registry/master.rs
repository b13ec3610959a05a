// Master (Registry Server)
//
// INTENTION: The discovery plane of the graph. The master owns the record
// table, answers register/lookup/deregister over the registry protocol and
// in-process, and pushes publisher updates to subscribers when the publisher
// set of a topic changes. Topic and service traffic never passes through it.
//
// Lifecycle: Created -> (start) -> Starting -> Ready -> (shutdown) -> ShutDown.
// Every operation outside Ready fails with NotReady.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::MasterConfig;
use crate::error::{GraphError, GraphResult};
use crate::network::protocol::{Handshake, HandshakeReply};
use crate::network::wire::FramedConnection;
use crate::registry::protocol::{RegistryReply, RegistryRequest};
use crate::registry::records::{RecordTable, RecordType, RegistrationRecord, UpsertOutcome};
use crate::registry::RegistryApi;
use crate::routing::GraphName;
use crate::util::logging::{Component, Logger};

/// How long the master waits on a subscriber while pushing an update
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifecycle state of the master
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterState {
    Created,
    Starting,
    Ready,
    ShutDown,
}

/// State shared by the accept loop, connection tasks and the public API
struct Shared {
    table: StdMutex<RecordTable>,
    state: watch::Sender<MasterState>,
    token: CancellationToken,
    logger: Logger,
}

impl Shared {
    fn ensure_ready(&self) -> GraphResult<()> {
        match *self.state.borrow() {
            MasterState::Ready => Ok(()),
            other => Err(GraphError::NotReady(format!("master is {:?}", other))),
        }
    }

    fn publishers_of(&self, topic: &GraphName) -> Vec<RegistrationRecord> {
        self.table
            .lock()
            .map(|t| t.lookup(topic, RecordType::TopicPublisher))
            .unwrap_or_default()
    }

    fn register(self: &Arc<Self>, record: RegistrationRecord) -> GraphResult<RegistrationRecord> {
        self.ensure_ready()?;
        let outcome = {
            let mut table = self
                .table
                .lock()
                .map_err(|_| GraphError::NotReady("record table poisoned".to_string()))?;
            table.upsert(record.clone())
        };

        match &outcome {
            UpsertOutcome::Inserted => self.logger.info(format!("Registered {}", record)),
            UpsertOutcome::Updated => self.logger.debug(format!("Refreshed {}", record)),
            UpsertOutcome::Replaced { previous } => self.logger.warn(format!(
                "Service {} taken over by {} (was {})",
                record.name, record.node, previous.node
            )),
        }

        if record.record_type == RecordType::TopicPublisher {
            self.spawn_publisher_update(record.name.clone());
        }
        Ok(record)
    }

    fn lookup(&self, name: &GraphName, record_type: RecordType) -> GraphResult<Vec<RegistrationRecord>> {
        self.ensure_ready()?;
        let table = self
            .table
            .lock()
            .map_err(|_| GraphError::NotReady("record table poisoned".to_string()))?;
        Ok(table.lookup(name, record_type))
    }

    fn deregister(self: &Arc<Self>, name: &GraphName, record_type: RecordType, node: &GraphName) -> GraphResult<usize> {
        self.ensure_ready()?;
        let removed = {
            let mut table = self
                .table
                .lock()
                .map_err(|_| GraphError::NotReady("record table poisoned".to_string()))?;
            table.remove(name, record_type, node)
        };

        match removed {
            Some(record) => {
                self.logger.info(format!("Deregistered {}", record));
                if record.record_type == RecordType::TopicPublisher {
                    self.spawn_publisher_update(record.name);
                }
                Ok(1)
            }
            None => Ok(0),
        }
    }

    fn deregister_node(self: &Arc<Self>, node: &GraphName) -> GraphResult<usize> {
        self.ensure_ready()?;
        let removed = {
            let mut table = self
                .table
                .lock()
                .map_err(|_| GraphError::NotReady("record table poisoned".to_string()))?;
            table.remove_node(node)
        };
        if removed.is_empty() {
            return Ok(0);
        }

        self.logger.info(format!("Deregistered node {} ({} records)", node, removed.len()));
        let topics: BTreeSet<GraphName> = removed
            .iter()
            .filter(|r| r.record_type == RecordType::TopicPublisher)
            .map(|r| r.name.clone())
            .collect();
        for topic in topics {
            self.spawn_publisher_update(topic);
        }
        Ok(removed.len())
    }

    /// Tell every subscriber of `topic` the current publisher set
    fn spawn_publisher_update(self: &Arc<Self>, topic: GraphName) {
        let shared = self.clone();
        tokio::spawn(async move {
            let (subscribers, publishers) = match shared.table.lock() {
                Ok(table) => (
                    table.lookup(&topic, RecordType::TopicSubscriber),
                    table.lookup(&topic, RecordType::TopicPublisher),
                ),
                Err(_) => return,
            };

            for subscriber in subscribers {
                if shared.token.is_cancelled() {
                    return;
                }
                let update = Handshake::PublisherUpdate {
                    topic: topic.clone(),
                    publishers: publishers.clone(),
                };
                match Self::push_update(&subscriber, &update).await {
                    Ok(()) => shared.logger.debug(format!(
                        "Pushed {} publishers of {} to {}",
                        publishers.len(),
                        topic,
                        subscriber.node
                    )),
                    Err(GraphError::Transport { source, .. })
                        if source.kind() == std::io::ErrorKind::ConnectionRefused =>
                    {
                        shared.logger.warn(format!(
                            "Subscriber {} unreachable at {}; dropping its registrations",
                            subscriber.node, subscriber.endpoint
                        ));
                        if let Err(e) = shared.deregister_node(&subscriber.node) {
                            shared.logger.warn(format!(
                                "Dropping registrations of {} failed: {}",
                                subscriber.node, e
                            ));
                        }
                    }
                    Err(e) => shared.logger.warn(format!(
                        "Publisher update for {} to {} failed: {}",
                        topic, subscriber.node, e
                    )),
                }
            }
        });
    }

    async fn push_update(subscriber: &RegistrationRecord, update: &Handshake) -> GraphResult<()> {
        let mut conn = FramedConnection::connect(&subscriber.endpoint, NOTIFY_TIMEOUT).await?;
        let reply: HandshakeReply = tokio::time::timeout(NOTIFY_TIMEOUT, conn.round_trip(update))
            .await
            .map_err(|_| GraphError::Timeout(NOTIFY_TIMEOUT))??;
        match reply {
            HandshakeReply::Accepted { .. } => Ok(()),
            HandshakeReply::Rejected { reason } => Err(GraphError::Remote(reason)),
        }
    }

    fn handle(self: &Arc<Self>, request: RegistryRequest) -> RegistryReply {
        let result = match request {
            RegistryRequest::Register(record) => self.register(record).map(RegistryReply::Registered),
            RegistryRequest::Lookup { name, record_type } => {
                self.lookup(&name, record_type).map(RegistryReply::Records)
            }
            RegistryRequest::Deregister {
                name,
                record_type,
                node,
            } => self.deregister(&name, record_type, &node).map(RegistryReply::Removed),
            RegistryRequest::DeregisterNode { node } => self.deregister_node(&node).map(RegistryReply::Removed),
            RegistryRequest::Ping => self.ensure_ready().map(|_| RegistryReply::Pong),
        };

        match result {
            Ok(reply) => reply,
            Err(GraphError::NotReady(msg)) => RegistryReply::NotReady(msg),
            Err(e) => RegistryReply::Error(e.to_string()),
        }
    }
}

/// The registry server
pub struct Master {
    config: MasterConfig,
    shared: Arc<Shared>,
    state_rx: watch::Receiver<MasterState>,
    local_addr: StdMutex<Option<SocketAddr>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Master {
    pub fn new(config: MasterConfig) -> Self {
        let (state, state_rx) = watch::channel(MasterState::Created);
        let logger = Logger::new_root(Component::Master, "master");
        Self {
            config,
            shared: Arc::new(Shared {
                table: StdMutex::new(RecordTable::new()),
                state,
                token: CancellationToken::new(),
                logger,
            }),
            state_rx,
            local_addr: StdMutex::new(None),
            accept_task: Mutex::new(None),
        }
    }

    /// Master listening on all interfaces at `port`
    pub fn new_public(port: u16) -> Self {
        Self::new(MasterConfig::new_public(port))
    }

    pub fn state(&self) -> MasterState {
        *self.state_rx.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == MasterState::Ready
    }

    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.lock().ok().and_then(|addr| *addr)
    }

    /// Begin listening for registry traffic
    pub async fn start(&self) -> GraphResult<()> {
        let current = self.state();
        if current != MasterState::Created {
            return Err(GraphError::Configuration(format!(
                "master cannot be started from state {:?}",
                current
            )));
        }
        self.shared.state.send_replace(MasterState::Starting);

        let bind_target = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port))
            .await
            .map_err(|e| self.abort_start(&bind_target, e))?;
        let addr = listener.local_addr().map_err(|e| self.abort_start(&bind_target, e))?;
        if let Ok(mut slot) = self.local_addr.lock() {
            *slot = Some(addr);
        }
        self.shared.logger.info(format!("Master listening on {}", addr));

        let shared = self.shared.clone();
        let task = tokio::spawn(async move {
            shared.state.send_replace(MasterState::Ready);
            Self::accept_loop(listener, shared).await;
        });
        *self.accept_task.lock().await = Some(task);
        Ok(())
    }

    /// A start that failed after leaving `Created` can never become ready
    fn abort_start(&self, addr: &str, source: std::io::Error) -> GraphError {
        self.shared.state.send_replace(MasterState::ShutDown);
        GraphError::Bind {
            addr: addr.to_string(),
            source,
        }
    }

    /// Wait until the master accepts registrations; `false` on timeout or if
    /// the master can no longer become ready
    pub async fn await_ready(&self, timeout: Duration) -> bool {
        let mut rx = self.state_rx.clone();
        let wait = rx.wait_for(|state| matches!(state, MasterState::Ready | MasterState::ShutDown));
        let ready = match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(state)) => *state == MasterState::Ready,
            _ => false,
        };
        ready
    }

    pub fn register(&self, record: RegistrationRecord) -> GraphResult<RegistrationRecord> {
        self.shared.register(record)
    }

    pub fn lookup(&self, name: &GraphName, record_type: RecordType) -> GraphResult<Vec<RegistrationRecord>> {
        self.shared.lookup(name, record_type)
    }

    /// Remove `node`'s record for `(name, record_type)`; absent is a no-op
    pub fn deregister(&self, name: &GraphName, record_type: RecordType, node: &GraphName) -> GraphResult<()> {
        self.shared.deregister(name, record_type, node).map(|_| ())
    }

    /// Remove every record owned by `node`; returns how many were removed
    pub fn deregister_node(&self, node: &GraphName) -> GraphResult<usize> {
        self.shared.deregister_node(node)
    }

    /// Every record currently owned by `node`
    pub fn records_of(&self, node: &GraphName) -> GraphResult<Vec<RegistrationRecord>> {
        self.shared.ensure_ready()?;
        Ok(self
            .shared
            .table
            .lock()
            .map(|t| t.records_of(node))
            .unwrap_or_default())
    }

    /// Stop accepting registrations and release the listening socket.
    /// Established node-to-node connections are unaffected.
    pub async fn shutdown(&self) {
        if self.state() == MasterState::ShutDown {
            return;
        }
        self.shared.state.send_replace(MasterState::ShutDown);
        self.shared.token.cancel();
        if let Some(task) = self.accept_task.lock().await.take() {
            let _ = task.await;
        }
        if let Ok(mut table) = self.shared.table.lock() {
            table.clear();
        }
        self.shared.logger.info("Master shut down");
    }

    async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
        loop {
            let accepted = tokio::select! {
                _ = shared.token.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, remote)) => {
                    let shared = shared.clone();
                    tokio::spawn(async move {
                        let mut conn = FramedConnection::new(stream);
                        if let Err(e) = Self::serve_connection(&mut conn, &shared).await {
                            shared.logger.debug(format!("Registry connection {} ended: {}", remote, e));
                        }
                    });
                }
                Err(e) => shared.logger.warn(format!("Registry accept failed: {}", e)),
            }
        }
    }

    async fn serve_connection(conn: &mut FramedConnection, shared: &Arc<Shared>) -> GraphResult<()> {
        loop {
            let request: RegistryRequest = tokio::select! {
                _ = shared.token.cancelled() => return Ok(()),
                next = conn.recv() => match next? {
                    Some(request) => request,
                    None => return Ok(()),
                },
            };
            let reply = shared.handle(request);
            conn.send(&reply).await?;
        }
    }

    /// Publishers currently registered on `topic`
    pub fn publishers_of(&self, topic: &GraphName) -> Vec<RegistrationRecord> {
        self.shared.publishers_of(topic)
    }
}

#[async_trait]
impl RegistryApi for Master {
    async fn register(&self, record: RegistrationRecord) -> GraphResult<RegistrationRecord> {
        Master::register(self, record)
    }

    async fn lookup(&self, name: &GraphName, record_type: RecordType) -> GraphResult<Vec<RegistrationRecord>> {
        Master::lookup(self, name, record_type)
    }

    async fn deregister(&self, name: &GraphName, record_type: RecordType, node: &GraphName) -> GraphResult<()> {
        Master::deregister(self, name, record_type, node)
    }

    async fn deregister_node(&self, node: &GraphName) -> GraphResult<usize> {
        Master::deregister_node(self, node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Endpoint;

    fn record(name: &str, record_type: RecordType, node: &str) -> RegistrationRecord {
        RegistrationRecord::new(
            GraphName::new(name).unwrap(),
            record_type,
            GraphName::new(node).unwrap(),
            Endpoint::new("127.0.0.1", 1),
            "std_msgs/String",
        )
    }

    #[tokio::test]
    async fn test_operations_before_start_are_not_ready() {
        let master = Master::new(MasterConfig::new_private(0));
        let err = master
            .register(record("/chatter", RecordType::TopicSubscriber, "/n"))
            .unwrap_err();
        assert!(matches!(err, GraphError::NotReady(_)));
        assert!(!master.await_ready(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn test_start_then_ready_then_shutdown() {
        let master = Master::new(MasterConfig::new_private(0));
        master.start().await.unwrap();
        assert!(master.await_ready(Duration::from_secs(2)).await);
        assert!(master.local_addr().is_some());

        let rec = record("/chatter", RecordType::TopicSubscriber, "/n");
        assert_eq!(master.register(rec.clone()).unwrap(), rec);

        master.shutdown().await;
        assert_eq!(master.state(), MasterState::ShutDown);
        assert!(matches!(
            master.lookup(&rec.name, RecordType::TopicSubscriber),
            Err(GraphError::NotReady(_))
        ));
        assert!(!master.await_ready(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let master = Master::new(MasterConfig::new_private(0));
        master.start().await.unwrap();
        assert!(matches!(master.start().await, Err(GraphError::Configuration(_))));
        master.shutdown().await;
    }

    #[tokio::test]
    async fn test_bind_conflict_reports_bind_error() {
        let first = Master::new(MasterConfig::new_private(0));
        first.start().await.unwrap();
        let port = first.local_addr().unwrap().port();

        let second = Master::new(MasterConfig::new_private(port));
        assert!(matches!(second.start().await, Err(GraphError::Bind { .. })));
        assert!(!second.await_ready(Duration::from_millis(10)).await);
        first.shutdown().await;
    }

    #[tokio::test]
    async fn test_await_ready_wakes_on_later_start() {
        let master = Arc::new(Master::new(MasterConfig::new_private(0)));
        let waiter = {
            let master = master.clone();
            tokio::spawn(async move { master.await_ready(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        master.start().await.unwrap();
        assert!(waiter.await.unwrap());
        master.shutdown().await;
    }

    #[tokio::test]
    async fn test_aborted_start_is_never_ready() {
        let master = Master::new(MasterConfig::new_private(0));
        master.shared.state.send_replace(MasterState::Starting);

        let err = master.abort_start(
            "127.0.0.1:0",
            std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, "no local address"),
        );
        assert!(matches!(err, GraphError::Bind { .. }));
        assert_eq!(master.state(), MasterState::ShutDown);

        // answers at once instead of waiting out the timeout
        let started = std::time::Instant::now();
        assert!(!master.await_ready(Duration::from_secs(5)).await);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_unreachable_subscriber_is_dropped_on_push() {
        let master = Master::new(MasterConfig::new_private(0));
        master.start().await.unwrap();

        let closed_port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut gone = record("/chatter", RecordType::TopicSubscriber, "/gone");
        gone.endpoint = Endpoint::new("127.0.0.1", closed_port);
        master.register(gone).unwrap();
        master
            .register(record("/chatter", RecordType::TopicPublisher, "/talker"))
            .unwrap();

        let node = GraphName::new("/gone").unwrap();
        let dropped = tokio::time::timeout(Duration::from_secs(5), async {
            while !master.records_of(&node).unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(dropped.is_ok(), "unreachable subscriber was never dropped");
        assert_eq!(master.publishers_of(&GraphName::new("/chatter").unwrap()).len(), 1);
        master.shutdown().await;
    }
}
