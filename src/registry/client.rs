// Registry Client
//
// INTENTION: The node side of the registry protocol. Every call opens a short
// connection to the master, exchanges one request/reply pair and closes it, so
// a master restart never leaves a node holding a stale socket.

use std::time::Duration;

use async_trait::async_trait;

use crate::config::MasterUri;
use crate::error::{GraphError, GraphResult};
use crate::network::wire::FramedConnection;
use crate::network::Endpoint;
use crate::registry::protocol::{RegistryReply, RegistryRequest};
use crate::registry::records::{RecordType, RegistrationRecord};
use crate::registry::RegistryApi;
use crate::routing::GraphName;
use crate::util::logging::{Component, Logger};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

/// Connection to a remote master
#[derive(Debug, Clone)]
pub struct RegistryClient {
    master: Endpoint,
    uri: MasterUri,
    request_timeout: Duration,
    logger: Logger,
}

impl RegistryClient {
    pub fn new(master_uri: MasterUri, logger: &Logger) -> Self {
        Self {
            master: Endpoint::new(master_uri.host.clone(), master_uri.port),
            uri: master_uri,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            logger: logger.with_component(Component::Master),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn master_uri(&self) -> &MasterUri {
        &self.uri
    }

    async fn request(&self, request: RegistryRequest) -> GraphResult<RegistryReply> {
        let exchange = async {
            let mut conn = FramedConnection::connect(&self.master, self.request_timeout).await?;
            conn.round_trip::<_, RegistryReply>(&request).await
        };

        let reply = match tokio::time::timeout(self.request_timeout, exchange).await {
            Ok(reply) => reply,
            Err(_) => return Err(GraphError::Timeout(self.request_timeout)),
        };

        match reply {
            Ok(RegistryReply::NotReady(reason)) => Err(GraphError::NotReady(reason)),
            Ok(RegistryReply::Error(message)) => Err(GraphError::Remote(message)),
            Ok(reply) => Ok(reply),
            // a master that is not listening yet is simply not ready
            Err(GraphError::Transport { source, .. })
                if source.kind() == std::io::ErrorKind::ConnectionRefused =>
            {
                self.logger.debug(format!("Master at {} refused the connection", self.uri));
                Err(GraphError::NotReady(format!("master at {} refused the connection", self.uri)))
            }
            Err(e) => Err(e),
        }
    }

    fn unexpected(reply: RegistryReply) -> GraphError {
        GraphError::Codec(format!("unexpected registry reply {:?}", reply))
    }

    pub async fn register(&self, record: RegistrationRecord) -> GraphResult<RegistrationRecord> {
        match self.request(RegistryRequest::Register(record)).await? {
            RegistryReply::Registered(accepted) => Ok(accepted),
            other => Err(Self::unexpected(other)),
        }
    }

    pub async fn lookup(&self, name: &GraphName, record_type: RecordType) -> GraphResult<Vec<RegistrationRecord>> {
        let request = RegistryRequest::Lookup {
            name: name.clone(),
            record_type,
        };
        match self.request(request).await? {
            RegistryReply::Records(records) => Ok(records),
            other => Err(Self::unexpected(other)),
        }
    }

    pub async fn deregister(&self, name: &GraphName, record_type: RecordType, node: &GraphName) -> GraphResult<()> {
        let request = RegistryRequest::Deregister {
            name: name.clone(),
            record_type,
            node: node.clone(),
        };
        match self.request(request).await? {
            RegistryReply::Removed(_) => Ok(()),
            other => Err(Self::unexpected(other)),
        }
    }

    pub async fn deregister_node(&self, node: &GraphName) -> GraphResult<usize> {
        match self.request(RegistryRequest::DeregisterNode { node: node.clone() }).await? {
            RegistryReply::Removed(count) => Ok(count),
            other => Err(Self::unexpected(other)),
        }
    }

    /// Succeeds only when the master is listening and ready
    pub async fn ping(&self) -> GraphResult<()> {
        match self.request(RegistryRequest::Ping).await? {
            RegistryReply::Pong => Ok(()),
            other => Err(Self::unexpected(other)),
        }
    }
}

#[async_trait]
impl RegistryApi for RegistryClient {
    async fn register(&self, record: RegistrationRecord) -> GraphResult<RegistrationRecord> {
        RegistryClient::register(self, record).await
    }

    async fn lookup(&self, name: &GraphName, record_type: RecordType) -> GraphResult<Vec<RegistrationRecord>> {
        RegistryClient::lookup(self, name, record_type).await
    }

    async fn deregister(&self, name: &GraphName, record_type: RecordType, node: &GraphName) -> GraphResult<()> {
        RegistryClient::deregister(self, name, record_type, node).await
    }

    async fn deregister_node(&self, node: &GraphName) -> GraphResult<usize> {
        RegistryClient::deregister_node(self, node).await
    }
}
