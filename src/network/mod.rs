// Network Module
//
// Endpoints, wire framing, the node-to-node protocol and the per-node
// transport endpoint that accepts inbound topic and service connections.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

pub mod protocol;
pub mod transport;
pub mod wire;

pub use protocol::{Handshake, HandshakeReply, ServiceCall, ServiceReply, TopicFrame};
pub use transport::{ConnectionAcceptor, RouteKey, TransportEndpoint};
pub use wire::{FrameReader, FrameWriter, FramedConnection};

/// Where a node's transport endpoint can be reached
///
/// Fixed once the endpoint is listening.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Advertised endpoint for a socket bound on `host`
    pub fn from_bound(host: &str, addr: SocketAddr) -> Self {
        Self::new(host, addr.port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
