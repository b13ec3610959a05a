// Node-to-node Protocol
//
// Frames exchanged on connections accepted by a node's transport endpoint.
// Every inbound connection opens with exactly one `Handshake` and is answered
// with one `HandshakeReply`; what follows depends on the handshake kind.

use serde::{Deserialize, Serialize};

use crate::registry::RegistrationRecord;
use crate::routing::GraphName;

/// First frame on every inbound node connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Handshake {
    /// A subscriber asks a publisher to stream a topic to it
    SubscribeTopic {
        topic: GraphName,
        message_type: String,
        subscriber: GraphName,
    },
    /// A client opens a persistent call connection to a service
    ConnectService {
        service: GraphName,
        service_type: String,
        client: GraphName,
    },
    /// The master tells a subscriber the current publisher set of a topic
    PublisherUpdate {
        topic: GraphName,
        publishers: Vec<RegistrationRecord>,
    },
}

impl Handshake {
    /// Short description for logs
    pub fn describe(&self) -> String {
        match self {
            Handshake::SubscribeTopic { topic, subscriber, .. } => {
                format!("subscribe {} from {}", topic, subscriber)
            }
            Handshake::ConnectService { service, client, .. } => {
                format!("connect {} from {}", service, client)
            }
            Handshake::PublisherUpdate { topic, publishers } => {
                format!("publisher update for {} ({} publishers)", topic, publishers.len())
            }
        }
    }
}

/// Answer to a handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeReply {
    /// Accepted; carries the type the accepting side speaks
    Accepted { type_name: String },
    Rejected { reason: String },
}

/// One published message on a topic stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicFrame {
    /// Per-publisher sequence number, starting at 1
    pub seq: u64,
    /// bincode encoding of the message
    pub payload: Vec<u8>,
}

/// One request on a service connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceCall {
    pub call_id: u64,
    pub payload: Vec<u8>,
}

/// The single answer to a `ServiceCall`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServiceReply {
    Success { call_id: u64, payload: Vec<u8> },
    Failure { call_id: u64, message: String },
}

impl ServiceReply {
    pub fn call_id(&self) -> u64 {
        match self {
            ServiceReply::Success { call_id, .. } | ServiceReply::Failure { call_id, .. } => *call_id,
        }
    }
}
