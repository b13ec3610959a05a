// Registry Protocol
//
// Request/response frames spoken between a node and the master. A connection
// may carry any number of request/reply pairs, strictly alternating.

use serde::{Deserialize, Serialize};

use crate::registry::records::{RecordType, RegistrationRecord};
use crate::routing::GraphName;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RegistryRequest {
    Register(RegistrationRecord),
    Lookup {
        name: GraphName,
        record_type: RecordType,
    },
    Deregister {
        name: GraphName,
        record_type: RecordType,
        node: GraphName,
    },
    DeregisterNode {
        node: GraphName,
    },
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RegistryReply {
    Registered(RegistrationRecord),
    Records(Vec<RegistrationRecord>),
    /// Deregistration finished; carries how many records were removed
    Removed(usize),
    Pong,
    NotReady(String),
    Error(String),
}
