// Message Definitions
//
// INTENTION: The typed payloads that ride on topics and services. A type name
// travels in every handshake so both ends of a channel can prove they agree on
// the payload before any data is exchanged.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::GraphResult;

/// A payload that can be published on a topic or carried by a service
pub trait Message: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Wire-level type name, e.g. `std_msgs/String`
    const TYPE: &'static str;

    fn to_bytes(&self) -> GraphResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    fn from_bytes(bytes: &[u8]) -> GraphResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// A request/response pair served under one name
pub trait ServiceDefinition: Send + Sync + 'static {
    type Request: Message;
    type Response: Message;

    const TYPE: &'static str;
}

/// Plain string message
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StdString {
    pub data: String,
}

impl StdString {
    pub fn new(data: impl Into<String>) -> Self {
        Self { data: data.into() }
    }
}

impl Message for StdString {
    const TYPE: &'static str = "std_msgs/String";
}

/// Integer addition service
pub struct AddTwoInts;

pub mod add_two_ints {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Request {
        pub a: i64,
        pub b: i64,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Response {
        pub sum: i64,
    }

    impl Message for Request {
        const TYPE: &'static str = "rosjava_test_msgs/AddTwoIntsRequest";
    }

    impl Message for Response {
        const TYPE: &'static str = "rosjava_test_msgs/AddTwoIntsResponse";
    }
}

impl ServiceDefinition for AddTwoInts {
    type Request = add_two_ints::Request;
    type Response = add_two_ints::Response;

    const TYPE: &'static str = "rosjava_test_msgs/AddTwoInts";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_bytes_decode_back() {
        let msg = StdString::new("hello world");
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(StdString::from_bytes(&bytes).unwrap(), msg);
        assert!(add_two_ints::Request::from_bytes(&[1]).is_err());
    }
}
