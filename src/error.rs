// Error Taxonomy
//
// INTENTION: One error type for the whole substrate. Per-call failures
// (service lookups, remote handler errors, timeouts) are recoverable and get
// delivered to callbacks; bind failures and configuration errors are fatal and
// propagate to whoever started the component.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Result alias used across the library
pub type GraphResult<T> = Result<T, GraphError>;

/// Errors raised by the registry, node runtime and channel layers
#[derive(Debug, Error)]
pub enum GraphError {
    /// Invalid or blank name, or missing required endpoint configuration
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The registry is not (or no longer) accepting operations
    #[error("registry not ready: {0}")]
    NotReady(String),

    /// A listening socket could not be acquired
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// No provider is registered for the requested service
    #[error("service not found: {0}")]
    ServiceNotFound(String),

    /// The remote side failed while processing a call
    #[error("remote error: {0}")]
    Remote(String),

    /// A blocking wait was cut short by cancellation
    #[error("operation interrupted")]
    Interrupted,

    /// A caller-supplied deadline elapsed
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Connection level failure while talking to a peer
    #[error("transport error with {peer}: {source}")]
    Transport {
        peer: String,
        #[source]
        source: io::Error,
    },

    /// A frame could not be encoded or decoded
    #[error("codec error: {0}")]
    Codec(String),

    /// The two ends of a channel disagree on the payload type
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    /// The owning component has been shut down
    #[error("{0} is shut down")]
    Shutdown(String),
}

impl GraphError {
    /// Wrap an I/O error observed while talking to `peer`
    pub fn transport(peer: impl ToString, source: io::Error) -> Self {
        GraphError::Transport {
            peer: peer.to_string(),
            source,
        }
    }

    /// Wrap a bind failure for `addr`
    pub fn bind(addr: SocketAddr, source: io::Error) -> Self {
        GraphError::Bind {
            addr: addr.to_string(),
            source,
        }
    }

    /// Whether the failure is local to one call and should be reported
    /// through a callback rather than propagated to the orchestrator
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            GraphError::NotReady(_)
                | GraphError::ServiceNotFound(_)
                | GraphError::Remote(_)
                | GraphError::Interrupted
                | GraphError::Timeout(_)
                | GraphError::Transport { .. }
        )
    }
}

impl From<bincode::Error> for GraphError {
    fn from(err: bincode::Error) -> Self {
        GraphError::Codec(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(GraphError::ServiceNotFound("/sum".into()).is_recoverable());
        assert!(GraphError::Remote("boom".into()).is_recoverable());
        assert!(GraphError::NotReady("starting".into()).is_recoverable());
        assert!(!GraphError::Configuration("blank".into()).is_recoverable());

        let bind = GraphError::bind(
            "127.0.0.1:1".parse().unwrap(),
            io::Error::new(io::ErrorKind::AddrInUse, "in use"),
        );
        assert!(!bind.is_recoverable());
        assert!(bind.to_string().contains("127.0.0.1:1"));
    }
}
