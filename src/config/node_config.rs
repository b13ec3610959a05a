// Node and Master Configuration
//
// INTENTION: Collect everything a node or the master needs before it touches
// the network: host address, master location, node name and the timing knobs
// for shutdown and registry retries. `validate` fails fast so a bad
// configuration never produces a half-started node.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{GraphError, GraphResult};
use crate::routing::GraphName;
use crate::util::logging::LogSink;

/// Environment variable holding the master URI in external mode
pub const MASTER_URI_ENV: &str = "RUNAR_MASTER_URI";
/// Environment variable holding the host address nodes advertise
pub const HOST_IP_ENV: &str = "RUNAR_IP";

/// Port the master listens on unless told otherwise
pub const DEFAULT_MASTER_PORT: u16 = 11311;

/// Location of the registry, parsed from `http://host:port` or `host:port`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MasterUri {
    pub host: String,
    pub port: u16,
}

impl MasterUri {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn parse(uri: &str) -> GraphResult<Self> {
        let trimmed = uri.trim();
        if trimmed.is_empty() {
            return Err(GraphError::Configuration("master URI must not be blank".to_string()));
        }
        let without_scheme = match trimmed.split_once("://") {
            Some((scheme, rest)) if scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("tcp") => rest,
            Some((scheme, _)) => {
                return Err(GraphError::Configuration(format!(
                    "unsupported master URI scheme '{}'",
                    scheme
                )))
            }
            None => trimmed,
        };
        let authority = without_scheme.trim_end_matches('/');

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    GraphError::Configuration(format!("invalid port in master URI '{}'", uri))
                })?;
                (host, port)
            }
            None => (authority, DEFAULT_MASTER_PORT),
        };
        if host.is_empty() {
            return Err(GraphError::Configuration(format!("missing host in master URI '{}'", uri)));
        }

        Ok(Self::new(host, port))
    }
}

impl fmt::Display for MasterUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "http://{}:{}", self.host, self.port)
    }
}

/// Backoff applied when the registry reports it is not ready yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 8,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no waiting
    pub fn none() -> Self {
        Self {
            attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Wait before attempt number `attempt` (0-based, attempt 0 never waits)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

/// Registry (master) settings
#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub host: String,
    pub port: u16,
}

impl MasterConfig {
    /// Listen on all interfaces
    pub fn new_public(port: u16) -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port,
        }
    }

    /// Listen on loopback only
    pub fn new_private(port: u16) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port,
        }
    }
}

/// Settings for one node runtime
#[derive(Clone)]
pub struct NodeConfiguration {
    /// Address the node binds and advertises
    pub host: String,
    /// Overrides the node's default name when set
    pub node_name: Option<GraphName>,
    pub master_uri: Option<MasterUri>,
    /// Sink for `ConnectedNode::log()`; a component logger is used when absent
    pub log_sink: Option<Arc<dyn LogSink>>,
    /// How long shutdown waits for work loops before aborting them
    pub shutdown_grace: Duration,
    pub registry_retry: RetryPolicy,
    /// Default deadline for service calls made by this node
    pub call_timeout: Duration,
}

impl fmt::Debug for NodeConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeConfiguration")
            .field("host", &self.host)
            .field("node_name", &self.node_name)
            .field("master_uri", &self.master_uri)
            .field("log_sink", &self.log_sink.as_ref().map(|_| "<LogSink>"))
            .field("shutdown_grace", &self.shutdown_grace)
            .field("registry_retry", &self.registry_retry)
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

impl NodeConfiguration {
    /// Configuration for a node reachable at `host`
    pub fn new_public(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            node_name: None,
            master_uri: None,
            log_sink: None,
            shutdown_grace: Duration::from_secs(2),
            registry_retry: RetryPolicy::default(),
            call_timeout: Duration::from_secs(5),
        }
    }

    /// Loopback-only configuration
    pub fn new_private() -> Self {
        Self::new_public("127.0.0.1")
    }

    pub fn with_node_name(mut self, name: GraphName) -> Self {
        self.node_name = Some(name);
        self
    }

    pub fn with_master_uri(mut self, uri: MasterUri) -> Self {
        self.master_uri = Some(uri);
        self
    }

    pub fn with_log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = Some(sink);
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_registry_retry(mut self, policy: RetryPolicy) -> Self {
        self.registry_retry = policy;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Check required fields; returns the master URI on success
    pub fn validate(&self) -> GraphResult<&MasterUri> {
        if self.host.trim().is_empty() {
            return Err(GraphError::Configuration("node host must not be blank".to_string()));
        }
        self.master_uri
            .as_ref()
            .ok_or_else(|| GraphError::Configuration("master URI is required".to_string()))
    }
}

/// Settings read from the process environment (external master mode)
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub master_uri: MasterUri,
    pub host: String,
}

impl EnvConfig {
    pub fn from_env() -> GraphResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env` with an injectable variable source
    pub fn from_lookup<F>(lookup: F) -> GraphResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| GraphError::Configuration(format!("{} environment variable needs to be set", key)))
        };
        let master_uri = MasterUri::parse(&required(MASTER_URI_ENV)?)?;
        let host = required(HOST_IP_ENV)?.trim().to_string();
        Ok(Self { master_uri, host })
    }

    /// Node configuration for `name` against the configured master
    pub fn node_configuration(&self, name: GraphName) -> NodeConfiguration {
        NodeConfiguration::new_public(self.host.clone())
            .with_master_uri(self.master_uri.clone())
            .with_node_name(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_master_uri_forms() {
        assert_eq!(
            MasterUri::parse("http://127.0.0.1:11311").unwrap(),
            MasterUri::new("127.0.0.1", 11311)
        );
        assert_eq!(MasterUri::parse("localhost:9000/").unwrap(), MasterUri::new("localhost", 9000));
        assert_eq!(MasterUri::parse("http://master").unwrap().port, DEFAULT_MASTER_PORT);
        assert!(MasterUri::parse("").is_err());
        assert!(MasterUri::parse("ftp://x:1").is_err());
        assert!(MasterUri::parse("http://x:notaport").is_err());
        assert_eq!(MasterUri::new("h", 1).to_string(), "http://h:1");
    }

    #[test]
    fn test_validate_requires_master_and_host() {
        let missing = NodeConfiguration::new_private();
        assert!(matches!(missing.validate(), Err(GraphError::Configuration(_))));

        let blank_host = NodeConfiguration::new_public("  ").with_master_uri(MasterUri::new("h", 1));
        assert!(matches!(blank_host.validate(), Err(GraphError::Configuration(_))));

        let ok = NodeConfiguration::new_private().with_master_uri(MasterUri::new("h", 1));
        assert_eq!(ok.validate().unwrap().port, 1);
    }

    #[test]
    fn test_env_config_requires_both_variables() {
        let mut vars = HashMap::new();
        vars.insert(MASTER_URI_ENV.to_string(), "http://10.0.0.1:11311".to_string());
        assert!(EnvConfig::from_lookup(|k| vars.get(k).cloned()).is_err());

        vars.insert(HOST_IP_ENV.to_string(), "10.0.0.2".to_string());
        let config = EnvConfig::from_lookup(|k| vars.get(k).cloned()).unwrap();
        assert_eq!(config.master_uri, MasterUri::new("10.0.0.1", 11311));

        let node = config.node_configuration(GraphName::new("/n").unwrap());
        assert_eq!(node.host, "10.0.0.2");
        assert!(node.validate().is_ok());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            attempts: 10,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
        };
        assert_eq!(policy.backoff_for(0), Duration::ZERO);
        assert_eq!(policy.backoff_for(1), Duration::from_millis(10));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(40));
        assert_eq!(policy.backoff_for(9), Duration::from_millis(50));
        assert_eq!(policy.backoff_for(40), Duration::from_millis(50));
    }
}
