// Shared setup for the integration tests: a master on an ephemeral port and
// node configurations pointing at it.

#![allow(dead_code)]

use std::time::Duration;

use runar_graph::config::RetryPolicy;
use runar_graph::util::logging::configure_test_logging;
use runar_graph::{GraphName, Master, MasterConfig, MasterUri, NodeConfiguration};

pub const TEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Start a loopback master and wait for it to accept registrations
pub async fn start_master() -> (Master, MasterUri) {
    configure_test_logging();
    let master = Master::new(MasterConfig::new_private(0));
    master.start().await.expect("master starts");
    assert!(master.await_ready(Duration::from_secs(2)).await, "master ready within 2s");
    let port = master.local_addr().expect("master is bound").port();
    (master, MasterUri::new("127.0.0.1", port))
}

/// Configuration for a loopback node named `name`
pub fn node_config(master_uri: &MasterUri, name: &str) -> NodeConfiguration {
    NodeConfiguration::new_private()
        .with_master_uri(master_uri.clone())
        .with_node_name(GraphName::new(name).expect("valid node name"))
        .with_shutdown_grace(Duration::from_millis(500))
        .with_registry_retry(RetryPolicy {
            attempts: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(200),
        })
}

pub fn name(value: &str) -> GraphName {
    GraphName::new(value).expect("valid graph name")
}

/// Poll `check` until it holds or `within` elapses
pub async fn eventually<F>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
