//! Registry Test
//!
//! Talks to a master over the network through `RegistryClient`, the way
//! nodes do.

#[path = "fixtures/graph_fixture.rs"]
mod graph_fixture;

use std::time::Duration;

use anyhow::Result;
use graph_fixture::{name, start_master, TEST_TIMEOUT};
use runar_graph::network::Endpoint;
use runar_graph::registry::{MasterState, RecordType, RegistrationRecord};
use runar_graph::util::logging::{Component, Logger};
use runar_graph::{GraphError, Master, MasterConfig, MasterUri, RegistryApi, RegistryClient};
use tokio::time::timeout;

fn topic_record(topic: &str, node: &str, port: u16) -> RegistrationRecord {
    RegistrationRecord::new(
        name(topic),
        RecordType::TopicPublisher,
        name(node),
        Endpoint::new("127.0.0.1", port),
        "std_msgs/String",
    )
}

fn client_for(uri: &MasterUri) -> RegistryClient {
    RegistryClient::new(uri.clone(), &Logger::new_root(Component::Node, "registry_test"))
        .with_request_timeout(Duration::from_secs(2))
}

#[tokio::test]
async fn test_register_lookup_deregister() -> Result<()> {
    timeout(TEST_TIMEOUT, async {
        let (master, uri) = start_master().await;
        let client = client_for(&uri);

        let record = topic_record("/chatter", "/talker", 40001);
        let stored = client.register(record.clone()).await?;
        assert_eq!(stored, record);

        let found = client.lookup(&name("/chatter"), RecordType::TopicPublisher).await?;
        assert_eq!(found, vec![record.clone()]);

        // same name, other record type
        assert!(client.lookup(&name("/chatter"), RecordType::TopicSubscriber).await?.is_empty());
        assert!(client.lookup(&name("/nobody"), RecordType::Service).await?.is_empty());

        client.deregister(&name("/chatter"), RecordType::TopicPublisher, &name("/talker")).await?;
        assert!(client.lookup(&name("/chatter"), RecordType::TopicPublisher).await?.is_empty());
        // deregistering twice is not an error
        client.deregister(&name("/chatter"), RecordType::TopicPublisher, &name("/talker")).await?;

        master.shutdown().await;
        Ok::<(), anyhow::Error>(())
    })
    .await?
}

#[tokio::test]
async fn test_service_registration_is_last_writer_wins() -> Result<()> {
    timeout(TEST_TIMEOUT, async {
        let (master, uri) = start_master().await;
        let client = client_for(&uri);

        let first = RegistrationRecord::new(
            name("/add"),
            RecordType::Service,
            name("/server_a"),
            Endpoint::new("127.0.0.1", 40010),
            "rosjava_test_msgs/AddTwoInts",
        );
        let second = RegistrationRecord::new(
            name("/add"),
            RecordType::Service,
            name("/server_b"),
            Endpoint::new("127.0.0.1", 40011),
            "rosjava_test_msgs/AddTwoInts",
        );
        client.register(first).await?;
        client.register(second.clone()).await?;

        let provider = client.lookup_service(&name("/add")).await?;
        assert_eq!(provider, second);

        master.shutdown().await;
        Ok::<(), anyhow::Error>(())
    })
    .await?
}

#[tokio::test]
async fn test_deregister_node_removes_everything_it_owns() -> Result<()> {
    timeout(TEST_TIMEOUT, async {
        let (master, uri) = start_master().await;
        let client = client_for(&uri);

        client.register(topic_record("/a", "/busy", 40020)).await?;
        client.register(topic_record("/b", "/busy", 40020)).await?;
        client.register(topic_record("/a", "/other", 40021)).await?;

        assert_eq!(client.deregister_node(&name("/busy")).await?, 2);
        assert!(master.records_of(&name("/busy"))?.is_empty());
        assert_eq!(master.records_of(&name("/other"))?.len(), 1);

        master.shutdown().await;
        Ok::<(), anyhow::Error>(())
    })
    .await?
}

#[tokio::test]
async fn test_unstarted_master_is_not_ready() -> Result<()> {
    let master = Master::new(MasterConfig::new_private(0));
    assert_eq!(master.state(), MasterState::Created);
    assert!(!master.is_ready());
    assert!(!master.await_ready(Duration::from_millis(50)).await);

    match master.lookup(&name("/chatter"), RecordType::TopicPublisher) {
        Err(GraphError::NotReady(_)) => {}
        other => panic!("expected NotReady, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_unreachable_master_reports_not_ready() -> Result<()> {
    timeout(TEST_TIMEOUT, async {
        // bind and release a port so nothing is listening on it
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
            listener.local_addr()?.port()
        };
        let client = client_for(&MasterUri::new("127.0.0.1", port));
        match client.ping().await {
            Err(GraphError::NotReady(_)) => {}
            other => panic!("expected NotReady, got {:?}", other),
        }
        Ok::<(), anyhow::Error>(())
    })
    .await?
}

#[tokio::test]
async fn test_registry_stops_answering_after_shutdown() -> Result<()> {
    timeout(TEST_TIMEOUT, async {
        let (master, uri) = start_master().await;
        let client = client_for(&uri);
        client.ping().await?;

        master.shutdown().await;
        assert_eq!(master.state(), MasterState::ShutDown);
        assert!(client.ping().await.is_err());
        Ok::<(), anyhow::Error>(())
    })
    .await?
}
