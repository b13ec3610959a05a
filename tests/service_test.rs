//! Service Test
//!
//! AddTwoInts served and called by nodes run by an executor.

#[path = "fixtures/graph_fixture.rs"]
mod graph_fixture;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use graph_fixture::{eventually, name, node_config, start_master, TEST_TIMEOUT};
use runar_graph::demo::{AddTwoIntsClientNode, AddTwoIntsServerNode};
use runar_graph::msgs::add_two_ints::{Request, Response};
use runar_graph::msgs::AddTwoInts;
use runar_graph::registry::RecordType;
use runar_graph::{ConnectedNode, GraphError, GraphName, NodeMain, NodeMainExecutor, RegistryApi};
use tokio::sync::oneshot;
use tokio::time::timeout;

struct IdleNode(GraphName);

#[async_trait]
impl NodeMain for IdleNode {
    fn default_node_name(&self) -> GraphName {
        self.0.clone()
    }

    async fn on_start(&self, _node: ConnectedNode) -> Result<()> {
        Ok(())
    }
}

async fn connected(executor: &NodeMainExecutor, node: &GraphName) -> Result<ConnectedNode> {
    executor
        .runtime(node)
        .await
        .ok_or_else(|| anyhow!("no runtime for {}", node))?
        .connected_node()
        .await
        .ok_or_else(|| anyhow!("{} is not connected", node))
}

#[tokio::test]
async fn test_demo_client_learns_the_sum() -> Result<()> {
    timeout(TEST_TIMEOUT, async {
        let (master, uri) = start_master().await;
        let executor = NodeMainExecutor::new();

        executor
            .execute(
                AddTwoIntsServerNode::new("/add_two_ints", "/server")?,
                node_config(&uri, "/server"),
            )
            .await?;
        let provider = master.lookup_service(&name("/add_two_ints")).await?;
        assert_eq!(provider.node, name("/server"));
        assert_eq!(provider.message_type, "rosjava_test_msgs/AddTwoInts");

        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let sink = outcomes.clone();
        executor
            .execute(
                AddTwoIntsClientNode::new("/add_two_ints", "/client")?
                    .with_period(Duration::from_millis(100))
                    .with_outcome_hook(move |outcome| sink.lock().unwrap().push(outcome.ok())),
                node_config(&uri, "/client"),
            )
            .await?;

        assert!(eventually(Duration::from_secs(5), || outcomes.lock().unwrap().len() >= 2).await);
        for outcome in outcomes.lock().unwrap().iter() {
            assert_eq!(*outcome, Some(3));
        }

        executor.shutdown().await;
        assert!(master.lookup(&name("/add_two_ints"), RecordType::Service)?.is_empty());
        master.shutdown().await;
        Ok::<(), anyhow::Error>(())
    })
    .await?
}

#[tokio::test]
async fn test_missing_service_reaches_failure_callback() -> Result<()> {
    timeout(TEST_TIMEOUT, async {
        let (master, uri) = start_master().await;
        let executor = NodeMainExecutor::new();

        let caller = executor.execute(IdleNode(name("/caller")), node_config(&uri, "/caller")).await?;
        let client = connected(&executor, &caller).await?.new_service_client::<AddTwoInts>("/absent")?;

        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let on_failure = tx.clone();
        client.call(
            Request { a: 1, b: 2 },
            move |response| {
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(Ok(response.sum));
                }
            },
            move |error| {
                if let Some(tx) = on_failure.lock().unwrap().take() {
                    let _ = tx.send(Err(error));
                }
            },
        );

        match rx.await? {
            Err(GraphError::ServiceNotFound(_)) => {}
            other => panic!("expected ServiceNotFound, got {:?}", other),
        }

        executor.shutdown().await;
        master.shutdown().await;
        Ok::<(), anyhow::Error>(())
    })
    .await?
}

#[tokio::test]
async fn test_handler_error_is_reported_and_server_keeps_serving() -> Result<()> {
    timeout(TEST_TIMEOUT, async {
        let (master, uri) = start_master().await;
        let executor = NodeMainExecutor::new();

        let server_name = executor.execute(IdleNode(name("/picky")), node_config(&uri, "/picky")).await?;
        let server = connected(&executor, &server_name)
            .await?
            .new_service_server::<AddTwoInts, _>("/picky_add", |request: Request| {
                if request.a < 0 {
                    bail!("negative operands are not accepted");
                }
                Ok(Response { sum: request.a + request.b })
            })
            .await?;

        let caller = executor.execute(IdleNode(name("/asker")), node_config(&uri, "/asker")).await?;
        let client = connected(&executor, &caller).await?.new_service_client::<AddTwoInts>("/picky_add")?;

        match client.call_async(Request { a: -1, b: 2 }).await {
            Err(GraphError::Remote(message)) => assert!(message.contains("negative")),
            other => panic!("expected Remote, got {:?}", other),
        }
        let response = client.call_async(Request { a: 20, b: 22 }).await?;
        assert_eq!(response.sum, 42);
        assert_eq!(server.calls_served(), 2);

        executor.shutdown().await;
        master.shutdown().await;
        Ok::<(), anyhow::Error>(())
    })
    .await?
}

#[tokio::test]
async fn test_client_follows_service_to_new_provider() -> Result<()> {
    timeout(TEST_TIMEOUT, async {
        let (master, uri) = start_master().await;
        let executor = NodeMainExecutor::new();

        let first = executor
            .execute(AddTwoIntsServerNode::new("/moving", "/first")?, node_config(&uri, "/first"))
            .await?;
        let caller = executor.execute(IdleNode(name("/follower")), node_config(&uri, "/follower")).await?;
        let client = connected(&executor, &caller).await?.new_service_client::<AddTwoInts>("/moving")?;
        assert_eq!(client.call_async(Request { a: 1, b: 2 }).await?.sum, 3);

        assert!(executor.shutdown_node_main(&first).await);
        executor
            .execute(AddTwoIntsServerNode::new("/moving", "/second")?, node_config(&uri, "/second"))
            .await?;

        assert_eq!(client.call_async(Request { a: 2, b: 3 }).await?.sum, 5);
        assert_eq!(master.lookup_service(&name("/moving")).await?.node, name("/second"));

        executor.shutdown().await;
        master.shutdown().await;
        Ok::<(), anyhow::Error>(())
    })
    .await?
}

#[tokio::test]
async fn test_server_handles_calls_concurrently() -> Result<()> {
    timeout(TEST_TIMEOUT, async {
        let (master, uri) = start_master().await;
        let executor = NodeMainExecutor::new();
        let handler_time = Duration::from_millis(400);

        let server_name = executor.execute(IdleNode(name("/slow_adder")), node_config(&uri, "/slow_adder")).await?;
        let server = connected(&executor, &server_name)
            .await?
            .new_service_server::<AddTwoInts, _>("/slow_add", move |request: Request| {
                std::thread::sleep(handler_time);
                Ok(Response { sum: request.a + request.b })
            })
            .await?;

        let first = executor.execute(IdleNode(name("/first_caller")), node_config(&uri, "/first_caller")).await?;
        let second = executor.execute(IdleNode(name("/second_caller")), node_config(&uri, "/second_caller")).await?;
        let first = connected(&executor, &first).await?.new_service_client::<AddTwoInts>("/slow_add")?;
        let second = connected(&executor, &second).await?.new_service_client::<AddTwoInts>("/slow_add")?;
        first.connect().await?;
        second.connect().await?;

        let started = std::time::Instant::now();
        let (a, b) = tokio::join!(
            first.call_async(Request { a: 1, b: 1 }),
            second.call_async(Request { a: 2, b: 2 }),
        );
        let elapsed = started.elapsed();
        assert_eq!(a?.sum, 2);
        assert_eq!(b?.sum, 4);
        assert!(elapsed < handler_time * 2, "calls were serialized: {:?}", elapsed);
        assert_eq!(server.calls_served(), 2);

        executor.shutdown().await;
        master.shutdown().await;
        Ok::<(), anyhow::Error>(())
    })
    .await?
}
