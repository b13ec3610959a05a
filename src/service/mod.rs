// Service Module
//
// One-to-one request/response calls. A service name has exactly one active
// provider at a time; any number of clients may call it.

pub mod client;
pub mod server;

pub use client::ServiceClient;
pub use server::ServiceServer;

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::bail;
    use tokio::sync::oneshot;

    use super::*;
    use crate::config::MasterConfig;
    use crate::error::GraphError;
    use crate::msgs::add_two_ints::{Request, Response};
    use crate::msgs::AddTwoInts;
    use crate::network::TransportEndpoint;
    use crate::node::context::NodeContext;
    use crate::registry::{Master, RecordType, RegistryApi};
    use crate::routing::GraphName;
    use crate::util::logging::{Component, Logger};

    async fn started_master() -> Arc<Master> {
        let master = Arc::new(Master::new(MasterConfig::new_private(0)));
        master.start().await.unwrap();
        assert!(master.await_ready(Duration::from_secs(2)).await);
        master
    }

    async fn context(master: &Arc<Master>, name: &str) -> NodeContext {
        let logger = Logger::new_root(Component::Node, name);
        let transport = TransportEndpoint::bind("127.0.0.1", &logger).await.unwrap();
        let registry: Arc<dyn RegistryApi> = master.clone();
        NodeContext::new(GraphName::new(name).unwrap(), transport, registry, logger)
    }

    fn sum(request: Request) -> anyhow::Result<Response> {
        Ok(Response {
            sum: request.a + request.b,
        })
    }

    #[tokio::test]
    async fn test_call_returns_sum() {
        let result = tokio::time::timeout(Duration::from_secs(10), async {
            let master = started_master().await;
            let server_ctx = context(&master, "/server").await;
            let client_ctx = context(&master, "/client").await;
            let name = GraphName::new("/add_two_ints").unwrap();

            let server = ServiceServer::<AddTwoInts>::create(&server_ctx, name.clone(), sum)
                .await
                .unwrap();
            let client = ServiceClient::<AddTwoInts>::create(&client_ctx, name.clone());
            assert!(!client.is_connected());

            let response = client.call_async(Request { a: 1, b: 2 }).await.unwrap();
            assert_eq!(response.sum, 3);
            assert!(client.is_connected());

            let (tx, rx) = oneshot::channel();
            client.call(
                Request { a: 40, b: 2 },
                move |response| {
                    let _ = tx.send(response.sum);
                },
                move |e: GraphError| panic!("unexpected failure: {}", e),
            );
            assert_eq!(rx.await.unwrap(), 42);
            assert_eq!(server.calls_served(), 2);

            client.shutdown().await;
            server.shutdown().await;
            assert!(master.lookup(&name, RecordType::Service).unwrap().is_empty());
            master.shutdown().await;
        })
        .await;
        assert!(result.is_ok(), "service call test timed out");
    }

    #[tokio::test]
    async fn test_unknown_service_reports_not_found_through_failure_callback() {
        let result = tokio::time::timeout(Duration::from_secs(10), async {
            let master = started_master().await;
            let client_ctx = context(&master, "/client").await;
            let client = ServiceClient::<AddTwoInts>::create(&client_ctx, GraphName::new("/nobody").unwrap());

            let (success_tx, success_rx) = oneshot::channel::<i64>();
            let (fail_tx, fail_rx) = oneshot::channel();
            client.call(
                Request { a: 1, b: 2 },
                move |response| {
                    let _ = success_tx.send(response.sum);
                },
                move |e: GraphError| {
                    let _ = fail_tx.send(e);
                },
            );
            let err = fail_rx.await.unwrap();
            assert!(matches!(err, GraphError::ServiceNotFound(_)));
            assert!(success_rx.await.is_err());
            master.shutdown().await;
        })
        .await;
        assert!(result.is_ok(), "service not found test timed out");
    }

    #[tokio::test]
    async fn test_handler_error_is_remote_and_server_survives() {
        let result = tokio::time::timeout(Duration::from_secs(10), async {
            let master = started_master().await;
            let server_ctx = context(&master, "/server").await;
            let client_ctx = context(&master, "/client").await;
            let name = GraphName::new("/picky_sum").unwrap();

            let server = ServiceServer::<AddTwoInts>::create(&server_ctx, name.clone(), |request: Request| {
                if request.a < 0 {
                    bail!("negative operand {}", request.a);
                }
                Ok(Response {
                    sum: request.a + request.b,
                })
            })
            .await
            .unwrap();
            let client = ServiceClient::<AddTwoInts>::create(&client_ctx, name);

            let err = client.call_async(Request { a: -1, b: 2 }).await.unwrap_err();
            match err {
                GraphError::Remote(message) => assert!(message.contains("negative operand")),
                other => panic!("expected remote error, got {:?}", other),
            }
            assert_eq!(client.call_async(Request { a: 5, b: 6 }).await.unwrap().sum, 11);

            server.shutdown().await;
            master.shutdown().await;
        })
        .await;
        assert!(result.is_ok(), "remote error test timed out");
    }

    #[tokio::test]
    async fn test_slow_handler_times_out() {
        let result = tokio::time::timeout(Duration::from_secs(10), async {
            let master = started_master().await;
            let server_ctx = context(&master, "/server").await;
            let client_ctx = context(&master, "/client").await;
            let name = GraphName::new("/slow_sum").unwrap();

            let server = ServiceServer::<AddTwoInts>::create(&server_ctx, name.clone(), |request: Request| {
                std::thread::sleep(Duration::from_millis(500));
                sum(request)
            })
            .await
            .unwrap();
            let client = ServiceClient::<AddTwoInts>::create(&client_ctx, name)
                .with_call_timeout(Duration::from_millis(100));

            let err = client.call_async(Request { a: 1, b: 1 }).await.unwrap_err();
            assert!(matches!(err, GraphError::Timeout(_)));
            assert!(!client.is_connected());

            server.shutdown().await;
            master.shutdown().await;
        })
        .await;
        assert!(result.is_ok(), "timeout test timed out");
    }
}
