// Service Demo Nodes
//
// A server answering AddTwoInts and a client asking it for 1 + 2 once per
// period.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::error::{GraphError, GraphResult};
use crate::msgs::add_two_ints::{Request, Response};
use crate::msgs::AddTwoInts;
use crate::node::{ConnectedNode, NodeMain};
use crate::routing::GraphName;

const DEFAULT_PERIOD: Duration = Duration::from_secs(1);

fn required(value: &str, what: &str) -> GraphResult<String> {
    if value.trim().is_empty() {
        return Err(GraphError::Configuration(format!("{} must not be blank", what)));
    }
    Ok(value.trim().to_string())
}

/// `sum = a + b`; overflow is reported to the caller instead of wrapping
pub fn add_two_ints(request: Request) -> Result<Response> {
    let sum = request
        .a
        .checked_add(request.b)
        .ok_or_else(|| anyhow!("{} + {} overflows", request.a, request.b))?;
    Ok(Response { sum })
}

/// Serves AddTwoInts
pub struct AddTwoIntsServerNode {
    service: String,
    name: GraphName,
}

impl AddTwoIntsServerNode {
    pub fn new(service: &str, node_name: &str) -> GraphResult<Self> {
        Ok(Self {
            service: required(service, "service name")?,
            name: GraphName::new(required(node_name, "node name")?)?,
        })
    }
}

#[async_trait]
impl NodeMain for AddTwoIntsServerNode {
    fn default_node_name(&self) -> GraphName {
        self.name.clone()
    }

    async fn on_start(&self, node: ConnectedNode) -> Result<()> {
        let log = node.log();
        node.new_service_server::<AddTwoInts, _>(&self.service, move |request: Request| {
            let response = add_two_ints(request)?;
            log.info(&format!(
                "Server: {} + {} = {}",
                request.a, request.b, response.sum
            ));
            Ok(response)
        })
        .await?;
        Ok(())
    }
}

type SumHook = Arc<dyn Fn(GraphResult<i64>) + Send + Sync>;

/// Calls AddTwoInts with (1, 2) once per period and logs the outcome
pub struct AddTwoIntsClientNode {
    service: String,
    name: GraphName,
    period: Duration,
    on_outcome: Option<SumHook>,
}

impl AddTwoIntsClientNode {
    pub fn new(service: &str, node_name: &str) -> GraphResult<Self> {
        Ok(Self {
            service: required(service, "service name")?,
            name: GraphName::new(required(node_name, "node name")?)?,
            period: DEFAULT_PERIOD,
            on_outcome: None,
        })
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Also hand every call outcome to `hook`
    pub fn with_outcome_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(GraphResult<i64>) + Send + Sync + 'static,
    {
        self.on_outcome = Some(Arc::new(hook));
        self
    }
}

#[async_trait]
impl NodeMain for AddTwoIntsClientNode {
    fn default_node_name(&self) -> GraphName {
        self.name.clone()
    }

    async fn on_start(&self, node: ConnectedNode) -> Result<()> {
        let client = node.new_service_client::<AddTwoInts>(&self.service)?;
        let log = node.log();
        let hook = self.on_outcome.clone();

        node.execute_cancellable_loop(self.period, move || {
            let client = client.clone();
            let log = log.clone();
            let hook = hook.clone();
            async move {
                let request = Request { a: 1, b: 2 };
                log.info(&format!("Client: How much is the sum {}+{}?", request.a, request.b));

                let success_log = log.clone();
                let success_hook = hook.clone();
                client.call(
                    request,
                    move |response| {
                        success_log.info(&format!("Client: Thanks, now I know the sum is: {}!", response.sum));
                        if let Some(hook) = &success_hook {
                            hook(Ok(response.sum));
                        }
                    },
                    move |error| {
                        log.error(&format!("Client: call failed: {}", error));
                        if let Some(hook) = &hook {
                            hook(Err(error));
                        }
                    },
                );
                Ok(())
            }
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_two_ints() {
        assert_eq!(add_two_ints(Request { a: 1, b: 2 }).unwrap().sum, 3);
        assert!(add_two_ints(Request { a: i64::MAX, b: 1 }).is_err());
    }

    #[test]
    fn test_blank_names_are_rejected() {
        assert!(AddTwoIntsClientNode::new(" ", "/client").is_err());
        assert!(AddTwoIntsServerNode::new("/sum", "").is_err());
    }
}
