// Topic Demo Nodes
//
// A talker that publishes the elapsed time once per period and a listener that
// logs whatever it hears.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;

use crate::error::{GraphError, GraphResult};
use crate::msgs::StdString;
use crate::node::{ConnectedNode, NodeMain};
use crate::routing::GraphName;

const DEFAULT_PERIOD: Duration = Duration::from_secs(1);

fn required(value: &str, what: &str) -> GraphResult<String> {
    if value.trim().is_empty() {
        return Err(GraphError::Configuration(format!("{} must not be blank", what)));
    }
    Ok(value.trim().to_string())
}

/// Publishes `"<elapsed> milliseconds"` on a topic
pub struct TalkerNode {
    topic: String,
    name: GraphName,
    period: Duration,
}

impl TalkerNode {
    pub fn new(topic: &str, node_name: &str) -> GraphResult<Self> {
        Ok(Self {
            topic: required(topic, "topic name")?,
            name: GraphName::new(required(node_name, "node name")?)?,
            period: DEFAULT_PERIOD,
        })
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }
}

#[async_trait]
impl NodeMain for TalkerNode {
    fn default_node_name(&self) -> GraphName {
        self.name.clone()
    }

    async fn on_start(&self, node: ConnectedNode) -> Result<()> {
        let publisher = node.new_publisher::<StdString>(&self.topic).await?;
        let log = node.log();
        let started = Instant::now();

        node.execute_cancellable_loop(self.period, move || {
            let publisher = publisher.clone();
            let log = log.clone();
            async move {
                let message = StdString::new(format!("{} milliseconds", started.elapsed().as_millis()));
                publisher.publish(&message)?;
                log.info(&format!("Publisher - Published: [{}]", message.data));
                Ok(())
            }
        })?;
        Ok(())
    }
}

type MessageHook = Arc<dyn Fn(&StdString) + Send + Sync>;

/// Logs every message received on a topic
pub struct ListenerNode {
    topic: String,
    name: GraphName,
    on_message: Option<MessageHook>,
}

impl ListenerNode {
    pub fn new(topic: &str, node_name: &str) -> GraphResult<Self> {
        Ok(Self {
            topic: required(topic, "topic name")?,
            name: GraphName::new(required(node_name, "node name")?)?,
            on_message: None,
        })
    }

    /// Also hand every received message to `hook`
    pub fn with_message_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&StdString) + Send + Sync + 'static,
    {
        self.on_message = Some(Arc::new(hook));
        self
    }
}

#[async_trait]
impl NodeMain for ListenerNode {
    fn default_node_name(&self) -> GraphName {
        self.name.clone()
    }

    async fn on_start(&self, node: ConnectedNode) -> Result<()> {
        let subscriber = node.new_subscriber::<StdString>(&self.topic).await?;
        let log = node.log();
        let hook = self.on_message.clone();

        subscriber.add_message_listener(move |message: StdString| {
            log.info(&format!("Subscriber - I heard: \"{}\"", message.data));
            if let Some(hook) = &hook {
                hook(&message);
            }
        });
        Ok(())
    }
}
