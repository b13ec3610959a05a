// Root module for the runar-graph crate
//
// INTENTION: A small distributed node graph. A master keeps the registry of
// who publishes, subscribes and serves what; nodes connect to each other
// directly for topic messages and service calls.

//! # Runar Graph
//!
//! Nodes implement [`NodeMain`] and are run by a [`NodeMainExecutor`]. Once a
//! node is connected it can create publishers, subscribers, service servers,
//! service clients and cancellable work loops through its [`ConnectedNode`].
//! Every endpoint is announced to the [`Master`], which is the only shared
//! state in the graph.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use runar_graph::{GraphName, Master, MasterConfig, MasterUri, NodeConfiguration, NodeMainExecutor};
//! use runar_graph::demo::{ListenerNode, TalkerNode};
//! use std::time::Duration;
//! use anyhow::Result;
//!
//! async fn example() -> Result<()> {
//!     let master = Master::new(MasterConfig::new_public(11311));
//!     master.start().await?;
//!     master.await_ready(Duration::from_secs(2)).await;
//!
//!     let config = NodeConfiguration::new_public("127.0.0.1")
//!         .with_master_uri(MasterUri::new("127.0.0.1", 11311))
//!         .with_node_name(GraphName::new("/talker")?);
//!
//!     let executor = NodeMainExecutor::new();
//!     executor.execute(TalkerNode::new("/chatter", "/talker")?, config.clone()).await?;
//!     executor
//!         .execute(
//!             ListenerNode::new("/chatter", "/listener")?,
//!             config.with_node_name(GraphName::new("/listener")?),
//!         )
//!         .await?;
//!
//!     tokio::time::sleep(Duration::from_secs(5)).await;
//!     executor.shutdown().await;
//!     master.shutdown().await;
//!     Ok(())
//! }
//! ```

// Public modules
pub mod cli;
pub mod config;
pub mod demo;
pub mod error;
pub mod msgs;
pub mod network;
pub mod node;
pub mod registry;
pub mod routing;
pub mod service;
pub mod topic;
pub mod util;

pub use error::{GraphError, GraphResult};
pub use routing::GraphName;

pub use config::{MasterConfig, MasterUri, NodeConfiguration, RetryPolicy};
pub use msgs::{Message, ServiceDefinition};

pub use registry::{Master, RegistryApi, RegistryClient};

pub use node::{ConnectedNode, NodeMain, NodeMainExecutor, NodeState};
pub use service::{ServiceClient, ServiceServer};
pub use topic::{Publisher, Subscriber};

pub use util::{CancellableLoop, LogSink, Logger};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
