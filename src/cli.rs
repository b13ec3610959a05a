// Command Line
//
// INTENTION: The orchestration entry point. `local` starts its own master and
// a talker/listener pair; `external` runs all four demo nodes against a master
// named in the environment. Both run for a bounded time, stop the nodes in
// reverse dependency order and report failure as an error.

use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};

use crate::config::{EnvConfig, LogLevel, LoggingConfig, MasterConfig, MasterUri, NodeConfiguration, DEFAULT_MASTER_PORT};
use crate::demo::{names, AddTwoIntsClientNode, AddTwoIntsServerNode, ListenerNode, TalkerNode};
use crate::node::NodeMainExecutor;
use crate::registry::Master;
use crate::routing::GraphName;
use crate::util::logging::init_logging;

/// How long the local master may take to come up
pub const MASTER_READY_TIMEOUT: Duration = Duration::from_millis(2_000);

/// Pause between starting the service server and its client
const SERVER_HEAD_START: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Log level for every component; `RUST_LOG` applies when absent
    #[arg(long, global = true, value_enum)]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a master in-process and run a publisher and a subscriber against it
    Local {
        /// Port the master listens on
        #[arg(long, default_value_t = DEFAULT_MASTER_PORT)]
        port: u16,

        /// Address the nodes bind and advertise
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// How long to run before shutting down
        #[arg(long, default_value_t = 30)]
        duration_secs: u64,
    },
    /// Run all demo nodes against the master in RUNAR_MASTER_URI
    External {
        /// How long to run before shutting down
        #[arg(long, default_value_t = 30)]
        duration_secs: u64,
    },
}

impl Args {
    /// Install the logger this invocation asks for
    pub fn init_logging(&self) {
        match self.log_level {
            Some(level) => LoggingConfig::new().with_default_level(level).apply(),
            None => init_logging(),
        }
    }
}

pub async fn run(args: Args) -> Result<()> {
    match args.command {
        Commands::Local {
            port,
            host,
            duration_secs,
        } => run_local(port, &host, Duration::from_secs(duration_secs)).await,
        Commands::External { duration_secs } => run_external(Duration::from_secs(duration_secs)).await,
    }
}

/// Sleep for `duration`, returning early on Ctrl-C
async fn run_for(duration: Duration) {
    info!("Running for {:?} (Ctrl-C to stop early)", duration);
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = tokio::signal::ctrl_c() => info!("Interrupted, shutting down"),
    }
}

pub async fn run_local(port: u16, host: &str, duration: Duration) -> Result<()> {
    let master = Master::new(MasterConfig::new_public(port));
    let result = run_local_nodes(&master, host, duration).await;
    // the master goes down last, whatever happened to the nodes
    master.shutdown().await;
    result
}

async fn run_local_nodes(master: &Master, host: &str, duration: Duration) -> Result<()> {
    master.start().await?;
    if !master.await_ready(MASTER_READY_TIMEOUT).await {
        return Err(anyhow!("master did not become ready within {:?}", MASTER_READY_TIMEOUT));
    }
    let port = master
        .local_addr()
        .map(|addr| addr.port())
        .ok_or_else(|| anyhow!("master has no local address"))?;
    let master_uri = MasterUri::new("127.0.0.1", port);

    let config = |name: &str| -> Result<NodeConfiguration> {
        Ok(NodeConfiguration::new_public(host)
            .with_master_uri(master_uri.clone())
            .with_node_name(GraphName::new(name)?))
    };

    let executor = NodeMainExecutor::new();
    let (talker, listener) = tokio::join!(
        executor.execute(TalkerNode::new(names::TOPIC, names::TALKER)?, config(names::TALKER)?),
        executor.execute(ListenerNode::new(names::TOPIC, names::LISTENER)?, config(names::LISTENER)?),
    );
    let started = talker.and_then(|talker| listener.map(|listener| (talker, listener)));

    match started {
        Ok((talker, listener)) => {
            run_for(duration).await;
            executor.shutdown_node_main(&listener).await;
            executor.shutdown_node_main(&talker).await;
            executor.shutdown().await;
            Ok(())
        }
        Err(e) => {
            executor.shutdown().await;
            Err(e)
        }
    }
}

pub async fn run_external(duration: Duration) -> Result<()> {
    let env = EnvConfig::from_env()?;
    info!("Using master at {} from host {}", env.master_uri, env.host);
    let config = |name: &str| -> Result<NodeConfiguration> { Ok(env.node_configuration(GraphName::new(name)?)) };

    let executor = NodeMainExecutor::new();
    let result = run_external_nodes(&executor, &config, duration).await;
    executor.shutdown().await;
    result
}

async fn run_external_nodes<F>(executor: &NodeMainExecutor, config: &F, duration: Duration) -> Result<()>
where
    F: Fn(&str) -> Result<NodeConfiguration>,
{
    let server = executor
        .execute(AddTwoIntsServerNode::new(names::SERVICE, names::SERVER)?, config(names::SERVER)?)
        .await?;
    tokio::time::sleep(SERVER_HEAD_START).await;

    let (client, talker, listener) = tokio::join!(
        executor.execute(AddTwoIntsClientNode::new(names::SERVICE, names::CLIENT)?, config(names::CLIENT)?),
        executor.execute(TalkerNode::new(names::TOPIC, names::TALKER)?, config(names::TALKER)?),
        executor.execute(ListenerNode::new(names::TOPIC, names::LISTENER)?, config(names::LISTENER)?),
    );
    let client = client?;
    let talker = talker?;
    let listener = listener?;

    run_for(duration).await;

    for name in [&client, &listener, &talker, &server] {
        if !executor.shutdown_node_main(name).await {
            warn!("Node {} was not running", name);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_defaults() {
        let args = Args::try_parse_from(["runar-graph", "local"]).unwrap();
        assert!(args.log_level.is_none());
        match args.command {
            Commands::Local {
                port,
                host,
                duration_secs,
            } => {
                assert_eq!(port, DEFAULT_MASTER_PORT);
                assert_eq!(host, "127.0.0.1");
                assert_eq!(duration_secs, 30);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_external_with_log_level() {
        let args =
            Args::try_parse_from(["runar-graph", "external", "--duration-secs", "5", "--log-level", "debug"]).unwrap();
        assert_eq!(args.log_level, Some(LogLevel::Debug));
        assert!(matches!(args.command, Commands::External { duration_secs: 5 }));
    }

    #[tokio::test]
    async fn test_local_run_fails_when_port_is_taken() {
        let holder = tokio::net::TcpListener::bind("0.0.0.0:0").await.unwrap();
        let port = holder.local_addr().unwrap().port();
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            run_local(port, "127.0.0.1", Duration::from_millis(10)),
        )
        .await
        .unwrap();
        assert!(result.is_err());
    }
}
