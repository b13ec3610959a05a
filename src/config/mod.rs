// Configuration Module
//
// Node, master and logging configuration.

pub mod logging_config;
pub mod node_config;

pub use logging_config::{LogLevel, LoggingConfig};
pub use node_config::{
    EnvConfig, MasterConfig, MasterUri, NodeConfiguration, RetryPolicy, DEFAULT_MASTER_PORT, HOST_IP_ENV,
    MASTER_URI_ENV,
};
