// Logging
//
// INTENTION: Give every component a logger tagged with the owning node and the
// component kind, on top of the `log` facade. The core only ever talks to the
// `LogSink` trait so applications can inject their own backend.

use std::fmt;
use std::sync::Arc;

use log::{debug, error, info, warn};

/// Component kinds used to tag log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    Master,
    Node,
    Topic,
    Service,
    Network,
    Executor,
    Loop,
    Custom(&'static str),
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Master => "Master",
            Component::Node => "Node",
            Component::Topic => "Topic",
            Component::Service => "Service",
            Component::Network => "Network",
            Component::Executor => "Executor",
            Component::Loop => "Loop",
            Component::Custom(name) => *name,
        }
    }

    /// Log target the component's records are emitted under
    pub fn target(&self) -> &'static str {
        match self {
            Component::Master => "runar_graph::registry",
            Component::Node | Component::Executor => "runar_graph::node",
            Component::Topic => "runar_graph::topic",
            Component::Service => "runar_graph::service",
            Component::Network => "runar_graph::network",
            Component::Loop => "runar_graph::util::cancellable_loop",
            Component::Custom(name) => *name,
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logging interface injected into nodes
///
/// Only `info` and `error` are required; the other severities fall back to
/// them.
pub trait LogSink: Send + Sync {
    fn info(&self, message: &str);

    fn error(&self, message: &str);

    fn warn(&self, message: &str) {
        self.error(message);
    }

    fn debug(&self, message: &str) {
        self.info(message);
    }
}

/// Component-tagged logger writing through the `log` crate
#[derive(Clone)]
pub struct Logger {
    component: Component,
    node_id: Arc<str>,
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("component", &self.component)
            .field("node_id", &self.node_id)
            .finish()
    }
}

impl Logger {
    /// Create a root logger for a node (or the master)
    pub fn new_root(component: Component, node_id: &str) -> Self {
        Self {
            component,
            node_id: Arc::from(node_id),
        }
    }

    /// Derive a logger for another component of the same node
    pub fn with_component(&self, component: Component) -> Self {
        Self {
            component,
            node_id: self.node_id.clone(),
        }
    }

    pub fn component(&self) -> Component {
        self.component
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn debug(&self, message: impl Into<String>) {
        debug!(target: self.component.target(), "[{}][{}] {}", self.node_id, self.component, message.into());
    }

    pub fn info(&self, message: impl Into<String>) {
        info!(target: self.component.target(), "[{}][{}] {}", self.node_id, self.component, message.into());
    }

    pub fn warn(&self, message: impl Into<String>) {
        warn!(target: self.component.target(), "[{}][{}] {}", self.node_id, self.component, message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        error!(target: self.component.target(), "[{}][{}] {}", self.node_id, self.component, message.into());
    }
}

impl LogSink for Logger {
    fn info(&self, message: &str) {
        Logger::info(self, message);
    }

    fn error(&self, message: &str) {
        Logger::error(self, message);
    }

    fn warn(&self, message: &str) {
        Logger::warn(self, message);
    }

    fn debug(&self, message: &str) {
        Logger::debug(self, message);
    }
}

/// env_logger builder with the crate's line format
pub(crate) fn formatted_builder() -> env_logger::Builder {
    let mut builder = env_logger::Builder::new();
    apply_format(&mut builder);
    builder
}

fn builder_with_format(env: env_logger::Env<'_>) -> env_logger::Builder {
    let mut builder = env_logger::Builder::from_env(env);
    apply_format(&mut builder);
    builder
}

fn apply_format(builder: &mut env_logger::Builder) {
    builder.format(|buf, record| {
        use std::io::Write;
        let level_style = buf.default_level_style(record.level());
        writeln!(
            buf,
            "{} {} [{}] {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            level_style.value(record.level()),
            record.target(),
            record.args()
        )
    });
}

/// Initialize logging for the binary, honouring `RUST_LOG` (default `info`)
pub fn init_logging() {
    let env = env_logger::Env::default().filter_or("RUST_LOG", "info");
    let _ = builder_with_format(env).try_init();
}

/// Filter used by tests, overridable with `RUNAR_TEST_LOG`
pub fn get_test_filter() -> String {
    std::env::var("RUNAR_TEST_LOG").unwrap_or_else(|_| "debug".to_string())
}

/// Configure logging for tests; safe to call from every test
pub fn configure_test_logging() {
    let env = env_logger::Env::default().filter_or("RUST_LOG", get_test_filter());
    let mut builder = builder_with_format(env);
    builder.is_test(true);
    let _ = builder.try_init();
}
