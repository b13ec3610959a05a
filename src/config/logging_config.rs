// Logging Configuration
//
// Per-component log levels applied to the env_logger backend.

use std::collections::HashMap;

use clap::ValueEnum;

use crate::util::logging::{formatted_builder, Component};

/// Log levels matching the `log` crate
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
    Off,
}

impl LogLevel {
    pub fn to_level_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
            LogLevel::Off => log::LevelFilter::Off,
        }
    }
}

/// Logging configuration options
#[derive(Clone, Debug)]
pub struct LoggingConfig {
    /// Default log level for all components
    pub default_level: LogLevel,
    /// Levels for individual modules of this crate
    pub component_levels: HashMap<Component, LogLevel>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl LoggingConfig {
    /// Info level everywhere
    pub fn new() -> Self {
        Self {
            default_level: LogLevel::Info,
            component_levels: HashMap::new(),
        }
    }

    pub fn with_default_level(mut self, level: LogLevel) -> Self {
        self.default_level = level;
        self
    }

    pub fn with_component_level(mut self, component: Component, level: LogLevel) -> Self {
        self.component_levels.insert(component, level);
        self
    }

    /// Install the configured logger.
    ///
    /// If a global logger is already installed this silently does nothing, so
    /// tests can call it repeatedly.
    pub fn apply(&self) {
        let mut builder = formatted_builder();
        builder.filter_level(self.default_level.to_level_filter());

        for (component, level) in &self.component_levels {
            builder.filter(Some(component.target()), level.to_level_filter());
        }

        let _ = builder.try_init();
    }
}
