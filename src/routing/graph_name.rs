// Graph Names
//
// INTENTION: Hierarchical identifiers for nodes, topics and services
// ("/robot/arm/joint_states"). Names are validated once at construction so
// every other component can treat a GraphName as well-formed.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{GraphError, GraphResult};

/// Separator between name segments
pub const SEPARATOR: char = '/';

/// A validated hierarchical name
///
/// A trailing separator is dropped (`/a/b/` and `/a/b` are the same name) and
/// names starting with `/` are global. Blank names, whitespace and empty
/// interior segments are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GraphName(String);

impl GraphName {
    /// Parse and canonicalize a name
    pub fn new(name: impl Into<String>) -> GraphResult<Self> {
        let raw: String = name.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(GraphError::Configuration(
                "graph name must not be blank".to_string(),
            ));
        }
        if trimmed.chars().any(char::is_whitespace) {
            return Err(GraphError::Configuration(format!(
                "graph name '{}' contains whitespace",
                trimmed
            )));
        }

        let canonical = if trimmed.len() > 1 {
            trimmed.trim_end_matches(SEPARATOR)
        } else {
            trimmed
        };
        if canonical.is_empty() {
            // "///" collapses to the root
            return Ok(Self(SEPARATOR.to_string()));
        }

        let body = canonical.strip_prefix(SEPARATOR).unwrap_or(canonical);
        if !body.is_empty() && body.split(SEPARATOR).any(str::is_empty) {
            return Err(GraphError::Configuration(format!(
                "graph name '{}' has an empty segment",
                trimmed
            )));
        }

        Ok(Self(canonical.to_string()))
    }

    /// The root name `/`
    pub fn root() -> Self {
        Self(SEPARATOR.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.len() == 1 && self.0.starts_with(SEPARATOR)
    }

    pub fn is_global(&self) -> bool {
        self.0.starts_with(SEPARATOR)
    }

    /// Resolve against the root, turning `a/b` into `/a/b`
    pub fn to_global(&self) -> Self {
        if self.is_global() {
            self.clone()
        } else {
            Self(format!("{}{}", SEPARATOR, self.0))
        }
    }

    /// Append a relative name; joining a global name replaces this one
    pub fn join(&self, other: &GraphName) -> Self {
        if other.is_global() {
            return other.clone();
        }
        if self.is_root() {
            return Self(format!("{}{}", SEPARATOR, other.0));
        }
        Self(format!("{}{}{}", self.0, SEPARATOR, other.0))
    }

    /// The last segment
    pub fn basename(&self) -> &str {
        if self.is_root() {
            return "";
        }
        self.0.rsplit(SEPARATOR).next().unwrap_or(&self.0)
    }

    /// Everything before the last segment, `None` for single-segment names
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind(SEPARATOR) {
            Some(0) => Some(Self::root()),
            Some(idx) => Some(Self(self.0[..idx].to_string())),
            None => None,
        }
    }

    /// Segments without separators
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split(SEPARATOR).filter(|s| !s.is_empty())
    }
}

impl fmt::Display for GraphName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for GraphName {
    type Error = GraphError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        GraphName::new(value)
    }
}

impl TryFrom<&str> for GraphName {
    type Error = GraphError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        GraphName::new(value)
    }
}

impl From<GraphName> for String {
    fn from(name: GraphName) -> Self {
        name.0
    }
}

impl AsRef<str> for GraphName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
