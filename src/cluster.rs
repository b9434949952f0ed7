//! Local test cluster collaborator.
//!
//! The harness never builds or supervises a cluster itself. It drives one
//! through [`ClusterControl`] around fault-tolerance scenarios: start it
//! with a settings overlay, connect to the returned base URL, kill a node
//! mid-run, stop it afterwards.
//!
//! Settings overlays use the `section.key=value` syntax, comma separated:
//!
//! ```text
//! replicator.max_jobs=15,replicator.interval=1000
//! ```

use crate::error::{HarnessError, Result};
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by [`ClusterControl`] operations.
pub type ClusterFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// One ini-style setting applied to every node before start.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClusterSetting {
    pub section: String,
    pub key: String,
    pub value: String,
}

impl ClusterSetting {
    pub fn new(section: impl Into<String>, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            section: section.into(),
            key: key.into(),
            value: value.into(),
        }
    }

    /// Parse `section.key=value`. The section ends at the first `.`, the
    /// value starts after the last `=`.
    pub fn parse(entry: &str) -> Result<Self> {
        let entry = entry.trim();
        let malformed = || HarnessError::Config(format!("invalid cluster setting '{}'", entry));
        let (section, rest) = entry.split_once('.').ok_or_else(malformed)?;
        let (key, value) = rest.rsplit_once('=').ok_or_else(malformed)?;
        let (section, key) = (section.trim(), key.trim());
        if section.is_empty() || key.is_empty() {
            return Err(malformed());
        }
        Ok(Self::new(section, key, value.trim()))
    }

    /// Parse a comma separated list. Blank input yields no settings.
    pub fn parse_list(list: &str) -> Result<Vec<Self>> {
        if list.trim().is_empty() {
            return Ok(Vec::new());
        }
        list.split(',').map(Self::parse).collect()
    }

    /// Union of two overlays, sorted, duplicates removed.
    pub fn merge(base: &[ClusterSetting], overrides: &[ClusterSetting]) -> Vec<ClusterSetting> {
        base.iter()
            .chain(overrides)
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

impl fmt::Display for ClusterSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}={}", self.section, self.key, self.value)
    }
}

/// Lifecycle of a locally managed cluster.
pub trait ClusterControl: Send + Sync {
    /// Start (restarting if needed) with `settings` applied. Returns the
    /// base URL of the first node, credentials included.
    fn start<'a>(&'a self, settings: &'a [ClusterSetting]) -> ClusterFuture<'a, String>;

    fn stop(&self) -> ClusterFuture<'_, ()>;

    /// Kill one node (1-based) without stopping the rest.
    fn kill_node(&self, node: u32) -> ClusterFuture<'_, ()>;

    fn is_alive(&self) -> ClusterFuture<'_, bool>;
}
