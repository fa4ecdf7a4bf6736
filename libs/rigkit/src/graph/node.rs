//! Graph vertices.

use std::sync::Arc;

use crate::config::ResourceConfig;
use crate::errors::ResourceError;
use crate::name::ResourceName;
use crate::resource::Resource;

/// Lifecycle state of a graph node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Unconfigured,
    Configuring,
    Ready,
    NeedsReconfigure,
    Erred,
    Removing,
}

/// Where a node came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provenance {
    Local,
    Remote(String),
    Module(String),
    BuiltinService,
}

/// A graph vertex: identity, state, last-applied config, the live handle when
/// ready, and the last error when erred.
#[derive(Clone)]
pub struct Node {
    pub name: ResourceName,
    pub provenance: Provenance,
    pub state: NodeState,
    pub config: Option<ResourceConfig>,
    pub handle: Option<Arc<dyn Resource>>,
    pub last_error: Option<ResourceError>,
    pub last_reconfigured_at: u64,
}

impl Node {
    #[must_use]
    pub fn new(name: ResourceName, provenance: Provenance) -> Self {
        Self {
            name,
            provenance,
            state: NodeState::Unconfigured,
            config: None,
            handle: None,
            last_error: None,
            last_reconfigured_at: 0,
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: ResourceConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn mark_ready(&mut self, handle: Arc<dyn Resource>, at: u64) {
        self.state = NodeState::Ready;
        self.handle = Some(handle);
        self.last_error = None;
        self.last_reconfigured_at = at;
    }

    pub fn mark_erred(&mut self, error: ResourceError) {
        self.state = NodeState::Erred;
        self.last_error = Some(error);
    }

    /// Whether a build pass should touch this node.
    #[must_use]
    pub fn needs_work(&self) -> bool {
        matches!(
            self.state,
            NodeState::Unconfigured | NodeState::NeedsReconfigure | NodeState::Erred
        )
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state == NodeState::Ready
    }

    #[must_use]
    pub fn is_mirror(&self) -> bool {
        matches!(self.provenance, Provenance::Remote(_))
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("provenance", &self.provenance)
            .field("state", &self.state)
            .field("has_handle", &self.handle.is_some())
            .field("last_error", &self.last_error)
            .field("last_reconfigured_at", &self.last_reconfigured_at)
            .finish_non_exhaustive()
    }
}
