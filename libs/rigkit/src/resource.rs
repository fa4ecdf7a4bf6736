//! The runtime handle every materialized resource exposes to the engine.
//!
//! The engine only ever needs three capabilities from a concrete resource:
//! apply a new config in place, forward an operator command, and close. The
//! concrete behavior (arms moving, cameras streaming) lives behind this trait
//! in builtins, module-backed clients, and remote mirrors alike.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::ResourceConfig;
use crate::errors::ResourceError;
use crate::name::ResourceName;

/// Resolved dependency handles passed to constructors and `reconfigure`,
/// keyed by fully qualified name. Ordered so construction is deterministic.
pub type Dependencies = BTreeMap<ResourceName, Arc<dyn Resource>>;

/// Outcome of an in-place reconfigure attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconfigureOutcome {
    /// The handle absorbed the new config.
    Reconfigured,
    /// The handle cannot absorb the change; the engine must close it and
    /// construct a replacement.
    NeedsRebuild,
}

#[async_trait]
pub trait Resource: Send + Sync {
    /// Apply a new config in place.
    ///
    /// The default declares the resource non-reconfigurable, which makes the
    /// engine rebuild it on any config change.
    ///
    /// # Errors
    /// Implementations return `ResourceError` when the new config cannot be
    /// applied; the node is marked erred and retried by the worker.
    async fn reconfigure(
        &self,
        config: &ResourceConfig,
        deps: &Dependencies,
    ) -> Result<ReconfigureOutcome, ResourceError> {
        let _ = (config, deps);
        Ok(ReconfigureOutcome::NeedsRebuild)
    }

    /// Forward an operator command and return its reply.
    ///
    /// # Errors
    /// Returns `ResourceError::Transport` when the backing module or remote
    /// session is down.
    async fn do_command(
        &self,
        command: serde_json::Value,
    ) -> Result<serde_json::Value, ResourceError>;

    /// Release everything the resource owns. Idempotent.
    ///
    /// # Errors
    /// Teardown errors are logged and never abort a commit.
    async fn close(&self) -> Result<(), ResourceError> {
        Ok(())
    }
}

/// Placeholder handle for a node whose constructor failed.
///
/// Lookups by name still succeed for erred nodes; operations on them return
/// the stored construction error.
pub(crate) struct ErredResource {
    name: ResourceName,
    error: ResourceError,
}

impl ErredResource {
    pub(crate) fn new(name: ResourceName, error: ResourceError) -> Arc<dyn Resource> {
        Arc::new(Self { name, error })
    }
}

#[async_trait]
impl Resource for ErredResource {
    async fn do_command(
        &self,
        _command: serde_json::Value,
    ) -> Result<serde_json::Value, ResourceError> {
        tracing::debug!(resource = %self.name, error = %self.error, "command sent to erred resource");
        Err(self.error.clone())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::name::Api;

    #[tokio::test]
    async fn erred_resource_replays_its_error() {
        let name = ResourceName::new(Api::component("arm"), "arm1");
        let err = ResourceError::DependencyNotReady {
            dependent: "arm1".to_owned(),
            dependency: "base1".to_owned(),
        };
        let handle = ErredResource::new(name, err.clone());
        let got = handle.do_command(serde_json::json!({})).await.unwrap_err();
        assert_eq!(got, err);
    }
}
