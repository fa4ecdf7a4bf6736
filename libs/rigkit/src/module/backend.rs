//! Seams between the supervisor and the outside world.
//!
//! The supervisor never touches `tokio::process` or sockets directly; it
//! drives these traits. Production uses [`super::process::ProcessModuleBackend`];
//! tests swap in an in-memory backend so module crashes, slow starts, and bad
//! exec paths can be scripted deterministically.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ResourceConfig;
use crate::errors::ResourceError;
use crate::name::{Model, ResourceName};
use crate::resource::{Dependencies, ReconfigureOutcome};

/// Everything needed to launch one module child.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub module_name: String,
    pub exec_path: PathBuf,
    pub environment: BTreeMap<String, String>,
}

/// A freshly spawned module: the child process and its handshaked session.
pub struct SpawnedModule {
    pub process: Box<dyn ModuleProcess>,
    pub session: Arc<dyn ModuleSession>,
}

#[async_trait]
pub trait ModuleBackend: Send + Sync {
    /// Launch the module and complete the `Ready` handshake.
    ///
    /// # Errors
    /// Returns `ResourceError::Transport` when the child cannot be spawned or
    /// exits before the handshake completes.
    async fn spawn(&self, spec: &SpawnSpec) -> Result<SpawnedModule, ResourceError>;
}

#[async_trait]
pub trait ModuleProcess: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// Resolves when the child exits, however it exits.
    async fn wait(&mut self);

    /// Give the child `grace` to finish on its own, then force-kill it.
    async fn stop(&mut self, grace: Duration);
}

/// The request/reply session with a running module.
///
/// Implementations keep a single-writer discipline over the underlying
/// connection; the supervisor issues one request at a time per module.
#[async_trait]
pub trait ModuleSession: Send + Sync {
    /// Models the module declared in its handshake.
    fn served_models(&self) -> Vec<Model>;

    /// # Errors
    /// `Validation` for module-reported rejections, `Transport` for session
    /// failures. On success returns implicit dependency names.
    async fn validate(&self, config: &ResourceConfig) -> Result<Vec<String>, ResourceError>;

    /// # Errors
    /// As [`ModuleSession::validate`].
    async fn add_resource(
        &self,
        config: &ResourceConfig,
        deps: &Dependencies,
    ) -> Result<(), ResourceError>;

    /// # Errors
    /// As [`ModuleSession::validate`].
    async fn reconfigure_resource(
        &self,
        config: &ResourceConfig,
        deps: &Dependencies,
    ) -> Result<ReconfigureOutcome, ResourceError>;

    /// # Errors
    /// As [`ModuleSession::validate`].
    async fn remove_resource(&self, name: &ResourceName) -> Result<(), ResourceError>;

    /// # Errors
    /// As [`ModuleSession::validate`].
    async fn do_command(
        &self,
        name: &ResourceName,
        command: serde_json::Value,
    ) -> Result<serde_json::Value, ResourceError>;

    /// Ask the module to exit. Best-effort.
    ///
    /// # Errors
    /// `Transport` when the session is already gone.
    async fn shutdown(&self) -> Result<(), ResourceError>;
}
