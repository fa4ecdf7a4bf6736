//! The module supervisor.
//!
//! Owns the lifecycle of out-of-process model providers and acts as the
//! backend for every graph node whose model is served by a module rather than
//! a builtin. Each running module gets a dedicated monitor task that observes
//! the child process; an unexpected exit marks the module crashed and drives
//! a restart loop with bounded exponential backoff. The engine and the
//! completion worker learn about crashes and recoveries over an event
//! channel, never by polling.

mod backend;
pub mod process;

pub use backend::{ModuleBackend, ModuleProcess, ModuleSession, SpawnSpec, SpawnedModule};

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{ModuleConfig, ResourceConfig};
use crate::errors::ResourceError;
use crate::name::{Model, ResourceName};
use crate::resource::{Dependencies, ReconfigureOutcome, Resource};

/// Test hook: a module resource fails its first construction.
pub const FAIL_ON_FIRST_ENV: &str = "VIAM_TESTMODULE_FAIL_ON_FIRST";
/// Test hook: the module exits immediately at startup.
pub const PANIC_ON_START_ENV: &str = "VIAM_TESTMODULE_PANIC";

const RESTART_BACKOFF_MIN: Duration = Duration::from_millis(100);
const RESTART_BACKOFF_MAX: Duration = Duration::from_secs(5);
/// Delay between the two start attempts a module gets before `Failed`.
const START_RETRY_DELAY: Duration = Duration::from_millis(100);
const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Module run states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleRunState {
    NotStarted,
    Starting,
    Running,
    /// Died at runtime; a restart loop is working on it.
    Crashed,
    /// Could not start; only a config change clears this.
    Failed,
}

/// Events published to the completion worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleEvent {
    Crashed { module: String },
    Restarted { module: String },
    StartFailed { module: String },
}

/// Outcome of [`ModuleSupervisor::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Started,
    Unchanged,
    Restarted,
    Failed,
}

struct ModuleRecord {
    config: ModuleConfig,
    run_state: ModuleRunState,
    pid: Option<u32>,
    session: Option<Arc<dyn ModuleSession>>,
    served_models: Vec<Model>,
    /// Shared with the monitor task so renames are observed there too.
    name_cell: Arc<Mutex<String>>,
    cancel: CancellationToken,
}

impl ModuleRecord {
    fn new(config: ModuleConfig, parent_cancel: &CancellationToken) -> Self {
        let name_cell = Arc::new(Mutex::new(config.name.clone()));
        Self {
            config,
            run_state: ModuleRunState::NotStarted,
            pid: None,
            session: None,
            served_models: Vec::new(),
            name_cell,
            cancel: parent_cancel.child_token(),
        }
    }
}

pub(crate) struct SupervisorShared {
    modules: Mutex<BTreeMap<String, ModuleRecord>>,
    /// resource name → module currently serving it
    serving: DashMap<ResourceName, String>,
}

impl SupervisorShared {
    fn set_state(&self, module: &str, state: ModuleRunState) {
        if let Some(rec) = self.modules.lock().get_mut(module) {
            rec.run_state = state;
        }
    }

    fn adopt_session(&self, module: &str, session: Arc<dyn ModuleSession>, pid: Option<u32>) {
        if let Some(rec) = self.modules.lock().get_mut(module) {
            rec.served_models = session.served_models();
            rec.session = Some(session);
            rec.pid = pid;
            rec.run_state = ModuleRunState::Running;
        }
    }

    fn running_session(&self, module: &str) -> Result<Arc<dyn ModuleSession>, ResourceError> {
        let modules = self.modules.lock();
        let Some(rec) = modules.get(module) else {
            return Err(ResourceError::Transport(format!(
                "module \"{module}\" is not configured"
            )));
        };
        match (&rec.run_state, &rec.session) {
            (ModuleRunState::Running, Some(session)) => Ok(Arc::clone(session)),
            _ => Err(ResourceError::Transport(format!(
                "module \"{module}\" is not running"
            ))),
        }
    }

    fn serving_module(&self, name: &ResourceName) -> Result<String, ResourceError> {
        self.serving
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ResourceError::NotFound(name.to_string()))
    }
}

pub struct ModuleSupervisor {
    backend: Arc<dyn ModuleBackend>,
    shared: Arc<SupervisorShared>,
    events: mpsc::UnboundedSender<ModuleEvent>,
    cancel: CancellationToken,
}

impl ModuleSupervisor {
    /// Returns the supervisor and the receiving half of its event channel,
    /// which the completion worker consumes.
    #[must_use]
    pub fn new(
        backend: Arc<dyn ModuleBackend>,
        cancel: CancellationToken,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ModuleEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let supervisor = Arc::new(Self {
            backend,
            shared: Arc::new(SupervisorShared {
                modules: Mutex::new(BTreeMap::new()),
                serving: DashMap::new(),
            }),
            events,
            cancel,
        });
        (supervisor, events_rx)
    }

    /// Start a module if absent; restart it if its binary config changed;
    /// leave it alone otherwise. Renames are handled by [`Self::rename`].
    ///
    /// # Errors
    /// Infrastructure failures only; a module that cannot start is reported
    /// through `UpsertOutcome::Failed`, not an error.
    pub async fn upsert(&self, config: &ModuleConfig) -> Result<UpsertOutcome, ResourceError> {
        let action = {
            let mut modules = self.shared.modules.lock();
            match modules.get_mut(&config.name) {
                None => {
                    modules.insert(
                        config.name.clone(),
                        ModuleRecord::new(config.clone(), &self.cancel),
                    );
                    UpsertOutcome::Started
                }
                Some(rec) if rec.config.same_binary(config) => {
                    return Ok(UpsertOutcome::Unchanged);
                }
                Some(rec) => {
                    // Binary config changed: stop the old child, start fresh.
                    rec.cancel.cancel();
                    *rec = ModuleRecord::new(config.clone(), &self.cancel);
                    UpsertOutcome::Restarted
                }
            }
        };

        match self.start_module(&config.name).await {
            Ok(()) => Ok(action),
            Err(_) => Ok(UpsertOutcome::Failed),
        }
    }

    /// Rename a module. A running module keeps its process and session; a
    /// module stuck in `Failed` gets a fresh start under its new name, since
    /// a name change is a config change and config changes clear `Failed`.
    /// Crashed modules are left to their own restart loop.
    pub async fn rename(&self, old: &str, new: &str) {
        let was_failed = {
            let mut modules = self.shared.modules.lock();
            let Some(mut rec) = modules.remove(old) else {
                return;
            };
            tracing::info!(module = %old, renamed_to = %new, "renaming module without restart");
            rec.config.name = new.to_owned();
            *rec.name_cell.lock() = new.to_owned();
            let was_failed = rec.run_state == ModuleRunState::Failed;
            modules.insert(new.to_owned(), rec);
            was_failed
        };
        for mut entry in self.shared.serving.iter_mut() {
            if entry.value() == old {
                *entry.value_mut() = new.to_owned();
            }
        }
        if was_failed {
            tracing::info!(module = %new, "renamed module had failed to start; retrying under its new name");
            let _ = self.start_module(new).await;
        }
    }

    /// Gracefully stop and drop a module.
    pub async fn remove(&self, module: &str) {
        let rec = self.shared.modules.lock().remove(module);
        let Some(rec) = rec else {
            return;
        };
        tracing::info!(module = %module, "removing module");
        // Cancel first so the monitor treats the coming exit as intentional;
        // its stop path reaps the child after the graceful request below.
        rec.cancel.cancel();
        if let Some(session) = &rec.session {
            let _ = session.shutdown().await;
        }
        self.shared.serving.retain(|_, m| m.as_str() != module);
    }

    /// Explicit user-initiated restart. The caller is responsible for marking
    /// the module's resources for reconfiguration.
    ///
    /// # Errors
    /// Returns `Transport` when the module is unknown or the fresh start
    /// fails.
    pub async fn restart(&self, module: &str) -> Result<(), ResourceError> {
        {
            let mut modules = self.shared.modules.lock();
            let Some(rec) = modules.get_mut(module) else {
                return Err(ResourceError::NotFound(module.to_owned()));
            };
            rec.cancel.cancel();
            let config = rec.config.clone();
            *rec = ModuleRecord::new(config, &self.cancel);
        }
        self.start_module(module).await
    }

    /// Two start attempts, then `Failed`.
    async fn start_module(&self, module: &str) -> Result<(), ResourceError> {
        let spec = {
            let mut modules = self.shared.modules.lock();
            let Some(rec) = modules.get_mut(module) else {
                return Err(ResourceError::NotFound(module.to_owned()));
            };
            rec.run_state = ModuleRunState::Starting;
            SpawnSpec {
                module_name: rec.config.name.clone(),
                exec_path: rec.config.exec_path.clone(),
                environment: rec.config.environment.clone(),
            }
        };

        let mut last_err = None;
        for attempt in 0..2 {
            if attempt > 0 {
                tokio::time::sleep(START_RETRY_DELAY).await;
            }
            match self.backend.spawn(&spec).await {
                Ok(spawned) => {
                    self.finish_start(module, spawned);
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(module = %module, attempt, error = %e, "module start attempt failed");
                    last_err = Some(e);
                }
            }
        }

        let err = last_err.unwrap_or_else(|| {
            ResourceError::Transport(format!("module \"{module}\" failed to start"))
        });
        tracing::error!(module = %module, error = %err, "module failed to start; giving up until its config changes");
        self.shared.set_state(module, ModuleRunState::Failed);
        let _ = self.events.send(ModuleEvent::StartFailed {
            module: module.to_owned(),
        });
        Err(err)
    }

    fn finish_start(&self, module: &str, spawned: SpawnedModule) {
        let SpawnedModule { process, session } = spawned;
        let pid = process.pid();
        let (name_cell, cancel, spec) = {
            let mut modules = self.shared.modules.lock();
            let Some(rec) = modules.get_mut(module) else {
                return;
            };
            rec.served_models = session.served_models();
            rec.session = Some(Arc::clone(&session));
            rec.pid = pid;
            rec.run_state = ModuleRunState::Running;
            (
                Arc::clone(&rec.name_cell),
                rec.cancel.clone(),
                SpawnSpec {
                    module_name: rec.config.name.clone(),
                    exec_path: rec.config.exec_path.clone(),
                    environment: rec.config.environment.clone(),
                },
            )
        };
        tracing::info!(module = %module, pid = ?pid, "module running");

        let shared = Arc::clone(&self.shared);
        let backend = Arc::clone(&self.backend);
        let events = self.events.clone();
        tokio::spawn(monitor_module(
            shared, backend, events, name_cell, spec, process, cancel,
        ));
    }

    /// The module responsible for a model, if any: handshake-declared models
    /// first, then module-name-matches-namespace for modules that never came
    /// up (so their resources still attribute to them).
    #[must_use]
    pub fn provider_for(&self, model: &Model) -> Option<String> {
        let modules = self.shared.modules.lock();
        for (name, rec) in modules.iter() {
            if rec.served_models.contains(model) {
                return Some(name.clone());
            }
        }
        modules
            .keys()
            .find(|name| **name == model.namespace)
            .cloned()
    }

    #[must_use]
    pub fn is_running(&self, module: &str) -> bool {
        self.shared
            .modules
            .lock()
            .get(module)
            .is_some_and(|r| r.run_state == ModuleRunState::Running)
    }

    #[must_use]
    pub fn module_state(&self, module: &str) -> Option<ModuleRunState> {
        self.shared.modules.lock().get(module).map(|r| r.run_state)
    }

    #[must_use]
    pub fn module_pid(&self, module: &str) -> Option<u32> {
        self.shared.modules.lock().get(module).and_then(|r| r.pid)
    }

    /// Modules currently crashed or failed, sorted lexicographically.
    #[must_use]
    pub fn failed_modules(&self) -> Vec<String> {
        self.shared
            .modules
            .lock()
            .iter()
            .filter(|(_, rec)| {
                matches!(
                    rec.run_state,
                    ModuleRunState::Crashed | ModuleRunState::Failed
                )
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// First phase of construction: the module may report implicit deps.
    ///
    /// # Errors
    /// `Transport` when the serving module is not running, otherwise whatever
    /// the module reports.
    pub async fn validate(&self, config: &ResourceConfig) -> Result<Vec<String>, ResourceError> {
        let session = self.session_for_model(&config.model)?;
        session.validate(config).await
    }

    /// Second phase: construct the resource inside the module and hand back
    /// a routing handle for it.
    ///
    /// # Errors
    /// As [`Self::validate`].
    pub async fn construct(
        &self,
        config: &ResourceConfig,
        deps: &Dependencies,
    ) -> Result<Arc<dyn Resource>, ResourceError> {
        let module = self
            .provider_for(&config.model)
            .ok_or_else(|| ResourceError::Validation(format!(
                "no module serves model \"{}\"",
                config.model
            )))?;
        let session = self.shared.running_session(&module)?;
        session.add_resource(config, deps).await?;
        let name = config.resource_name();
        self.shared.serving.insert(name.clone(), module);
        Ok(Arc::new(ModuleResourceHandle {
            name,
            shared: Arc::downgrade(&self.shared),
        }))
    }

    /// In-place reconfigure of a module-served resource.
    ///
    /// # Errors
    /// As [`Self::validate`].
    pub async fn reconfigure_resource(
        &self,
        config: &ResourceConfig,
        deps: &Dependencies,
    ) -> Result<ReconfigureOutcome, ResourceError> {
        let name = config.resource_name();
        let module = self.shared.serving_module(&name)?;
        let session = self.shared.running_session(&module)?;
        session.reconfigure_resource(config, deps).await
    }

    /// Tear down a module-served resource. Best-effort on the wire.
    pub async fn remove_resource(&self, name: &ResourceName) {
        let Some((_, module)) = self.shared.serving.remove(name) else {
            return;
        };
        if let Ok(session) = self.shared.running_session(&module) {
            if let Err(e) = session.remove_resource(name).await {
                tracing::warn!(resource = %name, module = %module, error = %e, "failed to remove resource from module");
            }
        }
    }

    /// Resource names a module currently serves, sorted.
    #[must_use]
    pub fn resources_served_by(&self, module: &str) -> Vec<ResourceName> {
        let mut names: Vec<ResourceName> = self
            .shared
            .serving
            .iter()
            .filter(|entry| entry.value() == module)
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Resubmit a restarted module's resources, in dependency order supplied
    /// by the caller. Emits the recovery log line only on full success.
    ///
    /// # Errors
    /// Stops at the first resource the module rejects; the caller leaves the
    /// rest to the retry pass.
    pub async fn resubmit_resources(
        &self,
        module: &str,
        ordered: &[(ResourceConfig, Dependencies)],
    ) -> Result<(), ResourceError> {
        let session = self.shared.running_session(module)?;
        for (config, deps) in ordered {
            session.add_resource(config, deps).await?;
            self.shared
                .serving
                .insert(config.resource_name(), module.to_owned());
        }
        tracing::info!(module = %module, "Module resources successfully re-added after module restart");
        Ok(())
    }

    /// Stop every module. Used on runtime shutdown.
    pub async fn shutdown_all(&self) {
        let records: Vec<(Option<Arc<dyn ModuleSession>>, CancellationToken)> = {
            let mut modules = self.shared.modules.lock();
            let drained: Vec<ModuleRecord> = std::mem::take(&mut *modules).into_values().collect();
            drained
                .into_iter()
                .map(|rec| (rec.session, rec.cancel))
                .collect()
        };
        for (_, cancel) in &records {
            cancel.cancel();
        }
        let stops = records
            .iter()
            .filter_map(|(session, _)| session.as_ref())
            .map(|session| session.shutdown());
        let _ = futures::future::join_all(stops).await;
        self.shared.serving.clear();
    }

    fn session_for_model(&self, model: &Model) -> Result<Arc<dyn ModuleSession>, ResourceError> {
        let module = self.provider_for(model).ok_or_else(|| {
            ResourceError::Validation(format!("no module serves model \"{model}\""))
        })?;
        self.shared.running_session(&module)
    }
}

/// Per-module monitor: observes the child, restarts it after crashes.
async fn monitor_module(
    shared: Arc<SupervisorShared>,
    backend: Arc<dyn ModuleBackend>,
    events: mpsc::UnboundedSender<ModuleEvent>,
    name_cell: Arc<Mutex<String>>,
    spec: SpawnSpec,
    mut process: Box<dyn ModuleProcess>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                process.stop(GRACEFUL_STOP_TIMEOUT).await;
                return;
            }
            () = process.wait() => {}
        }

        let name = name_cell.lock().clone();
        tracing::warn!(module = %name, "Module has unexpectedly exited.");
        shared.set_state(&name, ModuleRunState::Crashed);
        let _ = events.send(ModuleEvent::Crashed {
            module: name.clone(),
        });

        let mut backoff = RESTART_BACKOFF_MIN;
        let spawned = loop {
            let jitter = Duration::from_millis(rand::rng().random_range(0..50));
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(backoff + jitter) => {}
            }
            let name = name_cell.lock().clone();
            let attempt_spec = SpawnSpec {
                module_name: name.clone(),
                ..spec.clone()
            };
            match backend.spawn(&attempt_spec).await {
                Ok(spawned) => break spawned,
                Err(e) => {
                    tracing::error!(module = %name, error = %e, "Error while restarting crashed module");
                    backoff = (backoff * 2).min(RESTART_BACKOFF_MAX);
                }
            }
        };

        let name = name_cell.lock().clone();
        let SpawnedModule {
            process: new_process,
            session,
        } = spawned;
        shared.adopt_session(&name, session, new_process.pid());
        process = new_process;
        tracing::info!(module = %name, "module restarted after crash");
        let _ = events.send(ModuleEvent::Restarted { module: name });
    }
}

/// Graph handle for a module-served resource. Routes every call through the
/// supervisor's current session, so it survives module restarts and renames.
struct ModuleResourceHandle {
    name: ResourceName,
    shared: Weak<SupervisorShared>,
}

impl ModuleResourceHandle {
    fn session(&self) -> Result<Arc<dyn ModuleSession>, ResourceError> {
        let shared = self.shared.upgrade().ok_or_else(|| {
            ResourceError::Transport("module supervisor has shut down".to_owned())
        })?;
        let module = shared.serving_module(&self.name)?;
        shared.running_session(&module)
    }
}

#[async_trait]
impl Resource for ModuleResourceHandle {
    async fn reconfigure(
        &self,
        config: &ResourceConfig,
        deps: &Dependencies,
    ) -> Result<ReconfigureOutcome, ResourceError> {
        let session = self.session()?;
        session.reconfigure_resource(config, deps).await
    }

    async fn do_command(
        &self,
        command: serde_json::Value,
    ) -> Result<serde_json::Value, ResourceError> {
        let session = self.session()?;
        session.do_command(&self.name, command).await
    }

    async fn close(&self) -> Result<(), ResourceError> {
        let Some(shared) = self.shared.upgrade() else {
            return Ok(());
        };
        let Some((_, module)) = shared.serving.remove(&self.name) else {
            return Ok(());
        };
        if let Ok(session) = shared.running_session(&module) {
            let _ = session.remove_resource(&self.name).await;
        }
        Ok(())
    }
}
