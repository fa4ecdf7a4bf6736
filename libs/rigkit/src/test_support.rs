//! Test utilities: scriptable in-memory module and remote backends.
//!
//! The fake module backend honors the same environment hooks real test
//! modules use (`VIAM_TESTMODULE_FAIL_ON_FIRST`, `VIAM_TESTMODULE_PANIC`), so
//! supervisor scenarios reproduce without spawning child processes. The fake
//! remote network lets tests bring remotes up and down by address.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::builtin::register_builtins;
use crate::config::{Config, ModuleConfig, RemoteConfig, ResourceConfig};
use crate::errors::ResourceError;
use crate::manager::{ManagerOptions, ResourceManager};
use crate::module::{
    FAIL_ON_FIRST_ENV, ModuleBackend, ModuleEvent, ModuleProcess, ModuleSession, PANIC_ON_START_ENV,
    SpawnSpec, SpawnedModule,
};
use crate::name::{Api, Model, ResourceName};
use crate::registry::RegistryBuilder;
use crate::remote::{RemoteDialer, RemoteSession};
use crate::resource::{Dependencies, ReconfigureOutcome};
use crate::worker::spawn_completion_worker;

// ---------------------------------------------------------------------------
// Fake modules
// ---------------------------------------------------------------------------

struct FakeBinary {
    served_models: Vec<Model>,
    disabled: bool,
}

#[derive(Default)]
struct ControlState {
    binaries: BTreeMap<PathBuf, FakeBinary>,
    spawn_counts: BTreeMap<PathBuf, usize>,
    sessions: BTreeMap<String, Weak<FakeModuleSession>>,
}

/// Shared control surface tests use to script module behavior.
#[derive(Default)]
pub struct FakeModuleControl {
    inner: Mutex<ControlState>,
}

impl FakeModuleControl {
    /// Declare a module binary at `path` serving `models`.
    pub fn register_binary(&self, path: &str, models: &[&str]) {
        self.inner.lock().binaries.insert(
            PathBuf::from(path),
            FakeBinary {
                served_models: models.iter().map(|m| m.parse().unwrap()).collect(),
                disabled: false,
            },
        );
    }

    /// Make spawns of `path` fail, as if the binary were renamed away.
    pub fn set_disabled(&self, path: &str, disabled: bool) {
        if let Some(binary) = self.inner.lock().binaries.get_mut(&PathBuf::from(path)) {
            binary.disabled = disabled;
        }
    }

    #[must_use]
    pub fn spawn_count(&self, path: &str) -> usize {
        self.inner
            .lock()
            .spawn_counts
            .get(&PathBuf::from(path))
            .copied()
            .unwrap_or(0)
    }

    /// Kill the live process of the module spawned under `module_name`.
    pub fn kill_module(&self, module_name: &str) {
        let session = self
            .inner
            .lock()
            .sessions
            .get(module_name)
            .and_then(Weak::upgrade);
        if let Some(session) = session {
            session.trigger_kill();
        }
    }
}

/// In-memory [`ModuleBackend`].
pub struct FakeModuleBackend {
    control: Arc<FakeModuleControl>,
}

impl FakeModuleBackend {
    #[must_use]
    pub fn new(control: Arc<FakeModuleControl>) -> Self {
        Self { control }
    }
}

#[async_trait]
impl ModuleBackend for FakeModuleBackend {
    async fn spawn(&self, spec: &SpawnSpec) -> Result<SpawnedModule, ResourceError> {
        let served = {
            let mut state = self.control.inner.lock();
            let Some(binary) = state.binaries.get(&spec.exec_path) else {
                return Err(ResourceError::Transport(format!(
                    "failed to spawn module \"{}\" from {}: no such file or directory",
                    spec.module_name,
                    spec.exec_path.display()
                )));
            };
            if binary.disabled {
                return Err(ResourceError::Transport(format!(
                    "failed to spawn module \"{}\" from {}: no such file or directory",
                    spec.module_name,
                    spec.exec_path.display()
                )));
            }
            let served = binary.served_models.clone();
            *state.spawn_counts.entry(spec.exec_path.clone()).or_insert(0) += 1;
            served
        };

        if spec
            .environment
            .get(PANIC_ON_START_ENV)
            .is_some_and(|v| v == "1")
        {
            return Err(ResourceError::Transport(format!(
                "module \"{}\" exited during startup",
                spec.module_name
            )));
        }
        let fail_on_first = spec
            .environment
            .get(FAIL_ON_FIRST_ENV)
            .is_some_and(|v| v == "1");

        let (kill_tx, kill_rx) = oneshot::channel();
        let session = Arc::new(FakeModuleSession {
            served,
            fail_on_first,
            alive: AtomicBool::new(true),
            kill: Mutex::new(Some(kill_tx)),
            failed_once: Mutex::new(BTreeSet::new()),
            resources: Mutex::new(BTreeMap::new()),
        });
        self.control
            .inner
            .lock()
            .sessions
            .insert(spec.module_name.clone(), Arc::downgrade(&session));

        Ok(SpawnedModule {
            process: Box::new(FakeModuleProcess {
                exited: Some(kill_rx),
                session: Arc::clone(&session),
            }),
            session,
        })
    }
}

struct ServedResource {
    deps: Dependencies,
    reconfigurations: u64,
}

/// Server half of a fake module. Implements the helper-model behaviors the
/// scenario suite relies on: reconfigure counting, dependency echo, and
/// killing its own process on command.
pub struct FakeModuleSession {
    served: Vec<Model>,
    fail_on_first: bool,
    alive: AtomicBool,
    kill: Mutex<Option<oneshot::Sender<()>>>,
    failed_once: Mutex<BTreeSet<String>>,
    resources: Mutex<BTreeMap<String, ServedResource>>,
}

impl FakeModuleSession {
    fn trigger_kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
        if let Some(tx) = self.kill.lock().take() {
            let _ = tx.send(());
        }
    }

    fn check_alive(&self) -> Result<(), ResourceError> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ResourceError::Transport("module process has exited".to_owned()))
        }
    }
}

#[async_trait]
impl ModuleSession for FakeModuleSession {
    fn served_models(&self) -> Vec<Model> {
        self.served.clone()
    }

    async fn validate(&self, config: &ResourceConfig) -> Result<Vec<String>, ResourceError> {
        self.check_alive()?;
        if let Some(msg) = config.attributes.get("validate_error").and_then(|v| v.as_str()) {
            return Err(ResourceError::Validation(msg.to_owned()));
        }
        let implicit = config
            .attributes
            .get("implicit_deps")
            .and_then(|v| v.as_array())
            .map(|deps| {
                deps.iter()
                    .filter_map(|d| d.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default();
        Ok(implicit)
    }

    async fn add_resource(
        &self,
        config: &ResourceConfig,
        deps: &Dependencies,
    ) -> Result<(), ResourceError> {
        self.check_alive()?;
        let key = config.resource_name().to_string();
        if self.fail_on_first && self.failed_once.lock().insert(key.clone()) {
            return Err(ResourceError::Validation(
                "resource failed its first construction".to_owned(),
            ));
        }
        self.resources.lock().insert(
            key,
            ServedResource {
                deps: deps.clone(),
                reconfigurations: 1,
            },
        );
        Ok(())
    }

    async fn reconfigure_resource(
        &self,
        config: &ResourceConfig,
        deps: &Dependencies,
    ) -> Result<ReconfigureOutcome, ResourceError> {
        self.check_alive()?;
        if config
            .attributes
            .get("force_rebuild")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
        {
            return Ok(ReconfigureOutcome::NeedsRebuild);
        }
        let key = config.resource_name().to_string();
        let mut resources = self.resources.lock();
        let Some(served) = resources.get_mut(&key) else {
            return Err(ResourceError::Validation(format!(
                "resource \"{key}\" is not served by this module"
            )));
        };
        served.deps = deps.clone();
        served.reconfigurations += 1;
        Ok(ReconfigureOutcome::Reconfigured)
    }

    async fn remove_resource(&self, name: &ResourceName) -> Result<(), ResourceError> {
        self.resources.lock().remove(&name.to_string());
        Ok(())
    }

    async fn do_command(
        &self,
        name: &ResourceName,
        command: serde_json::Value,
    ) -> Result<serde_json::Value, ResourceError> {
        self.check_alive()?;
        let cmd = command
            .as_str()
            .or_else(|| command.get("command").and_then(serde_json::Value::as_str));
        match cmd {
            Some("kill_module") => {
                self.trigger_kill();
                Ok(serde_json::json!({"killed": true}))
            }
            Some("get_num_reconfigurations") => {
                let resources = self.resources.lock();
                let Some(served) = resources.get(&name.to_string()) else {
                    return Err(ResourceError::NotFound(name.to_string()));
                };
                Ok(serde_json::json!({
                    "num_reconfigurations": served.reconfigurations,
                }))
            }
            Some("echo_dep") => {
                let dep = {
                    let resources = self.resources.lock();
                    let Some(served) = resources.get(&name.to_string()) else {
                        return Err(ResourceError::NotFound(name.to_string()));
                    };
                    served.deps.values().next().cloned()
                };
                let Some(dep) = dep else {
                    return Err(ResourceError::Validation(format!(
                        "resource \"{name}\" has no dependencies to echo through"
                    )));
                };
                dep.do_command(serde_json::json!({"command": "echo"})).await
            }
            _ => Ok(command),
        }
    }

    async fn shutdown(&self) -> Result<(), ResourceError> {
        self.trigger_kill();
        Ok(())
    }
}

struct FakeModuleProcess {
    exited: Option<oneshot::Receiver<()>>,
    session: Arc<FakeModuleSession>,
}

#[async_trait]
impl ModuleProcess for FakeModuleProcess {
    fn pid(&self) -> Option<u32> {
        None
    }

    async fn wait(&mut self) {
        match self.exited.take() {
            Some(rx) => {
                let _ = rx.await;
            }
            None => std::future::pending().await,
        }
    }

    async fn stop(&mut self, _grace: Duration) {
        self.session.alive.store(false, Ordering::SeqCst);
        self.exited = None;
    }
}

// ---------------------------------------------------------------------------
// Fake remotes
// ---------------------------------------------------------------------------

struct FakeRemoteServer {
    up: bool,
    generation: u64,
    names: Vec<ResourceName>,
}

/// Addressable fake remotes; sessions die when their server generation is
/// replaced, the way a restarted robot drops old connections.
#[derive(Default)]
pub struct FakeRemoteNetwork {
    inner: Mutex<BTreeMap<String, FakeRemoteServer>>,
}

impl FakeRemoteNetwork {
    /// Start (or replace) the remote at `address` exposing `names`.
    pub fn start(&self, address: &str, names: Vec<ResourceName>) {
        let mut inner = self.inner.lock();
        let generation = inner.get(address).map_or(1, |s| s.generation + 1);
        inner.insert(
            address.to_owned(),
            FakeRemoteServer {
                up: true,
                generation,
                names,
            },
        );
    }

    /// Stop the remote at `address`; existing sessions start failing.
    pub fn stop(&self, address: &str) {
        if let Some(server) = self.inner.lock().get_mut(address) {
            server.up = false;
        }
    }

    pub fn set_names(&self, address: &str, names: Vec<ResourceName>) {
        if let Some(server) = self.inner.lock().get_mut(address) {
            server.names = names;
        }
    }
}

/// In-memory [`RemoteDialer`].
pub struct FakeRemoteDialer {
    network: Arc<FakeRemoteNetwork>,
}

impl FakeRemoteDialer {
    #[must_use]
    pub fn new(network: Arc<FakeRemoteNetwork>) -> Self {
        Self { network }
    }
}

#[async_trait]
impl RemoteDialer for FakeRemoteDialer {
    async fn dial(&self, config: &RemoteConfig) -> Result<Arc<dyn RemoteSession>, ResourceError> {
        let generation = {
            let inner = self.network.inner.lock();
            match inner.get(&config.address) {
                Some(server) if server.up => server.generation,
                _ => {
                    return Err(ResourceError::Transport(format!(
                        "connection to {} refused",
                        config.address
                    )));
                }
            }
        };
        Ok(Arc::new(FakeRemoteSession {
            network: Arc::clone(&self.network),
            address: config.address.clone(),
            generation,
        }))
    }
}

struct FakeRemoteSession {
    network: Arc<FakeRemoteNetwork>,
    address: String,
    generation: u64,
}

impl FakeRemoteSession {
    fn with_server<T>(
        &self,
        f: impl FnOnce(&FakeRemoteServer) -> T,
    ) -> Result<T, ResourceError> {
        let inner = self.network.inner.lock();
        match inner.get(&self.address) {
            Some(server) if server.up && server.generation == self.generation => Ok(f(server)),
            _ => Err(ResourceError::Transport(format!(
                "connection to {} reset",
                self.address
            ))),
        }
    }
}

#[async_trait]
impl RemoteSession for FakeRemoteSession {
    async fn resource_names(&self) -> Result<Vec<ResourceName>, ResourceError> {
        self.with_server(|server| server.names.clone())
    }

    async fn do_command(
        &self,
        _name: &ResourceName,
        command: serde_json::Value,
    ) -> Result<serde_json::Value, ResourceError> {
        self.with_server(|_| command)
    }

    async fn close(&self) {}
}

// ---------------------------------------------------------------------------
// Fixture and config builders
// ---------------------------------------------------------------------------

/// A manager wired to fake module and remote backends.
pub struct TestFixture {
    pub manager: Arc<ResourceManager>,
    pub modules: Arc<FakeModuleControl>,
    pub network: Arc<FakeRemoteNetwork>,
    pub cancel: CancellationToken,
    events: Option<mpsc::UnboundedReceiver<ModuleEvent>>,
}

impl TestFixture {
    #[must_use]
    pub fn new() -> Self {
        let mut builder = RegistryBuilder::default();
        register_builtins(&mut builder);
        let registry = builder.build().unwrap();

        let control = Arc::new(FakeModuleControl::default());
        let network = Arc::new(FakeRemoteNetwork::default());
        let cancel = CancellationToken::new();
        let (manager, events) = ResourceManager::new(ManagerOptions {
            registry,
            module_backend: Arc::new(FakeModuleBackend::new(Arc::clone(&control))),
            remote_dialer: Arc::new(FakeRemoteDialer::new(Arc::clone(&network))),
            cancel: cancel.clone(),
        });
        Self {
            manager,
            modules: control,
            network,
            cancel,
            events: Some(events),
        }
    }

    /// Start the completion worker; most scenario tests drive the retry pass
    /// directly instead and never call this.
    pub fn start_worker(&mut self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let events = self.events.take().expect("worker already started");
        spawn_completion_worker(
            Arc::clone(&self.manager),
            events,
            interval,
            self.cancel.child_token(),
        )
    }

    /// Short-string names of every committed resource.
    #[must_use]
    pub fn short_names(&self) -> BTreeSet<String> {
        self.manager
            .resource_names()
            .into_iter()
            .map(|n| n.short_string())
            .collect()
    }

    #[must_use]
    pub fn has_resource(&self, short: &str) -> bool {
        self.short_names().contains(short)
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Poll `predicate` until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[must_use]
pub fn component(name: &str, subtype: &str, model: &str, deps: &[&str]) -> ResourceConfig {
    let mut config = ResourceConfig::new(
        name,
        Api::component(subtype),
        model.parse().expect("valid model"),
    );
    config.depends_on = deps.iter().map(|d| (*d).to_owned()).collect();
    config
}

#[must_use]
pub fn service(name: &str, subtype: &str, model: &str, deps: &[&str]) -> ResourceConfig {
    let mut config = ResourceConfig::new(
        name,
        Api::service(subtype),
        model.parse().expect("valid model"),
    );
    config.depends_on = deps.iter().map(|d| (*d).to_owned()).collect();
    config
}

#[must_use]
pub fn module(name: &str, exec_path: &str) -> ModuleConfig {
    ModuleConfig {
        name: name.to_owned(),
        exec_path: PathBuf::from(exec_path),
        environment: BTreeMap::new(),
        local_version: String::new(),
    }
}

#[must_use]
pub fn module_with_env(name: &str, exec_path: &str, env: &[(&str, &str)]) -> ModuleConfig {
    let mut config = module(name, exec_path);
    config.environment = env
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect();
    config
}

#[must_use]
pub fn remote(name: &str, address: &str) -> RemoteConfig {
    RemoteConfig {
        name: name.to_owned(),
        address: address.to_owned(),
        prefix: None,
        auth: None,
    }
}

#[must_use]
pub fn remote_with_prefix(name: &str, address: &str, prefix: &str) -> RemoteConfig {
    RemoteConfig {
        prefix: Some(prefix.to_owned()),
        ..remote(name, address)
    }
}

#[must_use]
pub fn arm_name(name: &str) -> ResourceName {
    ResourceName::new(Api::component("arm"), name)
}

/// Shorthand for assembling a [`Config`].
#[must_use]
pub fn config_of(
    modules: Vec<ModuleConfig>,
    remotes: Vec<RemoteConfig>,
    components: Vec<ResourceConfig>,
    services: Vec<ResourceConfig>,
) -> Config {
    Config {
        modules,
        processes: Vec::new(),
        remotes,
        components,
        services,
    }
}
