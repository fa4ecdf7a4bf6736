//! The resource manager facade.
//!
//! Owns the graph, the module supervisor, the remote mirror, and the process
//! manager, and serializes every engine pass behind one async mutex. Readers
//! never touch that mutex: the last committed graph is published through an
//! `ArcSwap` snapshot, so lookups see exactly the state of the most recent
//! commit and nothing in between.

use arc_swap::ArcSwap;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::errors::ResourceError;
use crate::graph::{Graph, NodeState, Provenance};
use crate::module::{ModuleBackend, ModuleEvent, ModuleSupervisor};
use crate::name::ResourceName;
use crate::process::ProcessManager;
use crate::reconfigure::{EngineCtx, EngineState, apply_config, retry_pass};
use crate::registry::ConstructorRegistry;
use crate::remote::{RemoteDialer, RemoteMirror};
use crate::resource::{Dependencies, ErredResource, Resource};

/// Everything needed to assemble a manager.
pub struct ManagerOptions {
    pub registry: ConstructorRegistry,
    pub module_backend: Arc<dyn ModuleBackend>,
    pub remote_dialer: Arc<dyn RemoteDialer>,
    pub cancel: CancellationToken,
}

/// Operator-facing view of one node.
#[derive(Debug, Clone)]
pub struct ResourceStatus {
    pub name: ResourceName,
    pub state: NodeState,
    pub last_error: Option<ResourceError>,
    pub last_reconfigured_at: u64,
    pub provenance: Provenance,
}

pub struct ResourceManager {
    registry: ConstructorRegistry,
    modules: Arc<ModuleSupervisor>,
    remotes: Arc<RemoteMirror>,
    processes: Arc<ProcessManager>,
    engine: tokio::sync::Mutex<EngineState>,
    committed: ArcSwap<Graph>,
    clock: AtomicU64,
    cancel: CancellationToken,
}

impl ResourceManager {
    /// Assemble a manager. The returned receiver carries module lifecycle
    /// events; hand it to [`crate::worker::spawn_completion_worker`].
    #[must_use]
    pub fn new(opts: ManagerOptions) -> (Arc<Self>, mpsc::UnboundedReceiver<ModuleEvent>) {
        let (modules, events_rx) = ModuleSupervisor::new(opts.module_backend, opts.cancel.clone());
        let manager = Arc::new(Self {
            registry: opts.registry,
            modules,
            remotes: Arc::new(RemoteMirror::new(opts.remote_dialer)),
            processes: Arc::new(ProcessManager::new(opts.cancel.clone())),
            engine: tokio::sync::Mutex::new(EngineState::new()),
            committed: ArcSwap::from_pointee(Graph::new()),
            clock: AtomicU64::new(0),
            cancel: opts.cancel,
        });
        (manager, events_rx)
    }

    fn ctx(&self) -> EngineCtx<'_> {
        EngineCtx {
            registry: &self.registry,
            modules: &self.modules,
            remotes: &self.remotes,
            processes: &self.processes,
            clock: &self.clock,
            cancel: &self.cancel,
        }
    }

    /// Apply a new configuration under the commit-or-rollback discipline.
    ///
    /// # Errors
    /// Fatal plan errors (`Cycle`, `Cancelled`) after rollback; per-node
    /// failures are visible through [`Self::resource_statuses`] instead.
    pub async fn reconfigure(&self, config: Config) -> Result<(), ResourceError> {
        let mut st = self.engine.lock().await;
        let result = apply_config(&self.ctx(), &mut st, config).await;
        self.committed.store(Arc::new(st.graph.clone()));
        result
    }

    /// One recovery tick: update remote mirrors and retry every erred or
    /// dirty node once. Returns whether anything changed, so callers know to
    /// run again immediately.
    pub async fn update_remotes_and_retry_resource_configure(&self) -> bool {
        let mut st = self.engine.lock().await;
        let changed = retry_pass(&self.ctx(), &mut st).await;
        if changed {
            self.committed.store(Arc::new(st.graph.clone()));
        }
        changed
    }

    /// Look up a resource by short or fully qualified name against the last
    /// committed graph. Lookups on erred nodes succeed; their operations
    /// replay the stored error.
    ///
    /// # Errors
    /// `NotFound`, or `Ambiguous` for a short name matching several nodes.
    pub fn resource(&self, name: &str) -> Result<Arc<dyn Resource>, ResourceError> {
        let graph = self.committed.load();
        let resolved = resolve_lookup(&graph, name)?;
        node_handle(&graph, &resolved)
    }

    /// Exact-name variant of [`Self::resource`].
    ///
    /// # Errors
    /// `NotFound` when no such node is committed.
    pub fn resource_by_name(
        &self,
        name: &ResourceName,
    ) -> Result<Arc<dyn Resource>, ResourceError> {
        let graph = self.committed.load();
        node_handle(&graph, name)
    }

    /// All committed resource names, sorted; remote sentinels excluded.
    #[must_use]
    pub fn resource_names(&self) -> Vec<ResourceName> {
        self.committed
            .load()
            .names()
            .into_iter()
            .filter(|n| n.api.kind != "remote")
            .collect()
    }

    /// Operator status report, sorted by name.
    #[must_use]
    pub fn resource_statuses(&self) -> Vec<ResourceStatus> {
        let graph = self.committed.load();
        graph
            .names()
            .into_iter()
            .filter(|n| n.api.kind != "remote")
            .filter_map(|name| {
                graph.node(&name).map(|node| ResourceStatus {
                    name: name.clone(),
                    state: node.state,
                    last_error: node.last_error.clone(),
                    last_reconfigured_at: node.last_reconfigured_at,
                    provenance: node.provenance.clone(),
                })
            })
            .collect()
    }

    /// Direct dependencies of a committed node, sorted.
    #[must_use]
    pub fn dependencies_of(&self, name: &ResourceName) -> Vec<ResourceName> {
        self.committed.load().parents_of(name)
    }

    /// Direct dependents of a committed node, sorted.
    #[must_use]
    pub fn dependents_of(&self, name: &ResourceName) -> Vec<ResourceName> {
        self.committed.load().children_of(name)
    }

    /// Modules currently crashed or failed, sorted lexicographically.
    #[must_use]
    pub fn failed_modules(&self) -> Vec<String> {
        self.modules.failed_modules()
    }

    #[must_use]
    pub fn modules(&self) -> &ModuleSupervisor {
        &self.modules
    }

    #[must_use]
    pub fn remotes(&self) -> &RemoteMirror {
        &self.remotes
    }

    #[must_use]
    pub fn processes(&self) -> &ProcessManager {
        &self.processes
    }

    /// User-initiated module restart; the module's resources stay in the
    /// graph marked for reconfiguration and are rebuilt by the next retry
    /// pass.
    ///
    /// # Errors
    /// `NotFound` for an unknown module, `Transport` when the fresh start
    /// fails.
    pub async fn restart_module(&self, module: &str) -> Result<(), ResourceError> {
        let mut st = self.engine.lock().await;
        let result = self.modules.restart(module).await;
        for name in st.graph.names() {
            let is_module_node = st
                .graph
                .node(&name)
                .is_some_and(|n| n.provenance == Provenance::Module(module.to_owned()));
            if is_module_node {
                st.graph.mark_dirty(&name);
                if let Some(node) = st.graph.node_mut(&name) {
                    // The fresh process has none of the old session's state;
                    // dropping the handle forces reconstruction.
                    node.state = NodeState::NeedsReconfigure;
                    node.handle = None;
                }
            }
        }
        self.committed.store(Arc::new(st.graph.clone()));
        result
    }

    /// Re-add a restarted module's resources, in dependency order. Driven by
    /// the completion worker on `ModuleEvent::Restarted`.
    pub async fn handle_module_restarted(&self, module: &str) {
        let mut st = self.engine.lock().await;
        let mut ordered = Vec::new();
        for name in st.graph.reverse_topological_sort() {
            let Some(node) = st.graph.node(&name) else {
                continue;
            };
            if node.provenance != Provenance::Module(module.to_owned()) {
                continue;
            }
            let Some(config) = node.config.clone() else {
                continue;
            };
            let mut deps = Dependencies::new();
            for dep in st.graph.parents_of(&name) {
                if let Some(handle) = st.graph.node(&dep).and_then(|n| n.handle.clone()) {
                    deps.insert(dep, handle);
                }
            }
            ordered.push((config, deps));
        }
        if ordered.is_empty() {
            return;
        }
        if let Err(e) = self.modules.resubmit_resources(module, &ordered).await {
            tracing::warn!(
                module = %module,
                error = %e,
                "failed to re-add module resources after restart; leaving them to the retry pass"
            );
            for (config, _) in &ordered {
                if let Some(node) = st.graph.node_mut(&config.resource_name()) {
                    node.mark_erred(e.clone());
                }
            }
        }
        self.committed.store(Arc::new(st.graph.clone()));
    }

    /// Tear the whole runtime down: resources in dependents-first order, then
    /// modules, remotes, and processes.
    pub async fn close(&self) {
        let mut st = self.engine.lock().await;
        for name in st.graph.topological_sort() {
            let handle = st.graph.node(&name).and_then(|n| n.handle.clone());
            if let Some(handle) = handle
                && let Err(e) = handle.close().await
            {
                tracing::warn!(resource = %name, error = %e, "error closing resource during shutdown");
            }
        }
        st.graph = Graph::new();
        st.desired.clear();
        self.modules.shutdown_all().await;
        self.remotes.close_all().await;
        self.processes.shutdown_all();
        self.committed.store(Arc::new(Graph::new()));
        tracing::info!("resource manager closed");
    }
}

fn resolve_lookup(graph: &Graph, name: &str) -> Result<ResourceName, ResourceError> {
    if name.contains('/') {
        return name.parse();
    }
    let mut matches: Vec<ResourceName> = graph
        .names()
        .into_iter()
        .filter(|n| n.api.kind != "remote" && n.matches_dependency(name))
        .collect();
    let locals: Vec<&ResourceName> = matches.iter().filter(|n| n.is_local()).collect();
    match locals.len() {
        1 => Ok(locals[0].clone()),
        0 => match matches.len() {
            0 => Err(ResourceError::NotFound(name.to_owned())),
            1 => Ok(matches.remove(0)),
            _ => Err(ResourceError::Ambiguous {
                dependent: "lookup".to_owned(),
                dependency: name.to_owned(),
            }),
        },
        _ => Err(ResourceError::Ambiguous {
            dependent: "lookup".to_owned(),
            dependency: name.to_owned(),
        }),
    }
}

fn node_handle(graph: &Graph, name: &ResourceName) -> Result<Arc<dyn Resource>, ResourceError> {
    let node = graph
        .node(name)
        .ok_or_else(|| ResourceError::NotFound(name.to_string()))?;
    match &node.handle {
        Some(handle) => Ok(Arc::clone(handle)),
        None => {
            let error = node
                .last_error
                .clone()
                .unwrap_or_else(|| ResourceError::NotFound(name.to_string()));
            Ok(ErredResource::new(name.clone(), error))
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::graph::NodeState;
    use crate::test_support::{TestFixture, component, config_of, module};

    #[tokio::test]
    async fn short_name_lookup_is_ambiguous_across_apis() {
        let fx = TestFixture::new();
        let config = config_of(
            vec![],
            vec![],
            vec![
                component("thing", "arm", "fake", &[]),
                component("thing", "base", "fake", &[]),
            ],
            vec![],
        );
        fx.manager.reconfigure(config).await.unwrap();

        assert!(matches!(
            fx.manager.resource("thing"),
            Err(ResourceError::Ambiguous { .. })
        ));
        // Fully qualified lookups still disambiguate.
        assert!(fx.manager.resource("rig:component:arm/thing").is_ok());
    }

    #[tokio::test]
    async fn lookup_of_erred_node_succeeds_and_replays_error() {
        let fx = TestFixture::new();
        // No module registered: the node errs at build but stays looked up.
        let config = config_of(
            vec![module("acme", "/nonexistent/acme")],
            vec![],
            vec![component("gizmo1", "generic", "acme:gizmo", &[])],
            vec![],
        );
        fx.manager.reconfigure(config).await.unwrap();

        let handle = fx.manager.resource("gizmo1").unwrap();
        let err = handle.do_command(serde_json::json!("echo")).await.unwrap_err();
        assert!(err.to_string().contains("rpc error"), "got: {err}");
    }

    #[tokio::test]
    async fn close_tears_down_everything() {
        let fx = TestFixture::new();
        fx.modules.register_binary("/opt/testmod1", &["acme:gizmo"]);
        let config = config_of(
            vec![module("acme", "/opt/testmod1")],
            vec![],
            vec![
                component("base1", "base", "fake", &[]),
                component("gizmo1", "generic", "acme:gizmo", &["base1"]),
            ],
            vec![],
        );
        fx.manager.reconfigure(config).await.unwrap();
        assert_eq!(fx.manager.resource_names().len(), 2);

        fx.manager.close().await;
        assert!(fx.manager.resource_names().is_empty());
        assert_eq!(fx.manager.modules().module_state("acme"), None);
        assert!(matches!(
            fx.manager.resource("base1"),
            Err(ResourceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn statuses_report_provenance_and_clock() {
        let fx = TestFixture::new();
        let config = config_of(
            vec![],
            vec![],
            vec![component("base1", "base", "fake", &[])],
            vec![crate::test_support::service("collector", "datasync", "collector", &[])],
        );
        fx.manager.reconfigure(config).await.unwrap();

        let statuses = fx.manager.resource_statuses();
        assert_eq!(statuses.len(), 2);
        for status in &statuses {
            assert_eq!(status.state, NodeState::Ready);
            assert!(status.last_reconfigured_at > 0);
        }
        let collector = statuses
            .iter()
            .find(|s| s.name.name == "collector")
            .unwrap();
        assert_eq!(collector.provenance, Provenance::BuiltinService);
        let base = statuses.iter().find(|s| s.name.name == "base1").unwrap();
        assert_eq!(base.provenance, Provenance::Local);
    }
}
