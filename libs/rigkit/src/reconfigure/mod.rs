//! The reconfiguration engine.
//!
//! [`apply_config`] turns a configuration change into a commit plan: diff,
//! best-effort teardown of removed entries, module/process/remote upserts, a
//! build pass over a cloned draft graph, a weak-dependency pass, and an
//! atomic swap. A fatal error during the build (cycle, cancellation) closes
//! everything the draft constructed and leaves the old graph in place.
//!
//! [`retry_pass`] is the non-configuration-changing recovery loop: it polls
//! remotes, folds mirror changes in, and re-attempts every node stuck in
//! error, exactly once per call.

mod diff;

pub use diff::ConfigDiff;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio_util::sync::CancellationToken;

use crate::config::{Config, ResourceConfig};
use crate::errors::ResourceError;
use crate::graph::{Graph, GraphError, Node, NodeState, Provenance, ShortNameMatch};
use crate::module::{ModuleSupervisor, UpsertOutcome};
use crate::name::ResourceName;
use crate::process::ProcessManager;
use crate::registry::ConstructorRegistry;
use crate::remote::{RemoteMirror, RemoteSnapshot, remote_sentinel_name};
use crate::resource::{Dependencies, ReconfigureOutcome, Resource};

/// Engine-side state guarded by the manager's engine mutex.
pub(crate) struct EngineState {
    pub graph: Graph,
    pub config: Config,
    pub desired: BTreeMap<ResourceName, ResourceConfig>,
    /// Duplicate-name collisions already reported; pruned when a collision
    /// disappears from the submitted config so a reintroduction logs anew.
    pub logged_config_collisions: BTreeSet<String>,
    /// Mirror collisions reported in the last reconcile; replaced each pass
    /// with the collisions still active.
    pub logged_mirror_collisions: BTreeSet<String>,
}

impl EngineState {
    pub(crate) fn new() -> Self {
        Self {
            graph: Graph::new(),
            config: Config::default(),
            desired: BTreeMap::new(),
            logged_config_collisions: BTreeSet::new(),
            logged_mirror_collisions: BTreeSet::new(),
        }
    }
}

/// Shared runtime collaborators the engine drives.
pub(crate) struct EngineCtx<'a> {
    pub registry: &'a ConstructorRegistry,
    pub modules: &'a ModuleSupervisor,
    pub remotes: &'a RemoteMirror,
    pub processes: &'a ProcessManager,
    pub clock: &'a AtomicU64,
    pub cancel: &'a CancellationToken,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum BuildMode {
    /// Cycles and cancellation abort the whole plan.
    Commit,
    /// Failures stick to the node; the pass never aborts.
    Retry,
}

enum BuildResult {
    Ready {
        newly_constructed: Option<Arc<dyn Resource>>,
    },
    Erred,
    /// The node could not even resolve its dependencies and was dropped from
    /// the graph; the desired set still carries it for later retries.
    Removed,
}

/// Apply a new configuration. See the module docs for the phase order.
///
/// # Errors
/// Fatal plan errors only (`Cycle`, `Cancelled`); per-node failures are
/// recorded on the nodes and left to the completion worker.
pub(crate) async fn apply_config(
    ctx: &EngineCtx<'_>,
    st: &mut EngineState,
    new_config: Config,
) -> Result<(), ResourceError> {
    if ctx.cancel.is_cancelled() {
        return Err(ResourceError::Cancelled);
    }

    let diff = ConfigDiff::new(&st.config, &new_config);
    st.logged_config_collisions
        .retain(|short| diff.resource_collisions.contains(short));
    for short in &diff.resource_collisions {
        if st.logged_config_collisions.insert(short.clone()) {
            tracing::warn!(resource = %short, "collision");
        }
    }

    let has_pending = st
        .graph
        .names()
        .iter()
        .any(|n| st.graph.node(n).is_some_and(Node::needs_work));
    if diff.is_empty() && !has_pending {
        tracing::debug!("configuration unchanged; nothing to do");
        st.config = new_config;
        return Ok(());
    }

    tracing::info!("reconfiguring with {diff}");

    let (desired, _) = new_config.deduped_resources();
    let mut draft = st.graph.clone();

    remove_phase(ctx, &mut draft, &diff).await;
    upsert_modules_and_processes(ctx, &mut draft, &diff).await?;

    for remote in diff
        .remotes_added
        .iter()
        .chain(diff.remotes_modified.iter())
    {
        ctx.remotes.upsert(remote);
    }
    for remote in &diff.remotes_modified {
        // Prefix or address changes invalidate the old mirrors; the sync
        // below re-adds them under the new config.
        remove_mirrors_of(&mut draft, &remote.name).await;
    }
    let snapshots = ctx.remotes.sync().await;
    apply_mirror_snapshots(&mut draft, &snapshots, &desired, &mut st.logged_mirror_collisions)
        .await;

    upsert_desired_nodes(ctx, &mut draft, &diff, &desired);

    let mut constructed: Vec<(ResourceName, Arc<dyn Resource>)> = Vec::new();
    let mut touched: BTreeSet<ResourceName> = BTreeSet::new();
    if let Err(fatal) =
        build_pass(ctx, &mut draft, BuildMode::Commit, &mut constructed, &mut touched).await
    {
        tracing::error!(error = %fatal, "rolling back draft changes due to error");
        for (name, handle) in constructed.iter().rev() {
            if let Err(e) = handle.close().await {
                tracing::warn!(resource = %name, error = %e, "failed to close handle during rollback");
            }
        }
        return Err(fatal);
    }

    weak_pass(ctx, &mut draft, &touched).await;

    tracing::info!("committing draft changes");
    st.graph = draft;
    st.config = new_config;
    st.desired = desired;
    Ok(())
}

/// One recovery tick. Returns whether anything observable changed.
pub(crate) async fn retry_pass(ctx: &EngineCtx<'_>, st: &mut EngineState) -> bool {
    let before = fingerprint(&st.graph);

    let snapshots = ctx.remotes.sync().await;
    apply_mirror_snapshots(
        &mut st.graph,
        &snapshots,
        &st.desired,
        &mut st.logged_mirror_collisions,
    )
    .await;

    for (name, cfg) in &st.desired {
        if !st.graph.contains(name) {
            st.graph
                .add_node(Node::new(name.clone(), initial_provenance(ctx, cfg)).with_config(cfg.clone()));
        }
    }
    seed_dependency_edges(&mut st.graph);

    let mut constructed = Vec::new();
    let mut touched = BTreeSet::new();
    let _ = build_pass(ctx, &mut st.graph, BuildMode::Retry, &mut constructed, &mut touched).await;

    fingerprint(&st.graph) != before
}

fn fingerprint(graph: &Graph) -> Vec<(ResourceName, NodeState, u64)> {
    graph
        .names()
        .into_iter()
        .filter_map(|n| {
            graph
                .node(&n)
                .map(|node| (n.clone(), node.state, node.last_reconfigured_at))
        })
        .collect()
}

async fn remove_phase(ctx: &EngineCtx<'_>, draft: &mut Graph, diff: &ConfigDiff) {
    // Removed resources, dependents marked dirty so survivors re-evaluate.
    let removed_set: BTreeSet<&ResourceName> = diff.removed.iter().collect();
    for name in draft.topological_sort() {
        if removed_set.contains(&name) {
            draft.mark_dirty(&name);
            close_and_remove(ctx, draft, &name).await;
        }
    }

    for remote in &diff.remotes_removed {
        let sentinel = remote_sentinel_name(remote);
        let removed = draft.remove_subtree(&sentinel);
        for node in removed {
            close_node(&node).await;
        }
        ctx.remotes.remove(remote).await;
    }

    for module in &diff.modules_removed {
        let doomed: Vec<ResourceName> = draft
            .names()
            .into_iter()
            .filter(|n| {
                draft
                    .node(n)
                    .is_some_and(|node| node.provenance == Provenance::Module(module.clone()))
            })
            .collect();
        for name in draft.topological_sort() {
            if doomed.contains(&name) {
                draft.mark_dirty(&name);
                close_and_remove(ctx, draft, &name).await;
            }
        }
        ctx.modules.remove(module).await;
    }

    for id in &diff.processes_removed {
        ctx.processes.remove(id);
    }
}

async fn upsert_modules_and_processes(
    ctx: &EngineCtx<'_>,
    draft: &mut Graph,
    diff: &ConfigDiff,
) -> Result<(), ResourceError> {
    for (old, new) in &diff.module_renames {
        ctx.modules.rename(old, new).await;
        for name in draft.names() {
            if let Some(node) = draft.node_mut(&name)
                && node.provenance == Provenance::Module(old.clone())
            {
                node.provenance = Provenance::Module(new.clone());
            }
        }
    }

    for module_cfg in diff
        .modules_added
        .iter()
        .chain(diff.modules_modified.iter())
    {
        let outcome = ctx.modules.upsert(module_cfg).await?;
        let module_nodes: Vec<ResourceName> = draft
            .names()
            .into_iter()
            .filter(|n| {
                draft.node(n).is_some_and(|node| {
                    node.provenance == Provenance::Module(module_cfg.name.clone())
                })
            })
            .collect();
        match outcome {
            UpsertOutcome::Failed => {
                // Keep the nodes; only their operability is affected.
                for name in &module_nodes {
                    draft.mark_dirty(name);
                    if let Some(node) = draft.node_mut(name) {
                        node.mark_erred(ResourceError::Transport(format!(
                            "module \"{}\" is not running",
                            module_cfg.name
                        )));
                    }
                }
            }
            UpsertOutcome::Restarted => {
                // The module is a fresh process: everything it served must be
                // constructed anew (the old session's state is gone), and
                // dependents must observe the rebuild.
                for name in &module_nodes {
                    draft.mark_dirty(name);
                    if let Some(node) = draft.node_mut(name) {
                        node.state = NodeState::NeedsReconfigure;
                        node.handle = None;
                    }
                }
            }
            UpsertOutcome::Started | UpsertOutcome::Unchanged => {}
        }
    }

    for process_cfg in diff
        .processes_added
        .iter()
        .chain(diff.processes_modified.iter())
    {
        if let Err(e) = ctx.processes.upsert(process_cfg) {
            tracing::error!(process = %process_cfg.id, error = %e, "failed to start process");
        }
    }
    Ok(())
}

fn upsert_desired_nodes(
    ctx: &EngineCtx<'_>,
    draft: &mut Graph,
    diff: &ConfigDiff,
    desired: &BTreeMap<ResourceName, ResourceConfig>,
) {
    for cfg in &diff.added {
        draft.add_node(
            Node::new(cfg.resource_name(), initial_provenance(ctx, cfg)).with_config(cfg.clone()),
        );
    }
    for cfg in &diff.modified {
        let name = cfg.resource_name();
        draft.mark_dirty(&name);
        if let Some(node) = draft.node_mut(&name) {
            // A model or api change cannot be absorbed in place.
            let rebuilt = node
                .config
                .as_ref()
                .is_some_and(|old| old.model != cfg.model || old.api != cfg.api);
            if rebuilt {
                node.handle = None;
            }
            node.config = Some(cfg.clone());
            node.state = NodeState::NeedsReconfigure;
            node.last_error = None;
        }
    }
    // Nodes dropped earlier as unbuildable come back whenever the desired set
    // still wants them.
    for (name, cfg) in desired {
        if !draft.contains(name) {
            draft.add_node(Node::new(name.clone(), initial_provenance(ctx, cfg)).with_config(cfg.clone()));
        }
    }
    seed_dependency_edges(draft);
}

/// Best-effort edges for pending nodes so the build order already reflects
/// the new config's dependencies. The build pass redoes resolution
/// authoritatively; failures here are simply left to it.
fn seed_dependency_edges(draft: &mut Graph) {
    let pending: Vec<(ResourceName, Vec<String>)> = draft
        .names()
        .into_iter()
        .filter_map(|name| {
            let node = draft.node(&name)?;
            if !node.needs_work() || node.is_mirror() {
                return None;
            }
            node.config.as_ref().map(|c| (name.clone(), c.depends_on.clone()))
        })
        .collect();
    for (name, depends_on) in pending {
        for dep in depends_on {
            if let Ok(resolved) = resolve_dependency(draft, &name, &dep) {
                let _ = draft.add_edge(&name, &resolved);
            }
        }
    }
}

fn initial_provenance(ctx: &EngineCtx<'_>, cfg: &ResourceConfig) -> Provenance {
    if ctx.registry.lookup(&cfg.api, &cfg.model).is_some() {
        if cfg.api.kind == "service" {
            Provenance::BuiltinService
        } else {
            Provenance::Local
        }
    } else if let Some(module) = ctx.modules.provider_for(&cfg.model) {
        Provenance::Module(module)
    } else {
        Provenance::Local
    }
}

async fn close_and_remove(ctx: &EngineCtx<'_>, draft: &mut Graph, name: &ResourceName) {
    let Some(node) = draft.remove_node(name) else {
        return;
    };
    if matches!(node.provenance, Provenance::Module(_)) {
        ctx.modules.remove_resource(name).await;
    }
    close_node(&node).await;
}

async fn close_node(node: &Node) {
    if let Some(handle) = &node.handle
        && let Err(e) = handle.close().await
    {
        tracing::warn!(resource = %node.name, error = %e, "error closing resource");
    }
}

async fn remove_mirrors_of(draft: &mut Graph, remote: &str) {
    let mirrors: Vec<ResourceName> = draft
        .names()
        .into_iter()
        .filter(|n| {
            n.api.kind != "remote"
                && draft
                    .node(n)
                    .is_some_and(|node| node.provenance == Provenance::Remote(remote.to_owned()))
        })
        .collect();
    for name in mirrors {
        if draft.contains(&name) {
            for node in draft.remove_subtree(&name) {
                close_node(&node).await;
            }
        }
    }
}

/// Fold one round of remote snapshots into the graph, honoring the collision
/// rules: a local name beats any mirror, and two remotes contributing the
/// same (api, short-name) pair knock each other out until an operator adds a
/// prefix.
async fn apply_mirror_snapshots(
    graph: &mut Graph,
    snapshots: &[RemoteSnapshot],
    desired: &BTreeMap<ResourceName, ResourceConfig>,
    logged: &mut BTreeSet<String>,
) {
    for snap in snapshots {
        let sentinel = remote_sentinel_name(&snap.remote);
        if !graph.contains(&sentinel) {
            let mut node = Node::new(sentinel, Provenance::Remote(snap.remote.clone()));
            node.state = NodeState::Ready;
            graph.add_node(node);
        }
    }

    let mut local_shorts: BTreeSet<(String, String)> = desired
        .keys()
        .map(|n| (n.api.to_string(), n.name.clone()))
        .collect();
    for name in graph.names() {
        if let Some(node) = graph.node(&name)
            && !node.is_mirror()
        {
            local_shorts.insert((name.api.to_string(), name.name.clone()));
        }
    }

    type Contribution = (String, ResourceName, Arc<dyn Resource>);
    let mut by_short: BTreeMap<(String, String), Vec<Contribution>> = BTreeMap::new();
    for snap in snapshots.iter().filter(|s| s.reachable) {
        for (name, handle) in &snap.resources {
            by_short
                .entry((name.api.to_string(), name.name.clone()))
                .or_default()
                .push((snap.remote.clone(), name.clone(), Arc::clone(handle)));
        }
    }

    let mut active_collisions: BTreeSet<String> = BTreeSet::new();
    let mut desired_mirrors: BTreeMap<ResourceName, (String, Arc<dyn Resource>)> = BTreeMap::new();
    for ((api, short), mut contributions) in by_short {
        if local_shorts.contains(&(api.clone(), short.clone())) {
            for (remote, _, _) in &contributions {
                let key = format!("local/{api}/{short}/{remote}");
                if !logged.contains(&key) {
                    tracing::warn!(resource = %short, remote = %remote, "collision");
                }
                active_collisions.insert(key);
            }
            continue;
        }
        if contributions.len() > 1 {
            let key = format!("remotes/{api}/{short}");
            if !logged.contains(&key) {
                let remotes: Vec<&str> =
                    contributions.iter().map(|(r, _, _)| r.as_str()).collect();
                tracing::warn!(resource = %short, remotes = ?remotes, "collision");
            }
            active_collisions.insert(key);
            continue;
        }
        let (remote, name, handle) = contributions.remove(0);
        desired_mirrors.insert(name, (remote, handle));
    }
    // Resolved collisions are forgotten so a reintroduction logs again.
    *logged = active_collisions;

    let polled: BTreeSet<&str> = snapshots.iter().map(|s| s.remote.as_str()).collect();
    let reachable: BTreeSet<&str> = snapshots
        .iter()
        .filter(|s| s.reachable)
        .map(|s| s.remote.as_str())
        .collect();

    let mut to_remove = Vec::new();
    for name in graph.names() {
        let Some(node) = graph.node(&name) else {
            continue;
        };
        let Provenance::Remote(remote) = &node.provenance else {
            continue;
        };
        if name.api.kind == "remote" || !polled.contains(remote.as_str()) {
            continue;
        }
        if !reachable.contains(remote.as_str()) || !desired_mirrors.contains_key(&name) {
            to_remove.push(name);
        }
    }
    for name in to_remove {
        if graph.contains(&name) {
            tracing::info!(resource = %name, "mirrored resource disappeared");
            for node in graph.remove_subtree(&name) {
                close_node(&node).await;
            }
        }
    }

    for (name, (remote, handle)) in desired_mirrors {
        if graph.contains(&name) {
            // Membership is untouched, but the handle is refreshed so a
            // reconnected remote's session serves existing mirrors.
            if let Some(node) = graph.node_mut(&name) {
                node.handle = Some(handle);
                node.state = NodeState::Ready;
            }
        } else {
            let mut node = Node::new(name.clone(), Provenance::Remote(remote.clone()));
            node.state = NodeState::Ready;
            node.handle = Some(handle);
            graph.add_node(node);
            let _ = graph.add_edge(&name, &remote_sentinel_name(&remote));
        }
    }
}

async fn build_pass(
    ctx: &EngineCtx<'_>,
    graph: &mut Graph,
    mode: BuildMode,
    constructed: &mut Vec<(ResourceName, Arc<dyn Resource>)>,
    touched: &mut BTreeSet<ResourceName>,
) -> Result<(), ResourceError> {
    for name in graph.reverse_topological_sort() {
        let Some(node) = graph.node(&name) else {
            continue; // removed earlier in this pass
        };
        if !node.needs_work() || node.is_mirror() || node.config.is_none() {
            continue;
        }
        if ctx.cancel.is_cancelled() {
            if mode == BuildMode::Commit {
                return Err(ResourceError::Cancelled);
            }
            return Ok(());
        }
        match build_node(ctx, graph, &name).await {
            Ok(BuildResult::Ready { newly_constructed }) => {
                touched.insert(name.clone());
                if let Some(handle) = newly_constructed {
                    constructed.push((name.clone(), handle));
                }
            }
            Ok(BuildResult::Erred | BuildResult::Removed) => {}
            Err(fatal) => {
                if mode == BuildMode::Commit {
                    return Err(fatal);
                }
                mark_node_erred(graph, &name, fatal);
            }
        }
    }
    Ok(())
}

/// Build or reconfigure one node. `Err` is reserved for plan-fatal errors;
/// per-node failures land on the node itself.
async fn build_node(
    ctx: &EngineCtx<'_>,
    graph: &mut Graph,
    name: &ResourceName,
) -> Result<BuildResult, ResourceError> {
    let (config, prior_handle, prior_state, prior_provenance) = {
        let Some(node) = graph.node(name) else {
            return Ok(BuildResult::Removed);
        };
        let Some(config) = node.config.clone() else {
            return Ok(BuildResult::Removed);
        };
        (config, node.handle.clone(), node.state, node.provenance.clone())
    };
    if let Some(node) = graph.node_mut(name) {
        node.state = NodeState::Configuring;
    }

    // Explicit dependencies.
    let mut dep_names: Vec<ResourceName> = Vec::new();
    for dep in &config.depends_on {
        match resolve_dependency(graph, name, dep) {
            Ok(resolved) => {
                if !dep_names.contains(&resolved) {
                    dep_names.push(resolved);
                }
            }
            Err(e) => {
                tracing::warn!(
                    resource = %name,
                    dependency = %dep,
                    error = %e,
                    "dependency resolution failed; resource will not be built"
                );
                for node in graph.remove_subtree(name) {
                    close_node(&node).await;
                }
                return Ok(BuildResult::Removed);
            }
        }
    }

    graph.clear_dependencies_of(name);
    for dep in &dep_names {
        if let Err(e) = graph.add_edge(name, dep) {
            return match e {
                GraphError::WouldCreateCycle { .. } => Err(ResourceError::Cycle(name.to_string())),
                GraphError::MissingEndpoint(endpoint) => {
                    mark_node_erred(
                        graph,
                        name,
                        ResourceError::Unresolved {
                            dependent: name.to_string(),
                            dependency: endpoint,
                        },
                    );
                    Ok(BuildResult::Erred)
                }
            };
        }
    }

    // Who constructs this node.
    let builtin = ctx.registry.lookup(&config.api, &config.model);
    let module = if builtin.is_some() {
        None
    } else {
        ctx.modules.provider_for(&config.model)
    };
    if builtin.is_none() && module.is_none() {
        mark_node_erred(
            graph,
            name,
            ResourceError::Validation(format!(
                "model \"{}\" is not registered and no module serves it",
                config.model
            )),
        );
        return Ok(BuildResult::Erred);
    }

    // Module validation may surface implicit dependencies.
    if module.is_some() {
        match ctx.modules.validate(&config).await {
            Ok(implicit) => {
                for dep in implicit {
                    let resolved = match resolve_dependency(graph, name, &dep) {
                        Ok(resolved) => resolved,
                        Err(e) => {
                            mark_node_erred(graph, name, e);
                            return Ok(BuildResult::Erred);
                        }
                    };
                    if dep_names.contains(&resolved) {
                        continue;
                    }
                    if let Err(e) = graph.add_edge(name, &resolved) {
                        return match e {
                            GraphError::WouldCreateCycle { .. } => {
                                Err(ResourceError::Cycle(name.to_string()))
                            }
                            GraphError::MissingEndpoint(endpoint) => {
                                mark_node_erred(
                                    graph,
                                    name,
                                    ResourceError::Unresolved {
                                        dependent: name.to_string(),
                                        dependency: endpoint,
                                    },
                                );
                                Ok(BuildResult::Erred)
                            }
                        };
                    }
                    dep_names.push(resolved);
                }
            }
            Err(e) => {
                mark_node_erred(graph, name, e);
                return Ok(BuildResult::Erred);
            }
        }
    }

    // Every dependency must be ready before this node can build.
    for dep in &dep_names {
        if !graph.node(dep).is_some_and(Node::is_ready) {
            mark_node_erred(
                graph,
                name,
                ResourceError::DependencyNotReady {
                    dependent: name.to_string(),
                    dependency: dep.to_string(),
                },
            );
            return Ok(BuildResult::Erred);
        }
    }

    let mut deps = Dependencies::new();
    for dep in &dep_names {
        if let Some(handle) = graph.node(dep).and_then(|n| n.handle.clone()) {
            deps.insert(dep.clone(), handle);
        }
    }

    let result: Result<(Arc<dyn Resource>, bool), ResourceError> = if let Some(module_name) =
        &module
    {
        // Reuse the prior handle only for in-place reconfigures of a resource
        // the same module already serves.
        let reuse = match (&prior_handle, prior_state, &prior_provenance) {
            (Some(handle), NodeState::NeedsReconfigure, Provenance::Module(m))
                if m == module_name =>
            {
                Some(Arc::clone(handle))
            }
            _ => None,
        };
        if let Some(handle) = reuse {
            match ctx.modules.reconfigure_resource(&config, &deps).await {
                Ok(ReconfigureOutcome::Reconfigured) => Ok((handle, false)),
                Ok(ReconfigureOutcome::NeedsRebuild) => {
                    ctx.modules.remove_resource(name).await;
                    ctx.modules.construct(&config, &deps).await.map(|h| (h, true))
                }
                Err(e) => Err(e),
            }
        } else {
            ctx.modules.construct(&config, &deps).await.map(|h| (h, true))
        }
    } else if let Some(registration) = builtin {
        let reuse = match (&prior_handle, prior_state) {
            (Some(handle), NodeState::NeedsReconfigure) => Some(Arc::clone(handle)),
            _ => None,
        };
        if let Some(handle) = reuse {
            match handle.reconfigure(&config, &deps).await {
                Ok(ReconfigureOutcome::Reconfigured) => Ok((handle, false)),
                Ok(ReconfigureOutcome::NeedsRebuild) => {
                    if let Err(e) = handle.close().await {
                        tracing::warn!(resource = %name, error = %e, "error closing handle before rebuild");
                    }
                    (registration.constructor)(&config, &deps).map(|h| (h, true))
                }
                Err(e) => Err(e),
            }
        } else {
            (registration.constructor)(&config, &deps).map(|h| (h, true))
        }
    } else {
        // Unreachable in practice: the backend check above already erred.
        return Ok(BuildResult::Erred);
    };

    match result {
        Ok((handle, newly)) => {
            let at = ctx.clock.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(node) = graph.node_mut(name) {
                node.mark_ready(Arc::clone(&handle), at);
                node.provenance = match &module {
                    Some(m) => Provenance::Module(m.clone()),
                    None if config.api.kind == "service" => Provenance::BuiltinService,
                    None => Provenance::Local,
                };
            }
            tracing::debug!(resource = %name, "resource ready");
            dirty_children(graph, name);
            Ok(BuildResult::Ready {
                newly_constructed: newly.then_some(handle),
            })
        }
        Err(e) => {
            tracing::warn!(resource = %name, error = %e, "resource construction failed");
            mark_node_erred(graph, name, e);
            Ok(BuildResult::Erred)
        }
    }
}

fn mark_node_erred(graph: &mut Graph, name: &ResourceName, error: ResourceError) {
    if let Some(node) = graph.node_mut(name) {
        node.mark_erred(error);
    }
    dirty_children(graph, name);
}

/// Direct dependents of a node that changed must re-observe it.
fn dirty_children(graph: &mut Graph, name: &ResourceName) {
    for child in graph.children_of(name) {
        if let Some(node) = graph.node_mut(&child)
            && node.state == NodeState::Ready
        {
            node.state = NodeState::NeedsReconfigure;
        }
    }
}

/// Resolve one `depends_on` entry. Local matches win over mirrors; a bare
/// name matching several resources is ambiguous.
fn resolve_dependency(
    graph: &Graph,
    dependent: &ResourceName,
    dep: &str,
) -> Result<ResourceName, ResourceError> {
    if dep.contains('/') {
        let full: ResourceName = dep
            .parse()
            .map_err(|_| ResourceError::Unresolved {
                dependent: dependent.to_string(),
                dependency: dep.to_owned(),
            })?;
        if full != *dependent && graph.contains(&full) {
            return Ok(full);
        }
        return Err(ResourceError::Unresolved {
            dependent: dependent.to_string(),
            dependency: dep.to_owned(),
        });
    }

    let matches = match graph.find_by_short_name(dep) {
        ShortNameMatch::Resolved(name) => vec![name],
        ShortNameMatch::Ambiguous(names) => names,
        ShortNameMatch::NotFound => Vec::new(),
    };
    let mut matches: Vec<ResourceName> =
        matches.into_iter().filter(|n| n != dependent).collect();
    let locals: Vec<&ResourceName> = matches.iter().filter(|n| n.is_local()).collect();
    match locals.len() {
        1 => Ok(locals[0].clone()),
        0 => match matches.len() {
            0 => Err(ResourceError::Unresolved {
                dependent: dependent.to_string(),
                dependency: dep.to_owned(),
            }),
            1 => Ok(matches.remove(0)),
            _ => Err(ResourceError::Ambiguous {
                dependent: dependent.to_string(),
                dependency: dep.to_owned(),
            }),
        },
        _ => Err(ResourceError::Ambiguous {
            dependent: dependent.to_string(),
            dependency: dep.to_owned(),
        }),
    }
}

/// End-of-commit pass over resources with weak dependencies: each such
/// resource reconfigures once, observing every matched node, whenever it or
/// any matched node was rebuilt in this commit.
async fn weak_pass(ctx: &EngineCtx<'_>, graph: &mut Graph, touched: &BTreeSet<ResourceName>) {
    if touched.is_empty() {
        return;
    }
    for registration in ctx.registry.weak_registrations() {
        let owners: Vec<ResourceName> = graph
            .names()
            .into_iter()
            .filter(|n| {
                graph.node(n).is_some_and(|node| {
                    node.is_ready()
                        && node.config.as_ref().is_some_and(|c| {
                            c.api == registration.api && c.model == registration.model
                        })
                })
            })
            .collect();

        for owner in owners {
            let matched: Vec<ResourceName> = graph
                .names()
                .into_iter()
                .filter(|n| {
                    *n != owner
                        && graph.node(n).is_some_and(Node::is_ready)
                        && registration
                            .weak_dependencies
                            .iter()
                            .any(|m| m.matches(n))
                })
                .collect();

            let triggered =
                touched.contains(&owner) || matched.iter().any(|m| touched.contains(m));
            if !triggered {
                continue;
            }

            let (config, handle) = {
                let Some(node) = graph.node(&owner) else {
                    continue;
                };
                let (Some(config), Some(handle)) = (node.config.clone(), node.handle.clone())
                else {
                    continue;
                };
                (config, handle)
            };

            let mut deps = Dependencies::new();
            for dep in graph.parents_of(&owner) {
                if let Some(h) = graph.node(&dep).and_then(|n| n.handle.clone()) {
                    deps.insert(dep, h);
                }
            }
            for dep in &matched {
                let _ = graph.add_weak_edge(&owner, dep);
                if let Some(h) = graph.node(dep).and_then(|n| n.handle.clone()) {
                    deps.insert(dep.clone(), h);
                }
            }

            match handle.reconfigure(&config, &deps).await {
                Ok(ReconfigureOutcome::Reconfigured) => {
                    let at = ctx.clock.fetch_add(1, Ordering::SeqCst) + 1;
                    if let Some(node) = graph.node_mut(&owner) {
                        node.last_reconfigured_at = at;
                    }
                    tracing::debug!(resource = %owner, deps = matched.len(), "weak dependencies resolved");
                }
                Ok(ReconfigureOutcome::NeedsRebuild) => {
                    tracing::debug!(resource = %owner, "weak dependent asked for a rebuild; deferring to next configure");
                }
                Err(e) => {
                    tracing::warn!(resource = %owner, error = %e, "weak dependency pass failed");
                    mark_node_erred(graph, &owner, e);
                }
            }
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use crate::graph::NodeState;
    use crate::test_support::{TestFixture, component, config_of, module};
    use crate::{ResourceError, ResourceName};

    const TESTMOD: &str = "/opt/testmod1";

    fn fixture() -> TestFixture {
        let fx = TestFixture::new();
        fx.modules.register_binary(TESTMOD, &["acme:gizmo"]);
        fx
    }

    #[tokio::test]
    async fn implicit_module_deps_become_edges() {
        let fx = fixture();
        let mut gizmo = component("gizmo1", "generic", "acme:gizmo", &[]);
        gizmo.attributes = serde_json::json!({"implicit_deps": ["base1"]});
        let config = config_of(
            vec![module("acme", TESTMOD)],
            vec![],
            vec![component("base1", "base", "fake", &[]), gizmo],
            vec![],
        );
        fx.manager.reconfigure(config).await.unwrap();

        let gizmo_name: ResourceName = "rig:component:generic/gizmo1".parse().unwrap();
        let deps = fx.manager.dependencies_of(&gizmo_name);
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].name, "base1");

        // The implicit dependency's handle was passed at construction.
        let gizmo = fx.manager.resource("gizmo1").unwrap();
        let echoed = gizmo.do_command(serde_json::json!("echo_dep")).await.unwrap();
        assert_eq!(echoed, serde_json::json!({"command": "echo"}));
    }

    #[tokio::test]
    async fn implicit_dep_cycle_is_fatal_and_rolled_back() {
        let fx = fixture();
        // r_b explicitly depends on r_a; r_a's module validation names r_b as
        // an implicit dependency, closing the loop.
        let mut r_a = component("r_a", "generic", "acme:gizmo", &[]);
        r_a.attributes = serde_json::json!({"implicit_deps": ["r_b"]});
        let r_b = component("r_b", "generic", "fake", &["r_a"]);
        let config = config_of(
            vec![module("acme", TESTMOD)],
            vec![],
            vec![r_a, r_b],
            vec![],
        );
        let err = fx.manager.reconfigure(config).await.unwrap_err();
        assert!(matches!(err, ResourceError::Cycle(_)), "got: {err:?}");
        assert!(fx.manager.resource_names().is_empty());
    }

    #[tokio::test]
    async fn unresolved_implicit_dep_leaves_node_erred() {
        let fx = fixture();
        let mut gizmo = component("gizmo1", "generic", "acme:gizmo", &[]);
        gizmo.attributes = serde_json::json!({"implicit_deps": ["ghost"]});
        let config = config_of(vec![module("acme", TESTMOD)], vec![], vec![gizmo], vec![]);
        fx.manager.reconfigure(config).await.unwrap();

        let statuses = fx.manager.resource_statuses();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].state, NodeState::Erred);
        assert!(matches!(
            statuses[0].last_error,
            Some(ResourceError::Unresolved { .. })
        ));
    }

    #[tokio::test]
    async fn module_validation_rejection_is_transient() {
        let fx = fixture();
        let mut gizmo = component("gizmo1", "generic", "acme:gizmo", &[]);
        gizmo.attributes = serde_json::json!({"validate_error": "speed out of range"});
        let config = config_of(vec![module("acme", TESTMOD)], vec![], vec![gizmo], vec![]);
        fx.manager.reconfigure(config).await.unwrap();

        let statuses = fx.manager.resource_statuses();
        assert_eq!(statuses[0].state, NodeState::Erred);
        let err = statuses[0].last_error.clone().unwrap();
        assert!(err.is_transient(), "validation errors are retried: {err:?}");
    }

    #[tokio::test]
    async fn cancelled_runtime_rejects_reconfigure() {
        let fx = fixture();
        fx.cancel.cancel();
        let err = fx
            .manager
            .reconfigure(config_of(vec![], vec![], vec![], vec![]))
            .await
            .unwrap_err();
        assert_eq!(err, ResourceError::Cancelled);
    }

    #[tokio::test]
    async fn build_order_is_dependency_driven_not_alphabetical() {
        // "aardvark" depends on "zebra": the engine must build zebra first
        // even though every node is fresh and unordered by name.
        let fx = fixture();
        let config = config_of(
            vec![],
            vec![],
            vec![
                component("aardvark", "generic", "fake", &["zebra"]),
                component("zebra", "generic", "fake", &[]),
            ],
            vec![],
        );
        fx.manager.reconfigure(config).await.unwrap();
        for status in fx.manager.resource_statuses() {
            assert_eq!(status.state, NodeState::Ready, "{} not ready", status.name);
        }
    }
}
