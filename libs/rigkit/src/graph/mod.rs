//! The resource graph.
//!
//! Nodes live in an arena with stable integer indices keyed by name; edges
//! are index pairs pointing from dependent to dependency. Weak edges (from
//! lazily matched weak dependencies) are kept out of cycle rejection and out
//! of dependent propagation; they only order the end-of-commit pass.
//!
//! Every query returns names sorted by their rendered form so that tests over
//! parallel configurations produce stable results.

mod node;

pub use node::{Node, NodeState, Provenance};

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use thiserror::Error;

use crate::name::ResourceName;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("adding an edge from \"{dependent}\" to \"{dependency}\" would create a cycle")]
    WouldCreateCycle {
        dependent: String,
        dependency: String,
    },
    #[error("edge endpoint \"{0}\" is not in the graph")]
    MissingEndpoint(String),
}

/// Result of inserting a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddNodeOutcome {
    Added,
    /// A node with the same name already exists; the insert was a no-op.
    Collision,
}

/// Result of a short-name search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShortNameMatch {
    Resolved(ResourceName),
    Ambiguous(Vec<ResourceName>),
    NotFound,
}

#[derive(Clone, Default)]
pub struct Graph {
    nodes: Vec<Option<Node>>,
    index: BTreeMap<ResourceName, usize>,
    /// dependent → dependency
    edges: BTreeSet<(usize, usize)>,
    weak_edges: BTreeSet<(usize, usize)>,
}

impl Graph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    #[must_use]
    pub fn contains(&self, name: &ResourceName) -> bool {
        self.index.contains_key(name)
    }

    #[must_use]
    pub fn node(&self, name: &ResourceName) -> Option<&Node> {
        self.index.get(name).and_then(|&i| self.nodes[i].as_ref())
    }

    pub fn node_mut(&mut self, name: &ResourceName) -> Option<&mut Node> {
        self.index
            .get(name)
            .copied()
            .and_then(|i| self.nodes[i].as_mut())
    }

    /// All node names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<ResourceName> {
        self.index.keys().cloned().collect()
    }

    /// Insert a node. A name collision is logged and leaves the prior node
    /// untouched.
    pub fn add_node(&mut self, node: Node) -> AddNodeOutcome {
        if let Some(existing) = self.node(&node.name) {
            tracing::warn!(
                resource = %node.name,
                existing = ?existing.provenance,
                incoming = ?node.provenance,
                "collision"
            );
            return AddNodeOutcome::Collision;
        }
        let idx = self.nodes.len();
        self.index.insert(node.name.clone(), idx);
        self.nodes.push(Some(node));
        AddNodeOutcome::Added
    }

    /// Add a dependency edge. Duplicate edges are a no-op; self-edges and
    /// edges that would close a cycle are rejected.
    ///
    /// # Errors
    /// `MissingEndpoint` if either name is absent, `WouldCreateCycle` if the
    /// edge would make the graph cyclic. The graph is unchanged on error.
    pub fn add_edge(
        &mut self,
        dependent: &ResourceName,
        dependency: &ResourceName,
    ) -> Result<(), GraphError> {
        let (a, b) = self.edge_endpoints(dependent, dependency)?;
        if a == b || self.reachable(b, a) {
            return Err(GraphError::WouldCreateCycle {
                dependent: dependent.to_string(),
                dependency: dependency.to_string(),
            });
        }
        self.edges.insert((a, b));
        Ok(())
    }

    /// Add a weak edge. Weak edges skip cycle rejection; they only order the
    /// end-of-commit weak pass.
    ///
    /// # Errors
    /// `MissingEndpoint` if either name is absent.
    pub fn add_weak_edge(
        &mut self,
        dependent: &ResourceName,
        dependency: &ResourceName,
    ) -> Result<(), GraphError> {
        let (a, b) = self.edge_endpoints(dependent, dependency)?;
        if a != b {
            self.weak_edges.insert((a, b));
        }
        Ok(())
    }

    fn edge_endpoints(
        &self,
        dependent: &ResourceName,
        dependency: &ResourceName,
    ) -> Result<(usize, usize), GraphError> {
        let a = *self
            .index
            .get(dependent)
            .ok_or_else(|| GraphError::MissingEndpoint(dependent.to_string()))?;
        let b = *self
            .index
            .get(dependency)
            .ok_or_else(|| GraphError::MissingEndpoint(dependency.to_string()))?;
        Ok((a, b))
    }

    /// Whether `to` is reachable from `from` along dependency edges.
    fn reachable(&self, from: usize, to: usize) -> bool {
        let mut stack = vec![from];
        let mut seen = BTreeSet::new();
        while let Some(i) = stack.pop() {
            if i == to {
                return true;
            }
            if seen.insert(i) {
                stack.extend(
                    self.edges
                        .range((i, 0)..=(i, usize::MAX))
                        .map(|&(_, dep)| dep),
                );
            }
        }
        false
    }

    /// Remove a node and every edge touching it. Idempotent.
    pub fn remove_node(&mut self, name: &ResourceName) -> Option<Node> {
        let idx = self.index.remove(name)?;
        self.edges.retain(|&(a, b)| a != idx && b != idx);
        self.weak_edges.retain(|&(a, b)| a != idx && b != idx);
        self.nodes[idx].take()
    }

    /// Drop the node's outgoing dependency edges (both strengths), used
    /// before re-resolving a node's dependencies.
    pub fn clear_dependencies_of(&mut self, name: &ResourceName) {
        if let Some(&idx) = self.index.get(name) {
            self.edges.retain(|&(a, _)| a != idx);
            self.weak_edges.retain(|&(a, _)| a != idx);
        }
    }

    /// Direct dependencies of `name`, sorted.
    #[must_use]
    pub fn parents_of(&self, name: &ResourceName) -> Vec<ResourceName> {
        let Some(&idx) = self.index.get(name) else {
            return Vec::new();
        };
        self.sorted_names(
            self.edges
                .range((idx, 0)..=(idx, usize::MAX))
                .map(|&(_, dep)| dep),
        )
    }

    /// Direct dependents of `name`, sorted.
    #[must_use]
    pub fn children_of(&self, name: &ResourceName) -> Vec<ResourceName> {
        let Some(&idx) = self.index.get(name) else {
            return Vec::new();
        };
        self.sorted_names(
            self.edges
                .iter()
                .filter(|&&(_, dep)| dep == idx)
                .map(|&(dependent, _)| dependent),
        )
    }

    /// Transitive dependents of `name` (exclusive), sorted.
    #[must_use]
    pub fn all_descendants(&self, name: &ResourceName) -> Vec<ResourceName> {
        let Some(&start) = self.index.get(name) else {
            return Vec::new();
        };
        let closure = self.dependent_closure(start);
        self.sorted_names(closure.into_iter().filter(|&i| i != start))
    }

    fn dependent_closure(&self, start: usize) -> BTreeSet<usize> {
        let mut seen = BTreeSet::from([start]);
        let mut queue = VecDeque::from([start]);
        while let Some(i) = queue.pop_front() {
            for &(dependent, _) in self.edges.iter().filter(|&&(_, dep)| dep == i) {
                if seen.insert(dependent) {
                    queue.push_back(dependent);
                }
            }
        }
        seen
    }

    /// The induced subgraph of `name` and its dependents.
    #[must_use]
    pub fn sub_graph_from(&self, name: &ResourceName) -> Graph {
        let Some(&start) = self.index.get(name) else {
            return Graph::new();
        };
        let keep = self.dependent_closure(start);
        let mut sub = Graph::new();
        for &i in &keep {
            if let Some(node) = &self.nodes[i] {
                sub.add_node(node.clone());
            }
        }
        for &(a, b) in &self.edges {
            if keep.contains(&a) && keep.contains(&b) {
                let (Some(na), Some(nb)) = (&self.nodes[a], &self.nodes[b]) else {
                    continue;
                };
                let _ = sub.add_edge(&na.name, &nb.name);
            }
        }
        sub
    }

    /// Remove `name` and every transitive dependent, returning the removed
    /// nodes in safe teardown order (dependents first, `name` last).
    pub fn remove_subtree(&mut self, name: &ResourceName) -> Vec<Node> {
        if !self.contains(name) {
            return Vec::new();
        }
        let mut doomed: BTreeSet<ResourceName> = self
            .all_descendants(name)
            .into_iter()
            .collect();
        doomed.insert(name.clone());

        let order: Vec<ResourceName> = self
            .topological_sort()
            .into_iter()
            .filter(|n| doomed.contains(n))
            .collect();
        order
            .iter()
            .filter_map(|n| self.remove_node(n))
            .collect()
    }

    /// Set `NeedsReconfigure` on `name` and every transitive dependent that
    /// is currently ready.
    pub fn mark_dirty(&mut self, name: &ResourceName) {
        let Some(&start) = self.index.get(name) else {
            return;
        };
        for i in self.dependent_closure(start) {
            if let Some(node) = self.nodes[i].as_mut()
                && node.state == NodeState::Ready
            {
                node.state = NodeState::NeedsReconfigure;
            }
        }
    }

    /// Resolve a short `depends_on` entry against the whole graph.
    #[must_use]
    pub fn find_by_short_name(&self, short: &str) -> ShortNameMatch {
        let mut matches: Vec<ResourceName> = self
            .index
            .keys()
            .filter(|n| n.matches_dependency(short))
            .cloned()
            .collect();
        match matches.len() {
            0 => ShortNameMatch::NotFound,
            1 => ShortNameMatch::Resolved(matches.remove(0)),
            _ => ShortNameMatch::Ambiguous(matches),
        }
    }

    /// Teardown order: every node before its dependencies, ties broken by
    /// rendered name.
    #[must_use]
    pub fn topological_sort(&self) -> Vec<ResourceName> {
        self.kahn(false)
    }

    /// Build order: every node after its dependencies, ties broken by
    /// rendered name.
    #[must_use]
    pub fn reverse_topological_sort(&self) -> Vec<ResourceName> {
        self.kahn(true)
    }

    fn kahn(&self, dependencies_first: bool) -> Vec<ResourceName> {
        // In teardown order an edge (dependent, dependency) means "dependent
        // before dependency"; in build order the precedence flips.
        let mut indegree: BTreeMap<usize, usize> = self.index.values().map(|&i| (i, 0)).collect();
        for &(dependent, dependency) in &self.edges {
            let blocked = if dependencies_first { dependent } else { dependency };
            *indegree.entry(blocked).or_insert(0) += 1;
        }

        let mut ready: BTreeSet<(String, usize)> = indegree
            .iter()
            .filter(|&(_, &deg)| deg == 0)
            .filter_map(|(&i, _)| {
                self.nodes[i]
                    .as_ref()
                    .map(|n| (n.name.to_string(), i))
            })
            .collect();

        let mut order = Vec::with_capacity(self.index.len());
        while let Some(entry) = ready.iter().next().cloned() {
            ready.remove(&entry);
            let (_, i) = entry;
            let Some(node) = self.nodes[i].as_ref() else {
                continue;
            };
            order.push(node.name.clone());
            let unblocked: Vec<usize> = if dependencies_first {
                self.edges
                    .iter()
                    .filter(|&&(_, dep)| dep == i)
                    .map(|&(dependent, _)| dependent)
                    .collect()
            } else {
                self.edges
                    .range((i, 0)..=(i, usize::MAX))
                    .map(|&(_, dep)| dep)
                    .collect()
            };
            for j in unblocked {
                let Some(deg) = indegree.get_mut(&j) else {
                    continue;
                };
                *deg -= 1;
                if *deg == 0
                    && let Some(n) = self.nodes[j].as_ref()
                {
                    ready.insert((n.name.to_string(), j));
                }
            }
        }
        debug_assert_eq!(order.len(), self.index.len(), "graph must stay acyclic");
        order
    }

    /// Nodes a build or retry pass should visit, in build order.
    #[must_use]
    pub fn nodes_needing_work(&self) -> Vec<ResourceName> {
        self.reverse_topological_sort()
            .into_iter()
            .filter(|n| self.node(n).is_some_and(Node::needs_work))
            .collect()
    }

    /// Weak dependents of `name`: nodes holding a weak edge onto it.
    #[must_use]
    pub fn weak_dependents_of(&self, name: &ResourceName) -> Vec<ResourceName> {
        let Some(&idx) = self.index.get(name) else {
            return Vec::new();
        };
        self.sorted_names(
            self.weak_edges
                .iter()
                .filter(|&&(_, dep)| dep == idx)
                .map(|&(dependent, _)| dependent),
        )
    }

    fn sorted_names(&self, indices: impl Iterator<Item = usize>) -> Vec<ResourceName> {
        let mut names: Vec<ResourceName> = indices
            .filter_map(|i| self.nodes[i].as_ref().map(|n| n.name.clone()))
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let edges: Vec<String> = self
            .edges
            .iter()
            .filter_map(|&(a, b)| {
                let (na, nb) = (self.nodes[a].as_ref()?, self.nodes[b].as_ref()?);
                Some(format!("{} -> {}", na.name, nb.name))
            })
            .collect();
        f.debug_struct("Graph")
            .field("nodes", &self.names())
            .field("edges", &edges)
            .finish()
    }
}
