//! Declarative configuration records accepted by the reconfiguration engine.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use crate::name::{Api, Model, ResourceName};

/// The declarative record for one resource node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceConfig {
    pub name: String,
    pub api: Api,
    pub model: Model,
    #[serde(default)]
    pub attributes: serde_json::Value,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub associated_resource_configs: Vec<AssociatedResourceConfig>,
}

impl ResourceConfig {
    #[must_use]
    pub fn new(name: &str, api: Api, model: Model) -> Self {
        Self {
            name: name.to_owned(),
            api,
            model,
            attributes: serde_json::Value::Null,
            depends_on: Vec::new(),
            associated_resource_configs: Vec::new(),
        }
    }

    /// The fully qualified name this config materializes as.
    #[must_use]
    pub fn resource_name(&self) -> ResourceName {
        ResourceName::new(self.api.clone(), &self.name)
    }

    /// Whether a change from `self` to `other` requires rebuilding or
    /// reconfiguring the node. The name is assumed equal.
    #[must_use]
    pub fn configuration_equal(&self, other: &Self) -> bool {
        self.api == other.api
            && self.model == other.model
            && self.attributes == other.attributes
            && self.depends_on == other.depends_on
            && self.associated_resource_configs == other.associated_resource_configs
    }
}

/// Per-peer configuration one resource attaches to another, e.g. a data
/// collector sniffing capture methods from an arbitrary sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AssociatedResourceConfig {
    pub target: String,
    #[serde(default)]
    pub attributes: serde_json::Value,
}

/// Configuration for one out-of-process module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleConfig {
    pub name: String,
    pub exec_path: PathBuf,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub local_version: String,
}

impl ModuleConfig {
    /// True when the two configs describe the same running binary, i.e. a
    /// transition between them needs no restart.
    #[must_use]
    pub fn same_binary(&self, other: &Self) -> bool {
        self.exec_path == other.exec_path
            && self.environment == other.environment
            && self.local_version == other.local_version
    }
}

/// Configuration for one managed child program (not a module).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessConfig {
    pub id: String,
    pub exec_path: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// One-shot processes are expected to exit; they are never restarted.
    #[serde(default)]
    pub one_shot: bool,
    #[serde(default = "default_true")]
    pub restart_on_exit: bool,
}

fn default_true() -> bool {
    true
}

impl ProcessConfig {
    #[must_use]
    pub fn new(id: &str, exec_path: &str) -> Self {
        Self {
            id: id.to_owned(),
            exec_path: PathBuf::from(exec_path),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            one_shot: false,
            restart_on_exit: true,
        }
    }
}

/// Credentials presented to a remote at session open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteAuth {
    #[serde(default)]
    pub entity: Option<String>,
    #[serde(default)]
    pub secret: Option<String>,
}

/// Configuration for one remote robot whose resources are mirrored locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteConfig {
    pub name: String,
    pub address: String,
    /// Optional short-name prefix applied to every mirrored resource, used to
    /// disambiguate remotes that expose the same names.
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub auth: Option<RemoteAuth>,
}

/// The full configuration record accepted by the engine.
///
/// List order is preserved for diagnostics but carries no semantics beyond
/// collision-first-wins.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub modules: Vec<ModuleConfig>,
    #[serde(default)]
    pub processes: Vec<ProcessConfig>,
    #[serde(default)]
    pub remotes: Vec<RemoteConfig>,
    #[serde(default)]
    pub components: Vec<ResourceConfig>,
    #[serde(default)]
    pub services: Vec<ResourceConfig>,
}

impl Config {
    /// All resource configs, components first, in declaration order.
    pub fn resources(&self) -> impl Iterator<Item = &ResourceConfig> {
        self.components.iter().chain(self.services.iter())
    }

    /// The desired resource set keyed by fully qualified name, plus the
    /// short names that appeared more than once.
    ///
    /// A duplicated name poisons every occurrence: none of them are kept, so
    /// an operator cannot silently end up with whichever definition happened
    /// to be listed first.
    #[must_use]
    pub fn deduped_resources(&self) -> (BTreeMap<ResourceName, ResourceConfig>, Vec<String>) {
        let mut counts: BTreeMap<ResourceName, usize> = BTreeMap::new();
        for cfg in self.resources() {
            *counts.entry(cfg.resource_name()).or_insert(0) += 1;
        }

        let mut kept = BTreeMap::new();
        let mut collided = BTreeSet::new();
        for cfg in self.resources() {
            let name = cfg.resource_name();
            if counts[&name] > 1 {
                collided.insert(name.name.clone());
            } else {
                kept.insert(name, cfg.clone());
            }
        }
        (kept, collided.into_iter().collect())
    }
}
