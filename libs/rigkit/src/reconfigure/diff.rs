//! Config diffing.
//!
//! Compares two full configurations list by list and classifies every entry
//! as added, modified, or removed. Module renames (same binary, new name) are
//! detected here so the supervisor can rename without a restart.

use std::collections::BTreeMap;
use std::fmt;

use crate::config::{Config, ModuleConfig, ProcessConfig, RemoteConfig, ResourceConfig};
use crate::name::ResourceName;

#[derive(Default)]
pub struct ConfigDiff {
    pub added: Vec<ResourceConfig>,
    pub modified: Vec<ResourceConfig>,
    pub removed: Vec<ResourceName>,
    /// Short names that appeared more than once in the new config; none of
    /// their occurrences are materialized.
    pub resource_collisions: Vec<String>,

    pub modules_added: Vec<ModuleConfig>,
    pub modules_modified: Vec<ModuleConfig>,
    pub modules_removed: Vec<String>,
    /// `(old_name, new_name)` pairs where only the name changed.
    pub module_renames: Vec<(String, String)>,

    pub remotes_added: Vec<RemoteConfig>,
    pub remotes_modified: Vec<RemoteConfig>,
    pub remotes_removed: Vec<String>,

    pub processes_added: Vec<ProcessConfig>,
    pub processes_modified: Vec<ProcessConfig>,
    pub processes_removed: Vec<String>,
}

impl ConfigDiff {
    #[must_use]
    pub fn new(old: &Config, new: &Config) -> Self {
        let mut diff = Self::default();
        diff.diff_resources(old, new);
        diff.diff_modules(old, new);
        diff.diff_remotes(old, new);
        diff.diff_processes(old, new);
        diff
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.modified.is_empty()
            && self.removed.is_empty()
            && self.modules_added.is_empty()
            && self.modules_modified.is_empty()
            && self.modules_removed.is_empty()
            && self.module_renames.is_empty()
            && self.remotes_added.is_empty()
            && self.remotes_modified.is_empty()
            && self.remotes_removed.is_empty()
            && self.processes_added.is_empty()
            && self.processes_modified.is_empty()
            && self.processes_removed.is_empty()
    }

    fn diff_resources(&mut self, old: &Config, new: &Config) {
        let (old_map, _) = old.deduped_resources();
        let (new_map, collisions) = new.deduped_resources();
        self.resource_collisions = collisions;

        for (name, cfg) in &new_map {
            match old_map.get(name) {
                None => self.added.push(cfg.clone()),
                Some(prev) if !prev.configuration_equal(cfg) => self.modified.push(cfg.clone()),
                Some(_) => {}
            }
        }
        for name in old_map.keys() {
            if !new_map.contains_key(name) {
                self.removed.push(name.clone());
            }
        }
    }

    fn diff_modules(&mut self, old: &Config, new: &Config) {
        let old_map: BTreeMap<&str, &ModuleConfig> =
            old.modules.iter().map(|m| (m.name.as_str(), m)).collect();
        let new_map: BTreeMap<&str, &ModuleConfig> =
            new.modules.iter().map(|m| (m.name.as_str(), m)).collect();

        let mut added: Vec<&ModuleConfig> = Vec::new();
        let mut removed: Vec<&ModuleConfig> = Vec::new();

        for (name, cfg) in &new_map {
            match old_map.get(name) {
                None => added.push(cfg),
                Some(prev) if !prev.same_binary(cfg) => self.modules_modified.push((*cfg).clone()),
                Some(_) => {}
            }
        }
        for (name, cfg) in &old_map {
            if !new_map.contains_key(name) {
                removed.push(cfg);
            }
        }

        // A removed and an added module with an identical binary is a rename.
        let mut used_added = vec![false; added.len()];
        for old_cfg in &removed {
            let matched = added
                .iter()
                .enumerate()
                .find(|(i, new_cfg)| !used_added[*i] && old_cfg.same_binary(new_cfg));
            if let Some((i, new_cfg)) = matched {
                used_added[i] = true;
                self.module_renames
                    .push((old_cfg.name.clone(), new_cfg.name.clone()));
            } else {
                self.modules_removed.push(old_cfg.name.clone());
            }
        }
        self.modules_added = added
            .into_iter()
            .enumerate()
            .filter(|(i, _)| !used_added[*i])
            .map(|(_, cfg)| cfg.clone())
            .collect();
    }

    fn diff_remotes(&mut self, old: &Config, new: &Config) {
        let old_map: BTreeMap<&str, &RemoteConfig> =
            old.remotes.iter().map(|r| (r.name.as_str(), r)).collect();
        let new_map: BTreeMap<&str, &RemoteConfig> =
            new.remotes.iter().map(|r| (r.name.as_str(), r)).collect();

        for (name, cfg) in &new_map {
            match old_map.get(name) {
                None => self.remotes_added.push((*cfg).clone()),
                Some(prev) if *prev != *cfg => self.remotes_modified.push((*cfg).clone()),
                Some(_) => {}
            }
        }
        for name in old_map.keys() {
            if !new_map.contains_key(name) {
                self.remotes_removed.push((*name).to_owned());
            }
        }
    }

    fn diff_processes(&mut self, old: &Config, new: &Config) {
        let old_map: BTreeMap<&str, &ProcessConfig> =
            old.processes.iter().map(|p| (p.id.as_str(), p)).collect();
        let new_map: BTreeMap<&str, &ProcessConfig> =
            new.processes.iter().map(|p| (p.id.as_str(), p)).collect();

        for (id, cfg) in &new_map {
            match old_map.get(id) {
                None => self.processes_added.push((*cfg).clone()),
                Some(prev) if *prev != *cfg => self.processes_modified.push((*cfg).clone()),
                Some(_) => {}
            }
        }
        for id in old_map.keys() {
            if !new_map.contains_key(id) {
                self.processes_removed.push((*id).to_owned());
            }
        }
    }
}

impl fmt::Display for ConfigDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "resources: {} added, {} modified, {} removed; \
             modules: {} added, {} modified, {} removed, {} renamed; \
             remotes: {} added, {} modified, {} removed; \
             processes: {} added, {} modified, {} removed",
            self.added.len(),
            self.modified.len(),
            self.removed.len(),
            self.modules_added.len(),
            self.modules_modified.len(),
            self.modules_removed.len(),
            self.module_renames.len(),
            self.remotes_added.len(),
            self.remotes_modified.len(),
            self.remotes_removed.len(),
            self.processes_added.len(),
            self.processes_modified.len(),
            self.processes_removed.len(),
        )
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::name::{Api, Model};
    use std::path::PathBuf;

    fn arm(name: &str) -> ResourceConfig {
        ResourceConfig::new(name, Api::component("arm"), Model::builtin("fake"))
    }

    fn module(name: &str, exec: &str) -> ModuleConfig {
        ModuleConfig {
            name: name.to_owned(),
            exec_path: PathBuf::from(exec),
            environment: std::collections::BTreeMap::new(),
            local_version: String::new(),
        }
    }

    #[test]
    fn identical_configs_diff_empty() {
        let config = Config {
            components: vec![arm("a")],
            modules: vec![module("mod", "/opt/testmod1")],
            ..Config::default()
        };
        assert!(ConfigDiff::new(&config, &config.clone()).is_empty());
    }

    #[test]
    fn classifies_added_modified_removed() {
        let old = Config {
            components: vec![arm("keep"), arm("change"), arm("drop")],
            ..Config::default()
        };
        let mut changed = arm("change");
        changed.attributes = serde_json::json!({"speed": 9});
        let new = Config {
            components: vec![arm("keep"), changed, arm("fresh")],
            ..Config::default()
        };
        let diff = ConfigDiff::new(&old, &new);
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.added[0].name, "fresh");
        assert_eq!(diff.modified.len(), 1);
        assert_eq!(diff.modified[0].name, "change");
        assert_eq!(diff.removed.len(), 1);
        assert_eq!(diff.removed[0].name, "drop");
    }

    #[test]
    fn module_rename_is_not_a_restart() {
        let old = Config {
            modules: vec![module("mod", "/opt/testmod1"), module("mod2", "/opt/testmod2")],
            ..Config::default()
        };
        let new = Config {
            modules: vec![module("mod1", "/opt/testmod1"), module("mod2", "/opt/testmod2")],
            ..Config::default()
        };
        let diff = ConfigDiff::new(&old, &new);
        assert_eq!(diff.module_renames, vec![("mod".to_owned(), "mod1".to_owned())]);
        assert!(diff.modules_added.is_empty());
        assert!(diff.modules_removed.is_empty());
    }

    #[test]
    fn changed_binary_is_modified_not_renamed() {
        let old = Config {
            modules: vec![module("mod", "/opt/testmod1")],
            ..Config::default()
        };
        let new = Config {
            modules: vec![module("mod", "/opt/testmod2")],
            ..Config::default()
        };
        let diff = ConfigDiff::new(&old, &new);
        assert_eq!(diff.modules_modified.len(), 1);
        assert!(diff.module_renames.is_empty());
    }

    #[test]
    fn collisions_are_reported_and_excluded() {
        let new = Config {
            components: vec![arm("dup"), arm("dup")],
            ..Config::default()
        };
        let diff = ConfigDiff::new(&Config::default(), &new);
        assert_eq!(diff.resource_collisions, vec!["dup".to_owned()]);
        assert!(diff.added.is_empty());
    }
}
