//! Builtin fake models.
//!
//! Hardware-free implementations constructible on any machine: a fake
//! component usable under every component API, and a collector service that
//! tracks every component in the graph through weak dependencies. Both count
//! configuration applications so tests and operators can observe
//! reconfigures.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::config::ResourceConfig;
use crate::errors::ResourceError;
use crate::name::{Api, Model, ResourceName};
use crate::registry::{DependencyMatcher, RegistryBuilder};
use crate::resource::{Dependencies, ReconfigureOutcome, Resource};

/// Component APIs the fake model registers under.
pub const FAKE_COMPONENT_SUBTYPES: &[&str] = &[
    "arm", "base", "board", "camera", "generic", "gripper", "motor", "sensor",
];

/// API of the collector service.
#[must_use]
pub fn collector_api() -> Api {
    Api::service("datasync")
}

struct FakeState {
    attributes: serde_json::Value,
    reconfigurations: u64,
}

/// A do-nothing component. Echoes commands and reports how many times it has
/// been configured (construction counts as the first).
pub struct FakeComponent {
    name: ResourceName,
    state: Mutex<FakeState>,
}

impl FakeComponent {
    #[must_use]
    pub fn new(config: &ResourceConfig) -> Self {
        Self {
            name: config.resource_name(),
            state: Mutex::new(FakeState {
                attributes: config.attributes.clone(),
                reconfigurations: 1,
            }),
        }
    }
}

fn command_name(command: &serde_json::Value) -> Option<&str> {
    command
        .as_str()
        .or_else(|| command.get("command").and_then(serde_json::Value::as_str))
}

#[async_trait]
impl Resource for FakeComponent {
    async fn reconfigure(
        &self,
        config: &ResourceConfig,
        _deps: &Dependencies,
    ) -> Result<ReconfigureOutcome, ResourceError> {
        let mut state = self.state.lock();
        state.attributes = config.attributes.clone();
        state.reconfigurations += 1;
        Ok(ReconfigureOutcome::Reconfigured)
    }

    async fn do_command(
        &self,
        command: serde_json::Value,
    ) -> Result<serde_json::Value, ResourceError> {
        let cmd = command_name(&command);
        match cmd {
            Some("get_num_reconfigurations") => Ok(serde_json::json!({
                "num_reconfigurations": self.state.lock().reconfigurations,
            })),
            Some("get_attributes") => Ok(self.state.lock().attributes.clone()),
            _ => {
                tracing::trace!(resource = %self.name, "echoing command");
                Ok(command)
            }
        }
    }
}

struct CollectorState {
    reconfigurations: u64,
    observed: BTreeSet<ResourceName>,
}

/// Service that lazily depends on every component, the way a data collector
/// sniffs capture sources. Exists chiefly to exercise weak dependencies.
pub struct CollectorService {
    state: Mutex<CollectorState>,
}

impl CollectorService {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CollectorState {
                reconfigurations: 1,
                observed: BTreeSet::new(),
            }),
        }
    }
}

impl Default for CollectorService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Resource for CollectorService {
    async fn reconfigure(
        &self,
        _config: &ResourceConfig,
        deps: &Dependencies,
    ) -> Result<ReconfigureOutcome, ResourceError> {
        let mut state = self.state.lock();
        state.reconfigurations += 1;
        state.observed = deps
            .keys()
            .filter(|n| n.api.is_component())
            .cloned()
            .collect();
        Ok(ReconfigureOutcome::Reconfigured)
    }

    async fn do_command(
        &self,
        command: serde_json::Value,
    ) -> Result<serde_json::Value, ResourceError> {
        let cmd = command_name(&command);
        let state = self.state.lock();
        match cmd {
            Some("get_num_reconfigurations") => Ok(serde_json::json!({
                "num_reconfigurations": state.reconfigurations,
            })),
            Some("get_observed") => Ok(serde_json::json!({
                "observed": state.observed.iter().map(ToString::to_string).collect::<Vec<_>>(),
            })),
            _ => Ok(command),
        }
    }
}

/// Register the builtin models. Called once at daemon start.
pub fn register_builtins(builder: &mut RegistryBuilder) {
    for subtype in FAKE_COMPONENT_SUBTYPES {
        builder.register(
            Api::component(subtype),
            Model::builtin("fake"),
            Arc::new(|config: &ResourceConfig, _deps: &Dependencies| {
                Ok(Arc::new(FakeComponent::new(config)) as Arc<dyn Resource>)
            }),
        );
    }
    builder.register_with_weak_deps(
        collector_api(),
        Model::builtin("collector"),
        Arc::new(|_config: &ResourceConfig, _deps: &Dependencies| {
            Ok(Arc::new(CollectorService::new()) as Arc<dyn Resource>)
        }),
        vec![DependencyMatcher::EveryComponent],
    );
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn arm_config(name: &str) -> ResourceConfig {
        ResourceConfig::new(name, Api::component("arm"), Model::builtin("fake"))
    }

    #[tokio::test]
    async fn fake_component_counts_configurations() {
        let config = arm_config("arm1");
        let fake = FakeComponent::new(&config);
        let reply = fake
            .do_command(serde_json::json!("get_num_reconfigurations"))
            .await
            .unwrap();
        assert_eq!(reply["num_reconfigurations"], 1);

        fake.reconfigure(&config, &Dependencies::new()).await.unwrap();
        let reply = fake
            .do_command(serde_json::json!({"command": "get_num_reconfigurations"}))
            .await
            .unwrap();
        assert_eq!(reply["num_reconfigurations"], 2);
    }

    #[tokio::test]
    async fn fake_component_echoes_unknown_commands() {
        let fake = FakeComponent::new(&arm_config("arm1"));
        let cmd = serde_json::json!({"command": "echo"});
        assert_eq!(fake.do_command(cmd.clone()).await.unwrap(), cmd);
    }

    #[tokio::test]
    async fn collector_observes_component_deps_only() {
        let collector = CollectorService::new();
        let mut deps = Dependencies::new();
        let arm = ResourceName::new(Api::component("arm"), "arm1");
        let svc = ResourceName::new(Api::service("datasync"), "other");
        deps.insert(
            arm.clone(),
            Arc::new(FakeComponent::new(&arm_config("arm1"))) as Arc<dyn Resource>,
        );
        deps.insert(
            svc,
            Arc::new(CollectorService::new()) as Arc<dyn Resource>,
        );
        collector
            .reconfigure(&arm_config("ignored"), &deps)
            .await
            .unwrap();
        let reply = collector
            .do_command(serde_json::json!("get_observed"))
            .await
            .unwrap();
        assert_eq!(reply["observed"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn registry_builds_with_builtins() {
        let mut builder = RegistryBuilder::default();
        register_builtins(&mut builder);
        let registry = builder.build().unwrap();
        assert!(
            registry
                .lookup(&Api::component("arm"), &Model::builtin("fake"))
                .is_some()
        );
        assert_eq!(registry.weak_registrations().count(), 1);
    }
}
