//! Constructor registry for builtin models.
//!
//! The registry is populated once during program start through
//! [`RegistryBuilder`] and is read-only afterwards; modules contribute their
//! models through the supervisor handshake, never through this registry.

use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use crate::config::ResourceConfig;
use crate::errors::ResourceError;
use crate::name::{Api, Model, ResourceName};
use crate::resource::{Dependencies, Resource};

/// Builds a resource handle from its config and resolved dependencies.
pub type Constructor = Arc<
    dyn Fn(&ResourceConfig, &Dependencies) -> Result<Arc<dyn Resource>, ResourceError>
        + Send
        + Sync,
>;

/// Predicate over resource names used for lazily resolved weak dependencies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyMatcher {
    /// Every component in the graph, whatever its API.
    EveryComponent,
    /// Every resource of one API.
    Api(Api),
}

impl DependencyMatcher {
    #[must_use]
    pub fn matches(&self, name: &ResourceName) -> bool {
        match self {
            DependencyMatcher::EveryComponent => name.api.is_component(),
            DependencyMatcher::Api(api) => &name.api == api,
        }
    }
}

/// One registered builtin model.
pub struct Registration {
    pub api: Api,
    pub model: Model,
    pub constructor: Constructor,
    /// Matchers resolved lazily after initial construction; matched nodes
    /// cause one extra reconfigure pass at end-of-commit.
    pub weak_dependencies: Vec<DependencyMatcher>,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("api", &self.api)
            .field("model", &self.model)
            .field("weak_dependencies", &self.weak_dependencies)
            .finish_non_exhaustive()
    }
}

/// Structured errors for registry construction.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("model '{0}' is already registered for this api")]
    Duplicate(String),
    #[error("invalid registry configuration:\n{errors:#?}")]
    InvalidConfiguration { errors: Vec<String> },
}

/// Builder fed during program start; uniqueness enforced at build time.
#[derive(Default)]
pub struct RegistryBuilder {
    entries: BTreeMap<(String, String), Registration>,
    errors: Vec<String>,
}

impl RegistryBuilder {
    pub fn register(&mut self, api: Api, model: Model, constructor: Constructor) {
        self.register_with_weak_deps(api, model, constructor, Vec::new());
    }

    pub fn register_with_weak_deps(
        &mut self,
        api: Api,
        model: Model,
        constructor: Constructor,
        weak_dependencies: Vec<DependencyMatcher>,
    ) {
        let key = (api.to_string(), model.to_string());
        if self.entries.contains_key(&key) {
            self.errors.push(format!(
                "model '{}' is already registered for api '{}'",
                key.1, key.0
            ));
            return;
        }
        self.entries.insert(
            key,
            Registration {
                api,
                model,
                constructor,
                weak_dependencies,
            },
        );
    }

    /// Finalize into the read-only registry.
    ///
    /// # Errors
    /// Returns `RegistryError::InvalidConfiguration` when any registration
    /// collided.
    pub fn build(self) -> Result<ConstructorRegistry, RegistryError> {
        if !self.errors.is_empty() {
            return Err(RegistryError::InvalidConfiguration {
                errors: self.errors,
            });
        }
        tracing::debug!(models = self.entries.len(), "constructor registry built");
        Ok(ConstructorRegistry {
            entries: self.entries,
        })
    }
}

/// The read-only `(api, model) → Constructor` map.
#[derive(Default)]
pub struct ConstructorRegistry {
    entries: BTreeMap<(String, String), Registration>,
}

impl ConstructorRegistry {
    #[must_use]
    pub fn lookup(&self, api: &Api, model: &Model) -> Option<&Registration> {
        self.entries.get(&(api.to_string(), model.to_string()))
    }

    /// Registrations that declared weak dependencies, in deterministic order.
    pub fn weak_registrations(&self) -> impl Iterator<Item = &Registration> {
        self.entries
            .values()
            .filter(|r| !r.weak_dependencies.is_empty())
    }
}

impl std::fmt::Debug for ConstructorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<&(String, String)> = self.entries.keys().collect();
        f.debug_struct("ConstructorRegistry")
            .field("entries", &keys)
            .finish()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::resource::ReconfigureOutcome;
    use async_trait::async_trait;

    struct Nop;
    #[async_trait]
    impl Resource for Nop {
        async fn do_command(
            &self,
            command: serde_json::Value,
        ) -> Result<serde_json::Value, ResourceError> {
            Ok(command)
        }
    }

    fn nop_constructor() -> Constructor {
        Arc::new(|_: &ResourceConfig, _: &Dependencies| Ok(Arc::new(Nop) as Arc<dyn Resource>))
    }

    #[test]
    fn lookup_finds_registered_model() {
        let mut b = RegistryBuilder::default();
        b.register(Api::component("arm"), Model::builtin("fake"), nop_constructor());
        let registry = b.build().unwrap();
        assert!(
            registry
                .lookup(&Api::component("arm"), &Model::builtin("fake"))
                .is_some()
        );
        assert!(
            registry
                .lookup(&Api::component("base"), &Model::builtin("fake"))
                .is_none()
        );
    }

    #[test]
    fn duplicate_registration_fails_at_build() {
        let mut b = RegistryBuilder::default();
        b.register(Api::component("arm"), Model::builtin("fake"), nop_constructor());
        b.register(Api::component("arm"), Model::builtin("fake"), nop_constructor());
        let err = b.build().unwrap_err();
        match err {
            RegistryError::InvalidConfiguration { errors } => {
                assert!(errors.iter().any(|e| e.contains("already registered")));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn matcher_every_component_skips_services() {
        let m = DependencyMatcher::EveryComponent;
        assert!(m.matches(&ResourceName::new(Api::component("arm"), "a")));
        assert!(!m.matches(&ResourceName::new(Api::service("telemetry"), "t")));
    }

    #[tokio::test]
    async fn default_reconfigure_requests_rebuild() {
        let handle: Arc<dyn Resource> = Arc::new(Nop);
        let cfg = ResourceConfig::new("a", Api::component("arm"), Model::builtin("fake"));
        let outcome = handle
            .reconfigure(&cfg, &Dependencies::new())
            .await
            .unwrap();
        assert_eq!(outcome, ReconfigureOutcome::NeedsRebuild);
    }
}
