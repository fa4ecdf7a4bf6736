//! rigkit — the resource-manager core of the rig runtime.
//!
//! A robot is a live, declaratively-configured graph of heterogeneous
//! resources: components, services, child processes, out-of-process modules,
//! and remote robots whose resources are mirrored locally. This crate owns
//! that graph and everything that reshapes it:
//!
//! - [`graph`] — the dependency graph with deterministic orderings,
//! - [`reconfigure`] — the diff → build → commit-or-rollback engine,
//! - [`module`] — the out-of-process module supervisor,
//! - [`remote`] — the remote-robot mirroring loop,
//! - [`worker`] — the background retry/recovery loop,
//! - [`manager`] — the facade tying them together.
//!
//! The wire protocol those modules and remotes speak lives in `rigkit-wire`;
//! the daemon wiring (config files, logging, signals) lives in `rigd`.

pub mod builtin;
pub mod config;
pub mod errors;
pub mod graph;
pub mod manager;
pub mod module;
pub mod name;
pub mod process;
pub mod reconfigure;
pub mod registry;
pub mod remote;
pub mod resource;
pub mod worker;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_support;

pub use config::{
    AssociatedResourceConfig, Config, ModuleConfig, ProcessConfig, RemoteAuth, RemoteConfig,
    ResourceConfig,
};
pub use errors::ResourceError;
pub use manager::{ManagerOptions, ResourceManager, ResourceStatus};
pub use name::{Api, Model, ResourceName};
pub use resource::{Dependencies, ReconfigureOutcome, Resource};
