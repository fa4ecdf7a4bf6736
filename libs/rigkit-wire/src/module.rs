//! Messages exchanged between the host and an out-of-process module.
//!
//! The host opens the module's Unix socket and drives a simple request/reply
//! protocol. The first exchange is always `Ready`/`Ready`: the module reports
//! the models it serves, and only then does the host route resource traffic
//! to it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A model identifier in `namespace:family:name` (or shorter) string form.
pub type WireModel = String;

/// A fully qualified resource name in string form.
pub type WireResourceName = String;

/// Resource configuration as it crosses the process boundary.
///
/// Attributes travel as raw JSON; the module is responsible for decoding them
/// against its own schema. `depends_on` carries fully qualified names that
/// were already resolved by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireResourceConfig {
    pub name: WireResourceName,
    pub api: String,
    pub model: WireModel,
    #[serde(default)]
    pub attributes: serde_json::Value,
    #[serde(default)]
    pub depends_on: Vec<WireResourceName>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModuleRequest {
    /// Handshake. Sent once per connection before anything else.
    Ready,
    /// Ask the module to validate a config. The reply may name implicit
    /// dependencies the host must provide at construction time.
    Validate { config: WireResourceConfig },
    /// Construct a resource. `deps` maps each fully qualified dependency name
    /// to the address the module can reach it at (empty for host-brokered
    /// dependencies).
    AddResource {
        config: WireResourceConfig,
        deps: BTreeMap<WireResourceName, String>,
    },
    /// Reconfigure an existing resource in place.
    ReconfigureResource {
        config: WireResourceConfig,
        deps: BTreeMap<WireResourceName, String>,
    },
    /// Tear down a resource the module serves.
    RemoveResource { name: WireResourceName },
    /// Forward an operator command to a resource.
    DoCommand {
        name: WireResourceName,
        command: serde_json::Value,
    },
    /// Graceful stop. The module should exit after replying.
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModuleResponse {
    Ready { served_models: Vec<WireModel> },
    Validated { implicit_deps: Vec<WireResourceName> },
    Added,
    Reconfigured { rebuild_required: bool },
    Removed,
    CommandResult { result: serde_json::Value },
    ShuttingDown,
    Error { message: String },
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn request_tag_is_stable() {
        let req = ModuleRequest::Validate {
            config: WireResourceConfig {
                name: "rig:component:arm/arm1".to_owned(),
                api: "rig:component:arm".to_owned(),
                model: "acme:helper".to_owned(),
                attributes: serde_json::json!({"speed": 3}),
                depends_on: vec![],
            },
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["type"], "validate");
        assert_eq!(json["config"]["model"], "acme:helper");
    }

    #[test]
    fn missing_optional_fields_default() {
        let cfg: WireResourceConfig = serde_json::from_value(serde_json::json!({
            "name": "rig:component:arm/arm1",
            "api": "rig:component:arm",
            "model": "fake",
        }))
        .unwrap();
        assert!(cfg.depends_on.is_empty());
        assert!(cfg.attributes.is_null());
    }
}
