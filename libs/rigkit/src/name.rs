//! Resource names, APIs, and models.
//!
//! A [`ResourceName`] is the sole primary key in the resource graph. It scopes
//! a short name by the API triple that classifies the resource and by the
//! path of remotes it was mirrored through (empty for local resources).

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::errors::ResourceError;

/// Default namespace for APIs and builtin models.
pub const DEFAULT_NAMESPACE: &str = "rig";

/// The triple identifying a kind of resource: `namespace:kind:subtype`,
/// e.g. `rig:component:arm`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Api {
    pub namespace: String,
    pub kind: String,
    pub subtype: String,
}

impl Api {
    #[must_use]
    pub fn new(namespace: &str, kind: &str, subtype: &str) -> Self {
        Self {
            namespace: namespace.to_owned(),
            kind: kind.to_owned(),
            subtype: subtype.to_owned(),
        }
    }

    /// A component API in the default namespace, e.g. `component("arm")`.
    #[must_use]
    pub fn component(subtype: &str) -> Self {
        Self::new(DEFAULT_NAMESPACE, "component", subtype)
    }

    /// A service API in the default namespace.
    #[must_use]
    pub fn service(subtype: &str) -> Self {
        Self::new(DEFAULT_NAMESPACE, "service", subtype)
    }

    #[must_use]
    pub fn is_component(&self) -> bool {
        self.kind == "component"
    }
}

impl fmt::Display for Api {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.namespace, self.kind, self.subtype)
    }
}

impl FromStr for Api {
    type Err = ResourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [ns, kind, subtype] if !ns.is_empty() && !kind.is_empty() && !subtype.is_empty() => {
                Ok(Self::new(ns, kind, subtype))
            }
            _ => Err(ResourceError::Validation(format!(
                "\"{s}\" is not a valid api; expected namespace:kind:subtype"
            ))),
        }
    }
}

impl Serialize for Api {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Api {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// The triple identifying a concrete implementation of an API.
///
/// Written `namespace:family:name` in full. Two shorthand forms are accepted
/// in configs: a bare `name` resolves to `rig:builtin:name`, and a two-part
/// `provider:name` names a model served by the module `provider`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Model {
    pub namespace: String,
    pub family: String,
    pub name: String,
}

impl Model {
    #[must_use]
    pub fn new(namespace: &str, family: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_owned(),
            family: family.to_owned(),
            name: name.to_owned(),
        }
    }

    /// A builtin model in the default namespace.
    #[must_use]
    pub fn builtin(name: &str) -> Self {
        Self::new(DEFAULT_NAMESPACE, "builtin", name)
    }

    #[must_use]
    pub fn is_builtin(&self) -> bool {
        self.namespace == DEFAULT_NAMESPACE && self.family == "builtin"
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.family.is_empty() {
            write!(f, "{}:{}", self.namespace, self.name)
        } else {
            write!(f, "{}:{}:{}", self.namespace, self.family, self.name)
        }
    }
}

impl FromStr for Model {
    type Err = ResourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(ResourceError::Validation(format!(
                "\"{s}\" is not a valid model"
            )));
        }
        match parts.as_slice() {
            [name] => Ok(Self::builtin(name)),
            [provider, name] => Ok(Self {
                namespace: (*provider).to_owned(),
                family: String::new(),
                name: (*name).to_owned(),
            }),
            [ns, family, name] => Ok(Self::new(ns, family, name)),
            _ => Err(ResourceError::Validation(format!(
                "\"{s}\" is not a valid model"
            ))),
        }
    }
}

impl Serialize for Model {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Model {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// A fully qualified resource name.
///
/// Renders as `api/name` for local resources and `api/remote1:remote2:name`
/// for mirrored ones. Ordering is derived (api, then remote path, then name)
/// and is what every deterministic graph query sorts by.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceName {
    pub api: Api,
    pub remote_path: Vec<String>,
    pub name: String,
}

impl ResourceName {
    #[must_use]
    pub fn new(api: Api, name: &str) -> Self {
        Self {
            api,
            remote_path: Vec::new(),
            name: name.to_owned(),
        }
    }

    #[must_use]
    pub fn is_local(&self) -> bool {
        self.remote_path.is_empty()
    }

    /// The name as seen through a remote: the remote's name is prepended to
    /// the path and the optional mirror prefix to the short name.
    #[must_use]
    pub fn mirrored_through(&self, remote: &str, prefix: Option<&str>) -> Self {
        let mut remote_path = Vec::with_capacity(self.remote_path.len() + 1);
        remote_path.push(remote.to_owned());
        remote_path.extend(self.remote_path.iter().cloned());
        let name = match prefix {
            Some(p) => format!("{p}{}", self.name),
            None => self.name.clone(),
        };
        Self {
            api: self.api.clone(),
            remote_path,
            name,
        }
    }

    /// The remote-path-scoped short form, e.g. `foo:remoteArm` or `arm1`.
    #[must_use]
    pub fn short_string(&self) -> String {
        if self.remote_path.is_empty() {
            self.name.clone()
        } else {
            format!("{}:{}", self.remote_path.join(":"), self.name)
        }
    }

    /// Whether a `depends_on` entry refers to this name.
    ///
    /// Full strings (containing `/`) must match exactly; `remote:name` forms
    /// match the short string; bare names match the short name regardless of
    /// remote path.
    #[must_use]
    pub fn matches_dependency(&self, dep: &str) -> bool {
        if dep.contains('/') {
            self.to_string() == dep
        } else if dep.contains(':') {
            self.short_string() == dep
        } else {
            self.name == dep
        }
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api, self.short_string())
    }
}

impl FromStr for ResourceName {
    type Err = ResourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((api_str, rest)) = s.split_once('/') else {
            return Err(ResourceError::Validation(format!(
                "\"{s}\" is not a fully qualified resource name"
            )));
        };
        let api: Api = api_str.parse()?;
        let mut parts: Vec<&str> = rest.split(':').collect();
        let Some(name) = parts.pop().filter(|n| !n.is_empty()) else {
            return Err(ResourceError::Validation(format!(
                "\"{s}\" has an empty resource name"
            )));
        };
        if parts.iter().any(|p| p.is_empty()) {
            return Err(ResourceError::Validation(format!(
                "\"{s}\" has an empty remote path segment"
            )));
        }
        Ok(Self {
            api,
            remote_path: parts.into_iter().map(str::to_owned).collect(),
            name: name.to_owned(),
        })
    }
}

impl Serialize for ResourceName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ResourceName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}
