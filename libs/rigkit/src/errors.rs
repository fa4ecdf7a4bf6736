//! The typed error surface callers of the resource manager see.

use thiserror::Error;

/// Errors surfaced by graph lookups, construction, and reconfiguration.
///
/// The engine treats `Transport`, `Validation`, and `DependencyNotReady` as
/// transient (the completion worker retries them); `Cycle`, `Unresolved`, and
/// `Ambiguous` stick until the configuration changes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceError {
    #[error("resource \"{0}\" not found")]
    NotFound(String),

    #[error("dependency \"{dependency}\" of \"{dependent}\" could not be resolved")]
    Unresolved { dependent: String, dependency: String },

    #[error("dependency \"{dependency}\" of \"{dependent}\" matches more than one resource")]
    Ambiguous { dependent: String, dependency: String },

    #[error("dependency \"{dependency}\" of \"{dependent}\" is not ready")]
    DependencyNotReady { dependent: String, dependency: String },

    #[error("rpc error: {0}")]
    Transport(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("circular dependency involving \"{0}\"")]
    Cycle(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl ResourceError {
    /// Whether the completion worker should keep retrying the node that
    /// carries this error without a configuration change.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ResourceError::Transport(_)
                | ResourceError::Validation(_)
                | ResourceError::DependencyNotReady { .. }
        )
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_render_as_rpc_errors() {
        let err = ResourceError::Transport("module \"mod\" is not running".to_owned());
        assert!(err.to_string().contains("rpc error"));
    }

    #[test]
    fn transience_classification() {
        assert!(
            ResourceError::DependencyNotReady {
                dependent: "a".to_owned(),
                dependency: "b".to_owned(),
            }
            .is_transient()
        );
        assert!(!ResourceError::Cycle("a".to_owned()).is_transient());
        assert!(
            !ResourceError::Ambiguous {
                dependent: "a".to_owned(),
                dependency: "arm".to_owned(),
            }
            .is_transient()
        );
    }
}
