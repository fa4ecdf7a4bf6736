//! Socket path derivation.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

/// Derive the Unix socket path a module listens on.
///
/// The path is a pure function of the module name so the host and the module
/// binary agree on it without passing it around. Names are sanitized and
/// suffixed with a hash of the original, which keeps distinct names distinct
/// and the whole path comfortably under the 108-byte `sockaddr_un` limit.
#[must_use]
pub fn module_socket_path(parent: &Path, module_name: &str) -> PathBuf {
    let mut hasher = DefaultHasher::new();
    module_name.hash(&mut hasher);
    let digest = hasher.finish();

    let sanitized: String = module_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .take(32)
        .collect();

    parent.join(format!("rigkit-mod-{sanitized}-{digest:016x}.sock"))
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn deterministic_and_distinct() {
        let dir = Path::new("/tmp");
        let a = module_socket_path(dir, "mod");
        let b = module_socket_path(dir, "mod");
        let c = module_socket_path(dir, "mod2");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn long_names_stay_bounded() {
        let dir = Path::new("/tmp");
        let long = "m".repeat(300);
        let path = module_socket_path(dir, &long);
        assert!(path.as_os_str().len() < 100);
    }

    #[test]
    fn awkward_characters_are_sanitized() {
        let dir = Path::new("/tmp");
        let path = module_socket_path(dir, "my module/v1");
        let file = path.file_name().unwrap().to_str().unwrap();
        assert!(!file.contains(' '));
        assert!(!file.contains('/'));
    }
}
