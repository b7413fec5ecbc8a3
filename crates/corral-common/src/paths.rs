//! Standard filesystem paths for Corral.

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Default root directory for Corral data.
pub static CORRAL_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("CORRAL_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/corral"))
});

/// Default runtime directory for Corral.
pub static CORRAL_RUNTIME_DIR: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("CORRAL_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/run/corral"))
});

/// Default location of the namespace pinning helper.
pub const DEFAULT_PINNS_PATH: &str = "/usr/bin/pinns";

/// Default subscription mounts file.
pub const DEFAULT_MOUNTS_FILE: &str = "/usr/share/containers/mounts.conf";

/// Standard paths used by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorralPaths {
    /// Root data directory (default: /var/lib/corral).
    pub root: PathBuf,
    /// Runtime directory (default: /run/corral).
    pub runtime: PathBuf,
}

impl CorralPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom root directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let runtime = root.join("run");
        Self { root, runtime }
    }

    /// Directory holding pinned namespaces, one sub-directory per type.
    #[must_use]
    pub fn namespaces(&self) -> PathBuf {
        self.runtime.join("ns")
    }

    /// Container storage root; bind sources above it get host-to-container propagation.
    #[must_use]
    pub fn storage(&self) -> PathBuf {
        self.root.join("storage")
    }

    /// Per-container runtime directory.
    #[must_use]
    pub fn container_run_dir(&self, id: &str) -> PathBuf {
        self.runtime.join("containers").join(id)
    }

    /// Default CDI spec directories.
    #[must_use]
    pub fn cdi_spec_dirs() -> Vec<PathBuf> {
        vec![PathBuf::from("/etc/cdi"), PathBuf::from("/var/run/cdi")]
    }
}

impl Default for CorralPaths {
    fn default() -> Self {
        Self {
            root: CORRAL_ROOT.clone(),
            runtime: CORRAL_RUNTIME_DIR.clone(),
        }
    }
}
