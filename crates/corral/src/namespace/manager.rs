//! Namespace manager.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use corral_common::{CorralError, CorralResult};

use super::handle::Namespace;
use super::pinner::{NamespacePinner, PinRequest, PinnsCommand};
use super::{NsType, PodNamespacesConfig};

/// Creates and pins the namespaces of pods.
///
/// Pins live under `<namespaces_dir>/<type>ns/`. Callers own the returned
/// handles and release them with [`Namespace::remove`].
#[derive(Debug, Clone)]
pub struct NamespaceManager {
    namespaces_dir: PathBuf,
    pinner: Arc<dyn NamespacePinner>,
}

impl NamespaceManager {
    /// Manager using the `pinns` helper at `pinns_path`.
    pub fn new(namespaces_dir: impl Into<PathBuf>, pinns_path: impl Into<PathBuf>) -> Self {
        Self::with_pinner(namespaces_dir, Arc::new(PinnsCommand::new(pinns_path)))
    }

    /// Manager using a custom pinning strategy.
    pub fn with_pinner(namespaces_dir: impl Into<PathBuf>, pinner: Arc<dyn NamespacePinner>) -> Self {
        Self {
            namespaces_dir: namespaces_dir.into(),
            pinner,
        }
    }

    /// Base directory of all pins.
    #[must_use]
    pub fn namespaces_dir(&self) -> &Path {
        &self.namespaces_dir
    }

    /// Directory holding pins of `ns_type`.
    #[must_use]
    pub fn dir_for_type(&self, ns_type: NsType) -> PathBuf {
        self.namespaces_dir.join(ns_type.dir_name())
    }

    /// Create the namespaces directory and one sub-directory per type.
    ///
    /// A non-directory in place of a sub-directory is removed first.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::Os`] if a directory cannot be inspected or created.
    #[cfg(target_os = "linux")]
    pub fn initialize(&self) -> CorralResult<()> {
        std::fs::create_dir_all(&self.namespaces_dir)
            .map_err(|e| CorralError::os("create namespaces dir", &self.namespaces_dir, e))?;

        for ns_type in NsType::ALL {
            let dir = self.dir_for_type(ns_type);
            match std::fs::metadata(&dir) {
                Ok(meta) if meta.is_dir() => continue,
                Ok(_) => {
                    std::fs::remove_file(&dir).map_err(|e| {
                        CorralError::os("remove file to create namespaces sub-dir", &dir, e)
                    })?;
                    tracing::info!(path = %dir.display(), "Removed file to create namespaces sub-dir");
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(CorralError::os("check namespaces sub-dir", &dir, e)),
            }
            std::fs::create_dir_all(&dir)
                .map_err(|e| CorralError::os("create namespaces sub-dir", &dir, e))?;
        }

        tracing::debug!(path = %self.namespaces_dir.display(), "Namespace directories ready");
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    pub fn initialize(&self) -> CorralResult<()> {
        Err(unsupported())
    }

    /// Create and pin the namespaces of one pod.
    ///
    /// Returns one handle per requested namespace, in request order, or none
    /// at all: every pin created along the way is removed on failure.
    ///
    /// # Errors
    ///
    /// - [`CorralError::Config`] if a requested type cannot be pinned by the helper
    /// - [`CorralError::Helper`] if the helper fails
    /// - [`CorralError::Namespace`] if a pin is not a namespace
    #[cfg(target_os = "linux")]
    pub fn new_pod_namespaces(
        &self,
        config: &PodNamespacesConfig,
    ) -> CorralResult<Vec<Arc<Namespace>>> {
        if config.namespaces.is_empty() {
            return Ok(Vec::new());
        }

        if let Some(ns) = config
            .namespaces
            .iter()
            .find(|ns| ns.ns_type.helper_flag().is_none())
        {
            return Err(CorralError::config(format!(
                "invalid namespace type: {}",
                ns.ns_type
            )));
        }

        let request = PinRequest {
            dir: self.namespaces_dir.clone(),
            batch_id: uuid::Uuid::new_v4().to_string(),
            namespaces: config.namespaces.clone(),
            sysctls: config.sysctls.clone(),
            id_mappings: config.id_mappings.clone(),
        };
        let pins: Vec<(NsType, PathBuf)> = request
            .namespaces
            .iter()
            .map(|ns| (ns.ns_type, request.pin_path(ns)))
            .collect();

        if let Some(mappings) = &request.id_mappings {
            let (uid, gid) = mappings.root_pair();
            for (_, path) in &pins {
                if let Err(e) = create_owned_pin(path, uid, gid) {
                    discard_pins(pins.iter().map(|(_, p)| p.as_path()));
                    return Err(e);
                }
            }
        }

        if let Err(e) = self.pinner.pin(&request) {
            tracing::warn!(error = %e, "Pinning namespaces failed");
            discard_pins(pins.iter().map(|(_, p)| p.as_path()));
            return Err(match e {
                helper @ CorralError::Helper { .. } => helper,
                other => CorralError::Helper {
                    args: request.args(),
                    output: other.to_string(),
                },
            });
        }

        let mut namespaces = Vec::with_capacity(pins.len());
        for (i, (ns_type, path)) in pins.iter().enumerate() {
            match Namespace::open(*ns_type, path) {
                Ok(ns) => namespaces.push(Arc::new(ns)),
                Err(e) => {
                    for ns in &namespaces {
                        if let Err(remove_err) = ns.remove() {
                            tracing::error!(
                                path = %ns.path().display(),
                                error = %remove_err,
                                "Failed to remove namespace after failed creation"
                            );
                        }
                    }
                    discard_pins(pins[i..].iter().map(|(_, p)| p.as_path()));
                    return Err(e);
                }
            }
        }

        tracing::info!(
            batch = %request.batch_id,
            count = namespaces.len(),
            "Pinned pod namespaces"
        );
        Ok(namespaces)
    }

    #[cfg(not(target_os = "linux"))]
    pub fn new_pod_namespaces(
        &self,
        _config: &PodNamespacesConfig,
    ) -> CorralResult<Vec<Arc<Namespace>>> {
        Err(unsupported())
    }

    /// Pin the namespace of `ns_type` that process `pid` is running in.
    ///
    /// # Errors
    ///
    /// - [`CorralError::Namespace`] if the process is gone or its entry is not a namespace
    /// - [`CorralError::Os`] if the pin file cannot be created or bind-mounted
    #[cfg(target_os = "linux")]
    pub fn namespace_from_proc_entry(&self, pid: u32, ns_type: NsType) -> CorralResult<Arc<Namespace>> {
        let pin = self
            .dir_for_type(ns_type)
            .join(uuid::Uuid::new_v4().to_string());
        std::fs::File::create(&pin).map_err(|e| CorralError::os("create namespace path", &pin, e))?;

        let result = bind_from_proc(pid, ns_type, &pin);
        if result.is_err() {
            if let Err(e) = super::handle::unpin(&pin) {
                tracing::error!(ns_type = %ns_type, error = %e, "Failed to unmount after failed pin");
            }
            if let Err(e) = std::fs::remove_file(&pin) {
                tracing::error!(path = %pin.display(), error = %e, "Failed to remove namespace after failed pin");
            }
        }
        result.map(Arc::new)
    }

    #[cfg(not(target_os = "linux"))]
    pub fn namespace_from_proc_entry(&self, _pid: u32, _ns_type: NsType) -> CorralResult<Arc<Namespace>> {
        Err(unsupported())
    }
}

/// `/proc/<pid>/ns/<type>` if it exists and is a namespace.
#[must_use]
pub fn namespace_path_from_proc(ns_type: NsType, pid: u32) -> Option<PathBuf> {
    let path = PathBuf::from(format!("/proc/{pid}/ns/{ns_type}"));
    if !path.exists() {
        return None;
    }
    super::handle::validate(ns_type, &path).ok()?;
    Some(path)
}

#[cfg(target_os = "linux")]
fn bind_from_proc(pid: u32, ns_type: NsType, pin: &Path) -> CorralResult<Namespace> {
    let Some(proc_path) = namespace_path_from_proc(ns_type, pid) else {
        return Err(CorralError::Namespace {
            ns_type: ns_type.to_string(),
            path: pin.to_path_buf(),
            message: format!("proc entry for pid {pid} is gone; pid not created or stopped"),
        });
    };

    rustix::mount::mount_bind(&proc_path, pin)
        .map_err(|e| CorralError::os("bind mount namespace", pin, e))?;
    tracing::debug!(
        source = %proc_path.display(),
        path = %pin.display(),
        "Bind mounted namespace from proc entry"
    );

    Namespace::open(ns_type, pin)
}

#[cfg(target_os = "linux")]
fn create_owned_pin(path: &Path, uid: u32, gid: u32) -> CorralResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| CorralError::os("create namespaces sub-dir", parent, e))?;
    }
    std::fs::File::create(path).map_err(|e| CorralError::os("create namespace path", path, e))?;
    std::os::unix::fs::chown(path, Some(uid), Some(gid))
        .map_err(|e| CorralError::os("chown namespace path", path, e))
}

/// Best-effort unmount and removal of pins that never became handles.
#[cfg(target_os = "linux")]
fn discard_pins<'a>(paths: impl Iterator<Item = &'a Path>) {
    for path in paths {
        if let Err(e) = super::handle::unpin(path) {
            tracing::warn!(path = %path.display(), error = %e, "Failed to unmount");
        }
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove pin"),
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn unsupported() -> CorralError {
    CorralError::Unsupported {
        feature: "namespaces".to_string(),
    }
}
