//! Pinned namespace handles.

use std::path::{Path, PathBuf};

use corral_common::{CorralError, CorralResult};
use parking_lot::Mutex;

use super::NsType;

/// A pinned kernel namespace.
///
/// The handle is shared through `Arc` by every container of a pod. It is
/// released explicitly with [`Namespace::remove`]; dropping it leaves the pin
/// in place.
#[derive(Debug)]
pub struct Namespace {
    ns_type: NsType,
    path: PathBuf,
    closed: Mutex<bool>,
}

impl Namespace {
    /// Open the pin at `path` after checking it refers to a namespace.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::Namespace`] if `path` is missing or is not a
    /// namespace file.
    pub fn open(ns_type: NsType, path: impl Into<PathBuf>) -> CorralResult<Self> {
        let path = path.into();
        validate(ns_type, &path)?;
        Ok(Self {
            ns_type,
            path,
            closed: Mutex::new(false),
        })
    }

    /// Namespace type.
    #[must_use]
    pub const fn ns_type(&self) -> NsType {
        self.ns_type
    }

    /// Pin path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether [`Namespace::remove`] has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }

    /// Weak view of this namespace.
    #[must_use]
    pub fn managed(&self) -> ManagedNamespace {
        ManagedNamespace {
            ns_type: self.ns_type,
            path: self.path.clone(),
        }
    }

    /// Unmount the pin and delete its file.
    ///
    /// Calling this more than once is a no-op. The handle is marked closed
    /// before the unmount, so a failed removal is not retried.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::Os`] if the unmount or the removal fails.
    pub fn remove(&self) -> CorralResult<()> {
        let mut closed = self.closed.lock();
        if *closed {
            return Ok(());
        }
        *closed = true;

        tracing::debug!(ns_type = %self.ns_type, path = %self.path.display(), "Removing namespace");
        unpin(&self.path)?;
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CorralError::os("remove namespace file", &self.path, e)),
        }
    }
}

/// Type and path of a namespace, without authority over its lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedNamespace {
    /// Namespace type.
    pub ns_type: NsType,
    /// Pin path; empty when the namespace is not pinned.
    pub path: PathBuf,
}

/// Whether `path` is the root of a mount, judged by a device change from its parent.
pub(crate) fn is_mount_point(path: &Path) -> CorralResult<bool> {
    use std::os::unix::fs::MetadataExt;

    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(CorralError::os("stat", path, e)),
    };
    let Some(parent) = path.parent() else {
        return Ok(true);
    };
    let parent_meta =
        std::fs::metadata(parent).map_err(|e| CorralError::os("stat", parent, e))?;
    Ok(meta.dev() != parent_meta.dev())
}

/// Lazily detach the mount at `path`; a path that is not mounted is fine.
#[cfg(target_os = "linux")]
pub(crate) fn unpin(path: &Path) -> CorralResult<()> {
    use rustix::io::Errno;
    use rustix::mount::{UnmountFlags, unmount};

    if !is_mount_point(path)? {
        return Ok(());
    }
    match unmount(path, UnmountFlags::DETACH) {
        Ok(()) | Err(Errno::INVAL) => Ok(()),
        Err(e) => Err(CorralError::os("unmount namespace", path, e)),
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn unpin(_path: &Path) -> CorralResult<()> {
    Err(CorralError::Unsupported {
        feature: "namespaces".to_string(),
    })
}

/// Check that `path` is a namespace file.
#[cfg(target_os = "linux")]
pub(crate) fn validate(ns_type: NsType, path: &Path) -> CorralResult<()> {
    use rustix::fs::{FsWord, PROC_SUPER_MAGIC, statfs};

    const NSFS_MAGIC: FsWord = 0x6e73_6673;

    let stat = statfs(path).map_err(|e| CorralError::Namespace {
        ns_type: ns_type.to_string(),
        path: path.to_path_buf(),
        message: format!("failed to stat namespace: {e}"),
    })?;
    if stat.f_type != NSFS_MAGIC && stat.f_type != PROC_SUPER_MAGIC {
        return Err(CorralError::Namespace {
            ns_type: ns_type.to_string(),
            path: path.to_path_buf(),
            message: "unknown filesystem type, not a namespace".to_string(),
        });
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn validate(_ns_type: NsType, _path: &Path) -> CorralResult<()> {
    Err(CorralError::Unsupported {
        feature: "namespaces".to_string(),
    })
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn pinned(dir: &Path, ns_type: NsType) -> Namespace {
        let path = dir.join(ns_type.dir_name());
        std::os::unix::fs::symlink(format!("/proc/self/ns/{ns_type}"), &path).unwrap();
        Namespace::open(ns_type, path).unwrap()
    }

    #[test]
    fn open_rejects_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain");
        std::fs::write(&path, b"").unwrap();
        let err = Namespace::open(NsType::Net, &path).unwrap_err();
        assert!(matches!(err, CorralError::Namespace { .. }));
    }

    #[test]
    fn open_rejects_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Namespace::open(NsType::Ipc, dir.path().join("missing")).is_err());
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let ns = pinned(dir.path(), NsType::Uts);
        assert!(!ns.is_closed());

        ns.remove().unwrap();
        assert!(ns.is_closed());
        assert!(!ns.path().exists());

        ns.remove().unwrap();
        ns.remove().unwrap();
        assert!(ns.is_closed());
    }

    #[test]
    fn concurrent_remove() {
        let dir = tempfile::tempdir().unwrap();
        let ns = Arc::new(pinned(dir.path(), NsType::Net));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ns = Arc::clone(&ns);
                std::thread::spawn(move || ns.remove())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }
        assert!(ns.is_closed());
        assert!(std::fs::symlink_metadata(ns.path()).is_err());
    }

    #[test]
    fn managed_view() {
        let dir = tempfile::tempdir().unwrap();
        let ns = pinned(dir.path(), NsType::Ipc);
        let view = ns.managed();
        assert_eq!(view.ns_type, NsType::Ipc);
        assert_eq!(view.path, ns.path());
    }

    #[test]
    fn plain_file_is_not_mount_point() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"").unwrap();
        assert!(!is_mount_point(&path).unwrap());
        assert!(!is_mount_point(&dir.path().join("missing")).unwrap());
    }
}
