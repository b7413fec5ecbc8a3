//! Device nodes on the host.

use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use corral_common::{CorralError, CorralResult};
use oci_spec::runtime::{LinuxDevice, LinuxDeviceCgroup, LinuxDeviceType};

/// Directories under the device root never passed through.
const SKIPPED_DIRS: &[&str] = &["pts", "shm", "fd", "mqueue", ".lxc", ".lxd-mounts", ".udev"];

/// A device node found on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostDevice {
    /// Path of the node.
    pub path: PathBuf,
    /// Node type.
    pub device_type: LinuxDeviceType,
    /// Major number.
    pub major: i64,
    /// Minor number.
    pub minor: i64,
    /// Permission bits.
    pub file_mode: u32,
    /// Owner.
    pub uid: u32,
    /// Group.
    pub gid: u32,
}

impl HostDevice {
    /// Spec node for this device at `path` in the container, owned by
    /// `uid`:`gid`.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::Spec`] if the node cannot be built.
    pub fn spec_device(&self, path: impl Into<PathBuf>, uid: u32, gid: u32) -> CorralResult<LinuxDevice> {
        corral_oci::device(
            path,
            self.device_type,
            self.major,
            self.minor,
            Some(self.file_mode),
            Some(uid),
            Some(gid),
        )
    }

    /// Cgroup rule granting `access` to this device.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::Spec`] if the rule cannot be built.
    pub fn allow_rule(&self, access: &str) -> CorralResult<LinuxDeviceCgroup> {
        corral_oci::allow_rule(self.device_type, self.major, self.minor, access)
    }
}

/// Why a path could not be read as a device.
#[derive(Debug)]
pub enum NotADevice {
    /// The path exists but is not a device node.
    WrongType,
    /// The path could not be inspected.
    Io(std::io::Error),
}

/// Inspect `path` without following a final symlink.
///
/// # Errors
///
/// Returns [`NotADevice::WrongType`] for anything but a character, block or
/// FIFO node, and [`NotADevice::Io`] if the path cannot be inspected.
pub fn device_from_path(path: &Path) -> Result<HostDevice, NotADevice> {
    let meta = std::fs::symlink_metadata(path).map_err(NotADevice::Io)?;
    let file_type = meta.file_type();
    let device_type = if file_type.is_char_device() {
        LinuxDeviceType::C
    } else if file_type.is_block_device() {
        LinuxDeviceType::B
    } else if file_type.is_fifo() {
        LinuxDeviceType::P
    } else {
        return Err(NotADevice::WrongType);
    };

    let rdev = meta.rdev();
    Ok(HostDevice {
        path: path.to_path_buf(),
        device_type,
        major: i64::from(rustix::fs::major(rdev)),
        minor: i64::from(rustix::fs::minor(rdev)),
        file_mode: meta.mode() & 0o7777,
        uid: meta.uid(),
        gid: meta.gid(),
    })
}

/// Every device node below `root`, skipping pseudo-terminal, shared memory,
/// fd and message queue directories and the console.
///
/// # Errors
///
/// Returns [`CorralError::Os`] if `root` itself cannot be read.
pub fn host_devices(root: &Path) -> CorralResult<Vec<HostDevice>> {
    let mut devices = Vec::new();
    let walker = walkdir::WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            if entry.file_type().is_dir() {
                !SKIPPED_DIRS.contains(&name.as_ref())
            } else {
                name != "console"
            }
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.depth() == 0 => {
                return Err(CorralError::os("read devices", root, std::io::Error::from(e)));
            }
            Err(e) => {
                tracing::debug!(error = %e, "Skipping unreadable device entry");
                continue;
            }
        };
        if entry.file_type().is_dir() {
            continue;
        }
        match device_from_path(entry.path()) {
            Ok(device) => devices.push(device),
            Err(NotADevice::WrongType) => {}
            Err(NotADevice::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(NotADevice::Io(e)) => {
                return Err(CorralError::os("stat device", entry.path(), e));
            }
        }
    }
    Ok(devices)
}
