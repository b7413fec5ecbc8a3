//! Device strings: `src[:dst][:perms]`.
//!
//! Used for the operator's additional devices and the pod devices
//! annotation.

use std::path::{Path, PathBuf};

use corral_common::{CorralError, CorralResult};
use oci_spec::runtime::{LinuxDevice, LinuxDeviceCgroup};

use super::host::{NotADevice, device_from_path};
use crate::mounts::clean_path;

/// Pod annotation listing extra devices, comma separated.
pub const DEVICES_ANNOTATION: &str = "io.kubernetes.cri-o.Devices";

const DEFAULT_PERMISSIONS: &str = "rwm";

/// Whether `mode` is a non-empty combination of `r`, `w` and `m` without
/// repeats.
#[must_use]
pub fn is_valid_device_mode(mode: &str) -> bool {
    let mut seen = [false; 3];
    !mode.is_empty()
        && mode.chars().all(|c| {
            let slot = match c {
                'r' => 0,
                'w' => 1,
                'm' => 2,
                _ => return false,
            };
            !std::mem::replace(&mut seen[slot], true)
        })
}

/// A parsed device string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSpec {
    /// Host path.
    pub source: PathBuf,
    /// Container path; the host path when omitted.
    pub destination: PathBuf,
    /// Cgroup access, `rwm` when omitted.
    pub permissions: String,
}

impl DeviceSpec {
    /// Parse `src[:dst][:perms]`.
    ///
    /// With two fields the second is taken as permissions when it is a valid
    /// mode, otherwise it must be an absolute container path. An empty
    /// container path is rejected.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::InvalidDevice`] for a malformed string.
    pub fn parse(device: &str) -> CorralResult<Self> {
        let invalid = |reason: &str| CorralError::InvalidDevice {
            device: device.to_string(),
            reason: reason.to_string(),
        };

        let fields: Vec<&str> = device.split(':').collect();
        let mut permissions = DEFAULT_PERMISSIONS;
        let mut destination = "";
        match fields.as_slice() {
            [_] => {}
            [_, second] | [_, second, _] => {
                if let [_, _, third] = fields.as_slice() {
                    if !is_valid_device_mode(third) {
                        return Err(invalid("invalid device mode"));
                    }
                    permissions = *third;
                }
                if second.is_empty() {
                    return Err(invalid("empty container path"));
                }
                if is_valid_device_mode(second) {
                    permissions = *second;
                } else if !second.starts_with('/') {
                    return Err(invalid("invalid device mode"));
                } else {
                    destination = *second;
                }
            }
            _ => return Err(invalid("invalid device specification")),
        }

        let source = fields[0];
        if destination.is_empty() {
            destination = source;
        }
        Ok(Self {
            source: PathBuf::from(source),
            destination: PathBuf::from(destination),
            permissions: permissions.to_string(),
        })
    }
}

/// A device resolved against the host, with the rule granting access to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Spec device node.
    pub device: LinuxDevice,
    /// Cgroup rule for it.
    pub rule: LinuxDeviceCgroup,
}

impl DeviceConfig {
    /// Parse a device string and resolve its host node.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::InvalidDevice`] for a malformed string, a
    /// container path outside `/dev`, or a host path that is not a device.
    pub fn parse(device: &str) -> CorralResult<Self> {
        Self::from_spec(device, DeviceSpec::parse(device)?)
    }

    fn from_spec(device: &str, spec: DeviceSpec) -> CorralResult<Self> {
        let invalid = |reason: String| CorralError::InvalidDevice {
            device: device.to_string(),
            reason,
        };

        let destination = clean_path(&spec.destination);
        if !destination.starts_with("/dev") || destination == Path::new("/dev") {
            return Err(invalid(format!(
                "container path {} is not under /dev",
                spec.destination.display()
            )));
        }

        let host = device_from_path(&spec.source).map_err(|e| match e {
            NotADevice::WrongType => invalid(format!("{} is not a device", spec.source.display())),
            NotADevice::Io(e) => invalid(format!("{}: {e}", spec.source.display())),
        })?;

        Ok(Self {
            rule: host.allow_rule(&spec.permissions)?,
            device: host.spec_device(destination, host.uid, host.gid)?,
        })
    }
}

/// Parse a list of device strings, skipping empty entries.
///
/// # Errors
///
/// See [`DeviceConfig::parse`].
pub fn devices_from_strings<S: AsRef<str>>(devices: &[S]) -> CorralResult<Vec<DeviceConfig>> {
    devices
        .iter()
        .map(AsRef::as_ref)
        .filter(|d| !d.is_empty())
        .map(DeviceConfig::parse)
        .collect()
}

/// Devices from the pod annotation, each host path checked against `allowed`.
///
/// # Errors
///
/// Returns [`CorralError::InvalidDevice`] for a device that is not allowed,
/// plus the errors of [`DeviceConfig::parse`].
pub fn devices_from_annotation<S: AsRef<str>>(
    annotation: &str,
    allowed: &[S],
) -> CorralResult<Vec<DeviceConfig>> {
    annotation
        .split(',')
        .filter(|d| !d.is_empty())
        .map(|device| {
            let spec = DeviceSpec::parse(device)?;
            if !allowed.iter().any(|a| Path::new(a.as_ref()) == spec.source) {
                return Err(CorralError::InvalidDevice {
                    device: device.to_string(),
                    reason: format!("{} is not in allowed_devices", spec.source.display()),
                });
            }
            DeviceConfig::from_spec(device, spec)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use oci_spec::runtime::LinuxDeviceType;

    use super::*;

    #[test]
    fn device_modes() {
        assert!(is_valid_device_mode("rwm"));
        assert!(is_valid_device_mode("w"));
        assert!(is_valid_device_mode("mr"));
        assert!(!is_valid_device_mode(""));
        assert!(!is_valid_device_mode("rr"));
        assert!(!is_valid_device_mode("rx"));
    }

    #[test]
    fn parse_forms() {
        let spec = DeviceSpec::parse("/dev/fuse").unwrap();
        assert_eq!(spec.destination, PathBuf::from("/dev/fuse"));
        assert_eq!(spec.permissions, "rwm");

        let spec = DeviceSpec::parse("/dev/fuse:r").unwrap();
        assert_eq!(spec.destination, PathBuf::from("/dev/fuse"));
        assert_eq!(spec.permissions, "r");

        let spec = DeviceSpec::parse("/dev/sda:/dev/xvda:rw").unwrap();
        assert_eq!(spec.source, PathBuf::from("/dev/sda"));
        assert_eq!(spec.destination, PathBuf::from("/dev/xvda"));
        assert_eq!(spec.permissions, "rw");

        assert!(DeviceSpec::parse("invalid:invalid").is_err());
        assert!(DeviceSpec::parse("/dev/a:/dev/b:x").is_err());
        assert!(DeviceSpec::parse("a:b:c:d").is_err());
    }

    #[test]
    fn empty_container_path_is_rejected() {
        let err = DeviceSpec::parse("/dev/null::rw").unwrap_err();
        assert!(err.to_string().contains("empty container path"), "{err}");
        assert!(DeviceSpec::parse("/dev/null:").is_err());
        assert!(DeviceConfig::parse("/dev/null::rw").is_err());
    }

    #[test]
    fn dev_null_write_only() {
        let devices = devices_from_strings(&["/dev/null:/dev/null:w"]).unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].device.typ(), LinuxDeviceType::C);
        assert_eq!(devices[0].rule.access().as_deref(), Some("w"));
        assert_eq!(devices[0].rule.major(), Some(1));
    }

    #[test]
    fn destination_must_be_under_dev() {
        let err = DeviceConfig::parse("/dev/null:/tmp/null").unwrap_err();
        assert!(matches!(err, CorralError::InvalidDevice { .. }));
    }

    #[test]
    fn parent_dir_cannot_escape_dev() {
        for device in ["/dev/null:/dev/../etc/evil:rw", "/dev/null:/dev/..", "/dev/null:/dev/./"] {
            let err = DeviceConfig::parse(device).unwrap_err();
            assert!(matches!(err, CorralError::InvalidDevice { .. }), "{device}");
        }

        let allowed = ["/dev/null"];
        let err = devices_from_annotation("/dev/null:/dev/../etc/evil", &allowed).unwrap_err();
        assert!(err.to_string().contains("not under /dev"), "{err}");
    }

    #[test]
    fn destination_is_stored_clean() {
        let config = DeviceConfig::parse("/dev/null:/dev/./sub/../xnull").unwrap();
        assert_eq!(config.device.path(), Path::new("/dev/xnull"));
    }

    #[test]
    fn non_device_source() {
        assert!(DeviceConfig::parse("/etc/hostname:/dev/hostname").is_err());
    }

    #[test]
    fn annotation_allow_list() {
        let allowed = ["/dev/null"];
        let devices = devices_from_annotation("/dev/null:/dev/xnull:rw,", &allowed).unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].device.path(), &PathBuf::from("/dev/xnull"));

        let err = devices_from_annotation("/dev/zero", &allowed).unwrap_err();
        assert!(err.to_string().contains("allowed_devices"));
        assert!(devices_from_annotation("", &allowed).unwrap().is_empty());
    }
}
