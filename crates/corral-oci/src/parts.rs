//! Constructors for the spec values the pipeline adds.
//!
//! The runtime spec types only come with fallible builders; these wrap the
//! common shapes so call sites stay one line and propagate with `?`.

use std::path::PathBuf;

use corral_common::{CorralError, CorralResult};
use oci_spec::runtime::{
    Capability, LinuxDevice, LinuxDeviceBuilder, LinuxDeviceCgroup, LinuxDeviceCgroupBuilder,
    LinuxDeviceType, Mount, MountBuilder,
};

/// A mount of `source` at `destination`.
///
/// # Errors
///
/// Returns [`CorralError::Spec`] if the mount cannot be built.
pub fn mount<S: AsRef<str>>(
    destination: impl Into<PathBuf>,
    typ: &str,
    source: impl Into<PathBuf>,
    options: &[S],
) -> CorralResult<Mount> {
    let options: Vec<String> = options.iter().map(|o| o.as_ref().to_string()).collect();
    Ok(MountBuilder::default()
        .destination(destination.into())
        .typ(typ)
        .source(source.into())
        .options(options)
        .build()?)
}

/// A device node at `path` inside the container.
///
/// # Errors
///
/// Returns [`CorralError::Spec`] if the device cannot be built.
pub fn device(
    path: impl Into<PathBuf>,
    typ: LinuxDeviceType,
    major: i64,
    minor: i64,
    file_mode: Option<u32>,
    uid: Option<u32>,
    gid: Option<u32>,
) -> CorralResult<LinuxDevice> {
    let mut builder = LinuxDeviceBuilder::default()
        .path(path.into())
        .typ(typ)
        .major(major)
        .minor(minor);
    if let Some(mode) = file_mode {
        builder = builder.file_mode(mode);
    }
    if let Some(uid) = uid {
        builder = builder.uid(uid);
    }
    if let Some(gid) = gid {
        builder = builder.gid(gid);
    }
    Ok(builder.build()?)
}

/// Cgroup rule allowing `access` to one device.
///
/// # Errors
///
/// Returns [`CorralError::Spec`] if the rule cannot be built.
pub fn allow_rule(
    typ: LinuxDeviceType,
    major: i64,
    minor: i64,
    access: impl Into<String>,
) -> CorralResult<LinuxDeviceCgroup> {
    Ok(LinuxDeviceCgroupBuilder::default()
        .allow(true)
        .typ(typ)
        .major(major)
        .minor(minor)
        .access(access.into())
        .build()?)
}

/// Cgroup rule allowing every device.
///
/// # Errors
///
/// Returns [`CorralError::Spec`] if the rule cannot be built.
pub fn allow_all_rule() -> CorralResult<LinuxDeviceCgroup> {
    Ok(LinuxDeviceCgroupBuilder::default()
        .allow(true)
        .typ(LinuxDeviceType::A)
        .access("rwm")
        .build()?)
}

/// Parse a device type letter: `c`, `b`, `u`, `p` or `a`.
#[must_use]
pub fn device_type(name: &str) -> Option<LinuxDeviceType> {
    match name {
        "c" => Some(LinuxDeviceType::C),
        "b" => Some(LinuxDeviceType::B),
        "u" => Some(LinuxDeviceType::U),
        "p" => Some(LinuxDeviceType::P),
        "a" => Some(LinuxDeviceType::A),
        _ => None,
    }
}

/// The letter of a device type.
#[must_use]
pub const fn device_type_name(typ: LinuxDeviceType) -> &'static str {
    match typ {
        LinuxDeviceType::C => "c",
        LinuxDeviceType::B => "b",
        LinuxDeviceType::U => "u",
        LinuxDeviceType::P => "p",
        LinuxDeviceType::A => "a",
    }
}

/// Look up a capability by its `CAP_` name.
///
/// # Errors
///
/// Returns [`CorralError::InvalidCapability`] for a name the runtime spec
/// does not define.
pub fn capability(name: &str) -> CorralResult<Capability> {
    serde_json::from_value(serde_json::Value::String(name.to_string())).map_err(|_| {
        CorralError::InvalidCapability {
            name: name.to_string(),
        }
    })
}

/// The `CAP_` name of a capability.
#[must_use]
pub fn capability_name(cap: &Capability) -> String {
    match serde_json::to_value(cap) {
        Ok(serde_json::Value::String(name)) => name,
        _ => format!("{cap:?}"),
    }
}
