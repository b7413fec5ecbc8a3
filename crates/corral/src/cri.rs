//! CRI-shaped request types.
//!
//! These mirror the parts of the Container Runtime Interface messages that
//! sandbox assembly reads. They are plain data: the pipeline never mutates
//! them.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use corral_common::CorralResult;
use oci_spec::runtime::{LinuxIdMapping, LinuxIdMappingBuilder};
use serde::{Deserialize, Serialize};

/// A range of ids mapped into a user namespace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IdMapping {
    /// First id inside the namespace.
    pub container_id: u32,
    /// First id on the host.
    pub host_id: u32,
    /// Number of ids in the range.
    pub length: u32,
}

impl IdMapping {
    /// The runtime spec form of this range.
    ///
    /// # Errors
    ///
    /// Returns [`corral_common::CorralError::Spec`] if the mapping cannot be
    /// built.
    pub fn to_spec(&self) -> CorralResult<LinuxIdMapping> {
        Ok(LinuxIdMappingBuilder::default()
            .container_id(self.container_id)
            .host_id(self.host_id)
            .size(self.length)
            .build()?)
    }

    /// [`IdMapping::to_spec`] over a list.
    ///
    /// # Errors
    ///
    /// See [`IdMapping::to_spec`].
    pub fn to_spec_all(mappings: &[Self]) -> CorralResult<Vec<LinuxIdMapping>> {
        mappings.iter().map(Self::to_spec).collect()
    }
}

/// How a namespace is shared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NamespaceMode {
    /// Shared by every container of the pod.
    #[default]
    Pod,
    /// Private to the container.
    Container,
    /// The host's namespace.
    Node,
    /// Another container's namespace, named by `target_id`.
    Target,
}

/// User namespace request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UserNamespace {
    /// Sharing mode.
    pub mode: NamespaceMode,
    /// UID ranges.
    pub uids: Vec<IdMapping>,
    /// GID ranges.
    pub gids: Vec<IdMapping>,
}

/// Namespace sharing options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NamespaceOption {
    /// Network namespace mode.
    pub network: NamespaceMode,
    /// PID namespace mode.
    pub pid: NamespaceMode,
    /// IPC namespace mode.
    pub ipc: NamespaceMode,
    /// Container whose PID namespace to join when `pid` is `Target`.
    pub target_id: String,
    /// User namespace request.
    pub userns_options: Option<UserNamespace>,
}

/// Pod-level security context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LinuxSandboxSecurityContext {
    /// Namespace options.
    pub namespace_options: NamespaceOption,
    /// Run the sandbox privileged.
    pub privileged: bool,
    /// Read-only root filesystem for the infra container.
    pub readonly_rootfs: bool,
}

/// Linux part of a pod sandbox request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LinuxPodSandboxConfig {
    /// Security context.
    pub security_context: LinuxSandboxSecurityContext,
    /// Namespaced sysctls.
    pub sysctls: BTreeMap<String, String>,
}

/// Pod sandbox request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PodSandboxConfig {
    /// Pod hostname.
    pub hostname: String,
    /// Linux settings.
    pub linux: LinuxPodSandboxConfig,
    /// Pod annotations.
    pub annotations: HashMap<String, String>,
}

/// Mount propagation requested for a volume.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MountPropagation {
    /// No propagation in either direction.
    #[default]
    PropagationPrivate,
    /// Host mounts propagate into the container.
    PropagationHostToContainer,
    /// Mounts propagate both ways.
    PropagationBidirectional,
}

/// A volume requested for a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Mount {
    /// Path inside the container.
    pub container_path: String,
    /// Path on the host.
    pub host_path: String,
    /// Mount read-only.
    pub readonly: bool,
    /// Relabel the source for the container's SELinux context.
    pub selinux_relabel: bool,
    /// Propagation mode.
    pub propagation: MountPropagation,
    /// UID mappings for an idmapped mount.
    pub uid_mappings: Vec<IdMapping>,
    /// GID mappings for an idmapped mount.
    pub gid_mappings: Vec<IdMapping>,
}

/// A host device requested for a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Device {
    /// Path inside the container.
    pub container_path: String,
    /// Path on the host; may be a directory of devices.
    pub host_path: String,
    /// Cgroup permissions, a subset of "rwm".
    pub permissions: String,
}

/// A CDI device reference.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CdiDevice {
    /// Fully qualified name, `vendor/class=name`.
    pub name: String,
}

/// Capability changes requested for a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Capability {
    /// Capabilities to add.
    pub add_capabilities: Vec<String>,
    /// Capabilities to drop.
    pub drop_capabilities: Vec<String>,
}

/// Container-level security context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LinuxContainerSecurityContext {
    /// Capability changes; `None` means defaults.
    pub capabilities: Option<Capability>,
    /// Run privileged.
    pub privileged: bool,
    /// Namespace options.
    pub namespace_options: NamespaceOption,
    /// UID to run as.
    pub run_as_user: Option<i64>,
    /// GID to run as.
    pub run_as_group: Option<i64>,
    /// Read-only root filesystem.
    pub readonly_rootfs: bool,
    /// SELinux mount label applied to relabelled sources.
    pub mount_label: Option<String>,
}

/// Linux part of a container request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LinuxContainerConfig {
    /// Security context.
    pub security_context: LinuxContainerSecurityContext,
}

/// Container request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ContainerConfig {
    /// Container name.
    pub name: String,
    /// Entrypoint.
    pub command: Vec<String>,
    /// Arguments to the entrypoint.
    pub args: Vec<String>,
    /// Volumes.
    pub mounts: Vec<Mount>,
    /// Host devices.
    pub devices: Vec<Device>,
    /// CDI devices.
    pub cdi_devices: Vec<CdiDevice>,
    /// Annotations.
    pub annotations: HashMap<String, String>,
    /// Linux settings.
    pub linux: LinuxContainerConfig,
}

impl ContainerConfig {
    /// The security context.
    #[must_use]
    pub const fn security(&self) -> &LinuxContainerSecurityContext {
        &self.linux.security_context
    }

    /// Whether the container runs privileged.
    #[must_use]
    pub const fn privileged(&self) -> bool {
        self.linux.security_context.privileged
    }
}

/// Volumes declared by the container image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageVolumes {
    /// Destinations of the declared volumes.
    pub volumes: Vec<PathBuf>,
}
