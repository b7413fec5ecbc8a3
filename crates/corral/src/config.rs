//! Sandbox assembly configuration.

use std::path::PathBuf;

use corral_common::CorralPaths;
use corral_common::paths::{DEFAULT_MOUNTS_FILE, DEFAULT_PINNS_PATH};
use corral_oci::generate::DEFAULT_CAPABILITIES;
use serde::{Deserialize, Serialize};

/// What to do with volumes declared by an image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageVolumesMode {
    /// Create the volume inside the container's root filesystem.
    #[default]
    Mkdir,
    /// Bind a per-container host directory onto the volume.
    Bind,
    /// Do not create the volume.
    Ignore,
}

/// Operator configuration for sandbox assembly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Directory holding pinned namespaces.
    pub namespaces_dir: PathBuf,
    /// Namespace pinning helper.
    pub pinns_path: PathBuf,
    /// Directory per-container runtime files are written under.
    pub container_run_dir: PathBuf,
    /// Prefix joined onto every bind mount host path.
    pub bind_mount_prefix: Option<PathBuf>,
    /// Bind sources that must already exist rather than be created.
    pub absent_mount_sources_to_reject: Vec<PathBuf>,
    /// Container storage root; bind sources containing it get host-to-container propagation.
    pub storage_root: PathBuf,
    /// Run every container with a read-only root filesystem.
    pub read_only: bool,
    /// Mount `/sys/fs/cgroup` read-write for unprivileged containers.
    pub cgroup2_rw: bool,
    /// The runtime supports idmapped mounts.
    pub idmapped_mounts: bool,
    /// Handling of image-declared volumes.
    pub image_volumes: ImageVolumesMode,
    /// Subscription mounts file.
    pub default_mounts_file: PathBuf,
    /// Capabilities granted when a request does not say otherwise.
    pub default_capabilities: Vec<String>,
    /// Fill the inheritable set too.
    pub add_inheritable_capabilities: bool,
    /// Devices added to every container, as `src[:dst][:perms]`.
    pub additional_devices: Vec<String>,
    /// Devices the devices annotation may request.
    pub allowed_devices: Vec<String>,
    /// Do not pass host devices to privileged containers.
    pub privileged_without_host_devices: bool,
    /// Own devices by the container's run-as identity.
    pub device_ownership_from_security_context: bool,
    /// Directories scanned for CDI specs.
    pub cdi_spec_dirs: Vec<PathBuf>,
    /// Host device directory enumerated for privileged containers.
    pub dev_root: PathBuf,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        let paths = CorralPaths::new();
        Self {
            namespaces_dir: paths.namespaces(),
            pinns_path: PathBuf::from(DEFAULT_PINNS_PATH),
            container_run_dir: paths.runtime.join("containers"),
            bind_mount_prefix: None,
            absent_mount_sources_to_reject: Vec::new(),
            storage_root: paths.storage(),
            read_only: false,
            cgroup2_rw: false,
            idmapped_mounts: false,
            image_volumes: ImageVolumesMode::default(),
            default_mounts_file: PathBuf::from(DEFAULT_MOUNTS_FILE),
            default_capabilities: DEFAULT_CAPABILITIES.iter().map(ToString::to_string).collect(),
            add_inheritable_capabilities: false,
            additional_devices: Vec::new(),
            allowed_devices: vec!["/dev/fuse".to_string(), "/dev/net/tun".to_string()],
            privileged_without_host_devices: false,
            device_ownership_from_security_context: false,
            cdi_spec_dirs: CorralPaths::cdi_spec_dirs(),
            dev_root: PathBuf::from("/dev"),
        }
    }
}

impl SandboxConfig {
    /// Configuration with every path under `root`.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let paths = CorralPaths::with_root(root);
        Self {
            namespaces_dir: paths.namespaces(),
            container_run_dir: paths.runtime.join("containers"),
            storage_root: paths.storage(),
            default_mounts_file: paths.root.join("mounts.conf"),
            ..Self::default()
        }
    }

    /// Per-container runtime directory.
    #[must_use]
    pub fn run_dir_for(&self, container_id: &str) -> PathBuf {
        self.container_run_dir.join(container_id)
    }

    /// Set the namespace pinning helper.
    #[must_use]
    pub fn with_pinns_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.pinns_path = path.into();
        self
    }

    /// Set the bind mount prefix.
    #[must_use]
    pub fn with_bind_mount_prefix(mut self, prefix: impl Into<PathBuf>) -> Self {
        self.bind_mount_prefix = Some(prefix.into());
        self
    }

    /// Force read-only root filesystems.
    #[must_use]
    pub const fn with_read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Set the default capabilities.
    #[must_use]
    pub fn with_default_capabilities(mut self, caps: &[&str]) -> Self {
        self.default_capabilities = caps.iter().map(ToString::to_string).collect();
        self
    }

    /// Fill the inheritable capability set.
    #[must_use]
    pub const fn with_inheritable_capabilities(mut self) -> Self {
        self.add_inheritable_capabilities = true;
        self
    }

    /// Set devices added to every container.
    #[must_use]
    pub fn with_additional_devices(mut self, devices: &[&str]) -> Self {
        self.additional_devices = devices.iter().map(ToString::to_string).collect();
        self
    }

    /// Keep host devices out of privileged containers.
    #[must_use]
    pub const fn with_privileged_without_host_devices(mut self) -> Self {
        self.privileged_without_host_devices = true;
        self
    }

    /// Own devices by the container's run-as identity.
    #[must_use]
    pub const fn with_device_ownership_from_security_context(mut self) -> Self {
        self.device_ownership_from_security_context = true;
        self
    }

    /// Set the host device directory.
    #[must_use]
    pub fn with_dev_root(mut self, dev_root: impl Into<PathBuf>) -> Self {
        self.dev_root = dev_root.into();
        self
    }

    /// Set the image volumes mode.
    #[must_use]
    pub const fn with_image_volumes(mut self, mode: ImageVolumesMode) -> Self {
        self.image_volumes = mode;
        self
    }

    /// Set the CDI spec directories.
    #[must_use]
    pub fn with_cdi_spec_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.cdi_spec_dirs = dirs;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = SandboxConfig::default();
        assert_eq!(config.pinns_path, PathBuf::from("/usr/bin/pinns"));
        assert_eq!(config.allowed_devices, vec!["/dev/fuse", "/dev/net/tun"]);
        assert!(!config.add_inheritable_capabilities);
        assert!(config.default_capabilities.contains(&"CAP_CHOWN".to_string()));
    }

    #[test]
    fn builder_pattern() {
        let config = SandboxConfig::with_root("/srv/corral")
            .with_read_only()
            .with_default_capabilities(&["CAP_KILL"])
            .with_image_volumes(ImageVolumesMode::Bind);

        assert_eq!(config.namespaces_dir, PathBuf::from("/srv/corral/run/ns"));
        assert_eq!(config.storage_root, PathBuf::from("/srv/corral/storage"));
        assert_eq!(config.run_dir_for("c1"), PathBuf::from("/srv/corral/run/containers/c1"));
        assert!(config.read_only);
        assert_eq!(config.default_capabilities, vec!["CAP_KILL"]);
    }

    #[test]
    fn deserialize_partial() {
        let config: SandboxConfig = serde_json::from_str(
            r#"{"image_volumes": "bind", "privileged_without_host_devices": true}"#,
        )
        .unwrap();
        assert_eq!(config.image_volumes, ImageVolumesMode::Bind);
        assert!(config.privileged_without_host_devices);
        assert_eq!(config.dev_root, PathBuf::from("/dev"));
    }
}
