//! Device passthrough.
//!
//! [`DeviceResolver`] fills a container's device list and device cgroup
//! rules from, in order: operator configuration, the pod devices
//! annotation, the host (privileged containers), the container request and
//! CDI.

pub mod config;
pub mod host;

use std::collections::{HashMap, HashSet};
use std::path::Path;

use corral_common::{CorralError, CorralResult};
use corral_oci::Generator;

pub use config::{
    DEVICES_ANNOTATION, DeviceConfig, DeviceSpec, devices_from_annotation, devices_from_strings,
    is_valid_device_mode,
};
pub use host::{HostDevice, NotADevice, device_from_path, host_devices};

use crate::cdi::{self, CdiRegistry};
use crate::config::SandboxConfig;
use crate::cri::{self, ContainerConfig};
use crate::mounts::scoped_path;

/// Resolves a container's devices onto the spec.
#[derive(Debug, Clone, Copy)]
pub struct DeviceResolver<'a> {
    config: &'a SandboxConfig,
    cdi: &'a dyn CdiRegistry,
}

impl<'a> DeviceResolver<'a> {
    /// Resolver using `config` for operator settings and `cdi` for CDI names.
    #[must_use]
    pub const fn new(config: &'a SandboxConfig, cdi: &'a dyn CdiRegistry) -> Self {
        Self { config, cdi }
    }

    /// Replace the spec's devices with the container's.
    ///
    /// `pod_annotations` are the sandbox annotations, read for the devices
    /// annotation.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::InvalidDevice`] for a malformed or disallowed
    /// device or a privileged path collision, [`CorralError::Cdi`] for an
    /// unresolvable CDI device, and [`CorralError::Os`] for host lookups that
    /// fail.
    pub fn apply(
        &self,
        generator: &mut Generator,
        container: &ContainerConfig,
        pod_annotations: &HashMap<String, String>,
    ) -> CorralResult<()> {
        generator.clear_devices();

        for device in devices_from_strings(&self.config.additional_devices)? {
            add_device_config(generator, device);
        }

        if let Some(annotation) = pod_annotations.get(DEVICES_ANNOTATION) {
            for device in devices_from_annotation(annotation, &self.config.allowed_devices)? {
                add_device_config(generator, device);
            }
        }

        let privileged = container.privileged();
        if privileged && !self.config.privileged_without_host_devices {
            self.add_host_devices(generator)?;
        }

        for device in &container.devices {
            self.add_container_device(generator, container, device, privileged)?;
        }

        self.inject_cdi(generator, container)
    }

    fn add_host_devices(&self, generator: &mut Generator) -> CorralResult<()> {
        let devices = host_devices(&self.config.dev_root)?;
        let mut added = 0usize;
        for device in devices {
            if device.major == 0 && device.minor == 0 {
                continue;
            }
            generator.add_device(device.spec_device(&device.path, device.uid, device.gid)?);
            added += 1;
        }
        generator.set_device_cgroup_rules(vec![corral_oci::allow_all_rule()?]);
        tracing::debug!(count = added, "Added host devices for privileged container");
        Ok(())
    }

    fn add_container_device(
        &self,
        generator: &mut Generator,
        container: &ContainerConfig,
        device: &cri::Device,
        privileged: bool,
    ) -> CorralResult<()> {
        if privileged && device.container_path != device.host_path {
            match std::fs::metadata(&device.container_path) {
                Ok(_) => {
                    return Err(CorralError::InvalidDevice {
                        device: device.container_path.clone(),
                        reason: "privileged container device path already exists on the host"
                            .to_string(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(CorralError::os("stat", &device.container_path, e)),
            }
        }

        let path = scoped_path(Path::new("/"), Path::new(&device.host_path))
            .map_err(|e| CorralError::os("resolve device", &device.host_path, e))?;
        let permissions = if device.permissions.is_empty() {
            "rwm"
        } else {
            device.permissions.as_str()
        };

        match device_from_path(&path) {
            Ok(host) => {
                let security = container.security();
                let owned = self.config.device_ownership_from_security_context;
                generator.add_device(host.spec_device(
                    &device.container_path,
                    device_owner(security.run_as_user, host.uid, owned),
                    device_owner(security.run_as_group, host.gid, owned),
                )?);
                generator.add_device_cgroup_rule(host.allow_rule(permissions)?);
            }
            Err(NotADevice::WrongType) if path.is_dir() => {
                expand_directory(generator, &path, Path::new(&device.container_path), permissions)?;
            }
            Err(NotADevice::WrongType) => {
                tracing::warn!(path = %path.display(), "Requested device is not a device node, ignoring");
            }
            Err(NotADevice::Io(e)) => {
                tracing::warn!(path = %path.display(), error = %e, "Requested device unavailable, ignoring");
            }
        }
        Ok(())
    }

    fn inject_cdi(&self, generator: &mut Generator, container: &ContainerConfig) -> CorralResult<()> {
        let mut requested: Vec<String> = container.cdi_devices.iter().map(|d| d.name.clone()).collect();
        let from_field: HashSet<String> = requested.iter().cloned().collect();

        let annotated = cdi::parse_annotations(&container.annotations)?;
        if !annotated.is_empty() {
            for name in annotated {
                if from_field.contains(&name) {
                    tracing::info!(device = %name, "Skipping duplicate annotated CDI device");
                    continue;
                }
                requested.push(name);
            }
            tracing::info!("CDI devices requested through annotations, prefer the CDI devices field");
        }

        if requested.is_empty() {
            return Ok(());
        }

        if let Err(e) = self.cdi.refresh() {
            tracing::warn!(error = %e, "CDI registry has errors");
        }
        self.cdi.inject_devices(generator, &requested).map_err(|e| CorralError::Cdi {
            message: format!("CDI device injection failed: {e}"),
        })
    }
}

fn add_device_config(generator: &mut Generator, device: DeviceConfig) {
    generator.add_device(device.device);
    generator.add_device_cgroup_rule(device.rule);
}

/// Every device node below `dir`, mapped to the same relative path below
/// `container_dir`. Unreadable entries are skipped.
fn expand_directory(
    generator: &mut Generator,
    dir: &Path,
    container_dir: &Path,
    permissions: &str,
) -> CorralResult<()> {
    let mut count = 0usize;
    for entry in walkdir::WalkDir::new(dir).sort_by_file_name().into_iter().filter_map(Result::ok) {
        let Ok(host) = device_from_path(entry.path()) else {
            continue;
        };
        let relative = entry.path().strip_prefix(dir).unwrap_or(entry.path());
        generator.add_device(host.spec_device(container_dir.join(relative), host.uid, host.gid)?);
        generator.add_device_cgroup_rule(host.allow_rule(permissions)?);
        count += 1;
    }
    tracing::debug!(dir = %dir.display(), count, "Expanded device directory");
    Ok(())
}

/// Owner of a device node created in the container: the requested run-as id
/// when ownership follows the security context and the id is not root,
/// otherwise the host owner.
fn device_owner(run_as: Option<i64>, host: u32, from_security_context: bool) -> u32 {
    run_as
        .and_then(|id| u32::try_from(id).ok())
        .filter(|&id| id > 0 && from_security_context)
        .unwrap_or(host)
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::MetadataExt;

    use oci_spec::runtime::LinuxDeviceType;

    use parking_lot::Mutex;
    use rustix::fs::{CWD, FileType, Mode, mknodat};

    use super::*;
    use crate::cri::{CdiDevice, LinuxContainerConfig, LinuxContainerSecurityContext};

    #[derive(Debug, Default)]
    struct RecordingRegistry {
        fail_refresh: bool,
        known: Vec<String>,
        injected: Mutex<Vec<String>>,
    }

    impl CdiRegistry for RecordingRegistry {
        fn refresh(&self) -> CorralResult<()> {
            if self.fail_refresh {
                return Err(CorralError::Cdi {
                    message: "broken spec".to_string(),
                });
            }
            Ok(())
        }

        fn inject_devices(&self, _generator: &mut Generator, devices: &[String]) -> CorralResult<()> {
            if let Some(missing) = devices.iter().find(|d| !self.known.contains(d)) {
                return Err(CorralError::Cdi {
                    message: format!("unresolvable CDI devices {missing}"),
                });
            }
            self.injected.lock().extend(devices.iter().cloned());
            Ok(())
        }
    }

    fn privileged() -> LinuxContainerConfig {
        LinuxContainerConfig {
            security_context: LinuxContainerSecurityContext {
                privileged: true,
                ..Default::default()
            },
        }
    }

    fn device(host: &str, container: &str, permissions: &str) -> cri::Device {
        cri::Device {
            container_path: container.to_string(),
            host_path: host.to_string(),
            permissions: permissions.to_string(),
        }
    }

    fn fifo(path: &Path) {
        mknodat(CWD, path, FileType::Fifo, Mode::from_raw_mode(0o600), 0).unwrap();
    }

    #[test]
    fn stale_devices_are_cleared() {
        let config = SandboxConfig::default();
        let registry = RecordingRegistry::default();
        let mut g = Generator::linux_default().unwrap();
        g.add_device(
            corral_oci::device("/dev/stale", LinuxDeviceType::C, 1, 1, None, None, None).unwrap(),
        );
        DeviceResolver::new(&config, &registry)
            .apply(&mut g, &ContainerConfig::default(), &HashMap::new())
            .unwrap();
        assert!(g.devices().is_empty());
    }

    #[test]
    fn operator_and_annotation_devices() {
        let mut config = SandboxConfig::default().with_additional_devices(&["/dev/null:/dev/xnull:rw"]);
        config.allowed_devices = vec!["/dev/zero".to_string()];
        let registry = RecordingRegistry::default();
        let resolver = DeviceResolver::new(&config, &registry);

        let annotations: HashMap<String, String> =
            [(DEVICES_ANNOTATION.to_string(), "/dev/zero".to_string())].into_iter().collect();
        let mut g = Generator::linux_default().unwrap();
        resolver.apply(&mut g, &ContainerConfig::default(), &annotations).unwrap();
        let paths: Vec<&Path> = g.devices().iter().map(|d| d.path().as_path()).collect();
        assert_eq!(paths, vec![Path::new("/dev/xnull"), Path::new("/dev/zero")]);
        assert_eq!(g.device_cgroup_rules().len(), 3);

        let denied: HashMap<String, String> =
            [(DEVICES_ANNOTATION.to_string(), "/dev/null".to_string())].into_iter().collect();
        let mut g = Generator::linux_default().unwrap();
        assert!(resolver.apply(&mut g, &ContainerConfig::default(), &denied).is_err());
    }

    #[test]
    fn privileged_gets_every_host_device() {
        let config = SandboxConfig::default();
        let registry = RecordingRegistry::default();
        let container = ContainerConfig {
            linux: privileged(),
            ..Default::default()
        };
        let mut g = Generator::linux_default().unwrap();
        DeviceResolver::new(&config, &registry)
            .apply(&mut g, &container, &HashMap::new())
            .unwrap();

        let expected = host_devices(Path::new("/dev"))
            .unwrap()
            .into_iter()
            .filter(|d| d.major != 0 || d.minor != 0)
            .count();
        assert_eq!(g.devices().len(), expected);
        assert_eq!(g.device_cgroup_rules(), &[corral_oci::allow_all_rule().unwrap()]);
    }

    #[test]
    fn privileged_without_host_devices() {
        let config = SandboxConfig::default().with_privileged_without_host_devices();
        let registry = RecordingRegistry::default();
        let container = ContainerConfig {
            linux: privileged(),
            ..Default::default()
        };
        let mut g = Generator::linux_default().unwrap();
        DeviceResolver::new(&config, &registry)
            .apply(&mut g, &container, &HashMap::new())
            .unwrap();
        assert!(g.devices().is_empty());
    }

    #[test]
    fn privileged_path_collision() {
        let dir = tempfile::tempdir().unwrap();
        let config = SandboxConfig::default().with_privileged_without_host_devices();
        let registry = RecordingRegistry::default();
        let container = ContainerConfig {
            linux: privileged(),
            devices: vec![device("/dev/null", &dir.path().display().to_string(), "rwm")],
            ..Default::default()
        };
        let mut g = Generator::linux_default().unwrap();
        let err = DeviceResolver::new(&config, &registry)
            .apply(&mut g, &container, &HashMap::new())
            .unwrap_err();
        assert!(matches!(err, CorralError::InvalidDevice { .. }));
    }

    #[test]
    fn directory_is_expanded() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        for name in ["a", "b", "sub/c"] {
            fifo(&dir.path().join(name));
        }
        std::fs::write(dir.path().join("regular"), "").unwrap();

        let config = SandboxConfig::default();
        let registry = RecordingRegistry::default();
        let container = ContainerConfig {
            devices: vec![device(&dir.path().display().to_string(), "/dev/fifos", "rw")],
            ..Default::default()
        };
        let mut g = Generator::linux_default().unwrap();
        DeviceResolver::new(&config, &registry)
            .apply(&mut g, &container, &HashMap::new())
            .unwrap();

        let paths: Vec<&Path> = g.devices().iter().map(|d| d.path().as_path()).collect();
        assert_eq!(
            paths,
            vec![
                Path::new("/dev/fifos/a"),
                Path::new("/dev/fifos/b"),
                Path::new("/dev/fifos/sub/c")
            ]
        );
        let added: Vec<_> = g.device_cgroup_rules().iter().skip(1).collect();
        assert_eq!(added.len(), 3);
        assert!(added.iter().all(|r| r.allow() && r.access().as_deref() == Some("rw")));
    }

    #[test]
    fn ownership_from_security_context() {
        let host_uid = std::fs::metadata("/dev/null").unwrap().uid();
        let registry = RecordingRegistry::default();
        let container = ContainerConfig {
            devices: vec![device("/dev/null", "/dev/mynull", "")],
            linux: LinuxContainerConfig {
                security_context: LinuxContainerSecurityContext {
                    run_as_user: Some(1000),
                    run_as_group: Some(0),
                    ..Default::default()
                },
            },
            ..Default::default()
        };

        let config = SandboxConfig::default();
        let mut g = Generator::linux_default().unwrap();
        DeviceResolver::new(&config, &registry)
            .apply(&mut g, &container, &HashMap::new())
            .unwrap();
        assert_eq!(g.devices()[0].uid(), Some(host_uid));
        assert_eq!(g.device_cgroup_rules()[1].access().as_deref(), Some("rwm"));

        let config = SandboxConfig::default().with_device_ownership_from_security_context();
        let mut g = Generator::linux_default().unwrap();
        DeviceResolver::new(&config, &registry)
            .apply(&mut g, &container, &HashMap::new())
            .unwrap();
        assert_eq!(g.devices()[0].uid(), Some(1000));
        assert_eq!(g.devices()[0].gid(), Some(std::fs::metadata("/dev/null").unwrap().gid()));
    }

    #[test]
    fn owner_selection() {
        assert_eq!(device_owner(Some(1000), 5, true), 1000);
        assert_eq!(device_owner(Some(1000), 5, false), 5);
        assert_eq!(device_owner(Some(0), 5, true), 5);
        assert_eq!(device_owner(None, 5, true), 5);
        assert_eq!(device_owner(Some(-1), 5, true), 5);
    }

    #[test]
    fn cdi_field_and_annotation_injected_once() {
        let config = SandboxConfig::default();
        let registry = RecordingRegistry {
            fail_refresh: true,
            known: vec!["vendor.com/gpu=0".to_string(), "vendor.com/gpu=1".to_string()],
            ..Default::default()
        };
        let container = ContainerConfig {
            cdi_devices: vec![CdiDevice {
                name: "vendor.com/gpu=0".to_string(),
            }],
            annotations: [(
                "cdi.k8s.io/gpus".to_string(),
                "vendor.com/gpu=0,vendor.com/gpu=1".to_string(),
            )]
            .into_iter()
            .collect(),
            ..Default::default()
        };
        let mut g = Generator::linux_default().unwrap();
        DeviceResolver::new(&config, &registry)
            .apply(&mut g, &container, &HashMap::new())
            .unwrap();
        assert_eq!(
            *registry.injected.lock(),
            vec!["vendor.com/gpu=0".to_string(), "vendor.com/gpu=1".to_string()]
        );
    }

    #[test]
    fn cdi_unresolved_is_error() {
        let config = SandboxConfig::default();
        let registry = RecordingRegistry::default();
        let container = ContainerConfig {
            cdi_devices: vec![CdiDevice {
                name: "vendor.com/gpu=9".to_string(),
            }],
            ..Default::default()
        };
        let mut g = Generator::linux_default().unwrap();
        let err = DeviceResolver::new(&config, &registry)
            .apply(&mut g, &container, &HashMap::new())
            .unwrap_err();
        assert!(matches!(err, CorralError::Cdi { .. }));
    }
}
