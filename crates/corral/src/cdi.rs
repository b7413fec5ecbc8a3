//! Container Device Interface.
//!
//! CDI specs declare devices by qualified name (`vendor.com/class=name`)
//! together with the edits a container needs to use them. The registry
//! loads specs from disk and applies those edits to a runtime spec.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Debug;
use std::path::{Path, PathBuf};

use corral_common::{CorralError, CorralResult};
use corral_oci::{Generator, HookStage};
use oci_spec::runtime::{
    HookBuilder, LinuxDevice, LinuxDeviceCgroup, LinuxDeviceType, MountBuilder,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::devices::host::device_from_path;

/// Annotation key prefix requesting CDI devices.
pub const ANNOTATION_PREFIX: &str = "cdi.k8s.io/";

/// A parsed qualified device name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QualifiedName {
    /// Vendor, e.g. `nvidia.com`.
    pub vendor: String,
    /// Device class, e.g. `gpu`.
    pub class: String,
    /// Device name within the kind.
    pub name: String,
}

impl QualifiedName {
    /// Parse `vendor/class=name`.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::Cdi`] for a malformed name.
    pub fn parse(device: &str) -> CorralResult<Self> {
        let invalid = || CorralError::Cdi {
            message: format!("invalid qualified device name {device:?}"),
        };
        let (kind, name) = device.split_once('=').ok_or_else(invalid)?;
        let (vendor, class) = kind.split_once('/').ok_or_else(invalid)?;

        let valid_vendor = vendor.starts_with(|c: char| c.is_ascii_alphabetic())
            && vendor
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        let valid_class = class.starts_with(|c: char| c.is_ascii_alphabetic())
            && class
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'));
        let valid_name = name.starts_with(|c: char| c.is_ascii_alphanumeric())
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'));
        if !(valid_vendor && valid_class && valid_name) {
            return Err(invalid());
        }

        Ok(Self {
            vendor: vendor.to_string(),
            class: class.to_string(),
            name: name.to_string(),
        })
    }

    /// The `vendor/class` kind.
    #[must_use]
    pub fn kind(&self) -> String {
        format!("{}/{}", self.vendor, self.class)
    }
}

impl std::fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}={}", self.vendor, self.class, self.name)
    }
}

/// Device names requested through `cdi.k8s.io/` annotations, in key order.
///
/// # Errors
///
/// Returns [`CorralError::Cdi`] for a value that is not a list of qualified
/// device names.
pub fn parse_annotations(annotations: &HashMap<String, String>) -> CorralResult<Vec<String>> {
    let sorted: BTreeMap<&String, &String> = annotations
        .iter()
        .filter(|(key, _)| key.starts_with(ANNOTATION_PREFIX))
        .collect();

    let mut devices = Vec::new();
    for (key, value) in sorted {
        for device in value.split(',').map(str::trim).filter(|d| !d.is_empty()) {
            QualifiedName::parse(device).map_err(|_| CorralError::Cdi {
                message: format!("invalid CDI device {device:?} in annotation {key}"),
            })?;
            devices.push(device.to_string());
        }
    }
    Ok(devices)
}

/// Source of CDI device definitions.
pub trait CdiRegistry: Send + Sync + Debug {
    /// Reload device definitions.
    ///
    /// # Errors
    ///
    /// Returns an error describing specs that failed to load. Specs that
    /// loaded are still usable.
    fn refresh(&self) -> CorralResult<()>;

    /// Apply the edits of every named device to `generator`.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::Cdi`] if a name is unknown or an edit cannot be
    /// applied. Nothing is applied in that case.
    fn inject_devices(&self, generator: &mut Generator, devices: &[String]) -> CorralResult<()>;
}

/// A CDI spec file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CdiSpec {
    /// CDI spec version.
    pub cdi_version: String,
    /// `vendor/class` of every device in the spec.
    pub kind: String,
    /// Devices declared by the spec.
    pub devices: Vec<CdiDevice>,
    /// Edits applied once whenever any device of the spec is injected.
    pub container_edits: ContainerEdits,
}

/// One device in a CDI spec.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CdiDevice {
    /// Name within the spec's kind.
    pub name: String,
    /// Edits needed by the device.
    pub container_edits: ContainerEdits,
}

/// Changes a device makes to the container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ContainerEdits {
    /// `KEY=value` environment entries.
    pub env: Vec<String>,
    /// Device nodes.
    pub device_nodes: Vec<DeviceNode>,
    /// Mounts.
    pub mounts: Vec<CdiMount>,
    /// Lifecycle hooks.
    pub hooks: Vec<CdiHook>,
}

/// A device node edit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeviceNode {
    /// Path inside the container.
    pub path: PathBuf,
    /// Host node, when different from `path`.
    pub host_path: Option<PathBuf>,
    /// `c`, `b`, `u` or `p`; read from the host node when absent.
    #[serde(rename = "type")]
    pub device_type: Option<String>,
    /// Major number.
    pub major: Option<i64>,
    /// Minor number.
    pub minor: Option<i64>,
    /// File mode.
    pub file_mode: Option<u32>,
    /// Cgroup access, `rwm` when absent.
    pub permissions: Option<String>,
    /// Owner.
    pub uid: Option<u32>,
    /// Group.
    pub gid: Option<u32>,
}

/// A mount edit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CdiMount {
    /// Host source.
    pub host_path: PathBuf,
    /// Destination inside the container.
    pub container_path: PathBuf,
    /// Filesystem type.
    #[serde(rename = "type")]
    pub mount_type: Option<String>,
    /// Mount options.
    pub options: Vec<String>,
}

/// A hook edit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CdiHook {
    /// Lifecycle point, e.g. `createContainer`.
    pub hook_name: String,
    /// Executable.
    pub path: PathBuf,
    /// Arguments.
    pub args: Vec<String>,
    /// Environment.
    pub env: Vec<String>,
    /// Timeout in seconds.
    pub timeout: Option<u32>,
}

impl CdiSpec {
    /// Load a spec from a `.json`, `.yaml` or `.yml` file.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::Os`] if the file cannot be read, or
    /// [`CorralError::Cdi`] if it does not parse or declares an invalid kind.
    pub fn load(path: &Path) -> CorralResult<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| CorralError::os("read CDI spec", path, e))?;
        let parse_error = |e: &dyn std::fmt::Display| CorralError::Cdi {
            message: format!("failed to parse {}: {e}", path.display()),
        };
        let spec: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content).map_err(|e| parse_error(&e))?,
            _ => serde_yaml::from_str(&content).map_err(|e| parse_error(&e))?,
        };
        QualifiedName::parse(&format!("{}=x", spec.kind)).map_err(|_| CorralError::Cdi {
            message: format!("invalid kind {:?} in {}", spec.kind, path.display()),
        })?;
        Ok(spec)
    }
}

#[derive(Debug, Clone)]
struct Entry {
    kind: String,
    spec_edits: ContainerEdits,
    device_edits: ContainerEdits,
}

/// Registry backed by CDI spec directories.
///
/// Directories are read in order; a device defined again in a later
/// directory replaces the earlier definition.
#[derive(Debug, Default)]
pub struct SpecDirRegistry {
    dirs: Vec<PathBuf>,
    devices: RwLock<HashMap<String, Entry>>,
}

impl SpecDirRegistry {
    /// Registry over `dirs`. Nothing is loaded until [`CdiRegistry::refresh`].
    #[must_use]
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self {
            dirs,
            devices: RwLock::new(HashMap::new()),
        }
    }

    /// Qualified names of every loaded device, sorted.
    #[must_use]
    pub fn device_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.devices.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn spec_files(dir: &Path) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return Vec::new();
        };
        let mut files: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("json" | "yaml" | "yml")
                )
            })
            .collect();
        files.sort();
        files
    }
}

impl CdiRegistry for SpecDirRegistry {
    fn refresh(&self) -> CorralResult<()> {
        let mut devices = HashMap::new();
        let mut failures = Vec::new();

        for dir in &self.dirs {
            for file in Self::spec_files(dir) {
                let spec = match CdiSpec::load(&file) {
                    Ok(spec) => spec,
                    Err(e) => {
                        failures.push(e.to_string());
                        continue;
                    }
                };
                for device in &spec.devices {
                    let qualified = format!("{}={}", spec.kind, device.name);
                    if QualifiedName::parse(&qualified).is_err() {
                        failures.push(format!("invalid device {qualified:?} in {}", file.display()));
                        continue;
                    }
                    devices.insert(
                        qualified,
                        Entry {
                            kind: spec.kind.clone(),
                            spec_edits: spec.container_edits.clone(),
                            device_edits: device.container_edits.clone(),
                        },
                    );
                }
            }
        }

        tracing::debug!(count = devices.len(), "Loaded CDI devices");
        *self.devices.write() = devices;

        if failures.is_empty() {
            Ok(())
        } else {
            Err(CorralError::Cdi {
                message: failures.join("; "),
            })
        }
    }

    fn inject_devices(&self, generator: &mut Generator, devices: &[String]) -> CorralResult<()> {
        let registry = self.devices.read();
        let unresolved: Vec<&str> = devices
            .iter()
            .filter(|name| !registry.contains_key(name.as_str()))
            .map(String::as_str)
            .collect();
        if !unresolved.is_empty() {
            return Err(CorralError::Cdi {
                message: format!("unresolvable CDI devices {}", unresolved.join(", ")),
            });
        }

        let mut edited = generator.clone();
        let mut kinds = HashSet::new();
        let mut injected = HashSet::new();
        for name in devices {
            if !injected.insert(name.as_str()) {
                continue;
            }
            let entry = &registry[name.as_str()];
            if kinds.insert(entry.kind.as_str()) {
                apply_edits(&mut edited, &entry.spec_edits)?;
            }
            apply_edits(&mut edited, &entry.device_edits)?;
            tracing::debug!(device = %name, "Injected CDI device");
        }
        *generator = edited;
        Ok(())
    }
}

fn apply_edits(generator: &mut Generator, edits: &ContainerEdits) -> CorralResult<()> {
    for entry in &edits.env {
        let (key, value) = entry.split_once('=').unwrap_or((entry.as_str(), ""));
        generator.add_env(key, value);
    }

    for node in &edits.device_nodes {
        let (device, rule) = resolve_node(node)?;
        generator.add_device(device);
        generator.add_device_cgroup_rule(rule);
    }

    for mount in &edits.mounts {
        let mut builder = MountBuilder::default()
            .destination(mount.container_path.clone())
            .source(mount.host_path.clone())
            .options(mount.options.clone());
        if let Some(typ) = &mount.mount_type {
            builder = builder.typ(typ.clone());
        }
        generator.add_mount(builder.build()?);
    }

    for hook in &edits.hooks {
        let stage = HookStage::from_name(&hook.hook_name).ok_or_else(|| CorralError::Cdi {
            message: format!("invalid hook name {:?}", hook.hook_name),
        })?;
        let mut builder = HookBuilder::default()
            .path(hook.path.clone())
            .args(hook.args.clone())
            .env(hook.env.clone());
        if let Some(timeout) = hook.timeout {
            builder = builder.timeout(i64::from(timeout));
        }
        generator.add_hook(stage, builder.build()?);
    }
    Ok(())
}

fn resolve_node(node: &DeviceNode) -> CorralResult<(LinuxDevice, LinuxDeviceCgroup)> {
    let host_path = node.host_path.as_deref().unwrap_or(&node.path);
    let host = if node.device_type.is_none() || node.major.is_none() || node.minor.is_none() {
        Some(device_from_path(host_path).map_err(|_| CorralError::Cdi {
            message: format!("failed to stat CDI host device {}", host_path.display()),
        })?)
    } else {
        None
    };

    let device_type = match (&node.device_type, &host) {
        (Some(t), _) => corral_oci::device_type(t).ok_or_else(|| CorralError::Cdi {
            message: format!("invalid device type {t:?} for {}", node.path.display()),
        })?,
        (None, Some(host)) => host.device_type,
        (None, None) => LinuxDeviceType::C,
    };
    let major = node.major.or_else(|| host.as_ref().map(|h| h.major)).unwrap_or_default();
    let minor = node.minor.or_else(|| host.as_ref().map(|h| h.minor)).unwrap_or_default();
    let access = node.permissions.clone().unwrap_or_else(|| "rwm".to_string());

    let device = corral_oci::device(
        &node.path,
        device_type,
        major,
        minor,
        node.file_mode.or_else(|| host.as_ref().map(|h| h.file_mode)),
        node.uid,
        node.gid,
    )?;
    let rule = corral_oci::allow_rule(device_type, major, minor, access)?;
    Ok((device, rule))
}

#[cfg(test)]
mod tests {
    use super::*;

    const VENDOR_SPEC: &str = r#"{
        "cdiVersion": "0.6.0",
        "kind": "vendor.com/device",
        "containerEdits": { "env": ["VENDOR_RUNTIME=1"] },
        "devices": [
            {
                "name": "one",
                "containerEdits": {
                    "env": ["DEVICE=one"],
                    "deviceNodes": [{ "path": "/dev/vendor0", "hostPath": "/dev/null" }],
                    "mounts": [{ "hostPath": "/opt/vendor/lib", "containerPath": "/usr/lib/vendor", "options": ["ro", "bind"] }],
                    "hooks": [{ "hookName": "createContainer", "path": "/usr/bin/vendor-hook", "args": ["vendor-hook", "one"] }]
                }
            }
        ]
    }"#;

    const YAML_SPEC: &str = "\
cdiVersion: 0.6.0
kind: example.org/gpu
devices:
  - name: gpu0
    containerEdits:
      deviceNodes:
        - path: /dev/gpu0
          type: c
          major: 195
          minor: 0
          permissions: rw
";

    fn registry() -> (tempfile::TempDir, SpecDirRegistry) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("vendor.json"), VENDOR_SPEC).unwrap();
        std::fs::write(dir.path().join("gpu.yaml"), YAML_SPEC).unwrap();
        let registry = SpecDirRegistry::new(vec![dir.path().to_path_buf()]);
        (dir, registry)
    }

    #[test]
    fn qualified_names() {
        let name = QualifiedName::parse("nvidia.com/gpu=0").unwrap();
        assert_eq!(name.vendor, "nvidia.com");
        assert_eq!(name.kind(), "nvidia.com/gpu");
        assert_eq!(name.to_string(), "nvidia.com/gpu=0");
        assert!(QualifiedName::parse("gpu0").is_err());
        assert!(QualifiedName::parse("nvidia.com=gpu0").is_err());
        assert!(QualifiedName::parse("/gpu=0").is_err());
    }

    #[test]
    fn annotations() {
        let annotations: HashMap<String, String> = [
            ("cdi.k8s.io/b".to_string(), "vendor.com/device=one".to_string()),
            ("cdi.k8s.io/a".to_string(), "example.org/gpu=gpu0, vendor.com/device=two".to_string()),
            ("other".to_string(), "ignored".to_string()),
        ]
        .into_iter()
        .collect();
        assert_eq!(
            parse_annotations(&annotations).unwrap(),
            vec!["example.org/gpu=gpu0", "vendor.com/device=two", "vendor.com/device=one"]
        );

        let bad: HashMap<String, String> =
            [("cdi.k8s.io/x".to_string(), "not-a-device".to_string())].into_iter().collect();
        assert!(parse_annotations(&bad).is_err());
    }

    #[test]
    fn refresh_loads_json_and_yaml() {
        let (_dir, registry) = registry();
        registry.refresh().unwrap();
        assert_eq!(
            registry.device_names(),
            vec!["example.org/gpu=gpu0", "vendor.com/device=one"]
        );
    }

    #[test]
    fn refresh_reports_broken_specs_but_keeps_good_ones() {
        let (dir, registry) = registry();
        std::fs::write(dir.path().join("broken.json"), "{").unwrap();
        assert!(registry.refresh().is_err());
        assert_eq!(registry.device_names().len(), 2);
    }

    #[test]
    fn inject_applies_edits() {
        let (_dir, registry) = registry();
        registry.refresh().unwrap();
        let mut g = Generator::linux_default().unwrap();
        registry
            .inject_devices(
                &mut g,
                &["vendor.com/device=one".to_string(), "example.org/gpu=gpu0".to_string()],
            )
            .unwrap();

        assert!(g.env().contains(&"VENDOR_RUNTIME=1".to_string()));
        assert!(g.env().contains(&"DEVICE=one".to_string()));
        let vendor = g.devices().iter().find(|d| d.path() == Path::new("/dev/vendor0")).unwrap();
        assert_eq!((vendor.major(), vendor.minor()), (1, 3));
        let gpu = g.devices().iter().find(|d| d.path() == Path::new("/dev/gpu0")).unwrap();
        assert_eq!(gpu.major(), 195);
        assert!(g
            .device_cgroup_rules()
            .iter()
            .any(|r| r.major() == Some(195) && r.access().as_deref() == Some("rw")));
        let mount = g
            .mounts()
            .iter()
            .find(|m| m.destination() == Path::new("/usr/lib/vendor"))
            .unwrap();
        assert_eq!(mount.options().as_deref(), Some(&["ro".to_string(), "bind".to_string()][..]));
        assert_eq!(mount.typ(), &None);
        let hooks = g.hooks(HookStage::CreateContainer);
        assert_eq!(hooks.len(), 1);
        assert_eq!(hooks[0].path(), Path::new("/usr/bin/vendor-hook"));
    }

    #[test]
    fn missing_spec_dir_loads_nothing() {
        let registry = SpecDirRegistry::new(vec![PathBuf::from("/nonexistent/cdi")]);
        registry.refresh().unwrap();
        assert!(registry.device_names().is_empty());
    }

    #[test]
    fn bad_hook_name_and_device_type() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("bad.yaml"),
            "cdiVersion: 0.6.0\nkind: bad.org/x\ndevices:\n  - name: hook\n    containerEdits:\n      hooks:\n        - hookName: preStart\n          path: /bin/true\n  - name: node\n    containerEdits:\n      deviceNodes:\n        - path: /dev/x\n          type: z\n          major: 1\n          minor: 1\n",
        )
        .unwrap();
        let registry = SpecDirRegistry::new(vec![dir.path().to_path_buf()]);
        registry.refresh().unwrap();

        let mut g = Generator::linux_default().unwrap();
        let err = registry.inject_devices(&mut g, &["bad.org/x=hook".to_string()]).unwrap_err();
        assert!(err.to_string().contains("invalid hook name"), "{err}");
        let err = registry.inject_devices(&mut g, &["bad.org/x=node".to_string()]).unwrap_err();
        assert!(err.to_string().contains("invalid device type"), "{err}");
        assert!(g.hooks(HookStage::Prestart).is_empty());
    }

    #[test]
    fn unresolved_leaves_spec_untouched() {
        let (_dir, registry) = registry();
        registry.refresh().unwrap();
        let mut g = Generator::linux_default().unwrap();
        let before = serde_json::to_value(g.spec()).unwrap();
        let err = registry
            .inject_devices(
                &mut g,
                &["vendor.com/device=one".to_string(), "vendor.com/device=missing".to_string()],
            )
            .unwrap_err();
        assert!(err.to_string().contains("vendor.com/device=missing"));
        assert_eq!(serde_json::to_value(g.spec()).unwrap(), before);
    }
}
