//! Runtime spec builder.
//!
//! [`Generator`] owns a [`Spec`] and exposes the mutations the sandbox
//! pipeline performs on it. Each resolver receives `&mut Generator` in turn.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use corral_common::{CorralError, CorralResult};
use oci_spec::runtime::{
    Capability, Hook, Hooks, Linux, LinuxBuilder, LinuxCapabilities, LinuxCapabilitiesBuilder,
    LinuxDevice, LinuxDeviceCgroup, LinuxDeviceCgroupBuilder, LinuxNamespace,
    LinuxNamespaceBuilder, LinuxNamespaceType, LinuxResources, LinuxResourcesBuilder, Mount,
    Process, ProcessBuilder, RootBuilder, Spec, SpecBuilder,
};
use tracing::debug;

use crate::parts::{capability, capability_name, mount};

/// Runtime spec version written by [`Generator::linux_default`].
pub const OCI_VERSION: &str = "1.2.0";

/// Capabilities granted by the default spec.
pub const DEFAULT_CAPABILITIES: &[&str] = &[
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_FSETID",
    "CAP_FOWNER",
    "CAP_MKNOD",
    "CAP_NET_RAW",
    "CAP_SETGID",
    "CAP_SETUID",
    "CAP_SETFCAP",
    "CAP_SETPCAP",
    "CAP_NET_BIND_SERVICE",
    "CAP_SYS_CHROOT",
    "CAP_KILL",
    "CAP_AUDIT_WRITE",
];

/// Paths hidden from unprivileged containers.
pub const DEFAULT_MASKED_PATHS: &[&str] = &[
    "/proc/acpi",
    "/proc/kcore",
    "/proc/keys",
    "/proc/latency_stats",
    "/proc/timer_list",
    "/proc/timer_stats",
    "/proc/sched_debug",
    "/proc/scsi",
    "/sys/firmware",
];

/// Paths mounted read-only in unprivileged containers.
pub const DEFAULT_READONLY_PATHS: &[&str] = &[
    "/proc/asound",
    "/proc/bus",
    "/proc/fs",
    "/proc/irq",
    "/proc/sys",
    "/proc/sysrq-trigger",
];

const ROOTFS_PROPAGATIONS: &[&str] = &[
    "private",
    "rprivate",
    "slave",
    "rslave",
    "shared",
    "rshared",
    "unbindable",
    "runbindable",
];

/// One of the process capability sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapabilitySet {
    /// Bounding set.
    Bounding,
    /// Effective set.
    Effective,
    /// Inheritable set.
    Inheritable,
    /// Permitted set.
    Permitted,
    /// Ambient set.
    Ambient,
}

impl CapabilitySet {
    const ALL: [Self; 5] = [
        Self::Bounding,
        Self::Effective,
        Self::Inheritable,
        Self::Permitted,
        Self::Ambient,
    ];

    fn get(self, caps: &LinuxCapabilities) -> &Option<HashSet<Capability>> {
        match self {
            Self::Bounding => caps.bounding(),
            Self::Effective => caps.effective(),
            Self::Inheritable => caps.inheritable(),
            Self::Permitted => caps.permitted(),
            Self::Ambient => caps.ambient(),
        }
    }

    fn put(self, caps: &mut LinuxCapabilities, set: HashSet<Capability>) {
        match self {
            Self::Bounding => caps.set_bounding(Some(set)),
            Self::Effective => caps.set_effective(Some(set)),
            Self::Inheritable => caps.set_inheritable(Some(set)),
            Self::Permitted => caps.set_permitted(Some(set)),
            Self::Ambient => caps.set_ambient(Some(set)),
        };
    }
}

/// Lifecycle point of a hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookStage {
    /// `prestart`
    Prestart,
    /// `createRuntime`
    CreateRuntime,
    /// `createContainer`
    CreateContainer,
    /// `startContainer`
    StartContainer,
    /// `poststart`
    Poststart,
    /// `poststop`
    Poststop,
}

impl HookStage {
    /// Parse the config.json name of a stage, e.g. `createContainer`.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "prestart" => Some(Self::Prestart),
            "createRuntime" => Some(Self::CreateRuntime),
            "createContainer" => Some(Self::CreateContainer),
            "startContainer" => Some(Self::StartContainer),
            "poststart" => Some(Self::Poststart),
            "poststop" => Some(Self::Poststop),
            _ => None,
        }
    }

    fn get(self, hooks: &Hooks) -> &Option<Vec<Hook>> {
        match self {
            Self::Prestart => hooks.prestart(),
            Self::CreateRuntime => hooks.create_runtime(),
            Self::CreateContainer => hooks.create_container(),
            Self::StartContainer => hooks.start_container(),
            Self::Poststart => hooks.poststart(),
            Self::Poststop => hooks.poststop(),
        }
    }

    fn put(self, hooks: &mut Hooks, list: Vec<Hook>) {
        match self {
            Self::Prestart => hooks.set_prestart(Some(list)),
            Self::CreateRuntime => hooks.set_create_runtime(Some(list)),
            Self::CreateContainer => hooks.set_create_container(Some(list)),
            Self::StartContainer => hooks.set_start_container(Some(list)),
            Self::Poststart => hooks.set_poststart(Some(list)),
            Self::Poststop => hooks.set_poststop(Some(list)),
        };
    }
}

/// Builder over an OCI runtime [`Spec`].
#[derive(Debug, Clone)]
pub struct Generator {
    spec: Spec,
}

impl Generator {
    /// Wrap an existing spec.
    #[must_use]
    pub const fn new(spec: Spec) -> Self {
        Self { spec }
    }

    /// The default Linux container spec.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::Spec`] if a default value cannot be built.
    pub fn linux_default() -> CorralResult<Self> {
        let caps = DEFAULT_CAPABILITIES
            .iter()
            .map(|name| capability(name))
            .collect::<CorralResult<HashSet<Capability>>>()?;
        let capabilities = LinuxCapabilitiesBuilder::default()
            .bounding(caps.clone())
            .effective(caps.clone())
            .inheritable(HashSet::new())
            .permitted(caps)
            .ambient(HashSet::new())
            .build()?;
        let process = ProcessBuilder::default()
            .args(vec!["sh".to_string()])
            .env(vec![
                "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
                "TERM=xterm".to_string(),
            ])
            .capabilities(capabilities)
            .build()?;

        let namespaces = [
            LinuxNamespaceType::Pid,
            LinuxNamespaceType::Network,
            LinuxNamespaceType::Ipc,
            LinuxNamespaceType::Uts,
            LinuxNamespaceType::Mount,
        ]
        .into_iter()
        .map(|typ| LinuxNamespaceBuilder::default().typ(typ).build())
        .collect::<Result<Vec<_>, _>>()?;
        let deny_all = LinuxDeviceCgroupBuilder::default()
            .allow(false)
            .access("rwm")
            .build()?;
        let linux = LinuxBuilder::default()
            .namespaces(namespaces)
            .devices(Vec::new())
            .resources(LinuxResourcesBuilder::default().devices(vec![deny_all]).build()?)
            .masked_paths(to_strings(DEFAULT_MASKED_PATHS))
            .readonly_paths(to_strings(DEFAULT_READONLY_PATHS))
            .build()?;

        let spec = SpecBuilder::default()
            .version(OCI_VERSION)
            .root(RootBuilder::default().path("rootfs").readonly(false).build()?)
            .process(process)
            .hostname("corral")
            .mounts(default_mounts()?)
            .linux(linux)
            .build()?;
        Ok(Self { spec })
    }

    /// Borrow the spec.
    #[must_use]
    pub const fn spec(&self) -> &Spec {
        &self.spec
    }

    /// Consume the builder.
    #[must_use]
    pub fn into_spec(self) -> Spec {
        self.spec
    }

    fn linux(&self) -> Option<&Linux> {
        self.spec.linux().as_ref()
    }

    fn process(&self) -> Option<&Process> {
        self.spec.process().as_ref()
    }

    fn update_linux(&mut self, f: impl FnOnce(&mut Linux)) {
        let mut linux = self.spec.linux().clone().unwrap_or_default();
        f(&mut linux);
        self.spec.set_linux(Some(linux));
    }

    fn update_process(&mut self, f: impl FnOnce(&mut Process)) {
        let mut process = self.spec.process().clone().unwrap_or_default();
        f(&mut process);
        self.spec.set_process(Some(process));
    }

    fn update_capabilities(&mut self, f: impl FnOnce(&mut LinuxCapabilities)) {
        self.update_process(|process| {
            let mut caps = process.capabilities().clone().unwrap_or_else(empty_capabilities);
            f(&mut caps);
            process.set_capabilities(Some(caps));
        });
    }

    fn update_resources(&mut self, f: impl FnOnce(&mut LinuxResources)) {
        self.update_linux(|linux| {
            let mut resources = linux.resources().clone().unwrap_or_default();
            f(&mut resources);
            linux.set_resources(Some(resources));
        });
    }

    // Namespaces

    /// Namespaces currently in the spec.
    #[must_use]
    pub fn namespaces(&self) -> &[LinuxNamespace] {
        self.linux()
            .and_then(|linux| linux.namespaces().as_deref())
            .unwrap_or(&[])
    }

    /// Set the namespace of `typ`, replacing any existing entry.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::Spec`] if the namespace cannot be built.
    pub fn add_or_replace_namespace(
        &mut self,
        typ: LinuxNamespaceType,
        path: Option<PathBuf>,
    ) -> CorralResult<()> {
        let mut builder = LinuxNamespaceBuilder::default().typ(typ);
        if let Some(path) = path {
            builder = builder.path(path);
        }
        let namespace = builder.build()?;
        self.update_linux(|linux| {
            let mut namespaces = linux.namespaces().clone().unwrap_or_default();
            if let Some(existing) = namespaces.iter_mut().find(|ns| ns.typ() == typ) {
                *existing = namespace;
            } else {
                namespaces.push(namespace);
            }
            linux.set_namespaces(Some(namespaces));
        });
        Ok(())
    }

    /// Remove the namespace of `typ`; the container shares the host's.
    pub fn remove_namespace(&mut self, typ: LinuxNamespaceType) {
        if self.linux().is_none() {
            return;
        }
        self.update_linux(|linux| {
            let mut namespaces = linux.namespaces().clone().unwrap_or_default();
            namespaces.retain(|ns| ns.typ() != typ);
            linux.set_namespaces(Some(namespaces));
        });
    }

    // Mounts

    /// Mounts currently in the spec.
    #[must_use]
    pub fn mounts(&self) -> &[Mount] {
        self.spec.mounts().as_deref().unwrap_or(&[])
    }

    /// Add a mount, replacing any mount with the same destination.
    pub fn add_mount(&mut self, mount: Mount) {
        let mut mounts = self.mounts().to_vec();
        if let Some(existing) = mounts
            .iter_mut()
            .find(|m| m.destination() == mount.destination())
        {
            *existing = mount;
        } else {
            mounts.push(mount);
        }
        self.spec.set_mounts(Some(mounts));
    }

    /// Remove the mount at `destination`, if present.
    pub fn remove_mount(&mut self, destination: &Path) {
        let mut mounts = self.mounts().to_vec();
        mounts.retain(|m| m.destination() != destination);
        self.spec.set_mounts(Some(mounts));
    }

    /// Remove every mount.
    pub fn clear_mounts(&mut self) {
        self.spec.set_mounts(Some(Vec::new()));
    }

    // Devices

    /// Device nodes currently in the spec.
    #[must_use]
    pub fn devices(&self) -> &[LinuxDevice] {
        self.linux()
            .and_then(|linux| linux.devices().as_deref())
            .unwrap_or(&[])
    }

    /// Device cgroup rules currently in the spec.
    #[must_use]
    pub fn device_cgroup_rules(&self) -> &[LinuxDeviceCgroup] {
        self.linux()
            .and_then(|linux| linux.resources().as_ref())
            .and_then(|resources| resources.devices().as_deref())
            .unwrap_or(&[])
    }

    /// Add a device node, replacing any device at the same container path.
    pub fn add_device(&mut self, device: LinuxDevice) {
        self.update_linux(|linux| {
            let mut devices = linux.devices().clone().unwrap_or_default();
            if let Some(existing) = devices.iter_mut().find(|d| d.path() == device.path()) {
                *existing = device;
            } else {
                devices.push(device);
            }
            linux.set_devices(Some(devices));
        });
    }

    /// Append a device cgroup rule.
    pub fn add_device_cgroup_rule(&mut self, rule: LinuxDeviceCgroup) {
        self.update_resources(|resources| {
            let mut rules = resources.devices().clone().unwrap_or_default();
            rules.push(rule);
            resources.set_devices(Some(rules));
        });
    }

    /// Replace every device cgroup rule.
    pub fn set_device_cgroup_rules(&mut self, rules: Vec<LinuxDeviceCgroup>) {
        self.update_resources(|resources| {
            resources.set_devices(Some(rules));
        });
    }

    /// Remove every device node. Cgroup rules are left untouched.
    pub fn clear_devices(&mut self) {
        if self.linux().is_some() {
            self.update_linux(|linux| {
                linux.set_devices(Some(Vec::new()));
            });
        }
    }

    // Capabilities

    /// Capabilities currently in the spec.
    #[must_use]
    pub fn capabilities(&self) -> Option<&LinuxCapabilities> {
        self.process()?.capabilities().as_ref()
    }

    /// Sorted `CAP_` names in `set`.
    #[must_use]
    pub fn capability_names(&self, set: CapabilitySet) -> Vec<String> {
        let mut names: Vec<String> = self
            .capabilities()
            .and_then(|caps| set.get(caps).as_ref())
            .map(|caps| caps.iter().map(capability_name).collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Add `name` to `set`.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::InvalidCapability`] for a name the runtime spec
    /// does not define.
    pub fn add_capability(&mut self, set: CapabilitySet, name: &str) -> CorralResult<()> {
        let cap = capability(name)?;
        self.update_capabilities(|caps| {
            let mut current = set.get(caps).clone().unwrap_or_default();
            current.insert(cap);
            set.put(caps, current);
        });
        Ok(())
    }

    /// Remove `name` from `set`. Unknown names are ignored.
    pub fn drop_capability(&mut self, set: CapabilitySet, name: &str) {
        let Ok(cap) = capability(name) else {
            return;
        };
        self.update_capabilities(|caps| {
            let mut current = set.get(caps).clone().unwrap_or_default();
            current.remove(&cap);
            set.put(caps, current);
        });
    }

    /// Empty all five capability sets.
    pub fn clear_capabilities(&mut self) {
        self.update_capabilities(|caps| *caps = empty_capabilities());
    }

    // Root filesystem and paths

    /// Set the root filesystem read-only flag.
    pub fn set_root_readonly(&mut self, readonly: bool) {
        let mut root = self.spec.root().clone().unwrap_or_default();
        root.set_readonly(Some(readonly));
        self.spec.set_root(Some(root));
    }

    /// Current rootfs propagation, empty when unset.
    #[must_use]
    pub fn rootfs_propagation(&self) -> &str {
        self.linux()
            .and_then(|linux| linux.rootfs_propagation().as_deref())
            .unwrap_or("")
    }

    /// Set the rootfs propagation.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::Config`] for a value the runtime does not accept.
    pub fn set_rootfs_propagation(&mut self, propagation: &str) -> CorralResult<()> {
        if !ROOTFS_PROPAGATIONS.contains(&propagation) {
            return Err(CorralError::config(format!(
                "rootfs propagation {propagation:?} is not valid"
            )));
        }
        debug!(propagation, "setting rootfs propagation");
        self.update_linux(|linux| {
            linux.set_rootfs_propagation(Some(propagation.to_string()));
        });
        Ok(())
    }

    /// Masked paths currently in the spec.
    #[must_use]
    pub fn masked_paths(&self) -> &[String] {
        self.linux()
            .and_then(|linux| linux.masked_paths().as_deref())
            .unwrap_or(&[])
    }

    /// Read-only paths currently in the spec.
    #[must_use]
    pub fn readonly_paths(&self) -> &[String] {
        self.linux()
            .and_then(|linux| linux.readonly_paths().as_deref())
            .unwrap_or(&[])
    }

    /// Add a masked path.
    pub fn add_masked_path(&mut self, path: impl Into<String>) {
        let path = path.into();
        self.update_linux(|linux| {
            let mut masked = linux.masked_paths().clone().unwrap_or_default();
            if !masked.contains(&path) {
                masked.push(path);
            }
            linux.set_masked_paths(Some(masked));
        });
    }

    /// Add a read-only path.
    pub fn add_readonly_path(&mut self, path: impl Into<String>) {
        let path = path.into();
        self.update_linux(|linux| {
            let mut readonly = linux.readonly_paths().clone().unwrap_or_default();
            if !readonly.contains(&path) {
                readonly.push(path);
            }
            linux.set_readonly_paths(Some(readonly));
        });
    }

    /// Remove every masked path.
    pub fn clear_masked_paths(&mut self) {
        if self.linux().is_some() {
            self.update_linux(|linux| {
                linux.set_masked_paths(Some(Vec::new()));
            });
        }
    }

    /// Remove every read-only path.
    pub fn clear_readonly_paths(&mut self) {
        if self.linux().is_some() {
            self.update_linux(|linux| {
                linux.set_readonly_paths(Some(Vec::new()));
            });
        }
    }

    /// Set the SELinux mount label.
    pub fn set_mount_label(&mut self, label: impl Into<String>) {
        let label = label.into();
        self.update_linux(|linux| {
            linux.set_mount_label(Some(label));
        });
    }

    // Process

    /// Process arguments.
    #[must_use]
    pub fn process_args(&self) -> &[String] {
        self.process()
            .and_then(|process| process.args().as_deref())
            .unwrap_or(&[])
    }

    /// Replace the process arguments.
    pub fn set_process_args(&mut self, args: Vec<String>) {
        self.update_process(|process| {
            process.set_args(Some(args));
        });
    }

    /// Process environment.
    #[must_use]
    pub fn env(&self) -> &[String] {
        self.process()
            .and_then(|process| process.env().as_deref())
            .unwrap_or(&[])
    }

    /// Set `key=value` in the process environment, replacing an existing `key`.
    pub fn add_env(&mut self, key: &str, value: &str) {
        let entry = format!("{key}={value}");
        let prefix = format!("{key}=");
        self.update_process(|process| {
            let mut env = process.env().clone().unwrap_or_default();
            if let Some(existing) = env.iter_mut().find(|e| e.starts_with(&prefix)) {
                *existing = entry;
            } else {
                env.push(entry);
            }
            process.set_env(Some(env));
        });
    }

    // Hooks

    /// Hooks registered at `stage`.
    #[must_use]
    pub fn hooks(&self, stage: HookStage) -> &[Hook] {
        self.spec
            .hooks()
            .as_ref()
            .and_then(|hooks| stage.get(hooks).as_deref())
            .unwrap_or(&[])
    }

    /// Append a hook at `stage`.
    pub fn add_hook(&mut self, stage: HookStage, hook: Hook) {
        let mut hooks = self.spec.hooks().clone().unwrap_or_default();
        let mut list = stage.get(&hooks).clone().unwrap_or_default();
        list.push(hook);
        stage.put(&mut hooks, list);
        self.spec.set_hooks(Some(hooks));
    }
}

fn empty_capabilities() -> LinuxCapabilities {
    let mut caps = LinuxCapabilities::default();
    for set in CapabilitySet::ALL {
        set.put(&mut caps, HashSet::new());
    }
    caps
}

fn to_strings(values: &[&str]) -> Vec<String> {
    values.iter().map(ToString::to_string).collect()
}

fn default_mounts() -> CorralResult<Vec<Mount>> {
    Ok(vec![
        mount("/proc", "proc", "proc", &["nosuid", "noexec", "nodev"])?,
        mount(
            "/dev",
            "tmpfs",
            "tmpfs",
            &["nosuid", "strictatime", "mode=755", "size=65536k"],
        )?,
        mount(
            "/dev/pts",
            "devpts",
            "devpts",
            &["nosuid", "noexec", "newinstance", "ptmxmode=0666", "mode=0620", "gid=5"],
        )?,
        mount(
            "/dev/shm",
            "tmpfs",
            "shm",
            &["nosuid", "noexec", "nodev", "mode=1777", "size=65536k"],
        )?,
        mount("/dev/mqueue", "mqueue", "mqueue", &["nosuid", "noexec", "nodev"])?,
        mount("/sys", "sysfs", "sysfs", &["nosuid", "noexec", "nodev", "ro"])?,
    ])
}

#[cfg(test)]
mod tests {
    use oci_spec::runtime::{HookBuilder, LinuxDeviceType};

    use super::*;
    use crate::parts::{allow_rule, device};

    #[test]
    fn linux_default_shape() {
        let g = Generator::linux_default().unwrap();
        assert_eq!(g.namespaces().len(), 5);
        assert_eq!(g.mounts().len(), 6);
        assert_eq!(
            g.capability_names(CapabilitySet::Bounding).len(),
            DEFAULT_CAPABILITIES.len()
        );
        assert!(g.capability_names(CapabilitySet::Inheritable).is_empty());
        assert!(g.capability_names(CapabilitySet::Ambient).is_empty());
        assert!(g.masked_paths().contains(&"/proc/kcore".to_string()));
        assert!(g.devices().is_empty());

        let json = serde_json::to_value(g.spec()).unwrap();
        assert_eq!(json["ociVersion"], OCI_VERSION);
        assert_eq!(json["root"]["path"], "rootfs");
        assert_eq!(json["linux"]["resources"]["devices"][0]["allow"], false);
    }

    #[test]
    fn replace_and_remove_namespace() {
        let mut g = Generator::linux_default().unwrap();
        g.add_or_replace_namespace(LinuxNamespaceType::Network, Some("/run/netns/x".into()))
            .unwrap();
        let net: Vec<_> = g
            .namespaces()
            .iter()
            .filter(|ns| ns.typ() == LinuxNamespaceType::Network)
            .collect();
        assert_eq!(net.len(), 1);
        assert_eq!(net[0].path().as_deref(), Some(Path::new("/run/netns/x")));

        g.remove_namespace(LinuxNamespaceType::Network);
        assert!(g
            .namespaces()
            .iter()
            .all(|ns| ns.typ() != LinuxNamespaceType::Network));

        g.add_or_replace_namespace(LinuxNamespaceType::User, None).unwrap();
        assert!(g.namespaces().iter().any(|ns| ns.typ() == LinuxNamespaceType::User));
    }

    #[test]
    fn mount_replaced_by_destination() {
        let mut g = Generator::linux_default().unwrap();
        g.clear_mounts();
        g.add_mount(mount("/data", "bind", "/a", &["rbind"]).unwrap());
        g.add_mount(mount("/data", "bind", "/b", &["rbind"]).unwrap());
        assert_eq!(g.mounts().len(), 1);
        assert_eq!(g.mounts()[0].source().as_deref(), Some(Path::new("/b")));
        g.remove_mount(Path::new("/data"));
        assert!(g.mounts().is_empty());
    }

    #[test]
    fn capability_sets_are_independent() {
        let mut g = Generator::linux_default().unwrap();
        g.clear_capabilities();
        g.add_capability(CapabilitySet::Bounding, "CAP_KILL").unwrap();
        g.add_capability(CapabilitySet::Bounding, "CAP_KILL").unwrap();
        g.add_capability(CapabilitySet::Effective, "CAP_KILL").unwrap();
        g.drop_capability(CapabilitySet::Effective, "CAP_KILL");
        assert_eq!(g.capability_names(CapabilitySet::Bounding), vec!["CAP_KILL"]);
        assert!(g.capability_names(CapabilitySet::Effective).is_empty());
        assert!(g.add_capability(CapabilitySet::Bounding, "CAP_BOGUS").is_err());
        g.clear_capabilities();
        assert!(g.capability_names(CapabilitySet::Bounding).is_empty());
    }

    #[test]
    fn devices_and_rules() {
        let mut g = Generator::linux_default().unwrap();
        let null = device("/dev/null", LinuxDeviceType::C, 1, 3, Some(0o666), Some(0), Some(0)).unwrap();
        g.add_device(null.clone());
        g.add_device(null);
        g.add_device_cgroup_rule(allow_rule(LinuxDeviceType::C, 1, 3, "rwm").unwrap());
        assert_eq!(g.devices().len(), 1);
        assert_eq!(g.device_cgroup_rules().len(), 2);
        g.clear_devices();
        assert!(g.devices().is_empty());
        assert_eq!(g.device_cgroup_rules().len(), 2);
    }

    #[test]
    fn rootfs_propagation_validated() {
        let mut g = Generator::linux_default().unwrap();
        assert_eq!(g.rootfs_propagation(), "");
        g.set_rootfs_propagation("rslave").unwrap();
        assert_eq!(g.rootfs_propagation(), "rslave");
        assert!(g.set_rootfs_propagation("sideways").is_err());
    }

    #[test]
    fn env_replaces_key() {
        let mut g = Generator::linux_default().unwrap();
        g.add_env("TERM", "dumb");
        g.add_env("container", "corral");
        assert!(g.env().contains(&"TERM=dumb".to_string()));
        assert!(!g.env().contains(&"TERM=xterm".to_string()));
        assert!(g.env().contains(&"container=corral".to_string()));
    }

    #[test]
    fn hooks_by_stage() {
        let mut g = Generator::linux_default().unwrap();
        let hook = HookBuilder::default().path("/usr/bin/hook").build().unwrap();
        g.add_hook(HookStage::CreateContainer, hook.clone());
        g.add_hook(HookStage::CreateContainer, hook);
        assert_eq!(g.hooks(HookStage::CreateContainer).len(), 2);
        assert!(g.hooks(HookStage::Prestart).is_empty());
        assert_eq!(HookStage::from_name("poststop"), Some(HookStage::Poststop));
        assert_eq!(HookStage::from_name("preStart"), None);
    }
}
