//! Container spec assembly.
//!
//! [`SpecAssembler`] runs the pipeline stages over one [`Generator`] in a
//! fixed order: namespaces, mounts, devices, capabilities, then the root and
//! process fields. A failure after a target PID namespace was pinned releases
//! that pin before returning.

use std::sync::Arc;

use corral_common::{CorralError, CorralResult};
use corral_oci::Generator;
use oci_spec::runtime::LinuxNamespaceType;

use crate::capabilities::CapabilityResolver;
use crate::cdi::CdiRegistry;
use crate::config::SandboxConfig;
use crate::cri::{Capability, ContainerConfig, NamespaceMode, PodSandboxConfig};
use crate::devices::DeviceResolver;
use crate::mounts::{ContainerVolume, MountRequest, MountSetBuilder, MountTable};
use crate::namespace::{ManagedNamespace, Namespace, NamespaceManager, NsType, namespace_path_from_proc};

/// Finds the init pid of another container, for target PID sharing.
pub trait ContainerPidLookup {
    /// Pid of the running container `container_id`.
    ///
    /// # Errors
    ///
    /// Fails if the container is unknown or not running.
    fn pid(&self, container_id: &str) -> CorralResult<u32>;
}

/// The pod a container is created in.
#[derive(Debug, Clone)]
pub struct PodContext<'a> {
    /// The pod's sandbox config.
    pub config: &'a PodSandboxConfig,
    /// Namespaces pinned for the pod. Empty paths are not joined.
    pub namespaces: Vec<ManagedNamespace>,
    /// Pid of the pod's infra process, needed for pod PID sharing.
    pub infra_pid: Option<u32>,
}

impl<'a> PodContext<'a> {
    /// Context joining the namespaces in `namespaces`.
    #[must_use]
    pub fn new(config: &'a PodSandboxConfig, namespaces: &[Arc<Namespace>]) -> Self {
        Self {
            config,
            namespaces: namespaces.iter().map(|ns| ns.managed()).collect(),
            infra_pid: None,
        }
    }

    /// Set the infra process pid.
    #[must_use]
    pub const fn with_infra_pid(mut self, pid: u32) -> Self {
        self.infra_pid = Some(pid);
        self
    }
}

/// Outcome of [`SpecAssembler::assemble`].
#[derive(Debug, Default)]
pub struct AssembledContainer {
    /// Caller mounts as they were resolved.
    pub volumes: Vec<ContainerVolume>,
    /// PID namespace pinned from a target container. The caller removes it
    /// when the container goes away.
    pub pid_namespace: Option<Arc<Namespace>>,
}

/// Drives every stage of container spec assembly.
#[derive(Debug)]
pub struct SpecAssembler<'a> {
    config: &'a SandboxConfig,
    manager: &'a NamespaceManager,
    cdi: &'a dyn CdiRegistry,
    capabilities: CapabilityResolver,
    table: MountTable,
}

impl<'a> SpecAssembler<'a> {
    /// Assembler validating mount propagation against the host's mount table.
    ///
    /// # Errors
    ///
    /// Returns an error if `/proc/self/mountinfo` cannot be read.
    pub fn new(
        config: &'a SandboxConfig,
        manager: &'a NamespaceManager,
        cdi: &'a dyn CdiRegistry,
    ) -> CorralResult<Self> {
        Ok(Self::with_table(config, manager, cdi, MountTable::from_host()?))
    }

    /// Assembler validating mount propagation against `table`.
    #[must_use]
    pub fn with_table(
        config: &'a SandboxConfig,
        manager: &'a NamespaceManager,
        cdi: &'a dyn CdiRegistry,
        table: MountTable,
    ) -> Self {
        Self {
            config,
            manager,
            cdi,
            capabilities: CapabilityResolver::new(
                config.default_capabilities.clone(),
                config.add_inheritable_capabilities,
            ),
            table,
        }
    }

    /// Pin the namespaces a new pod asks for.
    ///
    /// # Errors
    ///
    /// See [`NamespaceManager::new_pod_namespaces`].
    pub fn create_pod_namespaces(&self, pod: &PodSandboxConfig) -> CorralResult<Vec<Arc<Namespace>>> {
        self.manager
            .new_pod_namespaces(&crate::namespace::PodNamespacesConfig::from_sandbox(pod))
    }

    /// Point the spec's namespaces at the pod's.
    ///
    /// Returns the PID namespace pinned from a target container, if the
    /// container shares one.
    ///
    /// # Errors
    ///
    /// - [`CorralError::Config`] if pod PID sharing has no infra process or
    ///   target sharing has no target id
    /// - errors from `targets` and [`NamespaceManager::namespace_from_proc_entry`]
    pub fn add_namespaces(
        &self,
        generator: &mut Generator,
        container: &ContainerConfig,
        pod: &PodContext<'_>,
        targets: &dyn ContainerPidLookup,
    ) -> CorralResult<Option<Arc<Namespace>>> {
        for ns in &pod.namespaces {
            if ns.path.as_os_str().is_empty() {
                continue;
            }
            generator.add_or_replace_namespace(ns.ns_type.oci_type(), Some(ns.path.clone()))?;
        }

        let options = &container.security().namespace_options;
        if options.network == NamespaceMode::Node {
            generator.remove_namespace(LinuxNamespaceType::Network);
        }

        match options.pid {
            NamespaceMode::Container => Ok(None),
            NamespaceMode::Node => {
                generator.remove_namespace(LinuxNamespaceType::Pid);
                Ok(None)
            }
            NamespaceMode::Pod => {
                let path = pod
                    .infra_pid
                    .and_then(|pid| namespace_path_from_proc(NsType::Pid, pid))
                    .ok_or_else(|| {
                        CorralError::config("PID namespace requested, but sandbox infra container invalid")
                    })?;
                generator.add_or_replace_namespace(LinuxNamespaceType::Pid, Some(path))?;
                Ok(None)
            }
            NamespaceMode::Target => {
                if options.target_id.is_empty() {
                    return Err(CorralError::config(
                        "target PID namespace specified with invalid target ID",
                    ));
                }
                let pid = targets.pid(&options.target_id)?;
                let ns = self.manager.namespace_from_proc_entry(pid, NsType::Pid)?;
                tracing::info!(
                    target = %options.target_id,
                    path = %ns.path().display(),
                    "Sharing target PID namespace"
                );
                generator
                    .add_or_replace_namespace(LinuxNamespaceType::Pid, Some(ns.path().to_path_buf()))?;
                Ok(Some(ns))
            }
        }
    }

    /// Run every stage for one container.
    ///
    /// # Errors
    ///
    /// Returns the first stage error. A target PID namespace pinned before
    /// the failure is removed first.
    pub fn assemble(
        &self,
        generator: &mut Generator,
        pod: &PodContext<'_>,
        mounts: &MountRequest<'_>,
        targets: &dyn ContainerPidLookup,
    ) -> CorralResult<AssembledContainer> {
        let container = mounts.container;
        tracing::debug!(container = %container.name, "Assembling container spec");

        let pid_namespace = self.add_namespaces(generator, container, pod, targets)?;
        match self.assemble_rest(generator, pod.config, mounts) {
            Ok(volumes) => Ok(AssembledContainer {
                volumes,
                pid_namespace,
            }),
            Err(e) => {
                if let Some(ns) = pid_namespace {
                    if let Err(remove_err) = ns.remove() {
                        tracing::error!(
                            path = %ns.path().display(),
                            error = %remove_err,
                            "Failed to remove target PID namespace after failed assembly"
                        );
                    }
                }
                Err(e)
            }
        }
    }

    fn assemble_rest(
        &self,
        generator: &mut Generator,
        pod: &PodSandboxConfig,
        mounts: &MountRequest<'_>,
    ) -> CorralResult<Vec<ContainerVolume>> {
        let container = mounts.container;
        let security = container.security();

        let args: Vec<String> = container
            .command
            .iter()
            .chain(&container.args)
            .cloned()
            .collect();
        if !args.is_empty() {
            generator.set_process_args(args);
        }

        let volumes = MountSetBuilder::with_table(self.config, self.table.clone())
            .build(generator, mounts)?;

        DeviceResolver::new(self.config, self.cdi).apply(generator, container, &pod.annotations)?;

        if container.privileged() {
            let all = Capability {
                add_capabilities: vec!["ALL".to_string()],
                drop_capabilities: Vec::new(),
            };
            self.capabilities.apply(generator, Some(&all))?;
        } else {
            self.capabilities
                .apply(generator, security.capabilities.as_ref())?;
        }

        generator.set_root_readonly(self.config.read_only || security.readonly_rootfs);
        if let Some(label) = mounts.mount_label {
            generator.set_mount_label(label);
        }

        Ok(volumes)
    }
}
