//! Container mount set assembly.
//!
//! [`MountSetBuilder`] merges the spec's default mounts, the container's bind
//! mounts and the mounts the pipeline synthesises on its own into one
//! destination-unique set attached to the spec in depth order.

pub mod mountinfo;
pub mod set;
pub mod synthetic;

use std::path::{Path, PathBuf};

use corral_common::{CorralError, CorralResult};
use corral_oci::Generator;
use oci_spec::runtime::{Mount, MountBuilder};

pub use mountinfo::{MountInfo, MountTable};
pub use set::{MountSet, clean_path, depth, is_below, sort_by_depth};
pub use synthetic::{SandboxFiles, cgroup_is_v2, parse_mounts_file, will_run_systemd};

use crate::config::SandboxConfig;
use crate::cri::{self, ContainerConfig, MountPropagation};
use crate::label;

/// A caller bind mount as it was finally resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerVolume {
    /// Destination inside the container.
    pub container_path: PathBuf,
    /// Resolved host source.
    pub host_path: PathBuf,
    /// Mounted read-only.
    pub readonly: bool,
    /// Effective propagation, after storage-root forcing.
    pub propagation: MountPropagation,
    /// Source was requested to be relabelled.
    pub selinux_relabel: bool,
}

/// Per-container inputs to [`MountSetBuilder::build`].
#[derive(Debug, Clone)]
pub struct MountRequest<'a> {
    /// The container being created.
    pub container: &'a ContainerConfig,
    /// Pod-level files shared with the container.
    pub sandbox: SandboxFiles,
    /// SELinux mount label.
    pub mount_label: Option<&'a str>,
    /// Never relabel caller mounts (super-privileged process label).
    pub skip_relabel: bool,
    /// Skip relabelling a source that already carries the label.
    pub maybe_relabel: bool,
    /// Restoring from a checkpoint; missing sources are not created.
    pub restore: bool,
    /// Mounted container root filesystem.
    pub rootfs: Option<&'a Path>,
    /// Container runtime directory.
    pub run_dir: &'a Path,
    /// Volumes declared by the image.
    pub image_volumes: &'a [PathBuf],
}

impl<'a> MountRequest<'a> {
    /// Request with no pod files, labels or image volumes.
    #[must_use]
    pub fn new(container: &'a ContainerConfig, run_dir: &'a Path) -> Self {
        Self {
            container,
            sandbox: SandboxFiles::default(),
            mount_label: None,
            skip_relabel: false,
            maybe_relabel: false,
            restore: false,
            rootfs: None,
            run_dir,
            image_volumes: &[],
        }
    }
}

/// Destinations claimed by the caller.
struct CallerMounts {
    destinations: Vec<PathBuf>,
    has_dev: bool,
    has_sys: bool,
}

impl CallerMounts {
    fn new(mounts: &[cri::Mount]) -> Self {
        let destinations: Vec<PathBuf> = mounts
            .iter()
            .map(|m| clean_path(Path::new(&m.container_path)))
            .collect();
        let has = |p: &str| destinations.iter().any(|d| d == Path::new(p));
        let (has_dev, has_sys) = (has("/dev"), has("/sys"));
        Self {
            destinations,
            has_dev,
            has_sys,
        }
    }

    fn covers(&self, destination: &Path) -> bool {
        let destination = clean_path(destination);
        self.destinations.contains(&destination)
            || (self.has_dev && is_below(&destination, Path::new("/dev")))
            || (self.has_sys && is_below(&destination, Path::new("/sys")))
    }

    fn add_unless_covered(&self, set: &mut MountSet, mounts: impl IntoIterator<Item = Mount>) {
        for mount in mounts {
            if self.covers(mount.destination()) {
                tracing::debug!(destination = %mount.destination().display(), "Caller mount overrides");
                continue;
            }
            set.add(mount);
        }
    }
}

/// Builds a container's mount set.
#[derive(Debug, Clone)]
pub struct MountSetBuilder<'a> {
    config: &'a SandboxConfig,
    table: MountTable,
}

impl<'a> MountSetBuilder<'a> {
    /// Builder validating propagation against the host's mount table.
    ///
    /// # Errors
    ///
    /// Returns an error if `/proc/self/mountinfo` cannot be read.
    pub fn new(config: &'a SandboxConfig) -> CorralResult<Self> {
        Ok(Self::with_table(config, MountTable::from_host()?))
    }

    /// Builder validating propagation against `table`.
    #[must_use]
    pub const fn with_table(config: &'a SandboxConfig, table: MountTable) -> Self {
        Self { config, table }
    }

    /// Replace the spec's mounts with the container's full mount set.
    ///
    /// Returns the caller volumes as they were resolved.
    ///
    /// # Errors
    ///
    /// Fails on an invalid caller mount, a propagation mode the host mount
    /// does not allow, a missing source that may not be created, or a
    /// filesystem error while preparing sources.
    pub fn build(
        &self,
        generator: &mut Generator,
        request: &MountRequest<'_>,
    ) -> CorralResult<Vec<ContainerVolume>> {
        let container = request.container;
        let privileged = container.privileged();

        let mut caller = container.mounts.clone();
        sort_by_depth(&mut caller, |m| Path::new(&m.container_path));
        let claimed = CallerMounts::new(&caller);

        let mut set = MountSet::new();
        claimed.add_unless_covered(&mut set, generator.mounts().iter().cloned());
        generator.clear_mounts();

        let mut volumes = Vec::with_capacity(caller.len());
        let mut binds = Vec::with_capacity(caller.len());
        for mount in &caller {
            let (volume, bind) = self.bind_mount(generator, request, mount)?;
            volumes.push(volume);
            binds.push(bind);
        }

        if !claimed.has_sys {
            set.add(synthetic::cgroup(self.config.cgroup2_rw)?);
        }

        let mode = if self.config.read_only { "ro" } else { "rw" };
        if self.config.read_only {
            claimed.add_unless_covered(&mut set, synthetic::read_only_tmpfs()?);
        }
        if request.sandbox.host_network {
            claimed.add_unless_covered(&mut set, synthetic::host_network(mode)?);
        }
        if privileged {
            claimed.add_unless_covered(&mut set, synthetic::privileged()?);
        }
        if let Some(shm) = &request.sandbox.shm_path {
            claimed.add_unless_covered(&mut set, [synthetic::shm(shm)?]);
        }
        let files = synthetic::host_files(&request.sandbox, mode, request.mount_label)?;
        claimed.add_unless_covered(&mut set, files);

        if privileged {
            set.iter_mut().for_each(synthetic::clear_read_only);
            generator.clear_masked_paths();
            generator.clear_readonly_paths();
        }

        let owner = synthetic::VolumeOwner {
            uid: id_or_root(container.security().run_as_user),
            gid: id_or_root(container.security().run_as_group),
        };
        let image_volumes = synthetic::image_volumes(
            self.config.image_volumes,
            request.image_volumes,
            request.rootfs,
            request.run_dir,
            request.mount_label,
            owner,
        )?;
        binds.extend(
            image_volumes
                .into_iter()
                .filter(|m| !claimed.covers(m.destination())),
        );
        binds.extend(synthetic::subscriptions(
            &self.config.default_mounts_file,
            request.run_dir,
            request.mount_label,
            |dest| claimed.covers(dest),
        )?);

        sort_by_depth(&mut binds, |m| m.destination().as_path());
        for mut bind in binds {
            let mut options = bind.options().clone().unwrap_or_default();
            if !options.iter().any(|o| o == "bind") {
                options.push("bind".to_string());
            }
            bind.set_typ(Some("bind".to_string())).set_options(Some(options));
            set.add(bind);
        }

        if will_run_systemd(generator.process_args()) {
            tracing::debug!("Entrypoint is an init system, adding systemd mounts");
            synthetic::systemd(&mut set, generator, cgroup_is_v2())?;
        }

        let mounts = set.into_sorted();
        tracing::debug!(count = mounts.len(), "Attaching container mounts");
        for mount in mounts {
            generator.add_mount(mount);
        }
        Ok(volumes)
    }

    fn bind_mount(
        &self,
        generator: &mut Generator,
        request: &MountRequest<'_>,
        mount: &cri::Mount,
    ) -> CorralResult<(ContainerVolume, Mount)> {
        let dest = mount.container_path.as_str();
        if dest.is_empty() {
            return Err(CorralError::InvalidMount {
                destination: dest.to_string(),
                reason: "container path is empty".to_string(),
            });
        }
        if mount.host_path.is_empty() {
            return Err(CorralError::InvalidMount {
                destination: dest.to_string(),
                reason: "host path is empty".to_string(),
            });
        }
        if mount.host_path == "/" && dest == "/" {
            tracing::warn!("Mounting the host root onto the container root");
        }

        let host_path = Path::new(&mount.host_path);
        let mut propagation = mount.propagation;
        if propagation == MountPropagation::PropagationPrivate
            && host_path.starts_with(&self.config.storage_root)
        {
            tracing::info!(
                path = %host_path.display(),
                "Host path includes the container storage root, using host-to-container propagation"
            );
            propagation = MountPropagation::PropagationHostToContainer;
        }

        let src = self.resolve_source(request, dest, host_path)?;

        let mut options = vec![if mount.readonly { "ro" } else { "rw" }, "rbind"];
        match propagation {
            MountPropagation::PropagationPrivate => options.push("rprivate"),
            MountPropagation::PropagationBidirectional => {
                self.table.ensure_shared(&src)?;
                options.push("rshared");
                generator.set_rootfs_propagation("rshared")?;
            }
            MountPropagation::PropagationHostToContainer => {
                self.table.ensure_shared_or_slave(&src)?;
                options.push("rslave");
                if !matches!(generator.rootfs_propagation(), "rshared" | "rslave") {
                    generator.set_rootfs_propagation("rslave")?;
                }
            }
        }

        if !mount.selinux_relabel {
            tracing::debug!(path = %src.display(), "Relabel not requested");
        } else if request.skip_relabel {
            tracing::debug!(path = %src.display(), "Skipping relabel for super privileged container");
        } else if let Some(mount_label) = request.mount_label {
            label::relabel(&src, mount_label, false, request.maybe_relabel)?;
        }

        let idmapped = !mount.uid_mappings.is_empty() || !mount.gid_mappings.is_empty();
        if idmapped && !self.config.idmapped_mounts {
            return Err(CorralError::InvalidMount {
                destination: dest.to_string(),
                reason: "idmapped mounts are not supported by the runtime".to_string(),
            });
        }

        let mut builder = MountBuilder::default()
            .destination(PathBuf::from(dest))
            .source(src.clone())
            .options(options.into_iter().map(String::from).collect::<Vec<_>>());
        if idmapped {
            builder = builder
                .uid_mappings(cri::IdMapping::to_spec_all(&mount.uid_mappings)?)
                .gid_mappings(cri::IdMapping::to_spec_all(&mount.gid_mappings)?);
        }
        let bind = builder.build()?;
        let volume = ContainerVolume {
            container_path: PathBuf::from(dest),
            host_path: src,
            readonly: mount.readonly,
            propagation,
            selinux_relabel: mount.selinux_relabel,
        };
        Ok((volume, bind))
    }

    /// Host source of a caller mount, under the bind prefix with symlinks
    /// resolved. Missing sources are created unless rejected or restoring.
    fn resolve_source(
        &self,
        request: &MountRequest<'_>,
        dest: &str,
        host_path: &Path,
    ) -> CorralResult<PathBuf> {
        let prefix = self.config.bind_mount_prefix.as_deref();
        let joined = match prefix {
            Some(prefix) => prefix.join(host_path.strip_prefix("/").unwrap_or(host_path)),
            None => host_path.to_path_buf(),
        };

        let scope = prefix.unwrap_or_else(|| Path::new("/"));
        match scoped_path(scope, host_path) {
            Ok(resolved) if resolved.symlink_metadata().is_ok() => return Ok(resolved),
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(CorralError::os("resolve mount source", host_path, e)),
        }

        let src = clean_path(&joined);
        if self
            .config
            .absent_mount_sources_to_reject
            .iter()
            .any(|reject| clean_path(reject) == src)
        {
            return Err(CorralError::InvalidMount {
                destination: dest.to_string(),
                reason: format!(
                    "source {} does not exist and would be created as a directory",
                    src.display()
                ),
            });
        }
        if request.restore {
            return Err(CorralError::InvalidMount {
                destination: dest.to_string(),
                reason: format!("source {} does not exist", src.display()),
            });
        }
        std::fs::create_dir_all(&src).map_err(|e| CorralError::os("create mount source", &src, e))?;
        Ok(src)
    }
}

fn id_or_root(id: Option<i64>) -> u32 {
    id.and_then(|id| u32::try_from(id).ok()).unwrap_or(0)
}

/// Join `unsafe_path` under `root`, resolving symlinks without leaving it.
pub(crate) fn scoped_path(root: &Path, unsafe_path: &Path) -> std::io::Result<PathBuf> {
    let root = std::fs::canonicalize(root)?;
    let relative = safe_path::scoped_resolve(&root, unsafe_path)?;
    Ok(root.join(relative))
}
