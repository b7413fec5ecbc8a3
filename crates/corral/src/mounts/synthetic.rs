//! Mounts the pipeline adds on its own.

use std::path::{Path, PathBuf};

use corral_common::{CorralError, CorralResult};
use corral_oci::{Generator, mount};
use oci_spec::runtime::Mount;

use super::set::MountSet;
use crate::config::ImageVolumesMode;
use crate::label;

pub(crate) const CGROUP_PATH: &str = "/sys/fs/cgroup";

/// Pod-level files bind-mounted into every container of the pod.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxFiles {
    /// The pod uses the host's network namespace.
    pub host_network: bool,
    /// Pod shared memory directory.
    pub shm_path: Option<PathBuf>,
    /// Pod `resolv.conf`.
    pub resolv_path: Option<PathBuf>,
    /// Pod `hostname` file.
    pub hostname_path: Option<PathBuf>,
    /// Pod `.containerenv` file.
    pub container_env_path: Option<PathBuf>,
}

/// `/sys/fs/cgroup` for containers that do not bring their own `/sys`.
pub(crate) fn cgroup(rw: bool) -> CorralResult<Mount> {
    mount(
        CGROUP_PATH,
        "cgroup",
        "cgroup",
        &["nosuid", "noexec", "nodev", "relatime", if rw { "rw" } else { "ro" }],
    )
}

/// Writable scratch space on top of a read-only root filesystem.
pub(crate) fn read_only_tmpfs() -> CorralResult<Vec<Mount>> {
    [("/run", "mode=0755"), ("/tmp", "mode=1777"), ("/var/tmp", "mode=1777")]
        .into_iter()
        .map(|(target, mode)| {
            mount(
                target,
                "tmpfs",
                "tmpfs",
                &["rw", "noexec", "nosuid", "nodev", "tmpcopyup", mode],
            )
        })
        .collect()
}

/// Host network pods see a read-only `/sys` and the host's `/etc/hosts`.
pub(crate) fn host_network(mode: &str) -> CorralResult<Vec<Mount>> {
    Ok(vec![
        mount("/sys", "sysfs", "sysfs", &["nosuid", "noexec", "nodev", "ro"])?,
        mount(
            CGROUP_PATH,
            "cgroup",
            "cgroup",
            &["nosuid", "noexec", "nodev", "relatime", "ro"],
        )?,
        mount("/etc/hosts", "bind", "/etc/hosts", &[mode, "bind"])?,
    ])
}

/// Privileged containers get writable `/sys` and cgroup mounts.
pub(crate) fn privileged() -> CorralResult<Vec<Mount>> {
    Ok(vec![
        mount("/sys", "sysfs", "sysfs", &["nosuid", "noexec", "nodev", "rw", "rslave"])?,
        mount(
            CGROUP_PATH,
            "cgroup",
            "cgroup",
            &["nosuid", "noexec", "nodev", "rw", "relatime", "rslave"],
        )?,
    ])
}

/// The pod's shared memory.
pub(crate) fn shm(path: &Path) -> CorralResult<Mount> {
    mount("/dev/shm", "bind", path, &["rw", "bind"])
}

/// `resolv.conf`, `hostname` and `.containerenv` from the pod.
pub(crate) fn host_files(
    files: &SandboxFiles,
    mode: &str,
    mount_label: Option<&str>,
) -> CorralResult<Vec<Mount>> {
    let entries: [(&str, Option<&PathBuf>, &[&str]); 3] = [
        (
            "/etc/resolv.conf",
            files.resolv_path.as_ref(),
            &[mode, "bind", "nodev", "nosuid", "noexec"],
        ),
        ("/etc/hostname", files.hostname_path.as_ref(), &[mode, "bind"]),
        ("/run/.containerenv", files.container_env_path.as_ref(), &[mode, "bind"]),
    ];

    let mut mounts = Vec::new();
    for (destination, source, options) in entries {
        let Some(source) = source else {
            continue;
        };
        if let Some(mount_label) = mount_label {
            label::relabel(source, mount_label, false, false)?;
        }
        mounts.push(mount(destination, "bind", source, options)?);
    }
    Ok(mounts)
}

/// Owner applied to directories created for image volumes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct VolumeOwner {
    pub uid: u32,
    pub gid: u32,
}

/// Volumes declared by the image.
///
/// `Mkdir` creates them inside `rootfs` and returns no mounts; `Bind` backs
/// each with a fresh directory under `<run_dir>/mounts`.
pub(crate) fn image_volumes(
    mode: ImageVolumesMode,
    volumes: &[PathBuf],
    rootfs: Option<&Path>,
    run_dir: &Path,
    mount_label: Option<&str>,
    owner: VolumeOwner,
) -> CorralResult<Vec<Mount>> {
    let mut mounts = Vec::new();
    for dest in volumes {
        match mode {
            ImageVolumesMode::Mkdir => {
                let Some(rootfs) = rootfs else {
                    tracing::debug!(volume = %dest.display(), "No rootfs, not creating image volume");
                    continue;
                };
                let path = super::scoped_path(rootfs, dest)
                    .map_err(|e| CorralError::os("resolve image volume", dest, e))?;
                if !path.exists() {
                    std::fs::create_dir_all(&path)
                        .map_err(|e| CorralError::os("create image volume", &path, e))?;
                    std::os::unix::fs::chown(&path, Some(owner.uid), Some(owner.gid))
                        .map_err(|e| CorralError::os("chown image volume", &path, e))?;
                }
                if let Some(mount_label) = mount_label {
                    label::relabel(&path, mount_label, true, false)?;
                }
            }
            ImageVolumesMode::Bind => {
                let source = run_dir
                    .join("mounts")
                    .join(uuid::Uuid::new_v4().simple().to_string());
                std::fs::create_dir_all(&source)
                    .map_err(|e| CorralError::os("create image volume", &source, e))?;
                if let Some(mount_label) = mount_label {
                    label::relabel(&source, mount_label, true, false)?;
                }
                tracing::debug!(
                    source = %source.display(),
                    volume = %dest.display(),
                    "Adding bind mounted image volume"
                );
                mounts.push(mount(dest, "bind", source, &["private", "bind", "rw"])?);
            }
            ImageVolumesMode::Ignore => {
                tracing::debug!(volume = %dest.display(), "Ignoring image volume");
            }
        }
    }
    Ok(mounts)
}

/// Parse a subscription mounts file: one `host:container` pair per line.
///
/// Blank lines and `#` comments are skipped. A missing file yields nothing.
///
/// # Errors
///
/// Returns [`CorralError::Os`] if the file exists but cannot be read, or
/// [`CorralError::Config`] for a line without a container path.
pub fn parse_mounts_file(path: &Path) -> CorralResult<Vec<(PathBuf, PathBuf)>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(CorralError::os("read mounts file", path, e)),
    };

    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| {
            let (host, container) = line.split_once(':').ok_or_else(|| {
                CorralError::config(format!("invalid line {line:?} in {}", path.display()))
            })?;
            Ok((PathBuf::from(host), PathBuf::from(container)))
        })
        .collect()
}

/// Subscription content from the mounts file, copied under `run_dir` and
/// bind-mounted from there.
pub(crate) fn subscriptions(
    mounts_file: &Path,
    run_dir: &Path,
    mount_label: Option<&str>,
    covered: impl Fn(&Path) -> bool,
) -> CorralResult<Vec<Mount>> {
    let mut mounts = Vec::new();
    for (host, container) in parse_mounts_file(mounts_file)? {
        if !host.exists() {
            tracing::debug!(path = %host.display(), "Subscription source missing, skipping");
            continue;
        }
        if covered(&container) {
            continue;
        }
        let relative = container.strip_prefix("/").unwrap_or(&container);
        let copy = run_dir.join(relative);
        copy_tree(&host, &copy)?;
        if let Some(mount_label) = mount_label {
            label::relabel(&copy, mount_label, false, false)?;
        }
        mounts.push(mount(container, "bind", copy, &["bind", "rprivate"])?);
    }
    Ok(mounts)
}

fn copy_tree(from: &Path, to: &Path) -> CorralResult<()> {
    for entry in walkdir::WalkDir::new(from).follow_links(true) {
        let entry = entry.map_err(|e| {
            let at = e.path().unwrap_or(from).to_path_buf();
            CorralError::os("walk", at, std::io::Error::from(e))
        })?;
        let relative = entry.path().strip_prefix(from).unwrap_or(Path::new(""));
        let target = if relative.as_os_str().is_empty() {
            to.to_path_buf()
        } else {
            to.join(relative)
        };
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)
                .map_err(|e| CorralError::os("create directory", &target, e))?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| CorralError::os("create directory", parent, e))?;
            }
            std::fs::copy(entry.path(), &target)
                .map_err(|e| CorralError::os("copy", entry.path(), e))?;
        }
    }
    Ok(())
}

/// Whether the entrypoint is an init system.
#[must_use]
pub fn will_run_systemd(args: &[String]) -> bool {
    args.first().is_some_and(|entrypoint| {
        entrypoint.contains("/sbin/init")
            || Path::new(entrypoint).file_name().is_some_and(|name| name == "systemd")
    })
}

/// Whether `/sys/fs/cgroup` is a cgroup2 filesystem.
#[cfg(target_os = "linux")]
#[must_use]
pub fn cgroup_is_v2() -> bool {
    use rustix::fs::{FsWord, statfs};

    const CGROUP2_SUPER_MAGIC: FsWord = 0x6367_7270;
    statfs(CGROUP_PATH).is_ok_and(|stat| stat.f_type == CGROUP2_SUPER_MAGIC)
}

#[cfg(not(target_os = "linux"))]
#[must_use]
pub fn cgroup_is_v2() -> bool {
    false
}

/// Scratch filesystems and cgroup access an init system expects.
pub(crate) fn systemd(
    set: &mut MountSet,
    generator: &mut Generator,
    cgroup_v2: bool,
) -> CorralResult<()> {
    let options = ["rw", "rprivate", "noexec", "nosuid", "nodev", "tmpcopyup"];
    for dest in ["/run", "/run/lock", "/tmp", "/var/log/journal"] {
        if !set.contains(Path::new(dest)) {
            set.add(mount(dest, "tmpfs", "tmpfs", &options)?);
        }
    }

    if cgroup_v2 {
        set.add(mount(CGROUP_PATH, "cgroup", "cgroup", &["private", "rw"])?);
    } else {
        set.add(mount(
            "/sys/fs/cgroup/systemd",
            "bind",
            "/sys/fs/cgroup/systemd",
            &["bind", "nodev", "noexec", "nosuid"],
        )?);
        generator.add_masked_path("/sys/fs/cgroup/systemd/release_agent");
    }
    generator.add_env("container", "corral");
    Ok(())
}

/// Drop `ro` and ensure `rw` in a mount's options.
pub(crate) fn clear_read_only(mount: &mut Mount) {
    let mut options = mount.options().clone().unwrap_or_default();
    if options.iter().any(|o| o == "rw") {
        return;
    }
    options.retain(|o| o != "ro");
    options.push("rw".to_string());
    mount.set_options(Some(options));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn systemd_detection() {
        let args = |s: &[&str]| s.iter().map(ToString::to_string).collect::<Vec<_>>();
        assert!(will_run_systemd(&args(&["/sbin/init"])));
        assert!(will_run_systemd(&args(&["/usr/lib/systemd/systemd", "--unit"])));
        assert!(will_run_systemd(&args(&["/usr/sbin/init"])));
        assert!(!will_run_systemd(&args(&["/bin/sh", "/sbin/init"])));
        assert!(!will_run_systemd(&args(&["systemd-resolved"])));
        assert!(!will_run_systemd(&[]));
    }

    #[test]
    fn clear_ro() {
        let mut m = mount("/sys", "sysfs", "sysfs", &["nosuid", "ro"]).unwrap();
        clear_read_only(&mut m);
        assert_eq!(m.options().as_deref(), Some(&["nosuid".to_string(), "rw".to_string()][..]));

        let mut m = mount("/x", "bind", "/x", &["rw", "ro"]).unwrap();
        clear_read_only(&mut m);
        assert_eq!(m.options().as_deref(), Some(&["rw".to_string(), "ro".to_string()][..]));
    }

    #[test]
    fn mounts_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("mounts.conf");
        std::fs::write(&file, "# comment\n\n/usr/share/rhel/secrets:/run/secrets\n").unwrap();
        let pairs = parse_mounts_file(&file).unwrap();
        assert_eq!(
            pairs,
            vec![(PathBuf::from("/usr/share/rhel/secrets"), PathBuf::from("/run/secrets"))]
        );
        assert!(parse_mounts_file(&dir.path().join("missing")).unwrap().is_empty());

        std::fs::write(&file, "no-separator\n").unwrap();
        assert!(parse_mounts_file(&file).is_err());
    }

    #[test]
    fn subscriptions_are_copied() {
        let dir = tempfile::tempdir().unwrap();
        let secrets = dir.path().join("secrets");
        std::fs::create_dir_all(secrets.join("sub")).unwrap();
        std::fs::write(secrets.join("sub/key"), "k").unwrap();
        let file = dir.path().join("mounts.conf");
        std::fs::write(
            &file,
            format!("{}:/run/secrets\n/nonexistent:/run/other\n", secrets.display()),
        )
        .unwrap();
        let run_dir = dir.path().join("run");

        let mounts = subscriptions(&file, &run_dir, None, |_| false).unwrap();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].destination(), Path::new("/run/secrets"));
        assert_eq!(
            std::fs::read_to_string(run_dir.join("run/secrets/sub/key")).unwrap(),
            "k"
        );

        let none = subscriptions(&file, &run_dir, None, |p| p == Path::new("/run/secrets")).unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn bind_image_volumes() {
        let dir = tempfile::tempdir().unwrap();
        let mounts = image_volumes(
            ImageVolumesMode::Bind,
            &[PathBuf::from("/data")],
            None,
            dir.path(),
            None,
            VolumeOwner::default(),
        )
        .unwrap();
        assert_eq!(mounts.len(), 1);
        let source = mounts[0].source().clone().unwrap();
        assert!(source.starts_with(dir.path().join("mounts")));
        assert!(source.is_dir());
        assert_eq!(
            mounts[0].options().clone().unwrap_or_default(),
            vec!["private", "bind", "rw"]
        );
    }

    #[test]
    fn mkdir_image_volumes() {
        let dir = tempfile::tempdir().unwrap();
        let rootfs = dir.path().join("rootfs");
        std::fs::create_dir(&rootfs).unwrap();
        let owner = VolumeOwner {
            uid: rustix::process::geteuid().as_raw(),
            gid: rustix::process::getegid().as_raw(),
        };
        let mounts = image_volumes(
            ImageVolumesMode::Mkdir,
            &[PathBuf::from("/var/lib/app")],
            Some(&rootfs),
            dir.path(),
            None,
            owner,
        )
        .unwrap();
        assert!(mounts.is_empty());
        assert!(rootfs.join("var/lib/app").is_dir());
    }

    #[test]
    fn ignored_image_volumes() {
        let dir = tempfile::tempdir().unwrap();
        let mounts = image_volumes(
            ImageVolumesMode::Ignore,
            &[PathBuf::from("/data")],
            None,
            dir.path(),
            None,
            VolumeOwner::default(),
        )
        .unwrap();
        assert!(mounts.is_empty());
        assert!(!dir.path().join("mounts").exists());
    }
}
