//! Host mount table, parsed from `/proc/self/mountinfo`.

use std::path::{Path, PathBuf};

use corral_common::{CorralError, CorralResult};

/// One line of mountinfo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    /// Where the filesystem is mounted.
    pub mount_point: PathBuf,
    /// Optional fields, e.g. `shared:12` or `master:3`.
    pub optional: Vec<String>,
    /// Filesystem type.
    pub fs_type: String,
}

impl MountInfo {
    /// Whether the mount is a member of a peer group.
    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.optional.iter().any(|o| o.starts_with("shared:"))
    }

    /// Whether the mount receives propagation from a master.
    #[must_use]
    pub fn is_slave(&self) -> bool {
        self.optional.iter().any(|o| o.starts_with("master:"))
    }
}

/// The host's mounts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountTable {
    entries: Vec<MountInfo>,
}

impl MountTable {
    /// Table from explicit entries.
    #[must_use]
    pub const fn new(entries: Vec<MountInfo>) -> Self {
        Self { entries }
    }

    /// Read the calling process's mount table.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::Os`] if mountinfo cannot be read, or
    /// [`CorralError::Internal`] if it is malformed.
    pub fn from_host() -> CorralResult<Self> {
        let path = Path::new("/proc/self/mountinfo");
        let content =
            std::fs::read_to_string(path).map_err(|e| CorralError::os("read", path, e))?;
        Self::parse(&content)
    }

    /// Parse mountinfo text.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::Internal`] for a line without the fields every
    /// mountinfo line carries.
    pub fn parse(content: &str) -> CorralResult<Self> {
        let entries = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(parse_line)
            .collect::<CorralResult<Vec<_>>>()?;
        Ok(Self { entries })
    }

    /// All entries.
    #[must_use]
    pub fn entries(&self) -> &[MountInfo] {
        &self.entries
    }

    /// The mount holding `path`: the longest mount point that is a
    /// component-wise prefix of it.
    #[must_use]
    pub fn source_mount(&self, path: &Path) -> Option<&MountInfo> {
        self.entries
            .iter()
            .filter(|info| path.starts_with(&info.mount_point))
            .max_by_key(|info| info.mount_point.as_os_str().len())
    }

    /// Require the mount holding `path` to be shared.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::Propagation`] if it is not, or
    /// [`CorralError::InvalidMount`] if no mount holds `path`.
    pub fn ensure_shared(&self, path: &Path) -> CorralResult<()> {
        let info = self.require_source(path)?;
        if info.is_shared() {
            return Ok(());
        }
        Err(CorralError::Propagation {
            path: path.to_path_buf(),
            mount_point: info.mount_point.clone(),
            required: "shared",
        })
    }

    /// Require the mount holding `path` to be shared or slave.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::Propagation`] if it is neither, or
    /// [`CorralError::InvalidMount`] if no mount holds `path`.
    pub fn ensure_shared_or_slave(&self, path: &Path) -> CorralResult<()> {
        let info = self.require_source(path)?;
        if info.is_shared() || info.is_slave() {
            return Ok(());
        }
        Err(CorralError::Propagation {
            path: path.to_path_buf(),
            mount_point: info.mount_point.clone(),
            required: "shared or slave",
        })
    }

    fn require_source(&self, path: &Path) -> CorralResult<&MountInfo> {
        self.source_mount(path).ok_or_else(|| CorralError::InvalidMount {
            destination: path.display().to_string(),
            reason: "could not find source mount".to_string(),
        })
    }
}

fn parse_line(line: &str) -> CorralResult<MountInfo> {
    let malformed = || CorralError::Internal {
        message: format!("malformed mountinfo line: {line:?}"),
    };

    let fields: Vec<&str> = line.split(' ').collect();
    let separator = fields.iter().position(|f| *f == "-").ok_or_else(malformed)?;
    if separator < 6 || fields.len() < separator + 2 {
        return Err(malformed());
    }

    Ok(MountInfo {
        mount_point: PathBuf::from(unescape(fields[4])),
        optional: fields[6..separator].iter().map(ToString::to_string).collect(),
        fs_type: unescape(fields[separator + 1]),
    })
}

/// Undo the kernel's octal escaping of space, tab, newline and backslash.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits
                    .iter()
                    .fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
23 22 0:21 / /proc rw,nosuid,nodev,noexec,relatime shared:12 - proc proc rw
24 22 0:22 / /sys rw,nosuid,nodev,noexec,relatime - sysfs sysfs rw
40 22 8:2 / /var/lib rw,relatime master:7 - ext4 /dev/sda2 rw
41 22 8:3 / /mnt/with\\040space rw,relatime - ext4 /dev/sda3 rw
42 22 8:4 / /srv rw - xfs /dev/sdb1 rw
43 42 0:50 / /srv/private rw shared:30 master:2 - tmpfs tmpfs rw
";

    #[test]
    fn parses_entries() {
        let table = MountTable::parse(SAMPLE).unwrap();
        assert_eq!(table.entries().len(), 7);
        assert_eq!(table.entries()[4].mount_point, PathBuf::from("/mnt/with space"));
        assert_eq!(table.entries()[6].optional, vec!["shared:30", "master:2"]);
        assert_eq!(table.entries()[1].fs_type, "proc");
    }

    #[test]
    fn rejects_malformed() {
        assert!(MountTable::parse("22 1 8:1 / /").is_err());
    }

    #[test]
    fn longest_prefix_wins() {
        let table = MountTable::parse(SAMPLE).unwrap();
        let info = table.source_mount(Path::new("/var/lib/kubelet/pods")).unwrap();
        assert_eq!(info.mount_point, PathBuf::from("/var/lib"));
        let info = table.source_mount(Path::new("/var/library")).unwrap();
        assert_eq!(info.mount_point, PathBuf::from("/"));
    }

    #[test]
    fn propagation_checks() {
        let table = MountTable::parse(SAMPLE).unwrap();
        table.ensure_shared(Path::new("/data")).unwrap();
        table.ensure_shared_or_slave(Path::new("/var/lib/x")).unwrap();
        assert!(matches!(
            table.ensure_shared(Path::new("/var/lib/x")),
            Err(CorralError::Propagation { required: "shared", .. })
        ));
        assert!(table.ensure_shared_or_slave(Path::new("/srv/data")).is_err());
        table.ensure_shared(Path::new("/srv/private/x")).unwrap();
    }

    #[test]
    fn host_table_has_root() {
        let table = MountTable::from_host().unwrap();
        assert!(table.source_mount(Path::new("/")).is_some());
    }
}
