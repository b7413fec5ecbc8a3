//! SELinux labelling of mount sources.

use std::fmt;
use std::path::Path;

use corral_common::{CorralError, CorralResult};

const XATTR_NAME: &str = "security.selinux";

/// Host paths that are never relabelled.
const EXCLUDED_PATHS: &[&str] = &[
    "/", "/bin", "/boot", "/dev", "/etc", "/etc/passwd", "/etc/pki", "/etc/shadow", "/home",
    "/lib", "/lib64", "/media", "/opt", "/proc", "/root", "/run", "/sbin", "/srv", "/sys",
    "/tmp", "/usr", "/var", "/var/lib", "/var/log", "/var/spool", "/var/tmp",
];

/// SELinux security context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SELinuxContext {
    /// User component.
    pub user: String,
    /// Role component.
    pub role: String,
    /// Type component.
    pub type_: String,
    /// Level component (optional).
    pub level: Option<String>,
}

impl SELinuxContext {
    /// Parse a context string.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::Config`] for fewer than three components.
    pub fn parse(context: &str) -> CorralResult<Self> {
        let mut parts = context.splitn(4, ':');
        let (Some(user), Some(role), Some(type_)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(CorralError::config(format!("invalid SELinux context: {context}")));
        };
        Ok(Self {
            user: user.to_string(),
            role: role.to_string(),
            type_: type_.to_string(),
            level: parts.next().map(String::from),
        })
    }

    /// The same context with its categories removed, so every container
    /// can share the labelled content.
    #[must_use]
    pub fn shared(&self) -> Self {
        Self {
            level: self.level.as_ref().map(|_| "s0".to_string()),
            ..self.clone()
        }
    }

    /// Check if SELinux is enabled.
    #[cfg(target_os = "linux")]
    #[must_use]
    pub fn is_enabled() -> bool {
        Path::new("/sys/fs/selinux/enforce").exists()
    }

    #[cfg(not(target_os = "linux"))]
    #[must_use]
    pub fn is_enabled() -> bool {
        false
    }
}

impl fmt::Display for SELinuxContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.user, self.role, self.type_)?;
        if let Some(level) = &self.level {
            write!(f, ":{level}")?;
        }
        Ok(())
    }
}

/// Current label of `path`, if it has one.
#[cfg(target_os = "linux")]
#[must_use]
pub fn file_label(path: &Path) -> Option<String> {
    let mut buf = [0u8; 512];
    let len = rustix::fs::lgetxattr(path, XATTR_NAME, &mut buf[..]).ok()?;
    let value = buf[..len].strip_suffix(&[0]).unwrap_or(&buf[..len]);
    Some(String::from_utf8_lossy(value).into_owned())
}

#[cfg(not(target_os = "linux"))]
#[must_use]
pub fn file_label(_path: &Path) -> Option<String> {
    None
}

/// Label `path` and everything below it with `label`.
///
/// Nothing happens when SELinux is disabled or the label is empty. With
/// `shared` the categories are stripped from the label first. With
/// `skip_if_labelled` the tree is left alone when its top already carries the
/// label. Filesystems without xattr support are tolerated.
///
/// # Errors
///
/// Returns [`CorralError::InvalidMount`] for a protected system path, or
/// [`CorralError::Os`] if a label cannot be written.
pub fn relabel(path: &Path, label: &str, shared: bool, skip_if_labelled: bool) -> CorralResult<()> {
    if label.is_empty() || !SELinuxContext::is_enabled() {
        return Ok(());
    }
    relabel_tree(path, label, shared, skip_if_labelled)
}

fn relabel_tree(path: &Path, label: &str, shared: bool, skip_if_labelled: bool) -> CorralResult<()> {
    let clean = crate::mounts::clean_path(path);
    if EXCLUDED_PATHS.iter().any(|p| Path::new(p) == clean) {
        return Err(CorralError::InvalidMount {
            destination: path.display().to_string(),
            reason: "relabeling content in this path is not allowed".to_string(),
        });
    }

    let context = SELinuxContext::parse(label)?;
    let context = if shared { context.shared() } else { context };
    let value = context.to_string();

    if skip_if_labelled && file_label(path).as_deref() == Some(value.as_str()) {
        tracing::debug!(path = %path.display(), "Label already correct, skipping relabel");
        return Ok(());
    }

    for entry in walkdir::WalkDir::new(path).follow_links(false) {
        let entry = entry.map_err(|e| {
            let target = e.path().unwrap_or(path).to_path_buf();
            CorralError::os("walk", target, std::io::Error::from(e))
        })?;
        set_label(entry.path(), &value)?;
    }
    tracing::debug!(path = %path.display(), label = %value, "Relabelled");
    Ok(())
}

#[cfg(target_os = "linux")]
fn set_label(path: &Path, value: &str) -> CorralResult<()> {
    use rustix::fs::{XattrFlags, lsetxattr};
    use rustix::io::Errno;

    match lsetxattr(path, XATTR_NAME, value.as_bytes(), XattrFlags::empty()) {
        Ok(()) | Err(Errno::NOTSUP) => Ok(()),
        Err(e) => Err(CorralError::os("relabel", path, e)),
    }
}

#[cfg(not(target_os = "linux"))]
fn set_label(_path: &Path, _value: &str) -> CorralResult<()> {
    Ok(())
}
