//! Namespace pinning helper invocation.

use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::path::{Path, PathBuf};
use std::process::Command;

use corral_common::{CorralError, CorralResult};

use super::{IdMappings, PodNamespace};
use crate::cri::IdMapping;

/// Everything the helper needs to pin one batch of namespaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinRequest {
    /// Namespaces directory; pins land in `<dir>/<type>ns/<batch_id>`.
    pub dir: PathBuf,
    /// Batch id used as the file name of every pin.
    pub batch_id: String,
    /// Namespaces to create.
    pub namespaces: Vec<PodNamespace>,
    /// Sysctls to apply inside the new namespaces.
    pub sysctls: BTreeMap<String, String>,
    /// User namespace mappings.
    pub id_mappings: Option<IdMappings>,
}

impl PinRequest {
    /// Pin path for one namespace of this batch.
    #[must_use]
    pub fn pin_path(&self, ns: &PodNamespace) -> PathBuf {
        self.dir.join(ns.ns_type.dir_name()).join(&self.batch_id)
    }

    /// Command-line arguments for the helper.
    #[must_use]
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "-d".to_string(),
            self.dir.display().to_string(),
            "-f".to_string(),
            self.batch_id.clone(),
        ];

        for (key, value) in &self.sysctls {
            args.push("-s".to_string());
            args.push(format!("{key}={value}"));
        }

        for ns in &self.namespaces {
            let Some(flag) = ns.ns_type.helper_flag() else {
                continue;
            };
            if ns.host {
                args.push(format!("{flag}=host"));
            } else {
                args.push(flag.to_string());
            }
        }

        if let Some(mappings) = &self.id_mappings {
            args.push(format!("--uid-mapping={}", encode_mappings(&mappings.uids)));
            args.push(format!("--gid-mapping={}", encode_mappings(&mappings.gids)));
        }

        args
    }
}

/// `container-host-length@` per range, in order.
fn encode_mappings(mappings: &[IdMapping]) -> String {
    mappings.iter().fold(String::new(), |mut out, m| {
        let _ = write!(out, "{}-{}-{}@", m.container_id, m.host_id, m.length);
        out
    })
}

/// Runs the pinning helper.
///
/// Implementations block until the helper has finished and every requested
/// pin exists, or fail with [`CorralError::Helper`].
pub trait NamespacePinner: Send + Sync + fmt::Debug {
    /// Pin the namespaces described by `request`.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::Helper`] if the helper cannot be run or exits
    /// unsuccessfully.
    fn pin(&self, request: &PinRequest) -> CorralResult<()>;
}

/// Pins namespaces by running the `pinns` binary.
#[derive(Debug, Clone)]
pub struct PinnsCommand {
    path: PathBuf,
}

impl PinnsCommand {
    /// Use the helper at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Helper binary path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl NamespacePinner for PinnsCommand {
    fn pin(&self, request: &PinRequest) -> CorralResult<()> {
        let args = request.args();
        tracing::debug!(helper = %self.path.display(), ?args, "Calling pinning helper");

        let output = Command::new(&self.path)
            .args(&args)
            .output()
            .map_err(|e| CorralError::Helper {
                args: args.clone(),
                output: format!("failed to run {}: {e}", self.path.display()),
            })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            return Err(CorralError::Helper {
                args,
                output: format!("{} ({})", combined.trim_end(), output.status),
            });
        }

        tracing::debug!(output = %combined.trim_end(), "Pinning helper finished");
        Ok(())
    }
}
