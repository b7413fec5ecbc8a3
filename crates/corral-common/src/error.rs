//! Common error types for the Corral pipeline.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`CorralError`].
pub type CorralResult<T> = Result<T, CorralError>;

/// Errors produced while assembling a pod or container sandbox.
#[derive(Error, Diagnostic, Debug)]
pub enum CorralError {
    /// Invalid administrator or request configuration.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(corral::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// A capability name that the platform does not know.
    #[error("unknown capability {name:?} to add")]
    #[diagnostic(
        code(corral::capability::unknown),
        help("Capability names are matched against the kernel's supported set, e.g. CAP_NET_ADMIN")
    )]
    InvalidCapability {
        /// The normalised capability name.
        name: String,
    },

    /// A device specification that cannot be honoured.
    #[error("invalid device {device:?}: {reason}")]
    #[diagnostic(code(corral::device::invalid))]
    InvalidDevice {
        /// The device as it was requested.
        device: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A mount specification that cannot be honoured.
    #[error("invalid mount {destination:?}: {reason}")]
    #[diagnostic(code(corral::mount::invalid))]
    InvalidMount {
        /// Container destination of the mount.
        destination: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The host mount of a bind source does not allow the requested propagation.
    #[error("path {path:?} is mounted on {mount_point:?} but it is not a {required} mount")]
    #[diagnostic(
        code(corral::mount::propagation),
        help("Make the host mount shared (mount --make-rshared) or request private propagation")
    )]
    Propagation {
        /// The bind mount source.
        path: PathBuf,
        /// The host mount point holding the source.
        mount_point: PathBuf,
        /// Required propagation, e.g. "shared" or "shared/slave".
        required: &'static str,
    },

    /// CDI device resolution or injection failed.
    #[error("CDI error: {message}")]
    #[diagnostic(code(corral::cdi))]
    Cdi {
        /// The error message.
        message: String,
    },

    /// A namespace could not be created, pinned or validated.
    #[error("{ns_type} namespace at {path:?}: {message}")]
    #[diagnostic(code(corral::namespace))]
    Namespace {
        /// Namespace type, e.g. "net".
        ns_type: String,
        /// Pin path of the namespace.
        path: PathBuf,
        /// The error message.
        message: String,
    },

    /// The namespace pinning helper exited unsuccessfully.
    #[error("failed to pin namespaces with {args:?}: {output}")]
    #[diagnostic(code(corral::namespace::helper))]
    Helper {
        /// Arguments passed to the helper.
        args: Vec<String>,
        /// Combined stdout/stderr of the helper, or the spawn error.
        output: String,
    },

    /// A syscall or filesystem operation failed on a specific path.
    #[error("{operation} {path:?}: {source}")]
    #[diagnostic(code(corral::os))]
    Os {
        /// What was being done, e.g. "bind mount".
        operation: &'static str,
        /// The path the operation targeted.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(corral::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(corral::serialization))]
    Serialization(String),

    /// An OCI runtime spec value could not be built.
    #[error("OCI spec error: {0}")]
    #[diagnostic(code(corral::oci_spec))]
    Spec(#[from] oci_spec::OciSpecError),

    /// Feature not supported on this platform.
    #[error("Feature not supported: {feature}")]
    #[diagnostic(
        code(corral::unsupported),
        help("Namespace management requires a Linux host")
    )]
    Unsupported {
        /// The unsupported feature.
        feature: String,
    },

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(code(corral::internal))]
    Internal {
        /// The error message.
        message: String,
    },
}

impl CorralError {
    /// Build a [`CorralError::Config`] from anything printable.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Wrap an OS error with the operation and path it happened on.
    pub fn os(operation: &'static str, path: impl Into<PathBuf>, source: impl Into<std::io::Error>) -> Self {
        Self::Os {
            operation,
            path: path.into(),
            source: source.into(),
        }
    }

    /// Whether the platform simply lacks the feature.
    #[must_use]
    pub const fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported { .. })
    }
}

impl From<serde_json::Error> for CorralError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for CorralError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
