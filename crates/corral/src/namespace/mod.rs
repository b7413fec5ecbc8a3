//! Pod namespace management.
//!
//! Pod-level namespaces are created by an external pinning helper that
//! bind-mounts each new namespace onto a file so it outlives the process that
//! created it:
//! - Network namespace (`netns`)
//! - IPC namespace (`ipcns`)
//! - UTS namespace (`utsns`)
//! - User namespace (`userns`)
//! - PID namespace (`pidns`, only pinned from a running process)

mod handle;
mod manager;
mod pinner;

use std::collections::BTreeMap;
use std::fmt;

use oci_spec::runtime::LinuxNamespaceType;
use serde::{Deserialize, Serialize};

use crate::cri::{IdMapping, NamespaceMode, PodSandboxConfig};

pub use handle::{ManagedNamespace, Namespace};
pub use manager::{NamespaceManager, namespace_path_from_proc};
pub use pinner::{NamespacePinner, PinRequest, PinnsCommand};

/// Kernel namespace types that can be pinned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NsType {
    /// Network namespace.
    Net,
    /// IPC namespace.
    Ipc,
    /// UTS namespace.
    Uts,
    /// User namespace.
    User,
    /// PID namespace.
    Pid,
}

impl NsType {
    /// Every type with a pinning directory.
    pub const ALL: [Self; 5] = [Self::Net, Self::Ipc, Self::Uts, Self::User, Self::Pid];

    /// Name of the entry under `/proc/<pid>/ns`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Net => "net",
            Self::Ipc => "ipc",
            Self::Uts => "uts",
            Self::User => "user",
            Self::Pid => "pid",
        }
    }

    /// Sub-directory of the namespaces dir holding pins of this type.
    #[must_use]
    pub fn dir_name(self) -> String {
        format!("{}ns", self.as_str())
    }

    /// The runtime spec namespace this type maps to.
    #[must_use]
    pub const fn oci_type(self) -> LinuxNamespaceType {
        match self {
            Self::Net => LinuxNamespaceType::Network,
            Self::Ipc => LinuxNamespaceType::Ipc,
            Self::Uts => LinuxNamespaceType::Uts,
            Self::User => LinuxNamespaceType::User,
            Self::Pid => LinuxNamespaceType::Pid,
        }
    }

    /// Helper flag enabling this type, if the helper can create it.
    pub(crate) const fn helper_flag(self) -> Option<&'static str> {
        match self {
            Self::Net => Some("--net"),
            Self::Ipc => Some("--ipc"),
            Self::Uts => Some("--uts"),
            Self::User => Some("--user"),
            Self::Pid => None,
        }
    }
}

impl fmt::Display for NsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One namespace requested for a pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PodNamespace {
    /// Namespace type.
    pub ns_type: NsType,
    /// Ask the helper to pin the host's namespace instead of a new one.
    pub host: bool,
}

/// UID and GID ranges for a pod user namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdMappings {
    /// UID ranges.
    pub uids: Vec<IdMapping>,
    /// GID ranges.
    pub gids: Vec<IdMapping>,
}

impl IdMappings {
    /// Host uid and gid that container root maps to.
    #[must_use]
    pub fn root_pair(&self) -> (u32, u32) {
        (to_host(&self.uids, 0), to_host(&self.gids, 0))
    }
}

fn to_host(mappings: &[IdMapping], id: u32) -> u32 {
    mappings
        .iter()
        .find(|m| id >= m.container_id && id - m.container_id < m.length)
        .map_or(id, |m| m.host_id + (id - m.container_id))
}

/// Namespaces to create for one pod.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodNamespacesConfig {
    /// Requested namespaces in helper order.
    pub namespaces: Vec<PodNamespace>,
    /// User namespace mappings, if the pod runs in its own user namespace.
    pub id_mappings: Option<IdMappings>,
    /// Namespaced sysctls the helper applies after creating the namespaces.
    pub sysctls: BTreeMap<String, String>,
}

impl PodNamespacesConfig {
    /// Derive the pod's namespace request from its sandbox config.
    ///
    /// Network, IPC and UTS are always pinned (host mode pins the host's
    /// namespace); a user namespace is added when the pod asks for one with
    /// mappings.
    #[must_use]
    pub fn from_sandbox(config: &PodSandboxConfig) -> Self {
        let options = &config.linux.security_context.namespace_options;
        let host_network = options.network == NamespaceMode::Node;
        let host_ipc = options.ipc == NamespaceMode::Node;

        let mut namespaces = vec![
            PodNamespace {
                ns_type: NsType::Ipc,
                host: host_ipc,
            },
            PodNamespace {
                ns_type: NsType::Net,
                host: host_network,
            },
            PodNamespace {
                ns_type: NsType::Uts,
                host: host_network,
            },
        ];

        let id_mappings = options
            .userns_options
            .as_ref()
            .filter(|userns| userns.mode == NamespaceMode::Pod && !userns.uids.is_empty())
            .map(|userns| IdMappings {
                uids: userns.uids.clone(),
                gids: userns.gids.clone(),
            });
        if id_mappings.is_some() {
            namespaces.push(PodNamespace {
                ns_type: NsType::User,
                host: false,
            });
        }

        Self {
            namespaces,
            id_mappings,
            sysctls: config.linux.sysctls.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cri::UserNamespace;

    #[test]
    fn dir_names() {
        let names: Vec<_> = NsType::ALL.iter().map(|t| t.dir_name()).collect();
        assert_eq!(names, ["netns", "ipcns", "utsns", "userns", "pidns"]);
    }

    #[test]
    fn pid_has_no_helper_flag() {
        assert_eq!(NsType::Pid.helper_flag(), None);
        assert_eq!(NsType::Net.helper_flag(), Some("--net"));
    }

    #[test]
    fn root_pair_from_mappings() {
        let mappings = IdMappings {
            uids: vec![IdMapping {
                container_id: 0,
                host_id: 100_000,
                length: 65536,
            }],
            gids: vec![IdMapping {
                container_id: 0,
                host_id: 200_000,
                length: 65536,
            }],
        };
        assert_eq!(mappings.root_pair(), (100_000, 200_000));
        assert_eq!(IdMappings::default().root_pair(), (0, 0));
    }

    #[test]
    fn from_sandbox_host_network() {
        let mut config = PodSandboxConfig::default();
        config.linux.security_context.namespace_options.network = NamespaceMode::Node;
        config.linux.sysctls.insert("net.ipv4.ip_forward".into(), "1".into());

        let ns = PodNamespacesConfig::from_sandbox(&config);
        assert_eq!(ns.namespaces.len(), 3);
        let net = ns.namespaces.iter().find(|n| n.ns_type == NsType::Net).unwrap();
        assert!(net.host);
        let ipc = ns.namespaces.iter().find(|n| n.ns_type == NsType::Ipc).unwrap();
        assert!(!ipc.host);
        assert!(ns.id_mappings.is_none());
        assert_eq!(ns.sysctls.len(), 1);
    }

    #[test]
    fn from_sandbox_user_namespace() {
        let mut config = PodSandboxConfig::default();
        config.linux.security_context.namespace_options.userns_options = Some(UserNamespace {
            mode: NamespaceMode::Pod,
            uids: vec![IdMapping {
                container_id: 0,
                host_id: 1000,
                length: 1,
            }],
            gids: vec![IdMapping {
                container_id: 0,
                host_id: 1000,
                length: 1,
            }],
        });

        let ns = PodNamespacesConfig::from_sandbox(&config);
        assert!(ns.namespaces.iter().any(|n| n.ns_type == NsType::User));
        assert_eq!(ns.id_mappings.unwrap().root_pair(), (1000, 1000));
    }
}
