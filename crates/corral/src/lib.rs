//! # Corral
//!
//! Node-local sandbox assembly for a Kubernetes container runtime.
//!
//! Corral turns a pod or container request into an OCI runtime spec:
//!
//! - **Namespaces**: pod namespaces pinned by the `pinns` helper and shared
//!   as [`namespace::Namespace`] handles
//! - **Mounts**: caller binds, image volumes, subscriptions and synthetic
//!   mounts merged into one destination-unique set
//! - **Devices**: operator, annotation, host, container and CDI devices with
//!   their cgroup rules
//! - **Capabilities**: default and requested capabilities reconciled against
//!   the platform
//!
//! ## Usage
//!
//! ```no_run
//! use corral::assembler::{ContainerPidLookup, PodContext, SpecAssembler};
//! use corral::cdi::SpecDirRegistry;
//! use corral::config::SandboxConfig;
//! use corral::cri::{ContainerConfig, PodSandboxConfig};
//! use corral::mounts::MountRequest;
//! use corral::namespace::NamespaceManager;
//! use corral_oci::Generator;
//!
//! struct NoTargets;
//!
//! impl ContainerPidLookup for NoTargets {
//!     fn pid(&self, id: &str) -> corral_common::CorralResult<u32> {
//!         Err(corral_common::CorralError::config(format!("unknown container {id}")))
//!     }
//! }
//!
//! # fn example() -> corral_common::CorralResult<()> {
//! let config = SandboxConfig::default();
//! let manager = NamespaceManager::new(&config.namespaces_dir, &config.pinns_path);
//! manager.initialize()?;
//! let cdi = SpecDirRegistry::new(config.cdi_spec_dirs.clone());
//! let assembler = SpecAssembler::new(&config, &manager, &cdi)?;
//!
//! let pod = PodSandboxConfig::default();
//! let namespaces = assembler.create_pod_namespaces(&pod)?;
//! let context = PodContext::new(&pod, &namespaces).with_infra_pid(4242);
//!
//! let container = ContainerConfig::default();
//! let run_dir = config.run_dir_for("ctr");
//! let mut generator = Generator::linux_default()?;
//! let assembled = assembler.assemble(
//!     &mut generator,
//!     &context,
//!     &MountRequest::new(&container, &run_dir),
//!     &NoTargets,
//! )?;
//! let spec = generator.into_spec();
//! # drop((spec, assembled));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod assembler;
pub mod capabilities;
pub mod cdi;
pub mod config;
pub mod cri;
pub mod devices;
pub mod label;
pub mod mounts;
pub mod namespace;

pub use assembler::{AssembledContainer, ContainerPidLookup, PodContext, SpecAssembler};
pub use capabilities::CapabilityResolver;
pub use config::SandboxConfig;
pub use devices::DeviceResolver;
pub use mounts::MountSetBuilder;
pub use namespace::{Namespace, NamespaceManager};
