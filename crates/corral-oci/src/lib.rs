//! # corral-oci
//!
//! OCI (Open Container Initiative) runtime spec generation for Corral.
//!
//! This crate provides:
//! - [`Generator`], a builder over [`oci_spec::runtime::Spec`] that the
//!   pipeline stages mutate in order
//! - Constructors for the mounts, device nodes and cgroup rules the stages add

#![warn(missing_docs)]

pub mod generate;
pub mod parts;

pub use generate::{CapabilitySet, Generator, HookStage};
pub use oci_spec::runtime::Spec;
pub use parts::{
    allow_all_rule, allow_rule, capability, capability_name, device, device_type,
    device_type_name, mount,
};
