//! # corral-common
//!
//! Shared types for the Corral sandbox assembly pipeline:
//! - Error taxonomy used by every crate
//! - Standard filesystem paths

#![warn(missing_docs)]

pub mod error;
pub mod paths;

pub use error::{CorralError, CorralResult};
pub use paths::CorralPaths;
