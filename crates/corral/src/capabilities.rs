//! Process capability resolution.
//!
//! Reconciles the operator's default capabilities with a request's add and
//! drop lists into the bounding, effective, permitted and (optionally)
//! inheritable sets. The ambient set is always left empty.

use corral_common::{CorralError, CorralResult};
use corral_oci::{CapabilitySet, Generator};

use crate::cri::Capability;

const ALL: &str = "ALL";

/// Capability names known to both the `caps` crate and the running kernel,
/// ordered by capability number.
#[must_use]
pub fn platform_capabilities() -> Vec<String> {
    let supported = caps::runtime::thread_all_supported();
    let mut known: Vec<caps::Capability> = caps::all()
        .into_iter()
        .filter(|cap| supported.contains(cap))
        .collect();
    known.sort_by_key(|cap| cap.index());
    known.into_iter().map(|cap| cap.to_string()).collect()
}

/// Add the `CAP_` prefix to a bare name; a name already prefixed (in any
/// case) is returned unchanged.
#[must_use]
pub fn normalize(name: &str) -> String {
    if name.to_lowercase().starts_with("cap_") {
        name.to_string()
    } else {
        format!("CAP_{}", name.to_uppercase())
    }
}

/// The capability sets resolved for one container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedCapabilities {
    /// Bounding, effective and permitted sets.
    pub granted: Vec<String>,
    /// Inheritable set.
    pub inheritable: Vec<String>,
}

/// Resolves capability requests against the platform's capabilities.
#[derive(Debug, Clone)]
pub struct CapabilityResolver {
    known: Vec<String>,
    defaults: Vec<String>,
    add_inheritable: bool,
}

impl CapabilityResolver {
    /// Resolver over the running platform's capabilities.
    #[must_use]
    pub fn new(defaults: Vec<String>, add_inheritable: bool) -> Self {
        Self::with_known(platform_capabilities(), defaults, add_inheritable)
    }

    /// Resolver over an explicit capability list.
    #[must_use]
    pub const fn with_known(known: Vec<String>, defaults: Vec<String>, add_inheritable: bool) -> Self {
        Self {
            known,
            defaults,
            add_inheritable,
        }
    }

    /// Capabilities this resolver knows.
    #[must_use]
    pub fn known(&self) -> &[String] {
        &self.known
    }

    fn lookup(&self, name: &str) -> Option<&String> {
        self.known.iter().find(|k| k.eq_ignore_ascii_case(name))
    }

    /// Resolve a request into capability sets.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::InvalidCapability`] for an added name the
    /// platform does not know. Unknown names in the drop list are ignored.
    pub fn resolve(&self, request: Option<&Capability>) -> CorralResult<ResolvedCapabilities> {
        let empty = Capability::default();
        let request = request.unwrap_or(&empty);

        let is_all = |c: &String| c.eq_ignore_ascii_case(ALL);
        let add_all = request.add_capabilities.iter().any(is_all);
        let drop_all = request.drop_capabilities.iter().any(is_all);

        let mut adds: Vec<&String> = request.add_capabilities.iter().collect();
        if !add_all && !drop_all {
            adds.extend(self.defaults.iter());
        }

        let mut granted: Vec<String> = Vec::new();
        if add_all {
            granted.extend(self.known.iter().cloned());
        }
        if drop_all {
            granted.clear();
        }

        for cap in adds {
            if is_all(cap) {
                continue;
            }
            let name = normalize(cap);
            let Some(known) = self.lookup(&name) else {
                return Err(CorralError::InvalidCapability { name });
            };
            if !granted.contains(known) {
                granted.push(known.clone());
            }
        }

        for cap in &request.drop_capabilities {
            if is_all(cap) {
                continue;
            }
            let name = normalize(cap);
            granted.retain(|g| !g.eq_ignore_ascii_case(&name));
        }

        let inheritable = if self.add_inheritable {
            granted.clone()
        } else {
            Vec::new()
        };

        Ok(ResolvedCapabilities {
            granted,
            inheritable,
        })
    }

    /// Resolve a request and write the result into the spec, replacing any
    /// capabilities already there.
    ///
    /// # Errors
    ///
    /// See [`CapabilityResolver::resolve`].
    pub fn apply(&self, generator: &mut Generator, request: Option<&Capability>) -> CorralResult<()> {
        let resolved = self.resolve(request)?;
        generator.clear_capabilities();
        for cap in &resolved.granted {
            generator.add_capability(CapabilitySet::Bounding, cap)?;
            generator.add_capability(CapabilitySet::Effective, cap)?;
            generator.add_capability(CapabilitySet::Permitted, cap)?;
        }
        for cap in &resolved.inheritable {
            generator.add_capability(CapabilitySet::Inheritable, cap)?;
        }
        tracing::debug!(count = resolved.granted.len(), "Resolved capabilities");
        Ok(())
    }
}
