use std::collections::BTreeSet;

use crate::core::Result;
use crate::persister::PersisterRegistry;

/// Per-session state that changes the shape of load plans.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct LoadQueryInfluencers {
    enabled_profiles: BTreeSet<String>,
}

impl LoadQueryInfluencers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable a fetch profile known to `registry`.
    pub fn enable_fetch_profile(&mut self, registry: &PersisterRegistry, name: &str) -> Result<()> {
        registry.profile(name)?;
        self.enabled_profiles.insert(name.to_string());
        Ok(())
    }

    pub fn disable_fetch_profile(&mut self, name: &str) -> bool {
        self.enabled_profiles.remove(name)
    }

    pub fn is_fetch_profile_enabled(&self, name: &str) -> bool {
        self.enabled_profiles.contains(name)
    }

    pub fn enabled_profiles(&self) -> impl Iterator<Item = &str> {
        self.enabled_profiles.iter().map(String::as_str)
    }

    pub fn has_enabled_profiles(&self) -> bool {
        !self.enabled_profiles.is_empty()
    }
}
