//! Domain configuration.

use serde::{Deserialize, Serialize};

/// Settings for a new [`EntityDomain`](crate::domain::EntityDomain).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainConfig {
    /// Name attached to the domain's log events.
    pub label: String,
    /// Entity slots reserved up front.
    pub entity_capacity: usize,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            label: "domain".to_owned(),
            entity_capacity: 256,
        }
    }
}
