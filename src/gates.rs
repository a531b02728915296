//! Capability model for pro feature gating.
//!
//! This module is the single source of truth for which feature keys the
//! editor understands; call sites gate on [`Capabilities`] instead of
//! poking at raw entitlement maps.

use std::collections::HashSet;

use thiserror::Error;

use crate::entitlements::EffectiveEntitlements;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Live preview editing.
    LiveEdit,
    /// AI assistant features.
    AiAgent,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::LiveEdit => "liveEdit",
            Capability::AiAgent => "aiAgent",
        }
    }

    /// Map a server feature key onto a capability, tolerating case and
    /// separator differences.
    pub fn from_feature(value: &str) -> Option<Self> {
        let normalized: String = value
            .trim()
            .to_lowercase()
            .chars()
            .filter(|c| !matches!(c, '-' | '_' | ' '))
            .collect();
        match normalized.as_str() {
            "liveedit" => Some(Capability::LiveEdit),
            "aiagent" => Some(Capability::AiAgent),
            _ => None,
        }
    }
}

/// The set of capabilities currently activated for this user.
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    enabled: HashSet<Capability>,
}

impl Capabilities {
    /// Derive the enabled set from an effective entitlements view; a
    /// missing view yields the empty set.
    pub fn from_effective(effective: Option<&EffectiveEntitlements>) -> Self {
        let mut enabled = HashSet::new();
        let features = effective.and_then(|e| e.entitlements.as_ref());
        if let Some(features) = features {
            for (key, feature) in features {
                if !feature.activated {
                    continue;
                }
                match Capability::from_feature(key) {
                    Some(cap) => {
                        enabled.insert(cap);
                    }
                    None => tracing::debug!(feature = %key, "Unknown feature key ignored"),
                }
            }
        }
        Self { enabled }
    }

    pub fn has(&self, cap: Capability) -> bool {
        self.enabled.contains(&cap)
    }

    pub fn require(&self, cap: Capability) -> Result<(), CapabilityError> {
        if self.has(cap) {
            Ok(())
        } else {
            Err(CapabilityError::Missing(cap))
        }
    }
}

#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("Missing capability: {0:?}")]
    Missing(Capability),
}
