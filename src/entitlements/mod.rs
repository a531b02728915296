//! Entitlement data model: what the account service reports, and the
//! effective view after the trial overlay.

pub mod diff;
pub mod disk_cache;
pub mod reconciler;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use disk_cache::EntitlementsDiskCache;
pub use reconciler::EntitlementReconciler;

/// Feature key for the live-edit entitlement.
pub const FEATURE_LIVE_EDIT: &str = "liveEdit";

/// Feature key for the AI entitlement.
pub const FEATURE_AI_AGENT: &str = "aiAgent";

/// Plan details as reported by the account service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default)]
    pub paid_subscriber: bool,

    /// Expiry in milliseconds since the Unix epoch, when bounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_till: Option<i64>,
}

/// One feature entitlement as reported by the account service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureEntitlement {
    #[serde(default)]
    pub activated: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_till: Option<i64>,

    #[serde(
        default,
        rename = "subscribeURL",
        skip_serializing_if = "Option::is_none"
    )]
    pub subscribe_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade_to_plan: Option<String>,
}

/// Raw `getAppEntitlements` response. Owned by the remote service; cached in
/// memory and, on desktop installs, signed on disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerEntitlements {
    #[serde(default)]
    pub is_success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<PlanInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entitlements: Option<BTreeMap<String, FeatureEntitlement>>,

    /// Opaque profile card data, passed through for the host UI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profileview: Option<serde_json::Value>,
}

impl ServerEntitlements {
    /// Force any entry whose `validTill` has passed into its deactivated
    /// form. Must run before the trial overlay so a stale paid plan cannot
    /// suppress it.
    pub fn prune_expired(&mut self, now_ms: i64) {
        if let Some(plan) = &mut self.plan {
            if plan.valid_till.is_some_and(|till| till < now_ms) {
                tracing::debug!(plan = ?plan.name, "Plan validity lapsed, treating as free");
                plan.paid_subscriber = false;
            }
        }
        if let Some(features) = &mut self.entitlements {
            for (key, feature) in features.iter_mut() {
                if feature.valid_till.is_some_and(|till| till < now_ms) && feature.activated {
                    tracing::debug!(feature = %key, "Entitlement lapsed, deactivating");
                    feature.activated = false;
                }
            }
        }
    }

    pub fn is_paid_subscriber(&self) -> bool {
        self.plan.as_ref().is_some_and(|plan| plan.paid_subscriber)
    }
}

/// The merged view feature gates consume. Derived on demand from the pruned
/// server data, the trial window and the clock; never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveEntitlements {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<PlanInfo>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub entitlements: Option<BTreeMap<String, FeatureEntitlement>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub profileview: Option<serde_json::Value>,

    pub is_in_pro_trial: bool,

    pub trial_days_remaining: i64,
}

impl EffectiveEntitlements {
    /// Server data as-is, with no active trial.
    pub fn from_server(server: ServerEntitlements) -> Self {
        Self {
            plan: server.plan,
            entitlements: server.entitlements,
            profileview: server.profileview,
            is_in_pro_trial: false,
            trial_days_remaining: 0,
        }
    }

    pub fn feature(&self, key: &str) -> Option<&FeatureEntitlement> {
        self.entitlements.as_ref()?.get(key)
    }

    pub fn is_paid_subscriber(&self) -> bool {
        self.plan.as_ref().is_some_and(|plan| plan.paid_subscriber)
    }
}
