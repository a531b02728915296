//! Reconciles server-reported entitlements with the local trial window.
//!
//! One instance owns the in-memory entitlements cache and the signed disk
//! fallback; nothing else writes them. Fetch failures follow the taxonomy:
//! transient problems fall back to the last good cache, authoritative
//! rejections clear it, contract errors log and yield nothing.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::disk_cache::EntitlementsDiskCache;
use super::{EffectiveEntitlements, FeatureEntitlement, ServerEntitlements, FEATURE_LIVE_EDIT};
use crate::account::{AccountApi, EntitlementsQuery, FetchError, LoginSession};
use crate::clock::Clock;
use crate::config::LicensingConfig;
use crate::metrics::MetricCounters;
use crate::notify::ChangeNotifier;
use crate::trial::policy::SubscriptionProbe;
use crate::trial::{TrialStore, MS_PER_DAY};

pub struct EntitlementReconciler {
    config: Arc<LicensingConfig>,
    session: Arc<dyn LoginSession>,
    api: Arc<dyn AccountApi>,
    clock: Arc<dyn Clock>,
    trial_store: Arc<TrialStore>,
    disk_cache: Option<EntitlementsDiskCache>,
    cached: Mutex<Option<ServerEntitlements>>,
    notifier: Arc<ChangeNotifier>,
    metrics: Arc<MetricCounters>,
}

impl EntitlementReconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<LicensingConfig>,
        session: Arc<dyn LoginSession>,
        api: Arc<dyn AccountApi>,
        clock: Arc<dyn Clock>,
        trial_store: Arc<TrialStore>,
        disk_cache: Option<EntitlementsDiskCache>,
        notifier: Arc<ChangeNotifier>,
        metrics: Arc<MetricCounters>,
    ) -> Self {
        Self {
            config,
            session,
            api,
            clock,
            trial_store,
            disk_cache,
            cached: Mutex::new(None),
            notifier,
            metrics,
        }
    }

    /// Raw server entitlements, via cache unless `force_refresh`.
    ///
    /// `None` covers logged out, authoritative rejection and unrecoverable
    /// transient failure alike; callers treat all three as "no account".
    pub async fn server_entitlements(&self, force_refresh: bool) -> Option<ServerEntitlements> {
        if !self.session.is_logged_in() {
            return None;
        }

        if !force_refresh {
            if let Some(cached) = self.cached.lock().clone() {
                return Some(cached);
            }
        }

        let Some(auth) = self.session.auth() else {
            // Logged in but no usable session credentials: a host contract
            // error, not something to panic over.
            tracing::error!("Missing session credentials for entitlements fetch");
            self.metrics.count("auth", "entitlements", "missingCreds");
            return None;
        };

        let query = EntitlementsQuery {
            base_url: self.config.account_base_url.clone(),
            language: self.config.language.clone(),
            app_version: self.config.app_version.clone(),
            platform: self.config.platform.clone(),
            app_type: self.config.app_type.clone(),
            auth,
        };

        match self.api.fetch_entitlements(&query).await {
            Ok(fresh) if fresh.is_success => {
                let changed = {
                    let mut cached = self.cached.lock();
                    let changed = cached.as_ref() != Some(&fresh);
                    *cached = Some(fresh.clone());
                    changed
                };
                if let Some(disk) = &self.disk_cache {
                    disk.save(&fresh);
                }
                if changed {
                    self.notifier.entitlements_changed();
                }
                Some(fresh)
            }
            Ok(_) => {
                // HTTP 200 carrying isSuccess=false: the account service
                // says the session is no good.
                tracing::warn!("Entitlements response reported failure, clearing cached state");
                self.metrics.count("auth", "entitlements", "rejected");
                self.clear_caches();
                None
            }
            Err(e) if e.is_transient() => {
                tracing::warn!("Entitlements fetch failed, using cached state: {e}");
                self.fallback_after_transient()
            }
            Err(e) => {
                tracing::warn!("Entitlements request rejected, clearing cached state: {e}");
                self.metrics.count("auth", "entitlements", "rejected");
                self.clear_caches();
                None
            }
        }
    }

    fn fallback_after_transient(&self) -> Option<ServerEntitlements> {
        if let Some(cached) = self.cached.lock().clone() {
            self.metrics.count("auth", "entitlements", "memoryFallback");
            return Some(cached);
        }
        let from_disk = self.disk_cache.as_ref().and_then(|disk| disk.load())?;
        self.metrics.count("auth", "entitlements", "diskFallback");
        *self.cached.lock() = Some(from_disk.clone());
        Some(from_disk)
    }

    /// The merged view consumed by feature gates.
    pub async fn effective_entitlements(
        &self,
        force_refresh: bool,
    ) -> Option<EffectiveEntitlements> {
        let server = self.server_entitlements(force_refresh).await;
        let now = self.clock.now_ms();

        // Prune before merging: a lapsed paid plan must not block the
        // trial overlay below.
        let pruned = server.map(|mut server| {
            server.prune_expired(now);
            server
        });

        let trial_days = self.trial_store.remaining_days(now);
        if trial_days <= 0 {
            return pruned.map(EffectiveEntitlements::from_server);
        }

        // A real subscription always outranks the synthetic trial plan.
        if pruned.as_ref().is_some_and(ServerEntitlements::is_paid_subscriber) {
            return pruned.map(EffectiveEntitlements::from_server);
        }

        Some(self.overlay_trial(pruned, trial_days, now))
    }

    fn overlay_trial(
        &self,
        server: Option<ServerEntitlements>,
        trial_days: i64,
        now_ms: i64,
    ) -> EffectiveEntitlements {
        let server = server.unwrap_or_default();
        let valid_till = now_ms + trial_days * MS_PER_DAY;

        let mut plan = server.plan.unwrap_or_default();
        plan.paid_subscriber = true;
        plan.name = Some(self.config.pro_plan_name.clone());
        plan.valid_till = Some(valid_till);

        let mut features = server.entitlements.unwrap_or_default();
        let live_edit = features
            .entry(FEATURE_LIVE_EDIT.to_string())
            .or_insert_with(|| FeatureEntitlement {
                subscribe_url: Some(self.config.purchase_url.clone()),
                upgrade_to_plan: Some(self.config.pro_plan_name.clone()),
                ..Default::default()
            });
        live_edit.activated = true;
        live_edit.valid_till = Some(valid_till);

        EffectiveEntitlements {
            plan: Some(plan),
            entitlements: Some(features),
            profileview: server.profileview,
            is_in_pro_trial: true,
            trial_days_remaining: trial_days,
        }
    }

    /// Drop all cached entitlement state, e.g. on logout. Fires the change
    /// notification only when there was something to drop.
    pub fn clear(&self) {
        let had_cached = self.cached.lock().take().is_some();
        if let Some(disk) = &self.disk_cache {
            disk.clear();
        }
        if had_cached {
            self.notifier.entitlements_changed();
        }
    }

    fn clear_caches(&self) {
        *self.cached.lock() = None;
        if let Some(disk) = &self.disk_cache {
            disk.clear();
        }
    }
}

#[async_trait]
impl SubscriptionProbe for EntitlementReconciler {
    async fn has_paid_subscription(&self) -> bool {
        self.server_entitlements(false)
            .await
            .is_some_and(|server| server.is_paid_subscriber())
    }
}
