//! The licensing context object hosts talk to.
//!
//! One [`Licensing`] instance is constructed at process start, owns the
//! reconciler, trial policy, notifier and monitor, and receives every
//! collaborator explicitly; there is no ambient module state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::account::{AccountApi, LoginSession};
use crate::clock::Clock;
use crate::config::{ConfigError, LicensingConfig};
use crate::entitlements::{
    EffectiveEntitlements, EntitlementReconciler, EntitlementsDiskCache, FeatureEntitlement,
    PlanInfo, ServerEntitlements, FEATURE_LIVE_EDIT,
};
use crate::gates::Capabilities;
use crate::metrics::MetricCounters;
use crate::monitor::EntitlementsMonitor;
use crate::notify::{ChangeNotifier, LicensingEvent};
use crate::security::credstore::CredentialStore;
use crate::security::crypto::InstallSalt;
use crate::trial::store::{CredentialTrialBackend, FileTrialBackend, TrialStorageBackend};
use crate::trial::{ActivationOutcome, StartupGate, TrialPolicy, TrialStore, MS_PER_DAY};

/// Nominal validity stamped onto the synthetic free plan.
const FREE_PLAN_VALIDITY_DAYS: i64 = 10_000;

/// Everything the licensing subsystem needs from its host.
pub struct Collaborators {
    pub session: Arc<dyn LoginSession>,
    pub api: Arc<dyn AccountApi>,
    pub credentials: Arc<dyn CredentialStore>,
    pub clock: Arc<dyn Clock>,
    pub startup_gate: Arc<dyn StartupGate>,
}

/// Facade over the licensing subsystem.
pub struct Licensing {
    config: Arc<LicensingConfig>,
    reconciler: Arc<EntitlementReconciler>,
    policy: Arc<TrialPolicy>,
    notifier: Arc<ChangeNotifier>,
    monitor: Arc<EntitlementsMonitor>,
    metrics: Arc<MetricCounters>,
    clock: Arc<dyn Clock>,
    startup_gate: Arc<dyn StartupGate>,

    /// Memoized effective view, invalidated by the change event. The outer
    /// `None` means "not computed yet"; the inner `None` is a real
    /// logged-out result and is memoized too.
    effective_memo: tokio::sync::Mutex<Option<Option<EffectiveEntitlements>>>,
    started: AtomicBool,
}

impl Licensing {
    /// Build the licensing context. Must be called within a tokio runtime
    /// (the change notifier spawns its debounce worker immediately).
    pub fn new(
        config: LicensingConfig,
        collaborators: Collaborators,
    ) -> Result<Arc<Self>, ConfigError> {
        let Collaborators {
            session,
            api,
            credentials,
            clock,
            startup_gate,
        } = collaborators;

        let config = Arc::new(config.validate()?);
        let salt = InstallSalt::load_or_create(credentials.as_ref());

        let trial_backend: Box<dyn TrialStorageBackend> = if config.uses_credential_trial_store()
        {
            Box::new(CredentialTrialBackend::new(Arc::clone(&credentials)))
        } else {
            Box::new(FileTrialBackend::new(&config.data_dir))
        };
        let trial_store = Arc::new(TrialStore::new(trial_backend, salt.clone()));

        let disk_cache = config
            .uses_credential_trial_store()
            .then(|| EntitlementsDiskCache::new(&config.data_dir, salt));

        let notifier = Arc::new(ChangeNotifier::new(config.debounce_window));
        let metrics = Arc::new(MetricCounters::new());

        let reconciler = Arc::new(EntitlementReconciler::new(
            Arc::clone(&config),
            session,
            api,
            Arc::clone(&clock),
            Arc::clone(&trial_store),
            disk_cache,
            Arc::clone(&notifier),
            Arc::clone(&metrics),
        ));

        let probe: Arc<dyn crate::trial::SubscriptionProbe> = reconciler.clone();
        let policy = Arc::new(TrialPolicy::new(
            trial_store,
            Arc::clone(&clock),
            probe,
            Arc::clone(&notifier),
            Arc::clone(&metrics),
            config.app_version.clone(),
        ));

        let monitor = Arc::new(EntitlementsMonitor::new(
            Arc::clone(&reconciler),
            Arc::clone(&notifier),
            Arc::clone(&clock),
            config.monitor_initial_delay,
            config.monitor_interval,
        ));

        Ok(Arc::new(Self {
            config,
            reconciler,
            policy,
            notifier,
            monitor,
            metrics,
            clock,
            startup_gate,
            effective_memo: tokio::sync::Mutex::new(None),
            started: AtomicBool::new(false),
        }))
    }

    /// Start the background pieces: startup trial activation, the periodic
    /// entitlements monitor, and memo invalidation. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let _activation = self
            .policy
            .spawn_startup_activation(Arc::clone(&self.startup_gate), self.config.activation_poll);
        let _monitor = self.monitor.start();

        // Drop the memoized view whenever entitlements change, so the next
        // read recomputes.
        let licensing = Arc::clone(self);
        let mut events = self.notifier.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(LicensingEvent::EntitlementsChanged) => {
                        *licensing.effective_memo.lock().await = None;
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                        *licensing.effective_memo.lock().await = None;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        tracing::info!("Licensing subsystem started");
    }

    /// Subscribe to licensing events.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<LicensingEvent> {
        self.notifier.subscribe()
    }

    /// The merged entitlements view, memoized until the next change event.
    pub async fn effective_entitlements(&self) -> Option<EffectiveEntitlements> {
        let mut memo = self.effective_memo.lock().await;
        if let Some(value) = memo.as_ref() {
            return value.clone();
        }
        let value = self.reconciler.effective_entitlements(false).await;
        *memo = Some(value.clone());
        value
    }

    /// Raw server entitlements; trial information is never present here.
    pub async fn raw_entitlements(&self, force_refresh: bool) -> Option<ServerEntitlements> {
        self.reconciler.server_entitlements(force_refresh).await
    }

    /// Plan details, falling back to the free plan when nothing applies.
    /// While a trial is active `paid_subscriber` is true by construction.
    pub async fn plan_details(&self) -> PlanInfo {
        if let Some(plan) = self
            .effective_entitlements()
            .await
            .and_then(|effective| effective.plan)
        {
            return plan;
        }
        PlanInfo {
            name: Some(self.config.free_plan_name.clone()),
            paid_subscriber: false,
            valid_till: Some(self.clock.now_ms() + FREE_PLAN_VALIDITY_DAYS * MS_PER_DAY),
        }
    }

    pub async fn is_in_pro_trial(&self) -> bool {
        self.effective_entitlements()
            .await
            .is_some_and(|effective| effective.is_in_pro_trial)
    }

    pub async fn trial_remaining_days(&self) -> i64 {
        self.effective_entitlements()
            .await
            .map(|effective| effective.trial_days_remaining)
            .unwrap_or(0)
    }

    /// Live-edit entitlement with the canonical upsell fallback.
    pub async fn live_edit_entitlement(&self) -> FeatureEntitlement {
        if let Some(feature) = self
            .effective_entitlements()
            .await
            .and_then(|effective| effective.feature(FEATURE_LIVE_EDIT).cloned())
        {
            return feature;
        }
        FeatureEntitlement {
            activated: false,
            valid_till: None,
            subscribe_url: Some(self.config.purchase_url.clone()),
            upgrade_to_plan: Some(self.config.pro_plan_name.clone()),
        }
    }

    /// Typed capability set for feature gating.
    pub async fn capabilities(&self) -> Capabilities {
        Capabilities::from_effective(self.effective_entitlements().await.as_ref())
    }

    /// Evaluate the trial policy immediately, bypassing the startup poll.
    pub async fn activate_trial_now(&self) -> ActivationOutcome {
        self.policy.activate().await
    }

    /// Run one reconciliation pass immediately, bypassing the timer.
    pub async fn check_entitlements_now(&self) {
        self.monitor.check_once().await;
    }

    /// Drop cached account state after a logout.
    pub fn clear_account_state(&self) {
        self.reconciler.clear();
    }

    pub fn metrics(&self) -> &MetricCounters {
        &self.metrics
    }
}
