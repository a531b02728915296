//! Trial grant policy, evaluated once per app start.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::store::{TrialStore, TrialStoreError};
use super::{TrialRecord, FIRST_INSTALL_TRIAL_DAYS, MS_PER_DAY, SUBSEQUENT_TRIAL_DAYS};
use crate::clock::Clock;
use crate::metrics::MetricCounters;
use crate::notify::{ChangeNotifier, LicensingEvent};

/// Answers "does this user already pay?". Checked before any upsell prompt
/// is emitted; a positive answer always suppresses trial messaging.
#[async_trait]
pub trait SubscriptionProbe: Send + Sync {
    async fn has_paid_subscription(&self) -> bool;
}

/// Lets the host postpone trial activation while startup UI is busy
/// (e.g. a new-project dialog is still up).
pub trait StartupGate: Send + Sync {
    fn should_defer(&self) -> bool;
}

/// Gate that never defers.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoGate;

impl StartupGate for NoGate {
    fn should_defer(&self) -> bool {
        false
    }
}

/// What a policy evaluation decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivationOutcome {
    /// No prior record: full first-install grant.
    FirstGrant { days: i64 },

    /// Newer app version, but the running trial is longer than a
    /// subsequent grant would be: window kept, record re-stamped.
    UpgradeKept { days: i64 },

    /// Newer app version with little or no time left: short re-grant.
    UpgradeRegrant { days: i64 },

    /// Same or older app version with an active trial: nothing to do.
    /// Older versions never re-grant, so rolling back the app cannot
    /// restart the clock.
    Unchanged { days: i64 },

    /// Trial over. `prompted` is true when the trial-ended prompt was
    /// emitted on this evaluation (once per expiry and app version, and
    /// never for paid subscribers).
    Expired { prompted: bool },

    /// The stored record was corrupted; an expired marker was written and
    /// no grant was made.
    CorruptedReset,
}

/// The trial grant state machine.
pub struct TrialPolicy {
    store: Arc<TrialStore>,
    clock: Arc<dyn Clock>,
    probe: Arc<dyn SubscriptionProbe>,
    notifier: Arc<ChangeNotifier>,
    metrics: Arc<MetricCounters>,
    app_version: String,
    startup_done: AtomicBool,
}

impl TrialPolicy {
    pub fn new(
        store: Arc<TrialStore>,
        clock: Arc<dyn Clock>,
        probe: Arc<dyn SubscriptionProbe>,
        notifier: Arc<ChangeNotifier>,
        metrics: Arc<MetricCounters>,
        app_version: impl Into<String>,
    ) -> Self {
        Self {
            store,
            clock,
            probe,
            notifier,
            metrics,
            app_version: app_version.into(),
            startup_done: AtomicBool::new(false),
        }
    }

    /// Evaluate the grant policy against the stored record.
    ///
    /// Idempotent for a same-version, still-active record: calling it again
    /// neither rewrites nor extends anything.
    pub async fn activate(&self) -> ActivationOutcome {
        let now = self.clock.now_ms();
        let current = self.app_version.as_str();

        let existing = match self.store.load() {
            Ok(existing) => existing,
            Err(TrialStoreError::Corrupted) | Err(TrialStoreError::Storage(_)) => {
                // Tamper-resistance overrides every other rule: reset to an
                // expired marker with the prompt already recorded, so
                // corrupting the record buys neither a grant nor a prompt.
                tracing::warn!("Corrupted trial record, resetting to expired marker");
                self.store
                    .save(TrialRecord::expired_marker(current, now));
                self.metrics.count("pro", "trial", "corruptedReset");
                return ActivationOutcome::CorruptedReset;
            }
        };

        let Some(existing) = existing else {
            let end_date = now + FIRST_INSTALL_TRIAL_DAYS * MS_PER_DAY;
            self.store.save(TrialRecord::new(current, end_date));
            self.metrics.count(
                "pro",
                "trialActivate",
                &format!("firstInstall_{}", version_tag(current)),
            );
            self.metrics.count("pro", "trial", "activated");
            tracing::info!(days = FIRST_INSTALL_TRIAL_DAYS, "Pro trial activated");
            self.announce_grant(FIRST_INSTALL_TRIAL_DAYS, true).await;
            return ActivationOutcome::FirstGrant {
                days: FIRST_INSTALL_TRIAL_DAYS,
            };
        };

        let remaining = existing.remaining_days(now);
        let newer = is_newer_version(current, &existing.pro_version);

        if remaining <= 0 && !newer {
            return self.handle_expired(existing).await;
        }

        if !newer {
            tracing::debug!(days = remaining, "Keeping existing trial, no version change");
            return ActivationOutcome::Unchanged { days: remaining };
        }

        // Newer app version: keep the longer window, otherwise re-grant the
        // shorter subsequent-trial length.
        let (days, end_date) = if remaining >= SUBSEQUENT_TRIAL_DAYS {
            tracing::info!(days = remaining, "Newer version, keeping existing trial window");
            self.metrics.count(
                "pro",
                "trialActivate",
                &format!("upgradeKeep_{}", version_tag(current)),
            );
            (remaining, existing.end_date)
        } else {
            tracing::info!(days = SUBSEQUENT_TRIAL_DAYS, "Newer version, granting trial");
            self.metrics.count(
                "pro",
                "trialActivate",
                &format!("upgradeRegrant_{}", version_tag(current)),
            );
            (
                SUBSEQUENT_TRIAL_DAYS,
                now + SUBSEQUENT_TRIAL_DAYS * MS_PER_DAY,
            )
        };

        let kept = end_date == existing.end_date;
        self.store.save(TrialRecord::new(current, end_date));
        self.metrics.count("pro", "trial", "activated");
        self.announce_grant(days, false).await;

        if kept {
            ActivationOutcome::UpgradeKept { days }
        } else {
            ActivationOutcome::UpgradeRegrant { days }
        }
    }

    async fn handle_expired(&self, existing: TrialRecord) -> ActivationOutcome {
        if existing.upgrade_dialog_shown_version.as_deref() == Some(self.app_version.as_str()) {
            tracing::debug!("Trial expired, prompt already recorded for this version");
            return ActivationOutcome::Expired { prompted: false };
        }

        // The paid check takes precedence over any trial-ended messaging.
        let paid = self.probe.has_paid_subscription().await;
        if paid {
            tracing::debug!("Trial expired but user has a paid subscription, prompt skipped");
        } else {
            tracing::info!("Trial expired, emitting trial-ended prompt");
            self.notifier.emit(LicensingEvent::TrialEndedPrompt);
        }

        let mut updated = existing;
        updated.upgrade_dialog_shown_version = Some(self.app_version.clone());
        self.store.save(updated);
        self.metrics.count("pro", "trial", "expired");

        ActivationOutcome::Expired { prompted: !paid }
    }

    async fn announce_grant(&self, days: i64, first_install: bool) {
        if !self.probe.has_paid_subscription().await {
            self.notifier
                .emit(LicensingEvent::TrialStartPrompt { trial_days: days });
        }
        self.notifier.emit(LicensingEvent::ProUpgradeOnInstall {
            trial_days: days,
            first_install,
        });
        self.notifier.entitlements_changed();
    }

    /// Spawn the startup runner: poll until the host stops deferring, then
    /// evaluate exactly once for this session.
    pub fn spawn_startup_activation(
        self: &Arc<Self>,
        gate: Arc<dyn StartupGate>,
        poll: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let policy = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll);
            // The immediate first tick; activation waits one full poll
            // period before its first attempt.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if gate.should_defer() {
                    continue;
                }
                if policy.startup_done.swap(true, Ordering::SeqCst) {
                    break;
                }
                let outcome = policy.activate().await;
                tracing::debug!(?outcome, "Startup trial evaluation finished");
                break;
            }
        })
    }
}

fn version_tag(version: &str) -> String {
    version.replace('.', "_")
}

/// True when `current` is strictly newer than `stored` under dotted numeric
/// ordering. Malformed input on either side compares as "not newer" so a
/// bad version string can never unlock an upgrade grant.
pub(crate) fn is_newer_version(current: &str, stored: &str) -> bool {
    fn parse(version: &str) -> Option<(u64, u64, u64)> {
        let mut parts = version.trim().split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = match parts.next() {
            Some(p) => p.parse().ok()?,
            None => 0,
        };
        let patch = match parts.next() {
            Some(p) => p.parse().ok()?,
            None => 0,
        };
        if parts.next().is_some() {
            return None;
        }
        Some((major, minor, patch))
    }

    match (parse(current), parse(stored)) {
        (Some(current), Some(stored)) => current > stored,
        _ => {
            tracing::warn!(current, stored, "Unparseable version strings in trial check");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::security::crypto::{InstallSalt, SALT_LENGTH};
    use crate::trial::store::MemoryTrialBackend;

    struct StubProbe {
        paid: bool,
    }

    #[async_trait]
    impl SubscriptionProbe for StubProbe {
        async fn has_paid_subscription(&self) -> bool {
            self.paid
        }
    }

    struct Fixture {
        policy: TrialPolicy,
        store: Arc<TrialStore>,
        clock: Arc<FixedClock>,
        events: tokio::sync::broadcast::Receiver<LicensingEvent>,
        metrics: Arc<MetricCounters>,
    }

    fn fixture(app_version: &str, paid: bool) -> Fixture {
        let store = Arc::new(TrialStore::new(
            Box::new(MemoryTrialBackend::new()),
            InstallSalt::from_bytes(&[0x42; SALT_LENGTH]),
        ));
        let clock = Arc::new(FixedClock::new(1_000 * MS_PER_DAY));
        let notifier = Arc::new(ChangeNotifier::new(Duration::from_secs(1)));
        let metrics = Arc::new(MetricCounters::new());
        let events = notifier.subscribe();
        let policy = TrialPolicy::new(
            Arc::clone(&store),
            clock.clone(),
            Arc::new(StubProbe { paid }),
            notifier,
            Arc::clone(&metrics),
            app_version,
        );
        Fixture {
            policy,
            store,
            clock,
            events,
            metrics,
        }
    }

    fn seed(fx: &Fixture, version: &str, remaining_days: i64) {
        let end_date = fx.clock.now_ms() + remaining_days * MS_PER_DAY;
        fx.store.save(TrialRecord::new(version, end_date));
    }

    fn prompt_events(fx: &mut Fixture) -> Vec<LicensingEvent> {
        let mut events = Vec::new();
        while let Ok(event) = fx.events.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_first_run_grants_thirty_days() {
        let mut fx = fixture("1.0.0", false);
        let outcome = fx.policy.activate().await;
        assert_eq!(outcome, ActivationOutcome::FirstGrant { days: 30 });
        assert_eq!(fx.store.remaining_days(fx.clock.now_ms()), 30);

        let events = prompt_events(&mut fx);
        assert!(events.contains(&LicensingEvent::TrialStartPrompt { trial_days: 30 }));
        assert!(events.contains(&LicensingEvent::ProUpgradeOnInstall {
            trial_days: 30,
            first_install: true
        }));
    }

    #[tokio::test]
    async fn test_newer_version_keeps_longer_window() {
        let fx = fixture("1.1.0", false);
        seed(&fx, "1.0.0", 10);

        let outcome = fx.policy.activate().await;
        assert_eq!(outcome, ActivationOutcome::UpgradeKept { days: 10 });
        assert_eq!(fx.store.remaining_days(fx.clock.now_ms()), 10);

        // The record is re-stamped with the current version.
        let record = fx.store.load().unwrap().unwrap();
        assert_eq!(record.pro_version, "1.1.0");
    }

    #[tokio::test]
    async fn test_newer_version_regrants_short_window() {
        let fx = fixture("1.1.0", false);
        seed(&fx, "1.0.0", 2);

        let outcome = fx.policy.activate().await;
        assert_eq!(outcome, ActivationOutcome::UpgradeRegrant { days: 7 });
        assert_eq!(fx.store.remaining_days(fx.clock.now_ms()), 7);
    }

    #[tokio::test]
    async fn test_same_version_is_unchanged() {
        let fx = fixture("1.0.0", false);
        seed(&fx, "1.0.0", 5);

        let outcome = fx.policy.activate().await;
        assert_eq!(outcome, ActivationOutcome::Unchanged { days: 5 });
        assert_eq!(fx.store.remaining_days(fx.clock.now_ms()), 5);
    }

    #[tokio::test]
    async fn test_older_version_never_regrants() {
        let fx = fixture("1.0.0", false);
        seed(&fx, "1.1.0", 3);

        let outcome = fx.policy.activate().await;
        assert_eq!(outcome, ActivationOutcome::Unchanged { days: 3 });
        assert_eq!(fx.store.remaining_days(fx.clock.now_ms()), 3);
    }

    #[tokio::test]
    async fn test_evaluation_is_idempotent() {
        let fx = fixture("1.0.0", false);
        fx.policy.activate().await;
        let first = fx.store.load().unwrap().unwrap();

        let outcome = fx.policy.activate().await;
        assert_eq!(outcome, ActivationOutcome::Unchanged { days: 30 });
        let second = fx.store.load().unwrap().unwrap();
        assert_eq!(first, second, "repeat evaluation must not drift the record");
    }

    #[tokio::test]
    async fn test_expired_prompts_exactly_once_per_version() {
        let mut fx = fixture("1.0.0", false);
        seed(&fx, "1.0.0", 0);
        prompt_events(&mut fx);

        let outcome = fx.policy.activate().await;
        assert_eq!(outcome, ActivationOutcome::Expired { prompted: true });
        assert_eq!(prompt_events(&mut fx), vec![LicensingEvent::TrialEndedPrompt]);

        let outcome = fx.policy.activate().await;
        assert_eq!(outcome, ActivationOutcome::Expired { prompted: false });
        assert!(prompt_events(&mut fx).is_empty());
    }

    #[tokio::test]
    async fn test_paid_subscriber_suppresses_expiry_prompt() {
        let mut fx = fixture("1.0.0", true);
        seed(&fx, "1.0.0", 0);
        prompt_events(&mut fx);

        let outcome = fx.policy.activate().await;
        assert_eq!(outcome, ActivationOutcome::Expired { prompted: false });
        assert!(prompt_events(&mut fx).is_empty());

        // The shown-version marker is still persisted.
        let record = fx.store.load().unwrap().unwrap();
        assert_eq!(record.upgrade_dialog_shown_version.as_deref(), Some("1.0.0"));
    }

    #[tokio::test]
    async fn test_paid_subscriber_suppresses_start_prompt_only() {
        let mut fx = fixture("1.0.0", true);
        let outcome = fx.policy.activate().await;
        assert_eq!(outcome, ActivationOutcome::FirstGrant { days: 30 });

        let events = prompt_events(&mut fx);
        assert!(!events
            .iter()
            .any(|e| matches!(e, LicensingEvent::TrialStartPrompt { .. })));
        assert!(events.contains(&LicensingEvent::ProUpgradeOnInstall {
            trial_days: 30,
            first_install: true
        }));
    }

    #[tokio::test]
    async fn test_corruption_resets_without_grant() {
        let clock = Arc::new(FixedClock::new(1_000 * MS_PER_DAY));
        let notifier = Arc::new(ChangeNotifier::new(Duration::from_secs(1)));
        let mut events = notifier.subscribe();

        // A record claiming 500 days, with a signature that cannot validate.
        let backend = MemoryTrialBackend::new();
        backend.set_raw(
            serde_json::json!({
                "proVersion": "1.0.0",
                "endDate": clock.now_ms() + 500 * MS_PER_DAY,
                "signature": "deadbeef"
            })
            .to_string(),
        );
        let store = Arc::new(TrialStore::new(
            Box::new(backend),
            InstallSalt::from_bytes(&[0x42; SALT_LENGTH]),
        ));
        let policy = TrialPolicy::new(
            Arc::clone(&store),
            clock.clone(),
            Arc::new(StubProbe { paid: false }),
            notifier,
            Arc::new(MetricCounters::new()),
            "1.0.0",
        );

        let outcome = policy.activate().await;
        assert_eq!(outcome, ActivationOutcome::CorruptedReset);
        assert_eq!(store.remaining_days(clock.now_ms()), 0);
        assert!(events.try_recv().is_err(), "no prompt on corruption");

        // Re-running must not issue a fresh 30-day grant, and must not
        // prompt either (the marker already records the shown version).
        let outcome = policy.activate().await;
        assert_eq!(outcome, ActivationOutcome::Expired { prompted: false });
        assert_eq!(store.remaining_days(clock.now_ms()), 0);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_expired_but_newer_version_regrants() {
        let fx = fixture("2.0.0", false);
        seed(&fx, "1.0.0", 0);

        let outcome = fx.policy.activate().await;
        assert_eq!(outcome, ActivationOutcome::UpgradeRegrant { days: 7 });
    }

    #[tokio::test]
    async fn test_grant_metrics_are_counted() {
        let fx = fixture("1.2.0", false);
        fx.policy.activate().await;
        assert_eq!(fx.metrics.value("pro", "trial", "activated"), 1);
        assert_eq!(
            fx.metrics.value("pro", "trialActivate", "firstInstall_1_2_0"),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_runner_waits_for_gate() {
        use std::sync::atomic::{AtomicBool, Ordering};

        struct FlagGate(AtomicBool);
        impl StartupGate for FlagGate {
            fn should_defer(&self) -> bool {
                self.0.load(Ordering::SeqCst)
            }
        }

        let fx = fixture("1.0.0", false);
        let policy = Arc::new(fx.policy);
        let gate = Arc::new(FlagGate(AtomicBool::new(true)));
        let handle =
            policy.spawn_startup_activation(gate.clone(), Duration::from_secs(10));
        // Let the runner register its poll timer.
        tokio::task::yield_now().await;

        // Deferred: several poll periods pass without a grant.
        tokio::time::advance(Duration::from_secs(35)).await;
        tokio::task::yield_now().await;
        assert_eq!(fx.store.remaining_days(fx.clock.now_ms()), 0);

        gate.0.store(false, Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(10)).await;
        handle.await.unwrap();
        assert_eq!(fx.store.remaining_days(fx.clock.now_ms()), 30);
    }

    #[test]
    fn test_version_ordering() {
        assert!(is_newer_version("1.1.0", "1.0.0"));
        assert!(is_newer_version("2.0.0", "1.9.9"));
        assert!(is_newer_version("1.0.10", "1.0.9"));
        assert!(!is_newer_version("1.0.0", "1.0.0"));
        assert!(!is_newer_version("1.0.0", "1.1.0"));
        // Missing components default to zero.
        assert!(is_newer_version("1.1", "1.0.5"));
        // Malformed versions are never "newer".
        assert!(!is_newer_version("garbage", "1.0.0"));
        assert!(!is_newer_version("2.0.0", "garbage"));
        assert!(!is_newer_version("1.2.3.4", "1.0.0"));
        assert!(!is_newer_version("1.0.0-beta.1", "0.9.0"));
    }
}
