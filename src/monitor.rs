//! Periodic entitlements reconciliation.
//!
//! A long-lived task recomputes the effective entitlements on an interval
//! and fires the debounced change notification when either predicate holds:
//! something newly crossed its expiry boundary, or a boolean/name field
//! drifted. This keeps the expensive recomputation (a network fetch)
//! decoupled from event fan-out.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::clock::Clock;
use crate::entitlements::{diff, EffectiveEntitlements, EntitlementReconciler};
use crate::notify::ChangeNotifier;

pub struct EntitlementsMonitor {
    reconciler: Arc<EntitlementReconciler>,
    notifier: Arc<ChangeNotifier>,
    clock: Arc<dyn Clock>,
    last_recorded: Mutex<Option<EffectiveEntitlements>>,
    initial_delay: Duration,
    interval: Duration,
}

impl EntitlementsMonitor {
    pub fn new(
        reconciler: Arc<EntitlementReconciler>,
        notifier: Arc<ChangeNotifier>,
        clock: Arc<dyn Clock>,
        initial_delay: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            reconciler,
            notifier,
            clock,
            last_recorded: Mutex::new(None),
            initial_delay,
            interval,
        }
    }

    /// Run one reconciliation pass. Exposed so tests (and hosts that want
    /// an immediate check) can drive the monitor without the timer.
    pub async fn check_once(&self) {
        let current = self.reconciler.effective_entitlements(true).await;
        let now = self.clock.now_ms();

        let (expired, changed) = {
            let last = self.last_recorded.lock();
            let expired = diff::newly_expired(current.as_ref(), last.as_ref(), now);
            let changed = diff::have_changed(current.as_ref(), last.as_ref());
            (expired, changed)
        };

        if let Some(name) = &expired {
            tracing::info!(entry = %name, "Entitlement crossed its expiry boundary");
        }
        if expired.is_some() || changed {
            self.notifier.entitlements_changed();
        }

        *self.last_recorded.lock() = current;
    }

    /// Spawn the periodic task: first check after `initial_delay`, then one
    /// per `interval`, for the lifetime of the process.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(monitor.initial_delay).await;
            let mut ticker = tokio::time::interval(monitor.interval);
            loop {
                ticker.tick().await;
                monitor.check_once().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{AccountApi, EntitlementsQuery, FetchError, StaticSession};
    use crate::clock::FixedClock;
    use crate::config::LicensingConfig;
    use crate::entitlements::{PlanInfo, ServerEntitlements};
    use crate::metrics::MetricCounters;
    use crate::notify::LicensingEvent;
    use crate::security::crypto::{InstallSalt, SALT_LENGTH};
    use crate::trial::store::MemoryTrialBackend;
    use crate::trial::TrialStore;

    use async_trait::async_trait;

    struct SwappableApi {
        current: Mutex<Result<ServerEntitlements, FetchError>>,
    }

    #[async_trait]
    impl AccountApi for SwappableApi {
        async fn fetch_entitlements(
            &self,
            _query: &EntitlementsQuery,
        ) -> Result<ServerEntitlements, FetchError> {
            self.current.lock().clone()
        }
    }

    fn response(paid: bool) -> ServerEntitlements {
        ServerEntitlements {
            is_success: true,
            plan: Some(PlanInfo {
                name: Some(if paid { "Quill Pro" } else { "Free Plan" }.into()),
                paid_subscriber: paid,
                valid_till: None,
            }),
            entitlements: None,
            profileview: None,
        }
    }

    fn monitor_fixture(
        api: Arc<SwappableApi>,
    ) -> (Arc<EntitlementsMonitor>, Arc<ChangeNotifier>) {
        let config = Arc::new(LicensingConfig::default().validate().unwrap());
        let clock = Arc::new(FixedClock::new(1_000_000));
        let notifier = Arc::new(ChangeNotifier::new(Duration::from_secs(1)));
        let trial_store = Arc::new(TrialStore::new(
            Box::new(MemoryTrialBackend::new()),
            InstallSalt::from_bytes(&[0x42; SALT_LENGTH]),
        ));
        let reconciler = Arc::new(EntitlementReconciler::new(
            config,
            StaticSession::logged_in(crate::account::SessionAuth::BrowserCookie),
            api,
            clock.clone(),
            trial_store,
            None,
            Arc::clone(&notifier),
            Arc::new(MetricCounters::new()),
        ));
        let monitor = Arc::new(EntitlementsMonitor::new(
            reconciler,
            Arc::clone(&notifier),
            clock,
            Duration::from_secs(30),
            Duration::from_secs(600),
        ));
        (monitor, notifier)
    }

    async fn settle_debounce(rx: &mut tokio::sync::broadcast::Receiver<LicensingEvent>) -> usize {
        // First let the debounce worker open its window, then close it.
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(1100)).await;
        tokio::task::yield_now().await;
        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        count
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_check_records_snapshot_and_notifies() {
        let api = Arc::new(SwappableApi {
            current: Mutex::new(Ok(response(true))),
        });
        let (monitor, notifier) = monitor_fixture(api);
        let mut rx = notifier.subscribe();

        // First pass: the fetch itself reports a change (None -> Some) and
        // the predicates agree; one debounced event total.
        monitor.check_once().await;
        assert_eq!(settle_debounce(&mut rx).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stable_state_stays_silent() {
        let api = Arc::new(SwappableApi {
            current: Mutex::new(Ok(response(true))),
        });
        let (monitor, notifier) = monitor_fixture(api);
        let mut rx = notifier.subscribe();

        monitor.check_once().await;
        settle_debounce(&mut rx).await;

        monitor.check_once().await;
        monitor.check_once().await;
        assert_eq!(settle_debounce(&mut rx).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_plan_change_notifies() {
        let api = Arc::new(SwappableApi {
            current: Mutex::new(Ok(response(false))),
        });
        let (monitor, notifier) = monitor_fixture(Arc::clone(&api));
        let mut rx = notifier.subscribe();

        monitor.check_once().await;
        settle_debounce(&mut rx).await;

        *api.current.lock() = Ok(response(true));
        monitor.check_once().await;
        assert_eq!(settle_debounce(&mut rx).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_drives_checks() {
        let api = Arc::new(SwappableApi {
            current: Mutex::new(Ok(response(true))),
        });
        let (monitor, notifier) = monitor_fixture(api);
        let mut rx = notifier.subscribe();
        let _handle = monitor.start();
        // Let the monitor task register its initial delay.
        tokio::task::yield_now().await;

        // Before the initial delay nothing has run.
        tokio::time::advance(Duration::from_secs(20)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());

        // Past the initial delay the first check fires and notifies.
        tokio::time::advance(Duration::from_secs(15)).await;
        tokio::task::yield_now().await;
        assert_eq!(settle_debounce(&mut rx).await, 1);
    }
}
