//! Licensing events and the debounced change notifier.
//!
//! Entitlement changes can arrive in bursts (a forced refresh, a trial
//! grant and a monitor tick within the same second); consumers only need
//! one "re-read your entitlements" signal per burst. Calls within the
//! debounce window collapse into a single event emitted at the end of the
//! window. Prompt events are never debounced.

use std::time::Duration;

use tokio::sync::{broadcast, mpsc};

/// Events emitted to host subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LicensingEvent {
    /// Effective entitlements may have changed; re-fetch to observe them.
    /// Carries no payload and is debounced.
    EntitlementsChanged,

    /// A trial was granted or re-granted on this start.
    ProUpgradeOnInstall { trial_days: i64, first_install: bool },

    /// The host should offer the trial-start upsell (suppressed for paid
    /// subscribers before emission).
    TrialStartPrompt { trial_days: i64 },

    /// The host should show the trial-ended upsell, at most once per
    /// (expiry, app version) pair.
    TrialEndedPrompt,
}

/// Fan-out point for [`LicensingEvent`]s with a single-flight debounce on
/// [`LicensingEvent::EntitlementsChanged`].
pub struct ChangeNotifier {
    events: broadcast::Sender<LicensingEvent>,
    debounce_tx: mpsc::UnboundedSender<()>,
}

impl std::fmt::Debug for ChangeNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeNotifier").finish_non_exhaustive()
    }
}

impl ChangeNotifier {
    /// Create the notifier and spawn its debounce worker.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(debounce_window: Duration) -> Self {
        let (events, _) = broadcast::channel(64);
        let (debounce_tx, mut debounce_rx) = mpsc::unbounded_channel::<()>();

        let worker_events = events.clone();
        tokio::spawn(async move {
            while debounce_rx.recv().await.is_some() {
                tokio::time::sleep(debounce_window).await;
                // Collapse everything that arrived during the window.
                while debounce_rx.try_recv().is_ok() {}
                // Send fails only when nobody is subscribed, which is fine.
                let _ = worker_events.send(LicensingEvent::EntitlementsChanged);
            }
        });

        Self {
            events,
            debounce_tx,
        }
    }

    /// Request an `EntitlementsChanged` emission (debounced).
    pub fn entitlements_changed(&self) {
        // Fails only if the worker is gone, i.e. the runtime is shutting down.
        let _ = self.debounce_tx.send(());
    }

    /// Emit an event immediately, bypassing the debounce.
    pub fn emit(&self, event: LicensingEvent) {
        tracing::debug!(?event, "licensing event");
        let _ = self.events.send(event);
    }

    /// Subscribe to all licensing events.
    pub fn subscribe(&self) -> broadcast::Receiver<LicensingEvent> {
        self.events.subscribe()
    }
}
