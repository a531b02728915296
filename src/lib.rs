//! Quill licensing core.
//!
//! This crate implements the licensing, trial and entitlements subsystem of
//! the Quill editor:
//!
//! - **Signed trial cache**: the trial window is persisted with an
//!   HMAC-SHA256 signature keyed by a per-install salt; tampering resolves
//!   to an expired trial, never to a fresh grant.
//! - **Trial policy**: 30 days on first install, 7 days (or the remainder
//!   of a longer running window) on version upgrades, nothing on downgrades.
//! - **Entitlement reconciliation**: server-reported entitlements are
//!   pruned of lapsed entries and merged with the trial window into one
//!   effective view for feature gates, with memory and signed-disk cache
//!   fallbacks for transient outages.
//! - **Change notification**: a debounced `EntitlementsChanged` event plus
//!   a periodic reconciliation monitor.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use quill_licensing::{
//!     Collaborators, HttpAccountClient, KeychainStore, Licensing, LicensingConfig, NoGate,
//!     StaticSession, SystemClock,
//! };
//!
//! # async fn boot() -> Result<(), Box<dyn std::error::Error>> {
//! let licensing = Licensing::new(
//!     LicensingConfig {
//!         app_version: "3.1.0".into(),
//!         ..Default::default()
//!     },
//!     Collaborators {
//!         session: StaticSession::logged_out(),
//!         api: Arc::new(HttpAccountClient::new()?),
//!         credentials: Arc::new(KeychainStore::new("quill")),
//!         clock: Arc::new(SystemClock),
//!         startup_gate: Arc::new(NoGate),
//!     },
//! )?;
//! licensing.start();
//!
//! if licensing.is_in_pro_trial().await {
//!     println!("{} trial days left", licensing.trial_remaining_days().await);
//! }
//! # Ok(())
//! # }
//! ```

pub mod account;
pub mod clock;
pub mod config;
pub mod entitlements;
pub mod gates;
pub mod manager;
pub mod metrics;
pub mod monitor;
pub mod notify;
pub mod security;
pub mod trial;

// Re-exports for convenience
pub use account::{
    AccountApi, EntitlementsQuery, FetchError, HttpAccountClient, LoginSession, SessionAuth,
    StaticSession,
};
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{ConfigError, LicensingConfig};
pub use entitlements::{
    EffectiveEntitlements, EntitlementReconciler, FeatureEntitlement, PlanInfo,
    ServerEntitlements, FEATURE_AI_AGENT, FEATURE_LIVE_EDIT,
};
pub use gates::{Capabilities, Capability, CapabilityError};
pub use manager::{Collaborators, Licensing};
pub use metrics::MetricCounters;
pub use monitor::EntitlementsMonitor;
pub use notify::{ChangeNotifier, LicensingEvent};
pub use security::{CredentialError, CredentialStore, KeychainStore, MemoryCredentialStore};
pub use trial::{
    ActivationOutcome, NoGate, StartupGate, SubscriptionProbe, TrialPolicy, TrialRecord,
    TrialStore, FIRST_INSTALL_TRIAL_DAYS, MS_PER_DAY, SUBSEQUENT_TRIAL_DAYS,
};
