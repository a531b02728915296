//! Loginless pro trial: signed record, storage and grant policy.
//!
//! - First install: 30-day trial on first usage
//! - Newer versions: 7-day trial, or the remainder of a longer running trial
//! - Same/older versions: no new grant, existing trial remains valid

pub mod policy;
pub mod store;

use serde::{Deserialize, Serialize};

pub use policy::{ActivationOutcome, NoGate, StartupGate, SubscriptionProbe, TrialPolicy};
pub use store::{
    CredentialTrialBackend, FileTrialBackend, MemoryTrialBackend, TrialStorageBackend, TrialStore,
    TrialStoreError,
};

pub const MS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

/// Trial length granted on first install.
pub const FIRST_INSTALL_TRIAL_DAYS: i64 = 30;

/// Trial length granted when a newer app version is installed.
pub const SUBSEQUENT_TRIAL_DAYS: i64 = 7;

/// The single persisted trial window for this installation.
///
/// `signature` covers `proVersion` and `endDate`; a record whose signature
/// does not validate is corrupted, which is handled differently from a
/// missing record (see [`store::TrialStore::load`]). Unknown fields in the
/// stored blob are ignored, absent optional fields are tolerated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialRecord {
    /// App version that granted (or last re-stamped) this trial.
    pub pro_version: String,

    /// Trial end, milliseconds since the Unix epoch.
    pub end_date: i64,

    /// Hex HMAC tag over the signing payload.
    #[serde(default)]
    pub signature: String,

    /// App version for which the trial-ended prompt was already emitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade_dialog_shown_version: Option<String>,
}

impl TrialRecord {
    /// A fresh unsigned record; the store signs on save.
    pub fn new(pro_version: impl Into<String>, end_date: i64) -> Self {
        Self {
            pro_version: pro_version.into(),
            end_date,
            signature: String::new(),
            upgrade_dialog_shown_version: None,
        }
    }

    /// An already-expired record used to overwrite corrupted state. The
    /// prompt marker is pre-set so corruption can never be converted into
    /// an upsell prompt or a fresh grant.
    pub fn expired_marker(pro_version: impl Into<String>, now_ms: i64) -> Self {
        let version = pro_version.into();
        Self {
            pro_version: version.clone(),
            end_date: now_ms,
            signature: String::new(),
            upgrade_dialog_shown_version: Some(version),
        }
    }

    /// The exact byte string covered by the signature.
    pub fn signing_payload(&self) -> String {
        format!("{}|{}", self.pro_version, self.end_date)
    }

    /// Whole days remaining until `end_date`, rounded up, never negative.
    pub fn remaining_days(&self, now_ms: i64) -> i64 {
        let ms_remaining = self.end_date - now_ms;
        if ms_remaining <= 0 {
            0
        } else {
            (ms_remaining + MS_PER_DAY - 1) / MS_PER_DAY
        }
    }
}
