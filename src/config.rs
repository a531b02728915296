//! Licensing subsystem configuration.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Configuration for the licensing subsystem.
///
/// Hosts construct one of these at startup and hand it to
/// [`Licensing::new`](crate::manager::Licensing::new). The defaults describe
/// the production account service; tests override the timing knobs and point
/// `data_dir` at a temp directory.
#[derive(Debug, Clone)]
pub struct LicensingConfig {
    /// Base URL of the account service, without a trailing slash.
    pub account_base_url: String,

    /// Version of the hosting application (not of this crate).
    pub app_version: String,

    /// UI language tag sent with entitlement requests.
    pub language: String,

    /// Platform tag sent with entitlement requests ("win", "mac", "linux").
    pub platform: String,

    /// Install flavor: "desktop" or "browser". Selects trial storage and
    /// whether the signed on-disk entitlements cache is used.
    pub app_type: String,

    /// Display name of the paid plan used for the synthetic trial overlay.
    pub pro_plan_name: String,

    /// Display name of the free plan used in fallbacks.
    pub free_plan_name: String,

    /// Purchase page offered when an entitlement is not activated.
    pub purchase_url: String,

    /// Directory for the crate's persisted files (trial record on browser
    /// installs, signed entitlements cache on desktop installs).
    pub data_dir: PathBuf,

    /// How often the startup runner re-checks whether trial activation may
    /// proceed (the host may defer it while a modal is up).
    pub activation_poll: Duration,

    /// Delay before the first periodic entitlements check.
    pub monitor_initial_delay: Duration,

    /// Interval between periodic entitlements checks.
    pub monitor_interval: Duration,

    /// Window within which repeated change notifications collapse into one.
    pub debounce_window: Duration,
}

impl Default for LicensingConfig {
    fn default() -> Self {
        Self {
            account_base_url: "https://account.quillcode.dev".into(),
            app_version: "1.0.0".into(),
            language: "en".into(),
            platform: default_platform().into(),
            app_type: "desktop".into(),
            pro_plan_name: "Quill Pro".into(),
            free_plan_name: "Free Plan".into(),
            purchase_url: "https://account.quillcode.dev/pricing".into(),
            data_dir: default_data_dir(),
            activation_poll: Duration::from_secs(10),
            monitor_initial_delay: Duration::from_secs(30),
            monitor_interval: Duration::from_secs(10 * 60),
            debounce_window: Duration::from_secs(1),
        }
    }
}

impl LicensingConfig {
    /// Validate the configuration, normalizing the account URL.
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        while self.account_base_url.ends_with('/') {
            self.account_base_url.pop();
        }
        if self.account_base_url.is_empty() {
            return Err(ConfigError::MissingAccountUrl);
        }
        if self.app_version.is_empty() {
            return Err(ConfigError::MissingAppVersion);
        }
        if self.app_type != "desktop" && self.app_type != "browser" {
            return Err(ConfigError::UnknownAppType(self.app_type));
        }
        Ok(self)
    }

    /// Whether this install keeps its trial record in the OS credential
    /// store (desktop) rather than a file in the app-support dir (browser).
    pub fn uses_credential_trial_store(&self) -> bool {
        self.app_type != "browser"
    }
}

fn default_platform() -> &'static str {
    match std::env::consts::OS {
        "windows" => "win",
        "macos" => "mac",
        other => {
            if other != "linux" {
                tracing::debug!("Unrecognized OS {other}, reporting as linux");
            }
            "linux"
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("quill")
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("account base URL must not be empty")]
    MissingAccountUrl,

    #[error("application version must not be empty")]
    MissingAppVersion,

    #[error("unknown app type: {0} (expected \"desktop\" or \"browser\")")]
    UnknownAppType(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let config = LicensingConfig::default().validate().unwrap();
        assert_eq!(config.app_type, "desktop");
        assert!(!config.account_base_url.ends_with('/'));
    }

    #[test]
    fn test_validate_strips_trailing_slashes() {
        let config = LicensingConfig {
            account_base_url: "https://account.example.dev///".into(),
            ..Default::default()
        };
        let config = config.validate().unwrap();
        assert_eq!(config.account_base_url, "https://account.example.dev");
    }

    #[test]
    fn test_validate_rejects_bad_app_type() {
        let config = LicensingConfig {
            app_type: "mobile".into(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownAppType(_))
        ));
    }

    #[test]
    fn test_validate_rejects_empty_version() {
        let config = LicensingConfig {
            app_version: String::new(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingAppVersion)
        ));
    }
}
