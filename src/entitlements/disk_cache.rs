//! Signed on-disk cache of the last good server entitlements.
//!
//! Desktop installs keep a copy of the most recent successful
//! `getAppEntitlements` response so transient outages degrade to the last
//! known-good state instead of "no entitlements". The envelope is signed
//! with the install salt; a blob that fails validation is discarded.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::ServerEntitlements;
use crate::security::crypto::InstallSalt;

/// File name of the cache inside the data directory.
pub const ENTITLEMENTS_CACHE_FILE: &str = "entitlements_cache.json";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignedEnvelope {
    /// Serialized [`ServerEntitlements`].
    payload: String,
    /// Hex HMAC tag over `payload`.
    signature: String,
}

pub struct EntitlementsDiskCache {
    path: PathBuf,
    salt: InstallSalt,
}

impl EntitlementsDiskCache {
    pub fn new(data_dir: impl Into<PathBuf>, salt: InstallSalt) -> Self {
        Self {
            path: data_dir.into().join(ENTITLEMENTS_CACHE_FILE),
            salt,
        }
    }

    /// Load and validate the cached response. Any failure (missing file,
    /// bad JSON, signature mismatch) yields `None`; a mismatch is logged
    /// since it means the file was edited out-of-band.
    pub fn load(&self) -> Option<ServerEntitlements> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!("Failed to read entitlements cache: {e}");
                return None;
            }
        };

        let envelope: SignedEnvelope = match serde_json::from_str(&raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("Entitlements cache is not valid JSON: {e}");
                return None;
            }
        };

        if !self.salt.validate(&envelope.payload, &envelope.signature) {
            tracing::warn!("Entitlements cache failed signature validation, discarding");
            return None;
        }

        match serde_json::from_str(&envelope.payload) {
            Ok(entitlements) => Some(entitlements),
            Err(e) => {
                tracing::warn!("Entitlements cache payload is malformed: {e}");
                None
            }
        }
    }

    /// Sign and persist a response. Failures are logged and absorbed.
    pub fn save(&self, entitlements: &ServerEntitlements) {
        let payload = match serde_json::to_string(entitlements) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("Failed to serialize entitlements cache: {e}");
                return;
            }
        };
        let envelope = SignedEnvelope {
            signature: self.salt.sign(&payload),
            payload,
        };
        let raw = match serde_json::to_string(&envelope) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!("Failed to serialize entitlements cache envelope: {e}");
                return;
            }
        };
        if let Some(parent) = self.path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                tracing::warn!("Failed to create data directory: {e}");
                return;
            }
        }
        if let Err(e) = std::fs::write(&self.path, raw) {
            tracing::warn!("Failed to write entitlements cache: {e}");
        }
    }

    /// Remove the cache file.
    pub fn clear(&self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to clear entitlements cache: {e}"),
        }
    }
}
