//! Install salt and data signing.
//!
//! The trial record and the on-disk entitlements cache are signed with
//! HMAC-SHA256 keyed by a per-installation random salt. The salt lives in
//! the OS credential store; where that is unavailable a fixed fallback
//! constant is used instead, which downgrades the signature to an
//! obfuscation rather than a per-install secret.

use ring::hmac::{self, HMAC_SHA256};
use ring::rand::{SecureRandom, SystemRandom};

use super::credstore::CredentialStore;

/// Salt length in bytes.
pub const SALT_LENGTH: usize = 32;

/// Credential-store key under which the salt is persisted.
const CRED_KEY_INSTALL_SALT: &str = "quill_install_salt_v1";

/// Weaker fixed salt for installs without secure per-install storage.
const FALLBACK_SALT: [u8; SALT_LENGTH] = [
    0x71, 0x6c, 0x2d, 0x73, 0x61, 0x6c, 0x74, 0x2d, 0x76, 0x31, 0x9e, 0x44, 0x1b, 0xd2, 0x6a,
    0x08, 0x57, 0xc3, 0x2f, 0x91, 0xe5, 0x7a, 0x0c, 0xb8, 0x33, 0x6d, 0xf4, 0x12, 0x88, 0x5e,
    0xa1, 0x40,
];

/// Per-installation signing key for small licensing blobs.
#[derive(Clone)]
pub struct InstallSalt {
    key: hmac::Key,
}

impl std::fmt::Debug for InstallSalt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstallSalt").finish_non_exhaustive()
    }
}

impl InstallSalt {
    /// Load the salt from the credential store, creating and persisting a
    /// fresh one on first run.
    ///
    /// Store failures fall back to [`FALLBACK_SALT`] so licensing keeps
    /// working when the keychain is locked or absent. Two near-simultaneous
    /// first reads may both generate a salt; the second write wins and
    /// invalidates anything the loser signed, which only forces a re-grant
    /// path identical to corruption handling.
    pub fn load_or_create(store: &dyn CredentialStore) -> Self {
        match store.get(CRED_KEY_INSTALL_SALT) {
            Ok(Some(bytes)) if bytes.len() == SALT_LENGTH => {
                tracing::trace!("Loaded existing install salt");
                return Self::from_bytes(&bytes);
            }
            Ok(Some(bytes)) => {
                tracing::warn!(len = bytes.len(), "Invalid install salt length, regenerating");
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("Credential store unavailable, using fallback salt: {e}");
                return Self::from_bytes(&FALLBACK_SALT);
            }
        }

        let bytes = Self::generate_bytes();
        if let Err(e) = store.set(CRED_KEY_INSTALL_SALT, &bytes) {
            tracing::warn!("Failed to persist install salt, using fallback salt: {e}");
            return Self::from_bytes(&FALLBACK_SALT);
        }
        tracing::info!("Generated new install salt");
        Self::from_bytes(&bytes)
    }

    /// Build a salt from raw key bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            key: hmac::Key::new(HMAC_SHA256, bytes),
        }
    }

    /// Generate fresh random salt bytes.
    pub fn generate_bytes() -> [u8; SALT_LENGTH] {
        let rng = SystemRandom::new();
        let mut bytes = [0u8; SALT_LENGTH];
        rng.fill(&mut bytes).expect("system RNG failure");
        bytes
    }

    /// Sign a payload, returning the lowercase hex HMAC tag.
    pub fn sign(&self, payload: &str) -> String {
        let tag = hmac::sign(&self.key, payload.as_bytes());
        hex_encode(tag.as_ref())
    }

    /// Verify a hex signature against a payload.
    ///
    /// Returns false for malformed hex as well as tag mismatches.
    pub fn validate(&self, payload: &str, signature: &str) -> bool {
        let Some(tag) = hex_decode(signature) else {
            return false;
        };
        hmac::verify(&self.key, payload.as_bytes(), &tag).is_ok()
    }
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

fn hex_decode(value: &str) -> Option<Vec<u8>> {
    if value.len() % 2 != 0 {
        return None;
    }
    (0..value.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&value[i..i + 2], 16).ok())
        .collect()
}
