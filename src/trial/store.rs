//! Signed persistence for the trial record.
//!
//! The store distinguishes three load results: a valid record, no record at
//! all, and CORRUPTED (present but unparseable or failing signature
//! validation). The distinction is load-bearing: corruption must never be
//! treated as a first run, or deleting the blob would reset the trial clock.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use super::TrialRecord;
use crate::security::credstore::CredentialStore;
use crate::security::crypto::InstallSalt;

/// Credential-store key for the trial record on desktop installs.
const CRED_KEY_TRIAL: &str = "quill_trial_grant_v1";

/// File name for the trial record on browser-hosted installs.
pub const TRIAL_FILE_NAME: &str = "entitlements_granted.json";

#[derive(Debug, Error)]
pub enum TrialStoreError {
    /// The stored blob exists but is unparseable or fails signature
    /// validation.
    #[error("trial record is corrupted or failed signature validation")]
    Corrupted,

    #[error("trial storage error: {0}")]
    Storage(String),
}

/// Raw blob storage for the trial record.
pub trait TrialStorageBackend: Send + Sync {
    fn read(&self) -> Result<Option<String>, TrialStoreError>;
    fn write(&self, raw: &str) -> Result<(), TrialStoreError>;
    fn clear(&self) -> Result<(), TrialStoreError>;
}

/// Backend storing the record in the OS credential store.
pub struct CredentialTrialBackend {
    store: Arc<dyn CredentialStore>,
}

impl CredentialTrialBackend {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }
}

impl TrialStorageBackend for CredentialTrialBackend {
    fn read(&self) -> Result<Option<String>, TrialStoreError> {
        let bytes = self
            .store
            .get(CRED_KEY_TRIAL)
            .map_err(|e| TrialStoreError::Storage(e.to_string()))?;
        match bytes {
            None => Ok(None),
            Some(bytes) => match String::from_utf8(bytes) {
                Ok(raw) => Ok(Some(raw)),
                // Present but not even UTF-8: that is corruption, not absence.
                Err(_) => Err(TrialStoreError::Corrupted),
            },
        }
    }

    fn write(&self, raw: &str) -> Result<(), TrialStoreError> {
        self.store
            .set(CRED_KEY_TRIAL, raw.as_bytes())
            .map_err(|e| TrialStoreError::Storage(e.to_string()))
    }

    fn clear(&self) -> Result<(), TrialStoreError> {
        self.store
            .remove(CRED_KEY_TRIAL)
            .map_err(|e| TrialStoreError::Storage(e.to_string()))
    }
}

/// Backend storing the record as a JSON file in the app-support directory.
pub struct FileTrialBackend {
    path: PathBuf,
}

impl FileTrialBackend {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: data_dir.into().join(TRIAL_FILE_NAME),
        }
    }
}

impl TrialStorageBackend for FileTrialBackend {
    fn read(&self) -> Result<Option<String>, TrialStoreError> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(TrialStoreError::Storage(e.to_string())),
        }
    }

    fn write(&self, raw: &str) -> Result<(), TrialStoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| TrialStoreError::Storage(e.to_string()))?;
        }
        std::fs::write(&self.path, raw).map_err(|e| TrialStoreError::Storage(e.to_string()))
    }

    fn clear(&self) -> Result<(), TrialStoreError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TrialStoreError::Storage(e.to_string())),
        }
    }
}

/// In-memory backend for tests.
#[derive(Debug, Default)]
pub struct MemoryTrialBackend {
    slot: Mutex<Option<String>>,
    /// When non-empty, the next reads fail with these errors instead.
    fail_reads: Mutex<VecDeque<TrialStoreError>>,
}

impl MemoryTrialBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a read failure, for exercising the absorb-and-log paths.
    pub fn fail_next_read(&self, error: TrialStoreError) {
        self.fail_reads.lock().push_back(error);
    }

    /// Raw stored blob, for assertions.
    pub fn raw(&self) -> Option<String> {
        self.slot.lock().clone()
    }

    /// Overwrite the raw blob directly, bypassing signing.
    pub fn set_raw(&self, raw: impl Into<String>) {
        *self.slot.lock() = Some(raw.into());
    }
}

impl TrialStorageBackend for MemoryTrialBackend {
    fn read(&self) -> Result<Option<String>, TrialStoreError> {
        if let Some(error) = self.fail_reads.lock().pop_front() {
            return Err(error);
        }
        Ok(self.slot.lock().clone())
    }

    fn write(&self, raw: &str) -> Result<(), TrialStoreError> {
        *self.slot.lock() = Some(raw.to_string());
        Ok(())
    }

    fn clear(&self) -> Result<(), TrialStoreError> {
        *self.slot.lock() = None;
        Ok(())
    }
}

/// Signed load/save/clear over a [`TrialStorageBackend`].
pub struct TrialStore {
    backend: Box<dyn TrialStorageBackend>,
    salt: InstallSalt,
}

impl TrialStore {
    pub fn new(backend: Box<dyn TrialStorageBackend>, salt: InstallSalt) -> Self {
        Self { backend, salt }
    }

    /// Load and validate the trial record.
    ///
    /// - `Ok(None)`: nothing stored, or the backend itself failed to read
    ///   (logged) — no opinion, fresh grants permitted.
    /// - `Ok(Some(record))`: a record with a valid signature.
    /// - `Err(Corrupted)`: a blob is present but unparseable or its
    ///   signature does not validate.
    pub fn load(&self) -> Result<Option<TrialRecord>, TrialStoreError> {
        let raw = match self.backend.read() {
            Ok(raw) => raw,
            Err(TrialStoreError::Corrupted) => return Err(TrialStoreError::Corrupted),
            Err(TrialStoreError::Storage(e)) => {
                tracing::warn!("Failed to read trial record, treating as absent: {e}");
                return Ok(None);
            }
        };
        let Some(raw) = raw else {
            return Ok(None);
        };

        let record: TrialRecord = match serde_json::from_str(&raw) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!("Trial record is not valid JSON: {e}");
                return Err(TrialStoreError::Corrupted);
            }
        };

        if !self.salt.validate(&record.signing_payload(), &record.signature) {
            tracing::warn!(
                version = %record.pro_version,
                "Trial record failed signature validation"
            );
            return Err(TrialStoreError::Corrupted);
        }

        Ok(Some(record))
    }

    /// Sign and persist a record, returning the signed copy.
    ///
    /// Write failures are logged and absorbed: losing a trial write must
    /// never take the host down, and the next start re-evaluates anyway.
    pub fn save(&self, mut record: TrialRecord) -> TrialRecord {
        record.signature = self.salt.sign(&record.signing_payload());
        match serde_json::to_string(&record) {
            Ok(raw) => {
                if let Err(e) = self.backend.write(&raw) {
                    tracing::warn!("Failed to persist trial record: {e}");
                }
            }
            Err(e) => tracing::warn!("Failed to serialize trial record: {e}"),
        }
        record
    }

    /// Remove the stored record entirely.
    pub fn clear(&self) {
        if let Err(e) = self.backend.clear() {
            tracing::warn!("Failed to clear trial record: {e}");
        }
    }

    /// Days remaining on the currently stored trial.
    ///
    /// Absent and corrupted records both yield 0; corruption additionally
    /// never converts into a fresh grant (the policy engine writes an
    /// expired marker on the next evaluation).
    pub fn remaining_days(&self, now_ms: i64) -> i64 {
        match self.load() {
            Ok(Some(record)) => record.remaining_days(now_ms),
            Ok(None) | Err(_) => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::crypto::SALT_LENGTH;
    use crate::trial::MS_PER_DAY;

    fn store_with_memory() -> (TrialStore, Arc<MemoryTrialBackend>) {
        let backend = Arc::new(MemoryTrialBackend::new());
        let store = TrialStore::new(
            Box::new(SharedBackend(Arc::clone(&backend))),
            InstallSalt::from_bytes(&[0x42; SALT_LENGTH]),
        );
        (store, backend)
    }

    /// Wraps a shared memory backend so tests keep a handle to it.
    struct SharedBackend(Arc<MemoryTrialBackend>);

    impl TrialStorageBackend for SharedBackend {
        fn read(&self) -> Result<Option<String>, TrialStoreError> {
            self.0.read()
        }
        fn write(&self, raw: &str) -> Result<(), TrialStoreError> {
            self.0.write(raw)
        }
        fn clear(&self) -> Result<(), TrialStoreError> {
            self.0.clear()
        }
    }

    #[test]
    fn test_load_absent_is_none() {
        let (store, _) = store_with_memory();
        assert!(matches!(store.load(), Ok(None)));
        assert_eq!(store.remaining_days(0), 0);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let (store, _) = store_with_memory();
        let saved = store.save(TrialRecord::new("1.2.0", 30 * MS_PER_DAY));
        assert!(!saved.signature.is_empty());

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded, saved);
        assert_eq!(store.remaining_days(0), 30);
    }

    #[test]
    fn test_tampered_end_date_is_corrupted() {
        let (store, backend) = store_with_memory();
        store.save(TrialRecord::new("1.2.0", 30 * MS_PER_DAY));

        // Push the end date out by a year without re-signing.
        let raw = backend.raw().unwrap();
        let tampered = raw.replace(
            &format!("{}", 30 * MS_PER_DAY),
            &format!("{}", 395 * MS_PER_DAY),
        );
        assert_ne!(raw, tampered);
        backend.set_raw(tampered);

        assert!(matches!(store.load(), Err(TrialStoreError::Corrupted)));
        assert_eq!(store.remaining_days(0), 0);
    }

    #[test]
    fn test_tampered_version_is_corrupted() {
        let (store, backend) = store_with_memory();
        store.save(TrialRecord::new("1.2.0", 30 * MS_PER_DAY));

        let raw = backend.raw().unwrap();
        backend.set_raw(raw.replace("1.2.0", "9.2.0"));

        assert!(matches!(store.load(), Err(TrialStoreError::Corrupted)));
    }

    #[test]
    fn test_unparseable_blob_is_corrupted() {
        let (store, backend) = store_with_memory();
        backend.set_raw("{not json");
        assert!(matches!(store.load(), Err(TrialStoreError::Corrupted)));
    }

    #[test]
    fn test_missing_signature_is_corrupted() {
        let (store, backend) = store_with_memory();
        backend.set_raw(r#"{"proVersion":"1.0.0","endDate":99999999999999}"#);
        assert!(matches!(store.load(), Err(TrialStoreError::Corrupted)));
    }

    #[test]
    fn test_backend_read_failure_treated_as_absent() {
        let (store, backend) = store_with_memory();
        backend.fail_next_read(TrialStoreError::Storage("keychain locked".into()));
        assert!(matches!(store.load(), Ok(None)));
    }

    #[test]
    fn test_clear_removes_record() {
        let (store, _) = store_with_memory();
        store.save(TrialRecord::new("1.0.0", 30 * MS_PER_DAY));
        store.clear();
        assert!(matches!(store.load(), Ok(None)));
    }

    #[test]
    fn test_file_backend_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrialStore::new(
            Box::new(FileTrialBackend::new(dir.path())),
            InstallSalt::from_bytes(&[0x07; SALT_LENGTH]),
        );

        assert!(matches!(store.load(), Ok(None)));
        store.save(TrialRecord::new("1.0.0", 30 * MS_PER_DAY));
        assert_eq!(store.load().unwrap().unwrap().pro_version, "1.0.0");

        store.clear();
        assert!(matches!(store.load(), Ok(None)));
        assert!(!dir.path().join(TRIAL_FILE_NAME).exists());
    }

    #[test]
    fn test_file_backend_corruption_detected() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrialStore::new(
            Box::new(FileTrialBackend::new(dir.path())),
            InstallSalt::from_bytes(&[0x07; SALT_LENGTH]),
        );
        store.save(TrialRecord::new("1.0.0", 30 * MS_PER_DAY));

        let path = dir.path().join(TRIAL_FILE_NAME);
        let raw = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, raw.replace("1.0.0", "1.0.1")).unwrap();

        assert!(matches!(store.load(), Err(TrialStoreError::Corrupted)));
    }
}
