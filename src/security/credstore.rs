//! Cross-platform credential storage behind a narrow trait.
//!
//! Desktop installs keep the install salt and the trial record in the OS
//! credential store (Credential Manager / Keychain / Secret Service).
//! [`MemoryCredentialStore`] backs tests and hosts without a keychain.

use std::collections::HashMap;

use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential storage error: {0}")]
    Storage(String),

    #[error("secure credential storage is not supported on this platform")]
    Unsupported,
}

/// Small-secret storage keyed by string.
pub trait CredentialStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CredentialError>;
    fn set(&self, key: &str, value: &[u8]) -> Result<(), CredentialError>;
    fn remove(&self, key: &str) -> Result<(), CredentialError>;
}

/// OS-keychain-backed store. `service` namespaces all entries.
pub struct KeychainStore {
    service: String,
}

impl KeychainStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }
}

impl CredentialStore for KeychainStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CredentialError> {
        os::load(&self.service, key)
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), CredentialError> {
        os::store(&self.service, key, value)
    }

    fn remove(&self, key: &str) -> Result<(), CredentialError> {
        os::delete(&self.service, key)
    }
}

/// In-memory store for tests and keychain-less hosts.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CredentialError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), CredentialError> {
        self.entries.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), CredentialError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

#[cfg(target_os = "windows")]
mod os {
    use super::CredentialError;

    use std::{mem, ptr, slice};

    use windows_sys::Win32::Foundation::{GetLastError, ERROR_NOT_FOUND};
    use windows_sys::Win32::Security::Credentials::{
        CredDeleteW, CredFree, CredReadW, CredWriteW, CREDENTIALW, CRED_PERSIST_LOCAL_MACHINE,
        CRED_TYPE_GENERIC,
    };

    fn target_name(service: &str, key: &str) -> Vec<u16> {
        to_wide(&format!("{service}:{key}"))
    }

    fn to_wide(value: &str) -> Vec<u16> {
        use std::os::windows::ffi::OsStrExt;
        std::ffi::OsStr::new(value)
            .encode_wide()
            .chain(std::iter::once(0))
            .collect()
    }

    pub fn load(service: &str, key: &str) -> Result<Option<Vec<u8>>, CredentialError> {
        let target = target_name(service, key);
        let mut cred_ptr: *mut CREDENTIALW = ptr::null_mut();
        let ok = unsafe { CredReadW(target.as_ptr(), CRED_TYPE_GENERIC, 0, &mut cred_ptr) };
        if ok == 0 {
            let err = unsafe { GetLastError() };
            if err == ERROR_NOT_FOUND {
                return Ok(None);
            }
            return Err(CredentialError::Storage(format!("CredReadW failed: {err}")));
        }

        let cred = unsafe { *cred_ptr };
        let value = unsafe {
            slice::from_raw_parts(cred.CredentialBlob, cred.CredentialBlobSize as usize).to_vec()
        };
        unsafe { CredFree(cred_ptr as *mut _) };
        Ok(Some(value))
    }

    pub fn store(service: &str, key: &str, value: &[u8]) -> Result<(), CredentialError> {
        let mut target = target_name(service, key);
        let mut user = to_wide(key);

        let mut credential: CREDENTIALW = unsafe { mem::zeroed() };
        credential.Type = CRED_TYPE_GENERIC;
        credential.TargetName = target.as_mut_ptr();
        credential.UserName = user.as_mut_ptr();
        credential.CredentialBlobSize = value.len() as u32;
        credential.CredentialBlob = value.as_ptr() as *mut u8;
        credential.Persist = CRED_PERSIST_LOCAL_MACHINE;
        credential.AttributeCount = 0;
        credential.Attributes = ptr::null_mut();

        let ok = unsafe { CredWriteW(&mut credential, 0) };
        if ok == 0 {
            return Err(CredentialError::Storage("CredWriteW failed".into()));
        }
        Ok(())
    }

    pub fn delete(service: &str, key: &str) -> Result<(), CredentialError> {
        let target = target_name(service, key);
        let ok = unsafe { CredDeleteW(target.as_ptr(), CRED_TYPE_GENERIC, 0) };
        if ok == 0 {
            let err = unsafe { GetLastError() };
            if err == ERROR_NOT_FOUND {
                return Ok(());
            }
            return Err(CredentialError::Storage(format!(
                "CredDeleteW failed: {err}"
            )));
        }
        Ok(())
    }
}

#[cfg(target_os = "macos")]
mod os {
    use super::CredentialError;

    use security_framework::passwords::{
        delete_generic_password, get_generic_password, set_generic_password,
    };

    const ERR_SEC_ITEM_NOT_FOUND: i32 = -25300;

    pub fn load(service: &str, key: &str) -> Result<Option<Vec<u8>>, CredentialError> {
        match get_generic_password(service, key) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.code() == ERR_SEC_ITEM_NOT_FOUND => Ok(None),
            Err(err) => Err(CredentialError::Storage(err.to_string())),
        }
    }

    pub fn store(service: &str, key: &str, value: &[u8]) -> Result<(), CredentialError> {
        set_generic_password(service, key, value)
            .map_err(|err| CredentialError::Storage(err.to_string()))
    }

    pub fn delete(service: &str, key: &str) -> Result<(), CredentialError> {
        match delete_generic_password(service, key) {
            Ok(()) => Ok(()),
            Err(err) if err.code() == ERR_SEC_ITEM_NOT_FOUND => Ok(()),
            Err(err) => Err(CredentialError::Storage(err.to_string())),
        }
    }
}

#[cfg(target_os = "linux")]
mod os {
    use super::CredentialError;

    use std::collections::HashMap;

    use secret_service::blocking::{Collection, SecretService};
    use secret_service::EncryptionType;

    fn storage_err(e: impl std::fmt::Display) -> CredentialError {
        CredentialError::Storage(e.to_string())
    }

    fn unlocked_collection<'a>(ss: &'a SecretService<'a>) -> Result<Collection<'a>, CredentialError> {
        let collection = ss.get_default_collection().map_err(storage_err)?;
        collection.unlock().map_err(storage_err)?;
        Ok(collection)
    }

    fn attributes<'a>(service: &'a str, key: &'a str) -> HashMap<&'a str, &'a str> {
        HashMap::from([("application", service), ("account", key)])
    }

    pub fn load(service: &str, key: &str) -> Result<Option<Vec<u8>>, CredentialError> {
        let ss = SecretService::connect(EncryptionType::Dh).map_err(storage_err)?;
        let collection = unlocked_collection(&ss)?;
        let items = collection
            .search_items(attributes(service, key))
            .map_err(storage_err)?;
        match items.first() {
            Some(item) => {
                item.unlock().map_err(storage_err)?;
                Ok(Some(item.get_secret().map_err(storage_err)?))
            }
            None => Ok(None),
        }
    }

    pub fn store(service: &str, key: &str, value: &[u8]) -> Result<(), CredentialError> {
        let ss = SecretService::connect(EncryptionType::Dh).map_err(storage_err)?;
        let collection = unlocked_collection(&ss)?;
        collection
            .create_item(
                &format!("{service} {key}"),
                attributes(service, key),
                value,
                true,
                "application/octet-stream",
            )
            .map_err(storage_err)?;
        Ok(())
    }

    pub fn delete(service: &str, key: &str) -> Result<(), CredentialError> {
        let ss = SecretService::connect(EncryptionType::Dh).map_err(storage_err)?;
        let collection = unlocked_collection(&ss)?;
        let items = collection
            .search_items(attributes(service, key))
            .map_err(storage_err)?;
        for item in items {
            let _ = item.delete();
        }
        Ok(())
    }
}

#[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
mod os {
    use super::CredentialError;

    pub fn load(_service: &str, _key: &str) -> Result<Option<Vec<u8>>, CredentialError> {
        Err(CredentialError::Unsupported)
    }

    pub fn store(_service: &str, _key: &str, _value: &[u8]) -> Result<(), CredentialError> {
        Err(CredentialError::Unsupported)
    }

    pub fn delete(_service: &str, _key: &str) -> Result<(), CredentialError> {
        Err(CredentialError::Unsupported)
    }
}
