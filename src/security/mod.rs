//! Install-salt signing and credential storage.

pub mod credstore;
pub mod crypto;

pub use credstore::{CredentialError, CredentialStore, KeychainStore, MemoryCredentialStore};
pub use crypto::{InstallSalt, SALT_LENGTH};
