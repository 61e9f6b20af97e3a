//! Platform services for the communication layer: secret storage and the
//! credential vault built on it.

pub mod secret;
pub mod vault;

#[cfg(feature = "os-keyring")]
pub use secret::OsKeyringSecretStore;
pub use secret::{InMemorySecretStore, ScopedSecretStore, SecretStore, SecretStoreError};
pub use vault::{CredentialVault, DEFAULT_VAULT_SERVICE, VaultError, account_key};
