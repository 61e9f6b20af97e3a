use comms_core::Credentials;
use thiserror::Error;
use tracing::{debug, warn};

use crate::secret::{ScopedSecretStore, SecretStore, SecretStoreError};

/// Service name used when none is given.
pub const DEFAULT_VAULT_SERVICE: &str = "comms";

/// Entry holding the JSON list of saved account keys.
const INDEX_ACCOUNT: &str = ".accounts";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VaultError {
    #[error(transparent)]
    Store(#[from] SecretStoreError),
    #[error("stored entry '{account}' is unreadable: {reason}")]
    Corrupt { account: String, reason: String },
    #[error("credentials could not be encoded: {0}")]
    Encode(String),
}

impl VaultError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Store(err) => err.code(),
            Self::Corrupt { .. } => "vault_entry_corrupt",
            Self::Encode(_) => "vault_encode_failed",
        }
    }
}

/// Stable key for one account: `protocol/server/user_id`.
pub fn account_key(credentials: &Credentials) -> String {
    format!(
        "{}/{}/{}",
        credentials.protocol, credentials.server, credentials.user_id
    )
}

/// Saved logins, one JSON-encoded [`Credentials`] per account.
pub struct CredentialVault<S: SecretStore> {
    store: ScopedSecretStore<S>,
}

impl<S: SecretStore> CredentialVault<S> {
    pub fn new(store: S) -> Self {
        Self::with_service(store, DEFAULT_VAULT_SERVICE)
    }

    pub fn with_service(store: S, service: impl Into<String>) -> Self {
        Self {
            store: ScopedSecretStore::new(store, service),
        }
    }

    /// Save or replace the login for `credentials`; returns its key.
    pub fn save(&self, credentials: &Credentials) -> Result<String, VaultError> {
        let key = account_key(credentials);
        let encoded =
            serde_json::to_string(credentials).map_err(|err| VaultError::Encode(err.to_string()))?;
        self.store.set(&key, &encoded)?;

        let mut index = self.accounts()?;
        if !index.contains(&key) {
            index.push(key.clone());
            self.write_index(&index)?;
        }
        debug!(account = %key, "credentials saved");
        Ok(key)
    }

    pub fn load(&self, key: &str) -> Result<Option<Credentials>, VaultError> {
        let Some(raw) = self.store.get_optional(key)? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|err| VaultError::Corrupt {
                account: key.to_owned(),
                reason: err.to_string(),
            })
    }

    /// Every saved login, in save order. Unreadable entries are skipped.
    pub fn load_all(&self) -> Result<Vec<Credentials>, VaultError> {
        let mut saved = Vec::new();
        for key in self.accounts()? {
            match self.load(&key) {
                Ok(Some(credentials)) => saved.push(credentials),
                Ok(None) => debug!(account = %key, "indexed account has no entry"),
                Err(VaultError::Corrupt { account, reason }) => {
                    warn!(%account, %reason, "skipping unreadable credentials");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(saved)
    }

    /// Remove a saved login. Returns `false` when nothing was stored.
    pub fn forget(&self, key: &str) -> Result<bool, VaultError> {
        let existed = match self.store.delete(key) {
            Ok(()) => true,
            Err(SecretStoreError::NotFound) => false,
            Err(err) => return Err(err.into()),
        };

        let mut index = self.accounts()?;
        let before = index.len();
        index.retain(|known| known != key);
        if index.len() != before {
            self.write_index(&index)?;
        }
        Ok(existed)
    }

    /// Keys of every saved login.
    pub fn accounts(&self) -> Result<Vec<String>, VaultError> {
        let Some(raw) = self.store.get_optional(INDEX_ACCOUNT)? else {
            return Ok(Vec::new());
        };
        serde_json::from_str(&raw).map_err(|err| VaultError::Corrupt {
            account: INDEX_ACCOUNT.to_owned(),
            reason: err.to_string(),
        })
    }

    fn write_index(&self, index: &[String]) -> Result<(), VaultError> {
        let encoded =
            serde_json::to_string(index).map_err(|err| VaultError::Encode(err.to_string()))?;
        self.store.set(INDEX_ACCOUNT, &encoded)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret::{InMemorySecretStore, tests::OfflineStore};

    fn jabber() -> Credentials {
        Credentials::new("jabber", "a@x", "hunter2", "x", 5222)
    }

    #[test]
    fn saved_credentials_load_back() {
        let vault = CredentialVault::new(InMemorySecretStore::default());
        let key = vault.save(&jabber()).expect("save should work");

        assert_eq!(key, "jabber/x/a@x");
        assert_eq!(vault.load(&key), Ok(Some(jabber())));
        assert_eq!(vault.accounts(), Ok(vec![key]));
    }

    #[test]
    fn saving_twice_replaces_without_duplicating() {
        let vault = CredentialVault::new(InMemorySecretStore::default());
        vault.save(&jabber()).expect("first save");
        let mut changed = jabber();
        changed.password = "correct horse".into();
        vault.save(&changed).expect("second save");

        let saved = vault.load_all().expect("load all");
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].password, "correct horse");
    }

    #[test]
    fn forget_removes_entry_and_index() {
        let vault = CredentialVault::new(InMemorySecretStore::default());
        let key = vault.save(&jabber()).expect("save");

        assert_eq!(vault.forget(&key), Ok(true));
        assert_eq!(vault.forget(&key), Ok(false));
        assert_eq!(vault.load(&key), Ok(None));
        assert!(vault.accounts().expect("index").is_empty());
    }

    #[test]
    fn corrupt_entries_are_skipped_by_load_all() {
        let base = InMemorySecretStore::default();
        let vault = CredentialVault::new(base.clone());
        vault.save(&jabber()).expect("save");
        let other = Credentials::new("opensim_udp", "Test User", "", "sim", 9000);
        let broken = vault.save(&other).expect("save");
        base.set_secret(DEFAULT_VAULT_SERVICE, &broken, "{not json")
            .expect("overwrite");

        assert!(matches!(
            vault.load(&broken),
            Err(VaultError::Corrupt { .. })
        ));
        assert_eq!(vault.load_all(), Ok(vec![jabber()]));
    }

    #[test]
    fn store_outage_propagates() {
        let vault = CredentialVault::new(OfflineStore);
        let err = vault.save(&jabber()).expect_err("save must fail");
        assert_eq!(err.code(), "secret_store_unavailable");
    }
}
