use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SecretStoreError {
    #[error("secret not found")]
    NotFound,
    #[error("secret store unavailable: {0}")]
    Unavailable(String),
    #[error("secret store backend failure: {0}")]
    Backend(String),
}

impl SecretStoreError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound => "secret_not_found",
            Self::Unavailable(_) => "secret_store_unavailable",
            Self::Backend(_) => "secret_store_backend",
        }
    }
}

/// Place to keep secrets, addressed by `(service, account)`.
pub trait SecretStore: Send + Sync {
    fn set_secret(&self, service: &str, account: &str, secret: &str)
    -> Result<(), SecretStoreError>;

    fn get_secret(&self, service: &str, account: &str) -> Result<String, SecretStoreError>;

    /// Fails with `NotFound` when nothing is stored.
    fn delete_secret(&self, service: &str, account: &str) -> Result<(), SecretStoreError>;
}

type SecretKey = (String, String);

/// Process-local store. Clones share the same map.
#[derive(Clone, Default)]
pub struct InMemorySecretStore {
    secrets: Arc<Mutex<HashMap<SecretKey, String>>>,
}

impl InMemorySecretStore {
    /// Number of stored secrets across all services.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SecretKey, String>> {
        self.secrets.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn key(service: &str, account: &str) -> SecretKey {
    (service.to_owned(), account.to_owned())
}

impl SecretStore for InMemorySecretStore {
    fn set_secret(
        &self,
        service: &str,
        account: &str,
        secret: &str,
    ) -> Result<(), SecretStoreError> {
        self.lock().insert(key(service, account), secret.to_owned());
        Ok(())
    }

    fn get_secret(&self, service: &str, account: &str) -> Result<String, SecretStoreError> {
        self.lock()
            .get(&key(service, account))
            .cloned()
            .ok_or(SecretStoreError::NotFound)
    }

    fn delete_secret(&self, service: &str, account: &str) -> Result<(), SecretStoreError> {
        self.lock()
            .remove(&key(service, account))
            .map(|_| ())
            .ok_or(SecretStoreError::NotFound)
    }
}

/// Store backed by the operating system keychain.
#[cfg(feature = "os-keyring")]
#[derive(Debug, Default, Clone, Copy)]
pub struct OsKeyringSecretStore;

#[cfg(feature = "os-keyring")]
impl OsKeyringSecretStore {
    fn entry(service: &str, account: &str) -> Result<keyring::Entry, SecretStoreError> {
        keyring::Entry::new(service, account).map_err(keyring_error)
    }
}

#[cfg(feature = "os-keyring")]
fn keyring_error(err: keyring::Error) -> SecretStoreError {
    match err {
        keyring::Error::NoEntry => SecretStoreError::NotFound,
        keyring::Error::NoStorageAccess(inner) => SecretStoreError::Unavailable(inner.to_string()),
        keyring::Error::PlatformFailure(inner) => SecretStoreError::Unavailable(inner.to_string()),
        other => SecretStoreError::Backend(other.to_string()),
    }
}

#[cfg(feature = "os-keyring")]
impl SecretStore for OsKeyringSecretStore {
    fn set_secret(
        &self,
        service: &str,
        account: &str,
        secret: &str,
    ) -> Result<(), SecretStoreError> {
        Self::entry(service, account)?
            .set_password(secret)
            .map_err(keyring_error)
    }

    fn get_secret(&self, service: &str, account: &str) -> Result<String, SecretStoreError> {
        Self::entry(service, account)?
            .get_password()
            .map_err(keyring_error)
    }

    fn delete_secret(&self, service: &str, account: &str) -> Result<(), SecretStoreError> {
        Self::entry(service, account)?
            .delete_credential()
            .map_err(keyring_error)
    }
}

/// A store pinned to one service name.
#[derive(Clone)]
pub struct ScopedSecretStore<S: SecretStore> {
    inner: S,
    service: String,
}

impl<S: SecretStore> ScopedSecretStore<S> {
    pub fn new(inner: S, service: impl Into<String>) -> Self {
        Self {
            inner,
            service: service.into(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn set(&self, account: &str, secret: &str) -> Result<(), SecretStoreError> {
        self.inner.set_secret(&self.service, account, secret)
    }

    pub fn get(&self, account: &str) -> Result<String, SecretStoreError> {
        self.inner.get_secret(&self.service, account)
    }

    /// Missing values read as `None` instead of an error.
    pub fn get_optional(&self, account: &str) -> Result<Option<String>, SecretStoreError> {
        match self.get(account) {
            Ok(secret) => Ok(Some(secret)),
            Err(SecretStoreError::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn delete(&self, account: &str) -> Result<(), SecretStoreError> {
        self.inner.delete_secret(&self.service, account)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[derive(Default)]
    pub(crate) struct OfflineStore;

    impl SecretStore for OfflineStore {
        fn set_secret(
            &self,
            _service: &str,
            _account: &str,
            _secret: &str,
        ) -> Result<(), SecretStoreError> {
            Err(SecretStoreError::Unavailable("keychain locked".to_owned()))
        }

        fn get_secret(&self, _service: &str, _account: &str) -> Result<String, SecretStoreError> {
            Err(SecretStoreError::Unavailable("keychain locked".to_owned()))
        }

        fn delete_secret(&self, _service: &str, _account: &str) -> Result<(), SecretStoreError> {
            Err(SecretStoreError::Unavailable("keychain locked".to_owned()))
        }
    }

    #[test]
    fn in_memory_store_forgets_deleted_secrets() {
        let store = InMemorySecretStore::default();
        store
            .set_secret("comms", "jabber:a@x", "hunter2")
            .expect("set should work");
        assert_eq!(
            store.get_secret("comms", "jabber:a@x").as_deref(),
            Ok("hunter2")
        );

        store
            .delete_secret("comms", "jabber:a@x")
            .expect("delete should work");
        assert!(store.is_empty());
        assert_eq!(
            store.delete_secret("comms", "jabber:a@x"),
            Err(SecretStoreError::NotFound)
        );
    }

    #[test]
    fn scoped_stores_share_backing_but_not_keys() {
        let base = InMemorySecretStore::default();
        let work = ScopedSecretStore::new(base.clone(), "comms-work");
        let home = ScopedSecretStore::new(base.clone(), "comms-home");

        work.set("bob", "one").expect("set work");
        home.set("bob", "two").expect("set home");

        assert_eq!(work.get("bob").as_deref(), Ok("one"));
        assert_eq!(home.get("bob").as_deref(), Ok("two"));
        assert_eq!(base.len(), 2);
        assert_eq!(work.get_optional("carol"), Ok(None));
    }

    #[test]
    fn outage_is_not_reported_as_missing() {
        let scoped = ScopedSecretStore::new(OfflineStore, "comms");
        let err = scoped.get_optional("bob").expect_err("outage must surface");
        assert_eq!(err.code(), "secret_store_unavailable");
    }
}
