//! Durable storage for the bearer token and last known user snapshot.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::types::{Token, UserSnapshot};

/// Raw persistence for the serialized credentials document.
///
/// The whole document is written in one call, so token and user can never be
/// observed half-updated.
pub trait StorageBackend: Send + Sync + 'static {
    /// Returns the stored document, or `None` if nothing has been saved.
    fn load(&self) -> Result<Option<String>, Error>;

    /// Replaces the stored document.
    fn store(&self, document: &str) -> Result<(), Error>;

    /// Removes the stored document. Removing an absent document succeeds.
    fn remove(&self) -> Result<(), Error>;
}

/// File-backed storage. Writes go to a sibling temp file that is renamed
/// into place.
#[derive(Debug, Clone)]
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl StorageBackend for FileStorage {
    fn load(&self) -> Result<Option<String>, Error> {
        match std::fs::read_to_string(&self.path) {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Storage(format!("{}: {e}", self.path.display()))),
        }
    }

    fn store(&self, document: &str) -> Result<(), Error> {
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, document)
            .and_then(|()| std::fs::rename(&tmp, &self.path))
            .map_err(|e| Error::Storage(format!("{}: {e}", self.path.display())))
    }

    fn remove(&self) -> Result<(), Error> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Storage(format!("{}: {e}", self.path.display()))),
        }
    }
}

/// In-process storage, lost on exit.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    document: Mutex<Option<String>>,
}

impl StorageBackend for MemoryStorage {
    fn load(&self) -> Result<Option<String>, Error> {
        Ok(self.document.lock().clone())
    }

    fn store(&self, document: &str) -> Result<(), Error> {
        *self.document.lock() = Some(document.to_owned());
        Ok(())
    }

    fn remove(&self) -> Result<(), Error> {
        *self.document.lock() = None;
        Ok(())
    }
}

/// Persisted layout: one token, one user object, one admin-login flag.
#[derive(Debug, Serialize, Deserialize)]
struct StoredDocument {
    token: Token,
    user: Option<UserSnapshot>,
    #[serde(default, rename = "isAdminLogin")]
    is_admin_login: bool,
}

/// What [`CredentialStore::read`] found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredCredentials {
    pub token: Option<Token>,
    pub user: Option<UserSnapshot>,
    /// Set when the token came from the admin login. Annotation only.
    pub admin_login: bool,
}

/// Token attached to outgoing requests.
///
/// Shared between the [`CredentialStore`] (the only writer) and the HTTP
/// client, so clearing the store also stops the `Authorization` header.
#[derive(Debug, Clone, Default)]
pub struct BearerToken(Arc<RwLock<Option<Token>>>);

impl BearerToken {
    #[must_use]
    pub fn get(&self) -> Option<Token> {
        self.0.read().clone()
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.0.read().is_some()
    }

    fn set(&self, token: Option<Token>) {
        *self.0.write() = token;
    }
}

/// Persists credentials across restarts and keeps the request bearer in sync.
pub struct CredentialStore {
    backend: Box<dyn StorageBackend>,
    bearer: BearerToken,
}

impl CredentialStore {
    /// Creates a store and primes the bearer slot from whatever is persisted.
    #[must_use]
    pub fn new(backend: impl StorageBackend) -> Self {
        let store = Self {
            backend: Box::new(backend),
            bearer: BearerToken::default(),
        };
        let stored = store.read();
        store.bearer.set(stored.token);
        store
    }

    /// Handle to the token attached to outgoing requests.
    #[must_use]
    pub fn bearer(&self) -> BearerToken {
        self.bearer.clone()
    }

    /// Writes token and user together, then starts attaching the token.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the backend write fails; the bearer is
    /// left unchanged in that case.
    pub fn save(&self, token: &Token, user: &UserSnapshot, admin_login: bool) -> Result<(), Error> {
        let doc = StoredDocument {
            token: token.clone(),
            user: Some(user.clone()),
            is_admin_login: admin_login,
        };
        let json = serde_json::to_string(&doc).map_err(|e| Error::Storage(e.to_string()))?;
        self.backend.store(&json)?;
        self.bearer.set(Some(token.clone()));
        Ok(())
    }

    /// Replaces the stored user snapshot, keeping token and flag.
    ///
    /// Does nothing when no token is stored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the backend write fails.
    pub fn update_user(&self, user: &UserSnapshot) -> Result<(), Error> {
        let stored = self.read();
        match stored.token {
            Some(token) => self.save(&token, user, stored.admin_login),
            None => Ok(()),
        }
    }

    /// Forgets token and user.
    ///
    /// The bearer is dropped first, so no request issued after this returns
    /// carries the old token even if the backend removal fails.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the backend removal fails.
    pub fn clear(&self) -> Result<(), Error> {
        self.bearer.set(None);
        self.backend.remove()
    }

    /// Returns the last saved credentials. Never fails: unreadable or corrupt
    /// storage is logged and reported as empty.
    #[must_use]
    pub fn read(&self) -> StoredCredentials {
        let raw = match self.backend.load() {
            Ok(Some(raw)) => raw,
            Ok(None) => return StoredCredentials::default(),
            Err(e) => {
                tracing::warn!(error = %e, "Credential storage unreadable");
                return StoredCredentials::default();
            }
        };
        match serde_json::from_str::<StoredDocument>(&raw) {
            Ok(doc) => StoredCredentials {
                token: Some(doc.token),
                user: doc.user,
                admin_login: doc.is_admin_login,
            },
            Err(e) => {
                tracing::warn!(error = %e, "Discarding corrupt stored credentials");
                StoredCredentials::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Role, UserId};

    fn user() -> UserSnapshot {
        UserSnapshot {
            id: UserId::from("u1".to_string()),
            name: "Ana".into(),
            email: "ana@example.com".into(),
            role: Role::User,
            profile_image_ref: None,
        }
    }

    #[test]
    fn read_on_empty_store_is_absent() {
        let store = CredentialStore::new(MemoryStorage::default());
        assert_eq!(store.read(), StoredCredentials::default());
        assert!(!store.bearer().is_set());
    }

    #[test]
    fn save_then_read_returns_same_pair() {
        let store = CredentialStore::new(MemoryStorage::default());
        let token = Token::new("t-1");
        store.save(&token, &user(), true).unwrap();

        let read = store.read();
        assert_eq!(read.token, Some(token.clone()));
        assert_eq!(read.user, Some(user()));
        assert!(read.admin_login);
        assert_eq!(store.bearer().get(), Some(token));
    }

    #[test]
    fn clear_twice_is_same_as_once() {
        let store = CredentialStore::new(MemoryStorage::default());
        store.save(&Token::new("t-1"), &user(), false).unwrap();

        store.clear().unwrap();
        let once = store.read();
        store.clear().unwrap();
        assert_eq!(store.read(), once);
        assert_eq!(once, StoredCredentials::default());
        assert!(!store.bearer().is_set());
    }

    #[test]
    fn corrupt_document_reads_as_empty() {
        let backend = MemoryStorage::default();
        backend.store("{not json").unwrap();
        let store = CredentialStore::new(backend);
        assert_eq!(store.read(), StoredCredentials::default());
    }

    #[test]
    fn update_user_without_token_is_noop() {
        let store = CredentialStore::new(MemoryStorage::default());
        store.update_user(&user()).unwrap();
        assert_eq!(store.read(), StoredCredentials::default());
    }

    #[test]
    fn file_storage_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.json");

        let store = CredentialStore::new(FileStorage::new(&path));
        store.save(&Token::new("t-2"), &user(), false).unwrap();
        drop(store);

        let reopened = CredentialStore::new(FileStorage::new(&path));
        assert_eq!(reopened.read().token, Some(Token::new("t-2")));
        assert_eq!(reopened.bearer().get(), Some(Token::new("t-2")));

        reopened.clear().unwrap();
        reopened.clear().unwrap();
        assert!(!path.exists());
    }
}
