//! Session reconciliation: the single writer of the client's authenticated
//! identity.
//!
//! The local [`Session`] may lag the server. It is reconciled on every
//! authoritative read (`GET /auth/me`, login, profile update): the server's
//! user replaces the cached one wholesale.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::credentials::CredentialStore;
use crate::error::{Error, ErrorKind};
use crate::types::{Role, Token, UserSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Unauthenticated,
    /// A token is held and a refresh is in flight.
    Authenticating,
    Authenticated,
}

/// The client's current belief about who is signed in.
///
/// `token` is present iff `status != Unauthenticated`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub status: SessionStatus,
    pub token: Option<Token>,
    pub user: Option<UserSnapshot>,
    pub last_error: Option<ErrorKind>,
    /// Token came from the admin login. Never used for authorization.
    pub admin_login: bool,
}

impl Session {
    #[must_use]
    pub fn unauthenticated(last_error: Option<ErrorKind>) -> Self {
        Self {
            status: SessionStatus::Unauthenticated,
            token: None,
            user: None,
            last_error,
            admin_login: false,
        }
    }

    #[must_use]
    pub fn role(&self) -> Option<Role> {
        self.user.as_ref().map(|u| u.role)
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::unauthenticated(None)
    }
}

#[derive(Clone, Serialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

impl LoginRequest {
    #[must_use]
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginRequest")
            .field("email", &self.email)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    pub token: Token,
    pub user: UserSnapshot,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoUpdate {
    pub profile_image: String,
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordChange {
    pub current_password: String,
    pub new_password: String,
}

impl std::fmt::Debug for PasswordChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PasswordChange(***)")
    }
}

/// Backend authentication endpoints.
pub trait AuthBackend: Send + Sync + 'static {
    /// `POST /auth/login`
    fn login(
        &self,
        request: &LoginRequest,
    ) -> impl Future<Output = Result<LoginResponse, Error>> + Send;

    /// `POST /auth/admin/login`
    fn admin_login(
        &self,
        request: &LoginRequest,
    ) -> impl Future<Output = Result<LoginResponse, Error>> + Send;

    /// `GET /auth/me`
    fn me(&self) -> impl Future<Output = Result<UserSnapshot, Error>> + Send;

    /// `PUT /auth/updateprofile`
    fn update_profile(
        &self,
        update: &ProfileUpdate,
    ) -> impl Future<Output = Result<UserSnapshot, Error>> + Send;

    /// `PUT /auth/updatephoto`
    fn update_photo(
        &self,
        update: &PhotoUpdate,
    ) -> impl Future<Output = Result<UserSnapshot, Error>> + Send;

    /// `POST /auth/changepassword`
    fn change_password(
        &self,
        change: &PasswordChange,
    ) -> impl Future<Output = Result<(), Error>> + Send;
}

/// Receives the global "server rejected our token" signal.
///
/// Components that make authenticated calls report `SessionExpired` here
/// instead of handling it themselves.
pub trait SessionExpiryHandler: Send + Sync {
    fn session_expired(&self);
}

/// Owns the session state and the credential store.
pub struct SessionReconciler<A> {
    backend: A,
    credentials: CredentialStore,
    state: watch::Sender<Session>,
    // Bumped whenever a session ends or a new one begins; results of calls
    // started under an older generation are dropped.
    generation: AtomicU64,
}

impl<A: AuthBackend> SessionReconciler<A> {
    #[must_use]
    pub fn new(backend: A, credentials: CredentialStore) -> Self {
        let (state, _) = watch::channel(Session::default());
        Self {
            backend,
            credentials,
            state,
            generation: AtomicU64::new(0),
        }
    }

    /// Snapshot of the current session.
    #[must_use]
    pub fn session(&self) -> Session {
        self.state.borrow().clone()
    }

    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.state.borrow().status
    }

    /// Read-only view that is notified on every session change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    /// Startup reconciliation.
    ///
    /// Without a stored token this settles on `Unauthenticated` and makes no
    /// network call. Otherwise the cached user is shown immediately while a
    /// refresh runs.
    pub async fn restore(&self) -> SessionStatus {
        let stored = self.credentials.read();
        let Some(token) = stored.token else {
            tracing::debug!("No stored credentials");
            self.state.send_replace(Session::default());
            return SessionStatus::Unauthenticated;
        };

        let generation = self.generation.load(Ordering::SeqCst);
        self.state.send_replace(Session {
            status: SessionStatus::Authenticating,
            token: Some(token),
            user: stored.user,
            last_error: None,
            admin_login: stored.admin_login,
        });

        self.refresh_for(generation).await
    }

    /// Re-reads the user from the server. A no-op while signed out.
    pub async fn refresh(&self) -> SessionStatus {
        if self.status() == SessionStatus::Unauthenticated {
            return SessionStatus::Unauthenticated;
        }
        let generation = self.generation.load(Ordering::SeqCst);
        self.refresh_for(generation).await
    }

    async fn refresh_for(&self, generation: u64) -> SessionStatus {
        let result = self.backend.me().await;

        if self.generation.load(Ordering::SeqCst) != generation {
            tracing::debug!("Discarding refresh from a superseded session");
            return self.status();
        }

        match result {
            Ok(user) => {
                if let Err(e) = self.credentials.update_user(&user) {
                    tracing::warn!(error = %e, "Failed to persist refreshed user");
                }
                self.state.send_modify(|s| {
                    s.status = SessionStatus::Authenticated;
                    s.user = Some(user);
                    s.last_error = None;
                });
                SessionStatus::Authenticated
            }
            Err(e) if e.is_session_expired() => {
                tracing::info!("Stored token rejected by server");
                self.end_session(Some(ErrorKind::SessionExpired));
                SessionStatus::Unauthenticated
            }
            Err(e) => {
                let kind = e.kind();
                if self.state.borrow().user.is_some() {
                    tracing::warn!(error = %e, "Refresh failed, keeping cached user");
                    self.state.send_modify(|s| {
                        s.status = SessionStatus::Authenticated;
                        s.last_error = Some(kind);
                    });
                    SessionStatus::Authenticated
                } else {
                    tracing::warn!(error = %e, "Refresh failed with no cached user");
                    self.end_session(Some(kind));
                    SessionStatus::Unauthenticated
                }
            }
        }
    }

    /// Customer login.
    ///
    /// # Errors
    ///
    /// Returns the backend's error (typically [`Error::Unauthorized`]) and
    /// leaves stored credentials untouched.
    pub async fn login(&self, request: &LoginRequest) -> Result<UserSnapshot, Error> {
        self.login_with(request, false).await
    }

    /// Admin console login.
    ///
    /// # Errors
    ///
    /// Same as [`login`](Self::login), plus [`Error::Unauthorized`] when the
    /// server returns a token for a non-admin account.
    pub async fn admin_login(&self, request: &LoginRequest) -> Result<UserSnapshot, Error> {
        self.login_with(request, true).await
    }

    async fn login_with(&self, request: &LoginRequest, admin: bool) -> Result<UserSnapshot, Error> {
        let generation = self.generation.load(Ordering::SeqCst);
        let result = if admin {
            self.backend.admin_login(request).await
        } else {
            self.backend.login(request).await
        };

        if self.generation.load(Ordering::SeqCst) != generation {
            tracing::debug!("Discarding login response from a superseded session");
            return Err(Error::Unknown("login superseded".into()));
        }

        let response = match result {
            Ok(r) if admin && r.user.role != Role::Admin => {
                tracing::warn!(user_id = %r.user.id, "Admin login returned a non-admin account");
                Err(Error::Unauthorized("account is not an administrator".into()))
            }
            other => other,
        };

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                self.reject_login(&e);
                return Err(e);
            }
        };

        if let Err(e) = self.credentials.save(&response.token, &response.user, admin) {
            tracing::error!(error = %e, "Failed to persist credentials");
            self.reject_login(&e);
            return Err(e);
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.send_replace(Session {
            status: SessionStatus::Authenticated,
            token: Some(response.token),
            user: Some(response.user.clone()),
            last_error: None,
            admin_login: admin,
        });
        tracing::info!(user_id = %response.user.id, admin, "Login successful");

        self.refresh_for(generation).await;
        self.state
            .borrow()
            .user
            .clone()
            .ok_or(Error::SessionExpired)
    }

    // Stored credentials stay as they are; a refresh still running for the
    // previous session must not land on top of this state.
    fn reject_login(&self, error: &Error) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.state.send_replace(Session::unauthenticated(Some(error.kind())));
    }

    /// Ends the session. Only a fresh login restores it.
    pub fn logout(&self) {
        self.end_session(None);
        tracing::info!("Logged out");
    }

    fn end_session(&self, reason: Option<ErrorKind>) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = self.credentials.clear() {
            tracing::warn!(error = %e, "Failed to clear stored credentials");
        }
        self.state.send_replace(Session::unauthenticated(reason));
    }

    /// Forwards a result, logging out first if it carries `SessionExpired`.
    ///
    /// # Errors
    ///
    /// Returns `result`'s error unchanged.
    pub fn observe<T>(&self, result: Result<T, Error>) -> Result<T, Error> {
        if let Err(e) = &result {
            if e.is_session_expired() {
                self.session_expired();
            }
        }
        result
    }

    /// Updates name/email/phone and replaces the cached user with the response.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unauthorized`] without a network call when signed out,
    /// otherwise the backend's error.
    pub async fn update_profile(&self, update: &ProfileUpdate) -> Result<UserSnapshot, Error> {
        let generation = self.require_session()?;
        let result = self.observe(self.backend.update_profile(update).await);
        self.apply_user_update(generation, result)
    }

    /// Replaces the profile photo and the cached user with the response.
    ///
    /// # Errors
    ///
    /// Same as [`update_profile`](Self::update_profile).
    pub async fn update_photo(&self, update: &PhotoUpdate) -> Result<UserSnapshot, Error> {
        let generation = self.require_session()?;
        let result = self.observe(self.backend.update_photo(update).await);
        self.apply_user_update(generation, result)
    }

    /// Changes the password. The session is not modified.
    ///
    /// # Errors
    ///
    /// Same as [`update_profile`](Self::update_profile).
    pub async fn change_password(&self, change: &PasswordChange) -> Result<(), Error> {
        self.require_session()?;
        self.observe(self.backend.change_password(change).await)
    }

    fn require_session(&self) -> Result<u64, Error> {
        if self.status() == SessionStatus::Unauthenticated {
            return Err(Error::Unauthorized("not signed in".into()));
        }
        Ok(self.generation.load(Ordering::SeqCst))
    }

    fn apply_user_update(
        &self,
        generation: u64,
        result: Result<UserSnapshot, Error>,
    ) -> Result<UserSnapshot, Error> {
        let user = result?;
        if self.generation.load(Ordering::SeqCst) != generation {
            tracing::debug!("Discarding profile update from a superseded session");
            return Ok(user);
        }
        if let Err(e) = self.credentials.update_user(&user) {
            tracing::warn!(error = %e, "Failed to persist updated user");
        }
        self.state.send_modify(|s| s.user = Some(user.clone()));
        Ok(user)
    }
}

impl<A: AuthBackend> SessionExpiryHandler for SessionReconciler<A> {
    fn session_expired(&self) {
        if self.status() != SessionStatus::Unauthenticated {
            tracing::info!("Session expired, logging out");
        }
        self.end_session(Some(ErrorKind::SessionExpired));
    }
}
