//! Session lifecycle: credential exchange, token storage, expiry tracking and
//! renewal.
//!
//! ```text
//!                  login ok                 refresh ok
//! Unauthenticated ─────────▶ Authenticated ◀──────────┐
//!        ▲                        │  └────────────────┘
//!        └────────────────────────┘
//!          logout / refresh failure
//! ```
//!
//! [`Session`] is the only writer of the [`CredentialStore`]. Renewal is
//! single-flight: the proactive timer, [`Session::resume`] and the request
//! pipeline all share one in-flight exchange.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::error::Error;
use crate::observable::Observable;
use crate::pipeline::RequestPipeline;
use crate::singleflight::{Role as FlightRole, SingleFlight};
use crate::store::{CredentialKey, CredentialStore};
use crate::token::{AccessGrant, is_token_expired, token_expiry};
use crate::transport::{ApiRequest, Transport};
use crate::types::{
    ChangePasswordRequest, Credentials, EntityId, Identity, RegisterRequest, Role,
    UpdateProfileRequest,
};

/// Profile fields shared by the login, register and `/auth/me` responses.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileResponse {
    id: EntityId,
    username: String,
    email: String,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    last_name: Option<String>,
    role: Role,
}

impl ProfileResponse {
    fn into_identity(self) -> Identity {
        Identity::from_profile(
            self.id,
            self.username,
            self.email,
            self.first_name.as_deref(),
            self.last_name.as_deref(),
            self.role,
        )
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    token: String,
    refresh_token: String,
    #[serde(flatten)]
    profile: ProfileResponse,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    access_token: String,
    refresh_token: String,
}

#[derive(Default)]
struct Tokens {
    access: Option<String>,
    refresh: Option<String>,
}

/// The single pending proactive renewal. `generation` invalidates a timer that
/// has already woken up but not yet claimed the slot.
#[derive(Default)]
struct RefreshTimer {
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

type RenewalOutcome = Result<AccessGrant, Error>;

/// Authentication state of one running client.
///
/// Always handed out as `Arc<Session>`; share it with every component that
/// needs credentials instead of reaching for a global.
pub struct Session<T, S> {
    config: ClientConfig,
    transport: Arc<T>,
    store: Arc<S>,
    me: Weak<Self>,
    tokens: Mutex<Tokens>,
    /// Bumped by login and logout; a renewal that started in an older epoch
    /// must not install its grant.
    epoch: AtomicU64,
    identity: Observable<Option<Identity>>,
    /// Stored identity of a session that hydrated with an expired access token;
    /// published once [`resume`](Self::resume) starts the renewal.
    hydrated: Mutex<Option<Identity>>,
    authenticated: Observable<bool>,
    renewal: SingleFlight<RenewalOutcome>,
    timer: Mutex<RefreshTimer>,
}

impl<T: Transport, S: CredentialStore> Session<T, S> {
    /// Create a session hydrated from `store`.
    ///
    /// A stored access token that is present and unexpired makes the session
    /// authenticated immediately. Otherwise the session starts unauthenticated
    /// with no identity, even if a refresh token and identity are stored; call
    /// [`resume`](Self::resume) afterwards to renew an expired token and start
    /// the proactive timer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the store cannot be read.
    pub fn new(config: ClientConfig, transport: Arc<T>, store: Arc<S>) -> Result<Arc<Self>, Error> {
        let access = store.get(CredentialKey::AccessToken)?;
        let refresh = store.get(CredentialKey::RefreshToken)?;
        let identity = match store.get(CredentialKey::Identity)? {
            Some(raw) => match serde_json::from_str::<Identity>(&raw) {
                Ok(identity) => Some(identity),
                Err(e) => {
                    tracing::warn!(error = %e, "ignoring unreadable cached identity");
                    None
                }
            },
            None => None,
        };

        let authenticated = access.as_deref().is_some_and(|t| !is_token_expired(t));
        let identity = identity.filter(|_| access.is_some() || refresh.is_some());
        let (identity, hydrated) = if authenticated {
            (identity, None)
        } else {
            (None, identity)
        };

        tracing::debug!(authenticated, "session hydrated from credential store");

        Ok(Arc::new_cyclic(|me| Self {
            config,
            transport,
            store,
            me: me.clone(),
            tokens: Mutex::new(Tokens { access, refresh }),
            epoch: AtomicU64::new(0),
            identity: Observable::new(identity),
            hydrated: Mutex::new(hydrated),
            authenticated: Observable::new(authenticated),
            renewal: SingleFlight::new(),
            timer: Mutex::new(RefreshTimer::default()),
        }))
    }

    /// Start-up check: renew an expired stored token, or arm the proactive timer
    /// for a valid one.
    ///
    /// While the start-up renewal is in flight the session reports itself as
    /// authenticated.
    ///
    /// # Errors
    ///
    /// Propagates the renewal error; the session has been ended in that case.
    pub async fn resume(&self) -> Result<(), Error> {
        let (access, has_refresh) = {
            let tokens = self.tokens.lock();
            (tokens.access.clone(), tokens.refresh.is_some())
        };

        match access {
            Some(token) if !is_token_expired(&token) => {
                if self.config.proactive_refresh {
                    self.schedule_proactive_refresh();
                }
                if self.identity.with(Option::is_none) && self.config.merge_identity_after_refresh {
                    self.spawn_identity_merge();
                }
                Ok(())
            }
            Some(_) => {
                if has_refresh {
                    let hydrated = self.hydrated.lock().take();
                    if let Some(identity) = hydrated {
                        self.identity.set(Some(identity));
                    }
                    self.authenticated.set(true);
                }
                self.refresh().await.map(|_| ())
            }
            None => Ok(()),
        }
    }

    /// Exchange credentials for a grant.
    ///
    /// A rejected login leaves any existing session untouched.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidCredentials`] when the server rejects the credentials
    /// - [`Error::Transport`] / [`Error::RemoteRejected`] for other failures
    pub async fn login(&self, credentials: &Credentials) -> Result<AccessGrant, Error> {
        let request = ApiRequest::post("/auth/login").with_json(credentials)?;
        let response = self.transport.send(&request, None).await?;

        if matches!(response.status, 400 | 401 | 403) {
            tracing::warn!(username = %credentials.username, status = response.status, "login rejected");
            return Err(Error::InvalidCredentials);
        }
        let body: LoginResponse = response.ensure_success("login")?.json()?;

        let identity = body.profile.into_identity();
        let grant = AccessGrant::new(body.token, body.refresh_token);

        self.epoch.fetch_add(1, Ordering::SeqCst);
        tracing::info!(username = %identity.username, "login successful");
        self.install(&grant, Some(identity));

        Ok(grant)
    }

    /// Create an account. Does not sign in.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RemoteRejected`] for validation failures, or
    /// [`Error::Transport`] on network failure.
    pub async fn register(&self, request: &RegisterRequest) -> Result<Identity, Error> {
        let request = ApiRequest::post("/auth/register").with_json(request)?;
        let response = self.transport.send(&request, None).await?;
        let profile: ProfileResponse = response.ensure_success("register")?.json()?;
        Ok(profile.into_identity())
    }

    /// End the session.
    ///
    /// Clears stored credentials and in-memory state synchronously, then
    /// notifies observers. Never fails; calling it again is a no-op. Server-side
    /// revocation, if enabled, runs in the background.
    pub fn logout(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let previous = std::mem::take(&mut *self.tokens.lock());
        self.hydrated.lock().take();
        self.cancel_timer();

        if let Err(e) = self.store.clear() {
            tracing::warn!(error = %e, "failed to clear stored credentials during logout");
        }

        let identity = self.identity.get();
        self.identity.set(None);
        self.authenticated.set(false);

        if let Some(access) = previous.access {
            tracing::info!("logged out");
            if self.config.revoke_on_logout {
                if let Some(identity) = identity {
                    self.spawn_revocation(identity.username, access);
                }
            }
        }
    }

    /// Exchange the stored refresh token for a new grant.
    ///
    /// Concurrent callers share one exchange. An exchange every caller has
    /// dropped is abandoned, and the next call starts a fresh one with the
    /// current refresh token. Without a refresh token this fails fast, without
    /// contacting the server. Any failure ends the session before the error is
    /// returned.
    ///
    /// # Errors
    ///
    /// - [`Error::NoRefreshToken`] when no refresh token is stored
    /// - [`Error::RefreshRejected`] when the server refuses it
    /// - [`Error::Transport`] when the server is unreachable
    /// - [`Error::SessionEnded`] when logout or login superseded the renewal
    pub async fn refresh(&self) -> Result<AccessGrant, Error> {
        // Loaded before the token so a concurrent login can only make this
        // renewal stale, never attribute an old token to the new session.
        let epoch = self.epoch.load(Ordering::SeqCst);
        let refresh_token = self.tokens.lock().refresh.clone();
        let Some(refresh_token) = refresh_token else {
            tracing::debug!("renewal requested without a refresh token");
            self.logout();
            return Err(Error::NoRefreshToken);
        };

        let me = self.me.clone();
        let (role, flight) = self.renewal.join_or_start(epoch, move || async move {
            match me.upgrade() {
                Some(session) => session.exchange_refresh_token(epoch, refresh_token).await,
                None => Err(Error::SessionEnded),
            }
        });
        if role == FlightRole::Follower {
            tracing::debug!("joining in-flight renewal");
        }
        flight.await
    }

    /// Fetch the signed-in user's profile from `/auth/me` and cache it.
    ///
    /// Uses the current access token as-is; it does not renew.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AuthorizationExpired`] on 401, or the usual transport errors.
    pub async fn fetch_identity(&self) -> Result<Identity, Error> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let token = self.access_token();
        let request = ApiRequest::get("/auth/me");
        let response = self.transport.send(&request, token.as_deref()).await?;
        let profile: ProfileResponse = response.ensure_success("fetch identity")?.json()?;
        let identity = profile.into_identity();

        if self.epoch.load(Ordering::SeqCst) != epoch || !self.authenticated.get() {
            return Err(Error::SessionEnded);
        }
        self.persist_identity(&identity);
        self.identity.set(Some(identity.clone()));
        Ok(identity)
    }

    /// Update the signed-in user's profile and cache the server's copy as the
    /// identity.
    ///
    /// Goes through the request pipeline, so an expired token is renewed and the
    /// call replayed once.
    ///
    /// # Errors
    ///
    /// Pipeline errors, or [`Error::SessionEnded`] if the session ended or was
    /// replaced before the answer arrived; nothing is cached in either case.
    pub async fn update_profile(&self, changes: &UpdateProfileRequest) -> Result<Identity, Error> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let request = ApiRequest::put("/auth/profile").with_json(changes)?;
        let profile: ProfileResponse = self.pipeline()?.fetch(&request).await?;
        let identity = profile.into_identity();

        if self.epoch.load(Ordering::SeqCst) != epoch || !self.authenticated.get() {
            return Err(Error::SessionEnded);
        }
        tracing::info!(username = %identity.username, "profile updated");
        self.persist_identity(&identity);
        self.identity.set(Some(identity.clone()));
        Ok(identity)
    }

    /// Change the signed-in user's password. The session and its tokens are
    /// kept.
    ///
    /// # Errors
    ///
    /// Pipeline errors; a wrong current password is a [`Error::RemoteRejected`].
    pub async fn change_password(&self, change: &ChangePasswordRequest) -> Result<(), Error> {
        let request = ApiRequest::post("/auth/change-password").with_json(change)?;
        self.pipeline()?.send(&request).await?;
        tracing::info!("password changed");
        Ok(())
    }

    /// Arm the proactive renewal for the current access token.
    ///
    /// The deadline is the token's expiry minus the configured margin. If that
    /// deadline has already passed nothing is scheduled; the pipeline's reactive
    /// renewal covers that case. Replaces any previously scheduled renewal.
    pub fn schedule_proactive_refresh(&self) {
        let expires_at = self.tokens.lock().access.as_deref().and_then(token_expiry);
        self.schedule_at(expires_at);
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.get()
    }

    #[must_use]
    pub fn identity(&self) -> Option<Identity> {
        self.identity.get()
    }

    /// Observable "is authenticated" flag.
    #[must_use]
    pub fn authenticated_state(&self) -> &Observable<bool> {
        &self.authenticated
    }

    /// Observable "current identity or none".
    #[must_use]
    pub fn identity_state(&self) -> &Observable<Option<Identity>> {
        &self.identity
    }

    #[must_use]
    pub fn has_refresh_token(&self) -> bool {
        self.tokens.lock().refresh.is_some()
    }

    /// Whether a renewal exchange is currently in flight.
    #[must_use]
    pub fn is_renewing(&self) -> bool {
        self.renewal.in_flight()
    }

    #[must_use]
    pub fn has_role(&self, role: Role) -> bool {
        self.identity.with(|i| i.as_ref().is_some_and(|i| i.role == role))
    }

    #[must_use]
    pub fn has_any_role(&self, roles: &[Role]) -> bool {
        self.identity
            .with(|i| i.as_ref().is_some_and(|i| roles.contains(&i.role)))
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn access_token(&self) -> Option<String> {
        self.tokens.lock().access.clone()
    }

    fn pipeline(&self) -> Result<RequestPipeline<T, S>, Error> {
        let session = self.me.upgrade().ok_or(Error::SessionEnded)?;
        Ok(RequestPipeline::new(session, Arc::clone(&self.transport)))
    }

    async fn exchange_refresh_token(&self, epoch: u64, refresh_token: String) -> RenewalOutcome {
        let outcome = self.request_refresh(&refresh_token).await;

        if self.epoch.load(Ordering::SeqCst) != epoch {
            tracing::debug!("discarding renewal result for a superseded session");
            return Err(Error::SessionEnded);
        }

        match outcome {
            Ok(grant) => {
                tracing::info!(expires_at = ?grant.expires_at(), "session renewed");
                self.install(&grant, None);
                if self.identity.with(Option::is_none) && self.config.merge_identity_after_refresh {
                    self.spawn_identity_merge();
                }
                Ok(grant)
            }
            Err(e) => {
                tracing::warn!(error = %e, "renewal failed, ending session");
                self.logout();
                Err(e)
            }
        }
    }

    async fn request_refresh(&self, refresh_token: &str) -> RenewalOutcome {
        let request = ApiRequest::post("/auth/refresh").with_json(&RefreshRequest { refresh_token })?;
        let response = self.transport.send(&request, None).await?;

        if !response.is_success() {
            return Err(Error::RefreshRejected {
                status: Some(response.status),
                detail: response.body,
            });
        }
        let body: RefreshResponse = response.json()?;
        Ok(AccessGrant::new(body.access_token, body.refresh_token))
    }

    /// Store a new grant and mark the session authenticated. `identity` is only
    /// replaced when given; renewals keep the cached one, or publish the
    /// hydrated one if it is still held back.
    fn install(&self, grant: &AccessGrant, identity: Option<Identity>) {
        {
            let mut tokens = self.tokens.lock();
            tokens.access = Some(grant.access_token().to_owned());
            tokens.refresh = Some(grant.refresh_token().to_owned());
        }
        self.persist(CredentialKey::AccessToken, grant.access_token());
        self.persist(CredentialKey::RefreshToken, grant.refresh_token());

        let hydrated = self.hydrated.lock().take();
        if let Some(identity) = identity {
            self.persist_identity(&identity);
            self.identity.set(Some(identity));
        } else if let Some(identity) = hydrated {
            self.identity.set(Some(identity));
        }
        self.authenticated.set(true);

        if self.config.proactive_refresh {
            self.schedule_at(grant.expires_at());
        } else {
            self.cancel_timer();
        }
    }

    // In-memory state stays authoritative when the store fails; the next
    // successful write catches it up.
    fn persist(&self, key: CredentialKey, value: &str) {
        if let Err(e) = self.store.set(key, value) {
            tracing::warn!(error = %e, key = key.as_str(), "failed to persist credential");
        }
    }

    fn persist_identity(&self, identity: &Identity) {
        match serde_json::to_string(identity) {
            Ok(raw) => self.persist(CredentialKey::Identity, &raw),
            Err(e) => tracing::warn!(error = %e, "failed to serialize identity"),
        }
    }

    fn schedule_at(&self, expires_at: Option<OffsetDateTime>) {
        let mut timer = self.timer.lock();
        timer.generation += 1;
        if let Some(previous) = timer.handle.take() {
            previous.abort();
        }

        let Some(expires_at) = expires_at else {
            tracing::debug!("token carries no readable expiry, proactive renewal not scheduled");
            return;
        };
        let margin = time::Duration::try_from(self.config.refresh_margin).unwrap_or(time::Duration::MAX);
        let delay = expires_at.saturating_sub(margin) - OffsetDateTime::now_utc();
        if !delay.is_positive() {
            tracing::debug!(%expires_at, "proactive renewal deadline already passed");
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("no async runtime, proactive renewal not scheduled");
            return;
        };

        let generation = timer.generation;
        let delay = delay.unsigned_abs();
        let me = self.me.clone();
        tracing::debug!(delay_secs = delay.as_secs(), "proactive renewal scheduled");

        timer.handle = Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(session) = me.upgrade() else {
                return;
            };
            {
                let mut timer = session.timer.lock();
                if timer.generation != generation {
                    return;
                }
                // Detach so the renewal's own reschedule does not abort this task.
                timer.handle = None;
            }
            tracing::debug!("proactive renewal deadline reached");
            if let Err(e) = session.refresh().await {
                tracing::warn!(error = %e, "proactive renewal failed");
            }
        }));
    }

    fn cancel_timer(&self) {
        let mut timer = self.timer.lock();
        timer.generation += 1;
        if let Some(handle) = timer.handle.take() {
            handle.abort();
        }
    }

    fn spawn_identity_merge(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let me = self.me.clone();
        runtime.spawn(async move {
            let Some(session) = me.upgrade() else {
                return;
            };
            match session.fetch_identity().await {
                Ok(identity) => tracing::debug!(username = %identity.username, "identity merged"),
                Err(e) => tracing::warn!(error = %e, "identity merge failed"),
            }
        });
    }

    fn spawn_revocation(&self, username: String, access_token: String) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let transport = Arc::clone(&self.transport);
        runtime.spawn(async move {
            let request = ApiRequest::post("/auth/logout").with_query("username", username);
            match transport.send(&request, Some(&access_token)).await {
                Ok(response) if response.is_success() => tracing::debug!("server-side session revoked"),
                Ok(response) => tracing::warn!(status = response.status, "server-side revocation refused"),
                Err(e) => tracing::warn!(error = %e, "server-side revocation failed"),
            }
        });
    }
}

impl<T, S> Drop for Session<T, S> {
    fn drop(&mut self) {
        if let Some(handle) = self.timer.get_mut().handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use futures::FutureExt;
    use serde_json::json;

    use super::*;
    use crate::store::MemoryCredentialStore;
    use crate::token::unsigned_jwt;
    use crate::transport::mock::{self, MockTransport};
    use crate::transport::{ApiResponse, Method};

    pub(crate) fn test_config() -> ClientConfig {
        ClientConfig::new("http://dashboard.test/api".parse().unwrap())
            .with_revoke_on_logout(false)
            .with_merge_identity_after_refresh(false)
    }

    pub(crate) fn jwt_in(secs: i64) -> String {
        unsigned_jwt(OffsetDateTime::now_utc().unix_timestamp() + secs)
    }

    pub(crate) fn login_body(token: &str, refresh: &str) -> serde_json::Value {
        json!({
            "token": token,
            "refreshToken": refresh,
            "type": "Bearer",
            "id": 1,
            "username": "jdoe",
            "email": "jdoe@example.com",
            "firstName": "John",
            "lastName": "Doe",
            "role": "USER"
        })
    }

    pub(crate) fn refresh_body(access: &str, refresh: &str) -> serde_json::Value {
        json!({ "accessToken": access, "refreshToken": refresh, "tokenType": "Bearer" })
    }

    type TestSession = Arc<Session<MockTransport, MemoryCredentialStore>>;

    fn session_with(
        config: ClientConfig,
        handler: impl Fn(&ApiRequest, Option<&str>) -> Result<ApiResponse, Error> + Send + Sync + 'static,
    ) -> (TestSession, Arc<MockTransport>, Arc<MemoryCredentialStore>) {
        session_over(config, MockTransport::new(handler))
    }

    fn session_over(
        config: ClientConfig,
        transport: MockTransport,
    ) -> (TestSession, Arc<MockTransport>, Arc<MemoryCredentialStore>) {
        let transport = Arc::new(transport);
        let store = Arc::new(MemoryCredentialStore::new());
        let session = Session::new(config, Arc::clone(&transport), Arc::clone(&store)).unwrap();
        (session, transport, store)
    }

    fn credentials() -> Credentials {
        Credentials::new("jdoe", "secret")
    }

    #[tokio::test]
    async fn test_login_installs_grant_and_identity() {
        let token = jwt_in(3600);
        let reply = token.clone();
        let (session, _, store) = session_with(test_config(), move |req, _| match req.path() {
            "/auth/login" => mock::json(200, login_body(&reply, "r1")),
            _ => mock::status(404),
        });

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let _sub = session.authenticated_state().subscribe(move |authenticated| {
            if *authenticated {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let grant = session.login(&credentials()).await.unwrap();

        assert_eq!(grant.access_token(), token);
        assert!(session.is_authenticated());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        let identity = session.identity().unwrap();
        assert_eq!(identity.display_name, "John Doe");
        assert_eq!(identity.id.as_str(), "1");
        assert!(session.has_role(Role::User));
        assert!(!session.has_any_role(&[Role::Admin, Role::Manager]));
        assert_eq!(store.get(CredentialKey::AccessToken).unwrap(), Some(token));
        assert_eq!(store.get(CredentialKey::RefreshToken).unwrap().as_deref(), Some("r1"));
        assert!(store.get(CredentialKey::Identity).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_invalid_credentials_keep_existing_session() {
        let token = jwt_in(3600);
        let reply = token.clone();
        let (session, transport, _) = session_with(test_config(), move |_, _| {
            mock::json(200, login_body(&reply, "r1"))
        });
        session.login(&credentials()).await.unwrap();

        transport.set_handler(|_, _| mock::status(401));
        let err = session.login(&Credentials::new("jdoe", "wrong")).await.unwrap_err();

        assert_eq!(err, Error::InvalidCredentials);
        assert!(session.is_authenticated());
        assert_eq!(session.access_token(), Some(token));
    }

    #[tokio::test]
    async fn test_login_transport_failure_is_not_masked() {
        let (session, _, _) = session_with(test_config(), |_, _| {
            Err(Error::Transport {
                status: None,
                detail: "connection refused".into(),
            })
        });

        let err = session.login(&credentials()).await.unwrap_err();
        assert!(matches!(err, Error::Transport { .. }));
        assert!(!session.is_authenticated());
        assert!(session.identity().is_none());
    }

    #[tokio::test]
    async fn test_register_does_not_sign_in() {
        let (session, transport, store) = session_with(test_config(), |req, _| match req.path() {
            "/auth/register" => mock::json(
                201,
                json!({
                    "id": 12,
                    "username": "asmith",
                    "email": "asmith@example.com",
                    "firstName": "Ada",
                    "lastName": "Smith",
                    "role": "MANAGER"
                }),
            ),
            _ => mock::status(404),
        });
        let request = RegisterRequest {
            username: "asmith".into(),
            email: "asmith@example.com".into(),
            password: "pw".into(),
            first_name: "Ada".into(),
            last_name: "Smith".into(),
            role: Some(Role::Manager),
            department: None,
            position: None,
        };

        let identity = session.register(&request).await.unwrap();

        assert_eq!(identity.display_name, "Ada Smith");
        assert_eq!(identity.role, Role::Manager);
        assert!(!session.is_authenticated());
        assert_eq!(store.get(CredentialKey::Identity).unwrap(), None);
        let body = transport.calls()[0].body.clone().unwrap();
        assert_eq!(body["firstName"], "Ada");
        assert!(body.get("department").is_none());
    }

    #[tokio::test]
    async fn test_refresh_without_token_never_touches_network() {
        let (session, transport, _) = session_with(test_config(), |_, _| mock::status(200));

        let err = session.refresh().await.unwrap_err();

        assert_eq!(err, Error::NoRefreshToken);
        assert!(transport.calls().is_empty());
        assert!(!session.is_authenticated());
    }

    #[tokio::test]
    async fn test_refresh_success_replaces_grant() {
        let (session, transport, store) = session_with(test_config(), |req, _| match req.path() {
            "/auth/login" => mock::json(200, login_body("T1", "R1")),
            "/auth/refresh" => mock::json(200, refresh_body("T2", "R2")),
            _ => mock::status(404),
        });
        session.login(&credentials()).await.unwrap();

        let grant = session.refresh().await.unwrap();

        assert_eq!(grant.access_token(), "T2");
        assert_eq!(session.access_token().as_deref(), Some("T2"));
        assert_eq!(store.get(CredentialKey::RefreshToken).unwrap().as_deref(), Some("R2"));
        assert!(session.is_authenticated());
        assert!(session.identity().is_some());
        assert!(!session.is_renewing());

        let refresh_calls = transport.calls_to("/auth/refresh");
        assert_eq!(refresh_calls.len(), 1);
        assert_eq!(refresh_calls[0].bearer, None);
        assert_eq!(refresh_calls[0].body.as_ref().unwrap()["refreshToken"], "R1");
    }

    #[tokio::test]
    async fn test_refresh_rejected_ends_session() {
        let (session, _, store) = session_with(test_config(), |req, _| match req.path() {
            "/auth/login" => mock::json(200, login_body("T1", "R1")),
            _ => mock::status(401),
        });
        session.login(&credentials()).await.unwrap();

        let err = session.refresh().await.unwrap_err();

        assert!(matches!(err, Error::RefreshRejected { status: Some(401), .. }));
        assert!(!session.is_authenticated());
        assert!(session.identity().is_none());
        assert!(!session.has_refresh_token());
        assert_eq!(store.get(CredentialKey::AccessToken).unwrap(), None);
    }

    /// Refresh answers take 50ms; everything else answers at once.
    fn slow_refresh(
        handler: impl Fn(&ApiRequest, Option<&str>) -> Result<ApiResponse, Error> + Send + Sync + 'static,
    ) -> MockTransport {
        MockTransport::new(handler).with_latency(|req| {
            if req.path() == "/auth/refresh" {
                Duration::from_millis(50)
            } else {
                Duration::ZERO
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_refresh_calls_share_one_exchange() {
        let transport = slow_refresh(|req, _| match req.path() {
            "/auth/login" => mock::json(200, login_body("T1", "R1")),
            "/auth/refresh" => mock::json(200, refresh_body("T2", "R2")),
            _ => mock::status(404),
        });
        let (session, transport, _) = session_over(test_config(), transport);
        session.login(&credentials()).await.unwrap();

        let (a, b, c) = tokio::join!(session.refresh(), session.refresh(), session.refresh());

        assert_eq!(a.unwrap().access_token(), "T2");
        assert_eq!(b.unwrap().access_token(), "T2");
        assert_eq!(c.unwrap().access_token(), "T2");
        assert_eq!(transport.calls_to("/auth/refresh").len(), 1);
        assert!(!session.is_renewing());
    }

    #[tokio::test]
    async fn test_abandoned_refresh_does_not_block_the_next() {
        let (session, transport, _) = session_with(test_config(), |req, _| match req.path() {
            "/auth/login" => mock::json(200, login_body("T1", "R1")),
            _ => mock::json(200, refresh_body("T2", "R2")),
        });
        session.login(&credentials()).await.unwrap();

        assert!(session.refresh().now_or_never().is_none());
        assert!(!session.is_renewing());

        transport.set_handler(|req, _| match req.path() {
            "/auth/login" => mock::json(200, login_body("T9", "R9")),
            _ => mock::json(200, refresh_body("T10", "R10")),
        });
        session.login(&credentials()).await.unwrap();
        let grant = session.refresh().await.unwrap();

        assert_eq!(grant.access_token(), "T10");
        assert!(session.is_authenticated());
        let renewals = transport.calls_to("/auth/refresh");
        assert_eq!(renewals.len(), 2);
        assert_eq!(renewals[1].body.as_ref().unwrap()["refreshToken"], "R9");
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_during_renewal_starts_fresh_exchange() {
        let transport = slow_refresh(|req, _| match req.path() {
            "/auth/login" => mock::json(200, login_body("T1", "R1")),
            _ => mock::json(200, refresh_body("T2", "R2")),
        });
        let (session, transport, _) = session_over(test_config(), transport);
        session.login(&credentials()).await.unwrap();

        let stale = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.refresh().await }
        });
        while !session.is_renewing() {
            tokio::task::yield_now().await;
        }
        transport.set_handler(|req, _| match req.path() {
            "/auth/login" => mock::json(200, login_body("T9", "R9")),
            _ => mock::json(200, refresh_body("T10", "R10")),
        });
        session.login(&credentials()).await.unwrap();
        let fresh = session.refresh().await.unwrap();

        assert_eq!(stale.await.unwrap().unwrap_err(), Error::SessionEnded);
        assert_eq!(fresh.access_token(), "T10");
        assert_eq!(session.access_token().as_deref(), Some("T10"));
        let renewals = transport.calls_to("/auth/refresh");
        assert_eq!(renewals.len(), 2);
        assert_eq!(renewals[1].body.as_ref().unwrap()["refreshToken"], "R9");
    }

    #[tokio::test]
    async fn test_logout_is_idempotent() {
        let (session, _, store) = session_with(test_config(), |_, _| {
            mock::json(200, login_body("T1", "R1"))
        });
        session.login(&credentials()).await.unwrap();

        let changes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&changes);
        let _sub = session.authenticated_state().subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        session.logout();
        assert!(!session.is_authenticated());
        session.logout();
        assert!(!session.is_authenticated());

        assert_eq!(changes.load(Ordering::SeqCst), 1);
        for key in CredentialKey::ALL {
            assert_eq!(store.get(key).unwrap(), None);
        }
    }

    #[tokio::test]
    async fn test_logout_revokes_in_background() {
        let config = test_config().with_revoke_on_logout(true);
        let (session, transport, _) = session_with(config, |req, _| match req.path() {
            "/auth/login" => mock::json(200, login_body("T1", "R1")),
            _ => mock::status(500),
        });
        session.login(&credentials()).await.unwrap();

        session.logout();
        assert!(!session.is_authenticated());
        session.logout();

        tokio::time::sleep(Duration::from_millis(10)).await;
        let revocations = transport.calls_to("/auth/logout");
        assert_eq!(revocations.len(), 1);
        assert_eq!(revocations[0].method, Method::Post);
        assert_eq!(revocations[0].bearer.as_deref(), Some("T1"));
        assert_eq!(
            revocations[0].query,
            vec![("username".to_string(), "jdoe".to_string())]
        );
    }

    #[tokio::test]
    async fn test_logout_discards_in_flight_renewal() {
        let (session, _, _) = session_with(test_config(), |req, _| match req.path() {
            "/auth/login" => mock::json(200, login_body("T1", "R1")),
            "/auth/refresh" => mock::json(200, refresh_body("T2", "R2")),
            _ => mock::status(404),
        });
        session.login(&credentials()).await.unwrap();

        let renewing = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.refresh().await }
        });
        while !session.is_renewing() {
            tokio::task::yield_now().await;
        }
        session.logout();
        let outcome = renewing.await.unwrap();

        assert_eq!(outcome.unwrap_err(), Error::SessionEnded);
        assert!(!session.is_authenticated());
        assert_eq!(session.access_token(), None);
    }

    #[tokio::test]
    async fn test_hydrate_from_store() {
        let store = Arc::new(MemoryCredentialStore::new());
        store.set(CredentialKey::AccessToken, &jwt_in(3600)).unwrap();
        store.set(CredentialKey::RefreshToken, "R1").unwrap();
        let identity = Identity::from_profile("1".into(), "jdoe", "j@example.com", None, None, Role::Admin);
        store
            .set(CredentialKey::Identity, &serde_json::to_string(&identity).unwrap())
            .unwrap();

        let transport = Arc::new(MockTransport::new(|_, _| mock::status(404)));
        let session = Session::new(test_config(), transport, store).unwrap();

        assert!(session.is_authenticated());
        assert_eq!(session.identity(), Some(identity));
        assert!(session.has_role(Role::Admin));
    }

    #[tokio::test]
    async fn test_hydrate_with_expired_token_is_unauthenticated() {
        let store = Arc::new(MemoryCredentialStore::new());
        store.set(CredentialKey::AccessToken, &jwt_in(-60)).unwrap();

        let transport = Arc::new(MockTransport::new(|_, _| mock::status(404)));
        let session = Session::new(test_config(), transport, store).unwrap();

        assert!(!session.is_authenticated());
    }

    #[tokio::test]
    async fn test_hydrated_identity_held_back_until_resume() {
        let store = Arc::new(MemoryCredentialStore::new());
        store.set(CredentialKey::AccessToken, &jwt_in(-60)).unwrap();
        store.set(CredentialKey::RefreshToken, "R1").unwrap();
        let identity = Identity::from_profile("1".into(), "jdoe", "j@example.com", None, None, Role::User);
        store
            .set(CredentialKey::Identity, &serde_json::to_string(&identity).unwrap())
            .unwrap();
        let transport = Arc::new(MockTransport::new(|_, _| mock::json(200, refresh_body("T2", "R2"))));
        let session = Session::new(test_config(), transport, store).unwrap();

        assert!(!session.is_authenticated());
        assert_eq!(session.identity(), None);
        assert!(!session.has_role(Role::User));

        session.resume().await.unwrap();

        assert!(session.is_authenticated());
        assert_eq!(session.identity(), Some(identity));
    }

    #[tokio::test]
    async fn test_resume_renews_expired_token() {
        let store = Arc::new(MemoryCredentialStore::new());
        store.set(CredentialKey::AccessToken, &jwt_in(-60)).unwrap();
        store.set(CredentialKey::RefreshToken, "R1").unwrap();
        let fresh = jwt_in(3600);
        let reply = fresh.clone();
        let transport = Arc::new(MockTransport::new(move |req, _| match req.path() {
            "/auth/refresh" => mock::json(200, refresh_body(&reply, "R2")),
            _ => mock::status(404),
        }));
        let session = Session::new(test_config(), Arc::clone(&transport), store).unwrap();

        session.resume().await.unwrap();

        assert!(session.is_authenticated());
        assert_eq!(session.access_token(), Some(fresh));
        assert_eq!(transport.calls_to("/auth/refresh").len(), 1);
    }

    #[tokio::test]
    async fn test_resume_without_refresh_token_logs_out() {
        let store = Arc::new(MemoryCredentialStore::new());
        store.set(CredentialKey::AccessToken, &jwt_in(-60)).unwrap();
        let transport = Arc::new(MockTransport::new(|_, _| mock::status(404)));
        let session = Session::new(test_config(), Arc::clone(&transport), Arc::clone(&store)).unwrap();

        let err = session.resume().await.unwrap_err();

        assert_eq!(err, Error::NoRefreshToken);
        assert!(transport.calls().is_empty());
        assert_eq!(store.get(CredentialKey::AccessToken).unwrap(), None);
    }

    #[tokio::test]
    async fn test_identity_merged_after_silent_renewal() {
        let store = Arc::new(MemoryCredentialStore::new());
        store.set(CredentialKey::AccessToken, &jwt_in(-60)).unwrap();
        store.set(CredentialKey::RefreshToken, "R1").unwrap();
        let transport = Arc::new(MockTransport::new(|req, _| match req.path() {
            "/auth/refresh" => mock::json(200, refresh_body("T2", "R2")),
            "/auth/me" => mock::json(
                200,
                json!({"id": 9, "username": "jdoe", "email": "j@example.com", "role": "MANAGER"}),
            ),
            _ => mock::status(404),
        }));
        let config = test_config().with_merge_identity_after_refresh(true);
        let session = Session::new(config, Arc::clone(&transport), store).unwrap();

        session.resume().await.unwrap();
        assert!(session.identity().is_none());

        tokio::time::sleep(Duration::from_millis(10)).await;
        let identity = session.identity().unwrap();
        assert_eq!(identity.id.as_str(), "9");
        assert_eq!(identity.display_name, "jdoe");
        assert_eq!(transport.calls_to("/auth/me")[0].bearer.as_deref(), Some("T2"));
    }

    fn profile_body(first_name: &str) -> serde_json::Value {
        json!({
            "id": 1,
            "username": "jdoe",
            "email": "jdoe@example.com",
            "firstName": first_name,
            "lastName": "Doe",
            "role": "USER"
        })
    }

    #[tokio::test]
    async fn test_update_profile_replaces_identity() {
        let (session, transport, store) = session_with(test_config(), |req, _| match req.path() {
            "/auth/login" => mock::json(200, login_body("T1", "R1")),
            "/auth/profile" => mock::json(200, profile_body("Johnny")),
            _ => mock::status(404),
        });
        session.login(&credentials()).await.unwrap();

        let changes = UpdateProfileRequest {
            first_name: Some("Johnny".into()),
            ..Default::default()
        };
        let identity = session.update_profile(&changes).await.unwrap();

        assert_eq!(identity.display_name, "Johnny Doe");
        assert_eq!(session.identity(), Some(identity.clone()));
        let stored = store.get(CredentialKey::Identity).unwrap().unwrap();
        assert_eq!(serde_json::from_str::<Identity>(&stored).unwrap(), identity);

        let call = &transport.calls_to("/auth/profile")[0];
        assert_eq!(call.method, Method::Put);
        assert_eq!(call.bearer.as_deref(), Some("T1"));
        assert_eq!(call.body, Some(json!({ "firstName": "Johnny" })));
    }

    #[tokio::test]
    async fn test_update_profile_renews_expired_token() {
        let (session, transport, _) = session_with(test_config(), |req, bearer| match req.path() {
            "/auth/login" => mock::json(200, login_body("T1", "R1")),
            "/auth/refresh" => mock::json(200, refresh_body("T2", "R2")),
            "/auth/profile" if bearer == Some("T2") => mock::json(200, profile_body("Jo")),
            _ => mock::status(401),
        });
        session.login(&credentials()).await.unwrap();

        let identity = session.update_profile(&UpdateProfileRequest::default()).await.unwrap();

        assert_eq!(identity.display_name, "Jo Doe");
        assert_eq!(transport.calls_to("/auth/refresh").len(), 1);
        assert_eq!(transport.calls_to("/auth/profile").len(), 2);
    }

    #[tokio::test]
    async fn test_rejected_profile_update_keeps_identity() {
        let (session, transport, _) = session_with(test_config(), |_, _| {
            mock::json(200, login_body("T1", "R1"))
        });
        session.login(&credentials()).await.unwrap();
        let before = session.identity();

        transport.set_handler(|_, _| mock::json(400, json!({ "message": "invalid avatar" })));
        let err = session.update_profile(&UpdateProfileRequest::default()).await.unwrap_err();

        assert!(matches!(err, Error::RemoteRejected { status: 400, .. }));
        assert_eq!(session.identity(), before);
    }

    #[tokio::test]
    async fn test_change_password_keeps_session() {
        let (session, transport, _) = session_with(test_config(), |req, _| match req.path() {
            "/auth/login" => mock::json(200, login_body("T1", "R1")),
            "/auth/change-password" => mock::status(200),
            _ => mock::status(404),
        });
        session.login(&credentials()).await.unwrap();

        session
            .change_password(&ChangePasswordRequest::new("secret", "better-secret"))
            .await
            .unwrap();

        assert!(session.is_authenticated());
        let call = &transport.calls_to("/auth/change-password")[0];
        assert_eq!(call.method, Method::Post);
        assert_eq!(call.bearer.as_deref(), Some("T1"));
        assert_eq!(call.body.as_ref().unwrap()["newPassword"], "better-secret");
        assert_eq!(call.body.as_ref().unwrap()["confirmPassword"], "better-secret");
    }

    #[tokio::test(start_paused = true)]
    async fn test_proactive_refresh_fires_before_expiry() {
        let expiring = jwt_in(120);
        let renewed = jwt_in(3600);
        let (login_reply, refresh_reply) = (expiring.clone(), renewed.clone());
        let config = test_config().with_refresh_margin(Duration::from_secs(60));
        let (session, transport, _) = session_with(config, move |req, _| match req.path() {
            "/auth/login" => mock::json(200, login_body(&login_reply, "R1")),
            "/auth/refresh" => mock::json(200, refresh_body(&refresh_reply, "R2")),
            _ => mock::status(404),
        });

        let dropped = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&dropped);
        let _sub = session.authenticated_state().subscribe(move |authenticated| {
            if !*authenticated {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        session.login(&credentials()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(90)).await;

        assert_eq!(transport.calls_to("/auth/refresh").len(), 1);
        assert_eq!(session.access_token(), Some(renewed));
        assert!(session.is_authenticated());
        assert_eq!(dropped.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_proactive_refresh_skipped_when_deadline_passed() {
        let expiring = jwt_in(120);
        let (session, transport, _) = session_with(test_config(), move |req, _| match req.path() {
            "/auth/login" => mock::json(200, login_body(&expiring, "R1")),
            _ => mock::json(200, refresh_body("T2", "R2")),
        });

        session.login(&credentials()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(600)).await;

        assert!(transport.calls_to("/auth/refresh").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_grant_replaces_pending_timer() {
        let short = jwt_in(120);
        let long = jwt_in(7200);
        let config = test_config().with_refresh_margin(Duration::from_secs(60));
        let (session, transport, _) = session_with(config, move |req, _| match req.path() {
            "/auth/login" => mock::json(200, login_body(&short, "R1")),
            _ => mock::json(200, refresh_body("T2", "R2")),
        });
        session.login(&credentials()).await.unwrap();

        let long_reply = long.clone();
        transport.set_handler(move |req, _| match req.path() {
            "/auth/login" => mock::json(200, login_body(&long_reply, "R9")),
            _ => mock::json(200, refresh_body("T2", "R2")),
        });
        session.login(&credentials()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(600)).await;

        assert!(transport.calls_to("/auth/refresh").is_empty());
        assert_eq!(session.access_token(), Some(long));
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_cancels_pending_timer() {
        let expiring = jwt_in(120);
        let config = test_config().with_refresh_margin(Duration::from_secs(60));
        let (session, transport, _) = session_with(config, move |req, _| match req.path() {
            "/auth/login" => mock::json(200, login_body(&expiring, "R1")),
            _ => mock::json(200, refresh_body("T2", "R2")),
        });
        session.login(&credentials()).await.unwrap();

        session.logout();
        tokio::time::sleep(Duration::from_secs(600)).await;

        assert!(transport.calls_to("/auth/refresh").is_empty());
        assert!(!session.is_authenticated());
    }
}
