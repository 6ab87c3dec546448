use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::error::Error;
use crate::session::Session;
use crate::store::CredentialStore;
use crate::transport::{ApiRequest, ApiResponse, Transport};

/// Authorization-aware call path shared by every resource client.
///
/// Attaches the session's current access token, and on a 401 renews the session
/// (single-flight, see [`Session::refresh`]) and replays the call exactly once.
/// Every other outcome is passed through untouched.
pub struct RequestPipeline<T, S> {
    session: Arc<Session<T, S>>,
    transport: Arc<T>,
}

impl<T, S> Clone for RequestPipeline<T, S> {
    fn clone(&self) -> Self {
        Self {
            session: Arc::clone(&self.session),
            transport: Arc::clone(&self.transport),
        }
    }
}

impl<T: Transport, S: CredentialStore> RequestPipeline<T, S> {
    #[must_use]
    pub fn new(session: Arc<Session<T, S>>, transport: Arc<T>) -> Self {
        Self { session, transport }
    }

    #[must_use]
    pub fn session(&self) -> &Arc<Session<T, S>> {
        &self.session
    }

    /// Send `request`, renewing and replaying once on 401.
    ///
    /// Login and refresh calls are never intercepted. A replay that is rejected
    /// again is terminal.
    ///
    /// # Errors
    ///
    /// - the renewal error when renewal fails (the session has ended); a renewal
    ///   superseded by a login is not an error, the call is replayed with the
    ///   new session's token instead
    /// - [`Error::AuthorizationExpired`] when the replay is rejected too
    /// - [`Error::Transport`] on network failure
    pub async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, Error> {
        let sent_with = self.session.access_token();
        let response = self.transport.send(request, sent_with.as_deref()).await?;
        if !response.is_unauthorized() || request.is_auth_exchange() {
            return Ok(response);
        }

        let current = self.session.access_token();
        let replay_token = match current {
            // Renewed by someone else while this call was in flight.
            Some(token) if sent_with.as_deref() != Some(token.as_str()) => {
                tracing::debug!(request = %request.describe(), "replaying with token renewed meanwhile");
                token
            }
            _ => {
                tracing::debug!(request = %request.describe(), "unauthorized, renewing session");
                match self.session.refresh().await {
                    Ok(grant) => grant.access_token().to_owned(),
                    // A login replaced the session while the renewal was in flight.
                    Err(Error::SessionEnded) if self.has_newer_token(sent_with.as_deref()) => {
                        tracing::debug!(request = %request.describe(), "session replaced during renewal, replaying");
                        self.session.access_token().ok_or(Error::SessionEnded)?
                    }
                    Err(e) => {
                        tracing::warn!(request = %request.describe(), error = %e, "renewal failed, request abandoned");
                        return Err(e);
                    }
                }
            }
        };

        let response = self.transport.send(request, Some(&replay_token)).await?;
        if response.is_unauthorized() {
            tracing::warn!(request = %request.describe(), "replay rejected after renewal");
            return Err(Error::AuthorizationExpired {
                operation: request.describe(),
            });
        }
        Ok(response)
    }

    fn has_newer_token(&self, sent_with: Option<&str>) -> bool {
        self.session
            .access_token()
            .is_some_and(|current| sent_with != Some(current.as_str()))
    }

    /// [`execute`](Self::execute), then require 2xx and decode the JSON body.
    ///
    /// # Errors
    ///
    /// As `execute`, plus the status mapping of [`ApiResponse::ensure_success`]
    /// and [`Error::Decode`].
    pub async fn fetch<R: DeserializeOwned>(&self, request: &ApiRequest) -> Result<R, Error> {
        let response = self.execute(request).await?;
        response.ensure_success(&request.describe())?.json()
    }

    /// [`execute`](Self::execute) for calls whose body is irrelevant.
    ///
    /// # Errors
    ///
    /// As [`fetch`](Self::fetch), without decoding.
    pub async fn send(&self, request: &ApiRequest) -> Result<(), Error> {
        let response = self.execute(request).await?;
        response.ensure_success(&request.describe())?;
        Ok(())
    }
}
