/// Errors surfaced by the session, pipeline and collection caches.
///
/// `Clone` so a single renewal outcome can be handed to every call waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Login rejected by the server. The current session is left untouched.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// Renewal requested without a stored refresh token. The session has been ended.
    #[error("no refresh token available")]
    NoRefreshToken,

    /// The server refused the refresh token. The session has been ended.
    #[error("refresh rejected{}: {detail}", status_suffix(.status))]
    RefreshRejected { status: Option<u16>, detail: String },

    /// A call was rejected again after being replayed with a freshly renewed token.
    #[error("authorization expired during {operation}")]
    AuthorizationExpired { operation: String },

    /// Network failure or a 5xx response.
    #[error("transport failure{}: {detail}", status_suffix(.status))]
    Transport { status: Option<u16>, detail: String },

    /// A 4xx response other than 401, e.g. a validation error.
    #[error("{operation} rejected ({status}): {detail}")]
    RemoteRejected {
        operation: String,
        status: u16,
        detail: String,
    },

    /// The response body could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// Credential store read or write failed.
    #[error("credential store error: {0}")]
    Storage(String),

    /// Missing or invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The session was ended or replaced while the operation was in flight.
    #[error("session ended while the operation was in flight")]
    SessionEnded,
}

impl Error {
    /// `true` for failures that leave the client without a usable session.
    #[must_use]
    pub fn requires_sign_in(&self) -> bool {
        matches!(
            self,
            Self::NoRefreshToken
                | Self::RefreshRejected { .. }
                | Self::AuthorizationExpired { .. }
                | Self::SessionEnded
        )
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" ({s})")).unwrap_or_default()
}

#[cfg(feature = "http")]
impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport {
            status: e.status().map(|s| s.as_u16()),
            detail: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}
