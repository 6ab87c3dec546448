use base64::Engine;
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use serde_json::Value as JsonValue;
use time::OffsetDateTime;

use crate::error::Error;

/// Credentials issued by a successful login or refresh.
///
/// Immutable; the next grant replaces it wholesale.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessGrant {
    access_token: String,
    refresh_token: String,
    expires_at: Option<OffsetDateTime>,
}

impl AccessGrant {
    /// Build a grant, deriving `expires_at` from the access token's `exp` claim.
    #[must_use]
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        let access_token = access_token.into();
        let expires_at = token_expiry(&access_token);
        Self {
            access_token,
            refresh_token: refresh_token.into(),
            expires_at,
        }
    }

    #[must_use]
    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    #[must_use]
    pub fn refresh_token(&self) -> &str {
        &self.refresh_token
    }

    /// Expiry from the token claims, `None` when the token carries no readable `exp`.
    #[must_use]
    pub fn expires_at(&self) -> Option<OffsetDateTime> {
        self.expires_at
    }
}

// Tokens stay out of logs.
impl std::fmt::Debug for AccessGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessGrant")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Decodes the claims segment of a JWT without verifying its signature.
///
/// The client only reads claims for scheduling; the server remains the authority
/// on validity.
///
/// # Errors
///
/// Returns [`Error::Decode`] if the token is not three dot-separated segments or the
/// payload is not base64url-encoded JSON.
pub fn decode_claims(token: &str) -> Result<JsonValue, Error> {
    let mut parts = token.split('.');
    let (Some(_header), Some(payload), Some(_signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(Error::Decode("invalid token format".into()));
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .or_else(|_| URL_SAFE.decode(payload))
        .map_err(|_| Error::Decode("invalid token payload".into()))?;

    serde_json::from_slice(&bytes).map_err(|_| Error::Decode("invalid token claims".into()))
}

/// Reads the `exp` claim (seconds since the epoch) of a JWT.
#[must_use]
pub fn token_expiry(token: &str) -> Option<OffsetDateTime> {
    let claims = decode_claims(token).ok()?;
    let exp = claims.get("exp")?;
    let secs = exp
        .as_i64()
        .or_else(|| exp.as_f64().map(|f| f as i64))?;
    OffsetDateTime::from_unix_timestamp(secs).ok()
}

/// Whether `token` is expired at `now`. Malformed tokens count as expired.
#[must_use]
pub fn is_token_expired_at(token: &str, now: OffsetDateTime) -> bool {
    token_expiry(token).is_none_or(|exp| exp <= now)
}

/// Whether `token` is expired right now. Malformed tokens count as expired.
#[must_use]
pub fn is_token_expired(token: &str) -> bool {
    is_token_expired_at(token, OffsetDateTime::now_utc())
}

#[cfg(test)]
pub(crate) fn unsigned_jwt(exp: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"alice","exp":{exp}}}"#));
    format!("{header}.{payload}.c2lnbmF0dXJl")
}

#[cfg(test)]
mod tests {
    use time::Duration;

    use super::*;

    #[test]
    fn test_expiry_read_from_claims() {
        let token = unsigned_jwt(1_700_000_000);
        let exp = token_expiry(&token).unwrap();
        assert_eq!(exp.unix_timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_future_token_not_expired() {
        let now = OffsetDateTime::now_utc();
        let token = unsigned_jwt((now + Duration::hours(1)).unix_timestamp());
        assert!(!is_token_expired_at(&token, now));
    }

    #[test]
    fn test_past_token_expired() {
        let now = OffsetDateTime::now_utc();
        let token = unsigned_jwt((now - Duration::seconds(1)).unix_timestamp());
        assert!(is_token_expired_at(&token, now));
    }

    #[test]
    fn test_malformed_tokens_fail_closed() {
        assert!(is_token_expired("not-a-jwt"));
        assert!(is_token_expired("a.b.c"));
        assert!(is_token_expired(""));
        assert!(is_token_expired("a.b.c.d"));
    }

    #[test]
    fn test_token_without_exp_is_expired() {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
        let payload = URL_SAFE_NO_PAD.encode(br#"{"sub":"alice"}"#);
        let token = format!("{header}.{payload}.");
        assert!(decode_claims(&token).is_ok());
        assert!(is_token_expired(&token));
    }

    #[test]
    fn test_padded_payload_accepted() {
        let header = URL_SAFE.encode(br#"{"alg":"none"}"#);
        let payload = URL_SAFE.encode(br#"{"exp":4102444800}"#);
        let token = format!("{header}.{payload}.sig");
        assert_eq!(token_expiry(&token).unwrap().unix_timestamp(), 4_102_444_800);
    }

    #[test]
    fn test_grant_debug_redacts_tokens() {
        let grant = AccessGrant::new("secret-access", "secret-refresh");
        let rendered = format!("{grant:?}");
        assert!(!rendered.contains("secret"));
        assert_eq!(grant.expires_at(), None);
    }
}
