use std::time::Duration;

use url::Url;

use crate::error::Error;

const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_PAGE_SIZE: u32 = 10;

/// Dashboard API client configuration.
///
/// The API base URL is the only required field and is a constructor parameter.
///
/// ```rust,ignore
/// use pm_dashboard_client::ClientConfig;
///
/// let config = ClientConfig::new("https://dashboard.example.com/api".parse()?)
///     .with_refresh_margin(std::time::Duration::from_secs(120))
///     .with_revoke_on_logout(false);
/// ```
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ClientConfig {
    pub(crate) api_base: Url,
    pub(crate) refresh_margin: Duration,
    pub(crate) proactive_refresh: bool,
    pub(crate) request_timeout: Duration,
    pub(crate) revoke_on_logout: bool,
    pub(crate) default_page_size: u32,
    pub(crate) merge_identity_after_refresh: bool,
}

impl ClientConfig {
    /// Create a configuration for the API rooted at `api_base`.
    #[must_use]
    pub fn new(api_base: Url) -> Self {
        Self {
            api_base,
            refresh_margin: DEFAULT_REFRESH_MARGIN,
            proactive_refresh: true,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            revoke_on_logout: true,
            default_page_size: DEFAULT_PAGE_SIZE,
            merge_identity_after_refresh: true,
        }
    }

    /// Create a configuration from environment variables.
    ///
    /// # Required env vars
    /// - `DASHBOARD_API_URL`: API base URL (e.g. `https://host/api`)
    ///
    /// # Optional env vars
    /// - `DASHBOARD_REFRESH_MARGIN_SECS`: proactive renewal lead time
    /// - `DASHBOARD_REQUEST_TIMEOUT_SECS`: HTTP timeout
    /// - `DASHBOARD_PROACTIVE_REFRESH`: `"1"`/`"true"` or `"0"`/`"false"`
    /// - `DASHBOARD_REVOKE_ON_LOGOUT`: `"1"`/`"true"` or `"0"`/`"false"`
    /// - `DASHBOARD_PAGE_SIZE`: default list page size
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the base URL is missing or any value fails to parse.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let api_base = lookup("DASHBOARD_API_URL")
            .ok_or_else(|| Error::Config("DASHBOARD_API_URL is required".into()))?;
        let api_base: Url = api_base
            .parse()
            .map_err(|e| Error::Config(format!("DASHBOARD_API_URL: {e}")))?;

        let mut config = Self::new(api_base);

        if let Some(secs) = lookup("DASHBOARD_REFRESH_MARGIN_SECS") {
            config = config.with_refresh_margin(parse_secs("DASHBOARD_REFRESH_MARGIN_SECS", &secs)?);
        }
        if let Some(secs) = lookup("DASHBOARD_REQUEST_TIMEOUT_SECS") {
            config =
                config.with_request_timeout(parse_secs("DASHBOARD_REQUEST_TIMEOUT_SECS", &secs)?);
        }
        if let Some(flag) = lookup("DASHBOARD_PROACTIVE_REFRESH") {
            config = config.with_proactive_refresh(parse_flag("DASHBOARD_PROACTIVE_REFRESH", &flag)?);
        }
        if let Some(flag) = lookup("DASHBOARD_REVOKE_ON_LOGOUT") {
            config = config.with_revoke_on_logout(parse_flag("DASHBOARD_REVOKE_ON_LOGOUT", &flag)?);
        }
        if let Some(size) = lookup("DASHBOARD_PAGE_SIZE") {
            let size: u32 = size
                .trim()
                .parse()
                .map_err(|e| Error::Config(format!("DASHBOARD_PAGE_SIZE: {e}")))?;
            if size == 0 {
                return Err(Error::Config("DASHBOARD_PAGE_SIZE must be positive".into()));
            }
            config = config.with_default_page_size(size);
        }

        Ok(config)
    }

    /// Override how long before expiry the proactive renewal fires (default: 5 minutes).
    #[must_use]
    pub fn with_refresh_margin(mut self, margin: Duration) -> Self {
        self.refresh_margin = margin;
        self
    }

    /// Enable or disable the proactive renewal timer (default: enabled).
    #[must_use]
    pub fn with_proactive_refresh(mut self, enabled: bool) -> Self {
        self.proactive_refresh = enabled;
        self
    }

    /// Override the HTTP request timeout (default: 30 seconds).
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Send a best-effort revocation request on logout (default: enabled).
    #[must_use]
    pub fn with_revoke_on_logout(mut self, enabled: bool) -> Self {
        self.revoke_on_logout = enabled;
        self
    }

    /// Override the page size used by list helpers that take none (default: 10).
    #[must_use]
    pub fn with_default_page_size(mut self, size: u32) -> Self {
        self.default_page_size = size;
        self
    }

    /// Fetch `/auth/me` after a renewal when no identity is cached (default: enabled).
    #[must_use]
    pub fn with_merge_identity_after_refresh(mut self, enabled: bool) -> Self {
        self.merge_identity_after_refresh = enabled;
        self
    }

    /// API base URL.
    #[must_use]
    pub fn api_base(&self) -> &Url {
        &self.api_base
    }

    #[must_use]
    pub fn refresh_margin(&self) -> Duration {
        self.refresh_margin
    }

    #[must_use]
    pub fn proactive_refresh(&self) -> bool {
        self.proactive_refresh
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    #[must_use]
    pub fn revoke_on_logout(&self) -> bool {
        self.revoke_on_logout
    }

    #[must_use]
    pub fn default_page_size(&self) -> u32 {
        self.default_page_size
    }

    /// Resolve an absolute API path (`/projects/42`) against the base URL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the joined URL is invalid.
    pub fn endpoint(&self, path: &str) -> Result<Url, Error> {
        let base = self.api_base.as_str().trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{base}/{path}")
            .parse()
            .map_err(|e| Error::Config(format!("invalid endpoint {path}: {e}")))
    }
}

fn parse_secs(key: &str, value: &str) -> Result<Duration, Error> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|e| Error::Config(format!("{key}: {e}")))
}

fn parse_flag(key: &str, value: &str) -> Result<bool, Error> {
    match value.trim() {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        other => Err(Error::Config(format!("{key}: expected a boolean, got '{other}'"))),
    }
}
