use std::future::Future;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::Error;

/// Paths of the credential exchange itself. Calls to these are never renewed
/// and replayed, which would recurse.
const AUTH_EXCHANGE_PATHS: [&str; 2] = ["/auth/login", "/auth/refresh"];

/// HTTP method of an [`ApiRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

/// Outbound call descriptor.
///
/// Holds everything needed to send the call again after a renewal. The
/// `Authorization` header is not part of it: the pipeline attaches the current
/// bearer token on every attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    headers: Vec<(String, String)>,
    body: Option<serde_json::Value>,
}

impl ApiRequest {
    #[must_use]
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
        }
    }

    #[must_use]
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    #[must_use]
    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::Post, path)
    }

    #[must_use]
    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::Put, path)
    }

    #[must_use]
    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::Patch, path)
    }

    #[must_use]
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    /// Append a query parameter.
    #[must_use]
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Append a header. `Authorization` is ignored; the pipeline owns it.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        if name.eq_ignore_ascii_case("authorization") {
            tracing::debug!(path = %self.path, "dropping caller-supplied authorization header");
            return self;
        }
        self.headers.push((name, value.into()));
        self
    }

    /// Attach a JSON body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] if `body` cannot be represented as JSON.
    pub fn with_json<B: Serialize + ?Sized>(mut self, body: &B) -> Result<Self, Error> {
        self.body = Some(serde_json::to_value(body)?);
        Ok(self)
    }

    #[must_use]
    pub fn method(&self) -> Method {
        self.method
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn query(&self) -> &[(String, String)] {
        &self.query
    }

    #[must_use]
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    #[must_use]
    pub fn body(&self) -> Option<&serde_json::Value> {
        self.body.as_ref()
    }

    /// Whether this call is part of the credential exchange (login or refresh).
    #[must_use]
    pub fn is_auth_exchange(&self) -> bool {
        AUTH_EXCHANGE_PATHS.contains(&self.path.as_str())
    }

    /// Short label for logs and errors, e.g. `GET /projects`.
    #[must_use]
    pub fn describe(&self) -> String {
        format!("{} {}", self.method.as_str(), self.path)
    }
}

/// Raw response: status code and body text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

impl ApiResponse {
    #[must_use]
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        self.status == 401
    }

    /// Returns the response on 2xx, otherwise the matching error.
    ///
    /// 401 maps to [`Error::AuthorizationExpired`], 5xx to [`Error::Transport`],
    /// every other status to [`Error::RemoteRejected`].
    ///
    /// # Errors
    ///
    /// See above.
    pub fn ensure_success(self, operation: &str) -> Result<Self, Error> {
        match self.status {
            200..=299 => Ok(self),
            401 => Err(Error::AuthorizationExpired {
                operation: operation.to_owned(),
            }),
            500..=599 => Err(Error::Transport {
                status: Some(self.status),
                detail: self.body,
            }),
            status => Err(Error::RemoteRejected {
                operation: operation.to_owned(),
                status,
                detail: self.body,
            }),
        }
    }

    /// Decode the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] if the body is not valid JSON for `R`.
    pub fn json<R: DeserializeOwned>(&self) -> Result<R, Error> {
        serde_json::from_str(&self.body).map_err(|e| Error::Decode(e.to_string()))
    }
}

/// Sends one HTTP call.
///
/// Implementations perform exactly one attempt and return any HTTP status as
/// `Ok`; only network-level failures are `Err`. Renewal and replay are the
/// pipeline's job.
pub trait Transport: Send + Sync + 'static {
    fn send(
        &self,
        request: &ApiRequest,
        bearer: Option<&str>,
    ) -> impl Future<Output = Result<ApiResponse, Error>> + Send;
}

impl<T: Transport> Transport for std::sync::Arc<T> {
    fn send(
        &self,
        request: &ApiRequest,
        bearer: Option<&str>,
    ) -> impl Future<Output = Result<ApiResponse, Error>> + Send {
        (**self).send(request, bearer)
    }
}

#[cfg(feature = "http")]
pub use http::HttpTransport;

#[cfg(feature = "http")]
mod http {
    use super::{ApiRequest, ApiResponse, Method, Transport};
    use crate::config::ClientConfig;
    use crate::error::Error;

    /// reqwest-backed transport.
    pub struct HttpTransport {
        config: ClientConfig,
        http: reqwest::Client,
    }

    impl HttpTransport {
        /// Build a transport with the configured timeout.
        ///
        /// # Errors
        ///
        /// Returns [`Error::Config`] if the HTTP client cannot be built.
        pub fn new(config: ClientConfig) -> Result<Self, Error> {
            let http = reqwest::Client::builder()
                .timeout(config.request_timeout())
                .build()
                .map_err(|e| Error::Config(format!("http client: {e}")))?;
            Ok(Self { config, http })
        }

        /// Use a custom HTTP client (for connection pool reuse or testing).
        #[must_use]
        pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
            self.http = client;
            self
        }
    }

    impl Transport for HttpTransport {
        async fn send(
            &self,
            request: &ApiRequest,
            bearer: Option<&str>,
        ) -> Result<ApiResponse, Error> {
            let url = self.config.endpoint(request.path())?;
            let method = match request.method() {
                Method::Get => reqwest::Method::GET,
                Method::Post => reqwest::Method::POST,
                Method::Put => reqwest::Method::PUT,
                Method::Patch => reqwest::Method::PATCH,
                Method::Delete => reqwest::Method::DELETE,
            };

            let mut builder = self.http.request(method, url).query(request.query());
            for (name, value) in request.headers() {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if let Some(token) = bearer {
                builder = builder.bearer_auth(token);
            }
            if let Some(body) = request.body() {
                builder = builder.json(body);
            }

            let response = builder.send().await?;
            let status = response.status().as_u16();
            let body = response.text().await?;
            Ok(ApiResponse { status, body })
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authorization_header_is_not_captured() {
        let request = ApiRequest::get("/projects")
            .with_header("Authorization", "Bearer stale")
            .with_header("X-Trace", "abc");

        assert_eq!(request.headers(), &[("X-Trace".to_string(), "abc".to_string())]);
    }

    #[test]
    fn test_auth_exchange_detection() {
        assert!(ApiRequest::post("/auth/login").is_auth_exchange());
        assert!(ApiRequest::post("/auth/refresh").is_auth_exchange());
        assert!(!ApiRequest::get("/auth/me").is_auth_exchange());
        assert!(!ApiRequest::get("/projects").is_auth_exchange());
    }

    #[test]
    fn test_ensure_success_maps_statuses() {
        assert!(ApiResponse::new(204, "").ensure_success("delete").is_ok());
        assert!(matches!(
            ApiResponse::new(401, "").ensure_success("list"),
            Err(Error::AuthorizationExpired { .. })
        ));
        assert!(matches!(
            ApiResponse::new(403, "forbidden").ensure_success("list"),
            Err(Error::RemoteRejected { status: 403, .. })
        ));
        assert!(matches!(
            ApiResponse::new(422, "title required").ensure_success("create"),
            Err(Error::RemoteRejected { status: 422, .. })
        ));
        assert!(matches!(
            ApiResponse::new(503, "down").ensure_success("list"),
            Err(Error::Transport {
                status: Some(503),
                ..
            })
        ));
    }

    #[test]
    fn test_with_json_captures_body() {
        let request = ApiRequest::post("/projects")
            .with_json(&serde_json::json!({"title": "Apollo"}))
            .unwrap();
        assert_eq!(request.body().unwrap()["title"], "Apollo");
    }
}
