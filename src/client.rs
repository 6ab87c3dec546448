use std::sync::Arc;

use crate::cache::CollectionCache;
use crate::config::ClientConfig;
use crate::error::Error;
use crate::observable::Subscription;
use crate::pipeline::RequestPipeline;
use crate::project::ProjectCache;
use crate::session::Session;
use crate::store::CredentialStore;
use crate::task::TaskCache;
use crate::transport::Transport;
use crate::types::{Credentials, Identity};

/// One running dashboard client: the session, its request pipeline and the
/// project and task mirrors.
///
/// Pass it (or the pieces it hands out) to whatever needs dashboard data.
/// Mirrors are cleared whenever the session ends, including when a failed
/// renewal ends it.
///
/// ```rust,ignore
/// use pm_dashboard_client::{ClientConfig, Credentials, DashboardClient, FileCredentialStore};
///
/// let config = ClientConfig::from_env()?;
/// let store = FileCredentialStore::open("credentials.json")?;
/// let client = DashboardClient::connect(config, store)?;
/// client.resume().await?;
///
/// if !client.session().is_authenticated() {
///     client.login(&Credentials::new("jdoe", "secret")).await?;
/// }
/// let page = client.projects().list_page(&Default::default(), 0).await?;
/// ```
pub struct DashboardClient<T, S> {
    session: Arc<Session<T, S>>,
    pipeline: RequestPipeline<T, S>,
    projects: Arc<ProjectCache<T, S>>,
    tasks: Arc<TaskCache<T, S>>,
    _signed_out: Subscription<bool>,
}

impl<T: Transport, S: CredentialStore> DashboardClient<T, S> {
    /// Assemble a client over `transport`, hydrating the session from `store`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the store cannot be read.
    pub fn new(config: ClientConfig, transport: T, store: S) -> Result<Self, Error> {
        let transport = Arc::new(transport);
        let session = Session::new(config, Arc::clone(&transport), Arc::new(store))?;
        let pipeline = RequestPipeline::new(Arc::clone(&session), transport);
        let projects = Arc::new(CollectionCache::new(pipeline.clone()));
        let tasks = Arc::new(CollectionCache::new(pipeline.clone()));

        let (weak_projects, weak_tasks) = (Arc::downgrade(&projects), Arc::downgrade(&tasks));
        let signed_out = session.authenticated_state().subscribe(move |authenticated| {
            if *authenticated {
                return;
            }
            if let Some(projects) = weak_projects.upgrade() {
                projects.clear();
            }
            if let Some(tasks) = weak_tasks.upgrade() {
                tasks.clear();
            }
        });

        Ok(Self {
            session,
            pipeline,
            projects,
            tasks,
            _signed_out: signed_out,
        })
    }

    /// See [`Session::resume`].
    ///
    /// # Errors
    ///
    /// As `Session::resume`.
    pub async fn resume(&self) -> Result<(), Error> {
        self.session.resume().await
    }

    /// Sign in and return the signed-in identity.
    ///
    /// # Errors
    ///
    /// As [`Session::login`].
    pub async fn login(&self, credentials: &Credentials) -> Result<Identity, Error> {
        self.session.login(credentials).await?;
        self.session.identity().ok_or(Error::SessionEnded)
    }

    pub fn logout(&self) {
        self.session.logout();
    }

    #[must_use]
    pub fn session(&self) -> &Arc<Session<T, S>> {
        &self.session
    }

    #[must_use]
    pub fn pipeline(&self) -> &RequestPipeline<T, S> {
        &self.pipeline
    }

    #[must_use]
    pub fn projects(&self) -> &ProjectCache<T, S> {
        &self.projects
    }

    #[must_use]
    pub fn tasks(&self) -> &TaskCache<T, S> {
        &self.tasks
    }
}

#[cfg(feature = "http")]
impl<S: CredentialStore> DashboardClient<crate::transport::HttpTransport, S> {
    /// Client over the reqwest transport.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the HTTP client cannot be built, or
    /// [`Error::Storage`] if the store cannot be read.
    pub fn connect(config: ClientConfig, store: S) -> Result<Self, Error> {
        let transport = crate::transport::HttpTransport::new(config.clone())?;
        Self::new(config, transport, store)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::project::ProjectFilters;
    use crate::session::tests::{login_body, refresh_body, test_config};
    use crate::store::MemoryCredentialStore;
    use crate::task::TaskFilters;
    use crate::transport::ApiResponse;
    use crate::transport::mock::{self, MockTransport};

    fn project_page() -> serde_json::Value {
        json!({
            "content": [{
                "id": 4,
                "title": "Website relaunch",
                "status": "PLANNING",
                "priority": "LOW"
            }],
            "totalElements": 1
        })
    }

    fn task_page() -> serde_json::Value {
        json!({
            "content": [{ "id": 3, "title": "Draft copy", "status": "TODO", "priority": "LOW" }],
            "totalElements": 1
        })
    }

    /// Accepts only `valid` on resource endpoints.
    fn server(
        valid: &'static str,
        refresh: fn() -> Result<ApiResponse, Error>,
    ) -> impl Fn(&crate::transport::ApiRequest, Option<&str>) -> Result<ApiResponse, Error> + Send + Sync + 'static {
        move |req, bearer| match req.path() {
            "/auth/login" => mock::json(200, login_body("T1", "R1")),
            "/auth/refresh" => refresh(),
            _ if bearer != Some(valid) => mock::status(401),
            "/projects" => mock::json(200, project_page()),
            "/tasks" => mock::json(200, task_page()),
            _ => mock::status(404),
        }
    }

    async fn signed_in(
        valid: &'static str,
        refresh: fn() -> Result<ApiResponse, Error>,
    ) -> (DashboardClient<Arc<MockTransport>, MemoryCredentialStore>, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::new(server(valid, refresh)));
        let client =
            DashboardClient::new(test_config(), Arc::clone(&transport), MemoryCredentialStore::new()).unwrap();
        let identity = client.login(&Credentials::new("jdoe", "secret")).await.unwrap();
        assert_eq!(identity.username, "jdoe");
        (client, transport)
    }

    #[tokio::test]
    async fn test_list_replayed_after_renewal() {
        let (client, transport) = signed_in("T2", || mock::json(200, refresh_body("T2", "R2"))).await;

        let listing = client.projects().list_page(&ProjectFilters::default(), 0).await.unwrap();

        assert_eq!(listing.items.len(), 1);
        assert_eq!(client.projects().items(), listing.items);
        let calls = transport.calls_to("/projects");
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].bearer.as_deref(), Some("T1"));
        assert_eq!(calls[1].bearer.as_deref(), Some("T2"));
        assert_eq!(calls[0].query, calls[1].query);
        assert!(client.session().is_authenticated());
    }

    #[tokio::test]
    async fn test_rejected_renewal_fails_list_and_ends_session() {
        let (client, transport) = signed_in("T2", || mock::status(401)).await;

        let err = client
            .projects()
            .list_page(&ProjectFilters::default(), 0)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::RefreshRejected { status: Some(401), .. }));
        assert!(!client.session().is_authenticated());
        assert!(client.session().identity().is_none());
        assert_eq!(transport.calls_to("/auth/refresh").len(), 1);
        assert_eq!(transport.calls_to("/projects").len(), 1);
    }

    #[tokio::test]
    async fn test_session_end_clears_mirrors() {
        let (client, transport) = signed_in("T1", || mock::status(401)).await;
        client.projects().list_page(&ProjectFilters::default(), 0).await.unwrap();
        client.tasks().list(&TaskFilters::default(), 0, 10).await.unwrap();
        assert_eq!(client.tasks().total(), 1);

        client.logout();

        assert!(client.projects().items().is_empty());
        assert!(client.tasks().items().is_empty());
        assert_eq!(client.tasks().total(), 0);
        assert!(transport.calls_to("/auth/logout").is_empty());
    }

    #[tokio::test]
    async fn test_list_in_flight_at_logout_is_not_mirrored() {
        let (client, _) = signed_in("T1", || mock::status(401)).await;
        let filters = ProjectFilters::default();

        let mut listing = std::pin::pin!(client.projects().list_page(&filters, 0));
        assert!(futures::poll!(&mut listing).is_pending());
        client.logout();
        let listing = listing.await.unwrap();

        assert_eq!(listing.items.len(), 1);
        assert!(!client.session().is_authenticated());
        assert!(client.projects().items().is_empty());
        assert_eq!(client.projects().total(), 0);
    }
}
