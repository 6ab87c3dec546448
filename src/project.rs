use serde::{Deserialize, Serialize};

use crate::cache::{CollectionCache, Listing, ListQuery, Resource};
use crate::error::Error;
use crate::store::CredentialStore;
use crate::transport::{ApiRequest, Transport};
use crate::types::{EntityId, Priority};

/// Mirror of `/projects`.
pub type ProjectCache<T, S> = CollectionCache<Project, T, S>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProjectStatus {
    Planning,
    InProgress,
    OnHold,
    Completed,
    Cancelled,
}

impl ProjectStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Planning => "PLANNING",
            Self::InProgress => "IN_PROGRESS",
            Self::OnHold => "ON_HOLD",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

/// A project as returned by the server. Dates are kept as the server's strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: EntityId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: ProjectStatus,
    pub priority: Priority,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
    /// Percent complete, 0 to 100.
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub assigned_users: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub budget: Option<f64>,
    #[serde(default)]
    pub estimated_hours: Option<f64>,
    #[serde(default)]
    pub actual_hours: Option<f64>,
}

impl Resource for Project {
    const PATH: &'static str = "/projects";
    type Filters = ProjectFilters;

    fn id(&self) -> &EntityId {
        &self.id
    }
}

/// Body of `POST /projects`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProjectRequest {
    pub title: String,
    pub description: String,
    pub status: ProjectStatus,
    pub priority: Priority,
    pub start_date: String,
    pub end_date: String,
    pub assigned_users: Vec<String>,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_hours: Option<f64>,
}

/// Body of `PUT /projects/{id}`; unset fields are left out.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateProjectRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ProjectStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_users: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_hours: Option<f64>,
}

/// Inclusive date window, ISO dates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateRange {
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectFilters {
    pub status: Option<ProjectStatus>,
    pub priority: Option<Priority>,
    pub assigned_user: Option<String>,
    pub search: Option<String>,
    pub date_range: Option<DateRange>,
}

impl ListQuery for ProjectFilters {
    fn apply(&self, mut request: ApiRequest) -> ApiRequest {
        if let Some(status) = self.status {
            request = request.with_query("status", status.as_str());
        }
        if let Some(priority) = self.priority {
            request = request.with_query("priority", priority.as_str());
        }
        if let Some(user) = self.assigned_user.as_deref().filter(|u| !u.is_empty()) {
            request = request.with_query("assignedUser", user);
        }
        if let Some(search) = self.search.as_deref().filter(|s| !s.is_empty()) {
            request = request.with_query("search", search);
        }
        if let Some(range) = &self.date_range {
            if !range.start.is_empty() {
                request = request.with_query("startDate", &range.start);
            }
            if !range.end.is_empty() {
                request = request.with_query("endDate", &range.end);
            }
        }
        request
    }
}

/// Aggregates from `GET /projects/stats`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectStats {
    pub total_projects: u64,
    pub active_projects: u64,
    pub completed_projects: u64,
    pub overdue_projects: u64,
    pub total_budget: f64,
    pub average_progress: f64,
    pub average_completion_time: f64,
}

#[derive(Serialize)]
struct ProgressBody {
    progress: u8,
}

impl<T: Transport, S: CredentialStore> CollectionCache<Project, T, S> {
    /// Set a project's completion percentage (clamped to 100).
    ///
    /// # Errors
    ///
    /// Pipeline errors; the mirror is untouched.
    pub async fn update_progress(&self, id: &EntityId, progress: u8) -> Result<Project, Error> {
        self.patch(id, "progress", &ProgressBody {
            progress: progress.min(100),
        })
        .await
    }

    /// # Errors
    ///
    /// Pipeline errors.
    pub async fn stats(&self) -> Result<ProjectStats, Error> {
        self.query(ApiRequest::get(format!("{}/stats", Project::PATH)))
            .await
    }

    /// One page of the signed-in user's projects. Does not touch the mirror.
    ///
    /// # Errors
    ///
    /// Pipeline errors.
    pub async fn my_projects(&self, page: u32, page_size: u32) -> Result<Listing<Project>, Error> {
        self.query_page("my-projects", page, page_size).await
    }
}
