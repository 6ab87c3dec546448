use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::cache::{CollectionCache, Listing, ListQuery, Resource};
use crate::error::Error;
use crate::store::CredentialStore;
use crate::transport::{ApiRequest, Transport};
use crate::types::{EntityId, Priority};

/// Mirror of `/tasks`.
pub type TaskCache<T, S> = CollectionCache<Task, T, S>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Todo,
    InProgress,
    InReview,
    Done,
    Blocked,
}

impl TaskStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Todo => "TODO",
            Self::InProgress => "IN_PROGRESS",
            Self::InReview => "IN_REVIEW",
            Self::Done => "DONE",
            Self::Blocked => "BLOCKED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskComment {
    pub id: EntityId,
    pub content: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub created_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: EntityId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    pub priority: Priority,
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub assigned_users: Vec<String>,
    #[serde(default)]
    pub project_id: Option<EntityId>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub estimated_hours: Option<f64>,
    #[serde(default)]
    pub actual_hours: Option<f64>,
    /// Ids of tasks that must be done first.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub comments: Vec<TaskComment>,
}

impl Resource for Task {
    const PATH: &'static str = "/tasks";
    type Filters = TaskFilters;

    fn id(&self) -> &EntityId {
        &self.id
    }
}

/// Body of `POST /tasks`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskRequest {
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub priority: Priority,
    pub due_date: String,
    pub assigned_users: Vec<String>,
    pub project_id: EntityId,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_hours: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
}

/// Body of `PUT /tasks/{id}`; unset fields are left out.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTaskRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_users: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<EntityId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_hours: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilters {
    pub status: Option<TaskStatus>,
    pub priority: Option<Priority>,
    pub assigned_user: Option<String>,
    pub project_id: Option<EntityId>,
    pub tags: Vec<String>,
    pub due_date: Option<String>,
    pub search: Option<String>,
}

impl ListQuery for TaskFilters {
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
        if let Some(project) = &self.project_id {
            request = request.with_query("projectId", project.as_str());
        }
        if !self.tags.is_empty() {
            request = request.with_query("tags", self.tags.join(","));
        }
        if let Some(due) = self.due_date.as_deref().filter(|d| !d.is_empty()) {
            request = request.with_query("dueDate", due);
        }
        if let Some(search) = self.search.as_deref().filter(|s| !s.is_empty()) {
            request = request.with_query("search", search);
        }
        request
    }
}

/// Aggregates from `GET /tasks/stats`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskStats {
    pub total_tasks: u64,
    pub active_tasks: u64,
    pub completed_tasks: u64,
    pub overdue_tasks: u64,
    pub completed_this_week: u64,
    pub average_completion_time: f64,
    pub total_users: u64,
    /// Task count per priority name.
    pub task_priority_distribution: BTreeMap<String, u64>,
}

#[derive(Serialize)]
struct StatusBody {
    status: TaskStatus,
}

impl<T: Transport, S: CredentialStore> CollectionCache<Task, T, S> {
    /// Move a task to `status`.
    ///
    /// # Errors
    ///
    /// Pipeline errors; the mirror is untouched.
    pub async fn update_status(&self, id: &EntityId, status: TaskStatus) -> Result<Task, Error> {
        self.patch(id, "status", &StatusBody { status }).await
    }

    /// # Errors
    ///
    /// Pipeline errors.
    pub async fn stats(&self) -> Result<TaskStats, Error> {
        self.query(ApiRequest::get(format!("{}/stats", Task::PATH)))
            .await
    }

    /// One page of tasks assigned to the signed-in user. Does not touch the mirror.
    ///
    /// # Errors
    ///
    /// Pipeline errors.
    pub async fn my_tasks(&self, page: u32, page_size: u32) -> Result<Listing<Task>, Error> {
        self.query_page("my-tasks", page, page_size).await
    }

    /// One page of a project's tasks. Does not touch the mirror.
    ///
    /// # Errors
    ///
    /// Pipeline errors.
    pub async fn by_project(&self, project: &EntityId, page: u32, page_size: u32) -> Result<Listing<Task>, Error> {
        let subpath = format!("project/{}", urlencoding::encode(project.as_str()));
        self.query_page(&subpath, page, page_size).await
    }
}
