#![doc = include_str!("../README.md")]

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod observable;
pub mod pipeline;
pub mod project;
pub mod session;
mod singleflight;
pub mod store;
pub mod task;
pub mod token;
pub mod transport;
pub mod types;

// Re-exports for convenient access
pub use cache::{CollectionCache, ListQuery, Listing, Resource};
pub use client::DashboardClient;
pub use config::ClientConfig;
pub use error::Error;
pub use observable::{Observable, Subscription};
pub use pipeline::RequestPipeline;
pub use project::{
    CreateProjectRequest, DateRange, Project, ProjectCache, ProjectFilters, ProjectStats,
    ProjectStatus, UpdateProjectRequest,
};
pub use session::Session;
pub use store::{CredentialKey, CredentialStore, FileCredentialStore, MemoryCredentialStore};
pub use task::{
    CreateTaskRequest, Task, TaskCache, TaskComment, TaskFilters, TaskStats, TaskStatus,
    UpdateTaskRequest,
};
pub use token::{AccessGrant, decode_claims, is_token_expired, token_expiry};
#[cfg(feature = "http")]
pub use transport::HttpTransport;
pub use transport::{ApiRequest, ApiResponse, Method, Transport};
pub use types::{
    ChangePasswordRequest, Credentials, EntityId, Identity, Priority, RegisterRequest, Role,
    UpdateProfileRequest,
};
