//! Core domain logic for the project showcase catalog.
//! This crate is the single source of truth for project/member invariants
//! and for keeping attachment files consistent with committed rows.

pub mod access;
pub mod attachment;
pub mod config;
pub mod db;
pub mod diff;
pub mod logging;
pub mod model;
pub mod repo;
pub mod service;

pub use access::{authorize_mutation, AccessGate, AuthError, Principal, Role, StaticAccessGate};
pub use attachment::{AttachmentError, AttachmentStore, DeleteOutcome, DeletePolicy};
pub use config::{CatalogConfig, ConfigError};
pub use db::{open_db, open_db_in_memory, DbError, DbResult};
pub use logging::{default_log_level, init_logging, init_logging_from_config, logging_status};
pub use model::project::{
    AttachmentRef, Member, MemberDraft, MemberKey, Project, ProjectFields, ProjectId,
    DEFAULT_MEMBER_AVATAR,
};
pub use model::validation::ValidationError;
pub use repo::project_repo::{
    PendingCleanup, ProjectRepository, ProjectUpdate, RepoError, RepoResult,
    SqliteProjectRepository,
};
pub use service::form::{
    CreateProjectForm, DeleteProjectForm, KeyedUpload, MemberUploads, UpdateProjectForm, Upload,
};
pub use service::participation::{MailError, Mailer, OutboundMessage, ParticipationRequest};
pub use service::project_service::{
    CleanupReport, CreateOutcome, ProjectService, RemovalOutcome, RequestStage, ServiceError,
    ServiceResult, UpdateOutcome,
};

/// Minimal health-check API for early integration.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
