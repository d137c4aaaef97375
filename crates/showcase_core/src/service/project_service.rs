//! Transactional update orchestrator for projects.
//!
//! # Responsibility
//! - Sequence authorization, decoding, validation, upload intake, the entity
//!   store transaction and post-commit attachment cleanup for one request.
//! - Be the single decision point for commit vs. abort.
//!
//! # Invariants
//! - Requests move `received -> validated -> tx_open -> tx_committed ->
//!   cleanup_done`, or end in `tx_aborted`; rejects before `tx_open` have
//!   no side effects.
//! - Attachment deletion only ever happens after the owning transaction
//!   committed.
//! - Snapshots for update/delete are read before the transaction; the
//!   transaction re-checks the snapshot version, so a concurrent commit in
//!   between turns into `ServiceError::Conflict` instead of a stale cleanup.
//! - Files stored for an aborted request stay on disk and are logged as
//!   leaked.

use crate::access::{authorize_mutation, AccessGate, AuthError, Principal};
use crate::attachment::{AttachmentError, AttachmentStore, DeleteOutcome};
use crate::config::CatalogConfig;
use crate::db::{open_db, DbError};
use crate::diff::{
    diff_cover, diff_gallery, reconcile_member_images_keyed, reconcile_member_images_positional,
    validate_keyed_targets, validate_positional_previous, MemberImagePlan, OrphanSet,
};
use crate::model::project::{AttachmentRef, Member, MemberDraft, MemberKey, Project, ProjectId};
use crate::model::validation::{
    parse_project_id, validate_fields, validate_members, ValidationError,
};
use crate::repo::project_repo::{
    ProjectRepository, ProjectUpdate, RepoError, SqliteProjectRepository,
};
use crate::service::form::{
    check_upload_limits, decode_gallery_remove, decode_members, decode_previous_member_images,
    CreateProjectForm, DeleteProjectForm, MemberUploads, UpdateProjectForm, Upload,
};
use crate::service::participation::{
    compose_participation_message, validate_participation, Mailer, ParticipationRequest,
};
use log::{error, info, warn};
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Per-request orchestration stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStage {
    Received,
    Validated,
    TxOpen,
    TxCommitted,
    CleanupDone,
    TxAborted,
}

impl RequestStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Validated => "validated",
            Self::TxOpen => "tx_open",
            Self::TxCommitted => "tx_committed",
            Self::CleanupDone => "cleanup_done",
            Self::TxAborted => "tx_aborted",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::CleanupDone | Self::TxAborted)
    }
}

/// User-visible failure categories.
#[derive(Debug)]
pub enum ServiceError {
    /// Malformed payload, missing field or member invariant violation.
    Validation(ValidationError),
    NotFound(ProjectId),
    Auth(AuthError),
    /// The project changed between snapshot and transaction.
    Conflict {
        id: ProjectId,
        expected: i64,
        actual: i64,
    },
    /// A statement inside the transaction failed; nothing was committed.
    Transaction(RepoError),
    /// Upload intake failed before the transaction opened.
    Attachment(AttachmentError),
    /// Catalog handles could not be opened.
    Open(DbError),
    /// Outbound notification could not be delivered.
    Notification(String),
}

impl ServiceError {
    /// HTTP-style status code for the transport layer.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::NotFound(_) => 404,
            Self::Auth(err) => err.status_code(),
            Self::Conflict { .. } => 409,
            Self::Transaction(_) | Self::Attachment(_) | Self::Open(_) | Self::Notification(_) => {
                500
            }
        }
    }
}

impl Display for ServiceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(err) => write!(f, "{err}"),
            Self::NotFound(id) => write!(f, "project not found: {id}"),
            Self::Auth(err) => write!(f, "{err}"),
            Self::Conflict {
                id,
                expected,
                actual,
            } => write!(
                f,
                "project {id} was modified concurrently (expected version {expected}, found {actual})"
            ),
            Self::Transaction(err) => write!(f, "transaction failed: {err}"),
            Self::Attachment(err) => write!(f, "{err}"),
            Self::Open(err) => write!(f, "cannot open catalog: {err}"),
            Self::Notification(message) => write!(f, "notification failed: {message}"),
        }
    }
}

impl Error for ServiceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Validation(err) => Some(err),
            Self::Auth(err) => Some(err),
            Self::Transaction(err) => Some(err),
            Self::Attachment(err) => Some(err),
            Self::Open(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ValidationError> for ServiceError {
    fn from(value: ValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<AuthError> for ServiceError {
    fn from(value: AuthError) -> Self {
        Self::Auth(value)
    }
}

impl From<AttachmentError> for ServiceError {
    fn from(value: AttachmentError) -> Self {
        Self::Attachment(value)
    }
}

impl From<RepoError> for ServiceError {
    fn from(value: RepoError) -> Self {
        match value {
            RepoError::NotFound(id) => Self::NotFound(id),
            RepoError::StaleVersion {
                id,
                expected,
                actual,
            } => Self::Conflict {
                id,
                expected,
                actual,
            },
            other => Self::Transaction(other),
        }
    }
}

/// What post-commit cleanup did with each orphaned ref.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub deleted: Vec<AttachmentRef>,
    pub already_missing: Vec<AttachmentRef>,
    /// Refs recorded in the pending-cleanup ledger.
    pub escalated: Vec<AttachmentRef>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.escalated.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOutcome {
    pub id: ProjectId,
    pub cleanup: CleanupReport,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub id: ProjectId,
    /// Version after the committed update.
    pub version: i64,
    pub cleanup: CleanupReport,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovalOutcome {
    pub id: ProjectId,
    pub cleanup: CleanupReport,
}

/// Project catalog service: the orchestrator over explicit handles.
pub struct ProjectService<R: ProjectRepository> {
    repo: R,
    attachments: AttachmentStore,
    gate: Box<dyn AccessGate>,
    mailer: Option<Box<dyn Mailer>>,
}

impl ProjectService<SqliteProjectRepository> {
    /// Opens the SQLite catalog and attachment directory named by `config`.
    pub fn open(config: &CatalogConfig, gate: Box<dyn AccessGate>) -> ServiceResult<Self> {
        let conn = open_db(&config.db_path).map_err(ServiceError::Open)?;
        let attachments = AttachmentStore::open(&config.attachment_dir, config.delete_policy())?;
        Ok(Self::new(SqliteProjectRepository::new(conn), attachments, gate))
    }
}

impl<R: ProjectRepository> ProjectService<R> {
    pub fn new(repo: R, attachments: AttachmentStore, gate: Box<dyn AccessGate>) -> Self {
        Self {
            repo,
            attachments,
            gate,
            mailer: None,
        }
    }

    /// Attaches the outbound mail transport used by `request_participation`.
    pub fn with_mailer(mut self, mailer: Box<dyn Mailer>) -> Self {
        self.mailer = Some(mailer);
        self
    }

    pub fn repository(&self) -> &R {
        &self.repo
    }

    pub fn attachments(&self) -> &AttachmentStore {
        &self.attachments
    }

    /// Lists all projects, newest id first. Needs no credential.
    pub fn list_projects(&self) -> ServiceResult<Vec<Project>> {
        self.repo.list_projects().map_err(ServiceError::Transaction)
    }

    /// Gets one project with its members. Needs no credential.
    pub fn get_project(&self, id: ProjectId) -> ServiceResult<Project> {
        self.repo
            .get_project(id)
            .map_err(ServiceError::Transaction)?
            .ok_or(ServiceError::NotFound(id))
    }

    /// Gets one project addressed by a textual (path segment) id.
    pub fn get_project_by_text(&self, id: &str) -> ServiceResult<Project> {
        self.get_project(parse_project_id(id)?)
    }

    /// Creates one project with its members and uploads.
    pub fn create_project(
        &self,
        credential: Option<&str>,
        form: CreateProjectForm,
    ) -> ServiceResult<CreateOutcome> {
        let principal = authorize_mutation(self.gate.as_ref(), credential)?;
        let mut trace = Trace::received("project_create", None, &principal);

        let drafts = decode_members(&form.members).map_err(|err| trace.reject(err.into()))?;
        validate_fields(&form.fields)
            .and_then(|()| validate_members(&drafts))
            .and_then(|()| check_upload_limits(&form.gallery))
            .and_then(|()| check_keyed_uploads(&drafts, &form.member_images))
            .map_err(|err| trace.reject(err.into()))?;
        trace.advance(RequestStage::Validated);

        let intake = self.store_intake(
            &trace,
            form.cover.as_ref(),
            &form.gallery,
            &form.member_images,
        )?;
        let plan = intake
            .reconcile(&drafts, &[], &[])
            .map_err(|err| trace.fail(err.into(), &intake.all()))?;
        let members = build_members(drafts, plan.images);

        trace.advance(RequestStage::TxOpen);
        let id = self
            .repo
            .create_project(&form.fields, intake.cover.as_ref(), &intake.gallery, &members)
            .map_err(|err| trace.fail(err.into(), &intake.all()))?;
        trace.project_id = Some(id);
        trace.advance(RequestStage::TxCommitted);

        let orphans: OrphanSet = plan.unused_uploads.into_iter().collect();
        let cleanup = self.cleanup(&trace, orphans);
        trace.advance(RequestStage::CleanupDone);
        Ok(CreateOutcome { id, cleanup })
    }

    /// Updates one project: replaces members, merges the gallery, optionally
    /// replaces the cover, then deletes what became orphaned.
    pub fn update_project(
        &self,
        credential: Option<&str>,
        form: UpdateProjectForm,
    ) -> ServiceResult<UpdateOutcome> {
        let principal = authorize_mutation(self.gate.as_ref(), credential)?;
        let mut trace = Trace::received("project_update", Some(form.id), &principal);

        let drafts = decode_members(&form.members).map_err(|err| trace.reject(err.into()))?;
        let previous_images = match form.member_images {
            MemberUploads::Positional(_) => {
                decode_previous_member_images(&form.previous_member_images)
                    .map_err(|err| trace.reject(err.into()))?
            }
            MemberUploads::Keyed(_) => Vec::new(),
        };
        let remove = decode_gallery_remove(&form.gallery_remove)
            .map_err(|err| trace.reject(err.into()))?;

        let snapshot = self.snapshot(&trace, form.id)?;
        let expected_version = form.expected_version.unwrap_or(snapshot.version);
        if expected_version != snapshot.version {
            return Err(trace.reject(ServiceError::Conflict {
                id: form.id,
                expected: expected_version,
                actual: snapshot.version,
            }));
        }
        let owned_images: Vec<AttachmentRef> = snapshot
            .members
            .iter()
            .filter_map(|member| member.image.clone())
            .collect();

        validate_fields(&form.fields)
            .and_then(|()| validate_members(&drafts))
            .and_then(|()| check_upload_limits(&form.gallery))
            .and_then(|()| match &form.member_images {
                MemberUploads::Positional(_) => {
                    validate_positional_previous(drafts.len(), &previous_images, &owned_images)
                }
                MemberUploads::Keyed(_) => check_keyed_uploads(&drafts, &form.member_images),
            })
            .map_err(|err| trace.reject(err.into()))?;
        trace.advance(RequestStage::Validated);

        let intake = self.store_intake(
            &trace,
            form.cover.as_ref(),
            &form.gallery,
            &form.member_images,
        )?;
        let gallery = diff_gallery(&snapshot.gallery, &remove, &intake.gallery);
        let cover = diff_cover(snapshot.cover.as_ref(), intake.cover.as_ref());
        let plan = intake
            .reconcile(&drafts, &previous_images, &snapshot.members)
            .map_err(|err| trace.fail(err.into(), &intake.all()))?;
        let members = build_members(drafts, plan.images);

        trace.advance(RequestStage::TxOpen);
        let version = self
            .repo
            .update_project(&ProjectUpdate {
                id: form.id,
                expected_version,
                fields: &form.fields,
                cover: cover.final_cover.as_ref(),
                gallery: &gallery.final_gallery,
                members: &members,
            })
            .map_err(|err| trace.fail(err.into(), &intake.all()))?;
        trace.advance(RequestStage::TxCommitted);

        let mut orphans = OrphanSet::new();
        orphans.extend(gallery.orphaned.into_vec());
        orphans.extend(cover.orphaned.into_vec());
        orphans.extend(plan.orphaned.into_vec());
        orphans.extend(plan.unused_uploads);
        orphans.retain_unreferenced(
            cover
                .final_cover
                .iter()
                .chain(gallery.final_gallery.iter())
                .chain(members.iter().filter_map(|member| member.image.as_ref())),
        );
        let cleanup = self.cleanup(&trace, orphans);
        trace.advance(RequestStage::CleanupDone);

        Ok(UpdateOutcome {
            id: form.id,
            version,
            cleanup,
        })
    }

    /// Deletes one project with its members, then every attachment they
    /// referenced.
    pub fn delete_project(
        &self,
        credential: Option<&str>,
        form: DeleteProjectForm,
    ) -> ServiceResult<RemovalOutcome> {
        let principal = authorize_mutation(self.gate.as_ref(), credential)?;
        let id = form.id;
        let mut trace = Trace::received("project_delete", Some(id), &principal);

        let snapshot = self.snapshot(&trace, id)?;
        let expected_version = form.expected_version.unwrap_or(snapshot.version);
        trace.advance(RequestStage::Validated);

        trace.advance(RequestStage::TxOpen);
        self.repo
            .delete_project(id, expected_version)
            .map_err(|err| trace.fail(err.into(), &[]))?;
        trace.advance(RequestStage::TxCommitted);

        let orphans: OrphanSet = snapshot.attachment_refs().into_iter().collect();
        let cleanup = self.cleanup(&trace, orphans);
        trace.advance(RequestStage::CleanupDone);
        Ok(RemovalOutcome { id, cleanup })
    }

    /// Relays a participation request to the project's responsible member.
    /// Needs no credential.
    pub fn request_participation(&self, request: &ParticipationRequest) -> ServiceResult<()> {
        validate_participation(request)?;
        let mailer = self
            .mailer
            .as_ref()
            .ok_or_else(|| {
                ServiceError::Notification("no mail transport configured".to_string())
            })?;

        let message = compose_participation_message(request);
        match mailer.send(&message) {
            Ok(()) => {
                info!(
                    "event=participation_request module=service status=ok to={}",
                    message.to
                );
                Ok(())
            }
            Err(err) => {
                error!(
                    "event=participation_request module=service status=error to={} error={}",
                    message.to, err
                );
                Err(ServiceError::Notification(err.to_string()))
            }
        }
    }

    /// Re-attempts every ledger entry; entries that are gone now are cleared.
    pub fn retry_pending_cleanup(&self) -> ServiceResult<CleanupReport> {
        let pending = self
            .repo
            .list_pending_cleanup()
            .map_err(ServiceError::Transaction)?;
        let mut report = CleanupReport::default();

        for entry in pending {
            match self.attachments.delete(&entry.attachment) {
                DeleteOutcome::Escalated { last_error, .. } => {
                    self.record_escalation(&entry.attachment, &last_error);
                    report.escalated.push(entry.attachment);
                }
                outcome => {
                    if let Err(err) = self.repo.clear_pending_cleanup(&entry.attachment) {
                        error!(
                            "event=cleanup_retry module=service status=error ref={} error={}",
                            entry.attachment, err
                        );
                    }
                    if outcome == DeleteOutcome::Deleted {
                        report.deleted.push(entry.attachment);
                    } else {
                        report.already_missing.push(entry.attachment);
                    }
                }
            }
        }

        info!(
            "event=cleanup_retry module=service status=ok deleted={} missing={} escalated={}",
            report.deleted.len(),
            report.already_missing.len(),
            report.escalated.len()
        );
        Ok(report)
    }

    fn snapshot(&self, trace: &Trace<'_>, id: ProjectId) -> ServiceResult<Project> {
        self.repo
            .get_project(id)
            .map_err(|err| trace.reject(ServiceError::Transaction(err)))?
            .ok_or_else(|| trace.reject(ServiceError::NotFound(id)))
    }

    fn store_intake(
        &self,
        trace: &Trace<'_>,
        cover: Option<&Upload>,
        gallery: &[Upload],
        member_images: &MemberUploads,
    ) -> ServiceResult<Intake> {
        let mut intake = Intake::default();
        match self.store_into(&mut intake, cover, gallery, member_images) {
            Ok(()) => Ok(intake),
            Err(err) => Err(trace.fail(err.into(), &intake.all())),
        }
    }

    fn store_into(
        &self,
        intake: &mut Intake,
        cover: Option<&Upload>,
        gallery: &[Upload],
        member_images: &MemberUploads,
    ) -> Result<(), AttachmentError> {
        if let Some(upload) = cover {
            intake.cover = Some(self.store_upload(upload)?);
        }
        intake.members = match member_images {
            MemberUploads::Positional(_) => StoredMemberImages::Positional(Vec::new()),
            MemberUploads::Keyed(_) => StoredMemberImages::Keyed(Vec::new()),
        };
        match (member_images, &mut intake.members) {
            (MemberUploads::Positional(uploads), StoredMemberImages::Positional(stored)) => {
                for upload in uploads {
                    stored.push(self.store_upload(upload)?);
                }
            }
            (MemberUploads::Keyed(uploads), StoredMemberImages::Keyed(stored)) => {
                for keyed in uploads {
                    stored.push((keyed.key, self.store_upload(&keyed.upload)?));
                }
            }
            _ => {}
        }
        for upload in gallery {
            let stored = self.store_upload(upload)?;
            intake.gallery.push(stored);
        }
        Ok(())
    }

    fn store_upload(&self, upload: &Upload) -> Result<AttachmentRef, AttachmentError> {
        self.attachments.store(&upload.bytes, &upload.original_name)
    }

    fn cleanup(&self, trace: &Trace<'_>, orphans: OrphanSet) -> CleanupReport {
        let mut report = CleanupReport::default();
        let orphan_count = orphans.len();
        for attachment in orphans.into_vec() {
            match self.attachments.delete(&attachment) {
                DeleteOutcome::Deleted => report.deleted.push(attachment),
                DeleteOutcome::AlreadyMissing => report.already_missing.push(attachment),
                DeleteOutcome::Escalated { last_error, .. } => {
                    self.record_escalation(&attachment, &last_error);
                    report.escalated.push(attachment);
                }
            }
        }
        info!(
            "event={} module=service status=cleanup project_id={} orphans={} deleted={} missing={} escalated={}",
            trace.operation,
            id_text(trace.project_id),
            orphan_count,
            report.deleted.len(),
            report.already_missing.len(),
            report.escalated.len()
        );
        report
    }

    fn record_escalation(&self, attachment: &AttachmentRef, reason: &str) {
        if let Err(err) = self.repo.record_pending_cleanup(attachment, reason) {
            error!(
                "event=cleanup_escalate module=service status=error ref={} error={}",
                attachment, err
            );
        }
    }
}

/// Refs stored during intake for one request.
#[derive(Debug, Default)]
struct Intake {
    cover: Option<AttachmentRef>,
    gallery: Vec<AttachmentRef>,
    members: StoredMemberImages,
}

/// Member-image uploads after storage, in the contract they arrived under.
#[derive(Debug)]
enum StoredMemberImages {
    Positional(Vec<AttachmentRef>),
    Keyed(Vec<(MemberKey, AttachmentRef)>),
}

impl Default for StoredMemberImages {
    fn default() -> Self {
        Self::Positional(Vec::new())
    }
}

impl Intake {
    fn all(&self) -> Vec<AttachmentRef> {
        let members: Vec<&AttachmentRef> = match &self.members {
            StoredMemberImages::Positional(refs) => refs.iter().collect(),
            StoredMemberImages::Keyed(pairs) => pairs.iter().map(|(_, stored)| stored).collect(),
        };
        self.cover
            .iter()
            .chain(members)
            .chain(self.gallery.iter())
            .cloned()
            .collect()
    }

    fn reconcile(
        &self,
        drafts: &[MemberDraft],
        previous_per_position: &[Option<AttachmentRef>],
        previous_members: &[Member],
    ) -> Result<MemberImagePlan, ValidationError> {
        match &self.members {
            StoredMemberImages::Positional(uploads) => {
                let owned: Vec<AttachmentRef> = previous_members
                    .iter()
                    .filter_map(|member| member.image.clone())
                    .collect();
                reconcile_member_images_positional(
                    drafts.len(),
                    previous_per_position,
                    uploads,
                    &owned,
                )
            }
            StoredMemberImages::Keyed(uploads) => {
                reconcile_member_images_keyed(drafts, previous_members, uploads)
            }
        }
    }
}

fn check_keyed_uploads(
    drafts: &[MemberDraft],
    member_images: &MemberUploads,
) -> Result<(), ValidationError> {
    match member_images {
        MemberUploads::Positional(_) => Ok(()),
        MemberUploads::Keyed(uploads) => {
            validate_keyed_targets(drafts, uploads.iter().map(|keyed| keyed.key))
        }
    }
}

fn build_members(drafts: Vec<MemberDraft>, images: Vec<Option<AttachmentRef>>) -> Vec<Member> {
    drafts
        .into_iter()
        .zip(images)
        .map(|(draft, image)| draft.into_member(image))
        .collect()
}

fn id_text(id: Option<ProjectId>) -> String {
    id.map_or_else(|| "-".to_string(), |id| id.to_string())
}

/// Stage bookkeeping and logging for one request.
struct Trace<'p> {
    operation: &'static str,
    project_id: Option<ProjectId>,
    principal: &'p Principal,
    stage: RequestStage,
}

impl<'p> Trace<'p> {
    fn received(
        operation: &'static str,
        project_id: Option<ProjectId>,
        principal: &'p Principal,
    ) -> Self {
        let trace = Self {
            operation,
            project_id,
            principal,
            stage: RequestStage::Received,
        };
        trace.log_stage();
        trace
    }

    fn advance(&mut self, stage: RequestStage) {
        self.stage = stage;
        self.log_stage();
    }

    fn log_stage(&self) {
        info!(
            "event={} module=service status=ok stage={} project_id={} subject={}",
            self.operation,
            self.stage.as_str(),
            id_text(self.project_id),
            self.principal.subject
        );
    }

    /// Logs a pre-mutation reject and hands the error back.
    fn reject(&self, err: ServiceError) -> ServiceError {
        warn!(
            "event={} module=service status=rejected stage={} project_id={} code={} error={}",
            self.operation,
            self.stage.as_str(),
            id_text(self.project_id),
            err.status_code(),
            err
        );
        err
    }

    /// Logs a failure after intake started; stored files are left in place.
    fn fail(&self, err: ServiceError, leaked: &[AttachmentRef]) -> ServiceError {
        let stage = if self.stage == RequestStage::TxOpen {
            RequestStage::TxAborted
        } else {
            self.stage
        };
        error!(
            "event={} module=service status=error stage={} project_id={} code={} error={}",
            self.operation,
            stage.as_str(),
            id_text(self.project_id),
            err.status_code(),
            err
        );
        if !leaked.is_empty() {
            let names: Vec<&str> = leaked.iter().map(AttachmentRef::as_str).collect();
            warn!(
                "event={} module=service status=leaked project_id={} refs={}",
                self.operation,
                id_text(self.project_id),
                names.join(",")
            );
        }
        err
    }
}
