//! Project repository contracts and SQLite implementation.
//!
//! # Responsibility
//! - Persist projects together with their ordered member rows.
//! - Keep the durable ledger of attachments that need manual cleanup.
//!
//! # Invariants
//! - Create, update and delete are all-or-nothing; no reader observes a
//!   project without its members or half of a member replacement.
//! - Update and delete check the optimistic `version` inside the same
//!   transaction that mutates the rows.
//! - Member order is preserved through the `position` column.

use crate::db::DbError;
use crate::model::project::{
    AttachmentRef, Member, MemberKey, Project, ProjectFields, ProjectId,
};
use log::debug;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

const PROJECT_SELECT_SQL: &str = "SELECT
    id,
    title,
    date,
    courses,
    description,
    cover,
    gallery,
    version
FROM projects";

const MEMBER_INSERT_SQL: &str = "INSERT INTO members (
    project_id,
    member_key,
    name,
    titles,
    email,
    image,
    is_responsible,
    position
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8);";

pub type RepoResult<T> = Result<T, RepoError>;

/// Repository error for project persistence and query operations.
#[derive(Debug)]
pub enum RepoError {
    Db(DbError),
    NotFound(ProjectId),
    /// Row changed since the caller's snapshot.
    StaleVersion {
        id: ProjectId,
        expected: i64,
        actual: i64,
    },
    InvalidData(String),
    /// A previous holder of the connection panicked mid-operation.
    ConnectionPoisoned,
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::NotFound(id) => write!(f, "project not found: {id}"),
            Self::StaleVersion {
                id,
                expected,
                actual,
            } => write!(
                f,
                "project {id} changed concurrently: expected version {expected}, found {actual}"
            ),
            Self::InvalidData(message) => write!(f, "invalid persisted project data: {message}"),
            Self::ConnectionPoisoned => write!(f, "catalog connection lock is poisoned"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// Full replacement payload for one project update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectUpdate<'a> {
    pub id: ProjectId,
    pub expected_version: i64,
    pub fields: &'a ProjectFields,
    pub cover: Option<&'a AttachmentRef>,
    pub gallery: &'a [AttachmentRef],
    pub members: &'a [Member],
}

/// One attachment waiting for manual (or retried) deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCleanup {
    pub attachment: AttachmentRef,
    pub reason: String,
    pub attempts: u32,
    pub recorded_at: i64,
}

/// Repository interface for project/member persistence.
pub trait ProjectRepository {
    /// Inserts the project row and all member rows in one transaction.
    fn create_project(
        &self,
        fields: &ProjectFields,
        cover: Option<&AttachmentRef>,
        gallery: &[AttachmentRef],
        members: &[Member],
    ) -> RepoResult<ProjectId>;
    /// Reads one project with its members in insertion order.
    fn get_project(&self, id: ProjectId) -> RepoResult<Option<Project>>;
    /// Lists all projects, newest id first, members nested in order.
    fn list_projects(&self) -> RepoResult<Vec<Project>>;
    /// Replaces members, scalar fields, cover and gallery; returns the new version.
    fn update_project(&self, update: &ProjectUpdate<'_>) -> RepoResult<i64>;
    /// Deletes member rows then the project row.
    fn delete_project(&self, id: ProjectId, expected_version: i64) -> RepoResult<()>;
    /// Upserts one durable "needs manual cleanup" record.
    fn record_pending_cleanup(&self, attachment: &AttachmentRef, reason: &str) -> RepoResult<()>;
    fn list_pending_cleanup(&self) -> RepoResult<Vec<PendingCleanup>>;
    fn clear_pending_cleanup(&self, attachment: &AttachmentRef) -> RepoResult<()>;

    /// Returns every attachment referenced by any stored project or member.
    fn referenced_attachments(&self) -> RepoResult<Vec<AttachmentRef>> {
        Ok(self
            .list_projects()?
            .iter()
            .flat_map(Project::attachment_refs)
            .collect())
    }
}

/// SQLite-backed project repository.
///
/// Owns its connection; the mutex makes the handle shareable between
/// concurrent requests while each operation holds it for one transaction.
pub struct SqliteProjectRepository {
    conn: Mutex<Connection>,
}

impl SqliteProjectRepository {
    /// Wraps a migrated/ready connection (see `crate::db::open_db`).
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    /// Releases the handle and returns the underlying connection.
    pub fn into_inner(self) -> RepoResult<Connection> {
        self.conn
            .into_inner()
            .map_err(|_| RepoError::ConnectionPoisoned)
    }

    fn lock(&self) -> RepoResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| RepoError::ConnectionPoisoned)
    }
}

impl ProjectRepository for SqliteProjectRepository {
    fn create_project(
        &self,
        fields: &ProjectFields,
        cover: Option<&AttachmentRef>,
        gallery: &[AttachmentRef],
        members: &[Member],
    ) -> RepoResult<ProjectId> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "INSERT INTO projects (
                title,
                date,
                courses,
                description,
                cover,
                gallery,
                version
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1);",
            params![
                fields.title.trim(),
                fields.date.as_str(),
                fields.courses.as_str(),
                fields.description.as_str(),
                cover.map(AttachmentRef::as_str),
                encode_gallery(gallery)?,
            ],
        )?;
        let id = tx.last_insert_rowid();
        insert_members(&tx, id, members)?;

        tx.commit()?;
        debug!(
            "event=project_insert module=repo status=ok project_id={} members={}",
            id,
            members.len()
        );
        Ok(id)
    }

    fn get_project(&self, id: ProjectId) -> RepoResult<Option<Project>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let project = load_project(&tx, id)?;
        tx.commit()?;
        Ok(project)
    }

    fn list_projects(&self) -> RepoResult<Vec<Project>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut projects = Vec::new();
        {
            let mut stmt = tx.prepare(&format!("{PROJECT_SELECT_SQL} ORDER BY id DESC;"))?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let mut project = parse_project_row(row)?;
                project.members = load_members(&tx, project.id)?;
                projects.push(project);
            }
        }
        tx.commit()?;
        Ok(projects)
    }

    fn update_project(&self, update: &ProjectUpdate<'_>) -> RepoResult<i64> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        ensure_version(&tx, update.id, update.expected_version)?;

        tx.execute(
            "DELETE FROM members WHERE project_id = ?1;",
            [update.id],
        )?;
        insert_members(&tx, update.id, update.members)?;

        let next_version = update.expected_version + 1;
        let changed = tx.execute(
            "UPDATE projects
             SET
                title = ?2,
                date = ?3,
                courses = ?4,
                description = ?5,
                cover = ?6,
                gallery = ?7,
                version = ?8
             WHERE id = ?1
               AND version = ?9;",
            params![
                update.id,
                update.fields.title.trim(),
                update.fields.date.as_str(),
                update.fields.courses.as_str(),
                update.fields.description.as_str(),
                update.cover.map(AttachmentRef::as_str),
                encode_gallery(update.gallery)?,
                next_version,
                update.expected_version,
            ],
        )?;
        if changed == 0 {
            return Err(RepoError::NotFound(update.id));
        }

        tx.commit()?;
        Ok(next_version)
    }

    fn delete_project(&self, id: ProjectId, expected_version: i64) -> RepoResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        ensure_version(&tx, id, expected_version)?;

        tx.execute("DELETE FROM members WHERE project_id = ?1;", [id])?;
        let changed = tx.execute("DELETE FROM projects WHERE id = ?1;", [id])?;
        if changed == 0 {
            return Err(RepoError::NotFound(id));
        }

        tx.commit()?;
        Ok(())
    }

    fn record_pending_cleanup(&self, attachment: &AttachmentRef, reason: &str) -> RepoResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO pending_cleanup (attachment_ref, reason, attempts)
             VALUES (?1, ?2, 1)
             ON CONFLICT(attachment_ref) DO UPDATE SET
                reason = excluded.reason,
                attempts = pending_cleanup.attempts + 1;",
            params![attachment.as_str(), reason],
        )?;
        Ok(())
    }

    fn list_pending_cleanup(&self) -> RepoResult<Vec<PendingCleanup>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT attachment_ref, reason, attempts, recorded_at
             FROM pending_cleanup
             ORDER BY recorded_at ASC, attachment_ref ASC;",
        )?;
        let mut rows = stmt.query([])?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            let raw: String = row.get("attachment_ref")?;
            entries.push(PendingCleanup {
                attachment: parse_ref(raw, "pending_cleanup.attachment_ref")?,
                reason: row.get("reason")?,
                attempts: row.get("attempts")?,
                recorded_at: row.get("recorded_at")?,
            });
        }
        Ok(entries)
    }

    fn clear_pending_cleanup(&self, attachment: &AttachmentRef) -> RepoResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM pending_cleanup WHERE attachment_ref = ?1;",
            [attachment.as_str()],
        )?;
        Ok(())
    }
}

fn ensure_version(tx: &Transaction<'_>, id: ProjectId, expected: i64) -> RepoResult<()> {
    let actual: Option<i64> = tx
        .query_row(
            "SELECT version FROM projects WHERE id = ?1;",
            [id],
            |row| row.get(0),
        )
        .optional()?;
    match actual {
        None => Err(RepoError::NotFound(id)),
        Some(actual) if actual != expected => Err(RepoError::StaleVersion {
            id,
            expected,
            actual,
        }),
        Some(_) => Ok(()),
    }
}

fn insert_members(
    tx: &Transaction<'_>,
    project_id: ProjectId,
    members: &[Member],
) -> RepoResult<()> {
    let mut stmt = tx.prepare(MEMBER_INSERT_SQL)?;
    for (position, member) in members.iter().enumerate() {
        stmt.execute(params![
            project_id,
            member.key.to_string(),
            member.name.as_str(),
            member.titles.as_str(),
            member.email.as_str(),
            member.image.as_ref().map(AttachmentRef::as_str),
            bool_to_int(member.is_responsible),
            position as i64,
        ])?;
    }
    Ok(())
}

fn load_project(conn: &Connection, id: ProjectId) -> RepoResult<Option<Project>> {
    let mut stmt = conn.prepare(&format!("{PROJECT_SELECT_SQL} WHERE id = ?1;"))?;
    let mut rows = stmt.query([id])?;
    if let Some(row) = rows.next()? {
        let mut project = parse_project_row(row)?;
        project.members = load_members(conn, id)?;
        return Ok(Some(project));
    }
    Ok(None)
}

fn load_members(conn: &Connection, project_id: ProjectId) -> RepoResult<Vec<Member>> {
    let mut stmt = conn.prepare(
        "SELECT member_key, name, titles, email, image, is_responsible
         FROM members
         WHERE project_id = ?1
         ORDER BY position ASC, id ASC;",
    )?;
    let mut rows = stmt.query([project_id])?;
    let mut members = Vec::new();
    while let Some(row) = rows.next()? {
        members.push(parse_member_row(row)?);
    }
    Ok(members)
}

fn parse_project_row(row: &Row<'_>) -> RepoResult<Project> {
    let gallery_text: String = row.get("gallery")?;
    let cover = match row.get::<_, Option<String>>("cover")? {
        Some(value) => Some(parse_ref(value, "projects.cover")?),
        None => None,
    };

    Ok(Project {
        id: row.get("id")?,
        title: row.get("title")?,
        date: row.get("date")?,
        courses: row.get("courses")?,
        description: row.get("description")?,
        cover,
        gallery: decode_gallery(&gallery_text)?,
        members: Vec::new(),
        version: row.get("version")?,
    })
}

fn parse_member_row(row: &Row<'_>) -> RepoResult<Member> {
    let key_text: String = row.get("member_key")?;
    let key: MemberKey = Uuid::parse_str(&key_text).map_err(|_| {
        RepoError::InvalidData(format!("invalid member key `{key_text}` in members.member_key"))
    })?;

    let image = match row.get::<_, Option<String>>("image")? {
        Some(value) => Some(parse_ref(value, "members.image")?),
        None => None,
    };

    let is_responsible = match row.get::<_, i64>("is_responsible")? {
        0 => false,
        1 => true,
        other => {
            return Err(RepoError::InvalidData(format!(
                "invalid is_responsible value `{other}` in members.is_responsible"
            )));
        }
    };

    Ok(Member {
        key,
        name: row.get("name")?,
        titles: row.get("titles")?,
        email: row.get("email")?,
        image,
        is_responsible,
    })
}

fn parse_ref(value: String, column: &'static str) -> RepoResult<AttachmentRef> {
    AttachmentRef::parse(value)
        .map_err(|err| RepoError::InvalidData(format!("{err} in {column}")))
}

fn encode_gallery(gallery: &[AttachmentRef]) -> RepoResult<String> {
    serde_json::to_string(gallery)
        .map_err(|err| RepoError::InvalidData(format!("cannot encode gallery: {err}")))
}

fn decode_gallery(value: &str) -> RepoResult<Vec<AttachmentRef>> {
    if value.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(value)
        .map_err(|err| RepoError::InvalidData(format!("invalid projects.gallery `{value}`: {err}")))
}

fn bool_to_int(value: bool) -> i64 {
    if value {
        1
    } else {
        0
    }
}
