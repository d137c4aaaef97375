//! Client-side validation errors and member/field invariants.
//!
//! # Invariants
//! - A submitted member list has exactly one responsible member (so it is
//!   never empty).
//! - Member keys, when supplied, are unique within one submission.
//! - Validation never touches storage; rejects have zero side effects.

use crate::model::project::{AttachmentRef, MemberDraft, MemberKey, ProjectFields, ProjectId};
use std::collections::HashSet;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Rejections raised before any store or file mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Member list has no responsible member (includes the empty list).
    NoResponsibleMember,
    /// Member list has more than one responsible member.
    MultipleResponsibleMembers(usize),
    BlankMemberName { position: usize },
    DuplicateMemberKey(MemberKey),
    BlankTitle,
    InvalidProjectId(String),
    InvalidAttachmentRef(String),
    /// Encoded nested payload could not be decoded.
    MalformedPayload { field: &'static str, message: String },
    TooManyFiles {
        field: &'static str,
        max: usize,
        actual: usize,
    },
    /// Client referenced an attachment this project does not own.
    ForeignAttachmentRef(AttachmentRef),
    /// Client attached one ref to two slots.
    DuplicateAttachmentRef(AttachmentRef),
    /// Previous-image array length does not match the member list.
    PreviousImagesLengthMismatch { members: usize, previous: usize },
    /// Keyed upload targets a member not present in the submission.
    UnknownMemberKey(MemberKey),
    MissingField(&'static str),
    InvalidEmail(String),
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoResponsibleMember => {
                write!(f, "a responsible member must be designated for the project")
            }
            Self::MultipleResponsibleMembers(count) => write!(
                f,
                "a project may have only one responsible member, got {count}"
            ),
            Self::BlankMemberName { position } => {
                write!(f, "member at position {position} has a blank name")
            }
            Self::DuplicateMemberKey(key) => write!(f, "member key appears twice: {key}"),
            Self::BlankTitle => write!(f, "project title must not be blank"),
            Self::InvalidProjectId(value) => write!(f, "invalid project id: `{value}`"),
            Self::InvalidAttachmentRef(value) => write!(f, "invalid attachment ref: `{value}`"),
            Self::MalformedPayload { field, message } => {
                write!(f, "malformed `{field}` payload: {message}")
            }
            Self::TooManyFiles { field, max, actual } => write!(
                f,
                "too many `{field}` files: {actual} uploaded, at most {max} allowed"
            ),
            Self::ForeignAttachmentRef(value) => {
                write!(f, "attachment is not owned by this project: {value}")
            }
            Self::DuplicateAttachmentRef(value) => {
                write!(f, "attachment is referenced by more than one slot: {value}")
            }
            Self::PreviousImagesLengthMismatch { members, previous } => write!(
                f,
                "previous image array has {previous} entries for {members} members"
            ),
            Self::UnknownMemberKey(key) => write!(f, "upload targets unknown member: {key}"),
            Self::MissingField(field) => write!(f, "required field is missing: `{field}`"),
            Self::InvalidEmail(value) => write!(f, "invalid email address: `{value}`"),
        }
    }
}

impl Error for ValidationError {}

/// Validates one submitted member list.
///
/// # Errors
/// - `NoResponsibleMember` when no entry is responsible, including the
///   empty list.
/// - `MultipleResponsibleMembers` when more than one entry is responsible.
/// - `BlankMemberName` / `DuplicateMemberKey` for malformed entries.
pub fn validate_members(members: &[MemberDraft]) -> Result<(), ValidationError> {
    let responsible = members.iter().filter(|member| member.is_responsible).count();
    match responsible {
        0 => return Err(ValidationError::NoResponsibleMember),
        1 => {}
        count => return Err(ValidationError::MultipleResponsibleMembers(count)),
    }

    let mut seen = HashSet::new();
    for (position, member) in members.iter().enumerate() {
        if member.name.trim().is_empty() {
            return Err(ValidationError::BlankMemberName { position });
        }
        if let Some(key) = member.key {
            if !seen.insert(key) {
                return Err(ValidationError::DuplicateMemberKey(key));
            }
        }
    }

    Ok(())
}

pub fn validate_fields(fields: &ProjectFields) -> Result<(), ValidationError> {
    if fields.title.trim().is_empty() {
        return Err(ValidationError::BlankTitle);
    }
    Ok(())
}

/// Parses a textual project id as received from a path segment.
pub fn parse_project_id(value: &str) -> Result<ProjectId, ValidationError> {
    match value.trim().parse::<ProjectId>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(ValidationError::InvalidProjectId(value.to_string())),
    }
}
