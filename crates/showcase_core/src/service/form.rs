//! Request forms and decoding of their encoded nested fields.
//!
//! # Responsibility
//! - Carry scalar fields, encoded nested structures and uploaded files for
//!   create/update requests.
//! - Decode encoded member lists and ref arrays into typed values.
//!
//! # Invariants
//! - Decoding is pure; malformed input becomes `ValidationError::MalformedPayload`.
//! - A blank encoded value decodes as an empty list.

use crate::model::project::{AttachmentRef, MemberDraft, MemberKey, ProjectFields, ProjectId};
use crate::model::validation::ValidationError;
use serde::de::DeserializeOwned;

/// Maximum gallery files accepted by one request.
pub const MAX_GALLERY_UPLOADS: usize = 10;

pub const FIELD_MEMBERS: &str = "members";
pub const FIELD_PREVIOUS_MEMBER_IMAGES: &str = "previous_member_images";
pub const FIELD_GALLERY_REMOVE: &str = "gallery_remove";
pub const FIELD_GALLERY: &str = "gallery";

/// One uploaded file as received with the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    pub original_name: String,
    pub bytes: Vec<u8>,
}

impl Upload {
    pub fn new(original_name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            original_name: original_name.into(),
            bytes: bytes.into(),
        }
    }
}

/// Upload addressed to one member by stable key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyedUpload {
    pub key: MemberKey,
    pub upload: Upload,
}

/// How member images travel with a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberUploads {
    /// Consumed in upload order by members without a previous image.
    Positional(Vec<Upload>),
    /// Addressed by member key; reordering-safe.
    Keyed(Vec<KeyedUpload>),
}

impl Default for MemberUploads {
    fn default() -> Self {
        Self::Positional(Vec::new())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateProjectForm {
    pub fields: ProjectFields,
    /// Encoded (JSON) member list.
    pub members: String,
    pub cover: Option<Upload>,
    pub member_images: MemberUploads,
    pub gallery: Vec<Upload>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateProjectForm {
    pub id: ProjectId,
    /// Version the client loaded; the snapshot version is used when absent.
    pub expected_version: Option<i64>,
    pub fields: ProjectFields,
    /// Encoded (JSON) member list.
    pub members: String,
    /// Encoded (JSON) array of nullable refs, one per member position.
    /// Only consulted for positional member uploads.
    pub previous_member_images: String,
    /// Encoded (JSON) array of gallery refs to remove.
    pub gallery_remove: String,
    pub cover: Option<Upload>,
    pub member_images: MemberUploads,
    pub gallery: Vec<Upload>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteProjectForm {
    pub id: ProjectId,
    /// Version the client loaded; the snapshot version is used when absent.
    pub expected_version: Option<i64>,
}

impl DeleteProjectForm {
    pub fn new(id: ProjectId) -> Self {
        Self {
            id,
            expected_version: None,
        }
    }
}

pub fn decode_members(encoded: &str) -> Result<Vec<MemberDraft>, ValidationError> {
    decode_list(FIELD_MEMBERS, encoded)
}

pub fn decode_previous_member_images(
    encoded: &str,
) -> Result<Vec<Option<AttachmentRef>>, ValidationError> {
    decode_list(FIELD_PREVIOUS_MEMBER_IMAGES, encoded)
}

pub fn decode_gallery_remove(encoded: &str) -> Result<Vec<AttachmentRef>, ValidationError> {
    decode_list(FIELD_GALLERY_REMOVE, encoded)
}

pub fn check_upload_limits(gallery: &[Upload]) -> Result<(), ValidationError> {
    if gallery.len() > MAX_GALLERY_UPLOADS {
        return Err(ValidationError::TooManyFiles {
            field: FIELD_GALLERY,
            max: MAX_GALLERY_UPLOADS,
            actual: gallery.len(),
        });
    }
    Ok(())
}

fn decode_list<T: DeserializeOwned>(
    field: &'static str,
    encoded: &str,
) -> Result<Vec<T>, ValidationError> {
    if encoded.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(encoded).map_err(|err| ValidationError::MalformedPayload {
        field,
        message: err.to_string(),
    })
}
