//! Project and member records.
//!
//! # Responsibility
//! - Define the read model returned by the entity store.
//! - Define the request-side member draft used by create/update.
//!
//! # Invariants
//! - `gallery` order is display order.
//! - `members` order is insertion order.
//! - `version` starts at 1 and grows by one per committed update.

use crate::model::validation::ValidationError;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Store-generated project identifier.
pub type ProjectId = i64;

/// Stable member identifier, threaded through create/update payloads.
pub type MemberKey = Uuid;

/// Image name served for members without an uploaded image.
pub const DEFAULT_MEMBER_AVATAR: &str = "default-avatar.jpg";

/// Generated name of one stored attachment file.
///
/// Refs are plain file names resolvable against the flat attachment
/// namespace; construction rejects anything that could escape it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AttachmentRef(String);

impl AttachmentRef {
    /// Parses one untrusted ref value.
    ///
    /// # Errors
    /// - Returns `ValidationError::InvalidAttachmentRef` for empty values,
    ///   values containing path separators, or dot-only names.
    pub fn parse(value: impl Into<String>) -> Result<Self, ValidationError> {
        let value = value.into();
        let trimmed = value.trim();
        let is_flat = !trimmed.is_empty()
            && trimmed.len() == value.len()
            && !trimmed.contains(['/', '\\', '\0'])
            && trimmed != "."
            && trimmed != "..";
        if !is_flat {
            return Err(ValidationError::InvalidAttachmentRef(value));
        }
        Ok(Self(value))
    }

    /// Wraps a name produced by the attachment ref generator.
    pub(crate) fn from_generated(value: String) -> Self {
        Self(value)
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Display for AttachmentRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for AttachmentRef {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<AttachmentRef> for String {
    fn from(value: AttachmentRef) -> Self {
        value.0
    }
}

/// Scalar descriptive fields shared by create and update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectFields {
    pub title: String,
    pub date: String,
    pub courses: String,
    pub description: String,
}

/// Persisted participant of one project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub key: MemberKey,
    pub name: String,
    pub titles: String,
    pub email: String,
    pub image: Option<AttachmentRef>,
    pub is_responsible: bool,
}

impl Member {
    /// Image name to serve for this member.
    pub fn display_image(&self) -> &str {
        self.image
            .as_ref()
            .map_or(DEFAULT_MEMBER_AVATAR, AttachmentRef::as_str)
    }
}

/// Persisted project with its exclusively owned members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub title: String,
    pub date: String,
    pub courses: String,
    pub description: String,
    pub cover: Option<AttachmentRef>,
    pub gallery: Vec<AttachmentRef>,
    pub members: Vec<Member>,
    /// Optimistic concurrency counter checked by update/delete.
    pub version: i64,
}

impl Project {
    /// Returns every attachment this project or its members reference.
    ///
    /// Order: cover, member images in member order, gallery in display order.
    pub fn attachment_refs(&self) -> Vec<AttachmentRef> {
        let mut refs = Vec::new();
        refs.extend(self.cover.iter().cloned());
        refs.extend(self.members.iter().filter_map(|member| member.image.clone()));
        refs.extend(self.gallery.iter().cloned());
        refs
    }

    /// Returns the responsible member, if the stored set has one.
    pub fn responsible_member(&self) -> Option<&Member> {
        self.members.iter().find(|member| member.is_responsible)
    }
}

/// Request-side member entry, decoded from the encoded member list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberDraft {
    /// Stable key; absent for members the client has never seen persisted.
    #[serde(default)]
    pub key: Option<MemberKey>,
    pub name: String,
    #[serde(default)]
    pub titles: String,
    #[serde(default)]
    pub email: String,
    #[serde(default, alias = "responsible")]
    pub is_responsible: bool,
}

impl MemberDraft {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn responsible(mut self) -> Self {
        self.is_responsible = true;
        self
    }

    pub fn with_key(mut self, key: MemberKey) -> Self {
        self.key = Some(key);
        self
    }

    /// Materializes this draft into a persisted member row shape.
    ///
    /// A fresh key is generated when the draft carries none.
    pub fn into_member(self, image: Option<AttachmentRef>) -> Member {
        Member {
            key: self.key.unwrap_or_else(Uuid::new_v4),
            name: self.name.trim().to_string(),
            titles: self.titles,
            email: self.email.trim().to_string(),
            image,
            is_responsible: self.is_responsible,
        }
    }
}
