//! Attachment Manager: flat, write-once file storage for uploaded bytes.
//!
//! # Responsibility
//! - Store uploaded bytes under freshly generated, never-reused refs.
//! - Delete refs best-effort with bounded retry and escalation.
//!
//! # Invariants
//! - A ref names exactly one file directly under the attachment directory.
//! - `store` never overwrites an existing file.
//! - `delete` never reports failure as an error; it returns an outcome.

mod naming;
mod store;

pub use naming::{generate_ref, normalize_extension};
pub use store::{AttachmentError, AttachmentResult, AttachmentStore, DeleteOutcome, DeletePolicy};
