//! Domain model for showcased projects and their members.
//!
//! # Responsibility
//! - Define canonical data structures used by the catalog services.
//! - Own request-independent validation of project/member invariants.
//!
//! # Invariants
//! - Every project is identified by a stable, store-generated `ProjectId`.
//! - Every member is owned by exactly one project and carries a stable `MemberKey`.
//! - Attachment refs are flat file names, never paths.

pub mod project;
pub mod validation;
