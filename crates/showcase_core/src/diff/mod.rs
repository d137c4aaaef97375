//! Diff Engine: pure comparison of previous vs. requested attachment state.
//!
//! # Responsibility
//! - Compute the final gallery, cover and member images of an update.
//! - Compute the orphan set: refs the previous state owned and the final
//!   state no longer references.
//!
//! # Invariants
//! - No I/O; every function is deterministic in its inputs.
//! - Only refs present in the previous state are ever orphaned, except for
//!   uploads stored by this request that end up unattached.

mod cover;
mod gallery;
mod members;
mod orphans;

pub use cover::{diff_cover, CoverDiff};
pub use gallery::{diff_gallery, GalleryDiff};
pub use members::{
    reconcile_member_images_keyed, reconcile_member_images_positional, validate_keyed_targets,
    validate_positional_previous, MemberImagePlan,
};
pub use orphans::OrphanSet;
