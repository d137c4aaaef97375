use crate::diff::OrphanSet;
use crate::model::project::AttachmentRef;
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GalleryDiff {
    /// Kept refs in previous order, then uploads in upload order.
    pub final_gallery: Vec<AttachmentRef>,
    /// `previous \ kept`, in previous order.
    pub orphaned: OrphanSet,
}

/// Merges a removal request and new uploads into the previous gallery.
///
/// Entries of `remove_set` that the previous gallery does not contain are
/// ignored.
pub fn diff_gallery(
    previous: &[AttachmentRef],
    remove_set: &[AttachmentRef],
    uploaded: &[AttachmentRef],
) -> GalleryDiff {
    let remove: HashSet<&AttachmentRef> = remove_set.iter().collect();
    let (kept, removed): (Vec<_>, Vec<_>) = previous
        .iter()
        .cloned()
        .partition(|attachment| !remove.contains(attachment));

    let mut final_gallery = kept;
    final_gallery.extend(uploaded.iter().cloned());

    GalleryDiff {
        final_gallery,
        orphaned: removed.into_iter().collect(),
    }
}
