use crate::diff::OrphanSet;
use crate::model::project::AttachmentRef;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverDiff {
    pub final_cover: Option<AttachmentRef>,
    pub orphaned: OrphanSet,
}

/// A newly uploaded cover replaces (and orphans) the previous one; without
/// an upload the previous cover is retained.
pub fn diff_cover(previous: Option<&AttachmentRef>, uploaded: Option<&AttachmentRef>) -> CoverDiff {
    match uploaded {
        Some(new_cover) => CoverDiff {
            final_cover: Some(new_cover.clone()),
            orphaned: previous.cloned().into_iter().collect(),
        },
        None => CoverDiff {
            final_cover: previous.cloned(),
            orphaned: OrphanSet::new(),
        },
    }
}
