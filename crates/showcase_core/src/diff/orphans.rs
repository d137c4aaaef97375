use crate::model::project::AttachmentRef;
use std::collections::HashSet;

/// Ordered, de-duplicated set of refs to delete after commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrphanSet {
    refs: Vec<AttachmentRef>,
    seen: HashSet<AttachmentRef>,
}

impl OrphanSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, attachment: AttachmentRef) {
        if self.seen.insert(attachment.clone()) {
            self.refs.push(attachment);
        }
    }

    pub fn contains(&self, attachment: &AttachmentRef) -> bool {
        self.seen.contains(attachment)
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    /// Drops any ref that is still referenced by the final state.
    pub fn retain_unreferenced<'a>(
        &mut self,
        still_referenced: impl IntoIterator<Item = &'a AttachmentRef>,
    ) {
        let keep: HashSet<&AttachmentRef> = still_referenced.into_iter().collect();
        self.refs.retain(|attachment| !keep.contains(attachment));
        self.seen = self.refs.iter().cloned().collect();
    }

    pub fn into_vec(self) -> Vec<AttachmentRef> {
        self.refs
    }
}

impl Extend<AttachmentRef> for OrphanSet {
    fn extend<T: IntoIterator<Item = AttachmentRef>>(&mut self, iter: T) {
        for attachment in iter {
            self.insert(attachment);
        }
    }
}

impl FromIterator<AttachmentRef> for OrphanSet {
    fn from_iter<T: IntoIterator<Item = AttachmentRef>>(iter: T) -> Self {
        let mut set = Self::new();
        set.extend(iter);
        set
    }
}
