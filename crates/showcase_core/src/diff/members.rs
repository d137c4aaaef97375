//! Member-image reconciliation.
//!
//! Two contracts are supported. The positional one pairs the submitted
//! member list with a same-ordered array of previous images and hands out
//! new uploads in upload order to members without a previous image; it
//! silently misattributes images if the client reorders members between
//! load and submit. The keyed one associates previous images and uploads by
//! `MemberKey` and is immune to reordering.

use crate::diff::OrphanSet;
use crate::model::project::{AttachmentRef, Member, MemberDraft, MemberKey};
use crate::model::validation::ValidationError;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberImagePlan {
    /// One slot per submitted member, in submission order.
    pub images: Vec<Option<AttachmentRef>>,
    /// Previous member images no longer referenced by any slot.
    pub orphaned: OrphanSet,
    /// Uploads stored for this request that no slot consumed.
    pub unused_uploads: Vec<AttachmentRef>,
}

/// Positional reconciliation.
///
/// For each position `i`: a non-null `previous_per_position[i]` is kept
/// unchanged; otherwise the next unconsumed upload is assigned, or `None`
/// once uploads run out. A previous array shorter than the member list
/// treats the missing tail as null.
///
/// # Errors
/// - Same as `validate_positional_previous`.
pub fn reconcile_member_images_positional(
    member_count: usize,
    previous_per_position: &[Option<AttachmentRef>],
    uploads: &[AttachmentRef],
    owned_images: &[AttachmentRef],
) -> Result<MemberImagePlan, ValidationError> {
    validate_positional_previous(member_count, previous_per_position, owned_images)?;

    let mut queue = uploads.iter();
    let images: Vec<Option<AttachmentRef>> = (0..member_count)
        .map(|position| match previous_per_position.get(position) {
            Some(Some(previous)) => Some(previous.clone()),
            _ => queue.next().cloned(),
        })
        .collect();
    let unused_uploads: Vec<AttachmentRef> = queue.cloned().collect();

    Ok(MemberImagePlan {
        orphaned: orphans_of(owned_images, &images),
        images,
        unused_uploads,
    })
}

/// Keyed reconciliation.
///
/// For each draft: an upload addressed to its key wins; otherwise the
/// previous image of the member with the same key is kept; drafts without
/// a key, or with a key the previous state does not know, start without an
/// image unless an upload addresses them.
///
/// # Errors
/// - Same as `validate_keyed_targets`.
pub fn reconcile_member_images_keyed(
    drafts: &[MemberDraft],
    previous: &[Member],
    uploads: &[(MemberKey, AttachmentRef)],
) -> Result<MemberImagePlan, ValidationError> {
    validate_keyed_targets(drafts, uploads.iter().map(|(key, _)| *key))?;
    let upload_by_key: HashMap<MemberKey, &AttachmentRef> =
        uploads.iter().map(|(key, upload)| (*key, upload)).collect();

    let previous_by_key: HashMap<MemberKey, &AttachmentRef> = previous
        .iter()
        .filter_map(|member| member.image.as_ref().map(|image| (member.key, image)))
        .collect();

    let images: Vec<Option<AttachmentRef>> = drafts
        .iter()
        .map(|draft| {
            let key = draft.key?;
            upload_by_key
                .get(&key)
                .or_else(|| previous_by_key.get(&key))
                .map(|image| (*image).clone())
        })
        .collect();

    let owned_images: Vec<AttachmentRef> = previous
        .iter()
        .filter_map(|member| member.image.clone())
        .collect();

    Ok(MemberImagePlan {
        orphaned: orphans_of(&owned_images, &images),
        images,
        unused_uploads: Vec::new(),
    })
}

/// Checks a positional previous-image array without touching uploads.
///
/// Run before any upload is stored so a reject has no side effects.
///
/// # Errors
/// - `PreviousImagesLengthMismatch` when the previous array is longer than
///   the member list.
/// - `ForeignAttachmentRef` when a previous entry is not one of
///   `owned_images`.
/// - `DuplicateAttachmentRef` when one previous entry fills two slots.
pub fn validate_positional_previous(
    member_count: usize,
    previous_per_position: &[Option<AttachmentRef>],
    owned_images: &[AttachmentRef],
) -> Result<(), ValidationError> {
    if previous_per_position.len() > member_count {
        return Err(ValidationError::PreviousImagesLengthMismatch {
            members: member_count,
            previous: previous_per_position.len(),
        });
    }

    let owned: HashSet<&AttachmentRef> = owned_images.iter().collect();
    let mut claimed = HashSet::new();
    for previous in previous_per_position.iter().flatten() {
        if !owned.contains(previous) {
            return Err(ValidationError::ForeignAttachmentRef(previous.clone()));
        }
        if !claimed.insert(previous) {
            return Err(ValidationError::DuplicateAttachmentRef(previous.clone()));
        }
    }
    Ok(())
}

/// Checks that keyed uploads address distinct, submitted members.
///
/// # Errors
/// - `UnknownMemberKey` when an upload addresses no submitted member.
/// - `DuplicateMemberKey` when two uploads address the same member.
pub fn validate_keyed_targets(
    drafts: &[MemberDraft],
    targets: impl IntoIterator<Item = MemberKey>,
) -> Result<(), ValidationError> {
    let submitted: HashSet<MemberKey> = drafts.iter().filter_map(|draft| draft.key).collect();
    let mut addressed = HashSet::new();
    for key in targets {
        if !submitted.contains(&key) {
            return Err(ValidationError::UnknownMemberKey(key));
        }
        if !addressed.insert(key) {
            return Err(ValidationError::DuplicateMemberKey(key));
        }
    }
    Ok(())
}

fn orphans_of(owned_images: &[AttachmentRef], images: &[Option<AttachmentRef>]) -> OrphanSet {
    let still_used: HashSet<&AttachmentRef> = images.iter().flatten().collect();
    owned_images
        .iter()
        .filter(|image| !still_used.contains(image))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{reconcile_member_images_keyed, reconcile_member_images_positional};
    use crate::model::project::{AttachmentRef, MemberDraft};
    use crate::model::validation::ValidationError;
    use uuid::Uuid;

    fn r(name: &str) -> AttachmentRef {
        AttachmentRef::parse(name).unwrap()
    }

    #[test]
    fn positional_keeps_previous_and_hands_out_uploads_in_order() {
        let plan = reconcile_member_images_positional(
            3,
            &[Some(r("ana.png")), None, None],
            &[r("new1.png"), r("new2.png")],
            &[r("ana.png"), r("bo.png")],
        )
        .unwrap();

        assert_eq!(
            plan.images,
            vec![Some(r("ana.png")), Some(r("new1.png")), Some(r("new2.png"))]
        );
        assert_eq!(plan.orphaned.into_vec(), vec![r("bo.png")]);
        assert!(plan.unused_uploads.is_empty());
    }

    #[test]
    fn positional_exhausted_queue_yields_none_and_reports_unused() {
        let plan =
            reconcile_member_images_positional(2, &[None, Some(r("bo.png"))], &[], &[r("bo.png")])
                .unwrap();
        assert_eq!(plan.images, vec![None, Some(r("bo.png"))]);

        let plan = reconcile_member_images_positional(1, &[Some(r("bo.png"))], &[r("x.png")], &[
            r("bo.png"),
        ])
        .unwrap();
        assert_eq!(plan.unused_uploads, vec![r("x.png")]);
    }

    #[test]
    fn positional_short_previous_array_treats_tail_as_null() {
        let plan = reconcile_member_images_positional(2, &[], &[r("n.png")], &[]).unwrap();
        assert_eq!(plan.images, vec![Some(r("n.png")), None]);
    }

    #[test]
    fn positional_rejects_foreign_and_duplicate_refs() {
        let foreign = reconcile_member_images_positional(1, &[Some(r("other.png"))], &[], &[]);
        assert_eq!(
            foreign,
            Err(ValidationError::ForeignAttachmentRef(r("other.png")))
        );

        let duplicate = reconcile_member_images_positional(
            2,
            &[Some(r("ana.png")), Some(r("ana.png"))],
            &[],
            &[r("ana.png")],
        );
        assert_eq!(
            duplicate,
            Err(ValidationError::DuplicateAttachmentRef(r("ana.png")))
        );
    }

    #[test]
    fn positional_rejects_previous_array_longer_than_members() {
        let result = reconcile_member_images_positional(1, &[None, None], &[], &[]);
        assert!(matches!(
            result,
            Err(ValidationError::PreviousImagesLengthMismatch { .. })
        ));
    }

    #[test]
    fn keyed_survives_reordering() {
        let ana = Uuid::new_v4();
        let bo = Uuid::new_v4();
        let previous = vec![
            MemberDraft::new("Ana").with_key(ana).into_member(Some(r("ana.png"))),
            MemberDraft::new("Bo").with_key(bo).into_member(Some(r("bo.png"))),
        ];
        let drafts = vec![
            MemberDraft::new("Bo").with_key(bo),
            MemberDraft::new("Ana").with_key(ana),
        ];

        let plan = reconcile_member_images_keyed(&drafts, &previous, &[]).unwrap();
        assert_eq!(plan.images, vec![Some(r("bo.png")), Some(r("ana.png"))]);
        assert!(plan.orphaned.is_empty());
    }

    #[test]
    fn keyed_upload_replaces_previous_image_and_dropped_member_is_orphaned() {
        let ana = Uuid::new_v4();
        let bo = Uuid::new_v4();
        let previous = vec![
            MemberDraft::new("Ana").with_key(ana).into_member(Some(r("ana.png"))),
            MemberDraft::new("Bo").with_key(bo).into_member(Some(r("bo.png"))),
        ];
        let drafts = vec![MemberDraft::new("Ana").with_key(ana)];

        let plan =
            reconcile_member_images_keyed(&drafts, &previous, &[(ana, r("ana-v2.png"))]).unwrap();
        assert_eq!(plan.images, vec![Some(r("ana-v2.png"))]);
        assert_eq!(plan.orphaned.into_vec(), vec![r("ana.png"), r("bo.png")]);
    }

    #[test]
    fn keyed_rejects_upload_for_unknown_member() {
        let stranger = Uuid::new_v4();
        let drafts = vec![MemberDraft::new("Ana").with_key(Uuid::new_v4())];
        let result = reconcile_member_images_keyed(&drafts, &[], &[(stranger, r("x.png"))]);
        assert_eq!(result, Err(ValidationError::UnknownMemberKey(stranger)));
    }
}
