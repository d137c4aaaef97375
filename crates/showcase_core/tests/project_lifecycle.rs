use rusqlite::Connection;
use serde_json::json;
use showcase_core::db::open_db_in_memory;
use showcase_core::{
    AttachmentRef, AttachmentStore, CreateProjectForm, DeletePolicy, DeleteProjectForm,
    KeyedUpload, MailError, Mailer, MemberKey, MemberUploads, OutboundMessage,
    ParticipationRequest, ProjectFields, ProjectId, ProjectRepository, ProjectService, Role,
    ServiceError, SqliteProjectRepository, StaticAccessGate, UpdateProjectForm, Upload,
    DEFAULT_MEMBER_AVATAR,
};
use std::collections::BTreeSet;
use std::fs;
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

const FACULTY: &str = "faculty-token";
const STUDENT: &str = "student-token";

type Service = ProjectService<SqliteProjectRepository>;

struct Harness {
    service: Service,
    _dir: TempDir,
}

fn harness() -> Harness {
    harness_with(open_db_in_memory().unwrap())
}

fn harness_with(conn: Connection) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let attachments = AttachmentStore::open(
        dir.path().join("uploads"),
        DeletePolicy {
            max_attempts: 2,
            backoff: Duration::from_millis(1),
        },
    )
    .unwrap();
    let gate = StaticAccessGate::new()
        .with_token(FACULTY, "prof.silva", Role::Faculty)
        .with_token(STUDENT, "aluno.souza", Role::Other("aluno".to_string()));
    Harness {
        service: ProjectService::new(
            SqliteProjectRepository::new(conn),
            attachments,
            Box::new(gate),
        ),
        _dir: dir,
    }
}

fn fields(title: &str) -> ProjectFields {
    ProjectFields {
        title: title.to_string(),
        date: "2024-05".to_string(),
        courses: "Engineering".to_string(),
        description: "A showcased project".to_string(),
    }
}

fn upload(name: &str) -> Upload {
    Upload::new(name, name.as_bytes().to_vec())
}

fn files_on_disk(service: &Service) -> BTreeSet<AttachmentRef> {
    fs::read_dir(service.attachments().dir())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().into_string().unwrap())
        .filter(|name| !name.starts_with('.'))
        .map(|name| AttachmentRef::parse(name).unwrap())
        .collect()
}

fn referenced(service: &Service) -> BTreeSet<AttachmentRef> {
    service
        .repository()
        .referenced_attachments()
        .unwrap()
        .into_iter()
        .collect()
}

fn assert_disk_matches_rows(service: &Service) {
    assert_eq!(files_on_disk(service), referenced(service));
}

/// Creates `Ana` (responsible) and `Bo`, each with an image, a cover and a
/// three-file gallery.
fn seed(service: &Service) -> ProjectId {
    service
        .create_project(
            Some(FACULTY),
            CreateProjectForm {
                fields: fields("Robot Arm"),
                members: json!([
                    {
                        "name": "Ana",
                        "titles": "PhD",
                        "email": "ana@uni.edu",
                        "is_responsible": true
                    },
                    {"name": "Bo", "titles": "BSc"}
                ])
                .to_string(),
                cover: Some(upload("cover.png")),
                member_images: MemberUploads::Positional(vec![upload("ana.png"), upload("bo.png")]),
                gallery: vec![upload("g1.jpg"), upload("g2.jpg"), upload("g3.jpg")],
            },
        )
        .unwrap()
        .id
}

#[test]
fn create_persists_rows_and_files_together() {
    let h = harness();
    let id = seed(&h.service);

    let project = h.service.get_project(id).unwrap();
    assert_eq!(project.version, 1);
    assert_eq!(project.members.len(), 2);
    assert_eq!(project.responsible_member().unwrap().name, "Ana");
    assert_eq!(project.gallery.len(), 3);
    assert!(project.cover.is_some());
    assert!(project.members.iter().all(|member| member.image.is_some()));
    assert_eq!(
        h.service.attachments().read(&project.gallery[0]).unwrap(),
        b"g1.jpg"
    );
    assert_disk_matches_rows(&h.service);
}

#[test]
fn member_without_upload_displays_default_avatar() {
    let h = harness();
    let outcome = h
        .service
        .create_project(
            Some(FACULTY),
            CreateProjectForm {
                fields: fields("Solo"),
                members: json!([{"name": "Ana", "is_responsible": true}, {"name": "Bo"}])
                    .to_string(),
                member_images: MemberUploads::Positional(vec![upload("ana.png")]),
                ..CreateProjectForm::default()
            },
        )
        .unwrap();

    let project = h.service.get_project(outcome.id).unwrap();
    assert_ne!(project.members[0].display_image(), DEFAULT_MEMBER_AVATAR);
    assert_eq!(project.members[1].display_image(), DEFAULT_MEMBER_AVATAR);
}

#[test]
fn gallery_update_removes_requested_refs_and_appends_uploads() {
    let h = harness();
    let id = seed(&h.service);
    let before = h.service.get_project(id).unwrap();
    let (g1, g2, g3) = (
        before.gallery[0].clone(),
        before.gallery[1].clone(),
        before.gallery[2].clone(),
    );

    let outcome = h
        .service
        .update_project(
            Some(FACULTY),
            UpdateProjectForm {
                id,
                fields: fields("Robot Arm"),
                members: json!([
                    {
                        "key": before.members[0].key,
                        "name": "Ana",
                        "titles": "PhD",
                        "email": "ana@uni.edu",
                        "is_responsible": true
                    },
                    {"key": before.members[1].key, "name": "Bo", "titles": "BSc"}
                ])
                .to_string(),
                previous_member_images: json!([before.members[0].image, before.members[1].image])
                    .to_string(),
                gallery_remove: json!([g2, "not-in-this-gallery.png"]).to_string(),
                gallery: vec![upload("g4.jpg")],
                ..UpdateProjectForm::default()
            },
        )
        .unwrap();

    assert_eq!(outcome.version, 2);
    assert_eq!(outcome.cleanup.deleted, vec![g2.clone()]);
    let after = h.service.get_project(id).unwrap();
    assert_eq!(after.gallery.len(), 3);
    assert_eq!(&after.gallery[..2], &[g1, g3]);
    assert!(!h.service.attachments().exists(&g2));
    assert_eq!(after.members, before.members);
    assert_disk_matches_rows(&h.service);
}

#[test]
fn cover_replacement_orphans_previous_cover_only_after_commit() {
    let h = harness();
    let id = seed(&h.service);
    let before = h.service.get_project(id).unwrap();
    let old_cover = before.cover.clone().unwrap();

    let outcome = h
        .service
        .update_project(
            Some(FACULTY),
            UpdateProjectForm {
                id,
                fields: fields("Robot Arm v2"),
                members: json!([{"name": "Ana", "is_responsible": true}]).to_string(),
                cover: Some(upload("cover2.png")),
                ..UpdateProjectForm::default()
            },
        )
        .unwrap();

    assert!(outcome.cleanup.deleted.contains(&old_cover));
    let after = h.service.get_project(id).unwrap();
    assert_eq!(after.title, "Robot Arm v2");
    assert_ne!(after.cover, Some(old_cover));
    assert_eq!(after.gallery, before.gallery);
    assert_eq!(after.members.len(), 1);
    assert_eq!(after.members[0].image, None);
    assert_disk_matches_rows(&h.service);
}

#[test]
fn positional_update_keeps_previous_images_and_assigns_uploads_in_order() {
    let h = harness();
    let id = seed(&h.service);
    let before = h.service.get_project(id).unwrap();
    let ana_image = before.members[0].image.clone().unwrap();
    let bo_image = before.members[1].image.clone().unwrap();

    let outcome = h
        .service
        .update_project(
            Some(FACULTY),
            UpdateProjectForm {
                id,
                fields: fields("Robot Arm"),
                members: json!([
                    {"name": "Ana", "is_responsible": true},
                    {"name": "Cy"},
                    {"name": "Di"}
                ])
                .to_string(),
                previous_member_images: json!([ana_image, null]).to_string(),
                member_images: MemberUploads::Positional(vec![upload("cy.png")]),
                ..UpdateProjectForm::default()
            },
        )
        .unwrap();

    let after = h.service.get_project(id).unwrap();
    assert_eq!(after.members[0].image.as_ref(), Some(&ana_image));
    let cy_image = after.members[1].image.clone().unwrap();
    assert_eq!(h.service.attachments().read(&cy_image).unwrap(), b"cy.png");
    assert_eq!(after.members[2].image, None);
    assert_eq!(outcome.cleanup.deleted, vec![bo_image.clone()]);
    assert!(!h.service.attachments().exists(&bo_image));
    assert_disk_matches_rows(&h.service);
}

#[test]
fn keyed_update_survives_member_reordering() {
    let h = harness();
    let id = seed(&h.service);
    let before = h.service.get_project(id).unwrap();
    let ana = before.members[0].clone();
    let bo = before.members[1].clone();
    let newcomer: MemberKey = Uuid::new_v4();

    let outcome = h
        .service
        .update_project(
            Some(FACULTY),
            UpdateProjectForm {
                id,
                expected_version: Some(before.version),
                fields: fields("Robot Arm"),
                members: json!([
                    {"key": newcomer, "name": "Eve"},
                    {"key": bo.key, "name": "Bo", "is_responsible": true},
                    {"key": ana.key, "name": "Ana"}
                ])
                .to_string(),
                member_images: MemberUploads::Keyed(vec![
                    KeyedUpload {
                        key: ana.key,
                        upload: upload("ana-new.png"),
                    },
                    KeyedUpload {
                        key: newcomer,
                        upload: upload("eve.png"),
                    },
                ]),
                ..UpdateProjectForm::default()
            },
        )
        .unwrap();

    let after = h.service.get_project(id).unwrap();
    let names: Vec<_> = after.members.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, vec!["Eve", "Bo", "Ana"]);
    assert_eq!(after.members[1].key, bo.key);
    assert_eq!(after.members[1].image, bo.image);
    assert_eq!(after.members[2].key, ana.key);
    let ana_new = after.members[2].image.clone().unwrap();
    assert_eq!(h.service.attachments().read(&ana_new).unwrap(), b"ana-new.png");
    let eve = after.members[0].image.clone().unwrap();
    assert_eq!(h.service.attachments().read(&eve).unwrap(), b"eve.png");
    assert_eq!(outcome.cleanup.deleted, vec![ana.image.unwrap()]);
    assert_disk_matches_rows(&h.service);
}

#[test]
fn delete_removes_rows_and_every_owned_file() {
    let h = harness();
    let id = seed(&h.service);
    let owned = h.service.get_project(id).unwrap().attachment_refs();

    let outcome = h
        .service
        .delete_project(Some(FACULTY), DeleteProjectForm::new(id))
        .unwrap();

    assert_eq!(outcome.cleanup.deleted.len(), owned.len());
    assert!(matches!(
        h.service.get_project(id),
        Err(ServiceError::NotFound(_))
    ));
    assert!(files_on_disk(&h.service).is_empty());
}

#[test]
fn validation_rejects_have_no_side_effects() {
    let h = harness();
    let id = seed(&h.service);
    let before = h.service.get_project(id).unwrap();
    let disk_before = files_on_disk(&h.service);

    let two_responsible = h
        .service
        .update_project(
            Some(FACULTY),
            UpdateProjectForm {
                id,
                fields: fields("Changed"),
                members: json!([
                    {"name": "Ana", "is_responsible": true},
                    {"name": "Bo", "is_responsible": true}
                ])
                .to_string(),
                cover: Some(upload("cover2.png")),
                gallery_remove: json!([before.gallery[0]]).to_string(),
                ..UpdateProjectForm::default()
            },
        )
        .unwrap_err();
    assert_eq!(two_responsible.status_code(), 400);

    let empty_members = h
        .service
        .update_project(
            Some(FACULTY),
            UpdateProjectForm {
                id,
                fields: fields("Changed"),
                members: "[]".to_string(),
                gallery: vec![upload("g9.jpg")],
                ..UpdateProjectForm::default()
            },
        )
        .unwrap_err();
    assert_eq!(empty_members.status_code(), 400);

    let malformed = h
        .service
        .update_project(
            Some(FACULTY),
            UpdateProjectForm {
                id,
                fields: fields("Changed"),
                members: "{not json".to_string(),
                ..UpdateProjectForm::default()
            },
        )
        .unwrap_err();
    assert_eq!(malformed.status_code(), 400);

    let foreign_previous = h
        .service
        .update_project(
            Some(FACULTY),
            UpdateProjectForm {
                id,
                fields: fields("Changed"),
                members: json!([{"name": "Ana", "is_responsible": true}]).to_string(),
                previous_member_images: json!(["someone-elses.png"]).to_string(),
                member_images: MemberUploads::Positional(vec![upload("x.png")]),
                ..UpdateProjectForm::default()
            },
        )
        .unwrap_err();
    assert_eq!(foreign_previous.status_code(), 400);

    let too_many = h
        .service
        .create_project(
            Some(FACULTY),
            CreateProjectForm {
                fields: fields("Big"),
                members: json!([{"name": "Ana", "is_responsible": true}]).to_string(),
                gallery: (0..11).map(|n| upload(&format!("g{n}.jpg"))).collect(),
                ..CreateProjectForm::default()
            },
        )
        .unwrap_err();
    assert_eq!(too_many.status_code(), 400);

    assert_eq!(h.service.get_project(id).unwrap(), before);
    assert_eq!(h.service.list_projects().unwrap().len(), 1);
    assert_eq!(files_on_disk(&h.service), disk_before);
}

#[test]
fn mutations_require_privileged_principal() {
    let h = harness();
    let id = seed(&h.service);
    let form = || CreateProjectForm {
        fields: fields("Nope"),
        members: json!([{"name": "Ana", "is_responsible": true}]).to_string(),
        cover: Some(upload("c.png")),
        ..CreateProjectForm::default()
    };

    assert_eq!(
        h.service.create_project(None, form()).unwrap_err().status_code(),
        401
    );
    assert_eq!(
        h.service
            .create_project(Some("forged"), form())
            .unwrap_err()
            .status_code(),
        401
    );
    assert_eq!(
        h.service
            .create_project(Some(STUDENT), form())
            .unwrap_err()
            .status_code(),
        403
    );
    assert_eq!(
        h.service
            .delete_project(Some(STUDENT), DeleteProjectForm::new(id))
            .unwrap_err()
            .status_code(),
        403
    );

    assert_eq!(h.service.list_projects().unwrap().len(), 1);
    assert_disk_matches_rows(&h.service);
}

#[test]
fn missing_and_malformed_ids_map_to_not_found_and_client_error() {
    let h = harness();
    assert_eq!(
        h.service.get_project_by_text("abc").unwrap_err().status_code(),
        400
    );
    assert_eq!(
        h.service.get_project_by_text("999").unwrap_err().status_code(),
        404
    );
    assert_eq!(
        h.service
            .delete_project(Some(FACULTY), DeleteProjectForm::new(999))
            .unwrap_err()
            .status_code(),
        404
    );
}

#[test]
fn update_of_unknown_project_is_not_found_and_stores_nothing() {
    let h = harness();
    let err = h
        .service
        .update_project(
            Some(FACULTY),
            UpdateProjectForm {
                id: 999,
                fields: fields("Ghost"),
                members: json!([{"name": "Ana", "is_responsible": true}]).to_string(),
                cover: Some(upload("cover.png")),
                member_images: MemberUploads::Positional(vec![upload("ana.png")]),
                gallery: vec![upload("g1.jpg")],
                ..UpdateProjectForm::default()
            },
        )
        .unwrap_err();

    assert!(matches!(err, ServiceError::NotFound(999)));
    assert_eq!(err.status_code(), 404);
    assert!(h.service.list_projects().unwrap().is_empty());
    assert!(files_on_disk(&h.service).is_empty());
}

#[test]
fn create_without_exactly_one_responsible_stores_nothing() {
    let h = harness();
    let member_lists = [
        json!([{"name": "Ana"}, {"name": "Bo"}]),
        json!([
            {"name": "Ana", "is_responsible": true},
            {"name": "Bo", "is_responsible": true}
        ]),
    ];

    for members in member_lists {
        let err = h
            .service
            .create_project(
                Some(FACULTY),
                CreateProjectForm {
                    fields: fields("Robot Arm"),
                    members: members.to_string(),
                    cover: Some(upload("cover.png")),
                    member_images: MemberUploads::Positional(vec![
                        upload("ana.png"),
                        upload("bo.png"),
                    ]),
                    gallery: vec![upload("g1.jpg"), upload("g2.jpg")],
                },
            )
            .unwrap_err();
        assert_eq!(err.status_code(), 400, "{members}");
    }

    assert!(h.service.list_projects().unwrap().is_empty());
    assert!(files_on_disk(&h.service).is_empty());
}

#[test]
fn stale_expected_version_is_a_conflict_without_side_effects() {
    let h = harness();
    let id = seed(&h.service);
    let before = h.service.get_project(id).unwrap();
    let disk_before = files_on_disk(&h.service);

    let err = h
        .service
        .update_project(
            Some(FACULTY),
            UpdateProjectForm {
                id,
                expected_version: Some(before.version + 1),
                fields: fields("Changed"),
                members: json!([{"name": "Ana", "is_responsible": true}]).to_string(),
                gallery_remove: json!(before.gallery).to_string(),
                ..UpdateProjectForm::default()
            },
        )
        .unwrap_err();
    assert!(matches!(err, ServiceError::Conflict { .. }));
    assert_eq!(err.status_code(), 409);

    let delete_err = h
        .service
        .delete_project(
            Some(FACULTY),
            DeleteProjectForm {
                id,
                expected_version: Some(before.version + 5),
            },
        )
        .unwrap_err();
    assert_eq!(delete_err.status_code(), 409);

    assert_eq!(h.service.get_project(id).unwrap(), before);
    assert_eq!(files_on_disk(&h.service), disk_before);
}

#[test]
fn aborted_transaction_keeps_committed_state_and_its_files() {
    let conn = open_db_in_memory().unwrap();
    conn.execute_batch(
        "CREATE TRIGGER reject_boom_member
         BEFORE INSERT ON members
         WHEN NEW.name = 'boom'
         BEGIN
            SELECT RAISE(ABORT, 'member rejected');
         END;",
    )
    .unwrap();
    let h = harness_with(conn);
    let id = seed(&h.service);
    let before = h.service.get_project(id).unwrap();

    let err = h
        .service
        .update_project(
            Some(FACULTY),
            UpdateProjectForm {
                id,
                fields: fields("Changed"),
                members: json!([
                    {"name": "Ana", "is_responsible": true},
                    {"name": "boom"}
                ])
                .to_string(),
                cover: Some(upload("cover2.png")),
                gallery_remove: json!(before.gallery).to_string(),
                ..UpdateProjectForm::default()
            },
        )
        .unwrap_err();
    assert!(matches!(err, ServiceError::Transaction(_)));
    assert_eq!(err.status_code(), 500);

    assert_eq!(h.service.get_project(id).unwrap(), before);
    for attachment in before.attachment_refs() {
        assert!(h.service.attachments().exists(&attachment), "{attachment}");
    }
    // The uploaded replacement cover stays on disk, unreferenced.
    assert_eq!(files_on_disk(&h.service).len(), referenced(&h.service).len() + 1);
}

#[test]
fn undeletable_orphan_is_escalated_to_ledger_and_retried() {
    let h = harness();
    let id = seed(&h.service);
    let old_cover = h.service.get_project(id).unwrap().cover.unwrap();
    let cover_path = h.service.attachments().path_of(&old_cover);
    fs::remove_file(&cover_path).unwrap();
    fs::create_dir(&cover_path).unwrap();

    let outcome = h
        .service
        .update_project(
            Some(FACULTY),
            UpdateProjectForm {
                id,
                fields: fields("Robot Arm"),
                members: json!([{"name": "Ana", "is_responsible": true}]).to_string(),
                cover: Some(upload("cover2.png")),
                ..UpdateProjectForm::default()
            },
        )
        .unwrap();
    assert_eq!(outcome.cleanup.escalated, vec![old_cover.clone()]);
    assert!(!outcome.cleanup.is_clean());

    let pending = h.service.repository().list_pending_cleanup().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attachment, old_cover);

    let still_stuck = h.service.retry_pending_cleanup().unwrap();
    assert_eq!(still_stuck.escalated, vec![old_cover.clone()]);
    assert_eq!(
        h.service.repository().list_pending_cleanup().unwrap()[0].attempts,
        2
    );

    fs::remove_dir(&cover_path).unwrap();
    let retried = h.service.retry_pending_cleanup().unwrap();
    assert_eq!(retried.already_missing, vec![old_cover]);
    assert!(h.service.repository().list_pending_cleanup().unwrap().is_empty());
}

#[derive(Default)]
struct RecordingMailer {
    sent: Mutex<Vec<OutboundMessage>>,
}

impl Mailer for RecordingMailer {
    fn send(&self, message: &OutboundMessage) -> Result<(), MailError> {
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

struct FailingMailer;

impl Mailer for FailingMailer {
    fn send(&self, _message: &OutboundMessage) -> Result<(), MailError> {
        Err(MailError("smtp unreachable".to_string()))
    }
}

fn participation() -> ParticipationRequest {
    ParticipationRequest {
        project_title: "Robot Arm".to_string(),
        responsible_email: "ana@uni.edu".to_string(),
        requester_name: "Caio".to_string(),
        requester_email: "caio@mail.com".to_string(),
        message: "Can I help?".to_string(),
    }
}

#[test]
fn participation_request_is_relayed_through_mailer() {
    let h = harness();
    let mailer = std::sync::Arc::new(RecordingMailer::default());

    struct Shared(std::sync::Arc<RecordingMailer>);
    impl Mailer for Shared {
        fn send(&self, message: &OutboundMessage) -> Result<(), MailError> {
            self.0.send(message)
        }
    }

    let service = h.service.with_mailer(Box::new(Shared(mailer.clone())));
    service.request_participation(&participation()).unwrap();

    let sent = mailer.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "ana@uni.edu");
    assert_eq!(sent[0].reply_to, "caio@mail.com");
}

#[test]
fn participation_failures_map_to_client_and_server_errors() {
    let h = harness();
    let mut incomplete = participation();
    incomplete.message = String::new();
    assert_eq!(
        h.service
            .request_participation(&incomplete)
            .unwrap_err()
            .status_code(),
        400
    );

    let unconfigured = h.service.request_participation(&participation()).unwrap_err();
    assert!(matches!(unconfigured, ServiceError::Notification(_)));

    let service = h.service.with_mailer(Box::new(FailingMailer));
    let err = service.request_participation(&participation()).unwrap_err();
    assert!(matches!(err, ServiceError::Notification(_)));
    assert_eq!(err.status_code(), 500);
}
