use std::sync::Arc;

use ftrack_core::{
    Actor, DepartmentEventFields, EventFields, EventRole, FacultyEventFields, FacultyMember,
    ModerationState, NewFlaggedEvent, OwnerKey, SourceEvent, SourceKind,
};
use ftrack_ledger::{FixedAnswer, Ledger, LedgerAction, LedgerError, LedgerOutcome};
use ftrack_storage::{EventBackend, FailPoint, MemoryBackend, MoveError};

const YES: FixedAnswer = FixedAnswer(true);

fn bootcamp() -> FacultyEventFields {
    FacultyEventFields {
        faculty_id: 2,
        title: "AI Bootcamp".into(),
        event_type: "Workshop".into(),
        from_date: Some("2024-01-10".into()),
        to_date: Some("2024-01-12".into()),
        participants: Some(40),
        event_role: EventRole::Organized,
        remarks: Some("hands-on labs".into()),
        attachments: vec!["https://files.example/faculty-events/7/poster.png".into()],
    }
}

fn seeded() -> (Arc<MemoryBackend>, Ledger) {
    let backend = Arc::new(MemoryBackend::new().with_faculty([FacultyMember {
        id: 2,
        faculty_id: "F002".into(),
        name: "Asha Rao".into(),
        email: "asha@example.edu".into(),
        school: None,
        department: Some("CSE".into()),
        mobile: None,
        gender: None,
    }]));
    backend
        .seed([EventFields::Faculty(bootcamp()).into_event(7)])
        .expect("seed");
    let ledger = Ledger::new(backend.clone());
    (backend, ledger)
}

#[tokio::test]
async fn flagging_moves_the_row_out_of_the_active_table() {
    let (backend, ledger) = seeded();

    let flagged = ledger
        .flag(&Actor::Admin, SourceKind::Faculty, 7, "incomplete data", None, &YES)
        .await
        .expect("flag");

    assert_eq!(flagged.event_id, 7);
    assert!(!flagged.unflag_requested);
    assert_eq!(flagged.admin_comment, "incomplete data");
    assert_eq!(flagged.owner(), OwnerKey { kind: SourceKind::Faculty, id: 2 });
    assert!(backend.get_event(SourceKind::Faculty, 7).await.unwrap().is_none());
    assert_eq!(backend.list_flagged(None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn unflag_round_trip_restores_identical_row() {
    let (backend, ledger) = seeded();
    let mut revisions = ledger.subscribe();
    let original = backend.get_event(SourceKind::Faculty, 7).await.unwrap().unwrap();

    let flagged = ledger
        .flag(&Actor::Admin, SourceKind::Faculty, 7, "incomplete data", None, &YES)
        .await
        .unwrap();
    let requested = ledger
        .request_unflag(&Actor::Faculty(2), flagged.id, "fixed now", &YES)
        .await
        .unwrap();
    assert_eq!(requested.state(), ModerationState::UnflagRequested);
    assert_eq!(requested.owner_comment.as_deref(), Some("fixed now"));

    let restored = ledger
        .approve_unflag(&Actor::Admin, flagged.id, &YES)
        .await
        .unwrap();
    assert_eq!(restored.id(), 7);
    assert_eq!(restored.fields(), original.fields());

    let active = backend.get_event(SourceKind::Faculty, 7).await.unwrap().unwrap();
    assert_eq!(active.fields(), original.fields());
    assert!(backend.list_flagged(None).await.unwrap().is_empty());

    assert!(revisions.has_changed().unwrap());
    assert_eq!(*revisions.borrow_and_update(), 3);
    assert_eq!(ledger.revision(), 3);
}

#[tokio::test]
async fn second_unflag_request_is_rejected() {
    let (_backend, ledger) = seeded();
    let flagged = ledger
        .flag(&Actor::Admin, SourceKind::Faculty, 7, "incomplete data", None, &YES)
        .await
        .unwrap();
    ledger
        .request_unflag(&Actor::Faculty(2), flagged.id, "fixed now", &YES)
        .await
        .unwrap();

    let err = ledger
        .request_unflag(&Actor::Faculty(2), flagged.id, "really fixed", &YES)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidTransition(_)));
}

#[tokio::test]
async fn only_the_owner_may_request_unflag() {
    let (_backend, ledger) = seeded();
    let flagged = ledger
        .flag(&Actor::Admin, SourceKind::Faculty, 7, "incomplete data", None, &YES)
        .await
        .unwrap();

    let err = ledger
        .request_unflag(&Actor::Faculty(5), flagged.id, "not mine", &YES)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Forbidden(_)));

    let err = ledger
        .request_unflag(&Actor::Department(2), flagged.id, "wrong kind", &YES)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Forbidden(_)));
}

#[tokio::test]
async fn approve_needs_a_pending_request_and_runs_once() {
    let (backend, ledger) = seeded();
    let flagged = ledger
        .flag(&Actor::Admin, SourceKind::Faculty, 7, "incomplete data", None, &YES)
        .await
        .unwrap();

    let err = ledger.approve_unflag(&Actor::Admin, flagged.id, &YES).await.unwrap_err();
    assert!(matches!(err, LedgerError::InvalidTransition(_)));

    ledger
        .request_unflag(&Actor::Faculty(2), flagged.id, "fixed now", &YES)
        .await
        .unwrap();
    ledger.approve_unflag(&Actor::Admin, flagged.id, &YES).await.unwrap();

    let err = ledger.approve_unflag(&Actor::Admin, flagged.id, &YES).await.unwrap_err();
    assert!(matches!(err, LedgerError::NotFound { .. }));
    assert_eq!(backend.list_events(SourceKind::Faculty, None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn declined_confirmation_changes_nothing() {
    let (backend, ledger) = seeded();
    let err = ledger
        .flag(&Actor::Admin, SourceKind::Faculty, 7, "incomplete data", None, &FixedAnswer(false))
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerError::NotConfirmed { action: "flag" }));
    assert!(backend.get_event(SourceKind::Faculty, 7).await.unwrap().is_some());
    assert!(backend.list_flagged(None).await.unwrap().is_empty());
    assert_eq!(ledger.revision(), 0);
}

#[tokio::test]
async fn failed_insert_aborts_the_flag() {
    let (backend, ledger) = seeded();
    backend.fail_next(FailPoint::InsertFlagged).unwrap();

    let err = ledger
        .flag(&Actor::Admin, SourceKind::Faculty, 7, "incomplete data", None, &YES)
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerError::Storage(_)));
    assert!(backend.get_event(SourceKind::Faculty, 7).await.unwrap().is_some());
    assert!(backend.list_flagged(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_delete_reports_partial_move() {
    let (backend, ledger) = seeded();
    backend.fail_next(FailPoint::DeleteEvent).unwrap();

    let err = ledger
        .flag(&Actor::Admin, SourceKind::Faculty, 7, "incomplete data", None, &YES)
        .await
        .unwrap_err();

    assert_eq!(err.code(), "partial_move");
    assert!(err.to_string().contains("manual resolution required"));
    assert!(backend.get_event(SourceKind::Faculty, 7).await.unwrap().is_some());
    assert_eq!(backend.list_flagged(None).await.unwrap().len(), 1);
    assert_eq!(ledger.revision(), 1);
}

#[tokio::test]
async fn owners_delete_their_own_rows_only() {
    let (backend, ledger) = seeded();

    let err = ledger
        .delete_active(&Actor::Faculty(3), SourceKind::Faculty, 7, &YES)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Forbidden(_)));

    ledger
        .delete_active(&Actor::Faculty(2), SourceKind::Faculty, 7, &YES)
        .await
        .unwrap();
    assert!(backend.get_event(SourceKind::Faculty, 7).await.unwrap().is_none());

    let err = ledger
        .delete_active(&Actor::Admin, SourceKind::Faculty, 7, &YES)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::NotFound { .. }));
}

#[tokio::test]
async fn flagged_rows_can_be_deleted_by_admin() {
    let (backend, ledger) = seeded();
    let flagged = ledger
        .flag(&Actor::Admin, SourceKind::Faculty, 7, "duplicate", None, &YES)
        .await
        .unwrap();

    let err = ledger
        .delete_flagged(&Actor::Faculty(2), flagged.id, &YES)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Forbidden(_)));

    ledger.delete_flagged(&Actor::Admin, flagged.id, &YES).await.unwrap();
    assert!(backend.list_flagged(None).await.unwrap().is_empty());
    assert!(backend.get_event(SourceKind::Faculty, 7).await.unwrap().is_none());
}

#[tokio::test]
async fn department_events_are_created_updated_and_imported() {
    let backend = Arc::new(MemoryBackend::new());
    let ledger = Ledger::new(backend.clone());
    let actor = Actor::Department(3);
    let draft = DepartmentEventFields {
        department_id: 3,
        title: "Hack Night".into(),
        event_type: "Hackathon".into(),
        coordinator_name: "R. Iyer".into(),
        from_date: Some("2024-09-02".into()),
        to_date: Some("2024-09-03".into()),
        participants: Some(80),
        location: "Lab 4".into(),
        output: None,
        attachments: Some("https://drive.example/hack".into()),
        certificate_link: None,
    };

    let created = ledger
        .create_event(&actor, EventFields::Department(draft.clone()), &YES)
        .await
        .unwrap();

    let mut edited = draft.clone();
    edited.participants = Some(95);
    let updated = ledger
        .update_department_event(&actor, created.id(), edited, &YES)
        .await
        .unwrap();
    match &updated {
        SourceEvent::Department(e) => assert_eq!(e.fields.participants, Some(95)),
        other => panic!("unexpected row {other:?}"),
    }

    let outcome = ledger
        .dispatch(
            &actor,
            LedgerAction::ImportDepartmentEvents {
                rows: vec![draft.clone(), draft],
            },
            &YES,
        )
        .await
        .unwrap();
    match outcome {
        LedgerOutcome::Created(rows) => assert_eq!(rows.len(), 2),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(backend.list_events(SourceKind::Department, Some(3)).await.unwrap().len(), 3);
}

async fn pending_unflag(ledger: &Ledger) -> i64 {
    let flagged = ledger
        .flag(&Actor::Admin, SourceKind::Faculty, 7, "incomplete data", None, &YES)
        .await
        .unwrap();
    ledger
        .request_unflag(&Actor::Faculty(2), flagged.id, "fixed now", &YES)
        .await
        .unwrap();
    flagged.id
}

#[tokio::test]
async fn failed_restore_write_keeps_the_flagged_row() {
    let (backend, ledger) = seeded();
    let flagged_id = pending_unflag(&ledger).await;
    backend.fail_next(FailPoint::UpsertEvent).unwrap();

    let err = ledger.approve_unflag(&Actor::Admin, flagged_id, &YES).await.unwrap_err();

    assert!(matches!(err, LedgerError::Storage(_)));
    assert!(backend.get_event(SourceKind::Faculty, 7).await.unwrap().is_none());
    let left = backend.get_flagged(flagged_id).await.unwrap().expect("flagged row kept");
    assert_eq!(left.state(), ModerationState::UnflagRequested);
    assert_eq!(ledger.revision(), 2);

    ledger.approve_unflag(&Actor::Admin, flagged_id, &YES).await.unwrap();
    assert!(backend.get_event(SourceKind::Faculty, 7).await.unwrap().is_some());
}

#[tokio::test]
async fn failed_flagged_delete_on_approve_reports_partial_move() {
    let (backend, ledger) = seeded();
    let flagged_id = pending_unflag(&ledger).await;
    backend.fail_next(FailPoint::DeleteFlagged).unwrap();

    let err = ledger.approve_unflag(&Actor::Admin, flagged_id, &YES).await.unwrap_err();

    assert_eq!(err.code(), "partial_move");
    match &err {
        LedgerError::PartialMove(MoveError::Incomplete {
            written_table,
            origin_table,
            origin_id,
            ..
        }) => {
            assert_eq!(*written_table, "faculty_events");
            assert_eq!(*origin_table, "flagged_events");
            assert_eq!(*origin_id, flagged_id);
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(backend.get_event(SourceKind::Faculty, 7).await.unwrap().is_some());
    assert!(backend.get_flagged(flagged_id).await.unwrap().is_some());
    assert_eq!(ledger.revision(), 3);
}

#[tokio::test]
async fn flagging_a_row_someone_already_moved_is_not_found() {
    let (backend, ledger) = seeded();
    let event = backend.get_event(SourceKind::Faculty, 7).await.unwrap().unwrap();
    ledger
        .flag(&Actor::Admin, SourceKind::Faculty, 7, "first", None, &YES)
        .await
        .unwrap();

    let err = backend
        .move_to_flagged(&event, NewFlaggedEvent::from_event(&event, "second", None))
        .await
        .map_err(LedgerError::from)
        .unwrap_err();

    assert!(matches!(err, LedgerError::NotFound { what: "faculty_events", id: 7 }));
    assert_eq!(backend.list_flagged(None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn department_round_trip_restores_identical_row() {
    let conference = DepartmentEventFields {
        department_id: 3,
        title: "National Conference".into(),
        event_type: "Conference".into(),
        coordinator_name: "Dr. Jane Doe".into(),
        from_date: Some("2025-01-15".into()),
        to_date: Some("2025-01-16".into()),
        participants: Some(150),
        location: "Main Auditorium".into(),
        output: Some("Proceedings volume".into()),
        attachments: Some("https://drive.example/conf".into()),
        certificate_link: Some("https://certs.example/conf".into()),
    };
    let (backend, ledger) = seeded();
    backend
        .seed([EventFields::Department(conference.clone()).into_event(7)])
        .unwrap();

    let flagged = ledger
        .flag(&Actor::Admin, SourceKind::Department, 7, "missing report", None, &YES)
        .await
        .unwrap();
    assert_eq!(flagged.owner(), OwnerKey { kind: SourceKind::Department, id: 3 });
    assert!(backend.get_event(SourceKind::Department, 7).await.unwrap().is_none());
    assert!(backend.get_event(SourceKind::Faculty, 7).await.unwrap().is_some());

    let err = ledger
        .request_unflag(&Actor::Faculty(3), flagged.id, "wrong kind", &YES)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Forbidden(_)));
    ledger
        .request_unflag(&Actor::Department(3), flagged.id, "report attached", &YES)
        .await
        .unwrap();

    let restored = ledger.approve_unflag(&Actor::Admin, flagged.id, &YES).await.unwrap();
    match &restored {
        SourceEvent::Department(e) => {
            assert_eq!(e.id, 7);
            assert_eq!(e.fields, conference);
        }
        other => panic!("unexpected row {other:?}"),
    }
    let active = backend.get_event(SourceKind::Department, 7).await.unwrap().unwrap();
    assert_eq!(active.fields(), EventFields::Department(conference));
    assert!(backend.list_flagged(None).await.unwrap().is_empty());
}
