//! Moderation ledger: the flag / request-unflag / approve / delete state machine plus the
//! owner-side create and import operations, all fronted by [`Ledger::dispatch`].
//!
//! Every mutating call is checked (role and field validation), then confirmed through a
//! [`ConfirmationGate`], then executed against the storage backend. Successful mutations
//! bump a revision published on a `tokio::sync::watch` channel.

use std::fmt;
use std::sync::Arc;

use ftrack_core::{
    Actor, DepartmentEvent, DepartmentEventFields, EventFields, FacultyEventFields, FlaggedEvent,
    FlaggedPatch, NewFlaggedEvent, SourceEvent, SourceKind, MAX_FACULTY_ATTACHMENTS,
};
use ftrack_storage::{EventBackend, MoveError, StorageError};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "ftrack-ledger";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{what} {id} not found")]
    NotFound { what: &'static str, id: i64 },
    #[error("{0}")]
    InvalidTransition(String),
    #[error("{action} was not confirmed")]
    NotConfirmed { action: &'static str },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("manual resolution required: {0}")]
    PartialMove(MoveError),
}

impl From<MoveError> for LedgerError {
    fn from(err: MoveError) -> Self {
        match err {
            MoveError::NotStarted(StorageError::NotFound { table, id }) => {
                LedgerError::NotFound { what: table, id }
            }
            MoveError::NotStarted(source) => LedgerError::Storage(source),
            incomplete @ MoveError::Incomplete { .. } => LedgerError::PartialMove(incomplete),
        }
    }
}

impl LedgerError {
    /// Stable machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::Validation(_) => "validation",
            LedgerError::Forbidden(_) => "forbidden",
            LedgerError::NotFound { .. } => "not_found",
            LedgerError::InvalidTransition(_) => "invalid_transition",
            LedgerError::NotConfirmed { .. } => "not_confirmed",
            LedgerError::Storage(_) => "storage",
            LedgerError::PartialMove(_) => "partial_move",
        }
    }
}

/// A mutating request against the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerAction {
    Flag {
        kind: SourceKind,
        event_id: i64,
        comment: String,
        owner_email: Option<String>,
    },
    RequestUnflag {
        flagged_id: i64,
        comment: String,
    },
    ApproveUnflag {
        flagged_id: i64,
    },
    DeleteFlagged {
        flagged_id: i64,
    },
    DeleteActive {
        kind: SourceKind,
        event_id: i64,
    },
    CreateEvent {
        fields: EventFields,
    },
    UpdateDepartmentEvent {
        id: i64,
        fields: DepartmentEventFields,
    },
    ImportDepartmentEvents {
        rows: Vec<DepartmentEventFields>,
    },
}

impl LedgerAction {
    pub fn name(&self) -> &'static str {
        match self {
            LedgerAction::Flag { .. } => "flag",
            LedgerAction::RequestUnflag { .. } => "request_unflag",
            LedgerAction::ApproveUnflag { .. } => "approve_unflag",
            LedgerAction::DeleteFlagged { .. } => "delete_flagged",
            LedgerAction::DeleteActive { .. } => "delete_event",
            LedgerAction::CreateEvent { .. } => "create_event",
            LedgerAction::UpdateDepartmentEvent { .. } => "update_department_event",
            LedgerAction::ImportDepartmentEvents { .. } => "import_department_events",
        }
    }
}

impl fmt::Display for LedgerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerAction::Flag { kind, event_id, .. } => {
                write!(f, "flag {} event {event_id}", kind.label().to_lowercase())
            }
            LedgerAction::RequestUnflag { flagged_id, .. } => {
                write!(f, "request unflag of flagged event {flagged_id}")
            }
            LedgerAction::ApproveUnflag { flagged_id } => {
                write!(f, "approve unflag of flagged event {flagged_id} and restore it")
            }
            LedgerAction::DeleteFlagged { flagged_id } => {
                write!(f, "permanently delete flagged event {flagged_id}")
            }
            LedgerAction::DeleteActive { kind, event_id } => {
                write!(f, "permanently delete {} event {event_id}", kind.label().to_lowercase())
            }
            LedgerAction::CreateEvent { fields } => write!(f, "create event \"{}\"", fields.title()),
            LedgerAction::UpdateDepartmentEvent { id, .. } => write!(f, "update department event {id}"),
            LedgerAction::ImportDepartmentEvents { rows } => {
                write!(f, "import {} department events", rows.len())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "data", rename_all = "snake_case")]
pub enum LedgerOutcome {
    Flagged(FlaggedEvent),
    UnflagRequested(FlaggedEvent),
    Restored(SourceEvent),
    FlaggedDeleted { flagged_id: i64 },
    EventDeleted { kind: SourceKind, event_id: i64 },
    Created(Vec<SourceEvent>),
    Updated(SourceEvent),
}

/// Asks whoever is driving the ledger to confirm an action before it runs.
pub trait ConfirmationGate: Send + Sync {
    fn confirm(&self, action: &LedgerAction) -> bool;
}

/// Gate that always gives the same answer.
#[derive(Debug, Clone, Copy)]
pub struct FixedAnswer(pub bool);

impl ConfirmationGate for FixedAnswer {
    fn confirm(&self, _action: &LedgerAction) -> bool {
        self.0
    }
}

fn require_text(value: &str, what: &str) -> Result<(), LedgerError> {
    if value.trim().is_empty() {
        Err(LedgerError::Validation(format!("{what} is required")))
    } else {
        Ok(())
    }
}

fn require_admin(actor: &Actor, action: &LedgerAction) -> Result<(), LedgerError> {
    if actor.is_admin() {
        Ok(())
    } else {
        Err(LedgerError::Forbidden(format!("only an admin may {action}")))
    }
}

pub fn validate_faculty_event(fields: &FacultyEventFields) -> Result<(), LedgerError> {
    require_text(&fields.title, "event title")?;
    if fields.attachments.len() > MAX_FACULTY_ATTACHMENTS {
        return Err(LedgerError::Validation(format!(
            "at most {MAX_FACULTY_ATTACHMENTS} attachments are allowed, got {}",
            fields.attachments.len()
        )));
    }
    Ok(())
}

pub fn validate_department_event(fields: &DepartmentEventFields) -> Result<(), LedgerError> {
    require_text(&fields.title, "event title")?;
    require_text(&fields.event_type, "event type")?;
    require_text(&fields.coordinator_name, "coordinator name")?;
    require_text(&fields.location, "location")?;
    require_text(fields.attachments.as_deref().unwrap_or_default(), "attachments link")?;
    Ok(())
}

/// Role and field checks that need no storage access.
fn preflight(actor: &Actor, action: &LedgerAction) -> Result<(), LedgerError> {
    match action {
        LedgerAction::Flag { comment, .. } => {
            require_admin(actor, action)?;
            require_text(comment, "flag comment")
        }
        LedgerAction::RequestUnflag { comment, .. } => {
            if actor.is_admin() {
                return Err(LedgerError::Forbidden(
                    "only the owner of a flagged event may request an unflag".to_string(),
                ));
            }
            require_text(comment, "unflag comment")
        }
        LedgerAction::ApproveUnflag { .. } | LedgerAction::DeleteFlagged { .. } => {
            require_admin(actor, action)
        }
        LedgerAction::DeleteActive { kind, .. } => {
            if actor.sees(*kind) {
                Ok(())
            } else {
                Err(LedgerError::Forbidden(format!("{actor} may not {action}")))
            }
        }
        LedgerAction::CreateEvent { fields } => {
            if !actor.is_admin() && !actor.owns(fields.owner()) {
                return Err(LedgerError::Forbidden(format!(
                    "{actor} may not create events for another owner"
                )));
            }
            match fields {
                EventFields::Faculty(f) => validate_faculty_event(f),
                EventFields::Department(d) => validate_department_event(d),
            }
        }
        LedgerAction::UpdateDepartmentEvent { fields, .. } => {
            if !actor.is_admin() && actor.owner_filter(SourceKind::Department) != Some(fields.department_id) {
                return Err(LedgerError::Forbidden(format!("{actor} may not {action}")));
            }
            validate_department_event(fields)
        }
        LedgerAction::ImportDepartmentEvents { rows } => {
            if rows.is_empty() {
                return Err(LedgerError::Validation("no valid rows to import".to_string()));
            }
            if !actor.is_admin()
                && rows
                    .iter()
                    .any(|row| actor.owner_filter(SourceKind::Department) != Some(row.department_id))
            {
                return Err(LedgerError::Forbidden(format!("{actor} may not {action}")));
            }
            Ok(())
        }
    }
}

pub struct Ledger {
    backend: Arc<dyn EventBackend>,
    revision: watch::Sender<u64>,
}

impl Ledger {
    pub fn new(backend: Arc<dyn EventBackend>) -> Self {
        let (revision, _) = watch::channel(0);
        Self { backend, revision }
    }

    pub fn backend(&self) -> &Arc<dyn EventBackend> {
        &self.backend
    }

    /// Receiver that observes a new revision after every state change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    /// Run `action` on behalf of `actor`.
    pub async fn dispatch(
        &self,
        actor: &Actor,
        action: LedgerAction,
        gate: &dyn ConfirmationGate,
    ) -> Result<LedgerOutcome, LedgerError> {
        let span = info_span!("ledger", action = action.name(), actor = %actor);
        async {
            preflight(actor, &action)?;
            if !gate.confirm(&action) {
                warn!(%action, "action declined at confirmation");
                return Err(LedgerError::NotConfirmed { action: action.name() });
            }
            let result = self.execute(actor, action).await;
            match &result {
                Ok(_) => self.bump(),
                Err(err @ LedgerError::PartialMove(_)) => {
                    error!(error = %err, "partial move left rows in both tables");
                    self.bump();
                }
                Err(err) => warn!(code = err.code(), error = %err, "ledger action failed"),
            }
            result
        }
        .instrument(span)
        .await
    }

    pub async fn flag(
        &self,
        actor: &Actor,
        kind: SourceKind,
        event_id: i64,
        comment: impl Into<String>,
        owner_email: Option<String>,
        gate: &dyn ConfirmationGate,
    ) -> Result<FlaggedEvent, LedgerError> {
        let action = LedgerAction::Flag {
            kind,
            event_id,
            comment: comment.into(),
            owner_email,
        };
        match self.dispatch(actor, action, gate).await? {
            LedgerOutcome::Flagged(flagged) => Ok(flagged),
            other => Err(unexpected(other)),
        }
    }

    pub async fn request_unflag(
        &self,
        actor: &Actor,
        flagged_id: i64,
        comment: impl Into<String>,
        gate: &dyn ConfirmationGate,
    ) -> Result<FlaggedEvent, LedgerError> {
        let action = LedgerAction::RequestUnflag {
            flagged_id,
            comment: comment.into(),
        };
        match self.dispatch(actor, action, gate).await? {
            LedgerOutcome::UnflagRequested(flagged) => Ok(flagged),
            other => Err(unexpected(other)),
        }
    }

    pub async fn approve_unflag(
        &self,
        actor: &Actor,
        flagged_id: i64,
        gate: &dyn ConfirmationGate,
    ) -> Result<SourceEvent, LedgerError> {
        match self
            .dispatch(actor, LedgerAction::ApproveUnflag { flagged_id }, gate)
            .await?
        {
            LedgerOutcome::Restored(event) => Ok(event),
            other => Err(unexpected(other)),
        }
    }

    pub async fn delete_flagged(
        &self,
        actor: &Actor,
        flagged_id: i64,
        gate: &dyn ConfirmationGate,
    ) -> Result<(), LedgerError> {
        self.dispatch(actor, LedgerAction::DeleteFlagged { flagged_id }, gate)
            .await
            .map(|_| ())
    }

    pub async fn delete_active(
        &self,
        actor: &Actor,
        kind: SourceKind,
        event_id: i64,
        gate: &dyn ConfirmationGate,
    ) -> Result<(), LedgerError> {
        self.dispatch(actor, LedgerAction::DeleteActive { kind, event_id }, gate)
            .await
            .map(|_| ())
    }

    pub async fn create_event(
        &self,
        actor: &Actor,
        fields: EventFields,
        gate: &dyn ConfirmationGate,
    ) -> Result<SourceEvent, LedgerError> {
        match self
            .dispatch(actor, LedgerAction::CreateEvent { fields }, gate)
            .await?
        {
            LedgerOutcome::Created(mut rows) if rows.len() == 1 => Ok(rows.remove(0)),
            other => Err(unexpected(other)),
        }
    }

    pub async fn update_department_event(
        &self,
        actor: &Actor,
        id: i64,
        fields: DepartmentEventFields,
        gate: &dyn ConfirmationGate,
    ) -> Result<SourceEvent, LedgerError> {
        match self
            .dispatch(actor, LedgerAction::UpdateDepartmentEvent { id, fields }, gate)
            .await?
        {
            LedgerOutcome::Updated(event) => Ok(event),
            other => Err(unexpected(other)),
        }
    }

    pub async fn import_department_events(
        &self,
        actor: &Actor,
        rows: Vec<DepartmentEventFields>,
        gate: &dyn ConfirmationGate,
    ) -> Result<Vec<SourceEvent>, LedgerError> {
        match self
            .dispatch(actor, LedgerAction::ImportDepartmentEvents { rows }, gate)
            .await?
        {
            LedgerOutcome::Created(rows) => Ok(rows),
            other => Err(unexpected(other)),
        }
    }

    fn bump(&self) {
        self.revision.send_modify(|revision| *revision += 1);
    }

    async fn execute(&self, actor: &Actor, action: LedgerAction) -> Result<LedgerOutcome, LedgerError> {
        let backend = &self.backend;
        match action {
            LedgerAction::Flag {
                kind,
                event_id,
                comment,
                owner_email,
            } => {
                let event = backend
                    .get_event(kind, event_id)
                    .await?
                    .ok_or(LedgerError::NotFound { what: kind.table(), id: event_id })?;
                let row = NewFlaggedEvent::from_event(&event, comment, owner_email);
                let flagged = backend.move_to_flagged(&event, row).await?;
                info!(flagged_id = flagged.id, event_id, table = kind.table(), "event flagged");
                Ok(LedgerOutcome::Flagged(flagged))
            }
            LedgerAction::RequestUnflag { flagged_id, comment } => {
                let flagged = self.flagged_row(flagged_id).await?;
                if !actor.owns(flagged.owner()) {
                    return Err(LedgerError::Forbidden(format!(
                        "{actor} does not own flagged event {flagged_id}"
                    )));
                }
                if flagged.unflag_requested {
                    return Err(LedgerError::InvalidTransition(format!(
                        "unflag already requested for flagged event {flagged_id}"
                    )));
                }
                let patch = FlaggedPatch {
                    unflag_requested: Some(true),
                    owner_comment: Some(comment),
                };
                let updated = backend
                    .update_flagged(flagged_id, patch)
                    .await?
                    .ok_or(LedgerError::NotFound { what: "flagged event", id: flagged_id })?;
                info!(flagged_id, "unflag requested");
                Ok(LedgerOutcome::UnflagRequested(updated))
            }
            LedgerAction::ApproveUnflag { flagged_id } => {
                let flagged = self.flagged_row(flagged_id).await?;
                if !flagged.unflag_requested {
                    return Err(LedgerError::InvalidTransition(format!(
                        "flagged event {flagged_id} has no pending unflag request"
                    )));
                }
                let restored = backend
                    .restore_from_flagged(&flagged, flagged.restored_event())
                    .await?;
                info!(flagged_id, event_id = restored.id(), table = restored.kind().table(), "event restored");
                Ok(LedgerOutcome::Restored(restored))
            }
            LedgerAction::DeleteFlagged { flagged_id } => {
                if !backend.delete_flagged(flagged_id).await? {
                    return Err(LedgerError::NotFound { what: "flagged event", id: flagged_id });
                }
                info!(flagged_id, "flagged event deleted");
                Ok(LedgerOutcome::FlaggedDeleted { flagged_id })
            }
            LedgerAction::DeleteActive { kind, event_id } => {
                let event = backend
                    .get_event(kind, event_id)
                    .await?
                    .ok_or(LedgerError::NotFound { what: kind.table(), id: event_id })?;
                if !actor.is_admin() && !actor.owns(event.owner()) {
                    return Err(LedgerError::Forbidden(format!(
                        "{actor} does not own {} row {event_id}",
                        kind.table()
                    )));
                }
                if !backend.delete_event(kind, event_id).await? {
                    return Err(LedgerError::NotFound { what: kind.table(), id: event_id });
                }
                info!(event_id, table = kind.table(), "event deleted");
                Ok(LedgerOutcome::EventDeleted { kind, event_id })
            }
            LedgerAction::CreateEvent { fields } => {
                let created = backend.insert_events(vec![fields]).await?;
                info!(count = created.len(), "event created");
                Ok(LedgerOutcome::Created(created))
            }
            LedgerAction::UpdateDepartmentEvent { id, fields } => {
                let existing = backend
                    .get_event(SourceKind::Department, id)
                    .await?
                    .ok_or(LedgerError::NotFound { what: "department_events", id })?;
                if !actor.is_admin() && !actor.owns(existing.owner()) {
                    return Err(LedgerError::Forbidden(format!(
                        "{actor} does not own department_events row {id}"
                    )));
                }
                let event = SourceEvent::Department(DepartmentEvent {
                    id,
                    fields,
                    created_at: existing.created_at(),
                });
                let updated = backend
                    .update_event(event)
                    .await?
                    .ok_or(LedgerError::NotFound { what: "department_events", id })?;
                info!(event_id = id, "department event updated");
                Ok(LedgerOutcome::Updated(updated))
            }
            LedgerAction::ImportDepartmentEvents { rows } => {
                let created = backend
                    .insert_events(rows.into_iter().map(EventFields::Department).collect())
                    .await?;
                info!(count = created.len(), "department events imported");
                Ok(LedgerOutcome::Created(created))
            }
        }
    }

    async fn flagged_row(&self, flagged_id: i64) -> Result<FlaggedEvent, LedgerError> {
        self.backend
            .get_flagged(flagged_id)
            .await?
            .ok_or(LedgerError::NotFound { what: "flagged event", id: flagged_id })
    }
}

fn unexpected(outcome: LedgerOutcome) -> LedgerError {
    LedgerError::Storage(StorageError::Backend(format!(
        "unexpected ledger outcome {outcome:?}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ftrack_core::EventRole;

    fn department_fields(department_id: i64) -> DepartmentEventFields {
        DepartmentEventFields {
            department_id,
            title: "National Conference on AI".into(),
            event_type: "Conference".into(),
            coordinator_name: "Dr. Jane Doe".into(),
            from_date: Some("2025-01-15".into()),
            to_date: Some("2025-01-17".into()),
            participants: Some(150),
            location: "Main Auditorium".into(),
            output: None,
            attachments: Some("https://drive.example/attachments".into()),
            certificate_link: None,
        }
    }

    #[test]
    fn flag_requires_admin_and_comment() {
        let action = LedgerAction::Flag {
            kind: SourceKind::Faculty,
            event_id: 7,
            comment: "   ".into(),
            owner_email: None,
        };
        assert!(matches!(
            preflight(&Actor::Faculty(2), &action),
            Err(LedgerError::Forbidden(_))
        ));
        assert!(matches!(
            preflight(&Actor::Admin, &action),
            Err(LedgerError::Validation(_))
        ));
    }

    #[test]
    fn department_drafts_need_every_required_field() {
        let mut fields = department_fields(3);
        assert!(validate_department_event(&fields).is_ok());
        fields.attachments = Some(" ".into());
        let err = validate_department_event(&fields).unwrap_err();
        assert_eq!(err.to_string(), "attachments link is required");
        fields.attachments = None;
        assert!(validate_department_event(&fields).is_err());
    }

    #[test]
    fn faculty_attachment_limit_is_enforced() {
        let fields = FacultyEventFields {
            faculty_id: 2,
            title: "Cloud FDP".into(),
            event_type: "FDP".into(),
            from_date: None,
            to_date: None,
            participants: None,
            event_role: EventRole::Attended,
            remarks: None,
            attachments: (0..11).map(|i| format!("https://files.example/{i}.pdf")).collect(),
        };
        assert!(matches!(
            validate_faculty_event(&fields),
            Err(LedgerError::Validation(_))
        ));
    }

    #[test]
    fn owners_cannot_write_for_other_owners() {
        let create = LedgerAction::CreateEvent {
            fields: EventFields::Department(department_fields(4)),
        };
        assert!(matches!(
            preflight(&Actor::Department(3), &create),
            Err(LedgerError::Forbidden(_))
        ));
        assert!(preflight(&Actor::Department(4), &create).is_ok());

        let import = LedgerAction::ImportDepartmentEvents { rows: vec![] };
        assert!(matches!(
            preflight(&Actor::Department(3), &import),
            Err(LedgerError::Validation(_))
        ));
    }

    #[test]
    fn move_errors_split_into_storage_and_partial() {
        let not_started: LedgerError =
            MoveError::NotStarted(StorageError::Backend("connection reset".into())).into();
        assert_eq!(not_started.code(), "storage");
        assert_eq!(not_started.to_string(), "connection reset");

        let vanished: LedgerError = MoveError::NotStarted(StorageError::NotFound {
            table: "faculty_events",
            id: 7,
        })
        .into();
        assert!(matches!(vanished, LedgerError::NotFound { what: "faculty_events", id: 7 }));

        let partial: LedgerError = MoveError::Incomplete {
            written_table: "flagged_events",
            written_id: 1,
            origin_table: "faculty_events",
            origin_id: 7,
            source: StorageError::Backend("timeout".into()),
        }
        .into();
        assert_eq!(partial.code(), "partial_move");
    }
}
