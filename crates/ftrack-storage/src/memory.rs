//! In-process backend used by tests and the `memory` backend setting.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use ftrack_core::{
    Department, DepartmentEvent, EventFields, FacultyEvent, FacultyMember, FlaggedEvent, FlaggedPatch,
    NewFlaggedEvent, OwnedEvent, OwnerKey, OwnerRef, SourceEvent, SourceKind,
};

use crate::{EventBackend, StorageError, DIRECTORY_LIMIT};

/// Operations that can be made to fail once via [`MemoryBackend::fail_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    ListEvents(SourceKind),
    ListFlagged,
    InsertFlagged,
    DeleteEvent,
    UpsertEvent,
    DeleteFlagged,
}

#[derive(Debug, Default)]
struct MemoryState {
    faculty: BTreeMap<i64, FacultyMember>,
    departments: BTreeMap<i64, Department>,
    faculty_events: BTreeMap<i64, SourceEvent>,
    department_events: BTreeMap<i64, SourceEvent>,
    flagged: BTreeMap<i64, FlaggedEvent>,
    last_faculty_event: i64,
    last_department_event: i64,
    last_flagged: i64,
    armed: Vec<FailPoint>,
}

impl MemoryState {
    fn events(&self, kind: SourceKind) -> &BTreeMap<i64, SourceEvent> {
        match kind {
            SourceKind::Faculty => &self.faculty_events,
            SourceKind::Department => &self.department_events,
        }
    }

    fn events_mut(&mut self, kind: SourceKind) -> &mut BTreeMap<i64, SourceEvent> {
        match kind {
            SourceKind::Faculty => &mut self.faculty_events,
            SourceKind::Department => &mut self.department_events,
        }
    }

    fn sequence_mut(&mut self, kind: SourceKind) -> &mut i64 {
        match kind {
            SourceKind::Faculty => &mut self.last_faculty_event,
            SourceKind::Department => &mut self.last_department_event,
        }
    }

    fn trip(&mut self, point: FailPoint) -> Result<(), StorageError> {
        match self.armed.iter().position(|armed| *armed == point) {
            Some(index) => {
                self.armed.remove(index);
                Err(StorageError::Backend(format!("injected failure at {point:?}")))
            }
            None => Ok(()),
        }
    }

    fn owner_ref(&self, owner: OwnerKey) -> Option<OwnerRef> {
        match owner.kind {
            SourceKind::Faculty => self.faculty.get(&owner.id).map(|f| OwnerRef {
                name: Some(f.name.clone()),
                email: Some(f.email.clone()),
            }),
            SourceKind::Department => self.departments.get(&owner.id).map(|d| OwnerRef {
                name: Some(d.name.clone()),
                email: Some(d.email.clone()),
            }),
        }
    }

    fn store(&mut self, mut event: SourceEvent) {
        let kind = event.kind();
        let id = event.id();
        if event.created_at().is_none() {
            let now = Some(Utc::now());
            match &mut event {
                SourceEvent::Faculty(e) => e.created_at = now,
                SourceEvent::Department(e) => e.created_at = now,
            }
        }
        let sequence = self.sequence_mut(kind);
        *sequence = (*sequence).max(id);
        self.events_mut(kind).insert(id, event);
    }
}

/// Event, flagged and owner tables held in `BTreeMap`s behind a mutex.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_faculty(self, members: impl IntoIterator<Item = FacultyMember>) -> Self {
        let mut state = self.state.into_inner().unwrap_or_else(PoisonError::into_inner);
        state.faculty.extend(members.into_iter().map(|m| (m.id, m)));
        Self { state: Mutex::new(state) }
    }

    pub fn with_departments(self, departments: impl IntoIterator<Item = Department>) -> Self {
        let mut state = self.state.into_inner().unwrap_or_else(PoisonError::into_inner);
        state.departments.extend(departments.into_iter().map(|d| (d.id, d)));
        Self { state: Mutex::new(state) }
    }

    /// Store rows with their given ids; later inserts continue after the highest one.
    pub fn seed(&self, events: impl IntoIterator<Item = SourceEvent>) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        for event in events {
            state.store(event);
        }
        Ok(())
    }

    /// Make the next call reaching `point` fail with a backend error.
    pub fn fail_next(&self, point: FailPoint) -> Result<(), StorageError> {
        self.lock()?.armed.push(point);
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, StorageError> {
        self.state
            .lock()
            .map_err(|_| StorageError::Backend("memory store lock poisoned".to_string()))
    }
}

fn newest_first(a: &SourceEvent, b: &SourceEvent) -> std::cmp::Ordering {
    b.from_date().cmp(&a.from_date()).then(b.id().cmp(&a.id()))
}

#[async_trait]
impl EventBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn list_events(
        &self,
        kind: SourceKind,
        owner_id: Option<i64>,
    ) -> Result<Vec<OwnedEvent>, StorageError> {
        let mut state = self.lock()?;
        state.trip(FailPoint::ListEvents(kind))?;
        let mut rows: Vec<&SourceEvent> = state
            .events(kind)
            .values()
            .filter(|e| owner_id.map_or(true, |id| e.owner().id == id))
            .collect();
        rows.sort_by(|a, b| newest_first(a, b));
        Ok(rows
            .into_iter()
            .map(|event| OwnedEvent {
                owner: state.owner_ref(event.owner()),
                event: event.clone(),
            })
            .collect())
    }

    async fn get_event(&self, kind: SourceKind, id: i64) -> Result<Option<SourceEvent>, StorageError> {
        Ok(self.lock()?.events(kind).get(&id).cloned())
    }

    async fn insert_events(&self, rows: Vec<EventFields>) -> Result<Vec<SourceEvent>, StorageError> {
        let mut state = self.lock()?;
        let mut inserted = Vec::with_capacity(rows.len());
        for fields in rows {
            let kind = fields.kind();
            let id = *state.sequence_mut(kind) + 1;
            let mut event = fields.into_event(id);
            let now = Some(Utc::now());
            match &mut event {
                SourceEvent::Faculty(FacultyEvent { created_at, .. })
                | SourceEvent::Department(DepartmentEvent { created_at, .. }) => *created_at = now,
            }
            state.store(event.clone());
            inserted.push(event);
        }
        Ok(inserted)
    }

    async fn update_event(&self, event: SourceEvent) -> Result<Option<SourceEvent>, StorageError> {
        let mut state = self.lock()?;
        let table = state.events_mut(event.kind());
        let Some(existing) = table.get_mut(&event.id()) else {
            return Ok(None);
        };
        let created_at = existing.created_at();
        let mut updated = event;
        match &mut updated {
            SourceEvent::Faculty(e) => e.created_at = created_at,
            SourceEvent::Department(e) => e.created_at = created_at,
        }
        *existing = updated.clone();
        Ok(Some(updated))
    }

    async fn upsert_event(&self, event: SourceEvent) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        state.trip(FailPoint::UpsertEvent)?;
        state.store(event);
        Ok(())
    }

    async fn delete_event(&self, kind: SourceKind, id: i64) -> Result<bool, StorageError> {
        let mut state = self.lock()?;
        state.trip(FailPoint::DeleteEvent)?;
        Ok(state.events_mut(kind).remove(&id).is_some())
    }

    async fn list_flagged(&self, owner: Option<OwnerKey>) -> Result<Vec<FlaggedEvent>, StorageError> {
        let mut state = self.lock()?;
        state.trip(FailPoint::ListFlagged)?;
        Ok(state
            .flagged
            .values()
            .rev()
            .filter(|f| owner.map_or(true, |key| f.owner() == key))
            .cloned()
            .collect())
    }

    async fn get_flagged(&self, id: i64) -> Result<Option<FlaggedEvent>, StorageError> {
        Ok(self.lock()?.flagged.get(&id).cloned())
    }

    async fn insert_flagged(&self, row: NewFlaggedEvent) -> Result<FlaggedEvent, StorageError> {
        let mut state = self.lock()?;
        state.trip(FailPoint::InsertFlagged)?;
        state.last_flagged += 1;
        let flagged = FlaggedEvent {
            id: state.last_flagged,
            event_id: row.event_id,
            snapshot: row.snapshot,
            admin_comment: row.admin_comment,
            owner_comment: None,
            unflag_requested: false,
            owner_email: row.owner_email,
            created_at: Some(Utc::now()),
        };
        state.flagged.insert(flagged.id, flagged.clone());
        Ok(flagged)
    }

    async fn update_flagged(
        &self,
        id: i64,
        patch: FlaggedPatch,
    ) -> Result<Option<FlaggedEvent>, StorageError> {
        let mut state = self.lock()?;
        let Some(row) = state.flagged.get_mut(&id) else {
            return Ok(None);
        };
        if let Some(requested) = patch.unflag_requested {
            row.unflag_requested = requested;
        }
        if let Some(comment) = patch.owner_comment {
            row.owner_comment = Some(comment);
        }
        Ok(Some(row.clone()))
    }

    async fn delete_flagged(&self, id: i64) -> Result<bool, StorageError> {
        let mut state = self.lock()?;
        state.trip(FailPoint::DeleteFlagged)?;
        Ok(state.flagged.remove(&id).is_some())
    }

    async fn list_faculty(&self) -> Result<Vec<FacultyMember>, StorageError> {
        let mut members: Vec<FacultyMember> = self.lock()?.faculty.values().cloned().collect();
        members.sort_by(|a, b| a.name.cmp(&b.name));
        members.truncate(DIRECTORY_LIMIT as usize);
        Ok(members)
    }

    async fn list_departments(&self) -> Result<Vec<Department>, StorageError> {
        let mut departments: Vec<Department> = self.lock()?.departments.values().cloned().collect();
        departments.sort_by(|a, b| a.name.cmp(&b.name));
        departments.truncate(DIRECTORY_LIMIT as usize);
        Ok(departments)
    }
}
