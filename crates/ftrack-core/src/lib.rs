//! Core domain model for the faculty activity tracker.
//!
//! Source rows come in two shapes (faculty-authored and department-authored); both are
//! carried as a tagged union so the moderation restore projection is a plain `match`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod calendar;
pub mod record;

pub use calendar::{academic_year, academic_year_of, duration_days, parse_date, DurationBucket};
pub use record::{Attachments, EventRecord, NOT_AVAILABLE};

pub const CRATE_NAME: &str = "ftrack-core";

/// Faculty events may carry at most this many uploaded attachments.
pub const MAX_FACULTY_ATTACHMENTS: usize = 10;

/// Types the faculty "Others" filter treats as standard.
pub const STANDARD_FACULTY_TYPES: [&str; 5] = ["Workshop", "Seminar", "FDP", "STP", "Competition"];

/// Types offered to departments in the import template.
pub const DEPARTMENT_EVENT_TYPES: [&str; 9] = [
    "Workshop",
    "Seminar",
    "Conference",
    "Competition",
    "FDP",
    "STP",
    "Hackathon",
    "Guest lecture",
    "Technical talk",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unknown source kind `{0}`")]
    SourceKind(String),
    #[error("unknown event role `{0}`")]
    EventRole(String),
    #[error("invalid actor `{0}` (expected admin, faculty:<id> or department:<id>)")]
    Actor(String),
    #[error("unknown duration bucket `{0}` (expected 1, 2-7, 8-30 or 31+)")]
    DurationBucket(String),
}

/// Which authoring role produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Faculty,
    Department,
}

impl SourceKind {
    pub const ALL: [SourceKind; 2] = [SourceKind::Faculty, SourceKind::Department];

    pub fn table(self) -> &'static str {
        match self {
            SourceKind::Faculty => "faculty_events",
            SourceKind::Department => "department_events",
        }
    }

    pub fn from_table(table: &str) -> Option<Self> {
        match table {
            "faculty_events" => Some(SourceKind::Faculty),
            "department_events" => Some(SourceKind::Department),
            _ => None,
        }
    }

    /// Column on the event table (and on `flagged_events`) pointing at the owner row.
    pub fn owner_column(self) -> &'static str {
        match self {
            SourceKind::Faculty => "faculty_id",
            SourceKind::Department => "department_id",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            SourceKind::Faculty => "Faculty",
            SourceKind::Department => "Department",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for SourceKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "faculty" | "faculty_events" => Ok(SourceKind::Faculty),
            "department" | "department_events" => Ok(SourceKind::Department),
            other => Err(ParseError::SourceKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventRole {
    Organized,
    Attended,
}

impl EventRole {
    pub fn as_str(self) -> &'static str {
        match self {
            EventRole::Organized => "Organized",
            EventRole::Attended => "Attended",
        }
    }
}

impl fmt::Display for EventRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventRole {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "organized" | "organised" => Ok(EventRole::Organized),
            "attended" => Ok(EventRole::Attended),
            other => Err(ParseError::EventRole(other.to_string())),
        }
    }
}

/// Identifies the owner row of an event: a faculty member or a department.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerKey {
    pub kind: SourceKind,
    pub id: i64,
}

/// The party an operation runs on behalf of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "role", content = "id", rename_all = "snake_case")]
pub enum Actor {
    Admin,
    Faculty(i64),
    Department(i64),
}

impl Actor {
    pub fn is_admin(&self) -> bool {
        matches!(self, Actor::Admin)
    }

    pub fn owner_key(&self) -> Option<OwnerKey> {
        match *self {
            Actor::Admin => None,
            Actor::Faculty(id) => Some(OwnerKey { kind: SourceKind::Faculty, id }),
            Actor::Department(id) => Some(OwnerKey { kind: SourceKind::Department, id }),
        }
    }

    pub fn owns(&self, owner: OwnerKey) -> bool {
        self.owner_key() == Some(owner)
    }

    /// Whether rows of `kind` belong in this actor's ledger at all.
    pub fn sees(&self, kind: SourceKind) -> bool {
        match self.owner_key() {
            None => true,
            Some(key) => key.kind == kind,
        }
    }

    /// Owner filter to apply when listing rows of `kind`; `None` lists every owner.
    pub fn owner_filter(&self, kind: SourceKind) -> Option<i64> {
        self.owner_key().filter(|key| key.kind == kind).map(|key| key.id)
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::Admin => f.write_str("admin"),
            Actor::Faculty(id) => write!(f, "faculty:{id}"),
            Actor::Department(id) => write!(f, "department:{id}"),
        }
    }
}

impl FromStr for Actor {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("admin") {
            return Ok(Actor::Admin);
        }
        let (role, id) = trimmed
            .split_once(':')
            .ok_or_else(|| ParseError::Actor(trimmed.to_string()))?;
        let id: i64 = id
            .trim()
            .parse()
            .map_err(|_| ParseError::Actor(trimmed.to_string()))?;
        match role.trim().to_ascii_lowercase().as_str() {
            "faculty" => Ok(Actor::Faculty(id)),
            "department" => Ok(Actor::Department(id)),
            _ => Err(ParseError::Actor(trimmed.to_string())),
        }
    }
}

/// Everything a faculty event row holds besides its primary key and insert timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacultyEventFields {
    pub faculty_id: i64,
    pub title: String,
    #[serde(rename = "type", default)]
    pub event_type: String,
    #[serde(default)]
    pub from_date: Option<String>,
    #[serde(default)]
    pub to_date: Option<String>,
    #[serde(default)]
    pub participants: Option<i64>,
    pub event_role: EventRole,
    #[serde(default)]
    pub remarks: Option<String>,
    #[serde(default)]
    pub attachments: Vec<String>,
}

/// Everything a department event row holds besides its primary key and insert timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepartmentEventFields {
    pub department_id: i64,
    pub title: String,
    #[serde(rename = "type", default)]
    pub event_type: String,
    #[serde(default)]
    pub coordinator_name: String,
    #[serde(default)]
    pub from_date: Option<String>,
    #[serde(default)]
    pub to_date: Option<String>,
    #[serde(default)]
    pub participants: Option<i64>,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub output: Option<String>,
    /// Drive link holding the event's files.
    #[serde(default)]
    pub attachments: Option<String>,
    #[serde(default)]
    pub certificate_link: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacultyEvent {
    pub id: i64,
    #[serde(flatten)]
    pub fields: FacultyEventFields,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepartmentEvent {
    pub id: i64,
    #[serde(flatten)]
    pub fields: DepartmentEventFields,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Source-specific event fields without identity: the payload of a new row and the
/// snapshot a flagged event keeps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", content = "fields", rename_all = "snake_case")]
pub enum EventFields {
    Faculty(FacultyEventFields),
    Department(DepartmentEventFields),
}

impl EventFields {
    pub fn kind(&self) -> SourceKind {
        match self {
            EventFields::Faculty(_) => SourceKind::Faculty,
            EventFields::Department(_) => SourceKind::Department,
        }
    }

    pub fn owner(&self) -> OwnerKey {
        match self {
            EventFields::Faculty(f) => OwnerKey { kind: SourceKind::Faculty, id: f.faculty_id },
            EventFields::Department(d) => OwnerKey { kind: SourceKind::Department, id: d.department_id },
        }
    }

    pub fn title(&self) -> &str {
        match self {
            EventFields::Faculty(f) => &f.title,
            EventFields::Department(d) => &d.title,
        }
    }

    pub fn event_type(&self) -> &str {
        match self {
            EventFields::Faculty(f) => &f.event_type,
            EventFields::Department(d) => &d.event_type,
        }
    }

    pub fn from_date(&self) -> Option<&str> {
        match self {
            EventFields::Faculty(f) => f.from_date.as_deref(),
            EventFields::Department(d) => d.from_date.as_deref(),
        }
    }

    /// Project the fields back onto an origin-table row carrying `id`.
    pub fn into_event(self, id: i64) -> SourceEvent {
        match self {
            EventFields::Faculty(fields) => SourceEvent::Faculty(FacultyEvent {
                id,
                fields,
                created_at: None,
            }),
            EventFields::Department(fields) => SourceEvent::Department(DepartmentEvent {
                id,
                fields,
                created_at: None,
            }),
        }
    }
}

/// A row from one of the two event tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", content = "row", rename_all = "snake_case")]
pub enum SourceEvent {
    Faculty(FacultyEvent),
    Department(DepartmentEvent),
}

impl SourceEvent {
    pub fn id(&self) -> i64 {
        match self {
            SourceEvent::Faculty(e) => e.id,
            SourceEvent::Department(e) => e.id,
        }
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            SourceEvent::Faculty(_) => SourceKind::Faculty,
            SourceEvent::Department(_) => SourceKind::Department,
        }
    }

    pub fn owner(&self) -> OwnerKey {
        match self {
            SourceEvent::Faculty(e) => OwnerKey { kind: SourceKind::Faculty, id: e.fields.faculty_id },
            SourceEvent::Department(e) => OwnerKey { kind: SourceKind::Department, id: e.fields.department_id },
        }
    }

    pub fn title(&self) -> &str {
        match self {
            SourceEvent::Faculty(e) => &e.fields.title,
            SourceEvent::Department(e) => &e.fields.title,
        }
    }

    pub fn from_date(&self) -> Option<&str> {
        match self {
            SourceEvent::Faculty(e) => e.fields.from_date.as_deref(),
            SourceEvent::Department(e) => e.fields.from_date.as_deref(),
        }
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        match self {
            SourceEvent::Faculty(e) => e.created_at,
            SourceEvent::Department(e) => e.created_at,
        }
    }

    /// Copy of the row's fields; the primary key and timestamp are not part of it.
    pub fn fields(&self) -> EventFields {
        match self {
            SourceEvent::Faculty(e) => EventFields::Faculty(e.fields.clone()),
            SourceEvent::Department(e) => EventFields::Department(e.fields.clone()),
        }
    }
}

/// Name and email resolved through the owner join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerRef {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

/// An event row together with its (possibly missing) owner join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnedEvent {
    pub event: SourceEvent,
    pub owner: Option<OwnerRef>,
}

/// Where a flagged record sits in the moderation workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModerationState {
    Flagged,
    UnflagRequested,
}

/// A record moved out of its origin table into `flagged_events`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlaggedEvent {
    pub id: i64,
    /// Primary key the row had (and gets back) in its origin table.
    pub event_id: i64,
    pub snapshot: EventFields,
    pub admin_comment: String,
    #[serde(default)]
    pub owner_comment: Option<String>,
    #[serde(default)]
    pub unflag_requested: bool,
    #[serde(default)]
    pub owner_email: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl FlaggedEvent {
    pub fn source(&self) -> SourceKind {
        self.snapshot.kind()
    }

    pub fn owner(&self) -> OwnerKey {
        self.snapshot.owner()
    }

    pub fn state(&self) -> ModerationState {
        if self.unflag_requested {
            ModerationState::UnflagRequested
        } else {
            ModerationState::Flagged
        }
    }

    /// The origin-table row an approved unflag writes back, original id included.
    pub fn restored_event(&self) -> SourceEvent {
        self.snapshot.clone().into_event(self.event_id)
    }
}

/// Insert payload for `flagged_events`; new rows always start without an unflag request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewFlaggedEvent {
    pub event_id: i64,
    pub snapshot: EventFields,
    pub admin_comment: String,
    pub owner_email: Option<String>,
}

impl NewFlaggedEvent {
    pub fn from_event(event: &SourceEvent, admin_comment: impl Into<String>, owner_email: Option<String>) -> Self {
        Self {
            event_id: event.id(),
            snapshot: event.fields(),
            admin_comment: admin_comment.into(),
            owner_email,
        }
    }
}

/// Partial update applied to a flagged row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlaggedPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unflag_requested: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacultyMember {
    pub id: i64,
    pub faculty_id: String,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub school: Option<String>,
    #[serde(default)]
    pub department: Option<String>,
    #[serde(default)]
    pub mobile: Option<String>,
    #[serde(default)]
    pub gender: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Department {
    pub id: i64,
    pub department_id: String,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub school: Option<String>,
    #[serde(default)]
    pub head_name: Option<String>,
}

/// Event type lists used by filters and the import template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeCatalog {
    #[serde(default = "default_standard_types")]
    pub standard_faculty_types: Vec<String>,
    #[serde(default = "default_department_types")]
    pub department_types: Vec<String>,
}

impl Default for TypeCatalog {
    fn default() -> Self {
        Self {
            standard_faculty_types: default_standard_types(),
            department_types: default_department_types(),
        }
    }
}

impl TypeCatalog {
    pub fn is_standard_faculty_type(&self, event_type: &str) -> bool {
        self.standard_faculty_types.iter().any(|t| t == event_type)
    }
}

fn default_standard_types() -> Vec<String> {
    STANDARD_FACULTY_TYPES.iter().map(|s| s.to_string()).collect()
}

fn default_department_types() -> Vec<String> {
    DEPARTMENT_EVENT_TYPES.iter().map(|s| s.to_string()).collect()
}
