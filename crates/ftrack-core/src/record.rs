//! Unified event view built from either source row shape.

use serde::{Deserialize, Serialize};

use crate::calendar::{academic_year, duration_days};
use crate::{EventRole, OwnedEvent, OwnerRef, SourceEvent, SourceKind};

pub const NOT_AVAILABLE: &str = "N/A";

/// Faculty events carry uploaded files; department events a single drive link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Attachments {
    Files(Vec<String>),
    Link(String),
}

impl Attachments {
    pub fn urls(&self) -> Vec<&str> {
        match self {
            Attachments::Files(urls) => urls.iter().map(String::as_str).collect(),
            Attachments::Link(url) => vec![url.as_str()],
        }
    }

    /// Plain-text form used in exports.
    pub fn to_text(&self) -> String {
        self.urls().join(", ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: i64,
    pub source_kind: SourceKind,
    pub title: String,
    pub event_type: String,
    pub from_date: Option<String>,
    pub to_date: Option<String>,
    pub role: Option<EventRole>,
    pub participants: Option<i64>,
    pub location: Option<String>,
    pub attachments: Option<Attachments>,
    pub owner_name: String,
    pub owner_email: String,
}

impl EventRecord {
    pub fn from_source(event: &SourceEvent, owner: Option<&OwnerRef>) -> Self {
        let owner_name = owner
            .and_then(|o| o.name.clone())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| NOT_AVAILABLE.to_string());
        let owner_email = owner
            .and_then(|o| o.email.clone())
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| NOT_AVAILABLE.to_string());

        match event {
            SourceEvent::Faculty(e) => {
                let f = &e.fields;
                Self {
                    id: e.id,
                    source_kind: SourceKind::Faculty,
                    title: f.title.clone(),
                    event_type: f.event_type.clone(),
                    from_date: f.from_date.clone(),
                    to_date: f.to_date.clone(),
                    role: Some(f.event_role),
                    participants: f.participants,
                    location: None,
                    attachments: (!f.attachments.is_empty())
                        .then(|| Attachments::Files(f.attachments.clone())),
                    owner_name,
                    owner_email,
                }
            }
            SourceEvent::Department(e) => {
                let d = &e.fields;
                Self {
                    id: e.id,
                    source_kind: SourceKind::Department,
                    title: d.title.clone(),
                    event_type: d.event_type.clone(),
                    from_date: d.from_date.clone(),
                    to_date: d.to_date.clone(),
                    role: Some(EventRole::Organized),
                    participants: d.participants,
                    location: Some(d.location.clone()).filter(|l| !l.is_empty()),
                    attachments: d
                        .attachments
                        .clone()
                        .filter(|link| !link.trim().is_empty())
                        .map(Attachments::Link),
                    owner_name,
                    owner_email,
                }
            }
        }
    }

    pub fn from_owned(owned: &OwnedEvent) -> Self {
        Self::from_source(&owned.event, owned.owner.as_ref())
    }

    pub fn duration_days(&self) -> Option<i64> {
        duration_days(self.from_date.as_deref(), self.to_date.as_deref())
    }

    pub fn academic_year(&self) -> Option<String> {
        academic_year(self.from_date.as_deref())
    }

    /// Participant count as shown in listings; attended events render `-`.
    pub fn participants_display(&self) -> String {
        match (self.role, self.participants) {
            (Some(EventRole::Attended), _) | (_, None) => "-".to_string(),
            (_, Some(count)) => count.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DepartmentEvent, DepartmentEventFields, FacultyEvent, FacultyEventFields};

    fn department_event() -> SourceEvent {
        SourceEvent::Department(DepartmentEvent {
            id: 7,
            fields: DepartmentEventFields {
                department_id: 3,
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
            },
            created_at: None,
        })
    }

    #[test]
    fn department_rows_are_always_organized() {
        let owner = OwnerRef {
            name: Some("CSE".into()),
            email: Some("cse@example.edu".into()),
        };
        let record = EventRecord::from_source(&department_event(), Some(&owner));
        assert_eq!(record.source_kind, SourceKind::Department);
        assert_eq!(record.role, Some(EventRole::Organized));
        assert_eq!(record.location.as_deref(), Some("Main Auditorium"));
        assert_eq!(
            record.attachments,
            Some(Attachments::Link("https://drive.example/attachments".into()))
        );
        assert_eq!(record.owner_name, "CSE");
        assert_eq!(record.duration_days(), Some(3));
        assert_eq!(record.academic_year().as_deref(), Some("2024-2025"));
    }

    #[test]
    fn missing_owner_join_defaults_to_not_available() {
        let record = EventRecord::from_source(&department_event(), None);
        assert_eq!(record.owner_name, NOT_AVAILABLE);
        assert_eq!(record.owner_email, NOT_AVAILABLE);
    }

    #[test]
    fn attended_events_hide_participants() {
        let event = SourceEvent::Faculty(FacultyEvent {
            id: 1,
            fields: FacultyEventFields {
                faculty_id: 2,
                title: "Cloud FDP".into(),
                event_type: "FDP".into(),
                from_date: None,
                to_date: None,
                participants: Some(30),
                event_role: EventRole::Attended,
                remarks: None,
                attachments: vec![],
            },
            created_at: None,
        });
        let record = EventRecord::from_source(&event, None);
        assert_eq!(record.participants_display(), "-");
        assert_eq!(record.attachments, None);
        assert_eq!(record.duration_days(), None);
    }
}
