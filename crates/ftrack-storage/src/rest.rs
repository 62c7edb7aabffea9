//! Hosted table-API backend (PostgREST conventions: `/rest/v1/<table>`, `eq.` filters,
//! `Prefer` headers). Each trait call is a single HTTP request.

use std::time::Duration;

use async_trait::async_trait;
use ftrack_core::{
    Department, DepartmentEvent, EventFields, FacultyEvent, FacultyMember, FlaggedEvent, FlaggedPatch,
    NewFlaggedEvent, OwnedEvent, OwnerKey, OwnerRef, SourceEvent, SourceKind,
};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::{EventBackend, FlaggedInsert, FlaggedRow, StorageError, DIRECTORY_LIMIT};

const RETURN_ROWS: &str = "return=representation";
const MERGE_DUPLICATES: &str = "resolution=merge-duplicates,return=minimal";

#[derive(Debug, Clone)]
pub struct RestConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RestBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct FacultyEventRow {
    #[serde(flatten)]
    event: FacultyEvent,
    #[serde(default)]
    owner: Option<OwnerRef>,
}

#[derive(Debug, Deserialize)]
struct DepartmentEventRow {
    #[serde(flatten)]
    event: DepartmentEvent,
    #[serde(default)]
    owner: Option<OwnerRef>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: Option<String>,
}

/// Error body `message` verbatim, falling back to the raw body and then the status text.
fn api_error(status: StatusCode, body: &str) -> StorageError {
    let message = serde_json::from_str::<ApiErrorBody>(body)
        .ok()
        .and_then(|b| b.message)
        .or_else(|| Some(body.trim().to_string()).filter(|b| !b.is_empty()))
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string());
    StorageError::Api {
        status: status.as_u16(),
        message,
    }
}

fn eq(value: impl std::fmt::Display) -> String {
    format!("eq.{value}")
}

fn owner_select(kind: SourceKind) -> &'static str {
    match kind {
        SourceKind::Faculty => "*,owner:faculty(name,email)",
        SourceKind::Department => "*,owner:departments(name,email)",
    }
}

fn decode_events(kind: SourceKind, rows: Vec<JsonValue>) -> Result<Vec<OwnedEvent>, StorageError> {
    let decode = |err: serde_json::Error| StorageError::Decode {
        table: kind.table(),
        message: err.to_string(),
    };
    rows.into_iter()
        .map(|row| {
            Ok(match kind {
                SourceKind::Faculty => {
                    let row: FacultyEventRow = serde_json::from_value(row).map_err(decode)?;
                    OwnedEvent {
                        event: SourceEvent::Faculty(row.event),
                        owner: row.owner,
                    }
                }
                SourceKind::Department => {
                    let row: DepartmentEventRow = serde_json::from_value(row).map_err(decode)?;
                    OwnedEvent {
                        event: SourceEvent::Department(row.event),
                        owner: row.owner,
                    }
                }
            })
        })
        .collect()
}

fn event_body(event: &SourceEvent) -> Result<JsonValue, StorageError> {
    let body = match event {
        SourceEvent::Faculty(e) => serde_json::to_value(e),
        SourceEvent::Department(e) => serde_json::to_value(e),
    };
    body.map_err(|err| StorageError::Decode {
        table: event.kind().table(),
        message: err.to_string(),
    })
}

impl RestBackend {
    pub fn new(config: RestConfig) -> Result<Self, StorageError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn request(&self, method: Method, table: &str) -> RequestBuilder {
        self.client
            .request(method, self.table_url(table))
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response, StorageError> {
        let response = request.send().await?;
        let status = response.status();
        debug!(status = status.as_u16(), url = %response.url(), "table api response");
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(api_error(status, &body))
    }

    async fn fetch<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, StorageError> {
        Ok(self.send(request).await?.json::<T>().await?)
    }

    async fn first_flagged(&self, request: RequestBuilder) -> Result<Option<FlaggedEvent>, StorageError> {
        let rows: Vec<FlaggedRow> = self.fetch(request).await?;
        rows.into_iter().next().map(FlaggedRow::into_flagged).transpose()
    }
}

#[async_trait]
impl EventBackend for RestBackend {
    fn name(&self) -> &'static str {
        "rest"
    }

    async fn list_events(
        &self,
        kind: SourceKind,
        owner_id: Option<i64>,
    ) -> Result<Vec<OwnedEvent>, StorageError> {
        let mut query = vec![
            ("select", owner_select(kind).to_string()),
            ("order", "from_date.desc.nullslast,id.desc".to_string()),
        ];
        if let Some(id) = owner_id {
            query.push((kind.owner_column(), eq(id)));
        }
        let rows: Vec<JsonValue> = self
            .fetch(self.request(Method::GET, kind.table()).query(&query))
            .await?;
        decode_events(kind, rows)
    }

    async fn get_event(&self, kind: SourceKind, id: i64) -> Result<Option<SourceEvent>, StorageError> {
        let rows: Vec<JsonValue> = self
            .fetch(
                self.request(Method::GET, kind.table())
                    .query(&[("select", owner_select(kind).to_string()), ("id", eq(id))]),
            )
            .await?;
        Ok(decode_events(kind, rows)?.into_iter().next().map(|owned| owned.event))
    }

    async fn insert_events(&self, rows: Vec<EventFields>) -> Result<Vec<SourceEvent>, StorageError> {
        let mut inserted = Vec::with_capacity(rows.len());
        for kind in SourceKind::ALL {
            let batch: Vec<JsonValue> = rows
                .iter()
                .filter(|fields| fields.kind() == kind)
                .map(|fields| match fields {
                    EventFields::Faculty(f) => serde_json::to_value(f),
                    EventFields::Department(d) => serde_json::to_value(d),
                })
                .collect::<Result<_, _>>()
                .map_err(|err| StorageError::Decode {
                    table: kind.table(),
                    message: err.to_string(),
                })?;
            if batch.is_empty() {
                continue;
            }
            let created: Vec<JsonValue> = self
                .fetch(
                    self.request(Method::POST, kind.table())
                        .header("Prefer", RETURN_ROWS)
                        .json(&batch),
                )
                .await?;
            inserted.extend(decode_events(kind, created)?.into_iter().map(|owned| owned.event));
        }
        Ok(inserted)
    }

    async fn update_event(&self, event: SourceEvent) -> Result<Option<SourceEvent>, StorageError> {
        let kind = event.kind();
        let body = match &event {
            SourceEvent::Faculty(e) => serde_json::to_value(&e.fields),
            SourceEvent::Department(e) => serde_json::to_value(&e.fields),
        }
        .map_err(|err| StorageError::Decode {
            table: kind.table(),
            message: err.to_string(),
        })?;
        let rows: Vec<JsonValue> = self
            .fetch(
                self.request(Method::PATCH, kind.table())
                    .query(&[("id", eq(event.id()))])
                    .header("Prefer", RETURN_ROWS)
                    .json(&body),
            )
            .await?;
        Ok(decode_events(kind, rows)?.into_iter().next().map(|owned| owned.event))
    }

    async fn upsert_event(&self, event: SourceEvent) -> Result<(), StorageError> {
        let body = event_body(&event)?;
        self.send(
            self.request(Method::POST, event.kind().table())
                .header("Prefer", MERGE_DUPLICATES)
                .json(&[body]),
        )
        .await?;
        Ok(())
    }

    async fn delete_event(&self, kind: SourceKind, id: i64) -> Result<bool, StorageError> {
        let rows: Vec<JsonValue> = self
            .fetch(
                self.request(Method::DELETE, kind.table())
                    .query(&[("id", eq(id))])
                    .header("Prefer", RETURN_ROWS),
            )
            .await?;
        Ok(!rows.is_empty())
    }

    async fn list_flagged(&self, owner: Option<OwnerKey>) -> Result<Vec<FlaggedEvent>, StorageError> {
        let mut query = vec![
            ("select", "*".to_string()),
            ("order", "created_at.desc,id.desc".to_string()),
        ];
        if let Some(key) = owner {
            query.push(("source_table", eq(key.kind.table())));
            query.push((key.kind.owner_column(), eq(key.id)));
        }
        let rows: Vec<FlaggedRow> = self
            .fetch(self.request(Method::GET, "flagged_events").query(&query))
            .await?;
        rows.into_iter().map(FlaggedRow::into_flagged).collect()
    }

    async fn get_flagged(&self, id: i64) -> Result<Option<FlaggedEvent>, StorageError> {
        self.first_flagged(
            self.request(Method::GET, "flagged_events")
                .query(&[("select", "*".to_string()), ("id", eq(id))]),
        )
        .await
    }

    async fn insert_flagged(&self, row: NewFlaggedEvent) -> Result<FlaggedEvent, StorageError> {
        let insert = FlaggedInsert::new(&row)?;
        self.first_flagged(
            self.request(Method::POST, "flagged_events")
                .header("Prefer", RETURN_ROWS)
                .json(&[insert]),
        )
        .await?
        .ok_or_else(|| StorageError::Backend("flagged_events insert returned no row".to_string()))
    }

    async fn update_flagged(
        &self,
        id: i64,
        patch: FlaggedPatch,
    ) -> Result<Option<FlaggedEvent>, StorageError> {
        self.first_flagged(
            self.request(Method::PATCH, "flagged_events")
                .query(&[("id", eq(id))])
                .header("Prefer", RETURN_ROWS)
                .json(&patch),
        )
        .await
    }

    async fn delete_flagged(&self, id: i64) -> Result<bool, StorageError> {
        let rows: Vec<JsonValue> = self
            .fetch(
                self.request(Method::DELETE, "flagged_events")
                    .query(&[("id", eq(id))])
                    .header("Prefer", RETURN_ROWS),
            )
            .await?;
        Ok(!rows.is_empty())
    }

    async fn list_faculty(&self) -> Result<Vec<FacultyMember>, StorageError> {
        self.fetch(self.request(Method::GET, "faculty").query(&[
            ("select", "id,faculty_id,name,email,school,department,mobile,gender".to_string()),
            ("order", "name.asc".to_string()),
            ("limit", DIRECTORY_LIMIT.to_string()),
        ]))
        .await
    }

    async fn list_departments(&self) -> Result<Vec<Department>, StorageError> {
        self.fetch(self.request(Method::GET, "departments").query(&[
            ("select", "id,department_id,name,email,school,head_name".to_string()),
            ("order", "name.asc".to_string()),
            ("limit", DIRECTORY_LIMIT.to_string()),
        ]))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_errors_surface_message_verbatim() {
        let err = api_error(
            StatusCode::CONFLICT,
            r#"{"code":"23505","message":"duplicate key value violates unique constraint \"faculty_events_pkey\""}"#,
        );
        assert_eq!(
            err.to_string(),
            "duplicate key value violates unique constraint \"faculty_events_pkey\""
        );

        let err = api_error(StatusCode::BAD_GATEWAY, "upstream down");
        assert_eq!(err.to_string(), "upstream down");

        let err = api_error(StatusCode::SERVICE_UNAVAILABLE, "");
        assert_eq!(err.to_string(), "Service Unavailable");
    }

    #[test]
    fn embedded_owner_rows_decode() {
        let rows = vec![serde_json::json!({
            "id": 11,
            "department_id": 3,
            "title": "Hack Night",
            "type": "Hackathon",
            "coordinator_name": "R. Iyer",
            "from_date": "2024-09-02",
            "to_date": "2024-09-03",
            "participants": 80,
            "location": "Lab 4",
            "output": null,
            "attachments": "https://drive.example/hack",
            "certificate_link": null,
            "created_at": "2024-09-04T10:00:00+00:00",
            "owner": {"name": "CSE", "email": "cse@example.edu"}
        })];
        let owned = decode_events(SourceKind::Department, rows).unwrap();
        assert_eq!(owned[0].event.id(), 11);
        assert_eq!(owned[0].event.owner().id, 3);
        assert_eq!(owned[0].owner.as_ref().and_then(|o| o.email.as_deref()), Some("cse@example.edu"));
    }

    #[test]
    fn table_urls_drop_trailing_slash() {
        let backend = RestBackend::new(RestConfig {
            base_url: "https://db.example.org/".into(),
            api_key: "anon".into(),
            timeout: Duration::from_secs(5),
        })
        .unwrap();
        assert_eq!(
            backend.table_url("flagged_events"),
            "https://db.example.org/rest/v1/flagged_events"
        );
    }
}
