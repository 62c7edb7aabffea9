//! JSON API over the moderation ledger, the filtered event view and the spreadsheet
//! import/export.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{FromRequestParts, Path as AxumPath, Query, State},
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use ftrack_core::{
    Actor, Department, DepartmentEventFields, DurationBucket, EventFields, EventRecord, EventRole,
    FacultyEventFields, FacultyMember, FlaggedEvent, SourceEvent, SourceKind,
};
use ftrack_import::{department_drafts, read_rows, template_xlsx};
use ftrack_ledger::{FixedAnswer, Ledger, LedgerError};
use ftrack_report::{
    export_xlsx, load_catalog, Aggregator, EventFilter, ExclusionScope, LedgerSnapshot, Summary,
    TypeFilter,
};
use ftrack_storage::{connect, env_setting, EventBackend, StorageConfig};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

mod attachments;
mod error;

pub use attachments::{AttachmentError, AttachmentFetcher, ZIP_CONTENT_TYPE, ZIP_FOLDER};
pub use error::ApiError;

pub const CRATE_NAME: &str = "ftrack-web";

/// Request header naming the caller, e.g. `admin` or `faculty:12`.
pub const ACTOR_HEADER: &str = "x-ftrack-actor";

pub const XLSX_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

pub struct AppState {
    pub ledger: Ledger,
    pub aggregator: Aggregator,
    pub attachments: AttachmentFetcher,
}

impl AppState {
    pub fn new(
        backend: Arc<dyn EventBackend>,
        aggregator: Aggregator,
        attachments: AttachmentFetcher,
    ) -> Self {
        Self {
            ledger: Ledger::new(backend),
            aggregator,
            attachments,
        }
    }

    fn backend(&self) -> &dyn EventBackend {
        self.ledger.backend().as_ref()
    }

    async fn snapshot(&self, actor: &Actor) -> Result<LedgerSnapshot, ApiError> {
        Ok(self.aggregator.load(self.backend(), actor).await?)
    }
}

/// The caller identified by [`ACTOR_HEADER`].
#[derive(Debug, Clone, Copy)]
pub struct RequestActor(pub Actor);

impl<S> FromRequestParts<S> for RequestActor
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(ACTOR_HEADER)
            .ok_or_else(|| ApiError::Unauthorized(format!("missing {ACTOR_HEADER} header")))?
            .to_str()
            .map_err(|_| ApiError::Unauthorized(format!("unreadable {ACTOR_HEADER} header")))?;
        raw.parse::<Actor>()
            .map(RequestActor)
            .map_err(|err| ApiError::Unauthorized(format!("{err}")))
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/events", get(events_handler))
        .route("/events/years", get(years_handler))
        .route("/events/summary", get(summary_handler))
        .route("/events/export", get(export_handler))
        .route("/events/faculty", post(create_faculty_handler))
        .route("/events/department", post(create_department_handler))
        .route("/events/department/{id}", put(update_department_handler))
        .route("/events/department/import", post(import_handler))
        .route("/events/department/template", get(template_handler))
        .route("/events/{kind}/{id}/flag", post(flag_handler))
        .route("/events/{kind}/{id}/delete", post(delete_event_handler))
        .route("/events/{kind}/{id}/attachments.zip", get(attachments_handler))
        .route("/flagged", get(flagged_handler))
        .route("/flagged/{id}/request-unflag", post(request_unflag_handler))
        .route("/flagged/{id}/approve", post(approve_handler))
        .route("/flagged/{id}/delete", post(delete_flagged_handler))
        .route("/directory/faculty", get(faculty_directory_handler))
        .route("/directory/departments", get(department_directory_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = env_setting("FTRACK_WEB_PORT", 8000);
    let config = StorageConfig::from_env();
    let backend = connect(&config).await?;
    let aggregator = Aggregator::new(ExclusionScope::from_env(), load_catalog(Path::new("."))?);
    let attachments = AttachmentFetcher::new(Duration::from_secs(config.http_timeout_secs))?;
    info!(port, backend = backend.name(), scope = ?aggregator.scope(), "starting web server");
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(AppState::new(backend, aggregator, attachments))).await?;
    Ok(())
}

/// Dashboard filter parameters; blank values and `all` mean no restriction.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventsQuery {
    pub source: Option<String>,
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    pub role: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub days: Option<String>,
    pub year: Option<String>,
}

fn selected(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("all"))
}

impl EventsQuery {
    pub fn into_filter(self) -> Result<EventFilter, ApiError> {
        let bad = |err: ftrack_core::ParseError| ApiError::BadRequest(err.to_string());
        Ok(EventFilter {
            source: selected(self.source)
                .map(|v| v.parse::<SourceKind>())
                .transpose()
                .map_err(bad)?,
            event_type: selected(self.event_type).and_then(|v| v.parse::<TypeFilter>().ok()),
            role: selected(self.role)
                .map(|v| v.parse::<EventRole>())
                .transpose()
                .map_err(bad)?,
            from: selected(self.from),
            to: selected(self.to),
            duration: selected(self.days)
                .map(|v| v.parse::<DurationBucket>())
                .transpose()
                .map_err(bad)?,
            academic_year: selected(self.year),
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfirmBody {
    #[serde(default)]
    pub confirm: bool,
}

/// A mutating request body; `confirm` must be `true` for the action to run.
#[derive(Debug, Clone, Deserialize)]
pub struct Confirmed<T> {
    #[serde(default)]
    pub confirm: bool,
    #[serde(flatten)]
    pub body: T,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlagBody {
    pub comment: String,
    #[serde(default)]
    pub owner_email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommentBody {
    pub comment: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImportQuery {
    #[serde(default)]
    pub confirm: bool,
    /// Target department when an admin imports on a department's behalf.
    pub department_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportResponse {
    pub imported: usize,
    pub skipped: Vec<usize>,
    pub events: Vec<SourceEvent>,
}

fn parse_kind(raw: &str) -> Result<SourceKind, ApiError> {
    raw.parse::<SourceKind>()
        .map_err(|err| ApiError::BadRequest(err.to_string()))
}

fn xlsx_response(filename: &str, bytes: Vec<u8>) -> Response {
    (
        [
            (header::CONTENT_TYPE, XLSX_CONTENT_TYPE.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        bytes,
    )
        .into_response()
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "backend": state.backend().name(),
        "revision": state.ledger.revision(),
    }))
}

async fn events_handler(
    State(state): State<Arc<AppState>>,
    RequestActor(actor): RequestActor,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Vec<EventRecord>>, ApiError> {
    let filter = query.into_filter()?;
    let snapshot = state.snapshot(&actor).await?;
    Ok(Json(state.aggregator.view(&snapshot, &filter)))
}

async fn years_handler(
    State(state): State<Arc<AppState>>,
    RequestActor(actor): RequestActor,
) -> Result<Json<Vec<String>>, ApiError> {
    let snapshot = state.snapshot(&actor).await?;
    let visible = state.aggregator.visible(&snapshot);
    Ok(Json(state.aggregator.academic_years(&visible)))
}

async fn summary_handler(
    State(state): State<Arc<AppState>>,
    RequestActor(actor): RequestActor,
) -> Result<Json<Summary>, ApiError> {
    let snapshot = state.snapshot(&actor).await?;
    Ok(Json(state.aggregator.summarize(&snapshot)))
}

async fn export_handler(
    State(state): State<Arc<AppState>>,
    RequestActor(actor): RequestActor,
    Query(query): Query<EventsQuery>,
) -> Result<Response, ApiError> {
    let filter = query.into_filter()?;
    let snapshot = state.snapshot(&actor).await?;
    let view = state.aggregator.view(&snapshot, &filter);
    let bytes = export_xlsx(&view)?;
    Ok(xlsx_response("events.xlsx", bytes))
}

async fn create_faculty_handler(
    State(state): State<Arc<AppState>>,
    RequestActor(actor): RequestActor,
    Json(req): Json<Confirmed<FacultyEventFields>>,
) -> Result<(StatusCode, Json<SourceEvent>), ApiError> {
    let event = state
        .ledger
        .create_event(&actor, EventFields::Faculty(req.body), &FixedAnswer(req.confirm))
        .await?;
    Ok((StatusCode::CREATED, Json(event)))
}

async fn create_department_handler(
    State(state): State<Arc<AppState>>,
    RequestActor(actor): RequestActor,
    Json(req): Json<Confirmed<DepartmentEventFields>>,
) -> Result<(StatusCode, Json<SourceEvent>), ApiError> {
    let event = state
        .ledger
        .create_event(&actor, EventFields::Department(req.body), &FixedAnswer(req.confirm))
        .await?;
    Ok((StatusCode::CREATED, Json(event)))
}

async fn update_department_handler(
    State(state): State<Arc<AppState>>,
    RequestActor(actor): RequestActor,
    AxumPath(id): AxumPath<i64>,
    Json(req): Json<Confirmed<DepartmentEventFields>>,
) -> Result<Json<SourceEvent>, ApiError> {
    let event = state
        .ledger
        .update_department_event(&actor, id, req.body, &FixedAnswer(req.confirm))
        .await?;
    Ok(Json(event))
}

async fn import_handler(
    State(state): State<Arc<AppState>>,
    RequestActor(actor): RequestActor,
    Query(query): Query<ImportQuery>,
    body: Bytes,
) -> Result<(StatusCode, Json<ImportResponse>), ApiError> {
    let department_id = match (actor, query.department_id) {
        (Actor::Department(id), _) => id,
        (Actor::Admin, Some(id)) => id,
        (Actor::Admin, None) => {
            return Err(ApiError::BadRequest(
                "department_id is required when an admin imports".to_string(),
            ))
        }
        (Actor::Faculty(_), _) => {
            return Err(ApiError::Ledger(LedgerError::Forbidden(format!(
                "{actor} may not import department events"
            ))))
        }
    };
    let rows = read_rows(&body)?;
    let report = department_drafts(&rows, department_id)?;
    let events = state
        .ledger
        .import_department_events(&actor, report.drafts, &FixedAnswer(query.confirm))
        .await?;
    info!(department_id, imported = events.len(), skipped = report.skipped.len(), "import applied");
    Ok((
        StatusCode::CREATED,
        Json(ImportResponse {
            imported: events.len(),
            skipped: report.skipped,
            events,
        }),
    ))
}

async fn template_handler(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let bytes = template_xlsx(&state.aggregator.catalog().department_types)?;
    Ok(xlsx_response("department_events_template.xlsx", bytes))
}

async fn flag_handler(
    State(state): State<Arc<AppState>>,
    RequestActor(actor): RequestActor,
    AxumPath((kind, id)): AxumPath<(String, i64)>,
    Json(req): Json<Confirmed<FlagBody>>,
) -> Result<(StatusCode, Json<FlaggedEvent>), ApiError> {
    let kind = parse_kind(&kind)?;
    let flagged = state
        .ledger
        .flag(
            &actor,
            kind,
            id,
            req.body.comment,
            req.body.owner_email,
            &FixedAnswer(req.confirm),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(flagged)))
}

async fn delete_event_handler(
    State(state): State<Arc<AppState>>,
    RequestActor(actor): RequestActor,
    AxumPath((kind, id)): AxumPath<(String, i64)>,
    Json(req): Json<ConfirmBody>,
) -> Result<StatusCode, ApiError> {
    let kind = parse_kind(&kind)?;
    state
        .ledger
        .delete_active(&actor, kind, id, &FixedAnswer(req.confirm))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Every attachment of one faculty event as `event_<id>_attachments.zip`.
async fn attachments_handler(
    State(state): State<Arc<AppState>>,
    RequestActor(actor): RequestActor,
    AxumPath((kind, id)): AxumPath<(String, i64)>,
) -> Result<Response, ApiError> {
    if parse_kind(&kind)? != SourceKind::Faculty {
        return Err(ApiError::BadRequest(
            "only faculty events carry attachment files".to_string(),
        ));
    }
    let missing = || ApiError::from(LedgerError::NotFound { what: "faculty_events", id });
    let event = state
        .backend()
        .get_event(SourceKind::Faculty, id)
        .await?
        .ok_or_else(missing)?;
    if !actor.is_admin() && !actor.owns(event.owner()) {
        return Err(LedgerError::Forbidden(format!("{actor} does not own faculty_events row {id}")).into());
    }
    let SourceEvent::Faculty(event) = event else {
        return Err(missing());
    };
    if event.fields.attachments.is_empty() {
        return Err(ApiError::NotFound(format!("faculty event {id} has no attachments")));
    }
    let bytes = state.attachments.bundle(&event.fields.attachments).await?;
    info!(event_id = id, files = event.fields.attachments.len(), bytes = bytes.len(), "attachments bundled");
    Ok((
        [
            (header::CONTENT_TYPE, ZIP_CONTENT_TYPE.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"event_{id}_attachments.zip\""),
            ),
        ],
        bytes,
    )
        .into_response())
}

async fn flagged_handler(
    State(state): State<Arc<AppState>>,
    RequestActor(actor): RequestActor,
) -> Result<Json<Vec<FlaggedEvent>>, ApiError> {
    let flagged = state.backend().list_flagged(actor.owner_key()).await?;
    Ok(Json(flagged))
}

async fn request_unflag_handler(
    State(state): State<Arc<AppState>>,
    RequestActor(actor): RequestActor,
    AxumPath(id): AxumPath<i64>,
    Json(req): Json<Confirmed<CommentBody>>,
) -> Result<Json<FlaggedEvent>, ApiError> {
    let flagged = state
        .ledger
        .request_unflag(&actor, id, req.body.comment, &FixedAnswer(req.confirm))
        .await?;
    Ok(Json(flagged))
}

async fn approve_handler(
    State(state): State<Arc<AppState>>,
    RequestActor(actor): RequestActor,
    AxumPath(id): AxumPath<i64>,
    Json(req): Json<ConfirmBody>,
) -> Result<Json<SourceEvent>, ApiError> {
    let restored = state
        .ledger
        .approve_unflag(&actor, id, &FixedAnswer(req.confirm))
        .await?;
    Ok(Json(restored))
}

async fn delete_flagged_handler(
    State(state): State<Arc<AppState>>,
    RequestActor(actor): RequestActor,
    AxumPath(id): AxumPath<i64>,
    Json(req): Json<ConfirmBody>,
) -> Result<StatusCode, ApiError> {
    state
        .ledger
        .delete_flagged(&actor, id, &FixedAnswer(req.confirm))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn faculty_directory_handler(
    State(state): State<Arc<AppState>>,
    RequestActor(_actor): RequestActor,
) -> Result<Json<Vec<FacultyMember>>, ApiError> {
    Ok(Json(state.backend().list_faculty().await?))
}

async fn department_directory_handler(
    State(state): State<Arc<AppState>>,
    RequestActor(_actor): RequestActor,
) -> Result<Json<Vec<Department>>, ApiError> {
    Ok(Json(state.backend().list_departments().await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_and_all_query_values_do_not_filter() {
        let query = EventsQuery {
            source: Some("all".into()),
            event_type: Some("  ".into()),
            role: Some("Organized".into()),
            days: Some("2-7".into()),
            year: Some("2023-2024".into()),
            ..Default::default()
        };
        let filter = query.into_filter().unwrap();
        assert_eq!(filter.source, None);
        assert_eq!(filter.event_type, None);
        assert_eq!(filter.role, Some(EventRole::Organized));
        assert_eq!(filter.duration, Some(DurationBucket::UpToWeek));
        assert_eq!(filter.academic_year.as_deref(), Some("2023-2024"));
    }

    #[test]
    fn unknown_bucket_is_a_bad_request() {
        let query = EventsQuery {
            days: Some("forever".into()),
            ..Default::default()
        };
        let err = query.into_filter().unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn others_type_maps_to_catch_all() {
        let query = EventsQuery {
            event_type: Some("Others".into()),
            ..Default::default()
        };
        assert_eq!(query.into_filter().unwrap().event_type, Some(TypeFilter::Others));
    }
}
