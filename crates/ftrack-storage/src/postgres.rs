//! PostgreSQL backend over a `sqlx` pool. Moves run inside one transaction.

use async_trait::async_trait;
use ftrack_core::{
    Department, DepartmentEvent, DepartmentEventFields, EventFields, FacultyEvent, FacultyEventFields,
    FacultyMember, FlaggedEvent, FlaggedPatch, NewFlaggedEvent, OwnedEvent, OwnerKey, OwnerRef,
    SourceEvent, SourceKind,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgExecutor, PgPool, Row};
use tracing::{info, info_span, Instrument};

use crate::{EventBackend, FlaggedInsert, FlaggedRow, MoveError, StorageError, DIRECTORY_LIMIT};

const FACULTY_EVENT_COLUMNS: &str = "e.id, e.faculty_id, e.title, e.type, e.from_date, e.to_date, \
     e.participants, e.event_role, e.remarks, e.attachments, e.created_at";

const DEPARTMENT_EVENT_COLUMNS: &str = "e.id, e.department_id, e.title, e.type, e.coordinator_name, \
     e.from_date, e.to_date, e.participants, e.location, e.output, e.attachments, \
     e.certificate_link, e.created_at";

const FLAGGED_COLUMNS: &str = "id, event_id, source_table, snapshot, admin_comment, owner_comment, \
     unflag_requested, owner_email, created_at";

#[derive(Debug, Clone)]
pub struct PgBackend {
    pool: PgPool,
}

impl PgBackend {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

fn column_decode(column: &str, err: impl std::error::Error + Send + Sync + 'static) -> sqlx::Error {
    sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(err),
    }
}

fn faculty_event_from_row(row: &PgRow) -> Result<FacultyEvent, sqlx::Error> {
    let role: String = row.try_get("event_role")?;
    Ok(FacultyEvent {
        id: row.try_get("id")?,
        fields: FacultyEventFields {
            faculty_id: row.try_get("faculty_id")?,
            title: row.try_get("title")?,
            event_type: row.try_get("type")?,
            from_date: row.try_get("from_date")?,
            to_date: row.try_get("to_date")?,
            participants: row.try_get("participants")?,
            event_role: role.parse().map_err(|err| column_decode("event_role", err))?,
            remarks: row.try_get("remarks")?,
            attachments: row.try_get::<Option<Vec<String>>, _>("attachments")?.unwrap_or_default(),
        },
        created_at: row.try_get("created_at")?,
    })
}

fn department_event_from_row(row: &PgRow) -> Result<DepartmentEvent, sqlx::Error> {
    Ok(DepartmentEvent {
        id: row.try_get("id")?,
        fields: DepartmentEventFields {
            department_id: row.try_get("department_id")?,
            title: row.try_get("title")?,
            event_type: row.try_get("type")?,
            coordinator_name: row.try_get("coordinator_name")?,
            from_date: row.try_get("from_date")?,
            to_date: row.try_get("to_date")?,
            participants: row.try_get("participants")?,
            location: row.try_get("location")?,
            output: row.try_get("output")?,
            attachments: row.try_get("attachments")?,
            certificate_link: row.try_get("certificate_link")?,
        },
        created_at: row.try_get("created_at")?,
    })
}

fn source_event_from_row(kind: SourceKind, row: &PgRow) -> Result<SourceEvent, sqlx::Error> {
    Ok(match kind {
        SourceKind::Faculty => SourceEvent::Faculty(faculty_event_from_row(row)?),
        SourceKind::Department => SourceEvent::Department(department_event_from_row(row)?),
    })
}

fn flagged_from_row(row: &PgRow) -> Result<FlaggedEvent, StorageError> {
    FlaggedRow {
        id: row.try_get("id")?,
        event_id: row.try_get("event_id")?,
        source_table: row.try_get("source_table")?,
        snapshot: row.try_get("snapshot")?,
        admin_comment: row.try_get("admin_comment")?,
        owner_comment: row.try_get("owner_comment")?,
        unflag_requested: row.try_get("unflag_requested")?,
        owner_email: row.try_get("owner_email")?,
        created_at: row.try_get("created_at")?,
    }
    .into_flagged()
}

fn select_events_sql(kind: SourceKind) -> String {
    let (columns, owner_table) = match kind {
        SourceKind::Faculty => (FACULTY_EVENT_COLUMNS, "faculty"),
        SourceKind::Department => (DEPARTMENT_EVENT_COLUMNS, "departments"),
    };
    let owner_column = kind.owner_column();
    format!(
        "SELECT {columns}, o.name AS owner_name, o.email AS owner_email \
         FROM {table} e LEFT JOIN {owner_table} o ON o.id = e.{owner_column} \
         WHERE ($1::BIGINT IS NULL OR e.{owner_column} = $1) \
         ORDER BY e.from_date DESC NULLS LAST, e.id DESC",
        table = kind.table(),
    )
}

async fn insert_event_with<'e, E: PgExecutor<'e>>(
    exec: E,
    fields: &EventFields,
) -> Result<SourceEvent, StorageError> {
    let row = match fields {
        EventFields::Faculty(f) => {
            sqlx::query(&format!(
                "INSERT INTO faculty_events AS e (faculty_id, title, type, from_date, to_date, \
                 participants, event_role, remarks, attachments) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) RETURNING {FACULTY_EVENT_COLUMNS}"
            ))
            .bind(f.faculty_id)
            .bind(&f.title)
            .bind(&f.event_type)
            .bind(&f.from_date)
            .bind(&f.to_date)
            .bind(f.participants)
            .bind(f.event_role.as_str())
            .bind(&f.remarks)
            .bind(&f.attachments)
            .fetch_one(exec)
            .await?
        }
        EventFields::Department(d) => {
            sqlx::query(&format!(
                "INSERT INTO department_events AS e (department_id, title, type, coordinator_name, \
                 from_date, to_date, participants, location, output, attachments, certificate_link) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
                 RETURNING {DEPARTMENT_EVENT_COLUMNS}"
            ))
            .bind(d.department_id)
            .bind(&d.title)
            .bind(&d.event_type)
            .bind(&d.coordinator_name)
            .bind(&d.from_date)
            .bind(&d.to_date)
            .bind(d.participants)
            .bind(&d.location)
            .bind(&d.output)
            .bind(&d.attachments)
            .bind(&d.certificate_link)
            .fetch_one(exec)
            .await?
        }
    };
    Ok(source_event_from_row(fields.kind(), &row)?)
}

async fn upsert_event_with<'e, E: PgExecutor<'e>>(
    exec: E,
    event: &SourceEvent,
) -> Result<(), StorageError> {
    match event {
        SourceEvent::Faculty(e) => {
            let f = &e.fields;
            sqlx::query(
                "INSERT INTO faculty_events (id, faculty_id, title, type, from_date, to_date, \
                 participants, event_role, remarks, attachments) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
                 ON CONFLICT (id) DO UPDATE SET faculty_id = EXCLUDED.faculty_id, \
                 title = EXCLUDED.title, type = EXCLUDED.type, from_date = EXCLUDED.from_date, \
                 to_date = EXCLUDED.to_date, participants = EXCLUDED.participants, \
                 event_role = EXCLUDED.event_role, remarks = EXCLUDED.remarks, \
                 attachments = EXCLUDED.attachments",
            )
            .bind(e.id)
            .bind(f.faculty_id)
            .bind(&f.title)
            .bind(&f.event_type)
            .bind(&f.from_date)
            .bind(&f.to_date)
            .bind(f.participants)
            .bind(f.event_role.as_str())
            .bind(&f.remarks)
            .bind(&f.attachments)
            .execute(exec)
            .await?;
        }
        SourceEvent::Department(e) => {
            let d = &e.fields;
            sqlx::query(
                "INSERT INTO department_events (id, department_id, title, type, coordinator_name, \
                 from_date, to_date, participants, location, output, attachments, certificate_link) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
                 ON CONFLICT (id) DO UPDATE SET department_id = EXCLUDED.department_id, \
                 title = EXCLUDED.title, type = EXCLUDED.type, \
                 coordinator_name = EXCLUDED.coordinator_name, from_date = EXCLUDED.from_date, \
                 to_date = EXCLUDED.to_date, participants = EXCLUDED.participants, \
                 location = EXCLUDED.location, output = EXCLUDED.output, \
                 attachments = EXCLUDED.attachments, certificate_link = EXCLUDED.certificate_link",
            )
            .bind(e.id)
            .bind(d.department_id)
            .bind(&d.title)
            .bind(&d.event_type)
            .bind(&d.coordinator_name)
            .bind(&d.from_date)
            .bind(&d.to_date)
            .bind(d.participants)
            .bind(&d.location)
            .bind(&d.output)
            .bind(&d.attachments)
            .bind(&d.certificate_link)
            .execute(exec)
            .await?;
        }
    }
    Ok(())
}

async fn delete_event_with<'e, E: PgExecutor<'e>>(
    exec: E,
    kind: SourceKind,
    id: i64,
) -> Result<bool, StorageError> {
    let result = sqlx::query(&format!("DELETE FROM {} WHERE id = $1", kind.table()))
        .bind(id)
        .execute(exec)
        .await?;
    Ok(result.rows_affected() > 0)
}

async fn insert_flagged_with<'e, E: PgExecutor<'e>>(
    exec: E,
    row: &NewFlaggedEvent,
) -> Result<FlaggedEvent, StorageError> {
    let insert = FlaggedInsert::new(row)?;
    let stored = sqlx::query(&format!(
        "INSERT INTO flagged_events (event_id, source_table, faculty_id, department_id, title, \
         type, from_date, snapshot, admin_comment, unflag_requested, owner_email) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) RETURNING {FLAGGED_COLUMNS}"
    ))
    .bind(insert.event_id)
    .bind(insert.source_table)
    .bind(insert.faculty_id)
    .bind(insert.department_id)
    .bind(insert.title)
    .bind(insert.event_type)
    .bind(insert.from_date)
    .bind(&insert.snapshot)
    .bind(insert.admin_comment)
    .bind(insert.unflag_requested)
    .bind(insert.owner_email)
    .fetch_one(exec)
    .await?;
    flagged_from_row(&stored)
}

async fn delete_flagged_with<'e, E: PgExecutor<'e>>(exec: E, id: i64) -> Result<bool, StorageError> {
    let result = sqlx::query("DELETE FROM flagged_events WHERE id = $1")
        .bind(id)
        .execute(exec)
        .await?;
    Ok(result.rows_affected() > 0)
}

#[async_trait]
impl EventBackend for PgBackend {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn list_events(
        &self,
        kind: SourceKind,
        owner_id: Option<i64>,
    ) -> Result<Vec<OwnedEvent>, StorageError> {
        let rows = sqlx::query(&select_events_sql(kind))
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let name: Option<String> = row.try_get("owner_name")?;
            let email: Option<String> = row.try_get("owner_email")?;
            out.push(OwnedEvent {
                event: source_event_from_row(kind, &row)?,
                owner: (name.is_some() || email.is_some()).then_some(OwnerRef { name, email }),
            });
        }
        Ok(out)
    }

    async fn get_event(&self, kind: SourceKind, id: i64) -> Result<Option<SourceEvent>, StorageError> {
        let columns = match kind {
            SourceKind::Faculty => FACULTY_EVENT_COLUMNS,
            SourceKind::Department => DEPARTMENT_EVENT_COLUMNS,
        };
        let row = sqlx::query(&format!("SELECT {columns} FROM {} e WHERE e.id = $1", kind.table()))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| source_event_from_row(kind, &r)).transpose()?)
    }

    async fn insert_events(&self, rows: Vec<EventFields>) -> Result<Vec<SourceEvent>, StorageError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = Vec::with_capacity(rows.len());
        for fields in &rows {
            inserted.push(insert_event_with(&mut *tx, fields).await?);
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn update_event(&self, event: SourceEvent) -> Result<Option<SourceEvent>, StorageError> {
        let row = match &event {
            SourceEvent::Faculty(e) => {
                let f = &e.fields;
                sqlx::query(&format!(
                    "UPDATE faculty_events AS e SET faculty_id = $2, title = $3, type = $4, \
                     from_date = $5, to_date = $6, participants = $7, event_role = $8, remarks = $9, \
                     attachments = $10 WHERE e.id = $1 RETURNING {FACULTY_EVENT_COLUMNS}"
                ))
                .bind(e.id)
                .bind(f.faculty_id)
                .bind(&f.title)
                .bind(&f.event_type)
                .bind(&f.from_date)
                .bind(&f.to_date)
                .bind(f.participants)
                .bind(f.event_role.as_str())
                .bind(&f.remarks)
                .bind(&f.attachments)
                .fetch_optional(&self.pool)
                .await?
            }
            SourceEvent::Department(e) => {
                let d = &e.fields;
                sqlx::query(&format!(
                    "UPDATE department_events AS e SET department_id = $2, title = $3, type = $4, \
                     coordinator_name = $5, from_date = $6, to_date = $7, participants = $8, \
                     location = $9, output = $10, attachments = $11, certificate_link = $12 \
                     WHERE e.id = $1 RETURNING {DEPARTMENT_EVENT_COLUMNS}"
                ))
                .bind(e.id)
                .bind(d.department_id)
                .bind(&d.title)
                .bind(&d.event_type)
                .bind(&d.coordinator_name)
                .bind(&d.from_date)
                .bind(&d.to_date)
                .bind(d.participants)
                .bind(&d.location)
                .bind(&d.output)
                .bind(&d.attachments)
                .bind(&d.certificate_link)
                .fetch_optional(&self.pool)
                .await?
            }
        };
        Ok(row.map(|r| source_event_from_row(event.kind(), &r)).transpose()?)
    }

    async fn upsert_event(&self, event: SourceEvent) -> Result<(), StorageError> {
        upsert_event_with(&self.pool, &event).await
    }

    async fn delete_event(&self, kind: SourceKind, id: i64) -> Result<bool, StorageError> {
        delete_event_with(&self.pool, kind, id).await
    }

    async fn list_flagged(&self, owner: Option<OwnerKey>) -> Result<Vec<FlaggedEvent>, StorageError> {
        let rows = match owner {
            None => {
                sqlx::query(&format!(
                    "SELECT {FLAGGED_COLUMNS} FROM flagged_events ORDER BY created_at DESC, id DESC"
                ))
                .fetch_all(&self.pool)
                .await?
            }
            Some(key) => {
                sqlx::query(&format!(
                    "SELECT {FLAGGED_COLUMNS} FROM flagged_events \
                     WHERE source_table = $1 AND {} = $2 ORDER BY created_at DESC, id DESC",
                    key.kind.owner_column()
                ))
                .bind(key.kind.table())
                .bind(key.id)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(flagged_from_row).collect()
    }

    async fn get_flagged(&self, id: i64) -> Result<Option<FlaggedEvent>, StorageError> {
        let row = sqlx::query(&format!("SELECT {FLAGGED_COLUMNS} FROM flagged_events WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(flagged_from_row).transpose()
    }

    async fn insert_flagged(&self, row: NewFlaggedEvent) -> Result<FlaggedEvent, StorageError> {
        insert_flagged_with(&self.pool, &row).await
    }

    async fn update_flagged(
        &self,
        id: i64,
        patch: FlaggedPatch,
    ) -> Result<Option<FlaggedEvent>, StorageError> {
        let row = sqlx::query(&format!(
            "UPDATE flagged_events SET unflag_requested = COALESCE($2, unflag_requested), \
             owner_comment = COALESCE($3, owner_comment) WHERE id = $1 RETURNING {FLAGGED_COLUMNS}"
        ))
        .bind(id)
        .bind(patch.unflag_requested)
        .bind(patch.owner_comment)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(flagged_from_row).transpose()
    }

    async fn delete_flagged(&self, id: i64) -> Result<bool, StorageError> {
        delete_flagged_with(&self.pool, id).await
    }

    async fn list_faculty(&self) -> Result<Vec<FacultyMember>, StorageError> {
        let rows = sqlx::query(
            "SELECT id, faculty_id, name, email, school, department, mobile, gender \
             FROM faculty ORDER BY name LIMIT $1",
        )
        .bind(DIRECTORY_LIMIT)
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(FacultyMember {
                id: row.try_get("id")?,
                faculty_id: row.try_get("faculty_id")?,
                name: row.try_get("name")?,
                email: row.try_get("email")?,
                school: row.try_get("school")?,
                department: row.try_get("department")?,
                mobile: row.try_get("mobile")?,
                gender: row.try_get("gender")?,
            });
        }
        Ok(out)
    }

    async fn list_departments(&self) -> Result<Vec<Department>, StorageError> {
        let rows = sqlx::query(
            "SELECT id, department_id, name, email, school, head_name \
             FROM departments ORDER BY name LIMIT $1",
        )
        .bind(DIRECTORY_LIMIT)
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(Department {
                id: row.try_get("id")?,
                department_id: row.try_get("department_id")?,
                name: row.try_get("name")?,
                email: row.try_get("email")?,
                school: row.try_get("school")?,
                head_name: row.try_get("head_name")?,
            });
        }
        Ok(out)
    }

    async fn move_to_flagged(
        &self,
        event: &SourceEvent,
        row: NewFlaggedEvent,
    ) -> Result<FlaggedEvent, MoveError> {
        let span = info_span!("pg_move_to_flagged", table = event.kind().table(), event_id = event.id());
        async {
            let mut tx = self.pool.begin().await?;
            let flagged = insert_flagged_with(&mut *tx, &row).await?;
            if !delete_event_with(&mut *tx, event.kind(), event.id()).await? {
                return Err(StorageError::NotFound {
                    table: event.kind().table(),
                    id: event.id(),
                });
            }
            tx.commit().await?;
            Ok::<_, StorageError>(flagged)
        }
        .instrument(span)
        .await
        .map_err(MoveError::NotStarted)
    }

    async fn restore_from_flagged(
        &self,
        flagged: &FlaggedEvent,
        event: SourceEvent,
    ) -> Result<SourceEvent, MoveError> {
        let span = info_span!("pg_restore_from_flagged", flagged_id = flagged.id, event_id = event.id());
        async {
            let mut tx = self.pool.begin().await?;
            upsert_event_with(&mut *tx, &event).await?;
            if !delete_flagged_with(&mut *tx, flagged.id).await? {
                return Err(StorageError::NotFound {
                    table: "flagged_events",
                    id: flagged.id,
                });
            }
            tx.commit().await?;
            Ok::<_, StorageError>(())
        }
        .instrument(span)
        .await
        .map_err(MoveError::NotStarted)?;
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ftrack_core::EventRole;

    #[test]
    fn event_listing_joins_the_matching_owner_table() {
        let sql = select_events_sql(SourceKind::Department);
        assert!(sql.contains("FROM department_events e LEFT JOIN departments o"));
        assert!(sql.contains("o.id = e.department_id"));
        assert!(sql.contains("e.certificate_link"));

        let sql = select_events_sql(SourceKind::Faculty);
        assert!(sql.contains("LEFT JOIN faculty o ON o.id = e.faculty_id"));
        assert!(sql.contains("ORDER BY e.from_date DESC NULLS LAST"));
    }

    /// Runs only when `FTRACK_TEST_DATABASE_URL` points at a scratch database.
    #[tokio::test]
    async fn concurrent_moves_of_one_row_commit_once() {
        let Ok(url) = std::env::var("FTRACK_TEST_DATABASE_URL") else {
            return;
        };
        let backend = PgBackend::connect(&url, 4).await.unwrap();
        backend.migrate().await.unwrap();

        let tag = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let owner: i64 = sqlx::query_scalar(
            "INSERT INTO faculty (faculty_id, name, email) VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(format!("T{tag}"))
        .bind("Race Test")
        .bind(format!("race-{tag}@example.edu"))
        .fetch_one(&backend.pool)
        .await
        .unwrap();
        let event = backend
            .insert_events(vec![EventFields::Faculty(FacultyEventFields {
                faculty_id: owner,
                title: "Race".into(),
                event_type: "Seminar".into(),
                from_date: Some("2024-01-01".into()),
                to_date: Some("2024-01-01".into()),
                participants: None,
                event_role: EventRole::Attended,
                remarks: None,
                attachments: vec![],
            })])
            .await
            .unwrap()
            .remove(0);

        let (first, second) = tokio::join!(
            backend.move_to_flagged(&event, NewFlaggedEvent::from_event(&event, "dup", None)),
            backend.move_to_flagged(&event, NewFlaggedEvent::from_event(&event, "dup", None)),
        );
        let results = [first, second];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(MoveError::NotStarted(StorageError::NotFound { .. })))));

        let copies: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM flagged_events WHERE source_table = 'faculty_events' AND event_id = $1",
        )
        .bind(event.id())
        .fetch_one(&backend.pool)
        .await
        .unwrap();
        assert_eq!(copies, 1);
    }
}
