//! Visibility filter and aggregator: merges the two event tables, drops flagged rows,
//! orders the result and applies the dashboard filters over an in-memory snapshot.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::Context;
use ftrack_core::{
    parse_date, Actor, DurationBucket, EventRecord, EventRole, FlaggedEvent, OwnedEvent, SourceKind,
    TypeCatalog,
};
use ftrack_storage::{env_setting, EventBackend, StorageError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info_span, Instrument};

pub mod export;

pub use export::{export_xlsx, report_rows, ExportError, EXPORT_COLUMNS};

pub const CRATE_NAME: &str = "ftrack-report";

pub const CATALOG_FILE: &str = "catalog.yaml";

/// How flagged rows are matched against active rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExclusionScope {
    /// A flagged row hides only the row of the same source kind with the same id.
    #[default]
    PerSourceKind,
    /// A flagged row hides any row, of either kind, sharing its id.
    SharedId,
}

impl FromStr for ExclusionScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "per-source" | "per-source-kind" | "per_source" => Ok(ExclusionScope::PerSourceKind),
            "shared-id" | "shared_id" | "shared" => Ok(ExclusionScope::SharedId),
            other => Err(format!("unknown exclusion scope `{other}`")),
        }
    }
}

impl ExclusionScope {
    pub fn from_env() -> Self {
        env_setting("FTRACK_EXCLUSION_SCOPE", ExclusionScope::default())
    }
}

/// Immutable input to every filter pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerSnapshot {
    pub faculty: Vec<OwnedEvent>,
    pub department: Vec<OwnedEvent>,
    pub flagged: Vec<FlaggedEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeFilter {
    Exact(String),
    /// Faculty events whose type is outside the standard list.
    Others,
}

impl FromStr for TypeFilter {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("others") {
            Ok(TypeFilter::Others)
        } else {
            Ok(TypeFilter::Exact(trimmed.to_string()))
        }
    }
}

impl fmt::Display for TypeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeFilter::Exact(value) => f.write_str(value),
            TypeFilter::Others => f.write_str("Others"),
        }
    }
}

/// Conjunction of optional criteria; an unset field matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub source: Option<SourceKind>,
    pub event_type: Option<TypeFilter>,
    pub role: Option<EventRole>,
    /// Inclusive lower bound on `from_date`, compared as `yyyy-mm-dd` text.
    pub from: Option<String>,
    /// Inclusive upper bound on `to_date`.
    pub to: Option<String>,
    pub duration: Option<DurationBucket>,
    pub academic_year: Option<String>,
}

impl EventFilter {
    pub fn matches(&self, record: &EventRecord, catalog: &TypeCatalog) -> bool {
        if self.source.is_some_and(|kind| record.source_kind != kind) {
            return false;
        }
        match &self.event_type {
            Some(TypeFilter::Others) if record.source_kind == SourceKind::Faculty => {
                if catalog.is_standard_faculty_type(&record.event_type) {
                    return false;
                }
            }
            Some(TypeFilter::Others) => {
                if record.event_type != "Others" {
                    return false;
                }
            }
            Some(TypeFilter::Exact(value)) if record.event_type != *value => return false,
            _ => {}
        }
        if self.role.is_some_and(|role| record.role != Some(role)) {
            return false;
        }
        if let Some(from) = &self.from {
            if !record.from_date.as_deref().is_some_and(|d| d >= from.as_str()) {
                return false;
            }
        }
        if let Some(to) = &self.to {
            if !record.to_date.as_deref().is_some_and(|d| d <= to.as_str()) {
                return false;
            }
        }
        if self.duration.is_some_and(|bucket| !bucket.matches(record.duration_days())) {
            return false;
        }
        if let Some(year) = &self.academic_year {
            if record.academic_year().as_ref() != Some(year) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub faculty_events: usize,
    pub department_events: usize,
    pub flagged: usize,
    pub unflag_requests: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Aggregator {
    scope: ExclusionScope,
    catalog: TypeCatalog,
}

impl Aggregator {
    pub fn new(scope: ExclusionScope, catalog: TypeCatalog) -> Self {
        Self { scope, catalog }
    }

    pub fn scope(&self) -> ExclusionScope {
        self.scope
    }

    pub fn catalog(&self) -> &TypeCatalog {
        &self.catalog
    }

    /// Fetch the rows `actor` may see. The three queries run concurrently and the load
    /// fails as a whole if any of them fails.
    pub async fn load(
        &self,
        backend: &dyn EventBackend,
        actor: &Actor,
    ) -> Result<LedgerSnapshot, StorageError> {
        let list = |kind: SourceKind| async move {
            if actor.sees(kind) {
                backend.list_events(kind, actor.owner_filter(kind)).await
            } else {
                Ok(Vec::new())
            }
        };
        let flagged_owner = match self.scope {
            ExclusionScope::PerSourceKind => actor.owner_key(),
            ExclusionScope::SharedId => None,
        };
        let span = info_span!("load_snapshot", actor = %actor, backend = backend.name());
        let (faculty, department, flagged) = async {
            tokio::try_join!(
                list(SourceKind::Faculty),
                list(SourceKind::Department),
                backend.list_flagged(flagged_owner)
            )
        }
        .instrument(span)
        .await?;
        debug!(
            faculty = faculty.len(),
            department = department.len(),
            flagged = flagged.len(),
            "snapshot loaded"
        );
        Ok(LedgerSnapshot {
            faculty,
            department,
            flagged,
        })
    }

    /// Active, non-flagged records, newest `from_date` first.
    pub fn visible(&self, snapshot: &LedgerSnapshot) -> Vec<EventRecord> {
        let keyed: HashSet<(SourceKind, i64)> = snapshot
            .flagged
            .iter()
            .map(|f| (f.source(), f.event_id))
            .collect();
        let shared: HashSet<i64> = snapshot.flagged.iter().map(|f| f.event_id).collect();
        let hidden = |owned: &OwnedEvent| match self.scope {
            ExclusionScope::PerSourceKind => keyed.contains(&(owned.event.kind(), owned.event.id())),
            ExclusionScope::SharedId => shared.contains(&owned.event.id()),
        };

        let mut records: Vec<EventRecord> = snapshot
            .faculty
            .iter()
            .chain(snapshot.department.iter())
            .filter(|owned| !hidden(*owned))
            .map(EventRecord::from_owned)
            .collect();
        records.sort_by_key(|r| std::cmp::Reverse(r.from_date.as_deref().and_then(parse_date)));
        records
    }

    pub fn view(&self, snapshot: &LedgerSnapshot, filter: &EventFilter) -> Vec<EventRecord> {
        self.visible(snapshot)
            .into_iter()
            .filter(|record| filter.matches(record, &self.catalog))
            .collect()
    }

    /// Distinct academic years present in `records`, newest first.
    pub fn academic_years(&self, records: &[EventRecord]) -> Vec<String> {
        let years: BTreeSet<String> = records.iter().filter_map(EventRecord::academic_year).collect();
        years.into_iter().rev().collect()
    }

    pub fn summarize(&self, snapshot: &LedgerSnapshot) -> Summary {
        let visible = self.visible(snapshot);
        Summary {
            faculty_events: visible
                .iter()
                .filter(|r| r.source_kind == SourceKind::Faculty)
                .count(),
            department_events: visible
                .iter()
                .filter(|r| r.source_kind == SourceKind::Department)
                .count(),
            flagged: snapshot.flagged.len(),
            unflag_requests: snapshot.flagged.iter().filter(|f| f.unflag_requested).count(),
        }
    }
}

/// Read `catalog.yaml` from `root`, falling back to the built-in type lists when absent.
pub fn load_catalog(root: &Path) -> anyhow::Result<TypeCatalog> {
    let path = root.join(CATALOG_FILE);
    if !path.exists() {
        return Ok(TypeCatalog::default());
    }
    let yaml = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    let catalog: TypeCatalog =
        serde_yaml::from_str(&yaml).with_context(|| format!("parsing {}", path.display()))?;
    Ok(catalog)
}
