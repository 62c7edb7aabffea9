use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use ftrack_core::{Actor, DurationBucket, EventRole, SourceKind};
use ftrack_import::{department_drafts, read_rows, template_xlsx};
use ftrack_ledger::{ConfirmationGate, FixedAnswer, Ledger, LedgerAction};
use ftrack_report::{export_xlsx, load_catalog, Aggregator, EventFilter, ExclusionScope, TypeFilter};
use ftrack_storage::{connect, EventBackend, PgBackend, StorageConfig};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ftrack-cli")]
#[command(about = "Faculty activity tracker command-line interface")]
struct Cli {
    /// Who the command runs as: `admin`, `faculty:<id>` or `department:<id>`.
    /// Required by every command that reads or changes events.
    #[arg(long, global = true, env = "FTRACK_ACTOR")]
    actor: Option<Actor>,
    /// Confirm every action without prompting.
    #[arg(long, short = 'y', global = true)]
    yes: bool,
    /// Print results as JSON.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API.
    Serve,
    /// Apply the Postgres schema.
    Migrate,
    /// List visible events.
    Events(FilterArgs),
    /// Academic years present in the visible events.
    Years,
    /// Counts of visible, flagged and pending rows.
    Summary,
    /// List flagged events.
    Flagged,
    Flag {
        kind: SourceKind,
        id: i64,
        #[arg(long)]
        comment: String,
        #[arg(long)]
        owner_email: Option<String>,
    },
    RequestUnflag {
        flagged_id: i64,
        #[arg(long)]
        comment: String,
    },
    ApproveUnflag {
        flagged_id: i64,
    },
    DeleteFlagged {
        flagged_id: i64,
    },
    DeleteEvent {
        kind: SourceKind,
        id: i64,
    },
    /// Import department events from an `.xlsx` file.
    Import {
        path: PathBuf,
        /// Target department when importing as admin.
        #[arg(long)]
        department_id: Option<i64>,
    },
    /// Write the filtered event view to an `.xlsx` file.
    Export {
        path: PathBuf,
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Write a blank department import template.
    Template { path: PathBuf },
}

#[derive(Debug, Clone, Default, Args)]
struct FilterArgs {
    #[arg(long)]
    source: Option<SourceKind>,
    /// Exact event type, or `Others` for non-standard faculty types.
    #[arg(long = "type")]
    event_type: Option<String>,
    #[arg(long)]
    role: Option<EventRole>,
    /// Earliest start date (yyyy-mm-dd).
    #[arg(long)]
    from: Option<String>,
    /// Latest end date (yyyy-mm-dd).
    #[arg(long)]
    to: Option<String>,
    /// Duration bucket: 1, 2-7, 8-30 or 31+.
    #[arg(long)]
    days: Option<DurationBucket>,
    /// Academic year such as 2023-2024.
    #[arg(long)]
    year: Option<String>,
}

impl FilterArgs {
    fn into_filter(self) -> EventFilter {
        EventFilter {
            source: self.source,
            event_type: self.event_type.and_then(|v| v.parse::<TypeFilter>().ok()),
            role: self.role,
            from: self.from,
            to: self.to,
            duration: self.days,
            academic_year: self.year,
        }
    }
}

/// Prompts on stderr and reads the answer from stdin.
struct StdinGate;

impl ConfirmationGate for StdinGate {
    fn confirm(&self, action: &LedgerAction) -> bool {
        eprint!("About to {action}. Continue? [y/N] ");
        if io::stderr().flush().is_err() {
            return false;
        }
        let mut answer = String::new();
        match io::stdin().lock().read_line(&mut answer) {
            Ok(_) => matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
            Err(_) => false,
        }
    }
}

struct Session {
    backend: Arc<dyn EventBackend>,
    aggregator: Aggregator,
}

async fn open() -> Result<Session> {
    let config = StorageConfig::from_env();
    let backend = connect(&config)
        .await
        .with_context(|| format!("connecting to {:?} backend", config.backend))?;
    let aggregator = Aggregator::new(ExclusionScope::from_env(), load_catalog(Path::new("."))?);
    Ok(Session { backend, aggregator })
}

fn require_actor(actor: Option<Actor>) -> Result<Actor> {
    actor.context("--actor (or FTRACK_ACTOR) is required for this command")
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let gate: Box<dyn ConfirmationGate> = if cli.yes {
        Box::new(FixedAnswer(true))
    } else {
        Box::new(StdinGate)
    };

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => ftrack_web::serve_from_env().await?,
        Commands::Migrate => {
            let config = StorageConfig::from_env();
            let backend = PgBackend::connect(&config.database_url, config.max_connections).await?;
            backend.migrate().await?;
            println!("migrations applied");
        }
        Commands::Events(filter) => {
            let actor = require_actor(cli.actor)?;
            let ctx = open().await?;
            let snapshot = ctx.aggregator.load(ctx.backend.as_ref(), &actor).await?;
            let view = ctx.aggregator.view(&snapshot, &filter.into_filter());
            if cli.json {
                print_json(&view)?;
            } else {
                for r in &view {
                    println!(
                        "{:<10} {:>5}  {}  {:<10} {:<10} {:<16} {}",
                        r.source_kind.label(),
                        r.id,
                        r.academic_year().unwrap_or_else(|| "-".into()),
                        r.from_date.as_deref().unwrap_or("-"),
                        r.to_date.as_deref().unwrap_or("-"),
                        r.event_type,
                        r.title
                    );
                }
                println!("{} events", view.len());
            }
        }
        Commands::Years => {
            let actor = require_actor(cli.actor)?;
            let ctx = open().await?;
            let snapshot = ctx.aggregator.load(ctx.backend.as_ref(), &actor).await?;
            let years = ctx.aggregator.academic_years(&ctx.aggregator.visible(&snapshot));
            if cli.json {
                print_json(&years)?;
            } else {
                for year in years {
                    println!("{year}");
                }
            }
        }
        Commands::Summary => {
            let actor = require_actor(cli.actor)?;
            let ctx = open().await?;
            let snapshot = ctx.aggregator.load(ctx.backend.as_ref(), &actor).await?;
            let summary = ctx.aggregator.summarize(&snapshot);
            if cli.json {
                print_json(&summary)?;
            } else {
                println!(
                    "faculty={} department={} flagged={} unflag_requests={}",
                    summary.faculty_events,
                    summary.department_events,
                    summary.flagged,
                    summary.unflag_requests
                );
            }
        }
        Commands::Flagged => {
            let actor = require_actor(cli.actor)?;
            let ctx = open().await?;
            let flagged = ctx.backend.list_flagged(actor.owner_key()).await?;
            if cli.json {
                print_json(&flagged)?;
            } else {
                for f in &flagged {
                    println!(
                        "{:>5}  {:<10} event={:<5} {:?}  {}  [{}]",
                        f.id,
                        f.source().label(),
                        f.event_id,
                        f.state(),
                        f.snapshot.title(),
                        f.admin_comment
                    );
                }
            }
        }
        Commands::Flag {
            kind,
            id,
            comment,
            owner_email,
        } => {
            let actor = require_actor(cli.actor)?;
            let ctx = open().await?;
            let ledger = Ledger::new(ctx.backend);
            let flagged = ledger
                .flag(&actor, kind, id, comment, owner_email, gate.as_ref())
                .await?;
            report(cli.json, &flagged, format!("flagged as {}", flagged.id))?;
        }
        Commands::RequestUnflag { flagged_id, comment } => {
            let actor = require_actor(cli.actor)?;
            let ctx = open().await?;
            let ledger = Ledger::new(ctx.backend);
            let flagged = ledger
                .request_unflag(&actor, flagged_id, comment, gate.as_ref())
                .await?;
            report(cli.json, &flagged, format!("unflag requested for {}", flagged.id))?;
        }
        Commands::ApproveUnflag { flagged_id } => {
            let actor = require_actor(cli.actor)?;
            let ctx = open().await?;
            let ledger = Ledger::new(ctx.backend);
            let event = ledger
                .approve_unflag(&actor, flagged_id, gate.as_ref())
                .await?;
            report(
                cli.json,
                &event,
                format!("restored {} event {}", event.kind().label(), event.id()),
            )?;
        }
        Commands::DeleteFlagged { flagged_id } => {
            let actor = require_actor(cli.actor)?;
            let ctx = open().await?;
            let ledger = Ledger::new(ctx.backend);
            ledger.delete_flagged(&actor, flagged_id, gate.as_ref()).await?;
            println!("deleted flagged event {flagged_id}");
        }
        Commands::DeleteEvent { kind, id } => {
            let actor = require_actor(cli.actor)?;
            let ctx = open().await?;
            let ledger = Ledger::new(ctx.backend);
            ledger.delete_active(&actor, kind, id, gate.as_ref()).await?;
            println!("deleted {} event {id}", kind.label().to_lowercase());
        }
        Commands::Import {
            path,
            department_id,
        } => {
            let actor = require_actor(cli.actor)?;
            let department_id = match (actor, department_id) {
                (Actor::Department(id), _) | (Actor::Admin, Some(id)) => id,
                (Actor::Admin, None) => bail!("--department-id is required when importing as admin"),
                (Actor::Faculty(_), _) => bail!("{actor} may not import department events"),
            };
            let bytes = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
            let rows = read_rows(&bytes)?;
            let parsed = department_drafts(&rows, department_id)?;
            let ctx = open().await?;
            let ledger = Ledger::new(ctx.backend);
            let events = ledger
                .import_department_events(&actor, parsed.drafts, gate.as_ref())
                .await?;
            info!(path = %path.display(), imported = events.len(), "import finished");
            if cli.json {
                print_json(&events)?;
            } else {
                println!("imported {} events", events.len());
                if !parsed.skipped.is_empty() {
                    println!("skipped rows: {:?}", parsed.skipped);
                }
            }
        }
        Commands::Export { path, filter } => {
            let actor = require_actor(cli.actor)?;
            let ctx = open().await?;
            let snapshot = ctx.aggregator.load(ctx.backend.as_ref(), &actor).await?;
            let view = ctx.aggregator.view(&snapshot, &filter.into_filter());
            let bytes = export_xlsx(&view)?;
            std::fs::write(&path, bytes).with_context(|| format!("writing {}", path.display()))?;
            println!("wrote {} events to {}", view.len(), path.display());
        }
        Commands::Template { path } => {
            let catalog = load_catalog(Path::new("."))?;
            let bytes = template_xlsx(&catalog.department_types)?;
            std::fs::write(&path, bytes).with_context(|| format!("writing {}", path.display()))?;
            println!("wrote template to {}", path.display());
        }
    }

    Ok(())
}

fn report<T: Serialize>(json: bool, value: &T, line: String) -> Result<()> {
    if json {
        print_json(value)
    } else {
        println!("{line}");
        Ok(())
    }
}
