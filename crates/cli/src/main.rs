//! `tourbook-data` CLI entry-point.
//!
//! Every sub-command works on a JSON snapshot file shaped
//! `{ "<collection>": [ { "id": "...", ... }, ... ] }`, loaded into an
//! in-process store.
//!
//! Available sub-commands:
//! - `audit`: duplicate, burst and data-quality report for one collection.
//! - `reconcile`: delete the duplicates or one burst found by the audit.
//! - `browse`: page through a collection with reference hydration.

mod settings;

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use datalayer::{
    ConsumerLifecycleRegistry, DependentSpec, ListOrchestrator, ListSpec, QueryShape, Reference, ReferenceCache,
    ReferenceField, SystemClock,
};
use diagnostics::{audit, fetch_collection, AuditReport, DeletionPlan};
use store::{Field, Filter, MemoryStore, OrderBy};

use settings::Settings;

#[derive(Parser)]
#[command(
    name = "tourbook-data",
    about = "Data access diagnostics for the tour booking store",
    version
)]
struct Cli {
    /// JSON settings file.
    #[arg(long, global = true, env = "TOURBOOK_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct Source {
    /// Snapshot file to read.
    #[arg(long)]
    snapshot: PathBuf,
    /// Collection to work on.
    #[arg(long)]
    collection: String,
    /// Equality scope, `field=value`.  Repeatable.
    #[arg(long = "scope", value_parser = parse_pair)]
    scope: Vec<(String, String)>,
}

impl Source {
    fn filters(&self) -> Vec<Filter> {
        self.scope
            .iter()
            .map(|(field, value)| Filter::eq(Field::named(field.clone()), value.clone()))
            .collect()
    }
}

#[derive(Subcommand)]
enum Command {
    /// Report duplicates, creation bursts and incomplete records.
    Audit {
        #[command(flatten)]
        source: Source,
        /// Print the full report as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Delete duplicates or one burst, then write the snapshot back.
    Reconcile {
        #[command(flatten)]
        source: Source,
        /// Delete every duplicate of the audit, keeping originals (the default).
        #[arg(long, conflicts_with = "burst")]
        duplicates: bool,
        /// Delete every record created in this minute (`YYYY-MM-DDTHH:MM`).
        #[arg(long)]
        burst: Option<String>,
        /// Skip the confirmation prompt.
        #[arg(long)]
        yes: bool,
        /// Where to write the reconciled snapshot (defaults to the input).
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Page through a collection the way a list screen does.
    Browse {
        #[command(flatten)]
        source: Source,
        /// Field to order by, descending.
        #[arg(long, default_value = "date")]
        order_by: String,
        /// Page size (defaults to the configured one).
        #[arg(long)]
        page_size: Option<usize>,
        /// Number of pages to load.
        #[arg(long, default_value_t = 1)]
        pages: usize,
        /// Reference to hydrate, `field=collection`.  Repeatable.
        #[arg(long = "reference", value_parser = parse_pair)]
        references: Vec<(String, String)>,
        /// Dependent collection to index, `collection=foreignKey`.  Repeatable.
        #[arg(long = "dependent", value_parser = parse_pair)]
        dependents: Vec<(String, String)>,
    },
}

fn parse_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((k, v)) if !k.is_empty() && !v.is_empty() => Ok((k.to_owned(), v.to_owned())),
        _ => Err(format!("expected key=value, got '{raw}'")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;

    match cli.command {
        Command::Audit { source, json } => run_audit(&settings, &source, json).await,
        Command::Reconcile {
            source,
            duplicates: _,
            burst,
            yes,
            output,
        } => run_reconcile(&settings, &source, burst, yes, output).await,
        Command::Browse {
            source,
            order_by,
            page_size,
            pages,
            references,
            dependents,
        } => {
            let spec = ListSpec {
                shape: QueryShape {
                    collection: source.collection.clone(),
                    order_by: OrderBy::desc(order_by),
                    filters: source.filters(),
                },
                page_size: page_size.unwrap_or(settings.data_layer.page_size),
                references: references
                    .into_iter()
                    .map(|(field, collection)| ReferenceField::new(field, collection))
                    .collect(),
                dependents: dependents
                    .into_iter()
                    .map(|(collection, fk)| DependentSpec::new(collection, fk).tracking_latest())
                    .collect(),
            };
            run_browse(&settings, &source.snapshot, spec, pages).await
        }
    }
}

fn load_store(path: &Path) -> Result<MemoryStore> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("cannot read snapshot {}", path.display()))?;
    let value: serde_json::Value =
        serde_json::from_str(&raw).with_context(|| format!("invalid JSON in {}", path.display()))?;
    if !value.is_object() {
        bail!("snapshot {} must be an object of collections", path.display());
    }
    Ok(MemoryStore::from_value(&value))
}

fn save_store(store: &MemoryStore, path: &Path) -> Result<()> {
    let body = serde_json::to_string_pretty(&store.to_value())?;
    std::fs::write(path, body).with_context(|| format!("cannot write snapshot {}", path.display()))
}

// ---------------------------------------------------------------------------
// audit
// ---------------------------------------------------------------------------

async fn run_audit(settings: &Settings, source: &Source, as_json: bool) -> Result<()> {
    let store = load_store(&source.snapshot)?;
    let records = fetch_collection(&store, &source.collection, &source.filters()).await?;
    let report = audit(&records, Utc::now(), &settings.audit);

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&source.collection, &report);
    }
    Ok(())
}

fn print_report(collection: &str, report: &AuditReport) {
    println!("{collection}: {} records", report.total);
    println!("  by status:");
    for (status, count) in &report.by_status {
        println!("    {status:<16} {count}");
    }
    println!("  by entity type:");
    for (kind, count) in &report.by_entity_type {
        println!("    {kind:<16} {count}");
    }
    println!("  latest creation days:");
    for day in &report.by_created_day {
        println!("    {}  {}", day.day, day.count);
    }
    println!("  created recently: {}", report.recent.len());
    println!("  duplicates: {}", report.duplicates.len());
    for pair in &report.duplicates {
        println!("    {} duplicates {}  [{}]", pair.duplicate.id, pair.original.id, pair.key);
    }
    println!("  bursts: {}", report.bursts.len());
    for burst in &report.bursts {
        println!("    {}  {} records", burst.minute, burst.count);
    }
    println!("  incomplete records: {}", report.invalid.len());
    if !report.skipped.is_empty() {
        println!("  skipped (unreadable dates): {}", report.skipped.len());
    }
}

// ---------------------------------------------------------------------------
// reconcile
// ---------------------------------------------------------------------------

async fn run_reconcile(
    settings: &Settings,
    source: &Source,
    burst: Option<String>,
    yes: bool,
    output: Option<PathBuf>,
) -> Result<()> {
    let store = load_store(&source.snapshot)?;
    let records = fetch_collection(&store, &source.collection, &source.filters()).await?;

    let plan = match burst {
        Some(minute) => DeletionPlan::from_burst(&source.collection, &records, &minute, &settings.audit.fields),
        None => {
            let report = audit(&records, Utc::now(), &settings.audit);
            DeletionPlan::from_duplicates(&source.collection, &report)
        }
    };

    if plan.is_empty() {
        println!("nothing to delete");
        return Ok(());
    }
    println!("{} records of '{}' would be deleted:", plan.len(), plan.collection());
    for id in plan.ids() {
        println!("  {id}");
    }

    if !yes && !confirm(&format!("delete {} records?", plan.len()))? {
        warn!("reconciliation cancelled");
        return Ok(());
    }

    let summary = plan.approve().execute(&store).await?;
    let target = output.unwrap_or_else(|| source.snapshot.clone());
    save_store(&store, &target)?;
    info!(deleted = summary.deleted, batches = summary.batches, path = %target.display(), "snapshot written");
    Ok(())
}

fn confirm(question: &str) -> Result<bool> {
    print!("{question} [y/N] ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

// ---------------------------------------------------------------------------
// browse
// ---------------------------------------------------------------------------

async fn run_browse(settings: &Settings, snapshot: &Path, spec: ListSpec, pages: usize) -> Result<()> {
    let store = Arc::new(load_store(snapshot)?);
    let clock = Arc::new(SystemClock);
    let cache = Arc::new(ReferenceCache::new(settings.data_layer.cache.clone(), clock.clone()));
    let registry = Arc::new(ConsumerLifecycleRegistry::new(settings.lifecycle.clone(), clock.clone()));
    let dependents: Vec<String> = spec.dependents.iter().map(|d| d.collection.clone()).collect();

    let list = ListOrchestrator::new(store, cache.clone(), spec, &settings.data_layer, clock)
        .with_registry(registry.clone());

    list.refresh().await?;
    for _ in 1..pages {
        if !list.has_more() {
            break;
        }
        list.load_more().await?;
    }

    let snapshot = list.snapshot();
    for entity in &snapshot.items {
        let references: Vec<String> = entity
            .references
            .iter()
            .map(|(field, reference)| match reference {
                Reference::Resolved(doc) => format!("{field}={}", doc.id),
                Reference::Missing(id) => format!("{field}={id} (missing)"),
            })
            .collect();
        let badges: Vec<String> = dependents
            .iter()
            .map(|collection| {
                let presence = snapshot.index.presence(collection, &entity.document.id);
                format!("{collection}:{presence:?}")
            })
            .collect();
        println!("{}  {}  {}", entity.document.id, references.join(" "), badges.join(" "));
    }

    let report = registry.get_health_report();
    let summary = json!({
        "items": snapshot.items.len(),
        "state": format!("{:?}", snapshot.state),
        "has_more": snapshot.has_more,
        "degraded": snapshot.index.is_degraded(),
        "cache": cache.stats(),
        "health": report.status,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
