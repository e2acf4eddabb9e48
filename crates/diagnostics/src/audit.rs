//! Duplicate and burst detection over a full collection snapshot.
//!
//! [`audit`] is a pure function of the records it is given.  It never
//! deletes anything; its report feeds [`crate::reconcile::DeletionPlan`].
//!
//! Dates are normalized before they are compared or bucketed, so the same
//! calendar day written as epoch millis, an ISO string or a
//! `{seconds, nanoseconds}` object lands in the same bucket.  A record whose
//! date fields cannot be read is skipped from the date-based analyses with
//! a logged reason; it still counts towards the totals.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use datalayer::collect_tolerant;
use store::temporal::{day_key, minute_key};
use store::{Document, TemporalError};

use crate::config::{AuditConfig, AuditFields};

const NO_DATE: &str = "no-date";

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateGroup {
    pub key: String,
    /// First record seen with `key`.
    pub original: Document,
    pub duplicate: Document,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BurstGroup {
    /// `YYYY-MM-DDTHH:MM`, UTC.
    pub minute: String,
    pub count: usize,
    pub samples: Vec<Document>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DaySummary {
    /// `YYYY-MM-DD`, UTC.
    pub day: String,
    pub count: usize,
    pub samples: Vec<Document>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Issue {
    MissingTitle,
    MissingDueDate,
    MissingEntityType,
    MissingOwner,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvalidRecord {
    pub id: String,
    pub issues: Vec<Issue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedRecord {
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditReport {
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_entity_type: BTreeMap<String, usize>,
    /// Most recent creation days first.
    pub by_created_day: Vec<DaySummary>,
    /// Created within the configured recent window.
    pub recent: Vec<Document>,
    pub duplicates: Vec<DuplicateGroup>,
    pub bursts: Vec<BurstGroup>,
    pub invalid: Vec<InvalidRecord>,
    /// Records left out of the date-based analyses.
    pub skipped: Vec<SkippedRecord>,
}

impl AuditReport {
    pub fn has_findings(&self) -> bool {
        !self.duplicates.is_empty() || !self.bursts.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Per-record preparation
// ---------------------------------------------------------------------------

/// Normalized date facts of one record.
struct Dated<'a> {
    doc: &'a Document,
    created: Option<DateTime<Utc>>,
    due_key: String,
}

fn prepare<'a>(doc: &'a Document, fields: &AuditFields) -> Result<Dated<'a>, TemporalError> {
    let created = fields.created_at(doc).transpose()?;
    let due_key = match doc.timestamp(&fields.due_date) {
        Some(due) => day_key(due?),
        None => NO_DATE.to_owned(),
    };
    Ok(Dated { doc, created, due_key })
}

/// Text form of a key component: strings as-is, numbers and booleans
/// printed, anything else (or absent) replaced by `fallback`.
fn key_part(doc: &Document, field: &str, fallback: &str) -> String {
    match doc.get(field) {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => fallback.to_owned(),
    }
}

/// `(entityType, entityId, title, dueDay)` composite key.
pub fn duplicate_key(doc: &Document, due_key: &str, fields: &AuditFields) -> String {
    format!(
        "{}-{}-{}-{}",
        key_part(doc, &fields.entity_type, "no-type"),
        key_part(doc, &fields.entity_id, "no-id"),
        key_part(doc, &fields.title, "no-title"),
        due_key
    )
}

fn issues_of(doc: &Document, fields: &AuditFields) -> Vec<Issue> {
    [
        (&fields.title, Issue::MissingTitle),
        (&fields.due_date, Issue::MissingDueDate),
        (&fields.entity_type, Issue::MissingEntityType),
        (&fields.owner, Issue::MissingOwner),
    ]
    .into_iter()
    .filter(|(field, _)| !doc.has_value(field))
    .map(|(_, issue)| issue)
    .collect()
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

/// Analyse `records` as of `now`.
pub fn audit(records: &[Document], now: DateTime<Utc>, config: &AuditConfig) -> AuditReport {
    let fields = &config.fields;

    let mut by_status = BTreeMap::new();
    let mut by_entity_type = BTreeMap::new();
    let mut invalid = Vec::new();
    for doc in records {
        *by_status
            .entry(key_part(doc, &fields.status, "unknown"))
            .or_insert(0) += 1;
        *by_entity_type
            .entry(key_part(doc, &fields.entity_type, "none"))
            .or_insert(0) += 1;
        let issues = issues_of(doc, fields);
        if !issues.is_empty() {
            invalid.push(InvalidRecord {
                id: doc.id.clone(),
                issues,
            });
        }
    }

    let outcome = collect_tolerant(
        "audit record",
        records.iter().map(|doc| (doc.id.as_str(), prepare(doc, fields))),
    );
    let skipped: Vec<SkippedRecord> = outcome
        .failed
        .iter()
        .map(|(id, err)| SkippedRecord {
            id: (*id).to_owned(),
            reason: err.to_string(),
        })
        .collect();
    let dated: Vec<Dated<'_>> = outcome.succeeded.into_iter().map(|(_, d)| d).collect();

    let report = AuditReport {
        total: records.len(),
        by_status,
        by_entity_type,
        by_created_day: created_days(&dated, config),
        recent: recent(&dated, now, config),
        duplicates: find_duplicates(&dated, fields),
        bursts: find_bursts(&dated, config),
        invalid,
        skipped,
    };

    info!(
        total = report.total,
        duplicates = report.duplicates.len(),
        bursts = report.bursts.len(),
        invalid = report.invalid.len(),
        skipped = report.skipped.len(),
        "audit complete"
    );
    report
}

fn find_duplicates(dated: &[Dated<'_>], fields: &AuditFields) -> Vec<DuplicateGroup> {
    let mut seen: HashMap<String, &Document> = HashMap::new();
    let mut duplicates = Vec::new();
    for record in dated {
        let key = duplicate_key(record.doc, &record.due_key, fields);
        match seen.get(&key) {
            Some(original) => duplicates.push(DuplicateGroup {
                key,
                original: (*original).clone(),
                duplicate: record.doc.clone(),
            }),
            None => {
                seen.insert(key, record.doc);
            }
        }
    }
    debug!(distinct = seen.len(), duplicates = duplicates.len(), "duplicate scan");
    duplicates
}

/// Records grouped by creation bucket, in snapshot order within a bucket.
fn bucket_by<'a>(
    dated: &'a [Dated<'a>],
    bucket: impl Fn(DateTime<Utc>) -> String,
) -> BTreeMap<String, Vec<&'a Document>> {
    let mut buckets: BTreeMap<String, Vec<&Document>> = BTreeMap::new();
    for record in dated {
        if let Some(created) = record.created {
            buckets.entry(bucket(created)).or_default().push(record.doc);
        }
    }
    buckets
}

fn find_bursts(dated: &[Dated<'_>], config: &AuditConfig) -> Vec<BurstGroup> {
    bucket_by(dated, minute_key)
        .into_iter()
        .filter(|(_, docs)| docs.len() > config.burst_threshold)
        .map(|(minute, docs)| BurstGroup {
            minute,
            count: docs.len(),
            samples: docs
                .into_iter()
                .take(config.burst_sample_size)
                .cloned()
                .collect(),
        })
        .collect()
}

fn created_days(dated: &[Dated<'_>], config: &AuditConfig) -> Vec<DaySummary> {
    bucket_by(dated, day_key)
        .into_iter()
        .rev()
        .take(config.top_days)
        .map(|(day, docs)| DaySummary {
            day,
            count: docs.len(),
            samples: docs
                .into_iter()
                .take(config.day_sample_size)
                .cloned()
                .collect(),
        })
        .collect()
}

fn recent(dated: &[Dated<'_>], now: DateTime<Utc>, config: &AuditConfig) -> Vec<Document> {
    // A window too large to subtract covers everything.
    let since = chrono::Duration::from_std(config.recent_window)
        .ok()
        .and_then(|window| now.checked_sub_signed(window));
    dated
        .iter()
        .filter(|r| match (r.created, since) {
            (Some(created), Some(since)) => created > since,
            (Some(_), None) => true,
            (None, _) => false,
        })
        .map(|r| r.doc.clone())
        .collect()
}
