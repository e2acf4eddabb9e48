//! Audit thresholds and the field names the audit reads.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use datalayer::config::duration_ms;
use store::{Document, TemporalError};

/// Which record fields carry which meaning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditFields {
    pub entity_type: String,
    pub entity_id: String,
    pub title: String,
    pub due_date: String,
    pub status: String,
    pub owner: String,
    /// Creation timestamp candidates, first present one wins.
    pub created_at: Vec<String>,
}

impl Default for AuditFields {
    fn default() -> Self {
        Self {
            entity_type: "entityType".into(),
            entity_id: "entityId".into(),
            title: "title".into(),
            due_date: "dueDate".into(),
            status: "status".into(),
            owner: "userId".into(),
            created_at: vec!["createdAt".into(), "creationDate".into()],
        }
    }
}

impl AuditFields {
    /// Normalized creation time of `doc`.
    ///
    /// `None` when no candidate field is present, an error when the first
    /// present one cannot be read as a date.
    pub fn created_at(&self, doc: &Document) -> Option<Result<DateTime<Utc>, TemporalError>> {
        self.created_at.iter().find_map(|field| doc.timestamp(field))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// A minute with more creations than this is a burst.
    pub burst_threshold: usize,
    pub burst_sample_size: usize,
    /// Records created within this window before "now" are listed as recent.
    #[serde(rename = "recent_window_ms", with = "duration_ms")]
    pub recent_window: Duration,
    /// Number of creation days listed, most recent first.
    pub top_days: usize,
    pub day_sample_size: usize,
    pub fields: AuditFields,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            burst_threshold: 10,
            burst_sample_size: 5,
            recent_window: Duration::from_secs(60 * 60),
            top_days: 10,
            day_sample_size: 5,
            fields: AuditFields::default(),
        }
    }
}
