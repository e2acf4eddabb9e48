//! Operator-gated bulk deletion following an audit.
//!
//! A [`DeletionPlan`] lists what would be deleted.  Nothing happens until
//! the plan is approved and executed.

use std::collections::HashSet;

use serde::Serialize;
use tracing::{info, instrument, warn};

use store::temporal::minute_key;
use store::{Document, DocumentStore};

use crate::audit::AuditReport;
use crate::config::AuditFields;
use crate::DiagnosticsError;

/// Most ids sent in one atomic batch delete.
pub const DELETE_CHUNK: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanSource {
    /// Every "duplicate" of the report's pairs; originals are kept.
    Duplicates,
    /// Every record created in one minute bucket.
    Burst { minute: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeletionPlan {
    collection: String,
    source: PlanSource,
    ids: Vec<String>,
    approved: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct DeletionSummary {
    pub requested: usize,
    pub deleted: usize,
    pub batches: usize,
}

impl DeletionPlan {
    pub fn from_duplicates(collection: impl Into<String>, report: &AuditReport) -> Self {
        let originals: HashSet<&str> = report
            .duplicates
            .iter()
            .map(|d| d.original.id.as_str())
            .collect();
        let mut seen = HashSet::new();
        let ids = report
            .duplicates
            .iter()
            .map(|d| d.duplicate.id.as_str())
            .filter(|id| !originals.contains(id) && seen.insert(*id))
            .map(str::to_owned)
            .collect();
        Self {
            collection: collection.into(),
            source: PlanSource::Duplicates,
            ids,
            approved: false,
        }
    }

    /// Every record of `records` created in `minute` (`YYYY-MM-DDTHH:MM`).
    /// Records with an unreadable creation date are left out.
    pub fn from_burst(
        collection: impl Into<String>,
        records: &[Document],
        minute: &str,
        fields: &AuditFields,
    ) -> Self {
        let ids = records
            .iter()
            .filter(|doc| {
                matches!(fields.created_at(doc), Some(Ok(created)) if minute_key(created) == minute)
            })
            .map(|doc| doc.id.clone())
            .collect();
        Self {
            collection: collection.into(),
            source: PlanSource::Burst {
                minute: minute.to_owned(),
            },
            ids,
            approved: false,
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn source(&self) -> &PlanSource {
        &self.source
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn is_approved(&self) -> bool {
        self.approved
    }

    /// Record the operator's confirmation.
    pub fn approve(mut self) -> Self {
        self.approved = true;
        self
    }

    /// Delete the planned ids in batches of at most [`DELETE_CHUNK`].
    ///
    /// # Errors
    /// - [`DiagnosticsError::NotApproved`] before [`DeletionPlan::approve`].
    /// - [`DiagnosticsError::Delete`] when a batch fails; the batches before
    ///   it stay deleted and the rest are not attempted.
    #[instrument(skip(self, store), fields(collection = %self.collection, ids = self.ids.len()))]
    pub async fn execute(&self, store: &dyn DocumentStore) -> Result<DeletionSummary, DiagnosticsError> {
        if !self.approved {
            return Err(DiagnosticsError::NotApproved {
                collection: self.collection.clone(),
            });
        }

        let mut summary = DeletionSummary {
            requested: self.ids.len(),
            ..DeletionSummary::default()
        };
        for chunk in self.ids.chunks(DELETE_CHUNK) {
            match store.batch_delete(&self.collection, chunk).await {
                Ok(deleted) => {
                    summary.deleted += deleted;
                    summary.batches += 1;
                }
                Err(source) => {
                    warn!(deleted = summary.deleted, error = %source, "batch delete failed");
                    return Err(DiagnosticsError::Delete {
                        collection: self.collection.clone(),
                        deleted: summary.deleted,
                        source,
                    });
                }
            }
        }
        info!(deleted = summary.deleted, batches = summary.batches, "deletion plan executed");
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::audit;
    use crate::config::AuditConfig;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use store::mock::StoreCall;
    use store::{MemoryStore, StoreError};

    fn reminder(id: &str, title: &str, created: &str) -> Document {
        Document::new(
            id,
            json!({
                "entityType": "concert",
                "entityId": "c1",
                "title": title,
                "dueDate": "2024-07-14",
                "userId": "u1",
                "createdAt": created,
            }),
        )
    }

    fn seeded(records: &[Document]) -> MemoryStore {
        let store = MemoryStore::new();
        store.insert_many("reminders", records.iter().cloned());
        store
    }

    #[tokio::test]
    async fn duplicates_plan_keeps_originals() {
        let records = vec![
            reminder("r1", "Send contract", "2024-06-01T09:00:00Z"),
            reminder("r2", "Send contract", "2024-06-01T09:00:05Z"),
            reminder("r3", "Send contract", "2024-06-01T09:00:09Z"),
            reminder("r4", "Call venue", "2024-06-01T09:01:00Z"),
        ];
        let store = seeded(&records);
        let now = Utc.with_ymd_and_hms(2024, 6, 2, 0, 0, 0).unwrap();
        let report = audit(&records, now, &AuditConfig::default());

        let plan = DeletionPlan::from_duplicates("reminders", &report);
        assert_eq!(plan.ids(), ["r2", "r3"]);
        assert_eq!(plan.source(), &PlanSource::Duplicates);

        let summary = plan.approve().execute(&store).await.unwrap();
        assert_eq!(summary.deleted, 2);
        let left: Vec<_> = store.documents("reminders").into_iter().map(|d| d.id).collect();
        assert_eq!(left, ["r1", "r4"]);
    }

    #[tokio::test]
    async fn unapproved_plan_deletes_nothing() {
        let records = vec![
            reminder("r1", "Send contract", "2024-06-01T09:00:00Z"),
            reminder("r2", "Send contract", "2024-06-01T09:00:05Z"),
        ];
        let store = seeded(&records);
        let report = audit(&records, Utc::now(), &AuditConfig::default());
        let plan = DeletionPlan::from_duplicates("reminders", &report);

        let err = plan.execute(&store).await.unwrap_err();
        assert!(matches!(err, DiagnosticsError::NotApproved { .. }));
        assert_eq!(store.count("reminders"), 2);
        assert!(store.calls().is_empty());
    }

    #[test]
    fn burst_plan_selects_one_minute() {
        let records = vec![
            reminder("a", "t1", "2024-06-01T09:00:00Z"),
            reminder("b", "t2", "2024-06-01T09:00:59.900Z"),
            reminder("c", "t3", "2024-06-01T09:01:00Z"),
            reminder("d", "t4", "not a date"),
        ];
        let plan = DeletionPlan::from_burst("reminders", &records, "2024-06-01T09:00", &AuditFields::default());
        assert_eq!(plan.ids(), ["a", "b"]);
        assert!(!plan.is_approved());
    }

    #[tokio::test]
    async fn large_plans_are_chunked() {
        let records: Vec<_> = (0..1_201)
            .map(|i| reminder(&format!("r{i:04}"), "same", "2024-06-01T09:00:00Z"))
            .collect();
        let store = seeded(&records);
        let plan = DeletionPlan::from_burst("reminders", &records, "2024-06-01T09:00", &AuditFields::default())
            .approve();

        let summary = plan.execute(&store).await.unwrap();
        assert_eq!(summary, DeletionSummary { requested: 1_201, deleted: 1_201, batches: 3 });
        let sizes: Vec<_> = store
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                StoreCall::BatchDelete { count, .. } => Some(count),
                _ => None,
            })
            .collect();
        assert_eq!(sizes, [500, 500, 201]);
    }

    #[tokio::test]
    async fn failed_batch_reports_progress() {
        let records = vec![reminder("a", "t", "2024-06-01T09:00:00Z")];
        let store = seeded(&records);
        store.fail_deletes("reminders", StoreError::Unavailable("offline".into()));
        let plan = DeletionPlan::from_burst("reminders", &records, "2024-06-01T09:00", &AuditFields::default())
            .approve();

        let err = plan.execute(&store).await.unwrap_err();
        assert!(matches!(err, DiagnosticsError::Delete { deleted: 0, .. }));
    }
}
