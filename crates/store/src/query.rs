//! Query description types.
//!
//! A [`Query`] is a plain value: collection, filters, optional ordering,
//! optional limit and optional `start_after` cursor.  Backends translate it;
//! [`MemoryStore`](crate::MemoryStore) evaluates it directly.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{temporal, Document};

/// Hard ceiling on the number of values accepted by one `in` filter.
pub const IN_FILTER_CEILING: usize = 10;

// ---------------------------------------------------------------------------
// Field / Filter
// ---------------------------------------------------------------------------

/// What a filter or ordering applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    /// The document id itself.
    Id,
    /// A named top-level field.
    Named(String),
}

impl Field {
    pub fn named(name: impl Into<String>) -> Self {
        Field::Named(name.into())
    }

    /// Value of this field on `doc`, with the id exposed as a string value.
    pub fn read(&self, doc: &Document) -> Option<Value> {
        match self {
            Field::Id => Some(Value::String(doc.id.clone())),
            Field::Named(name) => doc.get(name).cloned(),
        }
    }
}

/// A single predicate.  All filters of a query are AND-ed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Filter {
    Eq { field: Field, value: Value },
    In { field: Field, values: Vec<Value> },
}

impl Filter {
    pub fn eq(field: Field, value: impl Into<Value>) -> Self {
        Filter::Eq {
            field,
            value: value.into(),
        }
    }

    /// Identity-based membership filter over document ids.
    pub fn id_in<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Filter::In {
            field: Field::Id,
            values: ids.into_iter().map(|id| Value::String(id.into())).collect(),
        }
    }

    /// Membership filter over a named field holding string ids.
    pub fn field_in<I, S>(field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Filter::In {
            field: Field::Named(field.into()),
            values: values.into_iter().map(|v| Value::String(v.into())).collect(),
        }
    }

    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::Eq { field, value } => field.read(doc).as_ref() == Some(value),
            Filter::In { field, values } => match field.read(doc) {
                Some(v) => values.contains(&v),
                None => false,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Ordering
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

impl OrderBy {
    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Desc,
        }
    }

    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Asc,
        }
    }

    /// Compare two documents under this ordering, tie-breaking on id in the
    /// same direction.  Documents missing the field sort as `null`.
    pub fn compare(&self, a: &Document, b: &Document) -> Ordering {
        let null = Value::Null;
        let va = a.get(&self.field).unwrap_or(&null);
        let vb = b.get(&self.field).unwrap_or(&null);
        let ord = compare_values(va, vb).then_with(|| a.id.cmp(&b.id));
        match self.direction {
            Direction::Asc => ord,
            Direction::Desc => ord.reverse(),
        }
    }
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::Object(m) if m.contains_key("seconds") || m.contains_key("_seconds") => 3,
        Value::String(_) => 4,
        Value::Array(_) => 5,
        Value::Object(_) => 6,
    }
}

fn timestamp_parts(v: &Value) -> (i64, u64) {
    let secs = v
        .get("seconds")
        .or_else(|| v.get("_seconds"))
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let nanos = v
        .get("nanoseconds")
        .or_else(|| v.get("_nanoseconds"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    (secs, nanos)
}

/// Total order over JSON values.  Values that both read as instants compare
/// by time whatever their representation; the rest go by type rank first and
/// value second.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    if !(a.is_number() && b.is_number()) {
        if let (Ok(x), Ok(y)) = (temporal::normalize(a), temporal::normalize(b)) {
            return x.cmp(&y);
        }
    }
    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (ex, ey) in x.iter().zip(y.iter()) {
                let ord = compare_values(ex, ey);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(_), Value::Object(_)) if ra == 3 => timestamp_parts(a).cmp(&timestamp_parts(b)),
        _ => Ordering::Equal,
    }
}

// ---------------------------------------------------------------------------
// Cursor / Snapshot
// ---------------------------------------------------------------------------

/// Handle to "the last document of the previous page".
///
/// Only meaningful for the exact query shape that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub document_id: String,
    pub sort_value: Value,
}

impl Cursor {
    fn from_document(doc: &Document, order_by: Option<&OrderBy>) -> Self {
        let sort_value = order_by
            .and_then(|o| doc.get(&o.field).cloned())
            .unwrap_or(Value::Null);
        Self {
            document_id: doc.id.clone(),
            sort_value,
        }
    }

    /// Shadow document used to compare against candidates during
    /// `start_after` evaluation.
    pub fn as_anchor(&self, order_by: &OrderBy) -> Document {
        let mut anchor = Document::new(self.document_id.clone(), Value::Null);
        anchor
            .fields
            .insert(order_by.field.clone(), self.sort_value.clone());
        anchor
    }
}

/// Result of a [`Query`].
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub documents: Vec<Document>,
    pub order_by: Option<OrderBy>,
}

impl Snapshot {
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Cursor positioned on the last document, if any.
    pub fn last_cursor(&self) -> Option<Cursor> {
        self.documents
            .last()
            .map(|doc| Cursor::from_document(doc, self.order_by.as_ref()))
    }
}

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<Filter>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
    pub start_after: Option<Cursor>,
}

impl Query {
    pub fn collection(name: impl Into<String>) -> Self {
        Self {
            collection: name.into(),
            filters: Vec::new(),
            order_by: None,
            limit: None,
            start_after: None,
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn filters(mut self, filters: impl IntoIterator<Item = Filter>) -> Self {
        self.filters.extend(filters);
        self
    }

    pub fn order_by(mut self, order_by: OrderBy) -> Self {
        self.order_by = Some(order_by);
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn start_after(mut self, cursor: Cursor) -> Self {
        self.start_after = Some(cursor);
        self
    }

    /// Whether any filter is a set-membership filter.
    pub fn has_in_filter(&self) -> bool {
        self.filters.iter().any(|f| matches!(f, Filter::In { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn in_filter_over_ids_and_fields() {
        let doc = Document::new("c1", json!({ "venueId": "v1" }));
        assert!(Filter::id_in(["c1", "c2"]).matches(&doc));
        assert!(!Filter::id_in(["c3"]).matches(&doc));
        assert!(Filter::field_in("venueId", ["v1"]).matches(&doc));
        assert!(!Filter::field_in("missing", ["v1"]).matches(&doc));
    }

    #[test]
    fn eq_filter() {
        let doc = Document::new("c1", json!({ "organizationId": "org-1" }));
        assert!(Filter::eq(Field::named("organizationId"), "org-1").matches(&doc));
        assert!(!Filter::eq(Field::named("organizationId"), "org-2").matches(&doc));
    }

    #[test]
    fn desc_ordering_ties_on_id() {
        let a = Document::new("a", json!({ "date": 5 }));
        let b = Document::new("b", json!({ "date": 5 }));
        let c = Document::new("c", json!({ "date": 9 }));
        let order = OrderBy::desc("date");
        let mut docs = vec![a, b, c];
        docs.sort_by(|x, y| order.compare(x, y));
        let ids: Vec<_> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, ["c", "b", "a"]);
    }

    #[test]
    fn timestamp_objects_compare_by_seconds_then_nanos() {
        let early = json!({ "seconds": 10, "nanoseconds": 5 });
        let late = json!({ "seconds": 10, "nanoseconds": 6 });
        assert_eq!(compare_values(&early, &late), Ordering::Less);
        assert_eq!(compare_values(&json!(1), &json!("1")), Ordering::Less);
    }

    #[test]
    fn instants_compare_by_time_across_representations() {
        let iso = json!("2019-01-01");
        let millis = json!(1_577_836_800_000_i64); // 2020-01-01
        let parts = json!({ "seconds": 1_735_689_600 }); // 2025-01-01
        assert_eq!(compare_values(&iso, &millis), Ordering::Less);
        assert_eq!(compare_values(&parts, &iso), Ordering::Greater);
        assert_eq!(compare_values(&millis, &parts), Ordering::Less);
        assert_eq!(compare_values(&json!("2020-01-01T00:00:00Z"), &millis), Ordering::Equal);
        assert_eq!(compare_values(&json!(1.2), &json!(1.7)), Ordering::Less);
    }

    #[test]
    fn snapshot_cursor_carries_sort_value() {
        let snapshot = Snapshot {
            documents: vec![Document::new("c7", json!({ "date": "2024-05-01" }))],
            order_by: Some(OrderBy::desc("date")),
        };
        let cursor = snapshot.last_cursor().unwrap();
        assert_eq!(cursor.document_id, "c7");
        assert_eq!(cursor.sort_value, json!("2024-05-01"));
        assert!(Snapshot::default().last_cursor().is_none());
    }
}
