//! Filtered, ordered queries over JSON documents.

use std::cmp::Ordering;

use serde_json::Value;

/// Field holding the soft-delete tombstone
pub const TOMBSTONE_FIELD: &str = "deleted_at";

/// A single top-level field condition
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Field equals the value
    Eq(String, Value),

    /// Field is absent or null
    Missing(String),
}

impl Filter {
    pub fn field(&self) -> &str {
        match self {
            Self::Eq(field, _) | Self::Missing(field) => field,
        }
    }

    fn matches(&self, doc: &Value) -> bool {
        match self {
            Self::Eq(field, expected) => doc.get(field) == Some(expected),
            Self::Missing(field) => doc.get(field).map_or(true, Value::is_null),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

/// Query over one container
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filters: Vec<Filter>,
    pub order_by: Option<(String, Order)>,
    pub include_deleted: bool,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Eq(field.into(), value.into()));
        self
    }

    pub fn missing(mut self, field: impl Into<String>) -> Self {
        self.filters.push(Filter::Missing(field.into()));
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, order: Order) -> Self {
        self.order_by = Some((field.into(), order));
        self
    }

    pub fn include_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    /// Field names must be plain identifiers (they end up in SQL paths)
    pub fn validate(&self) -> Result<(), String> {
        let fields = self
            .filters
            .iter()
            .map(Filter::field)
            .chain(self.order_by.iter().map(|(f, _)| f.as_str()));
        for field in fields {
            if !is_identifier(field) {
                return Err(format!("invalid field name '{}'", field));
            }
        }
        Ok(())
    }

    /// Whether a document satisfies every condition
    pub fn matches(&self, doc: &Value) -> bool {
        if !self.include_deleted && !Filter::Missing(TOMBSTONE_FIELD.to_string()).matches(doc) {
            return false;
        }
        self.filters.iter().all(|f| f.matches(doc))
    }

    /// Sort documents in place by the requested order
    pub fn sort(&self, docs: &mut [Value]) {
        if let Some((ref field, order)) = self.order_by {
            docs.sort_by(|a, b| {
                let ord = compare_values(a.get(field), b.get(field));
                match order {
                    Order::Asc => ord,
                    Order::Desc => ord.reverse(),
                }
            });
        }
    }
}

pub(crate) fn is_identifier(field: &str) -> bool {
    !field.is_empty()
        && field
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Total order over optional JSON scalars: missing < null < bool < number < string
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None => 0,
            Some(Value::Null) => 1,
            Some(Value::Bool(_)) => 2,
            Some(Value::Number(_)) => 3,
            Some(Value::String(_)) => 4,
            Some(_) => 5,
        }
    }

    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tombstoned_documents_excluded_by_default() {
        let live = json!({"id": "a", "status": "submitted"});
        let dead = json!({"id": "b", "status": "submitted", "deleted_at": "2026-01-01T00:00:00Z"});

        let query = Query::new().eq("status", "submitted");
        assert!(query.matches(&live));
        assert!(!query.matches(&dead));
        assert!(query.include_deleted().matches(&dead));
    }

    #[test]
    fn test_missing_filter() {
        let query = Query::new().missing("aggregate_id");
        assert!(query.matches(&json!({"id": "a"})));
        assert!(query.matches(&json!({"id": "a", "aggregate_id": null})));
        assert!(!query.matches(&json!({"id": "a", "aggregate_id": "ed-1"})));
    }

    #[test]
    fn test_sort_by_timestamp_string() {
        let mut docs = vec![
            json!({"started_at": "2026-01-01T00:00:02Z"}),
            json!({"started_at": "2026-01-01T00:00:01Z"}),
        ];
        Query::new().order_by("started_at", Order::Asc).sort(&mut docs);
        assert_eq!(docs[0]["started_at"], "2026-01-01T00:00:01Z");
    }

    #[test]
    fn test_field_validation() {
        assert!(Query::new().eq("trigger_id", "x").validate().is_ok());
        assert!(Query::new().eq("x') OR 1=1 --", "x").validate().is_err());
    }
}
