//! Broker wire envelope and lifecycle event payloads.
//!
//! Every broker message body is an `EventEnvelope` serialized as JSON:
//! `{"event": "<name>", "data": <object> | "<string>"}`. Older producers
//! stringified `data`; decoding transparently restores the object when the
//! string holds one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::item::{ItemStatus, WorkItem};
use super::run::{Run, RunStatus, Stage};

/// A stage run started
pub const RUN_START: &str = "run-start";

/// A stage run finished (completed or failed)
pub const RUN_COMPLETE: &str = "run-complete";

/// A work item changed; carries a render-ready summary
pub const ITEM_UPDATE: &str = "item-update";

/// Command: publish an edition
pub const PUBLISH_REQUEST: &str = "publish-request";

/// Canonical event envelope used on the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event: String,
    pub data: EventData,
}

/// Envelope payload: a JSON object, or an opaque string (e.g. an HTML fragment)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventData {
    Object(Map<String, Value>),
    Text(String),
}

impl EventData {
    pub fn as_object(&self) -> Option<&Map<String, Value>> {
        match self {
            Self::Object(map) => Some(map),
            Self::Text(_) => None,
        }
    }
}

impl From<Map<String, Value>> for EventData {
    fn from(map: Map<String, Value>) -> Self {
        Self::Object(map)
    }
}

impl From<String> for EventData {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl EventEnvelope {
    pub fn new(event: impl Into<String>, data: impl Into<EventData>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
        }
    }

    /// Parse an envelope from a broker message body.
    ///
    /// A string `data` that decodes to a JSON object is replaced by that
    /// object; any other string is kept verbatim.
    pub fn from_message_body(body: &str) -> Result<Self, serde_json::Error> {
        let mut envelope: EventEnvelope = serde_json::from_str(body)?;
        if let EventData::Text(ref text) = envelope.data {
            if let Ok(Value::Object(decoded)) = serde_json::from_str::<Value>(text) {
                envelope.data = EventData::Object(decoded);
            }
        }
        Ok(envelope)
    }

    /// Serialize to a broker message body
    pub fn to_message_body(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Command payload requesting publication of an edition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRequest {
    pub edition_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl PublishRequest {
    /// Validate and extract a publish request from envelope data
    pub fn from_data(data: &EventData) -> Result<Self, String> {
        let map = data
            .as_object()
            .ok_or_else(|| "publish-request data is not an object".to_string())?;
        let request: PublishRequest = serde_json::from_value(Value::Object(map.clone()))
            .map_err(|e| format!("invalid publish-request payload: {}", e))?;
        if request.edition_id.trim().is_empty() {
            return Err("publish-request edition_id is empty".to_string());
        }
        Ok(request)
    }

    pub fn into_envelope(self) -> EventEnvelope {
        EventEnvelope::new(PUBLISH_REQUEST, to_object(&self))
    }
}

/// `run-start` payload
pub fn run_start_payload(run: &Run) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("id".into(), Value::String(run.id.clone()));
    map.insert("stage".into(), Value::String(run.stage.as_str().into()));
    map.insert("trigger_id".into(), Value::String(run.trigger_id.clone()));
    map.insert("aggregate_id".into(), Value::String(run.aggregate_id.clone()));
    map.insert("status".into(), Value::String(run.status.as_str().into()));
    map.insert("started_at".into(), Value::String(run.started_at.to_rfc3339()));
    map
}

/// `run-complete` payload
pub fn run_complete_payload(run: &Run) -> Map<String, Value> {
    let mut map = run_start_payload(run);
    map.insert("output".into(), run.output.clone().unwrap_or(Value::Null));
    map.insert(
        "usage".into(),
        run.usage
            .and_then(|u| serde_json::to_value(u).ok())
            .unwrap_or(Value::Null),
    );
    map.insert(
        "completed_at".into(),
        run.completed_at
            .map(|t| Value::String(t.to_rfc3339()))
            .unwrap_or(Value::Null),
    );
    map
}

/// Render-ready summary of a work item and its run history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemSummary {
    pub id: String,
    pub url: String,
    pub title: Option<String>,
    pub status: ItemStatus,
    pub aggregate_id: Option<String>,
    pub has_content: bool,
    pub has_review: bool,
    pub runs: Vec<RunSummary>,
}

/// One row of run history in an item summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: String,
    pub stage: Stage,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub total_tokens: Option<u64>,
}

impl ItemSummary {
    pub fn new(item: &WorkItem, runs: &[Run]) -> Self {
        Self {
            id: item.id.clone(),
            url: item.url.clone(),
            title: item.title.clone(),
            status: item.status,
            aggregate_id: item.aggregate_id.clone(),
            has_content: item.content.is_some(),
            has_review: item.review.is_some(),
            runs: runs
                .iter()
                .map(|run| RunSummary {
                    id: run.id.clone(),
                    stage: run.stage,
                    status: run.status,
                    started_at: run.started_at,
                    completed_at: run.completed_at,
                    error: run.error.clone(),
                    total_tokens: run.usage.map(|u| u.total_tokens),
                })
                .collect(),
        }
    }
}

/// `item-update` payload
pub fn item_update_payload(item: &WorkItem, runs: &[Run]) -> Map<String, Value> {
    to_object(&ItemSummary::new(item, runs))
}

fn to_object<T: Serialize>(value: &T) -> Map<String, Value> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_legacy_string_data_is_decoded() {
        let body = r#"{"event":"x","data":"{\"a\":1}"}"#;
        let envelope = EventEnvelope::from_message_body(body).unwrap();

        let expected = json!({"a": 1});
        assert_eq!(envelope.data, EventData::Object(expected.as_object().unwrap().clone()));
    }

    #[test]
    fn test_non_json_string_data_is_kept() {
        let body = r#"{"event":"item-update","data":"<tr id=\"l-1\"></tr>"}"#;
        let envelope = EventEnvelope::from_message_body(body).unwrap();
        assert_eq!(envelope.data, EventData::Text("<tr id=\"l-1\"></tr>".to_string()));
    }

    #[test]
    fn test_string_holding_json_array_is_kept() {
        let body = r#"{"event":"x","data":"[1,2]"}"#;
        let envelope = EventEnvelope::from_message_body(body).unwrap();
        assert_eq!(envelope.data, EventData::Text("[1,2]".to_string()));
    }

    #[test]
    fn test_numeric_data_is_rejected() {
        assert!(EventEnvelope::from_message_body(r#"{"event":"x","data":5}"#).is_err());
        assert!(EventEnvelope::from_message_body("not json").is_err());
    }

    #[test]
    fn test_publish_request_requires_edition_id() {
        let data = EventData::Object(json!({"request_id": "req-1"}).as_object().unwrap().clone());
        assert!(PublishRequest::from_data(&data).is_err());

        let data = EventData::Text("ed-1".to_string());
        assert!(PublishRequest::from_data(&data).is_err());

        let data = EventData::Object(
            json!({"edition_id": "ed-1", "request_id": "req-1"})
                .as_object()
                .unwrap()
                .clone(),
        );
        let request = PublishRequest::from_data(&data).unwrap();
        assert_eq!(request.edition_id, "ed-1");
        assert_eq!(request.request_id.as_deref(), Some("req-1"));
    }

    #[test]
    fn test_run_payload_keys() {
        let mut run = Run::start(Stage::Fetch, "l-1", "ed-1");
        let start = run_start_payload(&run);
        let keys: Vec<&str> = start.keys().map(|k| k.as_str()).collect();
        for key in ["id", "stage", "trigger_id", "aggregate_id", "status", "started_at"] {
            assert!(keys.contains(&key), "missing {}", key);
        }
        assert_eq!(start.len(), 6);

        run.complete(json!("done"), None, 1);
        let complete = run_complete_payload(&run);
        assert_eq!(complete.len(), 9);
        assert_eq!(complete["status"], json!("completed"));
        assert_eq!(complete["usage"], Value::Null);
    }
}
