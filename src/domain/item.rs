//! Work items: submitted links and their pipeline status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// A link submitted for inclusion in an edition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Document id (also the partition key)
    pub id: String,

    /// The submitted URL
    pub url: String,

    /// Current pipeline status
    #[serde(default)]
    pub status: ItemStatus,

    /// Edition this item belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate_id: Option<String>,

    /// Page title extracted by the fetch stage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// Extracted page content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    /// Review notes produced by the review stage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review: Option<String>,

    /// RFC 3339 timestamp written by the worker that claimed this item.
    ///
    /// Kept as raw text: a value that does not parse is treated as no claim.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_marker"
    )]
    pub claim_marker: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    /// Soft-delete tombstone
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl WorkItem {
    /// Create a new submitted item attached to an edition
    pub fn new(url: impl Into<String>, aggregate_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            url: url.into(),
            status: ItemStatus::Submitted,
            aggregate_id,
            title: None,
            content: None,
            review: None,
            claim_marker: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    /// Set a specific id (tests and imports)
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Advance to a new status, touching `updated_at`
    pub fn advance(&mut self, status: ItemStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// Mark the item failed and release its claim so it can be resubmitted
    pub fn mark_failed(&mut self) {
        self.advance(ItemStatus::Failed);
        self.claim_marker = None;
    }

    /// Put a failed item back into the submitted state.
    ///
    /// Returns false when the item is not in a resubmittable state.
    pub fn resubmit(&mut self) -> bool {
        if self.status != ItemStatus::Failed || self.is_deleted() {
            return false;
        }
        self.advance(ItemStatus::Submitted);
        self.claim_marker = None;
        true
    }

    /// Tombstone the item
    pub fn soft_delete(&mut self) {
        let now = Utc::now();
        self.deleted_at = Some(now);
        self.updated_at = now;
    }
}

/// Pipeline status of a work item, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Waiting to be claimed
    Submitted,

    /// Claimed, pipeline starting
    Processing,

    /// Content being fetched (or fetched and awaiting review)
    Fetching,

    /// Review complete
    Reviewed,

    /// Section drafted into the edition
    Drafted,

    /// Edition edited after feedback
    Edited,

    /// Edition published
    Published,

    /// Retries exhausted
    Failed,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Processing => "processing",
            Self::Fetching => "fetching",
            Self::Reviewed => "reviewed",
            Self::Drafted => "drafted",
            Self::Edited => "edited",
            Self::Published => "published",
            Self::Failed => "failed",
        }
    }

    /// Statuses a worker holds while actively running stages
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Processing | Self::Fetching | Self::Reviewed)
    }
}

impl Default for ItemStatus {
    fn default() -> Self {
        Self::Submitted
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn lenient_marker<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_order_follows_pipeline() {
        assert!(ItemStatus::Submitted < ItemStatus::Processing);
        assert!(ItemStatus::Fetching < ItemStatus::Reviewed);
        assert!(ItemStatus::Drafted < ItemStatus::Edited);
        assert!(ItemStatus::Edited < ItemStatus::Published);
    }

    #[test]
    fn test_only_running_statuses_are_in_flight() {
        assert!(ItemStatus::Fetching.is_in_flight());
        assert!(!ItemStatus::Submitted.is_in_flight());
        assert!(!ItemStatus::Drafted.is_in_flight());
        assert!(!ItemStatus::Failed.is_in_flight());
    }

    #[test]
    fn test_non_string_marker_deserializes_as_none() {
        let now = Utc::now().to_rfc3339();
        let doc = json!({
            "id": "l-1",
            "url": "https://example.com",
            "status": "submitted",
            "claim_marker": 42,
            "created_at": now,
            "updated_at": now,
        });

        let item: WorkItem = serde_json::from_value(doc).unwrap();
        assert_eq!(item.claim_marker, None);
    }

    #[test]
    fn test_resubmit_only_from_failed() {
        let mut item = WorkItem::new("https://example.com", Some("ed-1".to_string()));
        assert!(!item.resubmit());

        item.claim_marker = Some(Utc::now().to_rfc3339());
        item.mark_failed();
        assert!(item.claim_marker.is_none());
        assert!(item.resubmit());
        assert_eq!(item.status, ItemStatus::Submitted);
    }
}
