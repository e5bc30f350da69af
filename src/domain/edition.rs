//! Editions (the shared aggregate) and editor feedback.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// A newsletter edition that many work items contribute to.
///
/// Mutated only while holding the edition's lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edition {
    pub id: String,

    #[serde(default)]
    pub status: EditionStatus,

    #[serde(default)]
    pub content: EditionContent,

    /// Ids of items associated with this edition
    #[serde(default)]
    pub member_ids: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,

    /// Where the publish stage wrote the edition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_location: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Edition {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            status: EditionStatus::Created,
            content: EditionContent::default(),
            member_ids: Vec::new(),
            published_at: None,
            published_location: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn is_published(&self) -> bool {
        self.status == EditionStatus::Published
    }

    /// Add an item to this edition
    pub fn associate(&mut self, item_id: &str) -> Result<(), EditionError> {
        if self.is_published() {
            return Err(EditionError::Published(self.id.clone()));
        }
        if !self.member_ids.iter().any(|id| id == item_id) {
            self.member_ids.push(item_id.to_string());
            self.updated_at = Utc::now();
        }
        Ok(())
    }

    /// Remove an item and its drafted section from this edition
    pub fn disassociate(&mut self, item_id: &str) -> Result<(), EditionError> {
        if self.is_published() {
            return Err(EditionError::Published(self.id.clone()));
        }
        self.member_ids.retain(|id| id != item_id);
        self.content.sections.remove(item_id);
        self.content.discard_edit_covering(item_id);
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Record a drafted section for a member item
    pub fn put_section(&mut self, item_id: &str, text: String) -> Result<(), EditionError> {
        if self.is_published() {
            return Err(EditionError::Published(self.id.clone()));
        }
        // A redrafted section invalidates an edit that already covered the old text
        self.content.discard_edit_covering(item_id);
        self.content.sections.insert(item_id.to_string(), text);
        if self.status == EditionStatus::Created {
            self.status = EditionStatus::Drafting;
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Replace the working content with an edited body.
    ///
    /// The body covers every section present now; later sections render after it.
    pub fn apply_edit(&mut self, body: String) -> Result<(), EditionError> {
        if self.is_published() {
            return Err(EditionError::Published(self.id.clone()));
        }
        self.content.body = Some(body);
        self.content.edited_ids = self.content.sections.keys().cloned().collect();
        self.status = EditionStatus::InReview;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn mark_published(&mut self, location: String) {
        let now = Utc::now();
        self.status = EditionStatus::Published;
        self.published_at = Some(now);
        self.published_location = Some(location);
        self.updated_at = now;
    }
}

/// Edition lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditionStatus {
    Created,
    Drafting,
    InReview,
    Published,
}

impl Default for EditionStatus {
    fn default() -> Self {
        Self::Created
    }
}

/// Working content of an edition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EditionContent {
    /// Drafted section per member item (item id -> markdown)
    #[serde(default)]
    pub sections: BTreeMap<String, String>,

    /// Edited body, replacing the sections it was made from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,

    /// Items whose sections are folded into `body`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub edited_ids: Vec<String>,
}

impl EditionContent {
    /// The text a reader would see: the edited body followed by any sections
    /// drafted since the edit, or just the sections in order
    pub fn render(&self) -> String {
        let mut parts: Vec<&str> = Vec::new();
        if let Some(ref body) = self.body {
            parts.push(body.trim());
        }
        for (item_id, section) in &self.sections {
            if !self.is_covered(item_id) {
                parts.push(section.trim());
            }
        }
        parts.join("\n\n")
    }

    fn is_covered(&self, item_id: &str) -> bool {
        self.body.is_some() && self.edited_ids.iter().any(|id| id == item_id)
    }

    /// Drop the edited body if it contains text from `item_id`
    fn discard_edit_covering(&mut self, item_id: &str) {
        if self.is_covered(item_id) {
            self.body = None;
            self.edited_ids.clear();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_none() && self.sections.is_empty()
    }
}

/// Editor feedback against an edition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate_id: Option<String>,

    pub text: String,

    #[serde(default)]
    pub resolved: bool,

    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Feedback {
    pub fn new(aggregate_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            aggregate_id: Some(aggregate_id.into()),
            text: text.into(),
            resolved: false,
            created_at: Utc::now(),
            deleted_at: None,
        }
    }

    /// Whether this feedback still needs an edit pass
    pub fn is_actionable(&self) -> bool {
        !self.resolved && self.deleted_at.is_none() && self.aggregate_id.is_some()
    }
}

/// Edition invariant violations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EditionError {
    #[error("Edition {0} is already published")]
    Published(String),

    #[error("Edition not found: {0}")]
    NotFound(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_published_edition_rejects_membership_changes() {
        let mut edition = Edition::new("ed-1");
        edition.associate("l-1").unwrap();
        edition.mark_published("/tmp/ed-1.md".to_string());

        assert_eq!(
            edition.associate("l-2"),
            Err(EditionError::Published("ed-1".to_string()))
        );
        assert!(edition.disassociate("l-1").is_err());
        assert_eq!(edition.member_ids, vec!["l-1".to_string()]);
    }

    #[test]
    fn test_associate_is_idempotent() {
        let mut edition = Edition::new("ed-1");
        edition.associate("l-1").unwrap();
        edition.associate("l-1").unwrap();
        assert_eq!(edition.member_ids.len(), 1);
    }

    #[test]
    fn test_render_prefers_edited_body() {
        let mut content = EditionContent::default();
        content.sections.insert("a".to_string(), "first".to_string());
        content.sections.insert("b".to_string(), "second".to_string());
        assert_eq!(content.render(), "first\n\nsecond");

        content.body = Some("edited".to_string());
        content.edited_ids = vec!["a".to_string(), "b".to_string()];
        assert_eq!(content.render(), "edited");
    }

    #[test]
    fn test_edit_moves_edition_to_review() {
        let mut edition = Edition::new("ed-1");
        edition.put_section("l-1", "raw".to_string()).unwrap();
        edition.apply_edit("polished".to_string()).unwrap();
        assert_eq!(edition.status, EditionStatus::InReview);
        assert_eq!(edition.content.render(), "polished");
    }

    #[test]
    fn test_sections_drafted_after_edit_render_after_body() {
        let mut edition = Edition::new("ed-1");
        edition.put_section("l-1", "first".to_string()).unwrap();
        edition.apply_edit("polished first".to_string()).unwrap();
        edition.put_section("l-2", "second".to_string()).unwrap();

        assert_eq!(edition.content.render(), "polished first\n\nsecond");
    }

    #[test]
    fn test_removing_an_edited_member_discards_the_edit() {
        let mut edition = Edition::new("ed-1");
        edition.put_section("l-1", "first".to_string()).unwrap();
        edition.put_section("l-2", "second".to_string()).unwrap();
        edition.apply_edit("polished both".to_string()).unwrap();

        edition.disassociate("l-1").unwrap();

        assert!(edition.content.body.is_none());
        assert_eq!(edition.content.render(), "second");
    }

    #[test]
    fn test_removing_an_unedited_member_keeps_the_edit() {
        let mut edition = Edition::new("ed-1");
        edition.put_section("l-1", "first".to_string()).unwrap();
        edition.apply_edit("polished first".to_string()).unwrap();
        edition.put_section("l-2", "second".to_string()).unwrap();

        edition.disassociate("l-2").unwrap();

        assert_eq!(edition.content.render(), "polished first");
    }

    #[test]
    fn test_redrafting_an_edited_section_discards_the_edit() {
        let mut edition = Edition::new("ed-1");
        edition.put_section("l-1", "first".to_string()).unwrap();
        edition.apply_edit("polished first".to_string()).unwrap();
        edition.put_section("l-1", "first, again".to_string()).unwrap();

        assert_eq!(edition.content.render(), "first, again");
    }

    #[test]
    fn test_first_section_moves_edition_to_drafting() {
        let mut edition = Edition::new("ed-1");
        edition.put_section("l-1", "text".to_string()).unwrap();
        assert_eq!(edition.status, EditionStatus::Drafting);
    }
}
