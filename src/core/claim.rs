//! Claim protocol for work items.
//!
//! A worker claims an item by stamping `claim_marker` with the current time
//! and writing the item back conditioned on the version it read. Losing that
//! race, or finding an unexpired marker, means another worker owns the item.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::debug;

use crate::domain::{ItemStatus, WorkItem};
use crate::store::{ItemRepository, StoreError, Versioned};

/// Default lifetime of a claim marker
pub const DEFAULT_CLAIM_TTL: Duration = Duration::from_secs(15 * 60);

/// Why a claim was not granted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    NotFound,
    Deleted,
    NoAggregate,
    NotSubmitted(ItemStatus),
    ActiveClaim,

    /// The conditioned write lost to a concurrent writer
    Conflict,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => f.write_str("not found"),
            Self::Deleted => f.write_str("deleted"),
            Self::NoAggregate => f.write_str("no edition"),
            Self::NotSubmitted(status) => write!(f, "status is {}", status),
            Self::ActiveClaim => f.write_str("claimed by another worker"),
            Self::Conflict => f.write_str("concurrent update"),
        }
    }
}

/// Outcome of a claim attempt
#[derive(Debug)]
pub enum Claim {
    /// The item as written with the new marker, and its new version
    Acquired(Versioned<WorkItem>),
    Rejected(RejectReason),
}

impl Claim {
    pub fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired(_))
    }
}

/// Grants at most one active claim per work item across all workers
#[derive(Clone)]
pub struct ClaimCoordinator {
    items: ItemRepository,
    ttl: Duration,
}

impl ClaimCoordinator {
    pub fn new(items: ItemRepository, ttl: Duration) -> Self {
        Self { items, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Try to claim an item.
    ///
    /// Ineligible items are rejected without any write. Store errors other
    /// than a precondition conflict are returned to the caller.
    pub async fn claim(&self, item_id: &str) -> Result<Claim, StoreError> {
        let Some(Versioned { doc: mut item, version }) = self.items.get_versioned(item_id).await?
        else {
            return Ok(Claim::Rejected(RejectReason::NotFound));
        };

        let now = Utc::now();
        if let Some(reason) = self.check_eligible(&item, now) {
            debug!(item_id, %reason, "Claim rejected");
            return Ok(Claim::Rejected(reason));
        }

        item.claim_marker = Some(now.to_rfc3339());
        item.updated_at = now;

        match self.items.replace(&item, &version).await {
            Ok(version) => {
                debug!(item_id, "Claim acquired");
                Ok(Claim::Acquired(Versioned { doc: item, version }))
            }
            Err(e) if e.is_precondition_failed() => {
                debug!(item_id, "Claim lost to concurrent writer");
                Ok(Claim::Rejected(RejectReason::Conflict))
            }
            Err(e) => Err(e),
        }
    }

    fn check_eligible(&self, item: &WorkItem, now: DateTime<Utc>) -> Option<RejectReason> {
        if item.is_deleted() {
            return Some(RejectReason::Deleted);
        }
        if item.aggregate_id.is_none() {
            return Some(RejectReason::NoAggregate);
        }
        if item.status != ItemStatus::Submitted {
            return Some(RejectReason::NotSubmitted(item.status));
        }
        if is_active_claim(item.claim_marker.as_deref(), now, self.ttl) {
            return Some(RejectReason::ActiveClaim);
        }
        None
    }
}

/// Whether `marker` denotes a claim still within `ttl` of `now`.
///
/// A missing or unparseable marker is no claim. Timestamps without an
/// offset are taken as UTC.
pub fn is_active_claim(marker: Option<&str>, now: DateTime<Utc>, ttl: Duration) -> bool {
    let Some(claimed_at) = marker.and_then(parse_marker) else {
        return false;
    };
    let Ok(ttl) = chrono::Duration::from_std(ttl) else {
        return true;
    };
    now.signed_duration_since(claimed_at) < ttl
}

fn parse_marker(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(15 * 60);

    #[test]
    fn test_fresh_marker_is_active() {
        let now = Utc::now();
        let marker = (now - chrono::Duration::minutes(1)).to_rfc3339();
        assert!(is_active_claim(Some(&marker), now, TTL));
    }

    #[test]
    fn test_expired_marker_is_not_active() {
        let now = Utc::now();
        let marker = (now - chrono::Duration::minutes(20)).to_rfc3339();
        assert!(!is_active_claim(Some(&marker), now, TTL));
    }

    #[test]
    fn test_marker_exactly_at_ttl_is_expired() {
        let now = Utc::now();
        let marker = (now - chrono::Duration::minutes(15)).to_rfc3339();
        assert!(!is_active_claim(Some(&marker), now, TTL));
    }

    #[test]
    fn test_malformed_or_missing_marker_is_no_claim() {
        let now = Utc::now();
        assert!(!is_active_claim(None, now, TTL));
        assert!(!is_active_claim(Some("yesterday-ish"), now, TTL));
        assert!(!is_active_claim(Some(""), now, TTL));
    }

    #[test]
    fn test_naive_marker_is_utc() {
        let now = Utc::now();
        let marker = (now - chrono::Duration::minutes(2))
            .naive_utc()
            .format("%Y-%m-%dT%H:%M:%S%.f")
            .to_string();
        assert!(is_active_claim(Some(&marker), now, TTL));
    }
}
