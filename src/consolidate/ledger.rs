//! Processed ledger
//!
//! Records which daily summaries have been folded into the aggregate table.
//! An entry is keyed by summary name and carries the content digest of the
//! summary it describes, so a new artifact reusing a name is not mistaken for
//! the one merged before.
//!
//! An entry starts `Pending` (written before the table commit) and becomes
//! `Committed` once the table is known to carry the merge. Pending entries
//! name the table version their commit writes, and no other write can produce
//! that version, so the current table version alone tells whether a pending
//! merge landed:
//!
//! - table at `expected`: the merge landed
//! - table at `base`: the merge has not landed yet
//! - table at anything else: the merge lost its commit and never will land
//!
//! Committed entries only guard against redelivery. [`Ledger::compact`] drops
//! those older than a retention horizon to keep the document bounded; a
//! summary redelivered after its entry was compacted is merged again.

use crate::store::ETag;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// State of one summary in the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LedgerEntry {
    /// A table commit carrying the summary was attempted
    Pending {
        /// Content digest of the summary
        source: ETag,
        /// Table version the merge was computed from, `None` for a missing table
        base: Option<ETag>,
        /// Table version the commit produces
        expected: ETag,
        /// When the attempt was recorded
        recorded_at: DateTime<Utc>,
    },
    /// The table carries the summary
    Committed {
        /// Content digest of the summary
        source: ETag,
        /// Table version produced by the merge
        table: ETag,
        /// When the commit was confirmed
        at: DateTime<Utc>,
    },
}

impl LedgerEntry {
    /// Content digest of the summary the entry describes
    pub fn source(&self) -> &ETag {
        match self {
            LedgerEntry::Pending { source, .. } => source,
            LedgerEntry::Committed { source, .. } => source,
        }
    }
}

/// Changes made by [`Ledger::resolve`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Pending entries confirmed as committed
    pub committed: usize,
    /// Pending entries whose commit was lost
    pub dropped: usize,
}

impl Resolution {
    /// Whether the ledger changed
    pub fn changed(&self) -> bool {
        self.committed + self.dropped > 0
    }
}

/// Ledger document, keyed by summary name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ledger {
    #[serde(default)]
    entries: BTreeMap<String, LedgerEntry>,
}

impl Ledger {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode from JSON
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Encode as JSON
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    /// Entry of a summary
    pub fn get(&self, summary: &str) -> Option<&LedgerEntry> {
        self.entries.get(summary)
    }

    /// Whether the table is known to carry a summary
    ///
    /// With a `source` digest only the artifact holding those bytes counts;
    /// without one, any committed artifact under the name does.
    pub fn is_committed(&self, summary: &str, source: Option<&ETag>) -> bool {
        match self.entries.get(summary) {
            Some(LedgerEntry::Committed { source: committed, .. }) => source.map_or(true, |s| s == committed),
            _ => false,
        }
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the ledger has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Settle pending entries against the current table version
    pub fn resolve(&mut self, current: Option<&ETag>) -> Resolution {
        let mut resolution = Resolution::default();
        let now = Utc::now();

        self.entries.retain(|_, entry| {
            let LedgerEntry::Pending {
                source, base, expected, ..
            } = entry
            else {
                return true;
            };
            if current == Some(&*expected) {
                *entry = LedgerEntry::Committed {
                    source: source.clone(),
                    table: expected.clone(),
                    at: now,
                };
                resolution.committed += 1;
                true
            } else if current == base.as_ref() {
                true
            } else {
                resolution.dropped += 1;
                false
            }
        });

        resolution
    }

    /// Drop committed entries confirmed before `horizon`, returning how many went
    pub fn compact(&mut self, horizon: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| !matches!(entry, LedgerEntry::Committed { at, .. } if *at < horizon));
        before - self.entries.len()
    }

    /// Record an attempted commit, replacing any earlier entry of the name
    pub fn record_pending(&mut self, summary: &str, source: ETag, base: Option<ETag>, expected: ETag) {
        self.entries.insert(
            summary.to_string(),
            LedgerEntry::Pending {
                source,
                base,
                expected,
                recorded_at: Utc::now(),
            },
        );
    }

    /// Record a confirmed commit
    pub fn mark_committed(&mut self, summary: &str, source: ETag, table: ETag) {
        self.entries.insert(
            summary.to_string(),
            LedgerEntry::Committed {
                source,
                table,
                at: Utc::now(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn tag(s: &str) -> ETag {
        ETag::of(s.as_bytes())
    }

    #[test]
    fn test_pending_resolves_by_table_version() {
        let mut ledger = Ledger::new();
        ledger.record_pending("landed", tag("s1"), Some(tag("v1")), tag("v2"));
        ledger.record_pending("waiting", tag("s2"), Some(tag("v2")), tag("v3"));
        ledger.record_pending("lost", tag("s3"), Some(tag("v1")), tag("v2-other"));

        let resolution = ledger.resolve(Some(&tag("v2")));
        assert_eq!(
            resolution,
            Resolution {
                committed: 1,
                dropped: 1
            }
        );
        assert!(ledger.is_committed("landed", Some(&tag("s1"))));
        assert!(matches!(ledger.get("waiting"), Some(LedgerEntry::Pending { .. })));
        assert!(ledger.get("lost").is_none());
    }

    #[test]
    fn test_first_commit_against_missing_table() {
        let mut ledger = Ledger::new();
        ledger.record_pending("first", tag("s1"), None, tag("v1"));

        assert!(!ledger.resolve(None).changed());
        assert!(!ledger.is_committed("first", None));

        ledger.resolve(Some(&tag("v1")));
        assert!(ledger.is_committed("first", None));
        assert_eq!(ledger.get("first").map(LedgerEntry::source), Some(&tag("s1")));
    }

    #[test]
    fn test_committed_entries_are_kept() {
        let mut ledger = Ledger::new();
        ledger.mark_committed("old", tag("s1"), tag("v1"));
        assert!(!ledger.resolve(Some(&tag("v9"))).changed());
        assert!(ledger.is_committed("old", None));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_commit_is_bound_to_summary_content() {
        let mut ledger = Ledger::new();
        ledger.mark_committed("day_summary.csv", tag("march 1"), tag("v1"));

        assert!(ledger.is_committed("day_summary.csv", Some(&tag("march 1"))));
        assert!(!ledger.is_committed("day_summary.csv", Some(&tag("march 2"))));
        assert!(ledger.is_committed("day_summary.csv", None));
        assert!(!ledger.is_committed("other_summary.csv", None));
    }

    #[test]
    fn test_compact_drops_only_old_commits() {
        let mut ledger = Ledger::new();
        ledger.mark_committed("old", tag("s1"), tag("v1"));
        ledger.record_pending("pending", tag("s2"), Some(tag("v1")), tag("v2"));

        assert_eq!(ledger.compact(Utc::now() - Duration::days(1)), 0);
        assert_eq!(ledger.len(), 2);

        assert_eq!(ledger.compact(Utc::now() + Duration::seconds(1)), 1);
        assert!(ledger.get("old").is_none());
        assert!(matches!(ledger.get("pending"), Some(LedgerEntry::Pending { .. })));
    }

    #[test]
    fn test_document_format() {
        let mut ledger = Ledger::new();
        ledger.mark_committed("day1_summary.csv", tag("s1"), tag("v1"));
        let encoded = ledger.encode().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(json["entries"]["day1_summary.csv"]["state"], "committed");
        assert_eq!(json["entries"]["day1_summary.csv"]["source"], tag("s1").as_str());

        assert_eq!(Ledger::decode(&encoded).unwrap(), ledger);
        assert_eq!(Ledger::decode(b"{}").unwrap(), Ledger::new());
    }
}
