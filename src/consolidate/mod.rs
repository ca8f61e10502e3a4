//! Incremental consolidation engine
//!
//! One cycle per daily summary: LOAD the ledger and the aggregate table,
//! MERGE the summary rows, COMMIT the new table with a conditional put
//! against the version that was loaded. A lost commit re-runs the whole cycle
//! under the configured [`RetryPolicy`]; nothing is written partially.
//!
//! Every commit is announced in the processed [`Ledger`] first, which makes a
//! redelivered summary a no-op no matter where the previous attempt stopped.
//! The table is written under a tag chosen for that one commit, so another
//! summary producing an identical table cannot pass for it.
//!
//! # Example
//!
//! ```
//! use pairflow::consolidate::{Consolidator, CycleOutcome};
//! use pairflow::config::Layout;
//! use pairflow::retry::RetryPolicy;
//! use pairflow::store::{MemoryStore, ObjectStore};
//! use std::sync::Arc;
//!
//! # async fn example() -> pairflow::Result<()> {
//! let store = Arc::new(MemoryStore::new());
//! store
//!     .put(
//!         "summaries/day1_summary.csv",
//!         b"Date,SrcIP,DstIP,TotalFlowDuration,TotalFwdPkts\n2024-03-01,A,B,100,10\n".to_vec(),
//!     )
//!     .await?;
//!
//! let consolidator = Consolidator::new(store, Layout::default(), RetryPolicy::default());
//! let report = consolidator.consolidate("day1_summary.csv").await?;
//! assert!(matches!(report.outcome, CycleOutcome::Applied { .. }));
//!
//! // Redelivery changes nothing
//! let again = consolidator.consolidate("day1_summary.csv").await?;
//! assert_eq!(again.outcome, CycleOutcome::AlreadyApplied);
//! # Ok(())
//! # }
//! ```

mod ledger;
mod merge;

pub use ledger::{Ledger, LedgerEntry, Resolution};
pub use merge::{merge_summary, MergeReport};

use crate::config::{CleanupPolicy, Layout};
use crate::error::{PipelineError, Result};
use crate::model::DailySummary;
use crate::retry::{RetryExecutor, RetryPolicy, RetryResult};
use crate::store::{ETag, ObjectStore, PutCondition};
use crate::table::{daily, AggregateTable};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of one consolidation cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The summary was merged and the table committed
    Applied {
        /// What the merge changed
        report: MergeReport,
        /// Version of the committed table
        table: ETag,
    },
    /// The ledger shows the summary was merged before
    AlreadyApplied,
}

/// Report of a consolidation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// Summary name
    pub summary: String,
    /// What the cycle did
    pub outcome: CycleOutcome,
    /// LOAD/MERGE/COMMIT attempts, 1 without conflicts
    pub attempts: u32,
    /// Whether the summary artifact was cleaned up
    pub cleaned_up: bool,
}

/// Aggregate table as loaded, with the version to commit against
#[derive(Debug, Clone, Default)]
pub struct LoadedTable {
    /// Table contents, empty when no table exists yet
    pub table: AggregateTable,
    /// Version of the stored table, `None` when absent
    pub etag: Option<ETag>,
}

// A summary as read for consolidation, with the digest that identifies it
struct Incoming {
    daily: DailySummary,
    source: ETag,
}

/// Folds daily summaries into the aggregate table
#[derive(Clone)]
pub struct Consolidator {
    store: Arc<dyn ObjectStore>,
    layout: Layout,
    retry: RetryPolicy,
}

impl std::fmt::Debug for Consolidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consolidator")
            .field("layout", &self.layout)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl Consolidator {
    /// Create a consolidator over a store
    pub fn new(store: Arc<dyn ObjectStore>, layout: Layout, retry: RetryPolicy) -> Self {
        Self { store, layout, retry }
    }

    /// Object layout in use
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Load the aggregate table; a missing table is an empty one
    pub async fn load_table(&self) -> Result<LoadedTable> {
        let key = &self.layout.table_key;
        match self.store.get_opt(key).await? {
            Some(object) => {
                let table = AggregateTable::decode(&object.bytes).map_err(|e| PipelineError::parse(key, e))?;
                Ok(LoadedTable {
                    table,
                    etag: Some(object.etag),
                })
            }
            None => Ok(LoadedTable::default()),
        }
    }

    /// Load the processed ledger with its version
    pub async fn load_ledger(&self) -> Result<(Ledger, Option<ETag>)> {
        match self.store.get_opt(&self.layout.ledger_key).await? {
            Some(object) => Ok((Ledger::decode(&object.bytes)?, Some(object.etag))),
            None => Ok((Ledger::new(), None)),
        }
    }

    /// Consolidate one daily summary, identified by its name under the summary prefix
    pub async fn consolidate(&self, summary: &str) -> Result<CycleReport> {
        let key = self.layout.summary_key(summary);
        info!(summary, "Consolidating daily summary");

        // One read serves every attempt. A missing summary is only an error
        // if the ledger does not already hold it.
        let incoming = match self.store.get_opt(&key).await? {
            Some(object) => Some(Incoming {
                daily: daily::decode(&object.bytes).map_err(|e| PipelineError::parse(&key, e))?,
                source: ETag::of(&object.bytes),
            }),
            None => None,
        };

        let executor = RetryExecutor::new(self.retry.clone());
        let result = executor
            .execute_with_predicate(
                || self.run_cycle(summary, incoming.as_ref()),
                PipelineError::is_conflict,
            )
            .await;

        let (outcome, attempts) = match result {
            RetryResult::Success { value, attempts } => (value, attempts),
            RetryResult::Failed {
                error: PipelineError::Conflict { .. },
                attempts,
            } => {
                warn!(summary, attempts, "Giving up after repeated commit conflicts");
                return Err(PipelineError::Conflict {
                    key: self.layout.table_key.clone(),
                    attempts,
                });
            }
            RetryResult::Failed { error, .. } => return Err(error),
        };

        let cleaned_up = match self.cleanup(summary).await {
            Ok(()) => true,
            Err(e) => {
                warn!(summary, error = %e, "Summary cleanup failed");
                false
            }
        };

        Ok(CycleReport {
            summary: summary.to_string(),
            outcome,
            attempts,
            cleaned_up,
        })
    }

    async fn run_cycle(&self, summary: &str, incoming: Option<&Incoming>) -> Result<CycleOutcome> {
        let ledger_key = &self.layout.ledger_key;
        let table_key = &self.layout.table_key;

        // LOAD: ledger before table, so a resolution never outruns the ledger version
        let (mut ledger, ledger_etag) = self.load_ledger().await?;
        let loaded = self.load_table().await?;
        let resolution = ledger.resolve(loaded.etag.as_ref());
        if resolution.changed() {
            debug!(
                committed = resolution.committed,
                dropped = resolution.dropped,
                "Resolved pending ledger entries"
            );
        }

        if ledger.is_committed(summary, incoming.map(|i| &i.source)) {
            info!(summary, "Summary already consolidated, skipping merge");
            if resolution.changed() {
                self.compact(&mut ledger);
                self.persist_quietly(&ledger, PutCondition::expecting(ledger_etag.as_ref()))
                    .await;
            }
            return Ok(CycleOutcome::AlreadyApplied);
        }

        let incoming = incoming.ok_or_else(|| PipelineError::NotFound(self.layout.summary_key(summary)))?;

        // MERGE
        let (merged, report) = merge_summary(&loaded.table, &incoming.daily);
        let bytes = merged.encode().map_err(|e| PipelineError::parse(table_key, e))?;
        let expected = ETag::fresh(&bytes);
        debug!(
            summary,
            observations = report.observations,
            pairs_updated = report.pairs_updated,
            pairs_added = report.pairs_added,
            "Merged summary"
        );

        // COMMIT: announce, write, confirm
        self.compact(&mut ledger);
        ledger.record_pending(summary, incoming.source.clone(), loaded.etag.clone(), expected.clone());
        let ledger_etag = self
            .store
            .put_if(ledger_key, ledger.encode()?, PutCondition::expecting(ledger_etag.as_ref()))
            .await?;
        let table = self
            .store
            .put_as(table_key, bytes, PutCondition::expecting(loaded.etag.as_ref()), expected)
            .await?;
        info!(summary, pairs = merged.len(), etag = %table, "Committed aggregate table");

        // The table already carries the merge; a failed confirmation is settled by the next LOAD
        ledger.mark_committed(summary, incoming.source.clone(), table.clone());
        self.persist_quietly(&ledger, PutCondition::Matches(ledger_etag)).await;

        Ok(CycleOutcome::Applied { report, table })
    }

    fn compact(&self, ledger: &mut Ledger) {
        if let Some(retention) = self.layout.ledger_retention() {
            let dropped = ledger.compact(Utc::now() - retention);
            if dropped > 0 {
                debug!(dropped, "Compacted ledger");
            }
        }
    }

    async fn persist_quietly(&self, ledger: &Ledger, condition: PutCondition) {
        let bytes = match ledger.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Could not encode ledger");
                return;
            }
        };
        match self.store.put_if(&self.layout.ledger_key, bytes, condition).await {
            Ok(_) => {}
            Err(e) if e.is_retryable() => debug!(error = %e, "Ledger update deferred to next load"),
            Err(e) => warn!(error = %e, "Ledger update failed"),
        }
    }

    /// Remove a consumed summary according to the cleanup policy
    pub async fn cleanup(&self, summary: &str) -> Result<()> {
        let key = self.layout.summary_key(summary);
        match &self.layout.cleanup {
            CleanupPolicy::Delete => {}
            CleanupPolicy::Archive { prefix } => {
                if let Some(object) = self.store.get_opt(&key).await? {
                    let archived = format!("{}{}", prefix, summary);
                    self.store.put(&archived, object.bytes).await?;
                    debug!(summary, archived = %archived, "Archived summary");
                }
            }
        }
        self.store.delete(&key).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PairKey;
    use crate::store::{MemoryStore, StoreError};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    const HEADER: &str = "Date,SrcIP,DstIP,TotalFlowDuration,TotalFwdPkts\n";

    async fn put_summary(store: &MemoryStore, name: &str, rows: &str) {
        store
            .put(&format!("summaries/{}", name), format!("{}{}", HEADER, rows).into_bytes())
            .await
            .unwrap();
    }

    fn consolidator(store: Arc<MemoryStore>) -> Consolidator {
        Consolidator::new(
            store,
            Layout::default(),
            RetryPolicy::fixed(5, Duration::from_millis(1)),
        )
    }

    #[tokio::test]
    async fn test_first_run_creates_table_and_cleans_up() {
        let store = Arc::new(MemoryStore::new());
        put_summary(&store, "d1_summary.csv", "2024-03-01,A,B,100,10\n").await;

        let engine = consolidator(store.clone());
        let report = engine.consolidate("d1_summary.csv").await.unwrap();
        assert_eq!(report.attempts, 1);
        assert!(report.cleaned_up);

        let loaded = engine.load_table().await.unwrap();
        let row = loaded.table.get(&PairKey::new("A", "B")).unwrap();
        assert_eq!((row.count, row.avg_flow_duration, row.std_flow_duration), (1, 100.0, 0.0));
        assert!(store.get_opt("summaries/d1_summary.csv").await.unwrap().is_none());

        let (ledger, _) = engine.load_ledger().await.unwrap();
        assert!(ledger.is_committed("d1_summary.csv", None));
    }

    #[tokio::test]
    async fn test_redelivery_after_cleanup_is_noop() {
        let store = Arc::new(MemoryStore::new());
        put_summary(&store, "d1_summary.csv", "2024-03-01,A,B,100,10\n").await;
        let engine = consolidator(store.clone());
        engine.consolidate("d1_summary.csv").await.unwrap();
        let before = store.get("consolidated/traffic_stats.csv").await.unwrap();

        let report = engine.consolidate("d1_summary.csv").await.unwrap();
        assert_eq!(report.outcome, CycleOutcome::AlreadyApplied);
        assert_eq!(store.get("consolidated/traffic_stats.csv").await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_redelivery_before_cleanup_is_noop() {
        let store = Arc::new(MemoryStore::new());
        put_summary(&store, "d1_summary.csv", "2024-03-01,A,B,100,10\n").await;
        let engine = consolidator(store.clone());
        engine.consolidate("d1_summary.csv").await.unwrap();

        // Crash between commit and cleanup: the summary is still there
        put_summary(&store, "d1_summary.csv", "2024-03-01,A,B,100,10\n").await;
        let report = engine.consolidate("d1_summary.csv").await.unwrap();
        assert_eq!(report.outcome, CycleOutcome::AlreadyApplied);
        assert!(report.cleaned_up);

        let row = *engine.load_table().await.unwrap().table.get(&PairKey::new("A", "B")).unwrap();
        assert_eq!(row.count, 1);
    }

    #[tokio::test]
    async fn test_pending_entry_for_landed_commit_is_not_reapplied() {
        let store = Arc::new(MemoryStore::new());
        put_summary(&store, "d1_summary.csv", "2024-03-01,A,B,100,10\n").await;
        let engine = consolidator(store.clone());

        // Simulate a crash right after the table commit: pending entry, table written
        let raw = store.get("summaries/d1_summary.csv").await.unwrap().bytes;
        let (merged, _) = merge_summary(&AggregateTable::new(), &daily::decode(&raw).unwrap());
        let bytes = merged.encode().unwrap();
        let expected = ETag::fresh(&bytes);
        let mut ledger = Ledger::new();
        ledger.record_pending("d1_summary.csv", ETag::of(&raw), None, expected.clone());
        store.put("consolidated/ledger.json", ledger.encode().unwrap()).await.unwrap();
        store
            .put_as("consolidated/traffic_stats.csv", bytes, PutCondition::Any, expected)
            .await
            .unwrap();

        let report = engine.consolidate("d1_summary.csv").await.unwrap();
        assert_eq!(report.outcome, CycleOutcome::AlreadyApplied);
        assert_eq!(engine.load_table().await.unwrap().table, merged);
        assert!(engine.load_ledger().await.unwrap().0.is_committed("d1_summary.csv", None));
    }

    #[tokio::test]
    async fn test_pending_entry_for_lost_commit_is_retried() {
        let store = Arc::new(MemoryStore::new());
        put_summary(&store, "d1_summary.csv", "2024-03-01,A,B,100,10\n").await;
        let engine = consolidator(store.clone());

        // Crash after announcing but before the table commit
        let mut ledger = Ledger::new();
        ledger.record_pending("d1_summary.csv", ETag::of(b"d1"), None, ETag::fresh(b"never written"));
        store.put("consolidated/ledger.json", ledger.encode().unwrap()).await.unwrap();

        let report = engine.consolidate("d1_summary.csv").await.unwrap();
        assert!(matches!(report.outcome, CycleOutcome::Applied { .. }));
        let row = *engine.load_table().await.unwrap().table.get(&PairKey::new("A", "B")).unwrap();
        assert_eq!(row.count, 1);
    }

    #[tokio::test]
    async fn test_missing_summary_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        let err = consolidator(store).consolidate("nope_summary.csv").await.unwrap_err();
        assert!(matches!(err, PipelineError::NotFound(ref k) if k == "summaries/nope_summary.csv"));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_malformed_summary_leaves_table_untouched() {
        let store = Arc::new(MemoryStore::new());
        put_summary(&store, "bad_summary.csv", "2024-03-01,A,B,lots,10\n").await;
        let err = consolidator(store.clone()).consolidate("bad_summary.csv").await.unwrap_err();
        assert!(matches!(err, PipelineError::Parse { .. }));
        assert!(store.head("consolidated/traffic_stats.csv").await.unwrap().is_none());
        assert!(store.head("summaries/bad_summary.csv").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_archive_cleanup() {
        let store = Arc::new(MemoryStore::new());
        put_summary(&store, "d1_summary.csv", "2024-03-01,A,B,100,10\n").await;
        let layout = Layout {
            cleanup: CleanupPolicy::Archive {
                prefix: "archive/".to_string(),
            },
            ..Layout::default()
        };
        let engine = Consolidator::new(store.clone(), layout, RetryPolicy::no_retry());
        engine.consolidate("d1_summary.csv").await.unwrap();

        assert!(store.head("summaries/d1_summary.csv").await.unwrap().is_none());
        assert!(store.head("archive/d1_summary.csv").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_corrupt_table_fails_without_write() {
        let store = Arc::new(MemoryStore::new());
        put_summary(&store, "d1_summary.csv", "2024-03-01,A,B,100,10\n").await;
        store
            .put("consolidated/traffic_stats.csv", b"garbage\n".to_vec())
            .await
            .unwrap();
        let err = consolidator(store.clone()).consolidate("d1_summary.csv").await.unwrap_err();
        assert!(matches!(err, PipelineError::Parse { .. }));
        assert!(matches!(
            store.get("consolidated/ledger.json").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_identical_table_from_another_summary_is_not_a_commit() {
        let store = Arc::new(MemoryStore::new());
        let rows = "2024-03-01,A,B,100,10\n";
        put_summary(&store, "s1_summary.csv", rows).await;
        put_summary(&store, "s2_summary.csv", rows).await;
        let engine = consolidator(store.clone());

        // s1 announced its commit against the missing table, then crashed
        let raw = store.get("summaries/s1_summary.csv").await.unwrap().bytes;
        let (merged, _) = merge_summary(&AggregateTable::new(), &daily::decode(&raw).unwrap());
        let mut ledger = Ledger::new();
        ledger.record_pending("s1_summary.csv", ETag::of(&raw), None, ETag::fresh(&merged.encode().unwrap()));
        store.put("consolidated/ledger.json", ledger.encode().unwrap()).await.unwrap();

        // s2 writes exactly the table s1 would have written
        let s2 = engine.consolidate("s2_summary.csv").await.unwrap();
        assert!(matches!(s2.outcome, CycleOutcome::Applied { .. }));
        assert_eq!(engine.load_table().await.unwrap().table, merged);

        let s1 = engine.consolidate("s1_summary.csv").await.unwrap();
        assert!(matches!(s1.outcome, CycleOutcome::Applied { .. }));
        let row = *engine.load_table().await.unwrap().table.get(&PairKey::new("A", "B")).unwrap();
        assert_eq!(row.count, 2);
    }

    #[tokio::test]
    async fn test_reused_name_with_new_content_is_merged() {
        let store = Arc::new(MemoryStore::new());
        let engine = consolidator(store.clone());

        put_summary(&store, "day_summary.csv", "2024-03-01,A,B,100,10\n").await;
        engine.consolidate("day_summary.csv").await.unwrap();

        put_summary(&store, "day_summary.csv", "2024-03-02,A,B,300,30\n").await;
        let second = engine.consolidate("day_summary.csv").await.unwrap();
        assert!(matches!(second.outcome, CycleOutcome::Applied { .. }));

        // The same bytes again, and then the name with nothing behind it
        put_summary(&store, "day_summary.csv", "2024-03-02,A,B,300,30\n").await;
        let again = engine.consolidate("day_summary.csv").await.unwrap();
        assert_eq!(again.outcome, CycleOutcome::AlreadyApplied);
        let gone = engine.consolidate("day_summary.csv").await.unwrap();
        assert_eq!(gone.outcome, CycleOutcome::AlreadyApplied);

        let row = *engine.load_table().await.unwrap().table.get(&PairKey::new("A", "B")).unwrap();
        assert_eq!((row.count, row.avg_flow_duration), (2, 200.0));
    }

    #[tokio::test]
    async fn test_commits_past_retention_are_compacted() {
        let store = Arc::new(MemoryStore::new());
        let stale = r#"{"entries":{"old_summary.csv":{"state":"committed","source":"1-0000000000000000","table":"1-0000000000000000-0000000000000000","at":"2020-01-01T00:00:00Z"}}}"#;
        store.put("consolidated/ledger.json", stale.as_bytes().to_vec()).await.unwrap();
        put_summary(&store, "d1_summary.csv", "2024-03-01,A,B,100,10\n").await;

        consolidator(store.clone()).consolidate("d1_summary.csv").await.unwrap();
        let (ledger, _) = consolidator(store.clone()).load_ledger().await.unwrap();
        assert!(ledger.get("old_summary.csv").is_none());
        assert!(ledger.is_committed("d1_summary.csv", None));

        // Retention 0 keeps everything
        store.put("consolidated/ledger.json", stale.as_bytes().to_vec()).await.unwrap();
        put_summary(&store, "d2_summary.csv", "2024-03-02,A,B,100,10\n").await;
        let layout = Layout {
            ledger_retention_days: 0,
            ..Layout::default()
        };
        let engine = Consolidator::new(store.clone(), layout, RetryPolicy::no_retry());
        engine.consolidate("d2_summary.csv").await.unwrap();
        assert_eq!(engine.load_ledger().await.unwrap().0.len(), 2);
    }
}
