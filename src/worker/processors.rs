//! Processors of the two pipeline queues

use super::MessageProcessor;
use crate::config::Layout;
use crate::consolidate::{Consolidator, CycleOutcome};
use crate::error::{PipelineError, Result};
use crate::message::{SummaryNotice, UploadNotice};
use crate::queue::{Delivery, MessageQueue};
use crate::reducer::FlowRecordReducer;
use crate::store::ObjectStore;
use crate::table::daily;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What summarizing an upload did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SummarizeOutcome {
    /// The raw file was reduced and its summary written
    Summarized {
        /// Summary name
        summary: String,
        /// Rows in the summary
        rows: usize,
    },
    /// The raw file was already gone but its summary exists; only the notice was re-sent
    Renotified {
        /// Summary name
        summary: String,
    },
}

/// Turns an uploaded raw file into a daily summary
///
/// Steps run in a fixed order: write summary, notify, delete raw file. A
/// failure at any point leaves enough behind for a redelivery to finish.
pub struct Summarizer {
    store: Arc<dyn ObjectStore>,
    notices: Arc<dyn MessageQueue>,
    reducer: FlowRecordReducer,
    layout: Layout,
}

impl Summarizer {
    /// Create a summarizer that notifies `notices` of every summary it writes
    pub fn new(
        store: Arc<dyn ObjectStore>,
        notices: Arc<dyn MessageQueue>,
        reducer: FlowRecordReducer,
        layout: Layout,
    ) -> Self {
        Self {
            store,
            notices,
            reducer,
            layout,
        }
    }

    /// Summarize the raw file named by an upload notice
    pub async fn summarize(&self, notice: &UploadNotice) -> Result<SummarizeOutcome> {
        let summary = notice.summary_name();
        let summary_key = self.layout.summary_key(&summary);

        let Some(raw) = self.store.get_opt(&notice.key).await? else {
            // Deleted by an earlier delivery; make sure the consolidation was triggered
            if self.store.head(&summary_key).await?.is_some() {
                info!(raw = %notice.key, summary = %summary, "Raw file already summarized, re-sending notice");
                self.notify(&summary).await?;
                return Ok(SummarizeOutcome::Renotified { summary });
            }
            return Err(PipelineError::NotFound(notice.key.clone()));
        };

        let reduced = self
            .reducer
            .reduce_bytes(&raw.bytes)
            .map_err(|e| PipelineError::parse(&notice.key, e))?;
        let bytes = daily::encode(&reduced).map_err(|e| PipelineError::parse(&summary_key, e))?;
        self.store.put(&summary_key, bytes).await?;
        info!(raw = %notice.key, summary = %summary, rows = reduced.len(), "Wrote daily summary");

        self.notify(&summary).await?;

        if let Err(e) = self.store.delete(&notice.key).await {
            warn!(raw = %notice.key, error = %e, "Could not delete raw file");
        }

        Ok(SummarizeOutcome::Summarized {
            summary,
            rows: reduced.len(),
        })
    }

    async fn notify(&self, summary: &str) -> Result<()> {
        let id = self.notices.send(SummaryNotice::new(summary).encode()?).await?;
        debug!(summary, message_id = %id, "Sent summary notice");
        Ok(())
    }
}

/// Processes upload notices
pub struct SummarizeProcessor {
    summarizer: Summarizer,
}

impl SummarizeProcessor {
    /// Create a processor around a summarizer
    pub fn new(summarizer: Summarizer) -> Self {
        Self { summarizer }
    }
}

#[async_trait]
impl MessageProcessor for SummarizeProcessor {
    async fn process(&self, delivery: &Delivery) -> Result<()> {
        let notice = UploadNotice::decode(&delivery.payload)?;
        self.summarizer.summarize(&notice).await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "summarize"
    }
}

/// Processes summary notices
pub struct ConsolidateProcessor {
    consolidator: Consolidator,
}

impl ConsolidateProcessor {
    /// Create a processor around a consolidator
    pub fn new(consolidator: Consolidator) -> Self {
        Self { consolidator }
    }
}

#[async_trait]
impl MessageProcessor for ConsolidateProcessor {
    async fn process(&self, delivery: &Delivery) -> Result<()> {
        let notice = SummaryNotice::decode(&delivery.payload)?;
        let report = self.consolidator.consolidate(&notice.summary).await?;
        match report.outcome {
            CycleOutcome::Applied { report: merge, .. } => info!(
                summary = %report.summary,
                attempts = report.attempts,
                observations = merge.observations,
                "Summary consolidated"
            ),
            CycleOutcome::AlreadyApplied => {
                info!(summary = %report.summary, "Duplicate summary notice ignored")
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "consolidate"
    }
}
