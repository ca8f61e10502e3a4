//! Per-pair historical export
//!
//! Joins the daily rows of one pair, gathered from every summary still in the
//! store, with the pair's aggregate statistics.

use crate::config::Layout;
use crate::error::{ParseError, PipelineError, Result};
use crate::model::{DailyPairTotal, PairKey};
use crate::store::ObjectStore;
use crate::table::{daily, format_float, AggregateTable, PairSummaryRow};
use chrono::NaiveDate;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Header of an export file
pub const EXPORT_COLUMNS: [&str; 10] = [
    "Date",
    "SrcIP",
    "DstIP",
    "TotalFlowDuration",
    "TotalFwdPkts",
    "Count",
    "AvgFlowDuration",
    "StdFlowDuration",
    "AvgFwdPkts",
    "StdFwdPkts",
];

/// Daily history and aggregate statistics of one pair
#[derive(Debug, Clone, PartialEq)]
pub struct PairExport {
    /// Exported pair
    pub pair: PairKey,
    /// Aggregate row of the pair
    pub stats: PairSummaryRow,
    /// Daily totals in date order
    pub days: Vec<(NaiveDate, DailyPairTotal)>,
}

impl PairExport {
    /// Conventional file name, `export_<src>_<dst>.csv`
    pub fn file_name(&self) -> String {
        format!("export_{}_{}.csv", self.pair.src, self.pair.dst)
    }

    /// Encode as CSV, one line per day with the aggregate columns repeated
    pub fn encode(&self) -> std::result::Result<Vec<u8>, ParseError> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(EXPORT_COLUMNS)?;
        for (date, total) in &self.days {
            writer.write_record(&[
                date.format("%Y-%m-%d").to_string(),
                self.pair.src.clone(),
                self.pair.dst.clone(),
                total.total_flow_duration.to_string(),
                total.total_fwd_packets.to_string(),
                self.stats.count.to_string(),
                format_float(self.stats.avg_flow_duration),
                format_float(self.stats.std_flow_duration),
                format_float(self.stats.avg_fwd_pkts),
                format_float(self.stats.std_fwd_pkts),
            ])?;
        }
        writer
            .into_inner()
            .map_err(|e| ParseError::Csv(csv::Error::from(e.into_error())))
    }
}

/// Reads summaries and the aggregate table to build exports
pub struct Exporter {
    store: Arc<dyn ObjectStore>,
    layout: Layout,
}

impl Exporter {
    /// Create an exporter
    pub fn new(store: Arc<dyn ObjectStore>, layout: Layout) -> Self {
        Self { store, layout }
    }

    /// Load the aggregate table, empty if none was written yet
    pub async fn load_table(&self) -> Result<AggregateTable> {
        let key = &self.layout.table_key;
        match self.store.get_opt(key).await? {
            Some(object) => AggregateTable::decode(&object.bytes).map_err(|e| PipelineError::parse(key, e)),
            None => Ok(AggregateTable::new()),
        }
    }

    /// Export one pair
    ///
    /// Fails with `PairNotFound` if the aggregate table has no row for the
    /// pair and with `NoDailyRows` if no summary mentions it.
    pub async fn export(&self, pair: &PairKey) -> Result<PairExport> {
        let table = self.load_table().await?;
        let stats = *table
            .get(pair)
            .ok_or_else(|| PipelineError::PairNotFound(pair.to_string()))?;

        // A summary can sit under both prefixes after an interrupted archive move
        let mut seen = BTreeSet::new();
        let mut days = Vec::new();
        for prefix in self.layout.summary_prefixes() {
            for key in self.store.list(prefix).await? {
                let name = key[prefix.len()..].to_string();
                if !key.ends_with(".csv") || !seen.insert(name) {
                    continue;
                }
                let object = match self.store.get_opt(&key).await? {
                    Some(object) => object,
                    // Cleaned up since listing
                    None => continue,
                };
                let summary = daily::decode(&object.bytes).map_err(|e| PipelineError::parse(&key, e))?;
                let before = days.len();
                days.extend(daily::rows_for_pair(&summary, pair));
                debug!(key = %key, rows = days.len() - before, "Scanned summary");
            }
        }

        if days.is_empty() {
            return Err(PipelineError::NoDailyRows(pair.to_string()));
        }
        days.sort_by_key(|(date, _)| *date);

        info!(pair = %pair, days = days.len(), "Export ready");
        Ok(PairExport {
            pair: pair.clone(),
            stats,
            days,
        })
    }
}
