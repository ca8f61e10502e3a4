//! Pure merge of a daily summary into the aggregate table

use crate::model::{DailySummary, PairKey};
use crate::stats::PairAccumulator;
use crate::table::AggregateTable;
use std::collections::BTreeMap;

/// What a merge changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Daily rows folded in
    pub observations: usize,
    /// Pairs that already had a row
    pub pairs_updated: usize,
    /// Pairs seen for the first time
    pub pairs_added: usize,
}

/// Fold every row of `summary` into `table`
///
/// Each (date, pair) row is one observation for its pair, applied in date
/// order. Rows of pairs absent from the summary are carried over untouched,
/// without a reconstruct/serialize round.
pub fn merge_summary(table: &AggregateTable, summary: &DailySummary) -> (AggregateTable, MergeReport) {
    let mut report = MergeReport::default();
    let mut touched: BTreeMap<&PairKey, PairAccumulator> = BTreeMap::new();

    for (key, total) in summary.iter() {
        let accumulator = touched.entry(&key.pair).or_insert_with(|| match table.get(&key.pair) {
            Some(row) => {
                report.pairs_updated += 1;
                PairAccumulator::from_row(row)
            }
            None => {
                report.pairs_added += 1;
                PairAccumulator::new()
            }
        });
        accumulator.observe(total);
        report.observations += 1;
    }

    let mut merged = table.clone();
    for (pair, accumulator) in touched {
        merged.insert(pair.clone(), accumulator.to_row());
    }
    (merged, report)
}
