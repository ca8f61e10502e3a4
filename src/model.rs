//! Domain types shared by the reducer, the consolidation engine and the exporter

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// An ordered (source, destination) address combination
///
/// Addresses are kept verbatim: `10.0.0.1` and `010.000.000.001` are
/// different pairs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PairKey {
    /// Source address
    pub src: String,
    /// Destination address
    pub dst: String,
}

impl PairKey {
    /// Create a new pair key
    pub fn new(src: impl Into<String>, dst: impl Into<String>) -> Self {
        Self {
            src: src.into(),
            dst: dst.into(),
        }
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}

/// Key of one row of a daily summary
///
/// Field order makes the derived `Ord` sort by date first, which is the order
/// observations are folded into the aggregate table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DayPairKey {
    /// Calendar date of the flows
    pub date: NaiveDate,
    /// Communicating pair
    pub pair: PairKey,
}

impl DayPairKey {
    /// Create a new day/pair key
    pub fn new(date: NaiveDate, pair: PairKey) -> Self {
        Self { date, pair }
    }
}

/// One parsed raw flow record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowRecord {
    /// Source address
    pub src: String,
    /// Destination address
    pub dst: String,
    /// Calendar date derived from the record timestamp
    pub date: NaiveDate,
    /// Flow duration
    pub flow_duration: i64,
    /// Forward packet count
    pub fwd_packets: i64,
}

impl FlowRecord {
    /// Key this record is reduced under
    pub fn day_pair(&self) -> DayPairKey {
        DayPairKey::new(self.date, PairKey::new(self.src.clone(), self.dst.clone()))
    }
}

/// Summed flow duration and forward packets for one (date, pair) within one file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyPairTotal {
    /// Sum of flow durations
    pub total_flow_duration: i64,
    /// Sum of forward packet counts
    pub total_fwd_packets: i64,
}

impl DailyPairTotal {
    /// Create a new total
    pub fn new(total_flow_duration: i64, total_fwd_packets: i64) -> Self {
        Self {
            total_flow_duration,
            total_fwd_packets,
        }
    }
}

/// The reduction of one input file: one total per (date, pair)
///
/// Backed by a `BTreeMap` so iteration, serialization and merging are
/// deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DailySummary {
    rows: BTreeMap<DayPairKey, DailyPairTotal>,
}

impl DailySummary {
    /// Create an empty summary
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a total, replacing any existing total for the key
    pub fn insert(&mut self, key: DayPairKey, total: DailyPairTotal) -> Option<DailyPairTotal> {
        self.rows.insert(key, total)
    }

    /// Look up the total for a key
    pub fn get(&self, key: &DayPairKey) -> Option<&DailyPairTotal> {
        self.rows.get(key)
    }

    /// Mutable entry for accumulation
    pub(crate) fn entry(&mut self, key: DayPairKey) -> &mut DailyPairTotal {
        self.rows.entry(key).or_default()
    }

    /// Iterate rows in (date, src, dst) order
    pub fn iter(&self) -> impl Iterator<Item = (&DayPairKey, &DailyPairTotal)> {
        self.rows.iter()
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the summary has no rows
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Distinct pairs touched by this summary
    pub fn pairs(&self) -> impl Iterator<Item = &PairKey> {
        let mut seen: Vec<&PairKey> = self.rows.keys().map(|k| &k.pair).collect();
        seen.sort();
        seen.dedup();
        seen.into_iter()
    }
}

impl FromIterator<(DayPairKey, DailyPairTotal)> for DailySummary {
    fn from_iter<I: IntoIterator<Item = (DayPairKey, DailyPairTotal)>>(iter: I) -> Self {
        Self {
            rows: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2018, 2, d).unwrap()
    }

    #[test]
    fn test_day_pair_orders_by_date_first() {
        let early = DayPairKey::new(date(1), PairKey::new("z", "z"));
        let late = DayPairKey::new(date(2), PairKey::new("a", "a"));
        assert!(early < late);
    }

    #[test]
    fn test_pairs_are_deduplicated() {
        let summary: DailySummary = vec![
            (DayPairKey::new(date(1), PairKey::new("a", "b")), DailyPairTotal::new(1, 1)),
            (DayPairKey::new(date(2), PairKey::new("a", "b")), DailyPairTotal::new(2, 2)),
            (DayPairKey::new(date(2), PairKey::new("c", "d")), DailyPairTotal::new(3, 3)),
        ]
        .into_iter()
        .collect();

        let pairs: Vec<_> = summary.pairs().cloned().collect();
        assert_eq!(pairs, vec![PairKey::new("a", "b"), PairKey::new("c", "d")]);
        assert_eq!(summary.len(), 3);
    }

    #[test]
    fn test_separator_in_address_is_not_ambiguous() {
        let a = PairKey::new("a_b", "c");
        let b = PairKey::new("a", "b_c");
        assert_ne!(a, b);
    }
}
