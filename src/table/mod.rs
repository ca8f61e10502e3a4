//! Persisted tables
//!
//! The aggregate table holds one row of reconstructable running statistics per
//! pair and is always read and written whole. Daily summary artifacts live in
//! [`daily`].
//!
//! Column names of both formats are an external contract.

pub mod daily;

use crate::error::ParseError;
use crate::model::PairKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;

/// Header of the aggregate table
pub const AGGREGATE_COLUMNS: [&str; 7] = [
    "SrcIP",
    "DstIP",
    "Count",
    "AvgFlowDuration",
    "StdFlowDuration",
    "AvgFwdPkts",
    "StdFwdPkts",
];

/// Persisted statistics of one pair
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PairSummaryRow {
    /// Number of daily observations
    pub count: u64,
    /// Mean of daily flow-duration totals
    pub avg_flow_duration: f64,
    /// Sample standard deviation of daily flow-duration totals
    pub std_flow_duration: f64,
    /// Mean of daily forward-packet totals
    pub avg_fwd_pkts: f64,
    /// Sample standard deviation of daily forward-packet totals
    pub std_fwd_pkts: f64,
}

/// CSV shape of one aggregate row
#[derive(Debug, Deserialize)]
struct AggregateRecord {
    #[serde(rename = "SrcIP")]
    src: String,
    #[serde(rename = "DstIP")]
    dst: String,
    #[serde(rename = "Count")]
    count: u64,
    #[serde(rename = "AvgFlowDuration")]
    avg_flow_duration: f64,
    #[serde(rename = "StdFlowDuration")]
    std_flow_duration: f64,
    #[serde(rename = "AvgFwdPkts")]
    avg_fwd_pkts: f64,
    #[serde(rename = "StdFwdPkts")]
    std_fwd_pkts: f64,
}

/// Render a float so that it parses back to the identical value
///
/// Integral values keep a trailing `.0` (`150.0`), matching the table files
/// written by earlier producers.
pub(crate) fn format_float(value: f64) -> String {
    format!("{:?}", value)
}

/// Running statistics for every pair seen so far
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateTable {
    rows: BTreeMap<PairKey, PairSummaryRow>,
}

impl AggregateTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Row for a pair
    pub fn get(&self, pair: &PairKey) -> Option<&PairSummaryRow> {
        self.rows.get(pair)
    }

    /// Insert or replace the row for a pair
    pub fn insert(&mut self, pair: PairKey, row: PairSummaryRow) -> Option<PairSummaryRow> {
        self.rows.insert(pair, row)
    }

    /// Iterate rows in pair order
    pub fn iter(&self) -> impl Iterator<Item = (&PairKey, &PairSummaryRow)> {
        self.rows.iter()
    }

    /// Number of pairs
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table has no rows
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Decode a table from CSV
    pub fn read_from<R: io::Read>(reader: R) -> Result<Self, ParseError> {
        let mut csv_reader = csv::ReaderBuilder::new().has_headers(true).from_reader(reader);
        check_headers(csv_reader.headers()?, &AGGREGATE_COLUMNS)?;

        let mut rows = BTreeMap::new();
        for result in csv_reader.deserialize::<AggregateRecord>() {
            let record = result?;
            let pair = PairKey::new(record.src, record.dst);
            let row = PairSummaryRow {
                count: record.count,
                avg_flow_duration: record.avg_flow_duration,
                std_flow_duration: record.std_flow_duration,
                avg_fwd_pkts: record.avg_fwd_pkts,
                std_fwd_pkts: record.std_fwd_pkts,
            };
            let line = rows.len() as u64 + 2;
            validate_row(line, &row)?;
            if rows.insert(pair.clone(), row).is_some() {
                return Err(ParseError::DuplicateKey {
                    line,
                    key: pair.to_string(),
                });
            }
        }

        Ok(Self { rows })
    }

    /// Decode a table from CSV bytes
    pub fn decode(bytes: &[u8]) -> Result<Self, ParseError> {
        Self::read_from(bytes)
    }

    /// Encode the whole table as CSV, rows sorted by pair
    pub fn encode(&self) -> Result<Vec<u8>, ParseError> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(AGGREGATE_COLUMNS)?;
        for (pair, row) in &self.rows {
            writer.write_record(&[
                pair.src.clone(),
                pair.dst.clone(),
                row.count.to_string(),
                format_float(row.avg_flow_duration),
                format_float(row.std_flow_duration),
                format_float(row.avg_fwd_pkts),
                format_float(row.std_fwd_pkts),
            ])?;
        }
        writer
            .into_inner()
            .map_err(|e| ParseError::Csv(csv::Error::from(e.into_error())))
    }
}

impl FromIterator<(PairKey, PairSummaryRow)> for AggregateTable {
    fn from_iter<I: IntoIterator<Item = (PairKey, PairSummaryRow)>>(iter: I) -> Self {
        Self {
            rows: iter.into_iter().collect(),
        }
    }
}

pub(crate) fn check_headers(headers: &csv::StringRecord, expected: &[&str]) -> Result<(), ParseError> {
    for column in expected {
        if !headers.iter().any(|h| h.trim() == *column) {
            return Err(ParseError::MissingColumn {
                column: column.to_string(),
            });
        }
    }
    Ok(())
}

fn validate_row(line: u64, row: &PairSummaryRow) -> Result<(), ParseError> {
    let fields = [
        ("AvgFlowDuration", row.avg_flow_duration),
        ("StdFlowDuration", row.std_flow_duration),
        ("AvgFwdPkts", row.avg_fwd_pkts),
        ("StdFwdPkts", row.std_fwd_pkts),
    ];
    for (column, value) in fields {
        let negative_std = column.starts_with("Std") && value < 0.0;
        if !value.is_finite() || negative_std {
            return Err(ParseError::InvalidNumber {
                line,
                column: column.to_string(),
                value: value.to_string(),
            });
        }
    }
    Ok(())
}
