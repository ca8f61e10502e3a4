//! Daily summary artifacts
//!
//! One CSV per reduced input file with columns
//! `Date, SrcIP, DstIP, TotalFlowDuration, TotalFwdPkts`.

use super::check_headers;
use crate::error::ParseError;
use crate::model::{DailyPairTotal, DailySummary, DayPairKey, PairKey};
use chrono::NaiveDate;
use serde::Deserialize;
use std::io;

/// Header of a daily summary artifact
pub const DAILY_COLUMNS: [&str; 5] = ["Date", "SrcIP", "DstIP", "TotalFlowDuration", "TotalFwdPkts"];

#[derive(Debug, Deserialize)]
struct DailyRecord {
    #[serde(rename = "Date")]
    date: String,
    #[serde(rename = "SrcIP")]
    src: String,
    #[serde(rename = "DstIP")]
    dst: String,
    #[serde(rename = "TotalFlowDuration")]
    total_flow_duration: i64,
    #[serde(rename = "TotalFwdPkts")]
    total_fwd_packets: i64,
}

/// Encode a summary, rows in (date, src, dst) order
pub fn encode(summary: &DailySummary) -> Result<Vec<u8>, ParseError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(DAILY_COLUMNS)?;
    for (key, total) in summary.iter() {
        writer.write_record(&[
            key.date.format("%Y-%m-%d").to_string(),
            key.pair.src.clone(),
            key.pair.dst.clone(),
            total.total_flow_duration.to_string(),
            total.total_fwd_packets.to_string(),
        ])?;
    }
    writer
        .into_inner()
        .map_err(|e| ParseError::Csv(csv::Error::from(e.into_error())))
}

/// Decode a summary from CSV
pub fn read_from<R: io::Read>(reader: R) -> Result<DailySummary, ParseError> {
    let mut csv_reader = csv::ReaderBuilder::new().has_headers(true).from_reader(reader);
    check_headers(csv_reader.headers()?, &DAILY_COLUMNS)?;

    let mut summary = DailySummary::new();
    for (idx, result) in csv_reader.deserialize::<DailyRecord>().enumerate() {
        let record = result?;
        let line = idx as u64 + 2;
        let date = NaiveDate::parse_from_str(record.date.trim(), "%Y-%m-%d").map_err(|_| {
            ParseError::InvalidDate {
                line,
                value: record.date.clone(),
            }
        })?;
        let key = DayPairKey::new(date, PairKey::new(record.src, record.dst));
        let total = DailyPairTotal::new(record.total_flow_duration, record.total_fwd_packets);
        if summary.get(&key).is_some() {
            return Err(ParseError::DuplicateKey {
                line,
                key: format!("{} {}", key.date, key.pair),
            });
        }
        summary.insert(key, total);
    }
    Ok(summary)
}

/// Decode a summary from CSV bytes
pub fn decode(bytes: &[u8]) -> Result<DailySummary, ParseError> {
    read_from(bytes)
}

/// Rows of a summary that belong to one pair, in date order
pub fn rows_for_pair<'a>(
    summary: &'a DailySummary,
    pair: &'a PairKey,
) -> impl Iterator<Item = (NaiveDate, DailyPairTotal)> + 'a {
    summary
        .iter()
        .filter(move |(key, _)| &key.pair == pair)
        .map(|(key, total)| (key.date, *total))
}
