//! Flow record reduction
//!
//! Turns one raw flow-record CSV file into a [`DailySummary`]: one row per
//! (date, source, destination) carrying the summed flow duration and the summed
//! forward-packet count.
//!
//! # Example
//!
//! ```
//! use pairflow::reducer::FlowRecordReducer;
//!
//! let csv = "\
//! Src IP,Dst IP,Timestamp,Flow Duration,Tot Fwd Pkts
//! 10.0.0.1,10.0.0.2,14/02/2018 08:31:01 AM,100,4
//! 10.0.0.1,10.0.0.2,14/02/2018 09:00:00 PM,50,6
//! ";
//!
//! let summary = FlowRecordReducer::default().reduce_bytes(csv.as_bytes()).unwrap();
//! assert_eq!(summary.len(), 1);
//! ```

mod config;

pub use config::ReducerConfig;

use crate::error::ParseError;
use crate::model::{DailySummary, FlowRecord};
use chrono::{NaiveDate, NaiveDateTime};
use std::io;
use tracing::debug;

/// Column positions resolved from the header row
#[derive(Debug, Clone, Copy)]
struct ColumnIndex {
    src: usize,
    dst: usize,
    timestamp: usize,
    duration: usize,
    fwd_packets: usize,
}

impl ColumnIndex {
    fn resolve(headers: &csv::StringRecord, config: &ReducerConfig) -> Result<Self, ParseError> {
        let find = |name: &str| {
            headers
                .iter()
                .position(|h| h.trim() == name)
                .ok_or_else(|| ParseError::MissingColumn {
                    column: name.to_string(),
                })
        };

        Ok(Self {
            src: find(&config.src_column)?,
            dst: find(&config.dst_column)?,
            timestamp: find(&config.timestamp_column)?,
            duration: find(&config.duration_column)?,
            fwd_packets: find(&config.fwd_packets_column)?,
        })
    }
}

/// Reduces raw flow records to daily per-pair totals
#[derive(Debug, Clone, Default)]
pub struct FlowRecordReducer {
    config: ReducerConfig,
}

impl FlowRecordReducer {
    /// Create a reducer with the given column layout
    pub fn new(config: ReducerConfig) -> Self {
        Self { config }
    }

    /// Reducer configuration
    pub fn config(&self) -> &ReducerConfig {
        &self.config
    }

    /// Parse a timestamp with the configured format and keep its calendar date
    pub fn parse_date(&self, value: &str) -> Option<NaiveDate> {
        NaiveDateTime::parse_from_str(value.trim(), &self.config.timestamp_format)
            .ok()
            .map(|dt| dt.date())
    }

    /// Iterate the parsed records of a raw CSV source
    pub fn records<R: io::Read>(&self, reader: R) -> Result<FlowRecords<'_, R>, ParseError> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(reader);
        let columns = ColumnIndex::resolve(csv_reader.headers()?, &self.config)?;

        Ok(FlowRecords {
            reducer: self,
            reader: csv_reader,
            columns,
            record: csv::StringRecord::new(),
        })
    }

    /// Reduce a raw CSV source
    ///
    /// The first bad record aborts the whole reduction.
    pub fn reduce_reader<R: io::Read>(&self, reader: R) -> Result<DailySummary, ParseError> {
        let mut summary = DailySummary::new();
        let mut records = 0u64;
        let mut iter = self.records(reader)?;

        while let Some(record) = iter.next() {
            let record = record?;
            records += 1;
            let line = iter.line();

            let total = summary.entry(record.day_pair());
            total.total_flow_duration = total
                .total_flow_duration
                .checked_add(record.flow_duration)
                .ok_or_else(|| ParseError::Overflow {
                    line,
                    column: self.config.duration_column.clone(),
                })?;
            total.total_fwd_packets = total
                .total_fwd_packets
                .checked_add(record.fwd_packets)
                .ok_or_else(|| ParseError::Overflow {
                    line,
                    column: self.config.fwd_packets_column.clone(),
                })?;
        }

        debug!(records, rows = summary.len(), "Reduced flow records");
        Ok(summary)
    }

    /// Reduce an in-memory raw CSV file
    pub fn reduce_bytes(&self, bytes: &[u8]) -> Result<DailySummary, ParseError> {
        self.reduce_reader(bytes)
    }

    fn parse_number(&self, line: u64, column: &str, value: &str) -> Result<i64, ParseError> {
        value
            .trim()
            .parse::<i64>()
            .map_err(|_| ParseError::InvalidNumber {
                line,
                column: column.to_string(),
                value: value.to_string(),
            })
    }

    fn parse_record(
        &self,
        record: &csv::StringRecord,
        columns: ColumnIndex,
    ) -> Result<FlowRecord, ParseError> {
        let line = record.position().map(|p| p.line()).unwrap_or_default();
        let field = |idx: usize, name: &str| {
            record.get(idx).ok_or_else(|| ParseError::MissingColumn {
                column: format!("{} (line {})", name, line),
            })
        };

        let src = field(columns.src, &self.config.src_column)?;
        let dst = field(columns.dst, &self.config.dst_column)?;
        let timestamp = field(columns.timestamp, &self.config.timestamp_column)?;
        let duration = field(columns.duration, &self.config.duration_column)?;
        let fwd_packets = field(columns.fwd_packets, &self.config.fwd_packets_column)?;

        let date = self
            .parse_date(timestamp)
            .ok_or_else(|| ParseError::InvalidTimestamp {
                line,
                value: timestamp.to_string(),
                format: self.config.timestamp_format.clone(),
            })?;

        Ok(FlowRecord {
            src: src.to_string(),
            dst: dst.to_string(),
            date,
            flow_duration: self.parse_number(line, &self.config.duration_column, duration)?,
            fwd_packets: self.parse_number(line, &self.config.fwd_packets_column, fwd_packets)?,
        })
    }
}

/// Iterator over the records of a raw flow CSV
pub struct FlowRecords<'a, R> {
    reducer: &'a FlowRecordReducer,
    reader: csv::Reader<R>,
    columns: ColumnIndex,
    record: csv::StringRecord,
}

impl<R> FlowRecords<'_, R> {
    /// Line on which the last record read starts
    pub fn line(&self) -> u64 {
        self.record.position().map(|p| p.line()).unwrap_or_default()
    }
}

impl<'a, R: io::Read> Iterator for FlowRecords<'a, R> {
    type Item = Result<FlowRecord, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.reader.read_record(&mut self.record) {
            Ok(false) => None,
            Ok(true) => Some(self.reducer.parse_record(&self.record, self.columns)),
            Err(e) => Some(Err(e.into())),
        }
    }
}
