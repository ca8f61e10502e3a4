//! Reducer configuration

use serde::{Deserialize, Serialize};

/// Column names and timestamp format of the raw flow-record CSV
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReducerConfig {
    /// Source address column
    pub src_column: String,
    /// Destination address column
    pub dst_column: String,
    /// Timestamp column
    pub timestamp_column: String,
    /// Flow duration column
    pub duration_column: String,
    /// Forward packet count column
    pub fwd_packets_column: String,
    /// `chrono` format of the timestamp column
    pub timestamp_format: String,
}

impl Default for ReducerConfig {
    fn default() -> Self {
        Self {
            src_column: "Src IP".to_string(),
            dst_column: "Dst IP".to_string(),
            timestamp_column: "Timestamp".to_string(),
            duration_column: "Flow Duration".to_string(),
            fwd_packets_column: "Tot Fwd Pkts".to_string(),
            // dd/MM/yyyy hh:mm:ss AM|PM
            timestamp_format: "%d/%m/%Y %I:%M:%S %p".to_string(),
        }
    }
}

impl ReducerConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        let columns = [
            &self.src_column,
            &self.dst_column,
            &self.timestamp_column,
            &self.duration_column,
            &self.fwd_packets_column,
        ];
        if columns.iter().any(|c| c.trim().is_empty()) {
            return Err("Reducer column names cannot be empty".to_string());
        }
        if self.timestamp_format.is_empty() {
            return Err("Timestamp format cannot be empty".to_string());
        }
        Ok(())
    }
}
