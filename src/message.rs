//! Trigger payloads exchanged between the pipeline stages
//!
//! Both notices are JSON objects. Unknown fields are rejected so a message
//! meant for one queue cannot be silently accepted by the other.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};

const SUMMARY_SUFFIX: &str = "_summary.csv";

fn check_name(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(PipelineError::Payload(format!("'{}' cannot be empty", field)));
    }
    if value.starts_with('/') || value.split('/').any(|seg| seg.is_empty() || seg == "..") {
        return Err(PipelineError::Payload(format!(
            "'{}' is not a valid object name: '{}'",
            field, value
        )));
    }
    Ok(())
}

/// Notice that a raw flow-record file was uploaded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UploadNotice {
    /// Bucket the file went to, informational only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    /// Object key of the raw file
    pub key: String,
}

impl UploadNotice {
    /// Notice for a raw file key
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            bucket: None,
            key: key.into(),
        }
    }

    /// Decode and validate a payload
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let notice: Self =
            serde_json::from_slice(payload).map_err(|e| PipelineError::Payload(e.to_string()))?;
        notice.validate()?;
        Ok(notice)
    }

    /// Encode as JSON
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Validate the notice
    pub fn validate(&self) -> Result<()> {
        check_name("key", &self.key)
    }

    /// Name of the daily summary derived from this raw file
    ///
    /// `day1.csv` becomes `day1_summary.csv`; a key without the `.csv`
    /// extension keeps its full name as the stem.
    pub fn summary_name(&self) -> String {
        summary_name_for(&self.key)
    }
}

/// Daily summary name for a raw file key
pub fn summary_name_for(raw_key: &str) -> String {
    let stem = raw_key.strip_suffix(".csv").unwrap_or(raw_key);
    format!("{}{}", stem, SUMMARY_SUFFIX)
}

/// Notice that a daily summary is ready for consolidation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SummaryNotice {
    /// Summary artifact name, relative to the summary prefix
    pub summary: String,
}

impl SummaryNotice {
    /// Notice for a summary name
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
        }
    }

    /// Decode and validate a payload
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let notice: Self =
            serde_json::from_slice(payload).map_err(|e| PipelineError::Payload(e.to_string()))?;
        notice.validate()?;
        Ok(notice)
    }

    /// Encode as JSON
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Validate the notice
    pub fn validate(&self) -> Result<()> {
        check_name("summary", &self.summary)
    }
}
