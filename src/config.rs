//! Pipeline configuration
//!
//! Loaded from TOML. Every section is optional and falls back to its defaults,
//! so an empty file is a valid configuration:
//!
//! ```toml
//! [store]
//! root = "data/store"
//!
//! [layout]
//! summary_prefix = "summaries/"
//! cleanup = { archive = { prefix = "archive/summaries/" } }
//!
//! [worker]
//! batch_size = 10
//! concurrency = 4
//!
//! [retry]
//! max_retries = 8
//! initial_backoff_ms = 20
//! ```

use crate::error::{PipelineError, Result};
use crate::reducer::ReducerConfig;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Location of the directory-backed object store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root directory of the store
    pub root: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data/store"),
        }
    }
}

/// Spool directories of the two trigger queues
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Queue of upload notices
    pub summarize: PathBuf,
    /// Queue of summary notices
    pub consolidate: PathBuf,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            summarize: PathBuf::from("data/queues/summarize"),
            consolidate: PathBuf::from("data/queues/consolidate"),
        }
    }
}

/// What happens to a daily summary once it has been consolidated
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupPolicy {
    /// Remove the summary
    #[default]
    Delete,
    /// Move the summary under another prefix
    Archive {
        /// Destination prefix
        prefix: String,
    },
}

/// Object keys used by the pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Layout {
    /// Prefix of daily summary artifacts
    pub summary_prefix: String,
    /// Key of the aggregate table
    pub table_key: String,
    /// Key of the processed ledger
    pub ledger_key: String,
    /// Days a committed ledger entry is kept, 0 keeps entries forever
    pub ledger_retention_days: u32,
    /// Post-consolidation handling of summaries
    pub cleanup: CleanupPolicy,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            summary_prefix: "summaries/".to_string(),
            table_key: "consolidated/traffic_stats.csv".to_string(),
            ledger_key: "consolidated/ledger.json".to_string(),
            ledger_retention_days: 30,
            cleanup: CleanupPolicy::Delete,
        }
    }
}

impl Layout {
    /// Object key of a summary artifact
    pub fn summary_key(&self, summary: &str) -> String {
        format!("{}{}", self.summary_prefix, summary)
    }

    /// Object key of an archived summary, if archiving is enabled
    pub fn archive_key(&self, summary: &str) -> Option<String> {
        match &self.cleanup {
            CleanupPolicy::Delete => None,
            CleanupPolicy::Archive { prefix } => Some(format!("{}{}", prefix, summary)),
        }
    }

    /// How long committed ledger entries are kept, `None` for ever
    pub fn ledger_retention(&self) -> Option<chrono::Duration> {
        match self.ledger_retention_days {
            0 => None,
            days => Some(chrono::Duration::days(i64::from(days))),
        }
    }

    /// Every prefix under which summaries can be found
    pub fn summary_prefixes(&self) -> Vec<&str> {
        let mut prefixes = vec![self.summary_prefix.as_str()];
        if let CleanupPolicy::Archive { prefix } = &self.cleanup {
            prefixes.push(prefix.as_str());
        }
        prefixes
    }

    /// Validate the layout
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.table_key.is_empty() || self.ledger_key.is_empty() {
            return Err("Table and ledger keys cannot be empty".to_string());
        }
        if self.table_key == self.ledger_key {
            return Err("Table and ledger keys must differ".to_string());
        }
        if !self.summary_prefix.is_empty() && !self.summary_prefix.ends_with('/') {
            return Err("Summary prefix must end with '/'".to_string());
        }
        if let CleanupPolicy::Archive { prefix } = &self.cleanup {
            if prefix.is_empty() || !prefix.ends_with('/') {
                return Err("Archive prefix must be non-empty and end with '/'".to_string());
            }
            if prefix == &self.summary_prefix {
                return Err("Archive prefix must differ from the summary prefix".to_string());
            }
        }
        Ok(())
    }
}

/// Queue worker settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Deliveries fetched per poll
    pub batch_size: usize,
    /// Deliveries processed at the same time
    pub concurrency: usize,
    /// Pause between polls of an empty queue, in milliseconds
    pub poll_interval_ms: u64,
    /// How long a received delivery stays hidden, in seconds
    pub visibility_timeout_secs: u64,
    /// Time allowed for in-flight deliveries at shutdown, in seconds
    pub shutdown_timeout_secs: u64,
    /// Deliveries of one message before it is dropped
    pub max_deliveries: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            concurrency: num_cpus::get(),
            poll_interval_ms: 500,
            visibility_timeout_secs: 300,
            shutdown_timeout_secs: 30,
            max_deliveries: 5,
        }
    }
}

impl WorkerConfig {
    /// Poll interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Visibility timeout
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    /// Shutdown drain timeout
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Validate the configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.batch_size == 0 {
            return Err("Batch size must be greater than 0".to_string());
        }
        if self.concurrency == 0 {
            return Err("Concurrency must be greater than 0".to_string());
        }
        if self.visibility_timeout_secs == 0 {
            return Err("Visibility timeout must be greater than 0".to_string());
        }
        if self.max_deliveries == 0 {
            return Err("Max deliveries must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Complete pipeline configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Object store
    pub store: StoreConfig,
    /// Trigger queues
    pub queues: QueueConfig,
    /// Object keys
    pub layout: Layout,
    /// Raw CSV format
    pub reducer: ReducerConfig,
    /// Queue workers
    pub worker: WorkerConfig,
    /// Conflict retries of the consolidation engine
    pub retry: RetryPolicy,
}

impl PipelineConfig {
    /// Create a new config builder
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::new()
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| PipelineError::Config(e.to_string()))?;
        config.validate().map_err(PipelineError::Config)?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| PipelineError::Config(e.to_string()))
    }

    /// Validate the configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        self.layout.validate()?;
        self.reducer.validate()?;
        self.worker.validate()?;
        self.retry.validate()?;
        if self.queues.summarize == self.queues.consolidate {
            return Err("Summarize and consolidate queues must use different directories".to_string());
        }
        Ok(())
    }
}

/// Builder for [`PipelineConfig`]
#[derive(Debug, Default)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    /// Create a builder holding the defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration
    pub fn from_config(config: PipelineConfig) -> Self {
        Self { config }
    }

    /// Put the store, both queues and nothing else under one directory
    pub fn data_dir(mut self, dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        self.config.store.root = dir.join("store");
        self.config.queues.summarize = dir.join("queues").join("summarize");
        self.config.queues.consolidate = dir.join("queues").join("consolidate");
        self
    }

    /// Set the store root
    pub fn store_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.store.root = root.into();
        self
    }

    /// Set the object layout
    pub fn layout(mut self, layout: Layout) -> Self {
        self.config.layout = layout;
        self
    }

    /// Set the cleanup policy
    pub fn cleanup(mut self, cleanup: CleanupPolicy) -> Self {
        self.config.layout.cleanup = cleanup;
        self
    }

    /// Set the raw CSV format
    pub fn reducer(mut self, reducer: ReducerConfig) -> Self {
        self.config.reducer = reducer;
        self
    }

    /// Set the worker batch size
    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.worker.batch_size = size;
        self
    }

    /// Set the worker concurrency
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.config.worker.concurrency = concurrency;
        self
    }

    /// Set the poll interval
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.worker.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the conflict retry policy
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    /// Validate and build
    pub fn build(self) -> Result<PipelineConfig> {
        self.config.validate().map_err(PipelineError::Config)?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_empty_document_is_default() {
        let config = PipelineConfig::from_toml_str("").unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.layout.table_key, "consolidated/traffic_stats.csv");
        assert_eq!(config.layout.summary_key("d_summary.csv"), "summaries/d_summary.csv");
        assert_eq!(config.layout.ledger_retention(), Some(chrono::Duration::days(30)));
    }

    #[test]
    fn test_archive_cleanup_from_toml() {
        let config = PipelineConfig::from_toml_str(
            r#"
            [layout]
            ledger_retention_days = 0
            cleanup = { archive = { prefix = "archive/" } }

            [worker]
            batch_size = 4
            concurrency = 2
            "#,
        )
        .unwrap();
        assert_eq!(
            config.layout.cleanup,
            CleanupPolicy::Archive {
                prefix: "archive/".to_string()
            }
        );
        assert_eq!(config.layout.archive_key("a.csv").as_deref(), Some("archive/a.csv"));
        assert_eq!(config.layout.summary_prefixes(), vec!["summaries/", "archive/"]);
        assert_eq!(config.layout.ledger_retention(), None);
        assert_eq!(config.worker.batch_size, 4);
        assert_eq!(config.worker.visibility_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_invalid_documents() {
        for text in [
            "[worker]\nbatch_size = 0",
            "[layout]\ntable_key = \"x\"\nledger_key = \"x\"",
            "[layout]\ncleanup = { archive = { prefix = \"summaries/\" } }",
            "[unknown]\nvalue = 1",
            "[reducer]\nsrc_column = \"\"",
        ] {
            let err = PipelineConfig::from_toml_str(text).unwrap_err();
            assert!(matches!(err, PipelineError::Config(_)), "{}", text);
        }
    }

    #[test]
    fn test_builder_and_round_trip() {
        let config = PipelineConfig::builder()
            .data_dir("/tmp/pairflow")
            .batch_size(3)
            .cleanup(CleanupPolicy::Archive {
                prefix: "archive/".to_string(),
            })
            .build()
            .unwrap();
        assert_eq!(config.store.root, PathBuf::from("/tmp/pairflow/store"));

        let text = config.to_toml_string().unwrap();
        assert_eq!(PipelineConfig::from_toml_str(&text).unwrap(), config);
    }
}
