//! Uploads local raw flow files and triggers their summarization

use crate::error::Result;
use crate::message::UploadNotice;
use crate::queue::MessageQueue;
use crate::store::{ObjectStore, PutCondition, StoreError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Files handled by one upload run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
    /// Keys uploaded and announced
    pub uploaded: Vec<String>,
    /// Keys already present in the store
    pub skipped: Vec<String>,
}

/// Puts raw CSV files into the store and sends an upload notice for each
pub struct Uploader {
    store: Arc<dyn ObjectStore>,
    notices: Arc<dyn MessageQueue>,
    bucket: Option<String>,
}

impl Uploader {
    /// Create an uploader
    pub fn new(store: Arc<dyn ObjectStore>, notices: Arc<dyn MessageQueue>) -> Self {
        Self {
            store,
            notices,
            bucket: None,
        }
    }

    /// Name the bucket in the notices sent
    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    /// Upload one file under its file name; `false` if the key already exists
    pub async fn upload_file(&self, path: &Path) -> Result<bool> {
        let key = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("{} has no file name", path.display()),
                )
            })?;

        if self.store.head(&key).await?.is_some() {
            debug!(key = %key, "Already uploaded, skipping");
            return Ok(false);
        }

        let bytes = tokio::fs::read(path).await?;
        match self.store.put_if(&key, bytes, PutCondition::Absent).await {
            Ok(_) => {}
            // Uploaded concurrently by someone else, who also sends the notice
            Err(StoreError::PreconditionFailed { .. }) => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        let notice = UploadNotice {
            bucket: self.bucket.clone(),
            key: key.clone(),
        };
        let message_id = self.notices.send(notice.encode()?).await?;
        info!(key = %key, message_id = %message_id, "Uploaded raw file");
        Ok(true)
    }

    /// Upload every `*.csv` file directly inside `dir`, in name order
    pub async fn upload_dir(&self, dir: &Path) -> Result<UploadReport> {
        let mut paths: Vec<PathBuf> = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_csv = path.extension().is_some_and(|ext| ext == "csv");
            if is_csv && entry.file_type().await?.is_file() {
                paths.push(path);
            }
        }
        paths.sort();

        let mut report = UploadReport::default();
        for path in paths {
            let key = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if self.upload_file(&path).await? {
                report.uploaded.push(key);
            } else {
                report.skipped.push(key);
            }
        }

        info!(
            uploaded = report.uploaded.len(),
            skipped = report.skipped.len(),
            dir = %dir.display(),
            "Upload run finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryQueue;
    use crate::store::MemoryStore;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[tokio::test]
    async fn test_upload_dir_skips_existing_and_non_csv() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.csv"), "b").unwrap();
        std::fs::write(dir.path().join("a.csv"), "a").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();
        std::fs::create_dir(dir.path().join("sub.csv")).unwrap();

        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        store.put("b.csv", b"old".to_vec()).await.unwrap();

        let uploader = Uploader::new(store.clone(), queue.clone()).with_bucket("flows");
        let report = uploader.upload_dir(dir.path()).await.unwrap();
        assert_eq!(
            report,
            UploadReport {
                uploaded: vec!["a.csv".to_string()],
                skipped: vec!["b.csv".to_string()],
            }
        );
        assert_eq!(store.get("b.csv").await.unwrap().bytes, b"old");

        let sent = queue.receive(10, Duration::from_secs(5)).await.unwrap();
        assert_eq!(sent.len(), 1);
        let notice = UploadNotice::decode(&sent[0].payload).unwrap();
        assert_eq!(notice.key, "a.csv");
        assert_eq!(notice.bucket.as_deref(), Some("flows"));

        // A second run uploads nothing
        let again = uploader.upload_dir(dir.path()).await.unwrap();
        assert!(again.uploaded.is_empty());
        assert_eq!(again.skipped.len(), 2);
    }
}
