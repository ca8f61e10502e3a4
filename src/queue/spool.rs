//! Directory-backed queue
//!
//! Layout under the spool root:
//!
//! - `tmp/` messages being written
//! - `ready/{id}.{attempts}` visible messages
//! - `inflight/{deadline_ms}_{id}.{attempts}` received, not yet acknowledged
//!
//! Claiming a message is a rename from `ready/` to `inflight/`, so several
//! consumers (threads or processes) can share one spool without receiving the
//! same delivery twice within its visibility window.

use super::{Delivery, MessageQueue, QueueError, QueueResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Queue persisted in a local directory
#[derive(Debug, Clone)]
pub struct SpoolQueue {
    root: PathBuf,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

fn split_attempts(name: &str) -> QueueResult<(&str, u32)> {
    let (id, attempts) = name
        .rsplit_once('.')
        .ok_or_else(|| QueueError::InvalidEntry(name.to_string()))?;
    let attempts = attempts
        .parse()
        .map_err(|_| QueueError::InvalidEntry(name.to_string()))?;
    Ok((id, attempts))
}

fn split_inflight(name: &str) -> QueueResult<(u64, &str, u32)> {
    let (deadline, rest) = name
        .split_once('_')
        .ok_or_else(|| QueueError::InvalidEntry(name.to_string()))?;
    let deadline = deadline
        .parse()
        .map_err(|_| QueueError::InvalidEntry(name.to_string()))?;
    let (id, attempts) = split_attempts(rest)?;
    Ok((deadline, id, attempts))
}

impl SpoolQueue {
    /// Open a spool at `root`, creating its directories if needed
    pub async fn open(root: impl Into<PathBuf>) -> QueueResult<Self> {
        let root = root.into();
        for dir in ["tmp", "ready", "inflight"] {
            tokio::fs::create_dir_all(root.join(dir)).await?;
        }
        Ok(Self { root })
    }

    /// Spool root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ready_dir(&self) -> PathBuf {
        self.root.join("ready")
    }

    fn inflight_dir(&self) -> PathBuf {
        self.root.join("inflight")
    }

    async fn file_names(dir: &Path) -> QueueResult<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    /// Move in-flight messages whose visibility expired back to `ready/`
    async fn requeue_expired(&self) -> QueueResult<()> {
        let now = now_millis();
        for name in Self::file_names(&self.inflight_dir()).await? {
            let (deadline, id, attempts) = match split_inflight(&name) {
                Ok(parts) => parts,
                Err(e) => {
                    warn!("Skipping unreadable spool entry: {}", e);
                    continue;
                }
            };
            if deadline > now {
                continue;
            }
            let target = self.ready_dir().join(format!("{}.{}", id, attempts));
            match tokio::fs::rename(self.inflight_dir().join(&name), target).await {
                Ok(()) => debug!(message_id = id, "Visibility expired, message requeued"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl MessageQueue for SpoolQueue {
    async fn send(&self, payload: Vec<u8>) -> QueueResult<String> {
        let id = format!("{:020}-{}", now_millis(), uuid::Uuid::new_v4().simple());
        let tmp = self.root.join("tmp").join(&id);
        tokio::fs::write(&tmp, &payload).await?;
        tokio::fs::rename(&tmp, self.ready_dir().join(format!("{}.0", id))).await?;
        Ok(id)
    }

    async fn receive(&self, max: usize, visibility: Duration) -> QueueResult<Vec<Delivery>> {
        self.requeue_expired().await?;

        let deadline = now_millis() + visibility.as_millis() as u64;
        let mut deliveries = Vec::new();

        for name in Self::file_names(&self.ready_dir()).await? {
            if deliveries.len() >= max {
                break;
            }
            let (id, attempts) = match split_attempts(&name) {
                Ok(parts) => parts,
                Err(e) => {
                    warn!("Skipping unreadable spool entry: {}", e);
                    continue;
                }
            };
            let attempt = attempts + 1;
            let receipt = format!("{:020}_{}.{}", deadline, id, attempt);
            let claimed = self.inflight_dir().join(&receipt);

            match tokio::fs::rename(self.ready_dir().join(&name), &claimed).await {
                Ok(()) => {}
                // Another consumer claimed it first
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }

            let payload = tokio::fs::read(&claimed).await?;
            deliveries.push(Delivery {
                message_id: id.to_string(),
                receipt,
                payload,
                attempt,
            });
        }

        Ok(deliveries)
    }

    async fn ack(&self, delivery: &Delivery) -> QueueResult<()> {
        match tokio::fs::remove_file(self.inflight_dir().join(&delivery.receipt)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(QueueError::ReceiptExpired(delivery.receipt.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn nack(&self, delivery: &Delivery) -> QueueResult<()> {
        let (_, id, attempts) = split_inflight(&delivery.receipt)?;
        let target = self.ready_dir().join(format!("{}.{}", id, attempts));
        match tokio::fs::rename(self.inflight_dir().join(&delivery.receipt), target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(QueueError::ReceiptExpired(delivery.receipt.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn pending(&self) -> QueueResult<usize> {
        Ok(Self::file_names(&self.ready_dir()).await?.len()
            + Self::file_names(&self.inflight_dir()).await?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_and_ack() {
        let dir = tempfile::tempdir().unwrap();
        let queue = SpoolQueue::open(dir.path()).await.unwrap();

        queue.send(b"first".to_vec()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        queue.send(b"second".to_vec()).await.unwrap();

        let batch = queue.receive(10, Duration::from_secs(60)).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].payload, b"first");
        assert_eq!(batch[1].payload, b"second");
        assert_eq!(batch[0].attempt, 1);

        queue.ack(&batch[0]).await.unwrap();
        assert_eq!(queue.pending().await.unwrap(), 1);
        assert!(matches!(
            queue.ack(&batch[0]).await,
            Err(QueueError::ReceiptExpired(_))
        ));
    }

    #[tokio::test]
    async fn test_nack_and_expiry_redeliver() {
        let dir = tempfile::tempdir().unwrap();
        let queue = SpoolQueue::open(dir.path()).await.unwrap();
        let id = queue.send(b"m".to_vec()).await.unwrap();

        let first = queue.receive(1, Duration::from_secs(60)).await.unwrap();
        queue.nack(&first[0]).await.unwrap();

        let second = queue.receive(1, Duration::ZERO).await.unwrap();
        assert_eq!(second[0].message_id, id);
        assert_eq!(second[0].attempt, 2);

        tokio::time::sleep(Duration::from_millis(5)).await;
        let third = queue.receive(1, Duration::from_secs(60)).await.unwrap();
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].attempt, 3);
    }

    #[tokio::test]
    async fn test_two_handles_share_spool() {
        let dir = tempfile::tempdir().unwrap();
        let a = SpoolQueue::open(dir.path()).await.unwrap();
        let b = SpoolQueue::open(dir.path()).await.unwrap();
        a.send(b"x".to_vec()).await.unwrap();

        let got_b = b.receive(5, Duration::from_secs(60)).await.unwrap();
        let got_a = a.receive(5, Duration::from_secs(60)).await.unwrap();
        assert_eq!(got_a.len() + got_b.len(), 1);
    }

    #[test]
    fn test_entry_names() {
        assert_eq!(split_attempts("0001-abc.3").unwrap(), ("0001-abc", 3));
        assert_eq!(
            split_inflight("00000000000000000042_0001-abc.1").unwrap(),
            (42, "0001-abc", 1)
        );
        assert!(split_inflight("garbage").is_err());
    }
}
