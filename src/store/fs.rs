//! Directory-backed object store

use super::{check_tag, validate_key, ETag, Object, ObjectStore, PutCondition, StoreError, StoreResult};
use async_trait::async_trait;
use fs2::FileExt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const TEMP_MARKER: &str = ".pairflow-tmp-";
const META_DIR: &str = ".pairflow";
const LOCK_FILE: &str = "lock";
const TAG_DIR: &str = "etags";

/// Object store rooted at a local directory
///
/// Object keys map to relative paths. Writes go to a temporary sibling and are
/// renamed into place, so readers never see a torn object.
///
/// Each object's tag is kept in a sidecar under `.pairflow/etags/`, written
/// before the object. A sidecar that does not describe the current bytes is
/// ignored and the object is tagged with its content digest instead.
///
/// Writers hold an advisory lock on `.pairflow/lock` from the version check
/// to the rename. Every handle takes it, whether it lives in this process or
/// another one, and the kernel releases it when a holder dies.
#[derive(Debug)]
pub struct FsStore {
    root: PathBuf,
    lock_file: Arc<File>,
    write_lock: Mutex<()>,
}

/// Exclusive hold on the store directory, released on drop
struct DirLock {
    file: Arc<File>,
}

impl Drop for DirLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&*self.file) {
            warn!(error = %e, "Failed to release store lock");
        }
    }
}

impl FsStore {
    /// Open a store at `root`, creating the directory if needed
    pub async fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        let meta = root.join(META_DIR);
        let lock_path = meta.join(LOCK_FILE);
        let lock_key = lock_path.display().to_string();

        tokio::fs::create_dir_all(meta.join(TAG_DIR))
            .await
            .map_err(|e| StoreError::io(&root.display().to_string(), e))?;
        let lock_file = tokio::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .await
            .map_err(|e| StoreError::io(&lock_key, e))?
            .into_std()
            .await;

        Ok(Self {
            root,
            lock_file: Arc::new(lock_file),
            write_lock: Mutex::new(()),
        })
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, key: &str) -> StoreResult<PathBuf> {
        validate_key(key)?;
        if key.split('/').next() == Some(META_DIR) {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(key))
    }

    fn tag_path(&self, key: &str) -> PathBuf {
        self.root.join(META_DIR).join(TAG_DIR).join(key)
    }

    // Blocks on a worker thread; a waiter that is dropped releases the lock
    // as soon as it is granted.
    async fn lock_dir(&self) -> StoreResult<DirLock> {
        let file = self.lock_file.clone();
        tokio::task::spawn_blocking(move || {
            FileExt::lock_exclusive(&*file)?;
            Ok::<_, std::io::Error>(DirLock { file })
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("store lock task failed: {}", e)))?
        .map_err(|e| StoreError::io(LOCK_FILE, e))
    }

    // Object first, then its sidecar: a sidecar newer than the bytes fails to
    // describe them unless the bytes are equal.
    async fn read_object(&self, key: &str, path: &Path) -> StoreResult<Option<Object>> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(key, e)),
        };
        let etag = match tokio::fs::read_to_string(self.tag_path(key)).await {
            Ok(text) => {
                let stored = ETag(text.trim().to_string());
                if stored.describes(&bytes) {
                    stored
                } else {
                    ETag::of(&bytes)
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ETag::of(&bytes),
            Err(e) => return Err(StoreError::io(key, e)),
        };
        Ok(Some(Object { bytes, etag }))
    }
}

async fn write_atomic(key: &str, path: &Path, bytes: &[u8]) -> StoreResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::io(key, e))?;
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!("{}{}{}", file_name, TEMP_MARKER, uuid::Uuid::new_v4()));

    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| StoreError::io(key, e))?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(StoreError::io(key, e));
    }
    Ok(())
}

async fn remove_if_present(key: &str, path: &Path) -> StoreResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::io(key, e)),
    }
}

#[async_trait]
impl ObjectStore for FsStore {
    async fn get(&self, key: &str) -> StoreResult<Object> {
        let path = self.path_of(key)?;
        self.read_object(key, &path)
            .await?
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn head(&self, key: &str) -> StoreResult<Option<ETag>> {
        let path = self.path_of(key)?;
        Ok(self.read_object(key, &path).await?.map(|o| o.etag))
    }

    async fn put_as(&self, key: &str, bytes: Vec<u8>, condition: PutCondition, etag: ETag) -> StoreResult<ETag> {
        let path = self.path_of(key)?;
        check_tag(key, &bytes, &etag)?;

        let _local = self.write_lock.lock().await;
        let _dir = self.lock_dir().await?;

        if condition != PutCondition::Any {
            let current = self.read_object(key, &path).await?.map(|o| o.etag);
            condition.check(key, current.as_ref())?;
        }

        write_atomic(key, &self.tag_path(key), etag.as_str().as_bytes()).await?;
        write_atomic(key, &path, &bytes).await?;

        debug!(key, etag = %etag, bytes = bytes.len(), "Stored object");
        Ok(etag)
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut keys = Vec::new();
        let meta = self.root.join(META_DIR);
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StoreError::io(prefix, e)),
            };

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| StoreError::io(prefix, e))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| StoreError::io(prefix, e))?;
                if file_type.is_dir() {
                    if path != meta {
                        pending.push(path);
                    }
                    continue;
                }

                let Ok(relative) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.contains(TEMP_MARKER) {
                    continue;
                }
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let path = self.path_of(key)?;
        let _local = self.write_lock.lock().await;
        let _dir = self.lock_dir().await?;

        remove_if_present(key, &path).await?;
        remove_if_present(key, &self.tag_path(key)).await
    }
}
