//! Durable object storage
//!
//! The pipeline keeps every artifact (raw uploads, daily summaries, the
//! aggregate table and the processed ledger) in an [`ObjectStore`]. Every put
//! gives the object a fresh [`ETag`], so a tag names one write and two writes
//! of equal bytes still differ. Writers that must not lose each other's
//! updates use [`ObjectStore::put_if`] with a [`PutCondition`].
//!
//! # Example
//!
//! ```
//! use pairflow::store::{MemoryStore, ObjectStore, PutCondition, StoreError};
//!
//! # async fn example() -> Result<(), StoreError> {
//! let store = MemoryStore::new();
//! let etag = store.put("consolidated/traffic_stats.csv", b"v1".to_vec()).await?;
//!
//! // A writer holding a stale tag is refused
//! store.put("consolidated/traffic_stats.csv", b"v2".to_vec()).await?;
//! let stale = store
//!     .put_if("consolidated/traffic_stats.csv", b"v3".to_vec(), PutCondition::Matches(etag))
//!     .await;
//! assert!(matches!(stale, Err(StoreError::PreconditionFailed { .. })));
//! # Ok(())
//! # }
//! ```

mod fs;
mod memory;

pub use fs::FsStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use siphasher::sip::SipHasher13;
use std::fmt;
use std::hash::Hasher;
use thiserror::Error;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Store error types
#[derive(Error, Debug)]
pub enum StoreError {
    /// Object does not exist
    #[error("object not found: {0}")]
    NotFound(String),

    /// A conditional put found a different current version
    #[error("precondition failed for '{key}': expected {expected}, found {current}")]
    PreconditionFailed {
        /// Object key
        key: String,
        /// Condition that was requested
        expected: String,
        /// Version actually present
        current: String,
    },

    /// Key is empty or escapes the store namespace
    #[error("invalid key '{0}'")]
    InvalidKey(String),

    /// IO errors
    #[error("IO error on '{key}': {source}")]
    Io {
        /// Object key
        key: String,
        /// Underlying cause
        #[source]
        source: std::io::Error,
    },

    /// Version tag does not belong to the bytes being written
    #[error("tag {tag} does not describe the object written to '{key}'")]
    InvalidTag {
        /// Object key
        key: String,
        /// Rejected tag
        tag: String,
    },

    /// Backend temporarily unavailable
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Check if error is transient
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Io { .. } => true,
            StoreError::Unavailable(_) => true,
            StoreError::PreconditionFailed { .. } => true,
            StoreError::NotFound(_) => false,
            StoreError::InvalidKey(_) => false,
            StoreError::InvalidTag { .. } => false,
        }
    }

    pub(crate) fn io(key: &str, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            StoreError::NotFound(key.to_string())
        } else {
            StoreError::Io {
                key: key.to_string(),
                source,
            }
        }
    }
}

/// Entity tag naming one version of an object
///
/// Either a bare content digest ([`ETag::of`]) or a digest followed by the
/// nonce of the write that produced it ([`ETag::fresh`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ETag(String);

impl ETag {
    /// Content digest of a byte string
    ///
    /// Equal bytes always share it, which makes it an identity of content
    /// rather than of a write.
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = SipHasher13::new_with_keys(0x7061_6972_666c_6f77, 0x6574_6167_7631_0000);
        hasher.write(bytes);
        ETag(format!("{:x}-{:016x}", bytes.len(), hasher.finish()))
    }

    /// Tag for a new write of `bytes`
    ///
    /// Chosen by the writer before the put, so it can be recorded ahead of
    /// the write it names.
    pub fn fresh(bytes: &[u8]) -> Self {
        ETag(format!("{}-{:016x}", ETag::of(bytes).0, rand::random::<u64>()))
    }

    /// Whether this tag can name an object holding `bytes`
    pub fn describes(&self, bytes: &[u8]) -> bool {
        let digest = ETag::of(bytes);
        match self.0.strip_prefix(digest.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('-'),
            None => false,
        }
    }

    /// Tag as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ETag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Precondition of a conditional put
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutCondition {
    /// Unconditional overwrite
    Any,
    /// The key must not exist yet
    Absent,
    /// The current version must carry this tag
    Matches(ETag),
}

impl PutCondition {
    /// Condition that accepts exactly the given current version
    pub fn expecting(current: Option<&ETag>) -> Self {
        match current {
            Some(etag) => PutCondition::Matches(etag.clone()),
            None => PutCondition::Absent,
        }
    }

    pub(crate) fn check(&self, key: &str, current: Option<&ETag>) -> StoreResult<()> {
        let ok = match (self, current) {
            (PutCondition::Any, _) => true,
            (PutCondition::Absent, None) => true,
            (PutCondition::Matches(expected), Some(current)) => expected == current,
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(StoreError::PreconditionFailed {
                key: key.to_string(),
                expected: self.to_string(),
                current: current.map_or_else(|| "absent".to_string(), |e| e.to_string()),
            })
        }
    }
}

impl fmt::Display for PutCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PutCondition::Any => write!(f, "any"),
            PutCondition::Absent => write!(f, "absent"),
            PutCondition::Matches(etag) => write!(f, "{}", etag),
        }
    }
}

/// A stored object with its version tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Object {
    /// Object contents
    pub bytes: Vec<u8>,
    /// Version tag of the contents
    pub etag: ETag,
}

/// Durable key/value object storage
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Fetch an object
    async fn get(&self, key: &str) -> StoreResult<Object>;

    /// Version of an object, `None` if it does not exist
    async fn head(&self, key: &str) -> StoreResult<Option<ETag>>;

    /// Write an object under a tag chosen by the caller if `condition` holds
    /// for its current version
    ///
    /// `etag` must describe `bytes`; a tag taken from [`ETag::fresh`] is never
    /// reused by another write.
    async fn put_as(&self, key: &str, bytes: Vec<u8>, condition: PutCondition, etag: ETag) -> StoreResult<ETag>;

    /// Keys starting with `prefix`, sorted
    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Remove an object; removing a missing object succeeds
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Write an object under a fresh tag if `condition` holds for its current version
    async fn put_if(&self, key: &str, bytes: Vec<u8>, condition: PutCondition) -> StoreResult<ETag> {
        let etag = ETag::fresh(&bytes);
        self.put_as(key, bytes, condition, etag).await
    }

    /// Unconditional write
    async fn put(&self, key: &str, bytes: Vec<u8>) -> StoreResult<ETag> {
        self.put_if(key, bytes, PutCondition::Any).await
    }

    /// Fetch an object, mapping absence to `None`
    async fn get_opt(&self, key: &str) -> StoreResult<Option<Object>> {
        match self.get(key).await {
            Ok(object) => Ok(Some(object)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

pub(crate) fn check_tag(key: &str, bytes: &[u8], etag: &ETag) -> StoreResult<()> {
    if etag.describes(bytes) {
        Ok(())
    } else {
        Err(StoreError::InvalidTag {
            key: key.to_string(),
            tag: etag.to_string(),
        })
    }
}

/// Reject keys that are empty or could escape a directory-backed namespace
pub(crate) fn validate_key(key: &str) -> StoreResult<()> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.contains('\0')
        || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if bad {
        Err(StoreError::InvalidKey(key.to_string()))
    } else {
        Ok(())
    }
}
