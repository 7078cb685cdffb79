//! Object storage: the upload sink, the image bucket and the result bucket.
//!
//! Production deployments put these behind a cloud object store; the
//! pipeline only needs the four operations of [`ObjectStore`]. Two
//! implementations ship with the crate:
//!
//! * [`LocalObjectStore`]: `root/<bucket>/<key>` on the local filesystem,
//!   with atomic writes (unique temp file + rename) so readers never
//!   observe a half-written object and concurrent writers never collide.
//! * [`MemoryObjectStore`]: a map guarded by a mutex, for tests and
//!   single-process runs.

use crate::error::StorageError;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// Keys must be relative, `/`-separated, without `.`/`..` segments.
static INVALID_SEGMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(^|/)\.{1,2}(/|$)|^/|//|\\|\x00").expect("static regex"));

/// Suffix used for in-flight writes; never listed.
const TMP_SUFFIX: &str = ".pdfvision-tmp";

/// Durable binary storage addressed by bucket and key.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Create or overwrite an object.
    async fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<(), StorageError>;

    /// Keys in `bucket` starting with `prefix`, sorted.
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StorageError>;

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool, StorageError> {
        match self.get(bucket, key).await {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Reject keys that could escape their bucket directory.
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    if key.is_empty() {
        return Err(StorageError::InvalidKey {
            key: key.to_string(),
            reason: "empty key".into(),
        });
    }
    if INVALID_SEGMENT.is_match(key) {
        return Err(StorageError::InvalidKey {
            key: key.to_string(),
            reason: "key must be relative without '.' or '..' segments".into(),
        });
    }
    Ok(())
}

// ── Filesystem store ─────────────────────────────────────────────────────

/// Filesystem-backed store rooted at a directory.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem path of an object.
    pub fn path_of(&self, bucket: &str, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(bucket)?;
        validate_key(key)?;
        Ok(self.root.join(bucket).join(key))
    }
}

fn io_error(key: &str, bucket: &str, e: std::io::Error) -> StorageError {
    match e.kind() {
        std::io::ErrorKind::NotFound => StorageError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        },
        std::io::ErrorKind::TimedOut
        | std::io::ErrorKind::Interrupted
        | std::io::ErrorKind::WouldBlock => StorageError::Unavailable(e.to_string()),
        _ => StorageError::Io {
            key: key.to_string(),
            detail: e.to_string(),
        },
    }
}

/// A failed write is never a missing object: everything maps to a
/// retryable error.
fn write_error(key: &str, e: std::io::Error) -> StorageError {
    StorageError::Io {
        key: key.to_string(),
        detail: e.to_string(),
    }
}

/// Write `bytes` to a uniquely named temp file in `dir`, then rename it over
/// `path`. Concurrent writers each get their own temp file; the last rename
/// wins.
fn write_atomic(dir: &Path, path: &Path, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
    let mut tmp = tempfile::Builder::new()
        .prefix(".pdfvision-")
        .suffix(TMP_SUFFIX)
        .tempfile_in(dir)
        .map_err(|e| write_error(key, e))?;
    tmp.write_all(bytes).map_err(|e| write_error(key, e))?;
    tmp.persist(path).map_err(|e| write_error(key, e.error))?;
    Ok(())
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.path_of(bucket, key)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| io_error(key, bucket, e))
    }

    async fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        let path = self.path_of(bucket, key)?;
        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| StorageError::InvalidKey {
                key: key.to_string(),
                reason: "no parent directory".into(),
            })?;
        tokio::fs::create_dir_all(&parent)
            .await
            .map_err(|e| write_error(key, e))?;

        let len = bytes.len();
        let owned_key = key.to_string();
        tokio::task::spawn_blocking(move || write_atomic(&parent, &path, &owned_key, &bytes))
            .await
            .map_err(|e| StorageError::Unavailable(format!("write task failed: {e}")))??;

        debug!("Stored {}/{} ({} bytes)", bucket, key, len);
        Ok(())
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StorageError> {
        validate_key(bucket)?;
        let base = self.root.join(bucket);
        let mut keys = Vec::new();
        let mut stack = vec![base.clone()];

        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(io_error(prefix, bucket, e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| io_error(prefix, bucket, e))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| io_error(prefix, bucket, e))?;
                if file_type.is_dir() {
                    stack.push(path);
                    continue;
                }
                let Ok(rel) = path.strip_prefix(&base) else {
                    continue;
                };
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.ends_with(TMP_SUFFIX) {
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
}

// ── In-memory store ──────────────────────────────────────────────────────

/// In-memory store keyed by `(bucket, key)`.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<(String, String), Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects across all buckets.
    pub fn len(&self) -> usize {
        self.objects.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, BTreeMap<(String, String), Vec<u8>>>, StorageError> {
        self.objects
            .lock()
            .map_err(|_| StorageError::Unavailable("object map poisoned".into()))
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        self.lock()?
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }

    async fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        validate_key(key)?;
        self.lock()?
            .insert((bucket.to_string(), key.to_string()), bytes);
        Ok(())
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .lock()?
            .keys()
            .filter(|(b, k)| b == bucket && k.starts_with(prefix))
            .map(|(_, k)| k.clone())
            .collect())
    }
}
