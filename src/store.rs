//! Named cache storage: the persistent request → response store.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, RwLock};

use crate::error::{Error, Result};
use crate::http::{RequestKey, Response};

/// Summary of one stored entry, for status listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryInfo {
    pub key: RequestKey,
    pub status: u16,
    pub size: u64,
    pub stored_at: DateTime<Utc>,
}

/// Abstraction over the named cache store.
///
/// Implementations must make a single `put` or `delete` atomic, and must not
/// expose any entry of a `put_all` batch unless the whole batch was written.
/// Writing into a cache that does not exist yet creates it.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Lists all cache names.
    async fn keys(&self) -> Result<Vec<String>>;

    /// Checks whether a cache with this name exists.
    async fn has(&self, cache: &str) -> Result<bool>;

    /// Creates the cache if it does not exist.
    async fn open(&self, cache: &str) -> Result<()>;

    /// Deletes a cache and all of its entries. Returns false if it did not exist.
    async fn delete(&self, cache: &str) -> Result<bool>;

    /// Stores one entry, replacing any previous entry with the same key.
    async fn put(&self, cache: &str, key: &RequestKey, response: &Response) -> Result<()>;

    /// Stores a batch of entries all-or-nothing.
    async fn put_all(&self, cache: &str, entries: &[(RequestKey, Response)]) -> Result<()>;

    /// Looks up an entry.
    async fn match_key(&self, cache: &str, key: &RequestKey) -> Result<Option<Response>>;

    /// Lists the entries of a cache. A missing cache has no entries.
    async fn entries(&self, cache: &str) -> Result<Vec<EntryInfo>>;
}

/// Rejects names that cannot double as a directory name.
fn validate_cache_name(cache: &str) -> Result<()> {
    let valid = !cache.is_empty()
        && !cache.starts_with('.')
        && !cache.contains(['/', '\\', '\0']);
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidCacheName(cache.to_string()))
    }
}

// ============================================================================
// In-memory storage
// ============================================================================

#[derive(Debug, Clone)]
struct StoredEntry {
    response: Response,
    stored_at: DateTime<Utc>,
}

/// Process-local storage, used by tests and ephemeral hosts.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    caches: RwLock<BTreeMap<String, BTreeMap<RequestKey, StoredEntry>>>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStorage for MemoryStorage {
    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.caches.read().await.keys().cloned().collect())
    }

    async fn has(&self, cache: &str) -> Result<bool> {
        Ok(self.caches.read().await.contains_key(cache))
    }

    async fn open(&self, cache: &str) -> Result<()> {
        validate_cache_name(cache)?;
        self.caches
            .write()
            .await
            .entry(cache.to_string())
            .or_default();
        Ok(())
    }

    async fn delete(&self, cache: &str) -> Result<bool> {
        Ok(self.caches.write().await.remove(cache).is_some())
    }

    async fn put(&self, cache: &str, key: &RequestKey, response: &Response) -> Result<()> {
        self.put_all(cache, &[(key.clone(), response.clone())]).await
    }

    async fn put_all(&self, cache: &str, entries: &[(RequestKey, Response)]) -> Result<()> {
        validate_cache_name(cache)?;
        let now = Utc::now();
        let mut caches = self.caches.write().await;
        let target = caches.entry(cache.to_string()).or_default();
        for (key, response) in entries {
            target.insert(
                key.clone(),
                StoredEntry {
                    response: response.clone(),
                    stored_at: now,
                },
            );
        }
        Ok(())
    }

    async fn match_key(&self, cache: &str, key: &RequestKey) -> Result<Option<Response>> {
        Ok(self
            .caches
            .read()
            .await
            .get(cache)
            .and_then(|entries| entries.get(key))
            .map(|entry| entry.response.clone()))
    }

    async fn entries(&self, cache: &str) -> Result<Vec<EntryInfo>> {
        Ok(self
            .caches
            .read()
            .await
            .get(cache)
            .map(|entries| {
                entries
                    .iter()
                    .map(|(key, entry)| EntryInfo {
                        key: key.clone(),
                        status: entry.response.status,
                        size: entry.response.body.len() as u64,
                        stored_at: entry.stored_at,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}

// ============================================================================
// Directory-backed storage
// ============================================================================

/// Metadata written next to each body file.
#[derive(Debug, Serialize, Deserialize)]
struct EntryMeta {
    key: RequestKey,
    status: u16,
    status_text: String,
    headers: Vec<(String, String)>,
    stored_at: DateTime<Utc>,
    body_len: u64,
}

impl EntryMeta {
    fn new(key: &RequestKey, response: &Response) -> Self {
        Self {
            key: key.clone(),
            status: response.status,
            status_text: response.status_text.clone(),
            headers: response.headers.clone(),
            stored_at: Utc::now(),
            body_len: response.body.len() as u64,
        }
    }
}

/// Persistent storage: one directory per cache under `root`.
///
/// Each entry is `<sha256>.json` (metadata) plus `<sha256>.body`. Hidden
/// names (leading `.`) are temp files, staging and retired directories.
///
/// Writes through one `DiskStorage` (and its clones) are serialized; a batch
/// is staged as a full copy of the cache and swapped in with two renames.
#[derive(Debug, Clone)]
pub struct DiskStorage {
    root: PathBuf,
    writes: Arc<Mutex<()>>,
}

impl DiskStorage {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            writes: Arc::new(Mutex::new(())),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn cache_dir(&self, cache: &str) -> Result<PathBuf> {
        validate_cache_name(cache)?;
        Ok(self.root.join(cache))
    }

    fn entry_stem(key: &RequestKey) -> String {
        let mut hasher = Sha256::new();
        hasher.update(key.method.as_bytes());
        hasher.update(b" ");
        hasher.update(key.url.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Writes body then metadata into `dir` without renaming.
    async fn write_entry(dir: &Path, key: &RequestKey, response: &Response) -> Result<()> {
        let stem = Self::entry_stem(key);
        let meta = serde_json::to_vec(&EntryMeta::new(key, response))?;
        tokio::fs::write(dir.join(format!("{stem}.body")), &response.body).await?;
        tokio::fs::write(dir.join(format!("{stem}.json")), meta).await?;
        Ok(())
    }

    async fn read_meta(path: &Path) -> Result<Option<EntryMeta>> {
        match tokio::fs::read(path).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Copies the committed entries of `dir` into `staging`.
    async fn copy_entries(dir: &Path, staging: &Path) -> Result<()> {
        let mut read_dir = match tokio::fs::read_dir(dir).await {
            Ok(d) => d,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = read_dir.next_entry().await? {
            let name = entry.file_name();
            if is_hidden(&name.to_string_lossy()) {
                continue;
            }
            if entry.file_type().await?.is_dir() {
                return Err(Error::Storage(format!(
                    "unexpected directory {} in cache",
                    entry.path().display()
                )));
            }
            tokio::fs::copy(entry.path(), staging.join(&name)).await?;
        }
        Ok(())
    }

    /// Builds the complete next state of `dir` in `staging`.
    async fn stage_batch(
        dir: &Path,
        staging: &Path,
        batch: &BTreeMap<&RequestKey, &Response>,
    ) -> Result<()> {
        tokio::fs::create_dir_all(staging).await?;
        Self::copy_entries(dir, staging).await?;
        for (&key, &response) in batch {
            Self::write_entry(staging, key, response).await?;
        }
        Ok(())
    }

    /// Replaces `dir` with `staging`. If the second rename fails the previous
    /// directory is moved back.
    async fn swap_in(&self, dir: &Path, staging: &Path) -> Result<()> {
        let retired = self
            .root
            .join(format!(".retired-{}", uuid::Uuid::new_v4()));
        let had_previous = match tokio::fs::rename(dir, &retired).await {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = tokio::fs::rename(staging, dir).await {
            if had_previous {
                if let Err(restore) = tokio::fs::rename(&retired, dir).await {
                    log::error!(
                        "Could not restore {} from {}: {restore}",
                        dir.display(),
                        retired.display()
                    );
                }
            }
            return Err(e.into());
        }

        if had_previous {
            if let Err(e) = tokio::fs::remove_dir_all(&retired).await {
                log::warn!("Could not remove {}: {e}", retired.display());
            }
        }
        Ok(())
    }
}

/// Writes `contents` to a hidden temp file beside `path`, then renames it into place.
async fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{name}.{}.tmp", uuid::Uuid::new_v4()));
    tokio::fs::write(&tmp, contents).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

#[async_trait]
impl CacheStorage for DiskStorage {
    async fn keys(&self) -> Result<Vec<String>> {
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !is_hidden(&name) && entry.file_type().await?.is_dir() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    async fn has(&self, cache: &str) -> Result<bool> {
        let dir = self.cache_dir(cache)?;
        Ok(tokio::fs::metadata(&dir).await.is_ok_and(|m| m.is_dir()))
    }

    async fn open(&self, cache: &str) -> Result<()> {
        tokio::fs::create_dir_all(self.cache_dir(cache)?).await?;
        Ok(())
    }

    async fn delete(&self, cache: &str) -> Result<bool> {
        let dir = self.cache_dir(cache)?;
        let _guard = self.writes.lock().await;
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, cache: &str, key: &RequestKey, response: &Response) -> Result<()> {
        let dir = self.cache_dir(cache)?;
        let _guard = self.writes.lock().await;
        tokio::fs::create_dir_all(&dir).await?;
        let stem = Self::entry_stem(key);
        let meta = serde_json::to_vec(&EntryMeta::new(key, response))?;
        // Body first: a reader only trusts a body once its metadata exists.
        write_atomic(&dir.join(format!("{stem}.body")), &response.body).await?;
        write_atomic(&dir.join(format!("{stem}.json")), &meta).await?;
        Ok(())
    }

    async fn put_all(&self, cache: &str, entries: &[(RequestKey, Response)]) -> Result<()> {
        let dir = self.cache_dir(cache)?;
        // Later entries win, as with repeated `put`.
        let batch: BTreeMap<&RequestKey, &Response> =
            entries.iter().map(|(key, response)| (key, response)).collect();

        let _guard = self.writes.lock().await;
        tokio::fs::create_dir_all(&self.root).await?;
        let staging = self
            .root
            .join(format!(".staging-{}", uuid::Uuid::new_v4()));

        let result = match Self::stage_batch(&dir, &staging, &batch).await {
            Ok(()) => self.swap_in(&dir, &staging).await,
            Err(e) => Err(e),
        };
        if result.is_err() {
            let _ = tokio::fs::remove_dir_all(&staging).await;
        }
        result
    }

    async fn match_key(&self, cache: &str, key: &RequestKey) -> Result<Option<Response>> {
        let dir = self.cache_dir(cache)?;
        let stem = Self::entry_stem(key);
        let Some(meta) = Self::read_meta(&dir.join(format!("{stem}.json"))).await? else {
            return Ok(None);
        };
        if meta.key != *key {
            return Ok(None);
        }
        let body = tokio::fs::read(dir.join(format!("{stem}.body"))).await?;
        if body.len() as u64 != meta.body_len {
            return Err(Error::Storage(format!(
                "entry for {} is truncated ({} of {} bytes)",
                key.url,
                body.len(),
                meta.body_len
            )));
        }
        Ok(Some(Response {
            status: meta.status,
            status_text: meta.status_text,
            headers: meta.headers,
            body: Bytes::from(body),
        }))
    }

    async fn entries(&self, cache: &str) -> Result<Vec<EntryInfo>> {
        let dir = self.cache_dir(cache)?;
        let mut read_dir = match tokio::fs::read_dir(&dir).await {
            Ok(d) => d,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut infos = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_hidden(&name) || path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            if let Some(meta) = Self::read_meta(&path).await? {
                infos.push(EntryInfo {
                    key: meta.key,
                    status: meta.status,
                    size: meta.body_len,
                    stored_at: meta.stored_at,
                });
            }
        }
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(infos)
    }
}
