//! On-disk cache storage.
//!
//! Layout under the storage root:
//!
//! ```text
//! <root>/<hex(generation name)>/index.json      key → status, headers, body digest
//! <root>/<hex(generation name)>/<sha256>.bin    response bodies, content-addressed
//! ```
//!
//! Bodies are written before the index, and the index is replaced with a
//! rename, so a crash mid-install leaves the previous index in force. A
//! directory whose index is missing or unreadable still counts as a
//! generation: it is listed by `keys` and reopens empty.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use super::{Cache, CacheError, CacheResult, CacheStorage, CachedResponse};
use crate::BoxFuture;
use crate::http::{Headers, StatusCode};

const INDEX_FILE: &str = "index.json";
const BODY_EXT: &str = "bin";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Index {
    name: String,
    created_at: u64,
    next_seq: u64,
    entries: HashMap<String, IndexEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    seq: u64,
    status: u16,
    headers: Headers,
    digest: String,
}

impl Index {
    fn new(name: &str) -> Self {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        Self {
            name: name.to_owned(),
            created_at,
            next_seq: 0,
            entries: HashMap::new(),
        }
    }
}

fn io_error(path: &Path, source: std::io::Error) -> CacheError {
    CacheError::Io {
        path: path.to_path_buf(),
        source,
    }
}

async fn write_atomic(path: &Path, contents: &[u8]) -> CacheResult<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents)
        .await
        .map_err(|e| io_error(&tmp, e))?;
    fs::rename(&tmp, path).await.map_err(|e| io_error(path, e))
}

async fn load_index(path: &Path) -> CacheResult<Index> {
    let raw = fs::read(path).await.map_err(|e| io_error(path, e))?;
    serde_json::from_slice(&raw).map_err(|source| CacheError::Index {
        path: path.to_path_buf(),
        source,
    })
}

async fn persist_index(dir: &Path, index: &Index) -> CacheResult<()> {
    let path = dir.join(INDEX_FILE);
    let raw = serde_json::to_vec_pretty(index).map_err(|source| CacheError::Index {
        path: path.clone(),
        source,
    })?;
    write_atomic(&path, &raw).await
}

/// [`CacheStorage`] backed by a directory tree. Generations persist across
/// process restarts.
pub struct DiskCacheStorage {
    root: PathBuf,
    open: Mutex<HashMap<String, Arc<DiskCache>>>,
}

impl DiskCacheStorage {
    /// Uses `root` as the storage directory, creating it if needed.
    pub async fn new(root: impl Into<PathBuf>) -> CacheResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| io_error(&root, e))?;
        Ok(Self {
            root,
            open: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the storage root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn generation_dir(&self, name: &str) -> PathBuf {
        self.root.join(hex::encode(name))
    }
}

/// One on-disk generation.
pub struct DiskCache {
    name: String,
    dir: PathBuf,
    index: RwLock<Index>,
    deleted: AtomicBool,
}

impl DiskCache {
    fn ensure_live(&self) -> CacheResult<()> {
        if self.deleted.load(Ordering::Acquire) {
            return Err(CacheError::Deleted(self.name.clone()));
        }
        Ok(())
    }

    fn body_path(&self, digest: &str) -> PathBuf {
        self.dir.join(format!("{digest}.{BODY_EXT}"))
    }

    // Drop body files that no index entry points at any more.
    async fn collect_garbage(&self, index: &Index) -> CacheResult<()> {
        let live: HashSet<&str> = index.entries.values().map(|e| e.digest.as_str()).collect();
        let mut dir = fs::read_dir(&self.dir)
            .await
            .map_err(|e| io_error(&self.dir, e))?;
        while let Some(entry) = dir.next_entry().await.map_err(|e| io_error(&self.dir, e))? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(BODY_EXT) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !live.contains(stem) {
                debug!(generation = %self.name, digest = stem, "removing unreferenced body");
                fs::remove_file(&path).await.map_err(|e| io_error(&path, e))?;
            }
        }
        Ok(())
    }
}

impl Cache for DiskCache {
    fn name(&self) -> &str {
        &self.name
    }

    fn put_all(&self, entries: Vec<(String, CachedResponse)>) -> BoxFuture<'_, CacheResult<()>> {
        Box::pin(async move {
            self.ensure_live()?;
            let mut index = self.index.write().await;
            let mut next = index.clone();

            for (key, response) in entries {
                let digest = hex::encode(Sha256::digest(&response.body));
                let body_path = self.body_path(&digest);
                let present = fs::try_exists(&body_path)
                    .await
                    .map_err(|e| io_error(&body_path, e))?;
                if !present {
                    write_atomic(&body_path, &response.body).await?;
                }

                let existing = next.entries.get(&key).map(|e| e.seq);
                let seq = match existing {
                    Some(seq) => seq,
                    None => {
                        next.next_seq += 1;
                        next.next_seq
                    }
                };
                next.entries.insert(
                    key,
                    IndexEntry {
                        seq,
                        status: response.status.as_u16(),
                        headers: response.headers,
                        digest,
                    },
                );
            }

            persist_index(&self.dir, &next).await?;
            *index = next;
            self.collect_garbage(&index).await
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, CacheResult<Option<CachedResponse>>> {
        Box::pin(async move {
            self.ensure_live()?;
            // Held until the body is read so a concurrent put_all cannot
            // collect it in between.
            let index = self.index.read().await;
            let Some(entry) = index.entries.get(key).cloned() else {
                return Ok(None);
            };
            let status =
                StatusCode::from_u16(entry.status).ok_or(CacheError::InvalidStatus(entry.status))?;
            let body_path = self.body_path(&entry.digest);
            let body = match fs::read(&body_path).await {
                Ok(body) => body,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(CacheError::MissingBody {
                        key: key.to_owned(),
                        digest: entry.digest,
                    });
                }
                Err(e) => return Err(io_error(&body_path, e)),
            };
            Ok(Some(CachedResponse::new(
                status,
                entry.headers,
                Bytes::from(body),
            )))
        })
    }

    fn keys(&self) -> BoxFuture<'_, CacheResult<Vec<String>>> {
        Box::pin(async move {
            self.ensure_live()?;
            let index = self.index.read().await;
            let mut keys: Vec<_> = index
                .entries
                .iter()
                .map(|(k, e)| (e.seq, k.clone()))
                .collect();
            keys.sort_unstable();
            Ok(keys.into_iter().map(|(_, k)| k).collect())
        })
    }
}

impl CacheStorage for DiskCacheStorage {
    fn open<'a>(&'a self, name: &'a str) -> BoxFuture<'a, CacheResult<Arc<dyn Cache>>> {
        Box::pin(async move {
            let mut open = self.open.lock().await;
            if let Some(existing) = open.get(name) {
                return Ok(Arc::clone(existing) as Arc<dyn Cache>);
            }

            let dir = self.generation_dir(name);
            let index_path = dir.join(INDEX_FILE);
            let exists = fs::try_exists(&index_path)
                .await
                .map_err(|e| io_error(&index_path, e))?;
            let loaded = if exists {
                match load_index(&index_path).await {
                    Ok(index) => Some(index),
                    Err(e) => {
                        warn!(generation = name, error = %e, "discarding unreadable cache index");
                        None
                    }
                }
            } else {
                None
            };
            let index = match loaded {
                Some(index) => index,
                None => {
                    fs::create_dir_all(&dir)
                        .await
                        .map_err(|e| io_error(&dir, e))?;
                    let index = Index::new(name);
                    persist_index(&dir, &index).await?;
                    debug!(generation = name, dir = %dir.display(), "created cache generation");
                    index
                }
            };

            let cache = Arc::new(DiskCache {
                name: name.to_owned(),
                dir,
                index: RwLock::new(index),
                deleted: AtomicBool::new(false),
            });
            open.insert(name.to_owned(), Arc::clone(&cache));
            Ok(cache as Arc<dyn Cache>)
        })
    }

    fn has<'a>(&'a self, name: &'a str) -> BoxFuture<'a, CacheResult<bool>> {
        Box::pin(async move {
            let dir = self.generation_dir(name);
            match fs::metadata(&dir).await {
                Ok(meta) => Ok(meta.is_dir()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(io_error(&dir, e)),
            }
        })
    }

    fn keys(&self) -> BoxFuture<'_, CacheResult<Vec<String>>> {
        Box::pin(async move {
            let mut found = Vec::new();
            let mut dir = fs::read_dir(&self.root)
                .await
                .map_err(|e| io_error(&self.root, e))?;

            while let Some(entry) = dir.next_entry().await.map_err(|e| io_error(&self.root, e))? {
                let path = entry.path();
                let is_dir = entry
                    .file_type()
                    .await
                    .map_err(|e| io_error(&path, e))?
                    .is_dir();
                let decoded = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .and_then(|n| hex::decode(n).ok())
                    .and_then(|raw| String::from_utf8(raw).ok());
                let Some(name) = decoded.filter(|_| is_dir) else {
                    debug!(path = %path.display(), "ignoring foreign entry in cache root");
                    continue;
                };

                // Missing or corrupt indexes sort ahead of readable ones.
                let index_path = path.join(INDEX_FILE);
                match load_index(&index_path).await {
                    Ok(index) => found.push((Some(index.created_at), name)),
                    Err(e) => {
                        warn!(generation = %name, error = %e, "listing generation with unreadable index");
                        found.push((None, name));
                    }
                }
            }

            found.sort();
            Ok(found.into_iter().map(|(_, name)| name).collect())
        })
    }

    fn delete<'a>(&'a self, name: &'a str) -> BoxFuture<'a, CacheResult<bool>> {
        Box::pin(async move {
            let mut open = self.open.lock().await;
            if let Some(handle) = open.remove(name) {
                handle.deleted.store(true, Ordering::Release);
            }

            let dir = self.generation_dir(name);
            let exists = fs::try_exists(&dir).await.map_err(|e| io_error(&dir, e))?;
            if !exists {
                return Ok(false);
            }
            fs::remove_dir_all(&dir)
                .await
                .map_err(|e| io_error(&dir, e))?;
            Ok(true)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, body: &'static [u8]) -> (String, CachedResponse) {
        let mut headers = Headers::new();
        headers.insert("Content-Type", "image/png");
        (
            key.to_owned(),
            CachedResponse::new(StatusCode::Ok, headers, body),
        )
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = DiskCacheStorage::new(dir.path()).await.unwrap();
            let cache = storage.open("oathlink-ui-v1").await.unwrap();
            cache
                .put_all(vec![entry("/icons/icon-192.png", b"\x89PNG")])
                .await
                .unwrap();
        }

        let storage = DiskCacheStorage::new(dir.path()).await.unwrap();
        assert_eq!(storage.keys().await.unwrap(), vec!["oathlink-ui-v1"]);
        let cache = storage.open("oathlink-ui-v1").await.unwrap();
        let hit = cache.get("/icons/icon-192.png").await.unwrap().unwrap();
        assert_eq!(hit.body.as_ref(), b"\x89PNG");
        assert_eq!(hit.headers.get("content-type"), Some("image/png"));
    }

    #[tokio::test]
    async fn identical_bodies_share_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskCacheStorage::new(dir.path()).await.unwrap();
        let cache = storage.open("v1").await.unwrap();
        cache
            .put_all(vec![entry("/", b"same"), entry("/index.html", b"same")])
            .await
            .unwrap();

        let generation = dir.path().join(hex::encode("v1"));
        let mut bodies = 0;
        let mut rd = std::fs::read_dir(&generation).unwrap();
        while let Some(Ok(e)) = rd.next() {
            if e.path().extension().and_then(|x| x.to_str()) == Some("bin") {
                bodies += 1;
            }
        }
        assert_eq!(bodies, 1);
    }

    #[tokio::test]
    async fn overwrite_removes_stale_body() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskCacheStorage::new(dir.path()).await.unwrap();
        let cache = storage.open("v1").await.unwrap();
        cache.put_all(vec![entry("/", b"old")]).await.unwrap();
        cache.put_all(vec![entry("/", b"new")]).await.unwrap();

        let stale = hex::encode(Sha256::digest(b"old"));
        let stale_path = dir
            .path()
            .join(hex::encode("v1"))
            .join(format!("{stale}.bin"));
        assert!(!stale_path.exists());
        assert_eq!(cache.keys().await.unwrap(), vec!["/"]);
    }

    #[tokio::test]
    async fn reads_never_miss_a_body_during_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskCacheStorage::new(dir.path()).await.unwrap();
        let cache = storage.open("v1").await.unwrap();
        cache.put_all(vec![entry("/", b"even")]).await.unwrap();

        let writer = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                for round in 0..50 {
                    let body: &'static [u8] = if round % 2 == 0 { b"odd" } else { b"even" };
                    cache.put_all(vec![entry("/", body)]).await.unwrap();
                }
            })
        };
        for _ in 0..200 {
            let hit = cache.get("/").await.unwrap().unwrap();
            assert!(matches!(hit.body.as_ref(), b"odd" | b"even"));
        }
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn delete_removes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskCacheStorage::new(dir.path()).await.unwrap();
        let old = storage.open("v0").await.unwrap();
        storage.open("v1").await.unwrap();

        assert!(storage.delete("v0").await.unwrap());
        assert!(!dir.path().join(hex::encode("v0")).exists());
        assert_eq!(storage.keys().await.unwrap(), vec!["v1"]);
        assert!(matches!(old.keys().await, Err(CacheError::Deleted(_))));
        assert!(!storage.delete("v0").await.unwrap());
    }

    #[tokio::test]
    async fn foreign_directories_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("not-hex")).unwrap();
        let storage = DiskCacheStorage::new(dir.path()).await.unwrap();
        storage.open("v1").await.unwrap();
        assert_eq!(storage.keys().await.unwrap(), vec!["v1"]);
    }

    #[tokio::test]
    async fn unreadable_generations_are_listed_first() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskCacheStorage::new(dir.path()).await.unwrap();
        storage.open("v2").await.unwrap();

        let corrupt = dir.path().join(hex::encode("v0"));
        std::fs::create_dir(&corrupt).unwrap();
        std::fs::write(corrupt.join(INDEX_FILE), "{ truncated").unwrap();
        std::fs::create_dir(dir.path().join(hex::encode("v1"))).unwrap();

        assert_eq!(storage.keys().await.unwrap(), vec!["v0", "v1", "v2"]);
        assert!(storage.has("v1").await.unwrap());
        assert!(storage.delete("v0").await.unwrap());
        assert!(storage.delete("v1").await.unwrap());
        assert!(!corrupt.exists());
        assert_eq!(storage.keys().await.unwrap(), vec!["v2"]);
    }

    #[tokio::test]
    async fn corrupt_index_reopens_empty() {
        let dir = tempfile::tempdir().unwrap();
        let generation = dir.path().join(hex::encode("v1"));
        std::fs::create_dir(&generation).unwrap();
        std::fs::write(generation.join(INDEX_FILE), "{ truncated").unwrap();

        let storage = DiskCacheStorage::new(dir.path()).await.unwrap();
        let cache = storage.open("v1").await.unwrap();
        assert!(cache.keys().await.unwrap().is_empty());
        cache.put_all(vec![entry("/", b"fresh")]).await.unwrap();

        let reopened = DiskCacheStorage::new(dir.path()).await.unwrap();
        let hit = reopened.open("v1").await.unwrap().get("/").await.unwrap();
        assert_eq!(hit.unwrap().body.as_ref(), b"fresh");
    }
}
