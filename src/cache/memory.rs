//! In-memory cache storage.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::RwLock;

use super::{Cache, CacheError, CacheResult, CacheStorage, CachedResponse};
use crate::BoxFuture;

/// Process-local [`CacheStorage`]. Contents vanish with the process.
#[derive(Default)]
pub struct MemoryCacheStorage {
    // Vec keeps generations in creation order.
    generations: RwLock<Vec<Arc<MemoryCache>>>,
}

impl MemoryCacheStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

/// One in-memory generation.
pub struct MemoryCache {
    name: String,
    entries: RwLock<Entries>,
    deleted: AtomicBool,
}

#[derive(Default)]
struct Entries {
    next_seq: u64,
    map: HashMap<String, (u64, CachedResponse)>,
}

impl MemoryCache {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            entries: RwLock::new(Entries::default()),
            deleted: AtomicBool::new(false),
        }
    }

    fn ensure_live(&self) -> CacheResult<()> {
        if self.deleted.load(Ordering::Acquire) {
            return Err(CacheError::Deleted(self.name.clone()));
        }
        Ok(())
    }
}

impl Cache for MemoryCache {
    fn name(&self) -> &str {
        &self.name
    }

    fn put_all(&self, entries: Vec<(String, CachedResponse)>) -> BoxFuture<'_, CacheResult<()>> {
        Box::pin(async move {
            self.ensure_live()?;
            let mut guard = self.entries.write().await;
            for (key, response) in entries {
                let existing = guard.map.get(&key).map(|(seq, _)| *seq);
                let seq = match existing {
                    Some(seq) => seq,
                    None => {
                        guard.next_seq += 1;
                        guard.next_seq
                    }
                };
                guard.map.insert(key, (seq, response));
            }
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, CacheResult<Option<CachedResponse>>> {
        Box::pin(async move {
            self.ensure_live()?;
            let guard = self.entries.read().await;
            Ok(guard.map.get(key).map(|(_, response)| response.clone()))
        })
    }

    fn keys(&self) -> BoxFuture<'_, CacheResult<Vec<String>>> {
        Box::pin(async move {
            self.ensure_live()?;
            let guard = self.entries.read().await;
            let mut keys: Vec<_> = guard.map.iter().map(|(k, (seq, _))| (*seq, k.clone())).collect();
            keys.sort_unstable();
            Ok(keys.into_iter().map(|(_, k)| k).collect())
        })
    }
}

impl CacheStorage for MemoryCacheStorage {
    fn open<'a>(&'a self, name: &'a str) -> BoxFuture<'a, CacheResult<Arc<dyn Cache>>> {
        Box::pin(async move {
            let mut generations = self.generations.write().await;
            if let Some(existing) = generations.iter().find(|c| c.name == name) {
                return Ok(Arc::clone(existing) as Arc<dyn Cache>);
            }
            let cache = Arc::new(MemoryCache::new(name));
            generations.push(Arc::clone(&cache));
            Ok(cache as Arc<dyn Cache>)
        })
    }

    fn has<'a>(&'a self, name: &'a str) -> BoxFuture<'a, CacheResult<bool>> {
        Box::pin(async move {
            let generations = self.generations.read().await;
            Ok(generations.iter().any(|c| c.name == name))
        })
    }

    fn keys(&self) -> BoxFuture<'_, CacheResult<Vec<String>>> {
        Box::pin(async move {
            let generations = self.generations.read().await;
            Ok(generations.iter().map(|c| c.name.clone()).collect())
        })
    }

    fn delete<'a>(&'a self, name: &'a str) -> BoxFuture<'a, CacheResult<bool>> {
        Box::pin(async move {
            let mut generations = self.generations.write().await;
            let Some(pos) = generations.iter().position(|c| c.name == name) else {
                return Ok(false);
            };
            let removed = generations.remove(pos);
            removed.deleted.store(true, Ordering::Release);
            Ok(true)
        })
    }
}
