use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::Context;
use tokio::fs;
use tokio::sync::{Mutex, OnceCell};
use tracing::debug;

use crate::write_atomic;

/// File cache with a freshness window measured from each file's mtime.
///
/// Concurrent writers are last-writer-wins; both write complete files.
#[derive(Debug, Clone)]
pub struct DiskCache {
    dir: PathBuf,
    ttl: Duration,
}

impl DiskCache {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            dir: dir.into(),
            ttl,
        }
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns cached bytes when the file exists and is younger than the TTL.
    pub async fn read_fresh(&self, name: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let path = self.path_for(name);
        let meta = match fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).with_context(|| format!("stat {}", path.display())),
        };
        let age = meta
            .modified()
            .ok()
            .and_then(|m| SystemTime::now().duration_since(m).ok())
            .unwrap_or(Duration::MAX);
        if age > self.ttl {
            debug!(path = %path.display(), ?age, "cache file expired");
            return Ok(None);
        }
        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Ok(Some(bytes))
    }

    /// Returns cached bytes regardless of age, for use when a refresh fails.
    pub async fn read_stale(&self, name: &str) -> anyhow::Result<Option<Vec<u8>>> {
        read_optional(&self.path_for(name)).await
    }

    pub async fn write(&self, name: &str, bytes: &[u8]) -> anyhow::Result<()> {
        write_atomic(&self.path_for(name), bytes).await
    }
}

async fn read_optional(path: &Path) -> anyhow::Result<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
    }
}

struct MemoSlot<V> {
    cell: OnceCell<V>,
    created_at: Instant,
}

/// Keyed get-or-compute cache. Concurrent callers for the same key share one
/// in-flight computation; failed computations are not cached.
pub struct MemoCache<K, V> {
    ttl: Option<Duration>,
    slots: Mutex<HashMap<K, Arc<MemoSlot<V>>>>,
}

impl<K, V> Default for MemoCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new(None)
    }
}

impl<K, V> MemoCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            ttl,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn is_expired(&self, slot: &MemoSlot<V>) -> bool {
        match self.ttl {
            Some(ttl) => slot.cell.initialized() && slot.created_at.elapsed() > ttl,
            None => false,
        }
    }

    async fn slot(&self, key: &K) -> Arc<MemoSlot<V>> {
        let mut slots = self.slots.lock().await;
        if slots.get(key).is_some_and(|slot| self.is_expired(slot)) {
            slots.remove(key);
        }
        slots
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(MemoSlot {
                    cell: OnceCell::new(),
                    created_at: Instant::now(),
                })
            })
            .clone()
    }

    pub async fn get_or_try_init<F, Fut, E>(&self, key: K, init: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let slot = self.slot(&key).await;
        let value = slot.cell.get_or_try_init(init).await?;
        Ok(value.clone())
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        let slots = self.slots.lock().await;
        slots
            .get(key)
            .filter(|slot| !self.is_expired(slot))
            .and_then(|slot| slot.cell.get().cloned())
    }

    pub async fn invalidate(&self, key: &K) {
        self.slots.lock().await.remove(key);
    }

    pub async fn len(&self) -> usize {
        self.slots
            .lock()
            .await
            .values()
            .filter(|slot| slot.cell.initialized())
            .count()
    }
}
