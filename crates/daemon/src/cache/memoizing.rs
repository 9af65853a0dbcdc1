//! Disk-backed memoization with serialized access and throttled write-back.

use super::versioned_dir;
use crate::throttle::Throttler;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::hash::Hash;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Bounds shared by cache keys.
pub trait CacheKey: Eq + Hash + Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}
impl<T> CacheKey for T where T: Eq + Hash + Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Bounds shared by cache values.
pub trait CacheValue: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}
impl<T> CacheValue for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

struct CacheInner<K, V> {
    namespace: String,
    /// `None` when the version directory could not be created; the cache
    /// then runs in memory only.
    file: Option<PathBuf>,
    entries: Mutex<HashMap<K, V>>,
    /// Serializes writers so a flush never races the throttled write-back.
    writing: Mutex<()>,
}

impl<K: CacheKey, V: CacheValue> CacheInner<K, V> {
    async fn persist(&self) {
        let Some(file) = &self.file else {
            return;
        };
        let _writing = self.writing.lock().await;

        let bytes = {
            let entries = self.entries.lock().await;
            let pairs: Vec<(&K, &V)> = entries.iter().collect();
            match serde_json::to_vec(&pairs) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(namespace = %self.namespace, error = %e, "failed to encode cache, write skipped");
                    return;
                }
            }
        };

        match write_atomic(file, &bytes).await {
            Ok(()) => debug!(namespace = %self.namespace, bytes = bytes.len(), "cache written"),
            Err(e) => warn!(
                namespace = %self.namespace,
                path = %file.display(),
                error = %e,
                "failed to write cache, continuing in memory"
            ),
        }
    }
}

/// A versioned key/value store persisted as one JSON file per namespace.
///
/// Every operation goes through a single async lock, so computations passed
/// to [`get_or_compute`](Self::get_or_compute) never overlap, even for
/// different keys. Persistence failures are logged and otherwise ignored:
/// an always-empty cache is a correct cache.
pub struct MemoizingCache<K, V> {
    inner: Arc<CacheInner<K, V>>,
    write_back: Throttler,
}

impl<K: CacheKey, V: CacheValue> MemoizingCache<K, V> {
    /// Open `<base_dir>/<namespace>/<version>/<namespace>.json`, loading it
    /// synchronously if present. Must be called within a tokio runtime.
    pub fn open(base_dir: &Path, namespace: &str, version: u32, flush_interval: Duration) -> Self {
        let file = match versioned_dir::create(&base_dir.join(namespace), version) {
            Ok(dir) => Some(dir.join(format!("{}.json", namespace))),
            Err(e) => {
                warn!(namespace, error = %e, "cache directory unavailable, running in memory");
                None
            }
        };

        let entries = file.as_deref().map(load_entries::<K, V>).unwrap_or_default();
        info!(namespace, version, entries = entries.len(), "opened cache");

        let inner = Arc::new(CacheInner {
            namespace: namespace.to_string(),
            file,
            entries: Mutex::new(entries),
            writing: Mutex::new(()),
        });

        let weak: Weak<CacheInner<K, V>> = Arc::downgrade(&inner);
        let write_back = Throttler::new(flush_interval, move || {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.persist().await;
                }
            }
        });

        Self { inner, write_back }
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        self.inner.entries.lock().await.get(key).cloned()
    }

    /// Return the cached value, or run `compute` while holding the cache
    /// lock and store a `Some` result.
    pub async fn get_or_compute<F, Fut>(&self, key: &K, compute: F) -> Option<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Option<V>>,
    {
        let result: Result<Option<V>, std::convert::Infallible> = self
            .get_or_try_compute(key, || async { Ok(compute().await) })
            .await;
        match result {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }

    /// Like [`get_or_compute`](Self::get_or_compute) for fallible
    /// computations. Only `Ok(Some(_))` is stored; errors are handed back.
    pub async fn get_or_try_compute<F, Fut, E>(&self, key: &K, compute: F) -> Result<Option<V>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<V>, E>>,
    {
        let mut entries = self.inner.entries.lock().await;
        if let Some(value) = entries.get(key) {
            return Ok(Some(value.clone()));
        }

        let computed = compute().await?;
        if let Some(value) = &computed {
            entries.insert(key.clone(), value.clone());
            drop(entries);
            self.write_back.trigger();
        }
        Ok(computed)
    }

    pub async fn put(&self, key: K, value: V) {
        self.inner.entries.lock().await.insert(key, value);
        self.write_back.trigger();
    }

    /// Drop every entry whose key is not in `keys`. Returns how many were
    /// removed.
    pub async fn filter_to_keys(&self, keys: &HashSet<K>) -> usize {
        let removed = {
            let mut entries = self.inner.entries.lock().await;
            let before = entries.len();
            entries.retain(|k, _| keys.contains(k));
            before - entries.len()
        };
        if removed > 0 {
            debug!(namespace = %self.inner.namespace, removed, "pruned cache");
            self.write_back.trigger();
        }
        removed
    }

    /// Retain entries for which `keep` returns true.
    pub async fn retain<F>(&self, mut keep: F) -> usize
    where
        F: FnMut(&K, &V) -> bool,
    {
        let removed = {
            let mut entries = self.inner.entries.lock().await;
            let before = entries.len();
            entries.retain(|k, v| keep(k, v));
            before - entries.len()
        };
        if removed > 0 {
            self.write_back.trigger();
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.inner.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.entries.lock().await.is_empty()
    }

    /// Write the current contents immediately, bypassing the throttle.
    pub async fn flush(&self) {
        self.inner.persist().await;
    }
}

/// Clones share the same entries and write-back.
impl<K, V> Clone for MemoizingCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            write_back: self.write_back.clone(),
        }
    }
}

impl<K, V> std::fmt::Debug for MemoizingCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoizingCache")
            .field("namespace", &self.inner.namespace)
            .field("file", &self.inner.file)
            .finish()
    }
}

fn load_entries<K: CacheKey, V: CacheValue>(file: &Path) -> HashMap<K, V> {
    let bytes = match std::fs::read(file) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return HashMap::new(),
        Err(e) => {
            warn!(path = %file.display(), error = %e, "failed to read cache, starting empty");
            return HashMap::new();
        }
    };

    match serde_json::from_slice::<Vec<(K, V)>>(&bytes) {
        Ok(pairs) => pairs.into_iter().collect(),
        Err(e) => {
            warn!(path = %file.display(), error = %e, "corrupt cache file, starting empty");
            HashMap::new()
        }
    }
}

async fn write_atomic(file: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = file.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = file.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, file).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    const FLUSH: Duration = Duration::from_millis(20);

    fn open(dir: &Path, version: u32) -> MemoizingCache<String, u64> {
        MemoizingCache::open(dir, "sizes", version, FLUSH)
    }

    // Whatever was put must read back, both live and after a reload from disk.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(20))]

        #[test]
        fn prop_put_get_survives_restart(
            entries in prop::collection::hash_map("[a-z0-9/._-]{1,24}", any::<u64>(), 0..20),
        ) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let temp = TempDir::new().unwrap();
                {
                    let cache = open(temp.path(), 1);
                    for (k, v) in &entries {
                        cache.put(k.clone(), *v).await;
                    }
                    for (k, v) in &entries {
                        assert_eq!(cache.get(k).await, Some(*v));
                    }
                    cache.flush().await;
                }

                let reopened = open(temp.path(), 1);
                assert_eq!(reopened.len().await, entries.len());
                for (k, v) in &entries {
                    assert_eq!(reopened.get(k).await, Some(*v));
                }
            });
        }
    }

    #[tokio::test]
    async fn test_file_layout() {
        let temp = TempDir::new().unwrap();
        let cache = open(temp.path(), 4);
        cache.put("a".to_string(), 1).await;
        cache.flush().await;

        let file = temp.path().join("sizes").join("4").join("sizes.json");
        let pairs: Vec<(String, u64)> =
            serde_json::from_slice(&std::fs::read(file).unwrap()).unwrap();
        assert_eq!(pairs, vec![("a".to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_throttled_write_back_reaches_disk() {
        let temp = TempDir::new().unwrap();
        let cache = open(temp.path(), 1);
        for i in 0..50u64 {
            cache.put(format!("k{}", i), i).await;
        }
        tokio::time::sleep(FLUSH * 6).await;

        let reopened = open(temp.path(), 1);
        assert_eq!(reopened.len().await, 50);
    }

    #[tokio::test]
    async fn test_version_isolation() {
        let temp = TempDir::new().unwrap();
        let v1 = open(temp.path(), 1);
        v1.put("a".to_string(), 1).await;
        v1.flush().await;

        let v2 = open(temp.path(), 2);
        assert!(v2.is_empty().await);
        assert_eq!(v2.get(&"a".to_string()).await, None);
    }

    #[tokio::test]
    async fn test_corrupt_file_loads_empty() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("sizes").join("1");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("sizes.json"), b"{not json").unwrap();

        let cache = open(temp.path(), 1);
        assert!(cache.is_empty().await);

        // Still usable, and the next write replaces the corrupt file.
        cache.put("a".to_string(), 7).await;
        cache.flush().await;
        assert_eq!(open(temp.path(), 1).get(&"a".to_string()).await, Some(7));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_get_or_compute_computes_once() {
        let temp = TempDir::new().unwrap();
        let cache = Arc::new(open(temp.path(), 1));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute(&"clip".to_string(), || async move {
                        let n = calls.fetch_add(1, Ordering::SeqCst) as u64;
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Some(100 + n)
                    })
                    .await
            }));
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| *r == Some(100)));
    }

    #[tokio::test]
    async fn test_get_or_compute_does_not_store_none() {
        let temp = TempDir::new().unwrap();
        let cache = open(temp.path(), 1);
        let key = "missing".to_string();

        assert_eq!(cache.get_or_compute(&key, || async { None }).await, None);
        assert!(cache.is_empty().await);
        assert_eq!(cache.get_or_compute(&key, || async { Some(3) }).await, Some(3));
        assert_eq!(cache.get(&key).await, Some(3));
    }

    #[tokio::test]
    async fn test_get_or_try_compute_returns_error_without_storing() {
        let temp = TempDir::new().unwrap();
        let cache = open(temp.path(), 1);
        let key = "flaky".to_string();

        let failed: Result<Option<u64>, &str> =
            cache.get_or_try_compute(&key, || async { Err("probe failed") }).await;
        assert_eq!(failed, Err("probe failed"));
        assert!(cache.is_empty().await);

        let ok: Result<Option<u64>, &str> =
            cache.get_or_try_compute(&key, || async { Ok(Some(9)) }).await;
        assert_eq!(ok, Ok(Some(9)));
        assert_eq!(cache.get(&key).await, Some(9));
    }

    #[tokio::test]
    async fn test_filter_to_keys() {
        let temp = TempDir::new().unwrap();
        let cache = open(temp.path(), 1);
        for k in ["a", "b", "c"] {
            cache.put(k.to_string(), 1).await;
        }

        let keep: HashSet<String> = ["a", "c", "z"].iter().map(|s| s.to_string()).collect();
        assert_eq!(cache.filter_to_keys(&keep).await, 1);
        assert_eq!(cache.len().await, 2);
        assert_eq!(cache.get(&"b".to_string()).await, None);

        // Nothing left to drop.
        assert_eq!(cache.filter_to_keys(&keep).await, 0);
    }
}
