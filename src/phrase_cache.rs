//! Phrase cache (C3).
//!
//! Static phrases are loaded once at startup into a read-only `HashMap`
//! (no locking needed, mirroring the teacher's read-only persona weight
//! tables). The dynamic cache is a single shared structure behind one
//! short-held mutex, FIFO-bounded (§3 invariant), the same
//! one-lock-per-cache discipline as `persona::PersonaState`.

use std::collections::{ HashMap, VecDeque };
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

fn hash_text(text: &str) -> u64 {
    use std::hash::{ Hash, Hasher };
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

struct DynamicEntry {
    key: u64,
    pcm: Arc<Vec<u8>>,
}

struct DynamicStore {
    by_key: HashMap<u64, Arc<Vec<u8>>>,
    order: VecDeque<u64>,
    max_size: usize,
}

/// Shared, thread-safe phrase cache.
#[derive(Clone)]
pub struct PhraseCache {
    static_phrases: Arc<HashMap<String, Arc<Vec<u8>>>>,
    dynamic: Arc<Mutex<DynamicStore>>,
}

impl PhraseCache {
    /// Scan `dir` for `<key>.raw` files and load each as a static phrase.
    /// Missing files or an unreadable directory produce warnings, never
    /// errors — the bot degrades to TTS-only prompts instead of failing
    /// to start.
    pub async fn load(dir: &str, dynamic_max_size: usize) -> Self {
        let mut static_phrases = HashMap::new();
        match tokio::fs::read_dir(dir).await {
            Ok(mut entries) => {
                loop {
                    let entry = match entries.next_entry().await {
                        Ok(Some(e)) => e,
                        Ok(None) => {
                            break;
                        }
                        Err(e) => {
                            warn!(dir = %dir, error = %e, "phrase cache read_dir error");
                            break;
                        }
                    };
                    let path = entry.path();
                    if path.extension().and_then(|e| e.to_str()) != Some("raw") {
                        continue;
                    }
                    let Some(key) = path.file_stem().and_then(|s| s.to_str()) else {
                        continue;
                    };
                    match tokio::fs::read(&path).await {
                        Ok(bytes) => {
                            static_phrases.insert(key.to_string(), Arc::new(bytes));
                        }
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "failed to load static phrase");
                        }
                    }
                }
            }
            Err(e) => {
                warn!(dir = %dir, error = %e, "phrase cache directory missing, starting empty");
            }
        }

        Self {
            static_phrases: Arc::new(static_phrases),
            dynamic: Arc::new(
                Mutex::new(DynamicStore {
                    by_key: HashMap::new(),
                    order: VecDeque::new(),
                    max_size: dynamic_max_size.max(1),
                })
            ),
        }
    }

    /// Construct directly from a preloaded table — used by tests and by
    /// a startup path that pre-seeds phrases without touching the disk.
    pub fn from_static(phrases: HashMap<String, Vec<u8>>, dynamic_max_size: usize) -> Self {
        Self {
            static_phrases: Arc::new(
                phrases
                    .into_iter()
                    .map(|(k, v)| (k, Arc::new(v)))
                    .collect()
            ),
            dynamic: Arc::new(
                Mutex::new(DynamicStore {
                    by_key: HashMap::new(),
                    order: VecDeque::new(),
                    max_size: dynamic_max_size.max(1),
                })
            ),
        }
    }

    pub fn get_static(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        self.static_phrases.get(key).cloned()
    }

    pub async fn get_dynamic(&self, text: &str) -> Option<Arc<Vec<u8>>> {
        let key = hash_text(text);
        let store = self.dynamic.lock().await;
        store.by_key.get(&key).cloned()
    }

    /// Insert a dynamic entry, evicting the oldest-inserted entry if the
    /// cache is at capacity. A hit never triggers this path (callers only
    /// call `put_dynamic` after a TTS miss).
    pub async fn put_dynamic(&self, text: &str, pcm: Vec<u8>) {
        let key = hash_text(text);
        let mut store = self.dynamic.lock().await;
        if store.by_key.contains_key(&key) {
            return;
        }
        while store.order.len() >= store.max_size {
            if let Some(oldest) = store.order.pop_front() {
                store.by_key.remove(&oldest);
            } else {
                break;
            }
        }
        store.order.push_back(key);
        store.by_key.insert(key, Arc::new(pcm));
    }

    #[cfg(test)]
    pub async fn dynamic_len(&self) -> usize {
        self.dynamic.lock().await.by_key.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(max: usize) -> PhraseCache {
        PhraseCache::from_static(HashMap::new(), max)
    }

    #[tokio::test]
    async fn test_static_lookup() {
        let mut m = HashMap::new();
        m.insert("welcome".to_string(), vec![1, 2, 3]);
        let cache = PhraseCache::from_static(m, 8);
        assert_eq!(cache.get_static("welcome").map(|v| (*v).clone()), Some(vec![1, 2, 3]));
        assert!(cache.get_static("missing").is_none());
    }

    #[tokio::test]
    async fn test_dynamic_hit_after_put() {
        let cache = cache(8);
        assert!(cache.get_dynamic("hello").await.is_none());
        cache.put_dynamic("hello", vec![9, 9, 9]).await;
        assert_eq!(cache.get_dynamic("hello").await.map(|v| (*v).clone()), Some(vec![9, 9, 9]));
    }

    #[tokio::test]
    async fn test_fifo_eviction_order() {
        let cache = cache(2);
        cache.put_dynamic("a", vec![1]).await;
        cache.put_dynamic("b", vec![2]).await;
        cache.put_dynamic("c", vec![3]).await;

        assert_eq!(cache.dynamic_len().await, 2);
        assert!(cache.get_dynamic("a").await.is_none(), "oldest entry must be evicted");
        assert!(cache.get_dynamic("b").await.is_some());
        assert!(cache.get_dynamic("c").await.is_some());
    }

    #[tokio::test]
    async fn test_access_does_not_refresh_position() {
        let cache = cache(2);
        cache.put_dynamic("a", vec![1]).await;
        cache.put_dynamic("b", vec![2]).await;
        // Access "a" repeatedly; FIFO order must not change.
        let _ = cache.get_dynamic("a").await;
        let _ = cache.get_dynamic("a").await;
        cache.put_dynamic("c", vec![3]).await;
        assert!(cache.get_dynamic("a").await.is_none(), "access must not refresh FIFO position");
        assert!(cache.get_dynamic("b").await.is_some());
    }

    #[tokio::test]
    async fn test_never_exceeds_capacity_under_many_inserts() {
        let cache = cache(5);
        for i in 0..100 {
            cache.put_dynamic(&format!("text-{i}"), vec![i as u8]).await;
        }
        assert!(cache.dynamic_len().await <= 5);
    }

    #[tokio::test]
    async fn test_duplicate_insert_is_noop() {
        let cache = cache(5);
        cache.put_dynamic("x", vec![1]).await;
        cache.put_dynamic("x", vec![2]).await;
        assert_eq!(cache.dynamic_len().await, 1);
        assert_eq!(cache.get_dynamic("x").await.map(|v| (*v).clone()), Some(vec![1]));
    }
}
