//! Response caching to avoid redundant inference calls.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::RwLock;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

/// One cached result. Entries are never mutated in place: a repeated
/// prompt overwrites the whole entry.
#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    created_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn expired(&self) -> bool {
        self.created_at.elapsed() > self.ttl
    }
}

/// Cache of recent inference results, keyed by (model, prompt).
///
/// The key is a cheap hash; collisions are tolerated as a performance
/// trade-off since hits are an optimization, not a source of truth.
/// Prompts are cached per-model: the same text may yield different
/// outputs from different models.
pub struct ResponseCache {
    entries: RwLock<HashMap<u64, CacheEntry>>,
    default_ttl: Duration,
}

impl ResponseCache {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            default_ttl,
        }
    }

    /// Generate a cache key from model and prompt.
    pub fn cache_key(model: &str, prompt: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        model.hash(&mut hasher);
        prompt.hash(&mut hasher);
        hasher.finish()
    }

    /// Get a cached value, purging it if its TTL elapsed.
    pub fn get(&self, model: &str, prompt: &str) -> Option<String> {
        let key = Self::cache_key(model, prompt);

        {
            let entries = self.entries.read().expect("cache lock poisoned");
            match entries.get(&key) {
                Some(entry) if !entry.expired() => return Some(entry.value.clone()),
                Some(_) => {}
                None => return None,
            }
        }

        // Expired: purge opportunistically on read.
        let mut entries = self.entries.write().expect("cache lock poisoned");
        if entries.get(&key).map_or(false, CacheEntry::expired) {
            entries.remove(&key);
        }
        None
    }

    /// Store a value. `ttl` falls back to the cache default.
    pub fn put(&self, model: &str, prompt: &str, value: &str, ttl: Option<Duration>) {
        let key = Self::cache_key(model, prompt);
        let entry = CacheEntry {
            value: value.to_string(),
            created_at: Instant::now(),
            ttl: ttl.unwrap_or(self.default_ttl),
        };
        self.entries
            .write()
            .expect("cache lock poisoned")
            .insert(key, entry);
    }

    /// Drop all expired entries.
    pub fn sweep(&self) {
        let mut entries = self.entries.write().expect("cache lock poisoned");
        let before = entries.len();
        entries.retain(|_, entry| !entry.expired());
        let swept = before - entries.len();
        if swept > 0 {
            debug!("swept {} expired cache entries", swept);
        }
    }

    /// Number of stored entries, expired or not.
    pub fn len(&self) -> usize {
        self.entries.read().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
