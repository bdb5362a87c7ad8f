//! Content-addressed cache of validated programs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::sandbox::JsException;

/// SHA-256 of the source text, lowercase hex.
pub fn content_hash(source: &str) -> String {
    hex::encode(Sha256::digest(source.as_bytes()))
}

/// Whether a compile was served from the cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheLookup {
    Hit,
    Miss,
}

/// A source body that passed the QuickJS parser. Immutable once cached.
#[derive(Debug)]
pub struct CompiledProgram {
    hash: String,
    name: String,
    source: Arc<str>,
    compiled_at: Instant,
}

impl CompiledProgram {
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Name of the script that first compiled this body.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn compiled_at(&self) -> Instant {
        self.compiled_at
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub capacity: usize,
    pub evictions: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Entry {
    program: Arc<CompiledProgram>,
    last_access: AtomicU64,
}

/// LRU-bounded map from content hash to [`CompiledProgram`].
///
/// Lookups take the read lock and bump an access tick atomically; only
/// inserts and evictions take the write lock.
pub struct ProgramCache {
    entries: RwLock<HashMap<String, Entry>>,
    capacity: usize,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl ProgramCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Cached program for `hash`, without touching the counters.
    pub fn get(&self, hash: &str) -> Option<Arc<CompiledProgram>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(hash).map(|entry| Arc::clone(&entry.program))
    }

    /// Return the program for `source`, validating it with `validate` on a miss.
    ///
    /// A validation failure is returned as-is and leaves the cache untouched.
    pub fn compile<F>(
        &self,
        name: &str,
        source: &Arc<str>,
        validate: F,
    ) -> Result<(Arc<CompiledProgram>, CacheLookup), JsException>
    where
        F: FnOnce(&str) -> Result<(), JsException>,
    {
        let hash = content_hash(source);

        {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = entries.get(&hash) {
                entry.last_access.store(self.tick(), Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(hash = %hash, "program cache hit");
                return Ok((Arc::clone(&entry.program), CacheLookup::Hit));
            }
        }

        validate(source)?;

        let program = Arc::new(CompiledProgram {
            hash: hash.clone(),
            name: name.to_string(),
            source: Arc::clone(source),
            compiled_at: Instant::now(),
        });

        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        self.misses.fetch_add(1, Ordering::Relaxed);

        // A concurrent miss may have inserted the same body meanwhile.
        if let Some(existing) = entries.get(&hash) {
            existing.last_access.store(self.tick(), Ordering::Relaxed);
            return Ok((Arc::clone(&existing.program), CacheLookup::Miss));
        }

        while entries.len() >= self.capacity {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_access.load(Ordering::Relaxed))
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    entries.remove(&key);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(hash = %key, "program evicted");
                }
                None => break,
            }
        }

        entries.insert(
            hash.clone(),
            Entry {
                program: Arc::clone(&program),
                last_access: AtomicU64::new(self.tick()),
            },
        );
        tracing::debug!(hash = %hash, script = name, "program cached");

        Ok((program, CacheLookup::Miss))
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
            capacity: self.capacity,
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(_: &str) -> Result<(), JsException> {
        Ok(())
    }

    fn src(text: &str) -> Arc<str> {
        Arc::from(text)
    }

    #[test]
    fn identical_bodies_share_one_slot() {
        let cache = ProgramCache::new(4);
        let (first, lookup) = cache.compile("a", &src("1 + 1"), ok).unwrap();
        assert_eq!(lookup, CacheLookup::Miss);
        let (second, lookup) = cache.compile("b", &src("1 + 1"), ok).unwrap();
        assert_eq!(lookup, CacheLookup::Hit);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.name(), "a");

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.entries), (1, 1, 1));
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn failed_validation_is_not_cached() {
        let cache = ProgramCache::new(4);
        let failing = |_: &str| {
            Err(JsException {
                name: "SyntaxError".into(),
                message: "unexpected token".into(),
                stack: None,
            })
        };
        assert!(cache.compile("bad", &src("let ="), failing).is_err());
        assert!(cache.compile("bad", &src("let ="), failing).is_err());
        assert!(cache.is_empty());
        assert_eq!(cache.stats().misses, 0);
    }

    #[test]
    fn least_recently_used_entry_is_evicted() {
        let cache = ProgramCache::new(2);
        cache.compile("a", &src("1"), ok).unwrap();
        cache.compile("b", &src("2"), ok).unwrap();
        cache.compile("a", &src("1"), ok).unwrap();
        cache.compile("c", &src("3"), ok).unwrap();

        assert!(cache.get(&content_hash("1")).is_some());
        assert!(cache.get(&content_hash("2")).is_none());
        assert!(cache.get(&content_hash("3")).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn hash_is_sha256_hex() {
        assert_eq!(
            content_hash(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
