//! Cache collaborator interfaces for the lookup path.
//!
//! The cache stores `Option<GeoRecord>` values: `None` is an explicit
//! "no record" marker, cached for the same TTL as a hit so that repeated
//! lookups of an absent address do not touch the database.

use crate::geo::GeoRecord;

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub type Producer<'a> = &'a mut dyn FnMut() -> Option<GeoRecord>;

/// Cache-aside store: return the cached value for `key`, or run the
/// producer, store its result for `ttl` and return it.
pub trait GeoCache: Send + Sync {
    fn remember(&self, key: &str, ttl: Duration, producer: Producer<'_>) -> Option<GeoRecord>;

    /// Capability check: a store that supports tag-scoped entries returns
    /// itself as a [`TaggedGeoCache`], enabling bulk invalidation of all geo
    /// entries without a full cache flush.
    fn tagged(&self) -> Option<&dyn TaggedGeoCache> {
        None
    }
}

/// Tag-scoped variant of [`GeoCache::remember`].
pub trait TaggedGeoCache: Send + Sync {
    fn remember_tagged(
        &self,
        tag: &str,
        key: &str,
        ttl: Duration,
        producer: Producer<'_>,
    ) -> Option<GeoRecord>;

    /// Drop every entry stored under `tag`.
    fn flush_tag(&self, tag: &str);
}

struct Entry {
    value: Option<GeoRecord>,
    expires_at: Instant,
}

/// In-process TTL cache with tag support.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
    tags: Mutex<HashMap<String, HashSet<String>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn get_fresh(&self, key: &str) -> Option<Option<GeoRecord>> {
        let entries = self.entries.lock().unwrap();
        entries
            .get(key)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.value.clone())
    }

    fn store(&self, key: &str, ttl: Duration, value: Option<GeoRecord>) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            key.to_owned(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }
}

impl GeoCache for MemoryCache {
    fn remember(&self, key: &str, ttl: Duration, producer: Producer<'_>) -> Option<GeoRecord> {
        if let Some(value) = self.get_fresh(key) {
            return value;
        }
        // The producer runs outside the lock: concurrent first-time misses
        // for the same key may each produce once, which is fine for
        // idempotent database reads.
        let value = producer();
        self.store(key, ttl, value.clone());
        value
    }

    fn tagged(&self) -> Option<&dyn TaggedGeoCache> {
        Some(self)
    }
}

impl TaggedGeoCache for MemoryCache {
    fn remember_tagged(
        &self,
        tag: &str,
        key: &str,
        ttl: Duration,
        producer: Producer<'_>,
    ) -> Option<GeoRecord> {
        if let Some(value) = self.get_fresh(key) {
            return value;
        }
        let value = producer();
        self.store(key, ttl, value.clone());
        let mut tags = self.tags.lock().unwrap();
        tags.entry(tag.to_owned()).or_default().insert(key.to_owned());
        value
    }

    fn flush_tag(&self, tag: &str) {
        let keys = {
            let mut tags = self.tags.lock().unwrap();
            tags.remove(tag)
        };
        if let Some(keys) = keys {
            let mut entries = self.entries.lock().unwrap();
            for key in keys {
                entries.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    fn record(ip: &str) -> GeoRecord {
        GeoRecord {
            country_code: Some("SE".into()),
            ..GeoRecord::empty(ip)
        }
    }

    #[test]
    fn remember_produces_once_within_ttl() {
        let cache = MemoryCache::new();
        let mut calls = 0;

        for _ in 0..3 {
            let value = cache.remember("k", TTL, &mut || {
                calls += 1;
                Some(record("8.8.8.8"))
            });
            assert_eq!(value, Some(record("8.8.8.8")));
        }
        assert_eq!(calls, 1);
    }

    #[test]
    fn absent_marker_is_cached() {
        let cache = MemoryCache::new();
        let mut calls = 0;

        for _ in 0..2 {
            let value = cache.remember("k", TTL, &mut || {
                calls += 1;
                None
            });
            assert_eq!(value, None);
        }
        assert_eq!(calls, 1);
    }

    #[test]
    fn expired_entry_is_reproduced() {
        let cache = MemoryCache::new();
        let mut calls = 0;
        let mut produce = || {
            calls += 1;
            Some(record("8.8.8.8"))
        };

        cache.remember("k", Duration::ZERO, &mut produce);
        cache.remember("k", Duration::ZERO, &mut produce);
        assert_eq!(calls, 2);
    }

    #[test]
    fn distinct_keys_produce_independently() {
        let cache = MemoryCache::new();
        let mut calls = 0;
        let mut produce = || {
            calls += 1;
            Some(record("8.8.8.8"))
        };

        cache.remember("a", TTL, &mut produce);
        cache.remember("b", TTL, &mut produce);
        assert_eq!(calls, 2);
    }

    #[test]
    fn flush_tag_drops_only_tagged_entries() {
        let cache = MemoryCache::new();
        cache.remember_tagged("geo", "tagged", TTL, &mut || Some(record("1.1.1.1")));
        cache.remember("plain", TTL, &mut || Some(record("8.8.8.8")));

        cache.flush_tag("geo");

        let mut calls = 0;
        cache.remember_tagged("geo", "tagged", TTL, &mut || {
            calls += 1;
            None
        });
        assert_eq!(calls, 1, "tagged entry must be gone");

        cache.remember("plain", TTL, &mut || {
            panic!("untagged entry must survive the tag flush")
        });
    }

    #[test]
    fn memory_cache_advertises_tag_support() {
        let cache = MemoryCache::new();
        assert!(GeoCache::tagged(&cache).is_some());
    }
}
