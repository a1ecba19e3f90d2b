use crate::models::FileLocator;
use chrono::{DateTime, Duration, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// How long a dead reference stays negatively cached, to keep repeated
/// requests from hammering the upstream.
pub const NEGATIVE_CACHE_SECONDS: i64 = 60;

enum CacheSlot {
    Found {
        locator: Arc<FileLocator>,
        inserted_at: DateTime<Utc>,
    },
    Missing {
        until: DateTime<Utc>,
    },
}

/// Outcome of a cache probe.
pub enum CacheLookup {
    Hit(Arc<FileLocator>),
    /// The reference was recently confirmed dead.
    NegativeHit,
    Miss,
}

/// Per-identity bounded LRU of `message_id -> FileLocator`. Access hashes
/// are identity-scoped, so locators never cross identities.
pub struct LocatorCache {
    inner: Mutex<LruCache<i64, CacheSlot>>,
}

impl LocatorCache {
    pub fn new(max_entries: usize) -> Self {
        let capacity = NonZeroUsize::new(max_entries.max(1)).expect("max(1) is nonzero");
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, message_id: i64, now: DateTime<Utc>) -> CacheLookup {
        let mut cache = self.inner.lock();
        let negative_until = match cache.get(&message_id) {
            Some(CacheSlot::Found { locator, .. }) => return CacheLookup::Hit(locator.clone()),
            Some(CacheSlot::Missing { until }) => Some(*until),
            None => None,
        };
        match negative_until {
            Some(until) if until > now => CacheLookup::NegativeHit,
            Some(_) => {
                cache.pop(&message_id);
                CacheLookup::Miss
            }
            None => CacheLookup::Miss,
        }
    }

    pub fn insert(&self, locator: Arc<FileLocator>) {
        let mut cache = self.inner.lock();
        cache.put(
            locator.message_id,
            CacheSlot::Found {
                locator,
                inserted_at: Utc::now(),
            },
        );
    }

    /// Record a dead reference for a short window.
    pub fn insert_negative(&self, message_id: i64, now: DateTime<Utc>) {
        let mut cache = self.inner.lock();
        cache.put(
            message_id,
            CacheSlot::Missing {
                until: now + Duration::seconds(NEGATIVE_CACHE_SECONDS),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Age of a cached entry, for diagnostics.
    pub fn inserted_at(&self, message_id: i64) -> Option<DateTime<Utc>> {
        let cache = self.inner.lock();
        match cache.peek(&message_id) {
            Some(CacheSlot::Found { inserted_at, .. }) => Some(*inserted_at),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locator(message_id: i64) -> Arc<FileLocator> {
        Arc::new(FileLocator {
            message_id,
            dc_id: 2,
            volume_id: 100,
            local_id: 7,
            access_hash: -42,
            size: 1024,
            mime_type: Some("video/mp4".to_string()),
            file_name: Some("a.mp4".to_string()),
            message_date: Utc::now(),
        })
    }

    #[test]
    fn hit_after_insert() {
        let cache = LocatorCache::new(10);
        cache.insert(locator(5));
        match cache.get(5, Utc::now()) {
            CacheLookup::Hit(found) => assert_eq!(found.message_id, 5),
            _ => panic!("expected hit"),
        }
    }

    #[test]
    fn evicts_least_recently_used_first() {
        let cache = LocatorCache::new(2);
        cache.insert(locator(1));
        cache.insert(locator(2));
        // Touch 1 so that 2 becomes the eviction candidate.
        assert!(matches!(cache.get(1, Utc::now()), CacheLookup::Hit(_)));
        cache.insert(locator(3));

        assert!(matches!(cache.get(1, Utc::now()), CacheLookup::Hit(_)));
        assert!(matches!(cache.get(2, Utc::now()), CacheLookup::Miss));
        assert!(matches!(cache.get(3, Utc::now()), CacheLookup::Hit(_)));
    }

    #[test]
    fn negative_entries_expire() {
        let cache = LocatorCache::new(10);
        let now = Utc::now();
        cache.insert_negative(9, now);
        assert!(matches!(cache.get(9, now), CacheLookup::NegativeHit));
        let later = now + Duration::seconds(NEGATIVE_CACHE_SECONDS + 1);
        assert!(matches!(cache.get(9, later), CacheLookup::Miss));
    }

    #[test]
    fn bounded_size() {
        let cache = LocatorCache::new(3);
        for id in 0..10 {
            cache.insert(locator(id));
        }
        assert_eq!(cache.len(), 3);
    }
}
