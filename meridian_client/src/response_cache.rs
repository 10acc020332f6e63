use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Change token stored for a cached "the document does not exist" response,
/// which lets a 404 be revalidated with a conditional request like any other
/// cached entry.
pub const NOT_FOUND_CHANGE_TOKEN: &str = "not-found";

/// Flat weight charged per entry on top of the payload size, covering the key
/// and bookkeeping.
const ENTRY_OVERHEAD_BYTES: u64 = 128;

/// Bounded store of `(change token, payload)` pairs keyed by request URL.
///
/// The cache is weight-limited (payload bytes plus a fixed per-entry
/// overhead) with least-recently-used eviction. It keeps no freshness policy
/// of its own: every lookup reports the entry's age and whether the cache-wide
/// generation has moved past it, and callers decide what is fresh enough.
/// Entries are immutable snapshots; a lookup hands out `Arc` clones, so
/// concurrent readers never see an entry change underneath them.
pub struct ResponseCache {
    max_weight: u64,
    generation: AtomicU64,
    inner: Mutex<CacheInner>,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    /// Access-ordered index into `entries`; lowest key is the eviction victim.
    recency: BTreeMap<u64, String>,
    clock: u64,
    weight: u64,
}

struct CacheEntry {
    token: Arc<str>,
    payload: Option<Arc<str>>,
    generation: u64,
    stored_at: Instant,
    last_touched: u64,
    weight: u64,
}

/// Snapshot of one cache entry, handed to the request path.
#[derive(Clone, Debug)]
pub struct CachedResponse {
    key: String,
    token: Arc<str>,
    payload: Option<Arc<str>>,
    stored_at: Instant,
    might_be_stale: bool,
}

impl CachedResponse {
    pub fn token(&self) -> &str {
        &self.token
    }

    /// The cached body; `None` marks a cached "not found".
    pub fn payload(&self) -> Option<&Arc<str>> {
        self.payload.as_ref()
    }

    pub fn is_not_found(&self) -> bool {
        self.payload.is_none()
    }

    /// Time since the server last confirmed this entry.
    pub fn age(&self) -> Duration {
        self.stored_at.elapsed()
    }

    /// True when the cache generation moved on after this entry was stored,
    /// i.e. someone invalidated all entries without walking the cache.
    pub fn might_be_stale(&self) -> bool {
        self.might_be_stale
    }
}

impl ResponseCache {
    pub fn new(max_weight: u64) -> Self {
        Self {
            max_weight,
            generation: AtomicU64::new(0),
            inner: Mutex::new(CacheInner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &str) -> Option<CachedResponse> {
        let generation = self.generation.load(Ordering::SeqCst);
        let mut inner = self.lock();
        inner.clock += 1;
        let clock = inner.clock;
        let entry = inner.entries.get_mut(key)?;
        let snapshot = CachedResponse {
            key: key.to_string(),
            token: entry.token.clone(),
            payload: entry.payload.clone(),
            stored_at: entry.stored_at,
            might_be_stale: entry.generation != generation,
        };
        let previous = std::mem::replace(&mut entry.last_touched, clock);
        inner.recency.remove(&previous);
        inner.recency.insert(clock, key.to_string());
        Some(snapshot)
    }

    /// Stores a response, unconditionally overwriting any previous entry.
    pub fn set(&self, key: &str, token: &str, payload: &str) {
        self.insert(key, Arc::from(token), Some(Arc::from(payload)));
    }

    /// Stores the "known not found" marker for a key.
    pub fn set_not_found(&self, key: &str) {
        self.insert(key, Arc::from(NOT_FOUND_CHANGE_TOKEN), None);
    }

    /// Re-stamps an entry's freshness after the server answered a conditional
    /// request with 304, without refetching the payload. A no-op when the
    /// entry has since been replaced under a different change token.
    pub fn confirm_not_modified(&self, response: &CachedResponse) {
        let generation = self.generation.load(Ordering::SeqCst);
        let mut inner = self.lock();
        if let Some(entry) = inner.entries.get_mut(&response.key) {
            if entry.token == response.token {
                entry.stored_at = Instant::now();
                entry.generation = generation;
            }
        }
    }

    /// Marks every current entry as possibly stale in O(1) by bumping the
    /// cache-wide generation counter.
    pub fn invalidate_all(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, key: &str, token: Arc<str>, payload: Option<Arc<str>>) {
        let generation = self.generation.load(Ordering::SeqCst);
        let weight =
            ENTRY_OVERHEAD_BYTES + payload.as_ref().map(|p| p.len() as u64).unwrap_or(0);
        let mut inner = self.lock();
        inner.clock += 1;
        let clock = inner.clock;

        if let Some(previous) = inner.entries.remove(key) {
            inner.recency.remove(&previous.last_touched);
            inner.weight -= previous.weight;
        }

        inner.weight += weight;
        inner.recency.insert(clock, key.to_string());
        inner.entries.insert(
            key.to_string(),
            CacheEntry {
                token,
                payload,
                generation,
                stored_at: Instant::now(),
                last_touched: clock,
                weight,
            },
        );

        while inner.weight > self.max_weight {
            let Some((_, victim)) = inner.recency.pop_first() else {
                break;
            };
            if let Some(entry) = inner.entries.remove(&victim) {
                inner.weight -= entry.weight;
            }
        }
    }
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("entries", &self.len())
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_token_and_payload() {
        let cache = ResponseCache::new(1024 * 1024);
        cache.set("/docs?id=orders/1", "v1", "payload");

        let hit = cache.get("/docs?id=orders/1").unwrap();
        assert_eq!(hit.token(), "v1");
        assert_eq!(hit.payload().unwrap().as_ref(), "payload");
        assert!(!hit.is_not_found());
        assert!(!hit.might_be_stale());
    }

    #[test]
    fn miss_returns_none() {
        let cache = ResponseCache::new(1024);
        assert!(cache.get("/docs?id=unknown").is_none());
    }

    #[test]
    fn not_found_marker_has_sentinel_token_and_no_payload() {
        let cache = ResponseCache::new(1024);
        cache.set_not_found("/docs?id=orders/404");

        let hit = cache.get("/docs?id=orders/404").unwrap();
        assert_eq!(hit.token(), NOT_FOUND_CHANGE_TOKEN);
        assert!(hit.payload().is_none());
        assert!(hit.is_not_found());
    }

    #[test]
    fn generation_bump_marks_entries_stale() {
        let cache = ResponseCache::new(1024);
        cache.set("/docs?id=orders/1", "v1", "payload");

        cache.invalidate_all();
        assert!(cache.get("/docs?id=orders/1").unwrap().might_be_stale());

        // a fresh write is stamped with the new generation
        cache.set("/docs?id=orders/1", "v2", "payload2");
        assert!(!cache.get("/docs?id=orders/1").unwrap().might_be_stale());
    }

    #[test]
    fn confirm_not_modified_resets_age_and_staleness() {
        let cache = ResponseCache::new(1024);
        cache.set("/docs?id=orders/1", "v1", "payload");
        std::thread::sleep(Duration::from_millis(30));

        let hit = cache.get("/docs?id=orders/1").unwrap();
        assert!(hit.age() >= Duration::from_millis(30));

        cache.invalidate_all();
        cache.confirm_not_modified(&hit);

        let confirmed = cache.get("/docs?id=orders/1").unwrap();
        assert!(confirmed.age() < Duration::from_millis(30));
        assert!(!confirmed.might_be_stale());
    }

    #[test]
    fn confirm_is_a_noop_for_a_replaced_entry() {
        let cache = ResponseCache::new(1024);
        cache.set("/docs?id=orders/1", "v1", "payload");
        let stale_handle = cache.get("/docs?id=orders/1").unwrap();

        cache.set("/docs?id=orders/1", "v2", "payload2");
        cache.confirm_not_modified(&stale_handle);

        assert_eq!(cache.get("/docs?id=orders/1").unwrap().token(), "v2");
    }

    #[test]
    fn evicts_least_recently_used_when_over_weight() {
        // room for two entries and change, not three
        let cache = ResponseCache::new(2 * ENTRY_OVERHEAD_BYTES + 100);
        cache.set("/a", "t", "aaaaaaaaaa");
        cache.set("/b", "t", "bbbbbbbbbb");

        // touch /a so /b becomes the victim
        cache.get("/a");
        cache.set("/c", "t", "cccccccccc");

        assert!(cache.get("/a").is_some());
        assert!(cache.get("/b").is_none());
        assert!(cache.get("/c").is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn overwriting_replaces_weight_instead_of_accumulating() {
        let cache = ResponseCache::new(ENTRY_OVERHEAD_BYTES + 64);
        for _ in 0..100 {
            cache.set("/a", "t", "same-key-over-and-over");
        }
        assert_eq!(cache.len(), 1);
    }
}
