//! Ephemeral Object Registry
//!
//! A process-wide cache for expensive-to-rebuild objects: decrypted
//! symmetric keys, initialized codecs, URL bundles. Entries are
//! single-holder — `get` removes the entry and hands ownership to the
//! caller, who re-inserts with `add` when finished. Expiry is coarse and
//! time-based; this is not an LRU.
//!
//! Every entry carries a release hook that runs when the entry is dropped
//! without being claimed: on displacement, on expiry, and on `clean_all`.
//! Plaintext key material relies on this to be wiped exactly once, on
//! whichever path retires it.

use std::any::Any;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Hook invoked when the registry retires an entry it still owns
pub type ReleaseFn = Box<dyn FnOnce(Box<dyn Any + Send>) + Send>;

struct Entry {
    value: Box<dyn Any + Send>,
    release: Option<ReleaseFn>,
    expires: Instant,
}

impl Entry {
    fn retire(mut self) {
        if let Some(release) = self.release.take() {
            release(self.value);
        }
    }
}

/// Process-wide ephemeral registry keyed by opaque strings
#[derive(Default)]
pub struct CacheManager {
    entries: Mutex<HashMap<String, Vec<Entry>>>,
}

impl CacheManager {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return the freshest unexpired entry under `key`.
    ///
    /// The caller owns the returned object; the release hook is dropped
    /// with the entry and will not run.
    pub fn get(&self, key: &str) -> Option<Box<dyn Any + Send>> {
        let mut entries = self.entries.lock();
        let slot = entries.get_mut(key)?;
        let now = Instant::now();
        let mut claimed = None;
        while let Some(mut entry) = slot.pop() {
            if entry.expires > now {
                entry.release = None;
                claimed = Some(entry.value);
                break;
            }
            entry.retire();
        }
        if slot.is_empty() {
            entries.remove(key);
        }
        claimed
    }

    /// Typed variant of [`get`](Self::get); a type mismatch leaves the
    /// entry untouched in the registry.
    pub fn get_as<T: Send + 'static>(&self, key: &str) -> Option<Box<T>> {
        match self.get(key)?.downcast::<T>() {
            Ok(value) => Some(value),
            Err(value) => {
                // Put it back rather than silently destroying someone
                // else's object; key prefixes make this unreachable in
                // practice.
                self.add(key, value, Duration::from_secs(60), None, 2);
                None
            }
        }
    }

    /// Insert an entry under `key` with the given time to live.
    ///
    /// When the key already holds `max_per_key` entries, the oldest one is
    /// retired through its release hook to make room.
    pub fn add(
        &self,
        key: &str,
        value: Box<dyn Any + Send>,
        ttl: Duration,
        release: Option<ReleaseFn>,
        max_per_key: usize,
    ) {
        let entry = Entry { value, release, expires: Instant::now() + ttl };
        let mut entries = self.entries.lock();
        let slot = entries.entry(key.to_owned()).or_default();
        while slot.len() >= max_per_key.max(1) {
            slot.remove(0).retire();
        }
        slot.push(entry);
    }

    /// Retire every expired entry
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, slot| {
            let mut keep = Vec::with_capacity(slot.len());
            for entry in slot.drain(..) {
                if entry.expires > now {
                    keep.push(entry);
                } else {
                    entry.retire();
                }
            }
            *slot = keep;
            !slot.is_empty()
        });
    }

    /// Retire every entry, expired or not
    pub fn clean_all(&self) {
        let mut entries = self.entries.lock();
        for (_, slot) in entries.drain() {
            for entry in slot {
                entry.retire();
            }
        }
    }

    /// Number of live entries (for diagnostics)
    pub fn len(&self) -> usize {
        self.entries.lock().values().map(Vec::len).sum()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_get_removes_entry() {
        let cache = CacheManager::new();
        cache.add("K1", Box::new(42u32), Duration::from_secs(10), None, 2);
        assert_eq!(cache.get_as::<u32>("K1").as_deref(), Some(&42));
        assert!(cache.get("K1").is_none());
    }

    #[test]
    fn test_expired_entry_is_dropped_on_access() {
        let cache = CacheManager::new();
        cache.add("K1", Box::new(1u32), Duration::from_millis(0), None, 2);
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("K1").is_none());
    }

    #[test]
    fn test_displacement_releases_oldest() {
        let released = Arc::new(AtomicUsize::new(0));
        let cache = CacheManager::new();
        for i in 0..3u32 {
            let counter = released.clone();
            cache.add(
                "K1",
                Box::new(i),
                Duration::from_secs(10),
                Some(Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
                2,
            );
        }
        // Third insert displaced the first.
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_clean_all_runs_release_hooks() {
        let released = Arc::new(AtomicUsize::new(0));
        let cache = CacheManager::new();
        for key in ["A", "B", "C"] {
            let counter = released.clone();
            cache.add(
                key,
                Box::new(0u8),
                Duration::from_secs(10),
                Some(Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
                2,
            );
        }
        cache.clean_all();
        assert_eq!(released.load(Ordering::SeqCst), 3);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_claimed_entry_skips_release_hook() {
        let released = Arc::new(AtomicUsize::new(0));
        let cache = CacheManager::new();
        let counter = released.clone();
        cache.add(
            "K1",
            Box::new(7u32),
            Duration::from_secs(10),
            Some(Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
            2,
        );
        let claimed = cache.get("K1").unwrap();
        drop(claimed);
        cache.clean_all();
        assert_eq!(released.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_type_mismatch_preserves_entry() {
        let cache = CacheManager::new();
        cache.add("K1", Box::new(42u32), Duration::from_secs(10), None, 2);
        assert!(cache.get_as::<String>("K1").is_none());
        assert_eq!(cache.get_as::<u32>("K1").as_deref(), Some(&42));
    }
}
