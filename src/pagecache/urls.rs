//! URL Bundle Cache
//!
//! `getfilelink` results are cached per content hash. Two threads racing on
//! the same hash cooperate: the first inserts a pending slot and performs
//! the fetch, followers block on the slot's condition variable until it is
//! ready or failed. Released bundles with more than an hour of validity
//! left are parked in the cache manager under a `URLS<hash>` key so a
//! reopened file skips the API round trip.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::api::UrlBundle;
use crate::keycache::CacheManager;

/// Bundles this close to expiry are not worth re-caching
const RECACHE_MARGIN_SECS: i64 = 3600;

enum SlotStatus {
    Pending,
    Ready(UrlBundle),
    Failed,
}

struct SlotState {
    status: SlotStatus,
    refs: u32,
}

pub(crate) struct UrlSlot {
    state: Mutex<SlotState>,
    cond: Condvar,
}

/// Outcome of [`UrlCache::acquire`]
pub(crate) enum Acquire {
    /// A ready bundle; pair with [`UrlCache::release`]
    Ready(Arc<UrlSlot>, UrlBundle),
    /// The caller owns the fetch; resolve with `fulfill` or `fail`
    Fetch(Arc<UrlSlot>),
    /// The in-flight fetch failed; the caller may retry with `acquire`
    Failed,
}

/// Per-hash URL bundle cooperation
pub(crate) struct UrlCache {
    slots: Mutex<HashMap<u64, Arc<UrlSlot>>>,
}

impl UrlCache {
    pub fn new() -> Self {
        Self { slots: Mutex::new(HashMap::new()) }
    }

    /// Join or start the bundle resolution for `hash`
    pub fn acquire(&self, hash: u64) -> Acquire {
        let slot = {
            let mut slots = self.slots.lock();
            match slots.get(&hash) {
                Some(slot) => slot.clone(),
                None => {
                    let slot = Arc::new(UrlSlot {
                        state: Mutex::new(SlotState { status: SlotStatus::Pending, refs: 1 }),
                        cond: Condvar::new(),
                    });
                    slots.insert(hash, slot.clone());
                    return Acquire::Fetch(slot);
                }
            }
        };
        let mut state = slot.state.lock();
        state.refs += 1;
        while matches!(state.status, SlotStatus::Pending) {
            slot.cond.wait(&mut state);
        }
        match &state.status {
            SlotStatus::Ready(bundle) => {
                let bundle = bundle.clone();
                drop(state);
                Acquire::Ready(slot, bundle)
            }
            _ => {
                state.refs -= 1;
                drop(state);
                Acquire::Failed
            }
        }
    }

    /// The owning fetch succeeded; wake followers
    pub fn fulfill(&self, slot: &Arc<UrlSlot>, bundle: UrlBundle) {
        let mut state = slot.state.lock();
        state.status = SlotStatus::Ready(bundle);
        slot.cond.notify_all();
    }

    /// The owning fetch failed; wake followers and detach the slot
    pub fn fail(&self, hash: u64, slot: &Arc<UrlSlot>) {
        {
            let mut state = slot.state.lock();
            state.status = SlotStatus::Failed;
            state.refs -= 1;
            slot.cond.notify_all();
        }
        self.detach(hash, slot);
    }

    /// The bundle went stale mid-use (404/410); detach so the next
    /// `acquire` fetches a fresh one
    pub fn invalidate(&self, hash: u64, slot: &Arc<UrlSlot>) {
        debug!(hash, "invalidating URL bundle");
        let mut state = slot.state.lock();
        state.status = SlotStatus::Failed;
        drop(state);
        self.detach(hash, slot);
    }

    /// Drop one reference; the last holder parks a still-fresh bundle in
    /// the cache manager
    pub fn release(&self, hash: u64, slot: &Arc<UrlSlot>, keycache: &CacheManager, now: i64) {
        let mut state = slot.state.lock();
        state.refs -= 1;
        if state.refs > 0 {
            return;
        }
        if let SlotStatus::Ready(bundle) = &state.status {
            let remaining = bundle.expires - now;
            if remaining > RECACHE_MARGIN_SECS {
                keycache.add(
                    &format!("URLS{hash}"),
                    Box::new(bundle.clone()),
                    Duration::from_secs((remaining - RECACHE_MARGIN_SECS) as u64),
                    None,
                    2,
                );
            }
        }
        drop(state);
        self.detach(hash, slot);
    }

    fn detach(&self, hash: u64, slot: &Arc<UrlSlot>) {
        let mut slots = self.slots.lock();
        if let Some(current) = slots.get(&hash) {
            if Arc::ptr_eq(current, slot) {
                slots.remove(&hash);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle(expires: i64) -> UrlBundle {
        UrlBundle { hosts: vec!["c1".into()], path: "/dl/x".into(), expires }
    }

    #[test]
    fn test_first_acquire_owns_fetch() {
        let cache = UrlCache::new();
        match cache.acquire(1) {
            Acquire::Fetch(slot) => cache.fulfill(&slot, bundle(10_000)),
            _ => panic!("expected fetch ownership"),
        }
        match cache.acquire(1) {
            Acquire::Ready(slot, b) => {
                assert_eq!(b.path, "/dl/x");
                cache.release(1, &slot, &CacheManager::new(), 0);
            }
            _ => panic!("expected ready bundle"),
        }
    }

    #[test]
    fn test_followers_wait_for_fetcher() {
        let cache = Arc::new(UrlCache::new());
        let slot = match cache.acquire(2) {
            Acquire::Fetch(slot) => slot,
            _ => panic!(),
        };
        let follower = {
            let cache = cache.clone();
            std::thread::spawn(move || match cache.acquire(2) {
                Acquire::Ready(slot, b) => {
                    cache.release(2, &slot, &CacheManager::new(), 0);
                    b.expires
                }
                _ => panic!("follower should see the ready bundle"),
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        cache.fulfill(&slot, bundle(42));
        assert_eq!(follower.join().unwrap(), 42);
    }

    #[test]
    fn test_failed_fetch_wakes_followers() {
        let cache = Arc::new(UrlCache::new());
        let slot = match cache.acquire(3) {
            Acquire::Fetch(slot) => slot,
            _ => panic!(),
        };
        let follower = {
            let cache = cache.clone();
            std::thread::spawn(move || matches!(cache.acquire(3), Acquire::Failed))
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        cache.fail(3, &slot);
        assert!(follower.join().unwrap());
        // The slot is detached; a new acquire starts over.
        assert!(matches!(cache.acquire(3), Acquire::Fetch(_)));
    }

    #[test]
    fn test_release_parks_fresh_bundle() {
        let cache = UrlCache::new();
        let keycache = CacheManager::new();
        let slot = match cache.acquire(4) {
            Acquire::Fetch(slot) => slot,
            _ => panic!(),
        };
        cache.fulfill(&slot, bundle(10_000));
        cache.release(4, &slot, &keycache, 0);
        assert!(keycache.get_as::<UrlBundle>("URLS4").is_some());
    }

    #[test]
    fn test_release_skips_stale_bundle() {
        let cache = UrlCache::new();
        let keycache = CacheManager::new();
        let slot = match cache.acquire(5) {
            Acquire::Fetch(slot) => slot,
            _ => panic!(),
        };
        cache.fulfill(&slot, bundle(100)); // expires within the margin
        cache.release(5, &slot, &keycache, 0);
        assert!(keycache.get_as::<UrlBundle>("URLS5").is_none());
    }
}
