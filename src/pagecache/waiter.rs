//! Wait Index
//!
//! For every `(hash, page_id)` that some reader needs but no tier holds,
//! there is at most one wait entry; concurrent readers attach to it as
//! waiters and exactly one network fetch is in flight. A completing fetch
//! copies each waiter's overlap out of the arriving page and broadcasts.
//!
//! The index is sharded by content hash only, so one file's registrations
//! happen under a single lock and the read path can scan and register a
//! whole page range atomically.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};

/// Number of shard locks
const WAIT_SHARDS: usize = 16;

/// One reader blocked on one page
pub(crate) struct PageWaiter {
    /// Index of the page inside the reader's page range
    pub page_idx: usize,
    /// Byte offset of the wanted slice inside the page
    pub off: u32,
    /// Wanted slice length
    pub size: u32,
    state: Mutex<WaiterState>,
    cond: Condvar,
}

struct WaiterState {
    ready: bool,
    failed: bool,
    data: Vec<u8>,
}

impl PageWaiter {
    pub fn new(page_idx: usize, off: u32, size: u32) -> Arc<Self> {
        Arc::new(Self {
            page_idx,
            off,
            size,
            state: Mutex::new(WaiterState { ready: false, failed: false, data: Vec::new() }),
            cond: Condvar::new(),
        })
    }

    fn fill(&self, page: &[u8]) {
        let off = self.off as usize;
        let want = self.size as usize;
        let got = if off >= page.len() { 0 } else { (page.len() - off).min(want) };
        let mut state = self.state.lock();
        state.data = page[off..off + got].to_vec();
        state.failed = false;
        state.ready = true;
        self.cond.notify_all();
    }

    fn fail(&self) {
        let mut state = self.state.lock();
        state.failed = true;
        state.ready = true;
        self.cond.notify_all();
    }

    /// Block until the page arrives or its fetch fails.
    ///
    /// `Ok` carries the overlap bytes; fewer than `size` bytes means the
    /// underlying page came up short (EOF or truncation).
    pub fn wait(&self) -> Result<Vec<u8>, ()> {
        let mut state = self.state.lock();
        while !state.ready {
            self.cond.wait(&mut state);
        }
        if state.failed {
            Err(())
        } else {
            Ok(std::mem::take(&mut state.data))
        }
    }
}

/// Pending-page registry, sharded by content hash
pub(crate) struct WaitIndex {
    shards: Vec<Mutex<HashMap<(u64, u64), Vec<Arc<PageWaiter>>>>>,
}

/// Lock over one hash's pending pages
pub(crate) type WaitShard<'a> = MutexGuard<'a, HashMap<(u64, u64), Vec<Arc<PageWaiter>>>>;

impl WaitIndex {
    pub fn new() -> Self {
        Self { shards: (0..WAIT_SHARDS).map(|_| Mutex::new(HashMap::new())).collect() }
    }

    /// Lock the shard covering every page of `hash`
    pub fn lock_shard(&self, hash: u64) -> WaitShard<'_> {
        self.shards[hash as usize % WAIT_SHARDS].lock()
    }

    /// Whether a fetch is already pending for the page (shard held)
    pub fn is_pending(shard: &WaitShard<'_>, hash: u64, page_id: u64) -> bool {
        shard.contains_key(&(hash, page_id))
    }

    /// Register interest in a page (shard held).
    ///
    /// Returns `true` when this created the entry, meaning the caller must
    /// arrange the fetch; `false` attaches to an in-flight one.
    pub fn register(
        shard: &mut WaitShard<'_>,
        hash: u64,
        page_id: u64,
        waiter: Option<Arc<PageWaiter>>,
    ) -> bool {
        let created = !shard.contains_key(&(hash, page_id));
        let waiters = shard.entry((hash, page_id)).or_default();
        if let Some(waiter) = waiter {
            waiters.push(waiter);
        }
        created
    }

    /// A page arrived: satisfy and drop its wait entry, if any
    pub fn complete_page(&self, hash: u64, page_id: u64, page: &[u8]) {
        let mut shard = self.lock_shard(hash);
        if let Some(waiters) = shard.remove(&(hash, page_id)) {
            for waiter in waiters {
                waiter.fill(page);
            }
        }
    }

    /// A range failed: error exactly the waiters of its pages
    pub fn fail_range(&self, hash: u64, first_page: u64, page_count: u64) {
        let mut shard = self.lock_shard(hash);
        for page_id in first_page..first_page + page_count {
            if let Some(waiters) = shard.remove(&(hash, page_id)) {
                for waiter in waiters {
                    waiter.fail();
                }
            }
        }
    }
}
