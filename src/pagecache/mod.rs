//! Read Page Cache
//!
//! A two-tier content cache serving range reads for remote file versions.
//! Pages are fixed-size slabs keyed by `(hash, page_id)` — the hash is the
//! server-assigned content identifier, so a modified file can never alias
//! stale pages. The memory tier is a preallocated pool; the disk tier is a
//! single pagefile with a row table recording residency. Every page lives
//! in at most one tier at a time.
//!
//! Concurrent readers of the same missing page coalesce on a wait entry
//! behind exactly one network fetch. Sequential access drives speculative
//! readahead. A background cycle spills memory pages to disk and ages the
//! disk tier down when it fills.

mod fetch;
mod flush;
mod memory;
mod promote;
mod readahead;
mod urls;
mod waiter;

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::api::{ApiClient, ContentHost};
use crate::config::{CoreConfig, PAGE_SIZE};
use crate::keycache::CacheManager;
use crate::store::{MetaStore, PageTaskRow, StoreError, PAGE_TASK_CREAT, PAGE_TASK_MODIFY};
use fetch::{FetchRange, FetchRequest};
use flush::{CleanState, FlushState};
use memory::MemTier;
use readahead::StreamSet;
use urls::UrlCache;
use waiter::{PageWaiter, WaitIndex, WaitShard};

const PS: u64 = PAGE_SIZE as u64;

/// Page cache errors
#[derive(Debug, Error)]
pub enum CacheError {
    /// Pagefile or staging-file I/O failed
    #[error("Page cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A fetch failed; the affected read cannot be served
    #[error("I/O error serving a cached read")]
    Eio,

    /// Metadata store failure
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result alias for page cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// Per-open-file read state: identity plus readahead tracking.
///
/// The filesystem front-end creates one per open and shares it across that
/// open's reads.
pub struct OpenFile {
    pub(crate) file_id: u64,
    pub(crate) hash: u64,
    pub(crate) initial_size: u64,
    pub(crate) streams: Mutex<StreamSet>,
    pub(crate) current_speed: AtomicU64,
    pub(crate) running_reads: AtomicU32,
}

impl OpenFile {
    /// Remote file id
    pub fn file_id(&self) -> u64 {
        self.file_id
    }

    /// Content hash of the opened version
    pub fn hash(&self) -> u64 {
        self.hash
    }

    /// File size at open time
    pub fn initial_size(&self) -> u64 {
        self.initial_size
    }

    fn record_transfer(&self, bytes: u64, elapsed: Duration) {
        let millis = (elapsed.as_millis() as u64).max(1);
        let instantaneous = bytes.saturating_mul(1000) / millis;
        let old = self.current_speed.load(Ordering::Relaxed);
        self.current_speed
            .store((old + instantaneous) / 2, Ordering::Relaxed);
    }

    fn fetch_finished(&self) {
        self.running_reads.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The two-tier read cache
pub struct PageCache {
    pub(crate) cfg: CoreConfig,
    pub(crate) api: Arc<dyn ApiClient>,
    pub(crate) content: Arc<dyn ContentHost>,
    pub(crate) store: Arc<MetaStore>,
    pub(crate) keycache: Arc<CacheManager>,
    pub(crate) mem: Mutex<MemTier>,
    pub(crate) wait: WaitIndex,
    pub(crate) urls: UrlCache,
    pub(crate) pagefile: File,
    pub(crate) flush: Mutex<FlushState>,
    pub(crate) free_db_slots: AtomicU64,
    pub(crate) clean: Mutex<CleanState>,
    pub(crate) clean_cond: Condvar,
    pub(crate) local_full: AtomicBool,
    pub(crate) flush_running: AtomicBool,
    pub(crate) flushed_between_timers: AtomicBool,
    pub(crate) promote_running: AtomicBool,
    timer_tx: crossbeam_channel::Sender<()>,
    weak: Weak<PageCache>,
}

impl PageCache {
    /// Open the cache: recover the disk tier, preallocate the memory pool
    /// and start the background flush timer.
    pub fn open(
        cfg: CoreConfig,
        api: Arc<dyn ApiClient>,
        content: Arc<dyn ContentHost>,
        store: Arc<MetaStore>,
        keycache: Arc<CacheManager>,
    ) -> CacheResult<Arc<Self>> {
        std::fs::create_dir_all(&cfg.cache_dir)?;
        let pagefile_path = cfg.pagefile_path();
        let existed = pagefile_path.exists();
        let pagefile = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&pagefile_path)?;
        if existed {
            // Rows pointing past the pagefile's end are leftovers of an
            // interrupted flush.
            let valid_slots = pagefile.metadata()?.len() / PS;
            store.delete_rows_above(valid_slots)?;
        } else {
            store.delete_rows_above(0)?;
        }

        let in_pages = cfg.disk_cache_pages();
        let mut max_slot = store.max_slot()?;
        if max_slot < in_pages {
            let add = (in_pages - max_slot).min(cfg.cache_pages() as u64 * 4);
            if add > 0 {
                max_slot = store.append_free_rows(add)?;
                debug!(appended = add, max_slot, "seeded free rows");
            }
        }
        let free_db = store.count_free_slots()?;

        let (timer_tx, timer_rx) = crossbeam_channel::bounded(1);
        let cache = Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            mem: Mutex::new(MemTier::new(cfg.cache_pages())),
            wait: WaitIndex::new(),
            urls: UrlCache::new(),
            pagefile,
            flush: Mutex::new(FlushState { in_pages, max_slot, last_access_flush: 0 }),
            free_db_slots: AtomicU64::new(free_db),
            clean: Mutex::new(CleanState { stoppers: 0, waiters: 0 }),
            clean_cond: Condvar::new(),
            local_full: AtomicBool::new(false),
            flush_running: AtomicBool::new(false),
            flushed_between_timers: AtomicBool::new(false),
            promote_running: AtomicBool::new(false),
            timer_tx,
            cfg,
            api,
            content,
            store,
            keycache,
        });

        if max_slot > in_pages {
            cache.resize_disk_cache(cache.cfg.disk_cache_size)?;
        }
        {
            let mut fstate = cache.flush.lock();
            let _ = flush::check_disk_full(&cache, &mut fstate)?;
        }
        if cache.store.page_task_count() > 0 {
            promote::spawn_worker_if_idle(&cache);
        }
        {
            let cache = cache.clone();
            std::thread::spawn(move || flush::timer_loop(cache, timer_rx));
        }
        Ok(cache)
    }

    /// Strong handle to this cache, for handing work to other threads.
    ///
    /// Cannot fail while a caller holds the cache at all: the weak
    /// reference is seeded at construction and outlives every method call.
    fn handle(&self) -> Arc<PageCache> {
        self.weak.upgrade().expect("page cache handle alive during calls")
    }

    /// Create the read state for one open of a file version
    pub fn open_file(&self, file_id: u64, hash: u64, initial_size: u64) -> Arc<OpenFile> {
        Arc::new(OpenFile {
            file_id,
            hash,
            initial_size,
            streams: Mutex::new(StreamSet::new()),
            current_speed: AtomicU64::new(0),
            running_reads: AtomicU32::new(0),
        })
    }

    /// Serve a range read.
    ///
    /// Returns the longest prefix of the requested region that was
    /// produced; short only at end of file or after a truncated page.
    pub fn read(&self, of: &Arc<OpenFile>, offset: u64, buf: &mut [u8]) -> CacheResult<usize> {
        let initial_size = of.initial_size;
        let hash = of.hash;
        if offset >= initial_size || buf.is_empty() {
            return Ok(0);
        }
        let mut size = (buf.len() as u64).min(initial_size - offset) as usize;
        let poffset = offset & !(PS - 1);
        let page_off = (offset - poffset) as usize;
        let psize = (((size + page_off) as u64 - 1) | (PS - 1)) + 1;
        let page_cnt = (psize / PS) as usize;
        let first_page = poffset / PS;
        let now = unix_now();

        let mut waiting: Vec<Arc<PageWaiter>> = Vec::new();
        let mut ranges: Vec<FetchRange> = Vec::new();
        {
            let mut shard = self.wait.lock_shard(hash);
            for i in 0..page_cnt {
                let (copy_off, copy_size, buf_start) = if i == 0 {
                    (page_off, size.min(PAGE_SIZE - page_off), 0usize)
                } else {
                    let start = i * PAGE_SIZE - page_off;
                    (0, (size - start).min(PAGE_SIZE), start)
                };
                let page_id = first_page + i as u64;
                let dest = &mut buf[buf_start..buf_start + copy_size];
                let got = {
                    let mut mem = self.mem.lock();
                    mem.lookup_copy(hash, page_id, dest, copy_off, now)
                };
                let got = match got {
                    Some(n) => Some(n),
                    None => self.check_disk(hash, page_id, dest, copy_off)?,
                };
                if let Some(n) = got {
                    if n == copy_size {
                        continue;
                    }
                    // The page ended early: the read stops here.
                    size = if i > 0 { i * PAGE_SIZE + n - page_off } else { n };
                    break;
                }
                debug!(page_id, "page not resident");
                let waiter = PageWaiter::new(i, copy_off as u32, copy_size as u32);
                waiting.push(waiter.clone());
                if WaitIndex::register(&mut shard, hash, page_id, Some(waiter)) {
                    extend_ranges(&mut ranges, page_id);
                }
            }
            if let Err(err) = self.plan_readahead(of, &mut shard, poffset, psize, &mut ranges, now) {
                warn!(%err, "readahead planning failed");
            }
        }

        if !ranges.is_empty() {
            of.running_reads.fetch_add(1, Ordering::AcqRel);
            let request = FetchRequest { of: of.clone(), ranges: ranges.clone() };
            let cache = self.handle();
            std::thread::spawn(move || fetch::run(cache, request));
            if waiting.is_empty() {
                return Ok(size);
            }
        }

        let mut result = size;
        let mut failed = false;
        for waiter in &waiting {
            debug!(page_idx = waiter.page_idx, "waiting for page");
            match waiter.wait() {
                Err(()) => failed = true,
                Ok(data) => {
                    let got = data.len();
                    let start = if waiter.page_idx == 0 {
                        0
                    } else {
                        waiter.page_idx * PAGE_SIZE - page_off
                    };
                    buf[start..start + got].copy_from_slice(&data);
                    if got < waiter.size as usize {
                        let end = if waiter.page_idx == 0 {
                            got
                        } else {
                            waiter.page_idx * PAGE_SIZE + got - page_off
                        };
                        result = result.min(end);
                    }
                }
            }
        }
        if failed {
            return Err(CacheError::Eio);
        }
        Ok(result)
    }

    fn plan_readahead(
        &self,
        of: &Arc<OpenFile>,
        shard: &mut WaitShard<'_>,
        poffset: u64,
        psize: u64,
        ranges: &mut Vec<FetchRange>,
        now: i64,
    ) -> CacheResult<()> {
        let has_range = !ranges.is_empty();
        let span = {
            let mut streams = of.streams.lock();
            streams.plan(
                poffset,
                psize,
                of.initial_size,
                of.current_speed.load(Ordering::Relaxed),
                of.running_reads.load(Ordering::Relaxed),
                has_range,
                now,
            )
        };
        let Some(span) = span else {
            return Ok(());
        };
        let in_db: HashSet<u64> = self
            .store
            .pages_in_range(of.hash, span.first_page, span.page_count)?
            .into_iter()
            .map(|(page_id, _)| page_id)
            .collect();
        for i in 0..span.page_count {
            let page_id = span.first_page + i;
            if in_db.contains(&page_id) {
                continue;
            }
            if self.mem.lock().contains(of.hash, page_id) {
                continue;
            }
            if WaitIndex::is_pending(shard, of.hash, page_id) {
                continue;
            }
            WaitIndex::register(shard, of.hash, page_id, None);
            extend_ranges(ranges, page_id);
        }
        Ok(())
    }

    /// Copy-out read from the disk tier; clamps to the row's valid size
    fn check_disk(
        &self,
        hash: u64,
        page_id: u64,
        out: &mut [u8],
        off: usize,
    ) -> CacheResult<Option<usize>> {
        use std::os::unix::fs::FileExt;
        let Some((slot, row)) = self.store.find_page(hash, page_id)? else {
            return Ok(None);
        };
        let valid = row.size as usize;
        let len = if off >= valid { 0 } else { out.len().min(valid - off) };
        if len > 0 {
            if let Err(err) = self.pagefile.read_exact_at(&mut out[..len], slot * PS + off as u64) {
                error!(slot, %err, "failed to read from the cache file, dropping the row");
                self.store.free_slot(slot)?;
                return Ok(None);
            }
        }
        let ring_crowded = self.mem.lock().mark_disk_access(slot, unix_now());
        if ring_crowded && !self.flush_running.swap(true, Ordering::AcqRel) {
            // Drain the ring before it starts dropping merges.
            let cache = self.handle();
            std::thread::spawn(move || {
                if let Err(err) = flush::flush_pages(&cache, true) {
                    error!(%err, "access-ring flush failed");
                }
            });
        }
        Ok(Some(len))
    }

    // ------------------------------------------------------------------
    // Promotion entry points (called after an upload completes)
    // ------------------------------------------------------------------

    /// Queue promotion of a newly uploaded file's staging data
    pub fn promote_new_file(&self, task_id: u64, hash: u64) -> CacheResult<()> {
        promote::enqueue(
            &self.handle(),
            PageTaskRow { kind: PAGE_TASK_CREAT, task_id, hash, old_hash: 0 },
        )
    }

    /// Queue promotion of a modified file's staging data
    pub fn promote_modified_file(&self, task_id: u64, hash: u64, old_hash: u64) -> CacheResult<()> {
        promote::enqueue(
            &self.handle(),
            PageTaskRow { kind: PAGE_TASK_MODIFY, task_id, hash, old_hash },
        )
    }

    // ------------------------------------------------------------------
    // Whole-file helpers for the filesystem front-end
    // ------------------------------------------------------------------

    /// Whether every page of `(hash, size)` is resident in some tier
    pub fn has_all_pages(&self, hash: u64, size: u64) -> CacheResult<bool> {
        let page_cnt = (size + PS - 1) / PS;
        let in_db: HashSet<u64> = self
            .store
            .pages_in_range(hash, 0, page_cnt)?
            .into_iter()
            .map(|(page_id, _)| page_id)
            .collect();
        let mem = self.mem.lock();
        for page_id in 0..page_cnt {
            if !in_db.contains(&page_id) && !mem.contains(hash, page_id) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Materialize a fully cached file version into `dst`
    pub fn copy_all_pages_to(&self, dst: &File, hash: u64, size: u64) -> CacheResult<()> {
        use std::os::unix::fs::FileExt;
        let page_cnt = (size + PS - 1) / PS;
        let mut buf = vec![0u8; PAGE_SIZE];
        let now = unix_now();
        for page_id in 0..page_cnt {
            let got = {
                let mut mem = self.mem.lock();
                mem.lookup_copy(hash, page_id, &mut buf, 0, now)
            };
            let got = match got {
                Some(n) => n,
                None => self.check_disk(hash, page_id, &mut buf, 0)?.ok_or(CacheError::Eio)?,
            };
            dst.write_all_at(&buf[..got], page_id * PS)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Spill memory pages and drain pending row updates now
    pub fn flush(&self) -> CacheResult<()> {
        flush::flush_pages(&self.handle(), true)
    }

    /// Hold the disk tier stable (blocks the aging sweep).
    ///
    /// Returns `false` when a sweep is running; pair successes with
    /// [`unlock_pages`](Self::unlock_pages).
    pub fn lock_pages(&self) -> bool {
        let Some(mut cstate) = self.clean.try_lock() else {
            return false;
        };
        cstate.stoppers += 1;
        true
    }

    /// Release a [`lock_pages`](Self::lock_pages) hold
    pub fn unlock_pages(&self) {
        let mut cstate = self.clean.lock();
        cstate.stoppers -= 1;
        if cstate.stoppers == 0 && cstate.waiters > 0 {
            self.clean_cond.notify_all();
        }
    }

    /// Change the disk tier's target size
    pub fn resize_disk_cache(&self, bytes: u64) -> CacheResult<()> {
        let mut fstate = self.flush.lock();
        fstate.in_pages = bytes / PS;
        fstate.max_slot = self.store.max_slot()?;
        if fstate.max_slot > fstate.in_pages {
            self.store.delete_rows_above(fstate.in_pages)?;
            fstate.max_slot = fstate.in_pages;
            if self.pagefile.metadata()?.len() > fstate.in_pages * PS {
                self.pagefile.set_len(fstate.in_pages * PS)?;
                debug!(pages = fstate.in_pages, "shrunk the pagefile");
            }
            self.free_db_slots
                .store(self.store.count_free_slots()?, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Drop the entire disk tier (logout)
    pub fn clear_disk_cache(&self) -> CacheResult<()> {
        let mut fstate = self.flush.lock();
        self.pagefile.set_len(0)?;
        self.store.delete_rows_above(0)?;
        fstate.max_slot = 0;
        self.free_db_slots.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Whether the cache volume is out of space
    pub fn is_local_full(&self) -> bool {
        self.local_full.load(Ordering::Relaxed)
    }

    /// Final flush and timer stop; call before dropping the last handle
    pub fn shutdown(&self) {
        if let Err(err) = flush::flush_pages(&self.handle(), true) {
            error!(%err, "final flush failed");
        }
        let _ = self.timer_tx.send(());
    }
}

/// Take a buffer from the pool, spilling or waiting as needed
pub(crate) fn get_free_page(cache: &Arc<PageCache>) -> Box<[u8]> {
    loop {
        {
            let mut mem = cache.mem.lock();
            if mem.free_count() <= mem.total_pages() / 10
                && !cache.flush_running.swap(true, Ordering::AcqRel)
            {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    if let Err(err) = flush::flush_pages(&cache, false) {
                        error!(%err, "background flush failed");
                    }
                });
            }
            if let Some(buf) = mem.take_free() {
                return buf;
            }
        }
        debug!("no free pages, flushing cache");
        if let Err(err) = flush::flush_pages(cache, true) {
            error!(%err, "flush for free page failed");
        }
        {
            let mut mem = cache.mem.lock();
            if let Some(buf) = mem.take_free() {
                return buf;
            }
        }
        debug!("no free pages after flush, sleeping");
        std::thread::sleep(Duration::from_millis(200));
    }
}

/// Read a full page from the disk tier; `out` must hold a page
pub(crate) fn read_disk_page(
    cache: &PageCache,
    hash: u64,
    page_id: u64,
    out: &mut [u8],
) -> CacheResult<Option<u32>> {
    use std::os::unix::fs::FileExt;
    let Some((slot, row)) = cache.store.find_page(hash, page_id)? else {
        return Ok(None);
    };
    let valid = row.size as usize;
    if valid > 0 {
        if let Err(err) = cache.pagefile.read_exact_at(&mut out[..valid], slot * PS) {
            error!(slot, %err, "failed to read from the cache file, dropping the row");
            cache.store.free_slot(slot)?;
            return Ok(None);
        }
    }
    cache.mem.lock().mark_disk_access(slot, unix_now());
    Ok(Some(row.size))
}

fn extend_ranges(ranges: &mut Vec<FetchRange>, page_id: u64) {
    if let Some(last) = ranges.last_mut() {
        if last.offset + last.length == page_id * PS {
            last.length += PS;
            return;
        }
    }
    ranges.push(FetchRange { offset: page_id * PS, length: PS });
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
