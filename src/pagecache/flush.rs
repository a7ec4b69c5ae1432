//! Flush Cycle and Aging Sweep
//!
//! The flush cycle moves READ pages from the memory tier into the pagefile:
//! pages are written in `(hash, page_id)` order into FREE slots taken in id
//! order, the fsync is delayed while memory pressure is low, and the row
//! table is updated in small committed batches. Disk-tier access updates
//! batched in the ring drain through the same cycle.
//!
//! The aging sweep discards roughly 95% of READ rows in five layered
//! rounds: pure LRU first, then progressively protecting rows with higher
//! use counts. Hot pages survive; pages read once and abandoned go first.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use super::memory::DB_UPDATE_RING;
use super::{unix_now, CacheError, CacheResult, PageCache};
use crate::config::PAGE_SIZE;
use crate::store::{PageRow, SweepEntry, PAGE_TYPE_READ};

const PS: u64 = PAGE_SIZE as u64;

/// Sweep round percentages; the sum (~95%) shrinks the cache each run
const LRU_PCT: usize = 40;
const LRU2_PCT: usize = 25;
const LRU4_PCT: usize = 15;
const LRU8_PCT: usize = 10;
const LRU16_PCT: usize = 5;

/// State guarded by the flush mutex
pub(crate) struct FlushState {
    /// Target slot count of the disk tier
    pub in_pages: u64,
    /// Highest slot id currently in the row table
    pub max_slot: u64,
    /// When the access ring was last drained
    pub last_access_flush: i64,
}

/// State guarded by the clean mutex
pub(crate) struct CleanState {
    /// Readers holding the disk tier stable
    pub stoppers: u32,
    /// Sweeps blocked behind the stoppers
    pub waiters: u32,
}

/// Move memory-tier pages to disk and drain pending row updates.
///
/// `nosleep` skips the fsync delay; it is set when a caller is blocked on
/// a free page.
pub(crate) fn flush_pages(cache: &Arc<PageCache>, nosleep: bool) -> CacheResult<()> {
    let result = flush_pages_inner(cache, nosleep);
    cache.flush_running.store(false, Ordering::Release);
    result
}

fn flush_pages_inner(cache: &Arc<PageCache>, nosleep: bool) -> CacheResult<()> {
    cache.flushed_between_timers.store(true, Ordering::Relaxed);
    let mut fstate = cache.flush.lock();
    let diskfull = check_disk_full(cache, &mut fstate)?;
    let now = unix_now();

    let keys = {
        let mut mem = cache.mem.lock();
        if diskfull && mem.free_count() == 0 && cache.free_db_slots.load(Ordering::Relaxed) == 0 {
            let half = mem.total_pages() / 2;
            let dropped = mem.discard_oldest(half);
            debug!(dropped, "disk full with no spill room, discarded pages");
        }
        mem.begin_flush()
    };

    let mut assigned: Vec<((u64, u64), u64)> = Vec::new();
    if !keys.is_empty() {
        debug!(pages = keys.len(), "flushing cache");
        let slots = cache.store.free_slots(keys.len())?;
        {
            let mut mem = cache.mem.lock();
            for (i, key) in keys.iter().enumerate() {
                if i < slots.len() {
                    assigned.push((*key, slots[i]));
                } else {
                    // No slot for this page; it stays memory-resident.
                    mem.requeue_flushing(key.0, key.1);
                }
            }
        }

        let mut scratch = vec![0u8; PAGE_SIZE];
        for ((hash, page_id), slot) in &assigned {
            let present = {
                let mem = cache.mem.lock();
                mem.copy_flushing(*hash, *page_id, &mut scratch).is_some()
            };
            if !present {
                continue;
            }
            if let Err(err) = write_page_at(cache, &scratch, *slot) {
                error!(%err, "write to cache file failed");
                let mut mem = cache.mem.lock();
                for ((h, p), _) in &assigned {
                    mem.requeue_flushing(*h, *p);
                }
                return Err(err);
            }
        }
        debug!(pages = assigned.len(), "cache data written");

        if !nosleep {
            // fsync blocks reads of the pagefile on several filesystems;
            // wait out low memory pressure before issuing it.
            let total = { cache.mem.lock().total_pages() };
            for _ in 0..200 {
                let free = { cache.mem.lock().free_count() };
                if free < total * 5 / 100 {
                    break;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
        }
        if let Err(err) = cache.pagefile.sync_data() {
            error!(%err, "flush of cache file failed");
            return Err(CacheError::Io(err));
        }
        debug!("cache data synced");
    }

    // Grow the row table toward the configured size while pages spill.
    if fstate.max_slot < fstate.in_pages && !assigned.is_empty() && !diskfull {
        let total_pages = { cache.mem.lock().total_pages() } as u64;
        let want = (fstate.in_pages - fstate.max_slot)
            .min(total_pages)
            .min(assigned.len() as u64);
        if want > 0 {
            fstate.max_slot = cache.store.append_free_rows(want)?;
            cache.free_db_slots.fetch_add(want, Ordering::Relaxed);
            debug!(appended = want, max_slot = fstate.max_slot, "extended the row table");
        }
    }

    let had_pages = !assigned.is_empty();
    let mut flushed = 0u32;
    for batch in assigned.chunks(64) {
        {
            let mut mem = cache.mem.lock();
            for ((hash, page_id), slot) in batch {
                let Some(page) = mem.take_flushing(*hash, *page_id) else {
                    continue;
                };
                let row = PageRow {
                    page_type: PAGE_TYPE_READ,
                    hash: page.hash,
                    page_id: page.page_id,
                    last_use: page.last_use,
                    use_count: page.use_count,
                    size: page.size,
                };
                if cache.store.fill_slot(*slot, &row)? {
                    cache.free_db_slots.fetch_sub(1, Ordering::Relaxed);
                    flushed += 1;
                }
                mem.return_free(page.data);
            }
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    if had_pages {
        debug!(
            flushed,
            free_db = cache.free_db_slots.load(Ordering::Relaxed),
            "flushed pages to the cache file"
        );
    }

    // Drain the access-update ring when it is worth a write burst.
    let updates = {
        let mut mem = cache.mem.lock();
        let count = mem.pending_updates() as usize;
        if count > 0
            && (had_pages || count >= DB_UPDATE_RING / 4 || fstate.last_access_flush + 300 < now)
        {
            mem.drain_updates()
        } else {
            Vec::new()
        }
    };
    if !updates.is_empty() {
        for batch in updates.chunks(128) {
            for update in batch {
                cache.store.bump_access(update.slot, update.last_use, update.use_delta)?;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        debug!(count = updates.len(), "flushed access records");
        fstate.last_access_flush = now;
    }

    cache.store.sync()?;
    drop(fstate);

    if cache.free_db_slots.load(Ordering::Relaxed) <= 2 * cache.cfg.cache_pages() as u64 {
        let cache = cache.clone();
        std::thread::spawn(move || clean_cache(&cache));
    }
    Ok(())
}

fn write_page_at(cache: &PageCache, data: &[u8], slot: u64) -> CacheResult<()> {
    use std::os::unix::fs::FileExt;
    cache.pagefile.write_all_at(data, slot * PS)?;
    Ok(())
}

/// Shrink the row table when the cache volume runs out of space.
///
/// Returns whether the disk is currently full.
pub(crate) fn check_disk_full(cache: &PageCache, fstate: &mut FlushState) -> CacheResult<bool> {
    fstate.max_slot = cache.store.max_slot()?;
    let file_size = cache.pagefile.metadata()?.len();
    if file_size >= fstate.max_slot * PS {
        return Ok(false);
    }
    let Ok(free_space) = fs2::available_space(&cache.cfg.cache_dir) else {
        return Ok(false);
    };
    let reserve = cache.cfg.min_free_space;
    if reserve + fstate.max_slot * PS - file_size <= free_space {
        cache.local_full.store(false, Ordering::Relaxed);
        return Ok(false);
    }
    warn!(free_space, reserve, "local disk is full");
    cache.local_full.store(true, Ordering::Relaxed);
    let max_slot = if reserve >= free_space {
        file_size / PS
    } else {
        (file_size + free_space - reserve) / PS
    };
    cache.store.delete_rows_above(max_slot)?;
    cache
        .free_db_slots
        .store(cache.store.count_free_slots()?, Ordering::Relaxed);
    fstate.max_slot = max_slot;
    debug!(
        free_db = cache.free_db_slots.load(Ordering::Relaxed),
        max_slot, "shrunk the disk tier"
    );
    Ok(true)
}

fn cmp_threshold(a: &SweepEntry, b: &SweepEntry, threshold: u32) -> std::cmp::Ordering {
    match (a.use_count >= threshold, b.use_count >= threshold) {
        (true, false) => std::cmp::Ordering::Greater,
        (false, true) => std::cmp::Ordering::Less,
        _ => a.last_use.cmp(&b.last_use),
    }
}

/// The aging sweep: discard cold disk-tier rows in layered LRU/LFU rounds
pub(crate) fn clean_cache(cache: &Arc<PageCache>) {
    debug!(
        free_db = cache.free_db_slots.load(Ordering::Relaxed),
        "cleaning cache"
    );
    let Some(mut cstate) = cache.clean.try_lock() else {
        debug!("cache clean already in progress, skipping");
        return;
    };
    while cstate.stoppers > 0 {
        cstate.waiters += 1;
        cache.clean_cond.wait(&mut cstate);
        cstate.waiters -= 1;
        if cstate.waiters > 0 {
            // Leave the last waiter to do the job.
            return;
        }
    }

    let mut entries = match cache.store.sweep_entries() {
        Ok(entries) => entries,
        Err(err) => {
            error!(%err, "could not load sweep entries");
            return;
        }
    };
    let original = entries.len();
    let mut cnt = original;
    debug!(count = original, "read sweep entries");

    entries[..cnt].sort_unstable_by(|a, b| a.last_use.cmp(&b.last_use));
    cnt = cnt.saturating_sub(LRU_PCT * original / 100);
    entries[..cnt].sort_unstable_by(|a, b| cmp_threshold(a, b, 2));
    cnt = cnt.saturating_sub(LRU2_PCT * original / 100);
    entries[..cnt].sort_unstable_by(|a, b| cmp_threshold(a, b, 4));
    cnt = cnt.saturating_sub(LRU4_PCT * original / 100);
    entries[..cnt].sort_unstable_by(|a, b| cmp_threshold(a, b, 8));
    cnt = cnt.saturating_sub(LRU8_PCT * original / 100);
    entries[..cnt].sort_unstable_by(|a, b| cmp_threshold(a, b, 16));
    cnt = cnt.saturating_sub(LRU16_PCT * original / 100);
    debug!(erase = cnt, "sweep rounds done");

    for batch in entries[..cnt].chunks(256) {
        for entry in batch {
            if let Err(err) = cache.store.free_slot(entry.slot) {
                error!(%err, "sweep failed to free a slot");
                return;
            }
            cache.free_db_slots.fetch_add(1, Ordering::Relaxed);
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    drop(cstate);
    let _ = cache.store.sync();
    debug!(
        free_db = cache.free_db_slots.load(Ordering::Relaxed),
        "finished cleaning cache"
    );
}

/// Background timer: flush when nothing else has within the interval
pub(crate) fn timer_loop(cache: Arc<PageCache>, rx: crossbeam_channel::Receiver<()>) {
    let interval = Duration::from_secs(cache.cfg.flush_interval_secs.max(1));
    loop {
        match rx.recv_timeout(interval) {
            Ok(()) | Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
        }
        if !cache.flushed_between_timers.swap(false, Ordering::Relaxed) {
            let dirty = {
                let mem = cache.mem.lock();
                mem.resident_count() > 0 || mem.pending_updates() > 0
            };
            if dirty {
                if let Err(err) = flush_pages(&cache, false) {
                    error!(%err, "timed flush failed");
                }
            }
        }
    }
    debug!("flush timer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(slot: u64, last_use: i64, use_count: u32) -> SweepEntry {
        SweepEntry { slot, last_use, use_count }
    }

    #[test]
    fn test_threshold_cmp_protects_hot_rows() {
        let hot = entry(1, 10, 20);
        let cold = entry(2, 500, 1);
        // The hot row sorts after the cold one despite being older.
        assert_eq!(cmp_threshold(&hot, &cold, 16), std::cmp::Ordering::Greater);
        assert_eq!(cmp_threshold(&cold, &hot, 16), std::cmp::Ordering::Less);
        // Below the threshold it falls back to age.
        assert_eq!(cmp_threshold(&hot, &cold, 32), std::cmp::Ordering::Less);
    }
}
