//! Local-Write Promotion
//!
//! When an upload finishes, the plaintext bytes are already on local disk
//! in a staging file. The promotion worker moves them into the page cache
//! under the server-assigned content hash so the first post-upload read is
//! a hit:
//!
//! - New files stream the staging file page by page into the memory tier.
//! - Modified files consult the persisted written-interval index: pages
//!   the write never touched are promoted by renaming their disk-tier row
//!   from the old hash to the new one (the bytes did not change); fully
//!   rewritten pages come straight from the staging file; pages with both
//!   old and new fragments splice the fresh bytes over the old disk-tier
//!   content.
//!
//! Tasks are durable rows; pending ones resume on the next start.

use std::fs::File;
use std::io::Read;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, error, warn};

use super::memory::PageBuf;
use super::waiter::WaitIndex;
use super::{get_free_page, read_disk_page, unix_now, CacheResult, PageCache};
use crate::config::PAGE_SIZE;
use crate::store::{PageTaskRow, PAGE_TASK_CREAT, PAGE_TASK_MODIFY};

const PS: u64 = PAGE_SIZE as u64;

/// Queue a promotion task and make sure the worker runs
pub(crate) fn enqueue(cache: &Arc<PageCache>, row: PageTaskRow) -> CacheResult<()> {
    cache.store.push_page_task(&row)?;
    spawn_worker_if_idle(cache);
    Ok(())
}

/// Start the promotion worker unless one is already draining the queue
pub(crate) fn spawn_worker_if_idle(cache: &Arc<PageCache>) {
    if !cache.promote_running.swap(true, Ordering::AcqRel) {
        let cache = cache.clone();
        std::thread::spawn(move || worker(&cache));
    }
}

fn worker(cache: &Arc<PageCache>) {
    loop {
        let mut healthy = true;
        loop {
            let task = match cache.store.first_page_task() {
                Ok(Some(task)) => task,
                Ok(None) => break,
                Err(err) => {
                    error!(%err, "could not read promotion queue");
                    healthy = false;
                    break;
                }
            };
            let (id, row) = task;
            match row.kind {
                PAGE_TASK_CREAT => promote_new(cache, row.task_id, row.hash),
                PAGE_TASK_MODIFY => promote_modified(cache, row.task_id, row.hash, row.old_hash),
                other => warn!(other, "unknown promotion task kind"),
            }
            if let Err(err) = cache.store.delete_page_task(id) {
                error!(%err, "could not retire promotion task");
                healthy = false;
                break;
            }
        }
        cache.promote_running.store(false, Ordering::Release);
        // A task enqueued after the empty check would be stranded; claim
        // the flag back and drain again.
        if !healthy
            || cache.store.page_task_count() == 0
            || cache.promote_running.swap(true, Ordering::AcqRel)
        {
            break;
        }
    }
}

/// Insert a page unless any tier, or an in-flight fetch, already has it
fn add_page_if_not_exists(cache: &PageCache, page: PageBuf) {
    let shard = cache.wait.lock_shard(page.hash);
    let mut mem = cache.mem.lock();
    let present = mem.contains(page.hash, page.page_id)
        || WaitIndex::is_pending(&shard, page.hash, page.page_id)
        || matches!(cache.store.find_page(page.hash, page.page_id), Ok(Some(_)));
    if present {
        mem.return_free(page.data);
    } else {
        mem.insert(page);
    }
}

fn read_full(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = file.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

fn remove_staging(cache: &PageCache, task_id: u64, with_index: bool) {
    let _ = std::fs::remove_file(cache.cfg.staging_data_path(task_id));
    if with_index {
        let _ = std::fs::remove_file(cache.cfg.staging_index_path(task_id));
    }
}

/// Promote a freshly uploaded new file
fn promote_new(cache: &Arc<PageCache>, task_id: u64, hash: u64) {
    let path = cache.cfg.staging_data_path(task_id);
    debug!(?path, hash, "promoting uploaded file into cache");
    let mut file = match File::open(&path) {
        Ok(file) => file,
        Err(err) => {
            error!(?path, %err, "could not open staging file, skipping");
            remove_staging(cache, task_id, false);
            return;
        }
    };
    let now = unix_now();
    let mut page_id = 0u64;
    loop {
        let mut data = get_free_page(cache);
        let got = match read_full(&mut file, &mut data) {
            Ok(got) => got,
            Err(err) => {
                error!(%err, "staging file read failed");
                cache.mem.lock().return_free(data);
                break;
            }
        };
        if got == 0 {
            cache.mem.lock().return_free(data);
            break;
        }
        let mut page = PageBuf::new(data, hash, page_id, got as u32, now);
        page.use_count = 1;
        add_page_if_not_exists(cache, page);
        if got < PAGE_SIZE {
            break;
        }
        page_id += 1;
    }
    remove_staging(cache, task_id, false);
}

fn load_intervals(path: &std::path::Path) -> Option<Vec<(u64, u64)>> {
    let file = File::open(path).ok()?;
    let mut intervals: Vec<(u64, u64)> = bincode::deserialize_from(file).ok()?;
    intervals.sort_unstable();
    Some(intervals)
}

/// Promote a modified file using its written-interval index
fn promote_modified(cache: &Arc<PageCache>, task_id: u64, hash: u64, old_hash: u64) {
    use std::os::unix::fs::FileExt;
    let data_path = cache.cfg.staging_data_path(task_id);
    let index_path = cache.cfg.staging_index_path(task_id);
    debug!(?data_path, hash, old_hash, "promoting modified blocks into cache");
    let Some(intervals) = load_intervals(&index_path) else {
        error!(?index_path, "could not load written-interval index, skipping");
        remove_staging(cache, task_id, true);
        return;
    };
    let file = match File::open(&data_path) {
        Ok(file) => file,
        Err(err) => {
            error!(?data_path, %err, "could not open staging file, skipping");
            remove_staging(cache, task_id, true);
            return;
        }
    };
    let file_size = match file.metadata() {
        Ok(meta) => meta.len(),
        Err(_) => 0,
    };
    let now = unix_now();
    let mut iv = 0usize;
    let mut off = 0u64;
    while off < file_size {
        let page_id = off / PS;
        while iv < intervals.len() && intervals[iv].1 <= off {
            iv += 1;
        }
        let overlap = intervals.get(iv).copied().filter(|(from, _)| *from < off + PS);
        match overlap {
            None => {
                // Untouched page: alias the old row to the new hash.
                match cache.store.rename_page_hash(old_hash, hash, page_id) {
                    Ok(_) => {}
                    Err(err) => warn!(%err, page_id, "hash rename failed"),
                }
            }
            Some((from, to)) if from <= off && to >= off + PS => {
                // Fully rewritten page.
                let mut data = get_free_page(cache);
                match file.read_at(&mut data, off) {
                    Ok(got) if got > 0 => {
                        if (got as u64) < PS && off + got as u64 != file_size {
                            cache.mem.lock().return_free(data);
                        } else {
                            let mut page = PageBuf::new(data, hash, page_id, got as u32, now);
                            page.use_count = 1;
                            add_page_if_not_exists(cache, page);
                        }
                    }
                    _ => {
                        cache.mem.lock().return_free(data);
                        break;
                    }
                }
            }
            Some(_) => {
                // Old and new fragments share the page: splice.
                if let Err(err) = splice_page(cache, &file, &intervals, iv, off, hash, old_hash, now) {
                    debug!(%err, page_id, "splice skipped");
                }
            }
        }
        off += PS;
    }
    remove_staging(cache, task_id, true);
}

#[allow(clippy::too_many_arguments)]
fn splice_page(
    cache: &Arc<PageCache>,
    file: &File,
    intervals: &[(u64, u64)],
    mut iv: usize,
    off: u64,
    hash: u64,
    old_hash: u64,
    now: i64,
) -> CacheResult<()> {
    use std::os::unix::fs::FileExt;
    let page_id = off / PS;
    let mut data = get_free_page(cache);
    let Some(mut valid) = read_disk_page(cache, old_hash, page_id, &mut data)? else {
        cache.mem.lock().return_free(data);
        return Ok(());
    };
    loop {
        let (from, to) = intervals[iv];
        let (buf_off, read_off) = if from > off { (from - off, from) } else { (0, off) };
        let read_len = if to < off + PS { to - read_off } else { PS - buf_off };
        let dst = buf_off as usize..(buf_off + read_len) as usize;
        if let Err(err) = file.read_exact_at(&mut data[dst], read_off) {
            cache.mem.lock().return_free(data);
            return Err(err.into());
        }
        if buf_off + read_len > valid as u64 {
            valid = (buf_off + read_len) as u32;
        }
        if to > off + PS {
            break;
        }
        iv += 1;
        if iv >= intervals.len() || intervals[iv].0 >= off + PS {
            break;
        }
    }
    let mut page = PageBuf::new(data, hash, page_id, valid, now);
    page.use_count = 1;
    add_page_if_not_exists(cache, page);
    Ok(())
}
