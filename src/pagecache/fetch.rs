//! Network Fetch
//!
//! One fetch task serves one read request: it resolves the file version's
//! URL bundle (cooperating with concurrent requests on the same hash),
//! pulls each byte range from a content host — falling back to the API
//! `readfile` pipeline when no host is reachable — and streams the arriving
//! bytes into pool pages, waking the exact waiters of each page.
//!
//! Stale links (404/410) invalidate the bundle and retry with a fresh one,
//! up to five times. A fatal error propagates `EIO` to the waiters of the
//! ranges that were still outstanding; completed ranges are unaffected.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use super::urls::Acquire;
use super::{get_free_page, unix_now, OpenFile, PageCache};
use crate::api::{call_with_retry, ApiError, ApiParam, UrlBundle};
use crate::config::PAGE_SIZE;
use crate::pagecache::memory::PageBuf;

/// One contiguous byte range to fetch; always page-aligned
#[derive(Debug, Clone, Copy)]
pub(crate) struct FetchRange {
    pub offset: u64,
    pub length: u64,
}

impl FetchRange {
    fn first_page(&self) -> u64 {
        self.offset / PAGE_SIZE as u64
    }

    fn page_count(&self) -> u64 {
        (self.length + PAGE_SIZE as u64 - 1) / PAGE_SIZE as u64
    }
}

/// A read request handed to a fetch task
pub(crate) struct FetchRequest {
    pub of: Arc<OpenFile>,
    pub ranges: Vec<FetchRange>,
}

enum Outcome {
    Done,
    /// The URL bundle went stale; refetch it and retry
    Stale,
    Fatal,
}

/// Entry point of the fetch task thread
pub(crate) fn run(cache: Arc<PageCache>, request: FetchRequest) {
    let hash = request.of.hash;
    let mut remaining: VecDeque<FetchRange> = request.ranges.iter().copied().collect();
    if let Some(first) = remaining.front() {
        debug!(offset = first.offset, length = first.length, hash, "fetch task started");
    }
    let mut tries = 0;
    let ok = loop {
        let (slot, bundle) = match cache.urls.acquire(hash) {
            Acquire::Ready(slot, bundle) => (slot, bundle),
            Acquire::Failed => break false,
            Acquire::Fetch(slot) => {
                // A released bundle may still be parked in the registry.
                let cached = cache.keycache.get_as::<UrlBundle>(&format!("URLS{hash}"));
                match cached {
                    Some(bundle) => {
                        cache.urls.fulfill(&slot, (*bundle).clone());
                        (slot, *bundle)
                    }
                    None => match fetch_bundle(&cache, request.of.file_id, hash) {
                        Ok(bundle) => {
                            cache.urls.fulfill(&slot, bundle.clone());
                            (slot, bundle)
                        }
                        Err(err) => {
                            warn!(hash, %err, "getfilelink failed");
                            cache.urls.fail(hash, &slot);
                            break false;
                        }
                    },
                }
            }
        };
        match serve_ranges(&cache, &request.of, &bundle, &mut remaining) {
            Outcome::Done => {
                cache.urls.release(hash, &slot, &cache.keycache, unix_now());
                break true;
            }
            Outcome::Stale => {
                cache.urls.invalidate(hash, &slot);
                tries += 1;
                if tries >= 5 {
                    break false;
                }
            }
            Outcome::Fatal => {
                cache.urls.release(hash, &slot, &cache.keycache, unix_now());
                break false;
            }
        }
    };
    if !ok {
        for range in &remaining {
            debug!(
                offset = range.offset,
                length = range.length,
                hash,
                "sending error to waiters of failed range"
            );
            cache.wait.fail_range(hash, range.first_page(), range.page_count());
        }
    }
    request.of.fetch_finished();
}

fn fetch_bundle(cache: &PageCache, file_id: u64, hash: u64) -> Result<UrlBundle, ApiError> {
    debug!(file_id, hash, "getting file URLs");
    let response = call_with_retry(
        &*cache.api,
        "getfilelink",
        &[
            ApiParam::Num("fileid", file_id),
            ApiParam::Num("hash", hash),
            ApiParam::Bool("skipfilename", true),
        ],
    )?;
    UrlBundle::from_response(&response)
}

fn serve_ranges(
    cache: &Arc<PageCache>,
    of: &Arc<OpenFile>,
    bundle: &UrlBundle,
    remaining: &mut VecDeque<FetchRange>,
) -> Outcome {
    while let Some(range) = remaining.front().copied() {
        let started = Instant::now();
        let mut bytes = None;
        for host in &bundle.hosts {
            match cache.content.fetch_range(host, &bundle.path, range.offset, range.length) {
                Ok(data) => {
                    bytes = Some(data);
                    break;
                }
                Err(ApiError::Server { code, .. }) if code == 404 || code == 410 => {
                    warn!(%host, code, "content link went stale");
                    return Outcome::Stale;
                }
                Err(err) => {
                    debug!(%host, %err, "content host failed, trying next");
                }
            }
        }
        let bytes = match bytes {
            Some(data) => data,
            None => {
                // No content host worked; pipeline the range over the API.
                debug!(
                    offset = range.offset,
                    length = range.length,
                    "serving range from API"
                );
                match cache.api.read_file(of.file_id, of.hash, range.offset, range.length) {
                    Ok(data) => data,
                    Err(err) if err.is_transport() => {
                        warn!(%err, "API range read failed, requesting retry");
                        return Outcome::Stale;
                    }
                    Err(err) => {
                        warn!(%err, "API range read failed fatally");
                        return Outcome::Fatal;
                    }
                }
            }
        };
        of.record_transfer(bytes.len() as u64, started.elapsed());
        distribute_pages(cache, of.hash, range, &bytes);
        remaining.pop_front();
        debug!(offset = range.offset, length = range.length, "range finished");
    }
    Outcome::Done
}

/// Slice the arriving bytes into pool pages, wake waiters, and insert each
/// page into the memory tier.
fn distribute_pages(cache: &Arc<PageCache>, hash: u64, range: FetchRange, bytes: &[u8]) {
    let now = unix_now();
    let first_page = range.first_page();
    for i in 0..range.page_count() {
        let start = (i as usize) * PAGE_SIZE;
        if start >= bytes.len() {
            // The server returned fewer bytes than asked: the file ends
            // here. Waiters observe a zero-length page and report a short
            // read; there is nothing to cache.
            cache.wait.complete_page(hash, first_page + i, &[]);
            continue;
        }
        let end = (start + PAGE_SIZE).min(bytes.len());
        let chunk = &bytes[start..end];
        let mut data = get_free_page(cache);
        data[..chunk.len()].copy_from_slice(chunk);
        let page = PageBuf::new(data, hash, first_page + i, chunk.len() as u32, now);
        // Insert before waking so a reader arriving between the two sees
        // the page resident instead of starting a duplicate fetch.
        cache.mem.lock().insert(page);
        cache.wait.complete_page(hash, first_page + i, chunk);
    }
}
