//! Memory Tier
//!
//! A preallocated pool of page buffers indexed by `(hash, page_id)`, a free
//! list, and the access-update ring that batches disk-tier bookkeeping.
//! Everything here is guarded by the page cache's short-critical-section
//! mutex; none of these functions block on I/O.

use std::collections::HashMap;

use crate::config::PAGE_SIZE;

/// Disk-tier access updates are merged into this many ring slots
pub(crate) const DB_UPDATE_RING: usize = 32 * 1024;

/// Re-bumping a page's counters is suppressed for this many seconds
const REBUMP_GUARD_SECS: i64 = 5;

/// One memory-resident page
pub(crate) struct PageBuf {
    /// Page content; always a full buffer, `size` bytes valid
    pub data: Box<[u8]>,
    /// Content hash of the owning file version
    pub hash: u64,
    /// Page index inside the file version
    pub page_id: u64,
    /// Unix timestamp of the last access
    pub last_use: i64,
    /// Access count since arrival
    pub use_count: u32,
    /// Valid bytes; short only for the last page of a file
    pub size: u32,
}

impl PageBuf {
    /// Wrap a pool buffer with fresh metadata
    pub fn new(data: Box<[u8]>, hash: u64, page_id: u64, size: u32, now: i64) -> Self {
        Self { data, hash, page_id, last_use: now, use_count: 0, size }
    }
}

/// One pending access update for a disk-tier slot
#[derive(Clone, Copy, Default)]
pub(crate) struct UpdateSlot {
    /// Disk slot id; zero marks an empty ring slot
    pub slot: u64,
    /// Unix timestamp of the newest access
    pub last_use: i64,
    /// Accesses merged into this entry
    pub use_delta: u32,
}

/// The memory tier's mutable state
pub(crate) struct MemTier {
    /// Unassigned page buffers
    free: Vec<Box<[u8]>>,
    /// Resident pages
    pages: HashMap<(u64, u64), PageBuf>,
    /// Pages written out by an in-progress flush; still readable
    flushing: HashMap<(u64, u64), PageBuf>,
    /// Access-update ring, direct-addressed by slot id with linear probing
    ring: Box<[UpdateSlot]>,
    ring_count: u32,
    total_pages: usize,
}

impl MemTier {
    /// Preallocate `total_pages` buffers
    pub fn new(total_pages: usize) -> Self {
        let free = (0..total_pages)
            .map(|_| vec![0u8; PAGE_SIZE].into_boxed_slice())
            .collect();
        Self {
            free,
            pages: HashMap::new(),
            flushing: HashMap::new(),
            ring: vec![UpdateSlot::default(); DB_UPDATE_RING].into_boxed_slice(),
            ring_count: 0,
            total_pages,
        }
    }

    pub fn total_pages(&self) -> usize {
        self.total_pages
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn resident_count(&self) -> usize {
        self.pages.len()
    }

    /// Pop a buffer from the free list
    pub fn take_free(&mut self) -> Option<Box<[u8]>> {
        self.free.pop()
    }

    /// Return a buffer to the free list
    pub fn return_free(&mut self, data: Box<[u8]>) {
        self.free.push(data);
    }

    fn find(&mut self, hash: u64, page_id: u64) -> Option<&mut PageBuf> {
        let key = (hash, page_id);
        if self.pages.contains_key(&key) {
            self.pages.get_mut(&key)
        } else {
            self.flushing.get_mut(&key)
        }
    }

    /// Whether `(hash, page_id)` is memory-resident
    pub fn contains(&self, hash: u64, page_id: u64) -> bool {
        let key = (hash, page_id);
        self.pages.contains_key(&key) || self.flushing.contains_key(&key)
    }

    /// Copy the overlap of `(off, out.len())` with the page into `out`.
    ///
    /// Returns the bytes copied, clamped to the page's valid size, or
    /// `None` when the page is not resident.
    pub fn lookup_copy(&mut self, hash: u64, page_id: u64, out: &mut [u8], off: usize, now: i64) -> Option<usize> {
        let page = self.find(hash, page_id)?;
        if now > page.last_use + REBUMP_GUARD_SECS {
            page.use_count += 1;
            page.last_use = now;
        }
        let valid = page.size as usize;
        let len = if off >= valid { 0 } else { out.len().min(valid - off) };
        out[..len].copy_from_slice(&page.data[off..off + len]);
        Some(len)
    }

    /// Insert a filled page; a displaced duplicate's buffer returns to the
    /// free list
    pub fn insert(&mut self, page: PageBuf) {
        if let Some(old) = self.pages.insert((page.hash, page.page_id), page) {
            self.free.push(old.data);
        }
    }

    /// Move every resident page into the flushing set, sorted by
    /// `(hash, page_id)` so pagefile writes are sequential
    pub fn begin_flush(&mut self) -> Vec<(u64, u64)> {
        let mut keys: Vec<(u64, u64)> = self.pages.keys().copied().collect();
        keys.sort_unstable();
        for key in &keys {
            if let Some(page) = self.pages.remove(key) {
                self.flushing.insert(*key, page);
            }
        }
        keys
    }

    /// Copy a flushing page's full buffer into `out`
    pub fn copy_flushing(&self, hash: u64, page_id: u64, out: &mut [u8]) -> Option<()> {
        let page = self.flushing.get(&(hash, page_id))?;
        out.copy_from_slice(&page.data);
        Some(())
    }

    /// Take one page out of the flushing set
    pub fn take_flushing(&mut self, hash: u64, page_id: u64) -> Option<PageBuf> {
        self.flushing.remove(&(hash, page_id))
    }

    /// Move a page that could not be flushed back into the resident set
    pub fn requeue_flushing(&mut self, hash: u64, page_id: u64) {
        if let Some(page) = self.flushing.remove(&(hash, page_id)) {
            self.insert(page);
        }
    }

    /// Drop the oldest `count` resident pages, returning their buffers to
    /// the free list. Used when the disk is full and nothing can spill.
    pub fn discard_oldest(&mut self, count: usize) -> usize {
        let mut keys: Vec<((u64, u64), i64)> =
            self.pages.iter().map(|(k, p)| (*k, p.last_use)).collect();
        keys.sort_unstable_by_key(|&(_, last_use)| last_use);
        let mut dropped = 0;
        for ((hash, page_id), _) in keys.into_iter().take(count) {
            if let Some(page) = self.pages.remove(&(hash, page_id)) {
                self.free.push(page.data);
                dropped += 1;
            }
        }
        dropped
    }

    /// Record one disk-tier access in the update ring.
    ///
    /// Returns `true` when the ring is at least half full and should be
    /// drained promptly.
    pub fn mark_disk_access(&mut self, slot: u64, now: i64) -> bool {
        let mut h = (slot as usize) % DB_UPDATE_RING;
        loop {
            let entry = &mut self.ring[h];
            if entry.slot == 0 {
                *entry = UpdateSlot { slot, last_use: now, use_delta: 1 };
                self.ring_count += 1;
                break;
            }
            if entry.slot == slot {
                if now > entry.last_use + REBUMP_GUARD_SECS {
                    entry.last_use = now;
                    entry.use_delta += 1;
                }
                break;
            }
            h = (h + 1) % DB_UPDATE_RING;
        }
        self.ring_count as usize > DB_UPDATE_RING / 2
    }

    pub fn pending_updates(&self) -> u32 {
        self.ring_count
    }

    /// Drain the access-update ring
    pub fn drain_updates(&mut self) -> Vec<UpdateSlot> {
        let mut out = Vec::with_capacity(self.ring_count as usize);
        for entry in self.ring.iter_mut() {
            if entry.slot != 0 {
                out.push(*entry);
                *entry = UpdateSlot::default();
            }
        }
        self.ring_count = 0;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled_page(hash: u64, page_id: u64, byte: u8, size: u32) -> PageBuf {
        let mut data = vec![0u8; PAGE_SIZE].into_boxed_slice();
        data[..size as usize].fill(byte);
        PageBuf::new(data, hash, page_id, size, 100)
    }

    #[test]
    fn test_lookup_copies_overlap() {
        let mut mem = MemTier::new(4);
        mem.insert(filled_page(1, 0, 0xAB, PAGE_SIZE as u32));
        let mut out = vec![0u8; 16];
        let got = mem.lookup_copy(1, 0, &mut out, 100, 100).unwrap();
        assert_eq!(got, 16);
        assert!(out.iter().all(|&b| b == 0xAB));
        assert!(mem.lookup_copy(1, 1, &mut out, 0, 100).is_none());
    }

    #[test]
    fn test_lookup_clamps_to_valid_size() {
        let mut mem = MemTier::new(4);
        mem.insert(filled_page(1, 0, 0xCD, 100));
        let mut out = vec![0u8; 64];
        // Offset past the valid region yields an empty read.
        assert_eq!(mem.lookup_copy(1, 0, &mut out, 200, 100), Some(0));
        // Straddling the valid end yields the tail only.
        assert_eq!(mem.lookup_copy(1, 0, &mut out, 80, 100), Some(20));
    }

    #[test]
    fn test_rebump_guard() {
        let mut mem = MemTier::new(4);
        mem.insert(filled_page(1, 0, 1, 4096));
        let mut out = vec![0u8; 4];
        mem.lookup_copy(1, 0, &mut out, 0, 101).unwrap();
        let count_soon = {
            mem.lookup_copy(1, 0, &mut out, 0, 103).unwrap();
            mem.find(1, 0).unwrap().use_count
        };
        mem.lookup_copy(1, 0, &mut out, 0, 200).unwrap();
        let count_later = mem.find(1, 0).unwrap().use_count;
        assert_eq!(count_soon, 0);
        assert_eq!(count_later, 1);
    }

    #[test]
    fn test_flush_cycle_keeps_pages_readable() {
        let mut mem = MemTier::new(4);
        mem.insert(filled_page(2, 5, 0xEE, 4096));
        let keys = mem.begin_flush();
        assert_eq!(keys, vec![(2, 5)]);
        // Still readable while being written out.
        let mut out = vec![0u8; 8];
        assert_eq!(mem.lookup_copy(2, 5, &mut out, 0, 100), Some(8));
        let page = mem.take_flushing(2, 5).unwrap();
        assert_eq!(page.size, 4096);
        assert!(mem.take_flushing(2, 5).is_none());
    }

    #[test]
    fn test_begin_flush_orders_by_hash_then_page() {
        let mut mem = MemTier::new(8);
        mem.insert(filled_page(2, 1, 0, 4096));
        mem.insert(filled_page(1, 9, 0, 4096));
        mem.insert(filled_page(1, 3, 0, 4096));
        assert_eq!(mem.begin_flush(), vec![(1, 3), (1, 9), (2, 1)]);
    }

    #[test]
    fn test_discard_oldest() {
        let mut mem = MemTier::new(4);
        for (i, age) in [(0u64, 50), (1, 10), (2, 90)] {
            let mut page = filled_page(1, i, 0, 4096);
            page.last_use = age;
            mem.insert(page);
        }
        assert_eq!(mem.discard_oldest(2), 2);
        assert!(mem.contains(1, 2));
        assert!(!mem.contains(1, 1));
    }

    #[test]
    fn test_update_ring_merges_same_slot() {
        let mut mem = MemTier::new(1);
        mem.mark_disk_access(7, 100);
        mem.mark_disk_access(7, 102); // inside the re-bump guard
        mem.mark_disk_access(7, 200);
        let updates = mem.drain_updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].slot, 7);
        assert_eq!(updates[0].use_delta, 2);
        assert_eq!(updates[0].last_use, 200);
        assert!(mem.drain_updates().is_empty());
    }

    #[test]
    fn test_update_ring_probes_on_collision() {
        let mut mem = MemTier::new(1);
        mem.mark_disk_access(3, 100);
        mem.mark_disk_access(3 + DB_UPDATE_RING as u64, 100);
        let updates = mem.drain_updates();
        assert_eq!(updates.len(), 2);
    }
}
