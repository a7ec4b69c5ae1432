//! Local Metadata Persistence
//!
//! Typed rows over an embedded key-value store. One tree per concern,
//! mirroring the tables the engine owns:
//!
//! - `settings`: small id/value pairs (crypto setup state, key blobs)
//! - `cryptofolderkey` / `cryptofilekey`: wrapped symmetric keys by id
//! - `fstask`: staging rows for not-yet-uploaded objects (negative ids)
//! - `pagecache`: disk-tier slot rows; the slot id times the page size is
//!   the byte offset inside the pagefile
//! - `pagemap`: secondary index `(hash, pageid) -> slot`
//! - `pagecachetask`: durable queue of post-upload promotion tasks
//!
//! Numeric keys are stored big-endian so lexicographic iteration gives id
//! order, which the flush and sweep paths rely on.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Storage layer errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying key-value store failure
    #[error("Metadata store error: {0}")]
    Backend(#[from] sled::Error),

    /// A row did not deserialize
    #[error("Corrupt row in tree {0}")]
    CorruptRow(&'static str),
}

/// Result alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Row type tag: slot is unused
pub const PAGE_TYPE_FREE: u8 = 0;
/// Row type tag: slot holds cached file content
pub const PAGE_TYPE_READ: u8 = 1;

/// Staging task kind: newly created object
pub const FS_TASK_CREAT: u8 = 0;
/// Staging task kind: modification of an uploaded file
pub const FS_TASK_MODIFY: u8 = 1;

/// Promotion task kind: upload of a new file finished
pub const PAGE_TASK_CREAT: u8 = 0;
/// Promotion task kind: upload of a modified file finished
pub const PAGE_TASK_MODIFY: u8 = 1;

/// One disk-tier slot row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRow {
    /// `PAGE_TYPE_FREE` or `PAGE_TYPE_READ`
    pub page_type: u8,
    /// Content hash of the cached file version
    pub hash: u64,
    /// Page index inside the file version
    pub page_id: u64,
    /// Unix timestamp of the last access
    pub last_use: i64,
    /// Access count since the row was filled
    pub use_count: u32,
    /// Valid bytes in the slot (short only for the file's last page)
    pub size: u32,
}

impl PageRow {
    /// A fresh unused slot
    pub fn free() -> Self {
        Self { page_type: PAGE_TYPE_FREE, hash: 0, page_id: 0, last_use: 0, use_count: 0, size: 0 }
    }
}

/// Staging row for an object that exists only locally
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsTaskRow {
    /// `FS_TASK_CREAT` or `FS_TASK_MODIFY`
    pub kind: u8,
    /// For modifications, the id of the uploaded file being changed
    pub file_id: u64,
    /// For creations, the base64 wrapped key of the new object
    pub key_b64: Option<String>,
}

/// Durable promotion task row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageTaskRow {
    /// `PAGE_TASK_CREAT` or `PAGE_TASK_MODIFY`
    pub kind: u8,
    /// Upload task id naming the staging files
    pub task_id: u64,
    /// Content hash assigned by the server
    pub hash: u64,
    /// Previous content hash (modifications only)
    pub old_hash: u64,
}

/// Sweep input: one READ row's aging counters
#[derive(Debug, Clone, Copy)]
pub struct SweepEntry {
    /// Slot id
    pub slot: u64,
    /// Unix timestamp of the last access
    pub last_use: i64,
    /// Access count
    pub use_count: u32,
}

fn slot_key(slot: u64) -> [u8; 8] {
    slot.to_be_bytes()
}

fn page_key(hash: u64, page_id: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&hash.to_be_bytes());
    key[8..].copy_from_slice(&page_id.to_be_bytes());
    key
}

fn decode_slot(bytes: &[u8]) -> Option<u64> {
    bytes.try_into().ok().map(u64::from_be_bytes)
}

/// The engine's local metadata store
pub struct MetaStore {
    settings: sled::Tree,
    folder_keys: sled::Tree,
    file_keys: sled::Tree,
    fs_tasks: sled::Tree,
    pages: sled::Tree,
    page_map: sled::Tree,
    page_tasks: sled::Tree,
    db: sled::Db,
}

impl MetaStore {
    /// Open (or create) the store under `path`
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = sled::open(path)?;
        Ok(Self {
            settings: db.open_tree("settings")?,
            folder_keys: db.open_tree("cryptofolderkey")?,
            file_keys: db.open_tree("cryptofilekey")?,
            fs_tasks: db.open_tree("fstask")?,
            pages: db.open_tree("pagecache")?,
            page_map: db.open_tree("pagemap")?,
            page_tasks: db.open_tree("pagecachetask")?,
            db,
        })
    }

    /// Flush pending writes to disk
    pub fn sync(&self) -> StoreResult<()> {
        self.db.flush()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------

    /// Fetch a settings row
    pub fn setting(&self, id: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.settings.get(id)?.map(|v| v.to_vec()))
    }

    /// Store a settings row
    pub fn set_setting(&self, id: &str, value: &[u8]) -> StoreResult<()> {
        self.settings.insert(id, value)?;
        Ok(())
    }

    /// Fetch a numeric settings row
    pub fn setting_u64(&self, id: &str) -> StoreResult<Option<u64>> {
        Ok(self.setting(id)?.and_then(|v| decode_slot(&v)))
    }

    /// Store a numeric settings row
    pub fn set_setting_u64(&self, id: &str, value: u64) -> StoreResult<()> {
        self.set_setting(id, &value.to_be_bytes())
    }

    /// Delete a settings row
    pub fn del_setting(&self, id: &str) -> StoreResult<()> {
        self.settings.remove(id)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Wrapped keys and staging rows
    // ------------------------------------------------------------------

    /// Wrapped key of an uploaded folder
    pub fn folder_key(&self, folder_id: u64) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.folder_keys.get(slot_key(folder_id))?.map(|v| v.to_vec()))
    }

    /// Persist the wrapped key of an uploaded folder
    pub fn set_folder_key(&self, folder_id: u64, enc_key: &[u8]) -> StoreResult<()> {
        self.folder_keys.insert(slot_key(folder_id), enc_key)?;
        Ok(())
    }

    /// Wrapped key of an uploaded file
    pub fn file_key(&self, file_id: u64) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.file_keys.get(slot_key(file_id))?.map(|v| v.to_vec()))
    }

    /// Persist the wrapped key of an uploaded file
    pub fn set_file_key(&self, file_id: u64, enc_key: &[u8]) -> StoreResult<()> {
        self.file_keys.insert(slot_key(file_id), enc_key)?;
        Ok(())
    }

    /// Staging row for a temporary (negative) id; the caller passes `-id`
    pub fn fs_task(&self, task_id: u64) -> StoreResult<Option<FsTaskRow>> {
        match self.fs_tasks.get(slot_key(task_id))? {
            Some(raw) => bincode::deserialize(&raw)
                .map(Some)
                .map_err(|_| StoreError::CorruptRow("fstask")),
            None => Ok(None),
        }
    }

    /// Insert a staging row (written by the sync engine)
    pub fn set_fs_task(&self, task_id: u64, row: &FsTaskRow) -> StoreResult<()> {
        let raw = bincode::serialize(row).expect("fstask row serializes");
        self.fs_tasks.insert(slot_key(task_id), raw)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Disk-tier slot rows
    // ------------------------------------------------------------------

    /// Row stored at `slot`
    pub fn page_row(&self, slot: u64) -> StoreResult<Option<PageRow>> {
        match self.pages.get(slot_key(slot))? {
            Some(raw) => bincode::deserialize(&raw)
                .map(Some)
                .map_err(|_| StoreError::CorruptRow("pagecache")),
            None => Ok(None),
        }
    }

    /// Find the slot holding `(hash, page_id)`, if any
    pub fn find_page(&self, hash: u64, page_id: u64) -> StoreResult<Option<(u64, PageRow)>> {
        let Some(raw_slot) = self.page_map.get(page_key(hash, page_id))? else {
            return Ok(None);
        };
        let Some(slot) = decode_slot(&raw_slot) else {
            return Ok(None);
        };
        // Validate against the primary row; a stale mapping is treated as a miss.
        match self.page_row(slot)? {
            Some(row) if row.page_type == PAGE_TYPE_READ && row.hash == hash && row.page_id == page_id => {
                Ok(Some((slot, row)))
            }
            _ => {
                self.page_map.remove(page_key(hash, page_id))?;
                Ok(None)
            }
        }
    }

    /// Residency bitmap and slots for `count` pages starting at `from_page`.
    ///
    /// Returns `(page_id, slot)` pairs in ascending page order.
    pub fn pages_in_range(&self, hash: u64, from_page: u64, count: u64) -> StoreResult<Vec<(u64, u64)>> {
        let lo = page_key(hash, from_page);
        let hi = page_key(hash, from_page + count);
        let mut found = Vec::new();
        for item in self.page_map.range(lo..hi) {
            let (key, raw_slot) = item?;
            let page_id = decode_slot(&key[8..]).ok_or(StoreError::CorruptRow("pagemap"))?;
            if let Some(slot) = decode_slot(&raw_slot) {
                found.push((page_id, slot));
            }
        }
        Ok(found)
    }

    /// Fill `slot` with a READ row, unless `(hash, page_id)` already maps
    /// somewhere. Returns whether the row was written.
    pub fn fill_slot(&self, slot: u64, row: &PageRow) -> StoreResult<bool> {
        debug_assert_eq!(row.page_type, PAGE_TYPE_READ);
        if self.page_map.contains_key(page_key(row.hash, row.page_id))? {
            return Ok(false);
        }
        let raw = bincode::serialize(row).expect("page row serializes");
        self.pages.insert(slot_key(slot), raw)?;
        self.page_map.insert(page_key(row.hash, row.page_id), &slot_key(slot))?;
        Ok(true)
    }

    /// Switch a slot back to FREE, dropping its index entry
    pub fn free_slot(&self, slot: u64) -> StoreResult<()> {
        if let Some(row) = self.page_row(slot)? {
            if row.page_type == PAGE_TYPE_READ {
                self.page_map.remove(page_key(row.hash, row.page_id))?;
            }
        }
        let raw = bincode::serialize(&PageRow::free()).expect("page row serializes");
        self.pages.insert(slot_key(slot), raw)?;
        Ok(())
    }

    /// Ascending FREE slot ids, at most `limit`
    pub fn free_slots(&self, limit: usize) -> StoreResult<Vec<u64>> {
        let mut out = Vec::new();
        for item in self.pages.iter() {
            let (key, raw) = item?;
            let row: PageRow =
                bincode::deserialize(&raw).map_err(|_| StoreError::CorruptRow("pagecache"))?;
            if row.page_type == PAGE_TYPE_FREE {
                out.push(decode_slot(&key).ok_or(StoreError::CorruptRow("pagecache"))?);
                if out.len() >= limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    /// Append `count` FREE rows past the current maximum slot
    pub fn append_free_rows(&self, count: u64) -> StoreResult<u64> {
        let mut slot = self.max_slot()?;
        let raw = bincode::serialize(&PageRow::free()).expect("page row serializes");
        for _ in 0..count {
            slot += 1;
            self.pages.insert(slot_key(slot), raw.clone())?;
        }
        Ok(slot)
    }

    /// Highest slot id present, zero when the table is empty
    pub fn max_slot(&self) -> StoreResult<u64> {
        Ok(self
            .pages
            .last()?
            .and_then(|(key, _)| decode_slot(&key))
            .unwrap_or(0))
    }

    /// Number of FREE rows
    pub fn count_free_slots(&self) -> StoreResult<u64> {
        let mut count = 0;
        for item in self.pages.iter() {
            let (_, raw) = item?;
            let row: PageRow =
                bincode::deserialize(&raw).map_err(|_| StoreError::CorruptRow("pagecache"))?;
            if row.page_type == PAGE_TYPE_FREE {
                count += 1;
            }
        }
        Ok(count)
    }

    /// All READ rows' aging counters, for the sweep
    pub fn sweep_entries(&self) -> StoreResult<Vec<SweepEntry>> {
        let mut out = Vec::new();
        for item in self.pages.iter() {
            let (key, raw) = item?;
            let row: PageRow =
                bincode::deserialize(&raw).map_err(|_| StoreError::CorruptRow("pagecache"))?;
            if row.page_type == PAGE_TYPE_READ {
                out.push(SweepEntry {
                    slot: decode_slot(&key).ok_or(StoreError::CorruptRow("pagecache"))?,
                    last_use: row.last_use,
                    use_count: row.use_count,
                });
            }
        }
        Ok(out)
    }

    /// Drop every row with a slot id above `max`
    pub fn delete_rows_above(&self, max: u64) -> StoreResult<()> {
        let doomed: Vec<(sled::IVec, sled::IVec)> = self
            .pages
            .range(slot_key(max + 1)..)
            .collect::<Result<_, _>>()?;
        for (key, raw) in doomed {
            if let Ok(row) = bincode::deserialize::<PageRow>(&raw) {
                if row.page_type == PAGE_TYPE_READ {
                    self.page_map.remove(page_key(row.hash, row.page_id))?;
                }
            }
            self.pages.remove(key)?;
        }
        Ok(())
    }

    /// Re-key a cached page from `old_hash` to `new_hash` without touching
    /// the pagefile. Returns whether a row was renamed.
    pub fn rename_page_hash(&self, old_hash: u64, new_hash: u64, page_id: u64) -> StoreResult<bool> {
        let Some((slot, mut row)) = self.find_page(old_hash, page_id)? else {
            return Ok(false);
        };
        if self.page_map.contains_key(page_key(new_hash, page_id))? {
            return Ok(false);
        }
        row.hash = new_hash;
        let raw = bincode::serialize(&row).expect("page row serializes");
        self.pages.insert(slot_key(slot), raw)?;
        self.page_map.remove(page_key(old_hash, page_id))?;
        self.page_map.insert(page_key(new_hash, page_id), &slot_key(slot))?;
        Ok(true)
    }

    /// Apply one batched access update to a slot row
    pub fn bump_access(&self, slot: u64, last_use: i64, use_delta: u32) -> StoreResult<()> {
        if let Some(mut row) = self.page_row(slot)? {
            if row.page_type == PAGE_TYPE_READ {
                row.last_use = last_use;
                row.use_count = row.use_count.saturating_add(use_delta);
                let raw = bincode::serialize(&row).expect("page row serializes");
                self.pages.insert(slot_key(slot), raw)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Promotion task queue
    // ------------------------------------------------------------------

    /// Enqueue a promotion task; returns its queue id
    pub fn push_page_task(&self, row: &PageTaskRow) -> StoreResult<u64> {
        let id = self.db.generate_id()?;
        let raw = bincode::serialize(row).expect("page task serializes");
        self.page_tasks.insert(slot_key(id), raw)?;
        Ok(id)
    }

    /// Oldest queued promotion task, if any
    pub fn first_page_task(&self) -> StoreResult<Option<(u64, PageTaskRow)>> {
        match self.page_tasks.first()? {
            Some((key, raw)) => {
                let id = decode_slot(&key).ok_or(StoreError::CorruptRow("pagecachetask"))?;
                let row = bincode::deserialize(&raw).map_err(|_| StoreError::CorruptRow("pagecachetask"))?;
                Ok(Some((id, row)))
            }
            None => Ok(None),
        }
    }

    /// Remove a completed promotion task
    pub fn delete_page_task(&self, id: u64) -> StoreResult<()> {
        self.page_tasks.remove(slot_key(id))?;
        Ok(())
    }

    /// Number of queued promotion tasks
    pub fn page_task_count(&self) -> usize {
        self.page_tasks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store(name: &str) -> (MetaStore, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(format!("cirrus_store_{}_{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        (MetaStore::open(&dir).unwrap(), dir)
    }

    #[test]
    fn test_settings_roundtrip() {
        let (store, dir) = temp_store("settings");
        store.set_setting("cryptosetup", &[1]).unwrap();
        store.set_setting_u64("crypto_private_iter", 20_000).unwrap();
        assert_eq!(store.setting("cryptosetup").unwrap(), Some(vec![1]));
        assert_eq!(store.setting_u64("crypto_private_iter").unwrap(), Some(20_000));
        store.del_setting("cryptosetup").unwrap();
        assert_eq!(store.setting("cryptosetup").unwrap(), None);
        drop(store);
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_slot_fill_and_lookup() {
        let (store, dir) = temp_store("slots");
        store.append_free_rows(4).unwrap();
        assert_eq!(store.free_slots(10).unwrap(), vec![1, 2, 3, 4]);

        let row = PageRow { page_type: PAGE_TYPE_READ, hash: 7, page_id: 3, last_use: 100, use_count: 1, size: 4096 };
        assert!(store.fill_slot(2, &row).unwrap());
        // Duplicate (hash, pageid) is ignored.
        assert!(!store.fill_slot(3, &row).unwrap());

        let (slot, got) = store.find_page(7, 3).unwrap().unwrap();
        assert_eq!(slot, 2);
        assert_eq!(got.size, 4096);
        assert_eq!(store.pages_in_range(7, 0, 10).unwrap(), vec![(3, 2)]);

        store.free_slot(2).unwrap();
        assert!(store.find_page(7, 3).unwrap().is_none());
        drop(store);
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_rename_hash() {
        let (store, dir) = temp_store("rename");
        store.append_free_rows(2).unwrap();
        let row = PageRow { page_type: PAGE_TYPE_READ, hash: 10, page_id: 0, last_use: 5, use_count: 2, size: 4096 };
        store.fill_slot(1, &row).unwrap();
        assert!(store.rename_page_hash(10, 11, 0).unwrap());
        assert!(store.find_page(10, 0).unwrap().is_none());
        let (_, renamed) = store.find_page(11, 0).unwrap().unwrap();
        assert_eq!(renamed.use_count, 2);
        // Renaming a missing page is a no-op.
        assert!(!store.rename_page_hash(10, 12, 0).unwrap());
        drop(store);
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_task_queue_order() {
        let (store, dir) = temp_store("tasks");
        let a = store.push_page_task(&PageTaskRow { kind: PAGE_TASK_CREAT, task_id: 1, hash: 100, old_hash: 0 }).unwrap();
        let _b = store.push_page_task(&PageTaskRow { kind: PAGE_TASK_MODIFY, task_id: 2, hash: 101, old_hash: 100 }).unwrap();
        let (first_id, first) = store.first_page_task().unwrap().unwrap();
        assert_eq!(first_id, a);
        assert_eq!(first.hash, 100);
        store.delete_page_task(first_id).unwrap();
        let (_, second) = store.first_page_task().unwrap().unwrap();
        assert_eq!(second.kind, PAGE_TASK_MODIFY);
        assert_eq!(store.page_task_count(), 1);
        drop(store);
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_delete_rows_above() {
        let (store, dir) = temp_store("truncate");
        store.append_free_rows(8).unwrap();
        let row = PageRow { page_type: PAGE_TYPE_READ, hash: 1, page_id: 1, last_use: 1, use_count: 0, size: 4096 };
        store.fill_slot(7, &row).unwrap();
        store.delete_rows_above(4).unwrap();
        assert_eq!(store.max_slot().unwrap(), 4);
        assert!(store.find_page(1, 1).unwrap().is_none());
        drop(store);
        std::fs::remove_dir_all(dir).unwrap();
    }
}
