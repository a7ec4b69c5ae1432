//! Engine Configuration
//!
//! A `CoreConfig` is built once at login and handed to each subsystem by
//! value. There is no global settings registry; changing a size at runtime
//! goes through the owning subsystem (`PageCache::resize_disk_cache`).

use std::path::PathBuf;

/// Size of one cache page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Engine configuration
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Directory holding the pagefile, the metadata store and staging files
    pub cache_dir: PathBuf,

    /// Memory tier size in bytes (rounded down to whole pages)
    pub memory_cache_size: usize,

    /// Disk tier target size in bytes
    pub disk_cache_size: u64,

    /// Free disk space to preserve on the cache volume
    pub min_free_space: u64,

    /// Seconds between background flush cycles
    pub flush_interval_secs: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("./cirrus-cache"),
            memory_cache_size: 32 * 1024 * 1024, // 32 MiB
            disk_cache_size: 1024 * 1024 * 1024, // 1 GiB
            min_free_space: 256 * 1024 * 1024,   // 256 MiB
            flush_interval_secs: 10,
        }
    }
}

impl CoreConfig {
    /// Create a configuration rooted at the given cache directory
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            ..Self::default()
        }
    }

    /// Set the memory tier size in bytes
    pub fn with_memory_cache(mut self, bytes: usize) -> Self {
        self.memory_cache_size = bytes;
        self
    }

    /// Set the disk tier target size in bytes
    pub fn with_disk_cache(mut self, bytes: u64) -> Self {
        self.disk_cache_size = bytes;
        self
    }

    /// Set the free-space reserve for the cache volume
    pub fn with_min_free_space(mut self, bytes: u64) -> Self {
        self.min_free_space = bytes;
        self
    }

    /// Number of pages in the memory tier
    pub fn cache_pages(&self) -> usize {
        self.memory_cache_size / PAGE_SIZE
    }

    /// Target number of slots in the disk tier
    pub fn disk_cache_pages(&self) -> u64 {
        self.disk_cache_size / PAGE_SIZE as u64
    }

    /// Path of the pagefile backing the disk tier
    pub fn pagefile_path(&self) -> PathBuf {
        self.cache_dir.join("readcache")
    }

    /// Path of the metadata store
    pub fn store_path(&self) -> PathBuf {
        self.cache_dir.join("meta")
    }

    /// Path of the staging data file for a given upload task
    pub fn staging_data_path(&self, task_id: u64) -> PathBuf {
        self.cache_dir.join(format!("{:x}d", task_id))
    }

    /// Path of the written-interval index file for a given upload task
    pub fn staging_index_path(&self, task_id: u64) -> PathBuf {
        self.cache_dir.join(format!("{:x}i", task_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_page_counts() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.cache_pages(), 32 * 1024 * 1024 / PAGE_SIZE);
        assert_eq!(cfg.disk_cache_pages(), 1024 * 1024 * 1024 / PAGE_SIZE as u64);
    }

    #[test]
    fn test_builder() {
        let cfg = CoreConfig::new("/tmp/x")
            .with_memory_cache(8 * 1024 * 1024)
            .with_disk_cache(64 * 1024 * 1024);
        assert_eq!(cfg.cache_pages(), 2048);
        assert_eq!(cfg.pagefile_path(), PathBuf::from("/tmp/x/readcache"));
    }
}
