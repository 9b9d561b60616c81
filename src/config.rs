//! Tunable constants (spec.md §6).
//!
//! The buffer/page table sizes are chosen at `init` time from available
//! memory (spec.md §4.6) rather than fixed at compile time, so they live on
//! [`CacheConfig`] instead of being `const`s; everything else here is a
//! fixed constant the way the kernel crate exposes tunables elsewhere.

/// Number of buckets in the buffer-cache hash index. Chosen so the
/// expected chain length stays small for the default table size.
pub const BUFFER_HASH_BUCKETS: usize = 509;

/// Number of buckets in the page-cache hash index.
pub const PAGE_HASH_BUCKETS: usize = 1021;

/// Fixed page size used throughout the page cache.
pub const PAGE_SIZE: usize = 4096;

/// Default number of frames `reclaim_buffers` targets freeing per call.
pub const RECLAIM_TARGET: usize = 32;

/// Runtime-chosen table sizes, published at init time.
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    /// Number of entries in the buffer table.
    pub buffer_table_size: usize,
    /// Number of entries in the page table.
    pub page_table_size: usize,
    /// Target number of frames to reclaim per `reclaim_buffers` call.
    pub reclaim_target: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            buffer_table_size: 256,
            page_table_size: 1024,
            reclaim_target: RECLAIM_TARGET,
        }
    }
}
