//! Cache subsystem bring-up (spec.md §4.6): build both entry tables and
//! thread every entry onto its cache's free list before any other
//! operation in this crate may run.
//!
//! Grounded on `original_source/mm/page.c` `page_init()` for the
//! reserved-frame carve-out; the buffer side has no equivalent concept in
//! the original (`buffer_init()` just zeroes the table).

use crate::buffer;
use crate::config::CacheConfig;
use crate::page;

/// Build the buffer cache's entry table at the sizes given by `config`,
/// with every entry starting out empty and free.
pub fn buffer_init(config: &CacheConfig) {
    buffer::init_tables(config);
}

/// Build the page cache's entry table, reserving `reserved_pages` entries
/// up front (kernel image, out-of-map regions) so they're never handed out
/// by [`crate::page::get_free_page`] or bound into the hash index.
pub fn page_init(config: &CacheConfig, reserved_pages: usize) {
    page::init_tables(config, reserved_pages);
}

/// Bring up both caches with a single `CacheConfig`, the common case for a
/// kernel with no pages to carve out at boot.
pub fn init(config: &CacheConfig) {
    buffer_init(config);
    page_init(config, 0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_brings_up_both_caches() {
        let _guard = crate::test_support::test_guard();
        let config = CacheConfig {
            buffer_table_size: 4,
            page_table_size: 4,
            reclaim_target: 1,
        };
        init(&config);
        assert_eq!(buffer::stats().buffers_kib, 0);
        assert_eq!(page::stats().free_kib, 4 * (crate::config::PAGE_SIZE / 1024));
    }
}
