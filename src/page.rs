//! The page cache (spec.md §4.5): page lookup/lock/release, filling pages
//! from a filesystem's blocks, writing pages back, and driving whole-file
//! reads through the cache.
//!
//! Grounded end to end on `original_source/mm/page.c`.

use crate::collab::{BmapMode, DeviceRegistry, FrameAllocator, Filesystem, InodeId, Scheduler, WaitChannel};
use crate::config::{CacheConfig, PAGE_HASH_BUCKETS, PAGE_SIZE, RECLAIM_TARGET};
use crate::error::{CacheError, DeviceId, Result};
use crate::hash::{HashIndex, HashLinked};
use crate::irq::critical_section;
use crate::list::{IntrusiveList, Linked, Links};
use crate::{buffer, log_error, log_warn};
use alloc::vec::Vec;
use bitflags::bitflags;
use lazy_static::lazy_static;
use spin::Mutex;

bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct PageFlags: u8 {
        const LOCKED = 0b01;
        /// Carved out at init time (kernel image, out-of-map regions) and
        /// never offered to the free list or hash index.
        const RESERVED = 0b10;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PageKey {
    inode: InodeId,
    dev: DeviceId,
    offset: u64,
}

impl PageKey {
    /// `(inode, offset)`, the original's `PAGE_HASH` macro doesn't fold
    /// `dev` into the bucket either; `search_page_hash`'s exact-match
    /// comparison still checks it.
    fn hash_keys(self) -> (u64, u64) {
        (self.inode.0, self.offset)
    }
}

struct PageEntry {
    key: Option<PageKey>,
    count: usize,
    flags: PageFlags,
    data: Vec<u8>,
    free_links: Links,
    hash_links: Links,
}

impl PageEntry {
    fn reserved() -> Self {
        Self {
            key: None,
            count: 0,
            flags: PageFlags::RESERVED,
            data: Vec::new(),
            free_links: Links::default(),
            hash_links: Links::default(),
        }
    }

    fn free(size: usize) -> Self {
        Self {
            key: None,
            count: 0,
            flags: PageFlags::empty(),
            data: alloc::vec![0u8; size],
            free_links: Links::default(),
            hash_links: Links::default(),
        }
    }
}

impl Linked for PageEntry {
    fn links(&self) -> Links {
        self.free_links
    }
    fn set_links(&mut self, links: Links) {
        self.free_links = links;
    }
}

impl HashLinked for PageEntry {
    fn hash_links(&self) -> Links {
        self.hash_links
    }
    fn set_hash_links(&mut self, links: Links) {
        self.hash_links = links;
    }
}

struct PageCacheState {
    table: Vec<PageEntry>,
    hash: HashIndex<PAGE_HASH_BUCKETS>,
    free: IntrusiveList,
    free_count: usize,
    reserved_count: usize,
    cached_count: usize,
}

lazy_static! {
    static ref CACHE: Mutex<Option<PageCacheState>> = Mutex::new(None);
}

fn with_cache<R>(f: impl FnOnce(&mut PageCacheState) -> R) -> R {
    let mut guard = CACHE.lock();
    let cache = guard.as_mut().expect("page cache not initialized");
    f(cache)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PageStats {
    pub cached_kib: usize,
    pub free_kib: usize,
}

/// A page entry with its refcount held (spec.md §4.5 "Ownership"). Does not
/// imply the page is locked; call [`page_lock`] before touching `data` if
/// another task might concurrently fault it in.
#[derive(Debug, Clone, Copy)]
pub struct PageHandle {
    index: usize,
}

impl PageHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        with_cache(|cache| f(&cache.table[self.index].data))
    }

    pub fn with_data_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        with_cache(|cache| f(&mut cache.table[self.index].data))
    }
}

fn insert_free_locked(cache: &mut PageCacheState, idx: usize) {
    cache.free.append(&mut cache.table, idx);
    if cache.table[idx].key.is_none() {
        cache.free.jump_to_head(idx);
    }
    cache.free_count += 1;
}

fn remove_free_locked(cache: &mut PageCacheState, idx: usize) {
    cache.free.remove(&mut cache.table, idx);
    cache.free_count -= 1;
}

/// Pop a page off the free list, waking the swap daemon and retrying once
/// if the list is momentarily empty, then reporting out-of-memory (spec.md
/// §4.5 `get_free_page`).
pub fn get_free_page(scheduler: &dyn Scheduler) -> Result<PageHandle> {
    let mut woke_daemon = false;
    loop {
        let popped = critical_section(|| {
            with_cache(|cache| {
                cache.free.pop_head(&mut cache.table).map(|idx| {
                    cache.free_count -= 1;
                    idx
                })
            })
        });
        if let Some(idx) = popped {
            critical_section(|| {
                with_cache(|cache| {
                    if let Some(old) = cache.table[idx].key {
                        let (k1, k2) = old.hash_keys();
                        let bucket = HashIndex::<PAGE_HASH_BUCKETS>::bucket_for(k1, k2);
                        cache.hash.remove(&mut cache.table, bucket, idx);
                        cache.cached_count -= 1;
                    }
                    let entry = &mut cache.table[idx];
                    entry.key = None;
                    entry.count = 1;
                })
            });
            return Ok(PageHandle { index: idx });
        }
        if woke_daemon {
            log_error!("page", "out of memory: no free pages");
            return Err(CacheError::NoMemory);
        }
        woke_daemon = true;
        scheduler.wake(WaitChannel::SWAP_DAEMON);
        scheduler.sleep(WaitChannel::ANY_FREE_PAGE);
    }
}

/// Exact-match lookup by `(inode, dev, offset)` (spec.md §4.5
/// `search_page_hash`). Found entries are pulled off the free list if they
/// were idle, then their refcount is bumped.
pub fn search_page_hash(inode: InodeId, dev: DeviceId, offset: u64) -> Option<PageHandle> {
    critical_section(|| {
        with_cache(|cache| {
            let key = PageKey { inode, dev, offset };
            let (k1, k2) = key.hash_keys();
            let bucket = HashIndex::<PAGE_HASH_BUCKETS>::bucket_for(k1, k2);
            let found = cache
                .hash
                .iter_bucket(&cache.table, bucket)
                .find(|&idx| cache.table[idx].key == Some(key));
            found.map(|idx| {
                if cache.table[idx].count == 0 {
                    remove_free_locked(cache, idx);
                }
                cache.table[idx].count += 1;
                PageHandle { index: idx }
            })
        })
    })
}

/// Drop one reference. At zero, the page rejoins the free list, at the
/// head if it never got bound to a file (spec.md §4.5 `release_page`).
/// Double release is a logic error in the caller; it's logged and ignored
/// rather than allowed to underflow.
pub fn release_page(handle: PageHandle, scheduler: &dyn Scheduler) {
    let free_count = critical_section(|| {
        with_cache(|cache| {
            let entry = &mut cache.table[handle.index];
            if entry.count == 0 {
                log_error!("page", "double release of page {}", handle.index);
                return cache.free_count;
            }
            entry.count -= 1;
            if entry.count == 0 {
                insert_free_locked(cache, handle.index);
            }
            cache.free_count
        })
    });
    if free_count > RECLAIM_TARGET {
        scheduler.wake(WaitChannel::ANY_FREE_PAGE);
    }
}

/// Acquire the page's own lock; each page is its own wait channel
/// (spec.md §4.1).
pub fn page_lock(handle: &PageHandle, scheduler: &dyn Scheduler) {
    let channel = WaitChannel::for_page(handle.index);
    crate::lock::retry_until_some(scheduler, channel, || {
        critical_section(|| {
            with_cache(|cache| {
                let entry = &mut cache.table[handle.index];
                if entry.flags.contains(PageFlags::LOCKED) {
                    None
                } else {
                    entry.flags.insert(PageFlags::LOCKED);
                    Some(())
                }
            })
        })
    });
}

pub fn page_unlock(handle: &PageHandle, scheduler: &dyn Scheduler) {
    critical_section(|| with_cache(|cache| cache.table[handle.index].flags.remove(PageFlags::LOCKED)));
    scheduler.wake(WaitChannel::for_page(handle.index));
}

fn bind_and_cache(handle: &PageHandle, key: PageKey) {
    critical_section(|| {
        with_cache(|cache| {
            cache.table[handle.index].key = Some(key);
            let (k1, k2) = key.hash_keys();
            let bucket = HashIndex::<PAGE_HASH_BUCKETS>::bucket_for(k1, k2);
            cache.hash.insert(&mut cache.table, bucket, handle.index);
            cache.cached_count += 1;
        })
    });
}

/// Fill one cache-sized page with `inode`'s blocks starting at
/// `file_offset`, reading through the buffer cache and zero-filling sparse
/// holes (spec.md §4.5 `bread_page`). Caches the result for future lookups
/// only when `cacheable`; the original restricts this to read-only or
/// shared mappings.
pub fn bread_page(
    inode: InodeId,
    file_offset: u64,
    fs: &dyn Filesystem,
    devices: &dyn DeviceRegistry,
    frames: &dyn FrameAllocator,
    scheduler: &dyn Scheduler,
    cacheable: bool,
) -> Result<PageHandle> {
    let dev = fs.device_of(inode);
    let block_size = fs.block_size(inode);
    let handle = get_free_page(scheduler)?;

    if let Err(err) = fill_page(&handle, inode, file_offset, block_size, dev, fs, devices, frames, scheduler) {
        release_page(handle, scheduler);
        return Err(err);
    }

    if cacheable {
        bind_and_cache(&handle, PageKey { inode, dev, offset: file_offset });
    }
    Ok(handle)
}

fn fill_page(
    handle: &PageHandle,
    inode: InodeId,
    file_offset: u64,
    block_size: usize,
    dev: DeviceId,
    fs: &dyn Filesystem,
    devices: &dyn DeviceRegistry,
    frames: &dyn FrameAllocator,
    scheduler: &dyn Scheduler,
) -> Result<()> {
    let mut done = 0usize;
    while done < PAGE_SIZE {
        let block_offset = file_offset + done as u64;
        let block_no = fs.bmap(inode, block_offset, BmapMode::ForReading)?;
        if block_no == 0 {
            handle.with_data_mut(|data| {
                data[done..done + block_size].fill(0);
            });
        } else {
            let buf_handle = buffer::bread(devices, dev, block_no, block_size, frames, scheduler)?;
            buf_handle.with_data(|src| {
                handle.with_data_mut(|data| data[done..done + block_size].copy_from_slice(src));
            });
            buffer::brelse(buf_handle, scheduler);
        }
        done += block_size;
    }
    Ok(())
}

/// Write a page's contents back through the filesystem, clamped to the
/// file's current size (spec.md §4.5 `write_page`).
pub fn write_page(handle: &PageHandle, inode: InodeId, file_offset: u64, fs: &dyn Filesystem) -> Result<usize> {
    let size = fs.size(inode);
    if file_offset >= size {
        return Ok(0);
    }
    let writable = core::cmp::min(PAGE_SIZE as u64, size - file_offset) as usize;
    handle.with_data(|data| fs.write(inode, file_offset, &data[..writable]))
}

/// Patch `data` into the cached page covering `file_offset`, if one is
/// resident (spec.md §4.5 `update_page_cache`). Returns whether a cached
/// page was found and updated.
pub fn update_page_cache(inode: InodeId, dev: DeviceId, file_offset: u64, data: &[u8], scheduler: &dyn Scheduler) -> bool {
    let page_offset = file_offset & !((PAGE_SIZE as u64) - 1);
    match search_page_hash(inode, dev, page_offset) {
        None => false,
        Some(handle) => {
            page_lock(&handle, scheduler);
            let within = (file_offset - page_offset) as usize;
            handle.with_data_mut(|page_data| {
                let end = core::cmp::min(page_data.len(), within + data.len());
                page_data[within..end].copy_from_slice(&data[..end - within]);
            });
            page_unlock(&handle, scheduler);
            release_page(handle, scheduler);
            true
        }
    }
}

/// Copy up to `buf.len()` bytes from `inode` at `offset` through the page
/// cache, a page at a time: look the covering page up or fault it in, lock
/// it for the copy, unlock, and release (spec.md §4.5 `file_read`).
pub fn file_read(
    inode: InodeId,
    offset: u64,
    buf: &mut [u8],
    fs: &dyn Filesystem,
    devices: &dyn DeviceRegistry,
    frames: &dyn FrameAllocator,
    scheduler: &dyn Scheduler,
) -> Result<usize> {
    let dev = fs.device_of(inode);
    let size = fs.size(inode);
    if offset >= size {
        return Ok(0);
    }
    let count = core::cmp::min(buf.len() as u64, size - offset) as usize;

    let mut copied = 0usize;
    while copied < count {
        let cursor = offset + copied as u64;
        let page_offset = cursor & !((PAGE_SIZE as u64) - 1);
        let within = (cursor - page_offset) as usize;
        let chunk = core::cmp::min(PAGE_SIZE - within, count - copied);

        let handle = match search_page_hash(inode, dev, page_offset) {
            Some(handle) => handle,
            None => bread_page(inode, page_offset, fs, devices, frames, scheduler, true)?,
        };

        page_lock(&handle, scheduler);
        handle.with_data(|data| {
            buf[copied..copied + chunk].copy_from_slice(&data[within..within + chunk]);
        });
        page_unlock(&handle, scheduler);
        release_page(handle, scheduler);

        copied += chunk;
    }
    Ok(copied)
}

pub fn stats() -> PageStats {
    with_cache(|cache| PageStats {
        cached_kib: cache.cached_count * (PAGE_SIZE / 1024),
        free_kib: cache.free_count * (PAGE_SIZE / 1024),
    })
}

/// Build the page table, carving out `reserved_pages` entries (kernel
/// image, out-of-map regions) that never reach the free list (spec.md
/// §4.6; `original_source/mm/page.c` `page_init()`).
pub(crate) fn init_tables(config: &CacheConfig, reserved_pages: usize) {
    let reserved_pages = reserved_pages.min(config.page_table_size);
    let mut table = Vec::with_capacity(config.page_table_size);
    for _ in 0..reserved_pages {
        table.push(PageEntry::reserved());
    }
    for _ in reserved_pages..config.page_table_size {
        table.push(PageEntry::free(PAGE_SIZE));
    }

    let mut free = IntrusiveList::new();
    let mut free_count = 0;
    for idx in reserved_pages..table.len() {
        free.append(&mut table, idx);
        free_count += 1;
    }

    if reserved_pages > 0 {
        log_warn!("page", "{} pages reserved at init", reserved_pages);
    }

    *CACHE.lock() = Some(PageCacheState {
        table,
        hash: HashIndex::new(),
        free,
        free_count,
        reserved_count: reserved_pages,
        cached_count: 0,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::BlockDevice;
    use crate::config::CacheConfig;
    use crate::test_support::{MockBlockDevice, MockDeviceRegistry, MockFilesystem, MockFrameAllocator, MockScheduler};

    fn reset() -> spin::MutexGuard<'static, ()> {
        let guard = crate::test_support::test_guard();
        init_tables(
            &CacheConfig {
                buffer_table_size: 8,
                page_table_size: 4,
                reclaim_target: 2,
            },
            0,
        );
        crate::buffer::init_tables(&CacheConfig {
            buffer_table_size: 8,
            page_table_size: 4,
            reclaim_target: 2,
        });
        guard
    }

    #[test]
    fn reserved_pages_never_enter_free_list() {
        let _guard = crate::test_support::test_guard();
        init_tables(
            &CacheConfig {
                buffer_table_size: 8,
                page_table_size: 4,
                reclaim_target: 2,
            },
            2,
        );
        let stats = stats();
        assert_eq!(stats.free_kib, 2 * (PAGE_SIZE / 1024));
    }

    #[test]
    fn lookup_miss_then_hit_reuses_the_same_page() {
        let _guard = reset();
        let dev = DeviceId::new(8, 0);
        let device = MockBlockDevice::new(dev);
        let registry = MockDeviceRegistry::new(alloc::vec![&device as &dyn BlockDevice]);
        let fs = MockFilesystem::new(InodeId(1), dev, 4096, 8192);
        let scheduler = MockScheduler;
        let frames = MockFrameAllocator;

        assert!(search_page_hash(InodeId(1), dev, 0).is_none());
        let handle = bread_page(InodeId(1), 0, &fs, &registry, &frames, &scheduler, true).unwrap();
        release_page(handle, &scheduler);

        let found = search_page_hash(InodeId(1), dev, 0);
        assert!(found.is_some());
        release_page(found.unwrap(), &scheduler);
    }

    #[test]
    fn file_read_copies_requested_bytes_across_a_page_boundary() {
        let _guard = reset();
        let dev = DeviceId::new(8, 0);
        let device = MockBlockDevice::new(dev);
        device.seed(1, &alloc::vec![7u8; 512]);
        let registry = MockDeviceRegistry::new(alloc::vec![&device as &dyn BlockDevice]);
        let fs = MockFilesystem::new(InodeId(1), dev, 512, 4096 + 128);
        let scheduler = MockScheduler;
        let frames = MockFrameAllocator;

        let mut buf = [0u8; 16];
        let n = file_read(InodeId(1), 0, &mut buf, &fs, &registry, &frames, &scheduler).unwrap();
        assert_eq!(n, 16);
        assert_eq!(&buf[..], &[7u8; 16]);
    }

    #[test]
    fn update_page_cache_is_a_noop_when_nothing_is_resident() {
        let _guard = reset();
        let dev = DeviceId::new(8, 0);
        let scheduler = MockScheduler;
        assert!(!update_page_cache(InodeId(9), dev, 0, &[1, 2, 3], &scheduler));
    }

    /// spec.md §8 law "write-through coherency" / end-to-end scenario 5: a
    /// buffered write patched into an already-cached page is visible to the
    /// next `file_read` of that region without any intervening device read.
    #[test]
    fn update_page_cache_is_visible_to_the_next_file_read_without_a_device_read() {
        let _guard = reset();
        let dev = DeviceId::new(8, 0);
        let device = MockBlockDevice::new(dev);
        device.seed(1, &alloc::vec![7u8; 512]);
        let registry = MockDeviceRegistry::new(alloc::vec![&device as &dyn BlockDevice]);
        let fs = MockFilesystem::new(InodeId(1), dev, 512, 512);
        let scheduler = MockScheduler;
        let frames = MockFrameAllocator;

        let mut buf = [0u8; 16];
        file_read(InodeId(1), 0, &mut buf, &fs, &registry, &frames, &scheduler).unwrap();
        assert_eq!(&buf[..], &[7u8; 16]);
        let reads_after_first = device.read_count();

        assert!(update_page_cache(InodeId(1), dev, 0, &[9u8; 16], &scheduler));

        let mut buf = [0u8; 16];
        file_read(InodeId(1), 0, &mut buf, &fs, &registry, &frames, &scheduler).unwrap();
        assert_eq!(&buf[..], &[9u8; 16]);
        assert_eq!(device.read_count(), reads_after_first);
    }
}
