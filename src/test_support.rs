//! Shared `#[cfg(test)]` collaborator mocks, used by `buffer.rs` and
//! `page.rs`'s unit tests and available to integration tests under
//! `tests/`.

use crate::collab::{
    BlockDevice, BmapMode, DeviceRegistry, Filesystem, FrameAllocator, FrameHandle, InodeId, Scheduler, WaitChannel,
};
use crate::error::{CacheError, DeviceId, Result};
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use spin::Mutex;

/// Serializes tests that touch the buffer/page caches' global singleton
/// state. `cargo test` runs tests on multiple threads by default, and
/// those singletons are shared process-wide, so two tests resetting them
/// concurrently would race. Every such test takes this guard first.
static TEST_LOCK: Mutex<()> = Mutex::new(());

pub fn test_guard() -> spin::MutexGuard<'static, ()> {
    TEST_LOCK.lock()
}

/// A scheduler with no real task to block; `sleep` returns immediately.
/// Fine for single-threaded tests where every wait condition is already
/// satisfied by the time it's checked.
pub struct MockScheduler;

impl Scheduler for MockScheduler {
    fn sleep(&self, _channel: WaitChannel) {}
    fn wake(&self, _channel: WaitChannel) {}
}

/// A scheduler that counts wakeups per channel, for asserting a cache
/// operation signalled the channel it documents signalling (e.g. reclaim
/// waking `ANY_FREE_BUFFER`).
#[derive(Default)]
pub struct CountingScheduler {
    wakes: Mutex<Vec<WaitChannel>>,
}

impl CountingScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wake_count(&self, channel: WaitChannel) -> usize {
        self.wakes.lock().iter().filter(|c| **c == channel).count()
    }
}

impl Scheduler for CountingScheduler {
    fn sleep(&self, _channel: WaitChannel) {}
    fn wake(&self, channel: WaitChannel) {
        self.wakes.lock().push(channel);
    }
}

pub struct MockFrameAllocator;

impl FrameAllocator for MockFrameAllocator {
    fn alloc_frame(&self) -> core::result::Result<FrameHandle, CacheError> {
        Ok(FrameHandle(0))
    }
    fn free_frame(&self, _frame: FrameHandle) {}
}

/// Always reports out of memory, to exercise failure paths.
pub struct FailingFrameAllocator;

impl FrameAllocator for FailingFrameAllocator {
    fn alloc_frame(&self) -> core::result::Result<FrameHandle, CacheError> {
        Err(CacheError::NoMemory)
    }
    fn free_frame(&self, _frame: FrameHandle) {}
}

/// An in-memory block device backed by a sparse map of block number to
/// bytes, with call counters for asserting on I/O traffic.
pub struct MockBlockDevice {
    id: DeviceId,
    read_only: bool,
    blocks: Mutex<BTreeMap<u64, Vec<u8>>>,
    reads: Mutex<usize>,
    writes: Mutex<usize>,
}

impl MockBlockDevice {
    pub fn new(id: DeviceId) -> Self {
        Self {
            id,
            read_only: false,
            blocks: Mutex::new(BTreeMap::new()),
            reads: Mutex::new(0),
            writes: Mutex::new(0),
        }
    }

    pub fn read_only(id: DeviceId) -> Self {
        Self {
            read_only: true,
            ..Self::new(id)
        }
    }

    pub fn seed(&self, block: u64, data: &[u8]) {
        self.blocks.lock().insert(block, data.to_vec());
    }

    pub fn read_count(&self) -> usize {
        *self.reads.lock()
    }

    pub fn write_count(&self) -> usize {
        *self.writes.lock()
    }
}

impl BlockDevice for MockBlockDevice {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<usize> {
        *self.reads.lock() += 1;
        match self.blocks.lock().get(&block) {
            Some(data) => {
                let n = core::cmp::min(buf.len(), data.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            None => {
                buf.fill(0);
                Ok(buf.len())
            }
        }
    }

    fn write_block(&self, block: u64, buf: &[u8]) -> Result<usize> {
        if self.read_only {
            return Err(CacheError::ReadOnly);
        }
        *self.writes.lock() += 1;
        self.blocks.lock().insert(block, buf.to_vec());
        Ok(buf.len())
    }
}

/// A registry over a fixed set of devices, looked up by id.
pub struct MockDeviceRegistry<'a> {
    devices: Vec<&'a dyn BlockDevice>,
}

impl<'a> MockDeviceRegistry<'a> {
    pub fn new(devices: Vec<&'a dyn BlockDevice>) -> Self {
        Self { devices }
    }
}

impl<'a> DeviceRegistry for MockDeviceRegistry<'a> {
    fn device(&self, id: DeviceId) -> Option<&dyn BlockDevice> {
        self.devices.iter().find(|d| d.id() == id).copied()
    }
}

/// A single-file filesystem stand-in: file offset `n` maps to device block
/// `n / block_size + 1`, for tests that don't care about real block
/// allocation. Block `0` is never handed out, since that's the sparse-hole
/// sentinel `fill_page` checks for.
pub struct MockFilesystem {
    inode: InodeId,
    dev: DeviceId,
    block_size: usize,
    size: u64,
}

impl MockFilesystem {
    pub fn new(inode: InodeId, dev: DeviceId, block_size: usize, size: u64) -> Self {
        Self {
            inode,
            dev,
            block_size,
            size,
        }
    }
}

impl Filesystem for MockFilesystem {
    fn bmap(&self, inode: InodeId, offset: u64, _mode: BmapMode) -> Result<u64> {
        debug_assert_eq!(inode, self.inode);
        Ok(offset / self.block_size as u64 + 1)
    }

    fn device_of(&self, inode: InodeId) -> DeviceId {
        debug_assert_eq!(inode, self.inode);
        self.dev
    }

    fn block_size(&self, inode: InodeId) -> usize {
        debug_assert_eq!(inode, self.inode);
        self.block_size
    }

    fn size(&self, inode: InodeId) -> u64 {
        debug_assert_eq!(inode, self.inode);
        self.size
    }

    fn write(&self, inode: InodeId, _offset: u64, buf: &[u8]) -> Result<usize> {
        debug_assert_eq!(inode, self.inode);
        Ok(buf.len())
    }
}
